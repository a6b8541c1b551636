//! Relational backend over SQLite (`sqlx`).
//!
//! Entities live in a normalised schema; primary keys are the 16-byte
//! entry identifiers. Read methods bypass transactions for lower latency
//! and run pooled single-statement queries that release the connection
//! as soon as the row is scanned. Write transactions are real SQL
//! transactions on a pooled connection.
//!
//! The pool enforces a bounded connection-acquire timeout: no caller
//! blocks indefinitely on pool exhaustion, and that failure is surfaced
//! as a non-retryable i/o error (the pool already waited).

use std::path::Path;

use async_trait::async_trait;
use num_traits::FromPrimitive;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{
    Sqlite, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Executor, Row, Transaction};

use crate::backend::{Backend, ReadTx, WriteTx};
use crate::codec;
use crate::config::CoreConfig;
use crate::entity::{
    Acl, BlockRecord, ChunkRecord, ClientId, ContentHash, Device, FileEntry, FileId, FileTime,
    FileType, LockId, LockQuery, LockRecord, NsmRegistration, ObjectRecord, Share, ShareOptions,
};
use crate::error::{Error, Result};
use crate::stats::{Capabilities, FsStatistics};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS files (
        id BLOB PRIMARY KEY,
        share TEXT NOT NULL,
        path TEXT NOT NULL,
        file_type INTEGER NOT NULL,
        mode INTEGER NOT NULL,
        uid INTEGER NOT NULL,
        gid INTEGER NOT NULL,
        size INTEGER NOT NULL,
        nlink INTEGER NOT NULL,
        atime_s INTEGER NOT NULL, atime_ns INTEGER NOT NULL,
        mtime_s INTEGER NOT NULL, mtime_ns INTEGER NOT NULL,
        ctime_s INTEGER NOT NULL, ctime_ns INTEGER NOT NULL,
        birth_s INTEGER NOT NULL, birth_ns INTEGER NOT NULL,
        hidden INTEGER NOT NULL,
        payload_id TEXT NOT NULL DEFAULT '',
        payload_hash BLOB,
        symlink_target TEXT,
        dev_major INTEGER, dev_minor INTEGER,
        acl BLOB
    )",
    // Uniqueness holds only for reachable entries; unlinked-but-open
    // orphans keep their last path without colliding with a new entry.
    "CREATE UNIQUE INDEX IF NOT EXISTS files_share_path
        ON files(share, path) WHERE nlink > 0",
    // Payload lookup goes through a hashed column so arbitrarily long
    // identifiers stay out of the index.
    "CREATE INDEX IF NOT EXISTS files_payload_hash
        ON files(payload_hash) WHERE payload_hash IS NOT NULL",
    "CREATE TABLE IF NOT EXISTS parent_child_map (
        dir BLOB NOT NULL,
        name TEXT NOT NULL,
        child BLOB NOT NULL,
        PRIMARY KEY (dir, name)
    )",
    "CREATE TABLE IF NOT EXISTS file_parents (
        id BLOB PRIMARY KEY,
        parent BLOB NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS link_counts (
        id BLOB PRIMARY KEY,
        count INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS shares (
        name TEXT PRIMARY KEY,
        root BLOB NOT NULL,
        options BLOB NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS filesystem_meta (
        key TEXT PRIMARY KEY,
        value BLOB NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS server_config (
        id INTEGER PRIMARY KEY CHECK (id = 0),
        config BLOB NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS objects (
        hash BLOB PRIMARY KEY,
        size INTEGER NOT NULL,
        chunk_count INTEGER NOT NULL,
        refcount INTEGER NOT NULL,
        finalized INTEGER NOT NULL,
        created_s INTEGER NOT NULL, created_ns INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS object_chunks (
        hash BLOB PRIMARY KEY,
        object BLOB NOT NULL,
        idx INTEGER NOT NULL,
        size INTEGER NOT NULL,
        block_count INTEGER NOT NULL,
        refcount INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS object_chunks_object ON object_chunks(object)",
    "CREATE TABLE IF NOT EXISTS object_blocks (
        hash BLOB PRIMARY KEY,
        chunk BLOB NOT NULL,
        idx INTEGER NOT NULL,
        size INTEGER NOT NULL,
        refcount INTEGER NOT NULL,
        uploaded_s INTEGER, uploaded_ns INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS object_blocks_chunk ON object_blocks(chunk)",
    "CREATE TABLE IF NOT EXISTS locks (
        id BLOB PRIMARY KEY,
        file BLOB NOT NULL,
        owner TEXT NOT NULL,
        client TEXT NOT NULL,
        record BLOB NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS locks_file ON locks(file)",
    "CREATE INDEX IF NOT EXISTS locks_owner ON locks(owner)",
    "CREATE INDEX IF NOT EXISTS locks_client ON locks(client)",
    "CREATE TABLE IF NOT EXISTS server_epoch (
        id INTEGER PRIMARY KEY CHECK (id = 0),
        epoch INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS nsm_client_registrations (
        client TEXT PRIMARY KEY,
        monitored_host TEXT NOT NULL,
        callback_addr TEXT NOT NULL,
        private_data BLOB NOT NULL,
        epoch INTEGER NOT NULL
    )",
];

fn map_sql(e: sqlx::Error) -> Error {
    match &e {
        sqlx::Error::PoolTimedOut => {
            Error::io("connection pool exhausted: acquire timed out")
        }
        sqlx::Error::RowNotFound => Error::NotFound,
        sqlx::Error::Database(db) => {
            if db.is_unique_violation() {
                return Error::AlreadyExists;
            }
            let message = db.message().to_string();
            let retryable = message.contains("database is locked")
                || message.contains("database table is locked");
            Error::Io { message: format!("sql backend: {message}"), retryable }
        }
        _ => Error::io(format!("sql backend: {e}")),
    }
}

fn payload_hash(payload_id: &str) -> Option<Vec<u8>> {
    if payload_id.is_empty() {
        return None;
    }
    let mut hasher = Sha256::new();
    hasher.update(payload_id.as_bytes());
    Some(hasher.finalize().to_vec())
}

fn hash_from_row(row: &SqliteRow, column: &str) -> Result<ContentHash> {
    let bytes: Vec<u8> = row.try_get(column).map_err(map_sql)?;
    let arr: [u8; 32] =
        bytes.try_into().map_err(|_| Error::io("malformed content hash column"))?;
    Ok(ContentHash(arr))
}

fn file_id_from_row(row: &SqliteRow, column: &str) -> Result<FileId> {
    let bytes: Vec<u8> = row.try_get(column).map_err(map_sql)?;
    FileId::from_slice(&bytes).ok_or_else(|| Error::io("malformed identifier column"))
}

fn time_from_row(row: &SqliteRow, seconds: &str, nanos: &str) -> Result<FileTime> {
    Ok(FileTime {
        seconds: row.try_get::<i64, _>(seconds).map_err(map_sql)?,
        nanos: row.try_get::<i64, _>(nanos).map_err(map_sql)? as u32,
    })
}

fn entry_from_row(row: &SqliteRow) -> Result<FileEntry> {
    let file_type_tag: i64 = row.try_get("file_type").map_err(map_sql)?;
    let file_type = FileType::from_i64(file_type_tag)
        .ok_or_else(|| Error::io(format!("unknown file type tag {file_type_tag}")))?;
    let device = match (
        row.try_get::<Option<i64>, _>("dev_major").map_err(map_sql)?,
        row.try_get::<Option<i64>, _>("dev_minor").map_err(map_sql)?,
    ) {
        (Some(major), Some(minor)) => Some(Device { major: major as u32, minor: minor as u32 }),
        _ => None,
    };
    let acl = match row.try_get::<Option<Vec<u8>>, _>("acl").map_err(map_sql)? {
        Some(bytes) => Some(codec::decode::<Acl>(&bytes)?),
        None => None,
    };
    Ok(FileEntry {
        id: file_id_from_row(row, "id")?,
        share: row.try_get("share").map_err(map_sql)?,
        path: row.try_get("path").map_err(map_sql)?,
        file_type,
        mode: row.try_get::<i64, _>("mode").map_err(map_sql)? as u32,
        uid: row.try_get::<i64, _>("uid").map_err(map_sql)? as u32,
        gid: row.try_get::<i64, _>("gid").map_err(map_sql)? as u32,
        size: row.try_get::<i64, _>("size").map_err(map_sql)? as u64,
        nlink: row.try_get::<i64, _>("nlink").map_err(map_sql)? as u32,
        atime: time_from_row(row, "atime_s", "atime_ns")?,
        mtime: time_from_row(row, "mtime_s", "mtime_ns")?,
        ctime: time_from_row(row, "ctime_s", "ctime_ns")?,
        birthtime: time_from_row(row, "birth_s", "birth_ns")?,
        hidden: row.try_get::<i64, _>("hidden").map_err(map_sql)? != 0,
        payload_id: row.try_get("payload_id").map_err(map_sql)?,
        symlink_target: row.try_get("symlink_target").map_err(map_sql)?,
        device,
        acl,
    })
}

fn object_from_row(row: &SqliteRow) -> Result<ObjectRecord> {
    Ok(ObjectRecord {
        hash: hash_from_row(row, "hash")?,
        size: row.try_get::<i64, _>("size").map_err(map_sql)? as u64,
        chunk_count: row.try_get::<i64, _>("chunk_count").map_err(map_sql)? as u32,
        refcount: row.try_get::<i64, _>("refcount").map_err(map_sql)? as u64,
        finalized: row.try_get::<i64, _>("finalized").map_err(map_sql)? != 0,
        created_at: time_from_row(row, "created_s", "created_ns")?,
    })
}

fn chunk_from_row(row: &SqliteRow) -> Result<ChunkRecord> {
    Ok(ChunkRecord {
        hash: hash_from_row(row, "hash")?,
        object: hash_from_row(row, "object")?,
        index: row.try_get::<i64, _>("idx").map_err(map_sql)? as u32,
        size: row.try_get::<i64, _>("size").map_err(map_sql)? as u64,
        block_count: row.try_get::<i64, _>("block_count").map_err(map_sql)? as u32,
        refcount: row.try_get::<i64, _>("refcount").map_err(map_sql)? as u64,
    })
}

fn block_from_row(row: &SqliteRow) -> Result<BlockRecord> {
    let uploaded_at = match (
        row.try_get::<Option<i64>, _>("uploaded_s").map_err(map_sql)?,
        row.try_get::<Option<i64>, _>("uploaded_ns").map_err(map_sql)?,
    ) {
        (Some(seconds), Some(nanos)) => Some(FileTime { seconds, nanos: nanos as u32 }),
        _ => None,
    };
    Ok(BlockRecord {
        hash: hash_from_row(row, "hash")?,
        chunk: hash_from_row(row, "chunk")?,
        index: row.try_get::<i64, _>("idx").map_err(map_sql)? as u32,
        size: row.try_get::<i64, _>("size").map_err(map_sql)? as u32,
        refcount: row.try_get::<i64, _>("refcount").map_err(map_sql)? as u64,
        uploaded_at,
    })
}

fn share_from_row(row: &SqliteRow) -> Result<Share> {
    let options: Vec<u8> = row.try_get("options").map_err(map_sql)?;
    Ok(Share {
        name: row.try_get("name").map_err(map_sql)?,
        options: codec::decode::<ShareOptions>(&options)?,
        root: file_id_from_row(row, "root")?,
    })
}

fn registration_from_row(row: &SqliteRow) -> Result<NsmRegistration> {
    Ok(NsmRegistration {
        client: ClientId(row.try_get("client").map_err(map_sql)?),
        monitored_host: row.try_get("monitored_host").map_err(map_sql)?,
        callback_addr: row.try_get("callback_addr").map_err(map_sql)?,
        private_data: row.try_get("private_data").map_err(map_sql)?,
        epoch: row.try_get::<i64, _>("epoch").map_err(map_sql)? as u64,
    })
}

// --- Shared query bodies, generic over the executor so the write
// --- transaction sees its own uncommitted rows.

async fn fetch_file<'c, E>(exec: E, id: FileId) -> Result<FileEntry>
where
    E: Executor<'c, Database = Sqlite>,
{
    let row = sqlx::query("SELECT * FROM files WHERE id = ?")
        .bind(id.as_bytes().to_vec())
        .fetch_optional(exec)
        .await
        .map_err(map_sql)?;
    match row {
        Some(row) => entry_from_row(&row),
        None => Err(Error::NotFound),
    }
}

async fn fetch_file_by_payload<'c, E>(exec: E, payload_id: &str) -> Result<FileEntry>
where
    E: Executor<'c, Database = Sqlite>,
{
    let hash = payload_hash(payload_id).ok_or(Error::NotFound)?;
    let row = sqlx::query(
        "SELECT * FROM files WHERE payload_hash = ? AND payload_id = ? ORDER BY rowid LIMIT 1",
    )
    .bind(hash)
    .bind(payload_id.to_owned())
    .fetch_optional(exec)
    .await
    .map_err(map_sql)?;
    match row {
        Some(row) => entry_from_row(&row),
        None => Err(Error::NotFound),
    }
}

async fn fetch_child<'c, E>(exec: E, dir: FileId, name: &str) -> Result<FileId>
where
    E: Executor<'c, Database = Sqlite>,
{
    let row = sqlx::query("SELECT child FROM parent_child_map WHERE dir = ? AND name = ?")
        .bind(dir.as_bytes().to_vec())
        .bind(name.to_owned())
        .fetch_optional(exec)
        .await
        .map_err(map_sql)?;
    match row {
        Some(row) => file_id_from_row(&row, "child"),
        None => Err(Error::NotFound),
    }
}

async fn fetch_children<'c, E>(
    exec: E,
    dir: FileId,
    cursor: Option<&str>,
    limit: usize,
) -> Result<Vec<(String, FileId)>>
where
    E: Executor<'c, Database = Sqlite>,
{
    let rows = sqlx::query(
        "SELECT name, child FROM parent_child_map
         WHERE dir = ? AND (? IS NULL OR name > ?)
         ORDER BY name LIMIT ?",
    )
    .bind(dir.as_bytes().to_vec())
    .bind(cursor.map(str::to_owned))
    .bind(cursor.map(str::to_owned))
    .bind(limit as i64)
    .fetch_all(exec)
    .await
    .map_err(map_sql)?;
    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let name: String = row.try_get("name").map_err(map_sql)?;
        entries.push((name, file_id_from_row(&row, "child")?));
    }
    Ok(entries)
}

async fn fetch_lock<'c, E>(exec: E, id: LockId) -> Result<LockRecord>
where
    E: Executor<'c, Database = Sqlite>,
{
    let row = sqlx::query("SELECT record FROM locks WHERE id = ?")
        .bind(id.as_bytes().to_vec())
        .fetch_optional(exec)
        .await
        .map_err(map_sql)?;
    match row {
        Some(row) => {
            let bytes: Vec<u8> = row.try_get("record").map_err(map_sql)?;
            codec::decode(&bytes)
        }
        None => Err(Error::NotFound),
    }
}

async fn fetch_locks<'c, E>(exec: E, query: &LockQuery) -> Result<Vec<LockRecord>>
where
    E: Executor<'c, Database = Sqlite>,
{
    let rows = sqlx::query(
        "SELECT record FROM locks
         WHERE (? IS NULL OR file = ?)
           AND (? IS NULL OR owner = ?)
           AND (? IS NULL OR client = ?)",
    )
    .bind(query.file.map(|f| f.as_bytes().to_vec()))
    .bind(query.file.map(|f| f.as_bytes().to_vec()))
    .bind(query.owner.as_ref().map(|o| o.0.clone()))
    .bind(query.owner.as_ref().map(|o| o.0.clone()))
    .bind(query.client.as_ref().map(|c| c.0.clone()))
    .bind(query.client.as_ref().map(|c| c.0.clone()))
    .fetch_all(exec)
    .await
    .map_err(map_sql)?;
    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let bytes: Vec<u8> = row.try_get("record").map_err(map_sql)?;
        records.push(codec::decode::<LockRecord>(&bytes)?);
    }
    Ok(records)
}

/// Relational backend handle.
pub struct SqlBackend {
    pool: SqlitePool,
    capabilities: Capabilities,
}

impl SqlBackend {
    /// Opens (or creates) the database at `path` and applies the schema.
    pub async fn open(path: impl AsRef<Path>, config: &CoreConfig) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.connection_pool_acquire_timeout())
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.connection_pool_max)
            .min_connections(config.connection_pool_min)
            .acquire_timeout(config.connection_pool_acquire_timeout())
            .connect_with(options)
            .await
            .map_err(map_sql)?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await.map_err(map_sql)?;
        }
        Ok(Self { pool, capabilities: Capabilities::from_config(config) })
    }
}

#[async_trait]
impl Backend for SqlBackend {
    async fn begin_read(&self) -> Result<Box<dyn ReadTx>> {
        Ok(Box::new(SqlReadTx { pool: self.pool.clone() }))
    }

    async fn begin_write(&self) -> Result<Box<dyn WriteTx>> {
        let tx = self.pool.begin().await.map_err(map_sql)?;
        Ok(Box::new(SqlWriteTx { tx }))
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }
}

struct SqlReadTx {
    pool: SqlitePool,
}

struct SqlWriteTx {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl ReadTx for SqlReadTx {
    async fn get_file(&mut self, id: FileId) -> Result<FileEntry> {
        fetch_file(&self.pool, id).await
    }

    async fn find_file_by_payload_id(&mut self, payload_id: &str) -> Result<FileEntry> {
        fetch_file_by_payload(&self.pool, payload_id).await
    }

    async fn get_child(&mut self, dir: FileId, name: &str) -> Result<FileId> {
        fetch_child(&self.pool, dir, name).await
    }

    async fn list_children(
        &mut self,
        dir: FileId,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, FileId)>> {
        fetch_children(&self.pool, dir, cursor, limit).await
    }

    async fn get_parent(&mut self, id: FileId) -> Result<FileId> {
        let row = sqlx::query("SELECT parent FROM file_parents WHERE id = ?")
            .bind(id.as_bytes().to_vec())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sql)?;
        match row {
            Some(row) => file_id_from_row(&row, "parent"),
            None => Err(Error::NotFound),
        }
    }

    async fn get_link_count(&mut self, id: FileId) -> Result<u32> {
        let row = sqlx::query("SELECT count FROM link_counts WHERE id = ?")
            .bind(id.as_bytes().to_vec())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sql)?;
        match row {
            Some(row) => Ok(row.try_get::<i64, _>("count").map_err(map_sql)? as u32),
            None => Err(Error::NotFound),
        }
    }

    async fn get_share(&mut self, name: &str) -> Result<Share> {
        let row = sqlx::query("SELECT * FROM shares WHERE name = ?")
            .bind(name.to_owned())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sql)?;
        match row {
            Some(row) => share_from_row(&row),
            None => Err(Error::NotFound),
        }
    }

    async fn list_shares(&mut self) -> Result<Vec<Share>> {
        let rows = sqlx::query("SELECT * FROM shares ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sql)?;
        rows.iter().map(share_from_row).collect()
    }

    async fn get_fs_meta(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT value FROM filesystem_meta WHERE key = ?")
            .bind(key.to_owned())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sql)?;
        row.map(|row| row.try_get::<Vec<u8>, _>("value").map_err(map_sql)).transpose()
    }

    async fn get_server_config(&mut self) -> Result<Option<CoreConfig>> {
        let row = sqlx::query("SELECT config FROM server_config WHERE id = 0")
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sql)?;
        match row {
            Some(row) => {
                let bytes: Vec<u8> = row.try_get("config").map_err(map_sql)?;
                Ok(Some(codec::decode(&bytes)?))
            }
            None => Ok(None),
        }
    }

    async fn server_epoch(&mut self) -> Result<u64> {
        let row = sqlx::query("SELECT epoch FROM server_epoch WHERE id = 0")
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sql)?;
        match row {
            Some(row) => Ok(row.try_get::<i64, _>("epoch").map_err(map_sql)? as u64),
            None => Ok(0),
        }
    }

    async fn get_object(&mut self, hash: ContentHash) -> Result<ObjectRecord> {
        let row = sqlx::query("SELECT * FROM objects WHERE hash = ?")
            .bind(hash.0.to_vec())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sql)?;
        match row {
            Some(row) => object_from_row(&row),
            None => Err(Error::NotFound),
        }
    }

    async fn get_chunk(&mut self, hash: ContentHash) -> Result<ChunkRecord> {
        let row = sqlx::query("SELECT * FROM object_chunks WHERE hash = ?")
            .bind(hash.0.to_vec())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sql)?;
        match row {
            Some(row) => chunk_from_row(&row),
            None => Err(Error::NotFound),
        }
    }

    async fn get_chunks_by_object(&mut self, object: ContentHash) -> Result<Vec<ChunkRecord>> {
        let rows = sqlx::query("SELECT * FROM object_chunks WHERE object = ? ORDER BY idx")
            .bind(object.0.to_vec())
            .fetch_all(&self.pool)
            .await
            .map_err(map_sql)?;
        rows.iter().map(chunk_from_row).collect()
    }

    async fn get_block(&mut self, hash: ContentHash) -> Result<BlockRecord> {
        let row = sqlx::query("SELECT * FROM object_blocks WHERE hash = ?")
            .bind(hash.0.to_vec())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sql)?;
        match row {
            Some(row) => block_from_row(&row),
            None => Err(Error::NotFound),
        }
    }

    async fn get_blocks_by_chunk(&mut self, chunk: ContentHash) -> Result<Vec<BlockRecord>> {
        let rows = sqlx::query("SELECT * FROM object_blocks WHERE chunk = ? ORDER BY idx")
            .bind(chunk.0.to_vec())
            .fetch_all(&self.pool)
            .await
            .map_err(map_sql)?;
        rows.iter().map(block_from_row).collect()
    }

    async fn get_lock(&mut self, id: LockId) -> Result<LockRecord> {
        fetch_lock(&self.pool, id).await
    }

    async fn list_locks(&mut self, query: &LockQuery) -> Result<Vec<LockRecord>> {
        fetch_locks(&self.pool, query).await
    }

    async fn list_client_registrations(&mut self) -> Result<Vec<NsmRegistration>> {
        let rows = sqlx::query("SELECT * FROM nsm_client_registrations ORDER BY client")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sql)?;
        rows.iter().map(registration_from_row).collect()
    }

    async fn scan_statistics(&mut self, share: &str) -> Result<FsStatistics> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS inodes, COALESCE(SUM(size), 0) AS bytes
             FROM files WHERE share = ?",
        )
        .bind(share.to_owned())
        .fetch_one(&self.pool)
        .await
        .map_err(map_sql)?;
        Ok(FsStatistics::from_usage(
            row.try_get::<i64, _>("bytes").map_err(map_sql)? as u64,
            row.try_get::<i64, _>("inodes").map_err(map_sql)? as u64,
        ))
    }
}

#[async_trait]
impl ReadTx for SqlWriteTx {
    async fn get_file(&mut self, id: FileId) -> Result<FileEntry> {
        fetch_file(&mut *self.tx, id).await
    }

    async fn find_file_by_payload_id(&mut self, payload_id: &str) -> Result<FileEntry> {
        fetch_file_by_payload(&mut *self.tx, payload_id).await
    }

    async fn get_child(&mut self, dir: FileId, name: &str) -> Result<FileId> {
        fetch_child(&mut *self.tx, dir, name).await
    }

    async fn list_children(
        &mut self,
        dir: FileId,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, FileId)>> {
        fetch_children(&mut *self.tx, dir, cursor, limit).await
    }

    async fn get_parent(&mut self, id: FileId) -> Result<FileId> {
        let row = sqlx::query("SELECT parent FROM file_parents WHERE id = ?")
            .bind(id.as_bytes().to_vec())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sql)?;
        match row {
            Some(row) => file_id_from_row(&row, "parent"),
            None => Err(Error::NotFound),
        }
    }

    async fn get_link_count(&mut self, id: FileId) -> Result<u32> {
        let row = sqlx::query("SELECT count FROM link_counts WHERE id = ?")
            .bind(id.as_bytes().to_vec())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sql)?;
        match row {
            Some(row) => Ok(row.try_get::<i64, _>("count").map_err(map_sql)? as u32),
            None => Err(Error::NotFound),
        }
    }

    async fn get_share(&mut self, name: &str) -> Result<Share> {
        let row = sqlx::query("SELECT * FROM shares WHERE name = ?")
            .bind(name.to_owned())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sql)?;
        match row {
            Some(row) => share_from_row(&row),
            None => Err(Error::NotFound),
        }
    }

    async fn list_shares(&mut self) -> Result<Vec<Share>> {
        let rows = sqlx::query("SELECT * FROM shares ORDER BY name")
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sql)?;
        rows.iter().map(share_from_row).collect()
    }

    async fn get_fs_meta(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT value FROM filesystem_meta WHERE key = ?")
            .bind(key.to_owned())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sql)?;
        row.map(|row| row.try_get::<Vec<u8>, _>("value").map_err(map_sql)).transpose()
    }

    async fn get_server_config(&mut self) -> Result<Option<CoreConfig>> {
        let row = sqlx::query("SELECT config FROM server_config WHERE id = 0")
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sql)?;
        match row {
            Some(row) => {
                let bytes: Vec<u8> = row.try_get("config").map_err(map_sql)?;
                Ok(Some(codec::decode(&bytes)?))
            }
            None => Ok(None),
        }
    }

    async fn server_epoch(&mut self) -> Result<u64> {
        let row = sqlx::query("SELECT epoch FROM server_epoch WHERE id = 0")
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sql)?;
        match row {
            Some(row) => Ok(row.try_get::<i64, _>("epoch").map_err(map_sql)? as u64),
            None => Ok(0),
        }
    }

    async fn get_object(&mut self, hash: ContentHash) -> Result<ObjectRecord> {
        let row = sqlx::query("SELECT * FROM objects WHERE hash = ?")
            .bind(hash.0.to_vec())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sql)?;
        match row {
            Some(row) => object_from_row(&row),
            None => Err(Error::NotFound),
        }
    }

    async fn get_chunk(&mut self, hash: ContentHash) -> Result<ChunkRecord> {
        let row = sqlx::query("SELECT * FROM object_chunks WHERE hash = ?")
            .bind(hash.0.to_vec())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sql)?;
        match row {
            Some(row) => chunk_from_row(&row),
            None => Err(Error::NotFound),
        }
    }

    async fn get_chunks_by_object(&mut self, object: ContentHash) -> Result<Vec<ChunkRecord>> {
        let rows = sqlx::query("SELECT * FROM object_chunks WHERE object = ? ORDER BY idx")
            .bind(object.0.to_vec())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sql)?;
        rows.iter().map(chunk_from_row).collect()
    }

    async fn get_block(&mut self, hash: ContentHash) -> Result<BlockRecord> {
        let row = sqlx::query("SELECT * FROM object_blocks WHERE hash = ?")
            .bind(hash.0.to_vec())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sql)?;
        match row {
            Some(row) => block_from_row(&row),
            None => Err(Error::NotFound),
        }
    }

    async fn get_blocks_by_chunk(&mut self, chunk: ContentHash) -> Result<Vec<BlockRecord>> {
        let rows = sqlx::query("SELECT * FROM object_blocks WHERE chunk = ? ORDER BY idx")
            .bind(chunk.0.to_vec())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sql)?;
        rows.iter().map(block_from_row).collect()
    }

    async fn get_lock(&mut self, id: LockId) -> Result<LockRecord> {
        fetch_lock(&mut *self.tx, id).await
    }

    async fn list_locks(&mut self, query: &LockQuery) -> Result<Vec<LockRecord>> {
        fetch_locks(&mut *self.tx, query).await
    }

    async fn list_client_registrations(&mut self) -> Result<Vec<NsmRegistration>> {
        let rows = sqlx::query("SELECT * FROM nsm_client_registrations ORDER BY client")
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sql)?;
        rows.iter().map(registration_from_row).collect()
    }

    async fn scan_statistics(&mut self, share: &str) -> Result<FsStatistics> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS inodes, COALESCE(SUM(size), 0) AS bytes
             FROM files WHERE share = ?",
        )
        .bind(share.to_owned())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_sql)?;
        Ok(FsStatistics::from_usage(
            row.try_get::<i64, _>("bytes").map_err(map_sql)? as u64,
            row.try_get::<i64, _>("inodes").map_err(map_sql)? as u64,
        ))
    }
}

#[async_trait]
impl WriteTx for SqlWriteTx {
    async fn put_file(&mut self, entry: &FileEntry) -> Result<()> {
        let acl = match &entry.acl {
            Some(acl) => Some(codec::encode(acl)?),
            None => None,
        };
        sqlx::query(
            "INSERT OR REPLACE INTO files (
                id, share, path, file_type, mode, uid, gid, size, nlink,
                atime_s, atime_ns, mtime_s, mtime_ns, ctime_s, ctime_ns,
                birth_s, birth_ns, hidden, payload_id, payload_hash,
                symlink_target, dev_major, dev_minor, acl
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.id.as_bytes().to_vec())
        .bind(entry.share.clone())
        .bind(entry.path.clone())
        .bind(entry.file_type as i64)
        .bind(entry.mode as i64)
        .bind(entry.uid as i64)
        .bind(entry.gid as i64)
        .bind(entry.size as i64)
        .bind(entry.nlink as i64)
        .bind(entry.atime.seconds)
        .bind(entry.atime.nanos as i64)
        .bind(entry.mtime.seconds)
        .bind(entry.mtime.nanos as i64)
        .bind(entry.ctime.seconds)
        .bind(entry.ctime.nanos as i64)
        .bind(entry.birthtime.seconds)
        .bind(entry.birthtime.nanos as i64)
        .bind(entry.hidden as i64)
        .bind(entry.payload_id.clone())
        .bind(payload_hash(&entry.payload_id))
        .bind(entry.symlink_target.clone())
        .bind(entry.device.map(|d| d.major as i64))
        .bind(entry.device.map(|d| d.minor as i64))
        .bind(acl)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sql)?;
        Ok(())
    }

    async fn delete_file(&mut self, id: FileId) -> Result<()> {
        let id_bytes = id.as_bytes().to_vec();
        let done = sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(id_bytes.clone())
            .execute(&mut *self.tx)
            .await
            .map_err(map_sql)?;
        if done.rows_affected() == 0 {
            return Err(Error::NotFound);
        }
        sqlx::query("DELETE FROM file_parents WHERE id = ?")
            .bind(id_bytes.clone())
            .execute(&mut *self.tx)
            .await
            .map_err(map_sql)?;
        sqlx::query("DELETE FROM link_counts WHERE id = ?")
            .bind(id_bytes.clone())
            .execute(&mut *self.tx)
            .await
            .map_err(map_sql)?;
        sqlx::query("DELETE FROM parent_child_map WHERE dir = ?")
            .bind(id_bytes)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sql)?;
        Ok(())
    }

    async fn set_child(&mut self, dir: FileId, name: &str, child: FileId) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO parent_child_map (dir, name, child) VALUES (?, ?, ?)")
            .bind(dir.as_bytes().to_vec())
            .bind(name.to_owned())
            .bind(child.as_bytes().to_vec())
            .execute(&mut *self.tx)
            .await
            .map_err(map_sql)?;
        Ok(())
    }

    async fn delete_child(&mut self, dir: FileId, name: &str) -> Result<()> {
        let done = sqlx::query("DELETE FROM parent_child_map WHERE dir = ? AND name = ?")
            .bind(dir.as_bytes().to_vec())
            .bind(name.to_owned())
            .execute(&mut *self.tx)
            .await
            .map_err(map_sql)?;
        if done.rows_affected() == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    async fn set_parent(&mut self, id: FileId, parent: FileId) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO file_parents (id, parent) VALUES (?, ?)")
            .bind(id.as_bytes().to_vec())
            .bind(parent.as_bytes().to_vec())
            .execute(&mut *self.tx)
            .await
            .map_err(map_sql)?;
        Ok(())
    }

    async fn set_link_count(&mut self, id: FileId, count: u32) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO link_counts (id, count) VALUES (?, ?)")
            .bind(id.as_bytes().to_vec())
            .bind(count as i64)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sql)?;
        Ok(())
    }

    async fn create_share(&mut self, share: &Share) -> Result<()> {
        let options = codec::encode(&share.options)?;
        let outcome = sqlx::query("INSERT INTO shares (name, root, options) VALUES (?, ?, ?)")
            .bind(share.name.clone())
            .bind(share.root.as_bytes().to_vec())
            .bind(options)
            .execute(&mut *self.tx)
            .await;
        match outcome {
            Ok(_) => Ok(()),
            Err(e) => Err(map_sql(e)),
        }
    }

    async fn update_share_options(&mut self, name: &str, options: &ShareOptions) -> Result<()> {
        let bytes = codec::encode(options)?;
        let done = sqlx::query("UPDATE shares SET options = ? WHERE name = ?")
            .bind(bytes)
            .bind(name.to_owned())
            .execute(&mut *self.tx)
            .await
            .map_err(map_sql)?;
        if done.rows_affected() == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    async fn delete_share(&mut self, name: &str) -> Result<()> {
        let done = sqlx::query("DELETE FROM shares WHERE name = ?")
            .bind(name.to_owned())
            .execute(&mut *self.tx)
            .await
            .map_err(map_sql)?;
        if done.rows_affected() == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    async fn put_fs_meta(&mut self, key: &str, value: &[u8]) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO filesystem_meta (key, value) VALUES (?, ?)")
            .bind(key.to_owned())
            .bind(value.to_vec())
            .execute(&mut *self.tx)
            .await
            .map_err(map_sql)?;
        Ok(())
    }

    async fn set_server_config(&mut self, config: &CoreConfig) -> Result<()> {
        let bytes = codec::encode(config)?;
        sqlx::query("INSERT OR REPLACE INTO server_config (id, config) VALUES (0, ?)")
            .bind(bytes)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sql)?;
        Ok(())
    }

    async fn bump_server_epoch(&mut self) -> Result<u64> {
        let row = sqlx::query(
            "INSERT INTO server_epoch (id, epoch) VALUES (0, 1)
             ON CONFLICT (id) DO UPDATE SET epoch = epoch + 1
             RETURNING epoch",
        )
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_sql)?;
        Ok(row.try_get::<i64, _>("epoch").map_err(map_sql)? as u64)
    }

    async fn put_object(&mut self, object: &ObjectRecord) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO objects
                (hash, size, chunk_count, refcount, finalized, created_s, created_ns)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(object.hash.0.to_vec())
        .bind(object.size as i64)
        .bind(object.chunk_count as i64)
        .bind(object.refcount as i64)
        .bind(object.finalized as i64)
        .bind(object.created_at.seconds)
        .bind(object.created_at.nanos as i64)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sql)?;
        Ok(())
    }

    async fn delete_object(&mut self, hash: ContentHash) -> Result<()> {
        let done = sqlx::query("DELETE FROM objects WHERE hash = ?")
            .bind(hash.0.to_vec())
            .execute(&mut *self.tx)
            .await
            .map_err(map_sql)?;
        if done.rows_affected() == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    async fn put_chunk(&mut self, chunk: &ChunkRecord) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO object_chunks
                (hash, object, idx, size, block_count, refcount)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(chunk.hash.0.to_vec())
        .bind(chunk.object.0.to_vec())
        .bind(chunk.index as i64)
        .bind(chunk.size as i64)
        .bind(chunk.block_count as i64)
        .bind(chunk.refcount as i64)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sql)?;
        Ok(())
    }

    async fn delete_chunk(&mut self, hash: ContentHash) -> Result<()> {
        let done = sqlx::query("DELETE FROM object_chunks WHERE hash = ?")
            .bind(hash.0.to_vec())
            .execute(&mut *self.tx)
            .await
            .map_err(map_sql)?;
        if done.rows_affected() == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    async fn put_block(&mut self, block: &BlockRecord) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO object_blocks
                (hash, chunk, idx, size, refcount, uploaded_s, uploaded_ns)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(block.hash.0.to_vec())
        .bind(block.chunk.0.to_vec())
        .bind(block.index as i64)
        .bind(block.size as i64)
        .bind(block.refcount as i64)
        .bind(block.uploaded_at.map(|t| t.seconds))
        .bind(block.uploaded_at.map(|t| t.nanos as i64))
        .execute(&mut *self.tx)
        .await
        .map_err(map_sql)?;
        Ok(())
    }

    async fn delete_block(&mut self, hash: ContentHash) -> Result<()> {
        let done = sqlx::query("DELETE FROM object_blocks WHERE hash = ?")
            .bind(hash.0.to_vec())
            .execute(&mut *self.tx)
            .await
            .map_err(map_sql)?;
        if done.rows_affected() == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    async fn put_lock(&mut self, lock: &LockRecord) -> Result<()> {
        let record = codec::encode(lock)?;
        sqlx::query(
            "INSERT OR REPLACE INTO locks (id, file, owner, client, record)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(lock.id.as_bytes().to_vec())
        .bind(lock.file.as_bytes().to_vec())
        .bind(lock.owner.0.clone())
        .bind(lock.client.0.clone())
        .bind(record)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sql)?;
        Ok(())
    }

    async fn delete_lock(&mut self, id: LockId) -> Result<()> {
        let done = sqlx::query("DELETE FROM locks WHERE id = ?")
            .bind(id.as_bytes().to_vec())
            .execute(&mut *self.tx)
            .await
            .map_err(map_sql)?;
        if done.rows_affected() == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    async fn delete_locks_by_client(&mut self, client: &ClientId) -> Result<u64> {
        let done = sqlx::query("DELETE FROM locks WHERE client = ?")
            .bind(client.0.clone())
            .execute(&mut *self.tx)
            .await
            .map_err(map_sql)?;
        Ok(done.rows_affected())
    }

    async fn delete_locks_by_file(&mut self, file: FileId) -> Result<u64> {
        let done = sqlx::query("DELETE FROM locks WHERE file = ?")
            .bind(file.as_bytes().to_vec())
            .execute(&mut *self.tx)
            .await
            .map_err(map_sql)?;
        Ok(done.rows_affected())
    }

    async fn put_client_registration(&mut self, registration: &NsmRegistration) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO nsm_client_registrations
                (client, monitored_host, callback_addr, private_data, epoch)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(registration.client.0.clone())
        .bind(registration.monitored_host.clone())
        .bind(registration.callback_addr.clone())
        .bind(registration.private_data.clone())
        .bind(registration.epoch as i64)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sql)?;
        Ok(())
    }

    async fn delete_client_registration(&mut self, client: &ClientId) -> Result<()> {
        let done = sqlx::query("DELETE FROM nsm_client_registrations WHERE client = ?")
            .bind(client.0.clone())
            .execute(&mut *self.tx)
            .await
            .map_err(map_sql)?;
        if done.rows_affected() == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        this.tx.commit().await.map_err(map_sql)
    }
}
