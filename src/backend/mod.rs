//! Defines the backend transaction interface --- [`Backend`], [`ReadTx`],
//! [`WriteTx`] --- and its three implementations.
//!
//! The backend exposes read-only and read-write transactions over a
//! consistent snapshot. Within a transaction, reads observe the
//! transaction's own prior writes; commit is atomic. Dropping a write
//! transaction without committing discards every staged write.
//!
//! Operations that are identical across backends (idempotent root
//! creation, saturating refcounts, server epoch, block upload marking)
//! are provided methods composed from the primitives, so the three
//! implementations cannot drift apart.

mod kv;
mod memory;
mod sql;

pub use kv::KvBackend;
pub use memory::MemoryBackend;
pub use sql::SqlBackend;

use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::debug;

use crate::config::CoreConfig;
use crate::entity::{
    BlockRecord, ChunkRecord, ClientId, ContentHash, FileEntry, FileHandle, FileId, FileTime,
    FileType, LockId, LockQuery, LockRecord, NsmRegistration, ObjectRecord, Share, ShareOptions,
};
use crate::error::{Error, Result};
use crate::stats::{Capabilities, FsStatistics};

/// Read-only operations available inside any transaction.
#[async_trait]
pub trait ReadTx: Send {
    // --- File entries ---

    /// Fetches a file entry. [`Error::NotFound`] when absent.
    async fn get_file(&mut self, id: FileId) -> Result<FileEntry>;

    /// Finds the file currently carrying a payload identifier. When
    /// several files share one identifier, the first match wins.
    async fn find_file_by_payload_id(&mut self, payload_id: &str) -> Result<FileEntry>;

    // --- Directory child map ---

    /// Resolves a name within a directory to the child identifier.
    async fn get_child(&mut self, dir: FileId, name: &str) -> Result<FileId>;

    /// Lists children in byte-ordered name sequence. The cursor is the
    /// last name of the previous page; the next page begins strictly
    /// after it, so enumeration is stable under concurrent inserts.
    async fn list_children(
        &mut self,
        dir: FileId,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, FileId)>>;

    // --- Parent backpointer / link counts ---

    async fn get_parent(&mut self, id: FileId) -> Result<FileId>;

    async fn get_link_count(&mut self, id: FileId) -> Result<u32>;

    // --- Shares ---

    async fn get_share(&mut self, name: &str) -> Result<Share>;

    async fn list_shares(&mut self) -> Result<Vec<Share>>;

    /// Identifier of a share's root directory entry.
    async fn get_root_id(&mut self, share: &str) -> Result<FileId> {
        Ok(self.get_share(share).await?.root)
    }

    // --- Filesystem metadata / server config ---

    async fn get_fs_meta(&mut self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn get_server_config(&mut self) -> Result<Option<CoreConfig>>;

    /// Current server epoch; zero before the first restart recovery.
    async fn server_epoch(&mut self) -> Result<u64> {
        match self.get_fs_meta(SERVER_EPOCH_KEY).await? {
            Some(bytes) => {
                let arr: [u8; 8] =
                    bytes.as_slice().try_into().map_err(|_| Error::io("malformed epoch"))?;
                Ok(u64::from_be_bytes(arr))
            }
            None => Ok(0),
        }
    }

    // --- Payload index ---

    async fn get_object(&mut self, hash: ContentHash) -> Result<ObjectRecord>;

    async fn get_chunk(&mut self, hash: ContentHash) -> Result<ChunkRecord>;

    /// Chunks of an object ordered by index.
    async fn get_chunks_by_object(&mut self, object: ContentHash) -> Result<Vec<ChunkRecord>>;

    async fn get_block(&mut self, hash: ContentHash) -> Result<BlockRecord>;

    /// Blocks of a chunk ordered by index.
    async fn get_blocks_by_chunk(&mut self, chunk: ContentHash) -> Result<Vec<BlockRecord>>;

    /// Deduplication probe. Absence is a value, never an error.
    async fn find_block_by_hash(&mut self, hash: ContentHash) -> Result<Option<BlockRecord>> {
        match self.get_block(hash).await {
            Ok(block) => Ok(Some(block)),
            Err(Error::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    // --- Lock records ---

    async fn get_lock(&mut self, id: LockId) -> Result<LockRecord>;

    async fn list_locks(&mut self, query: &LockQuery) -> Result<Vec<LockRecord>>;

    // --- Monitored-peer registry ---

    async fn list_client_registrations(&mut self) -> Result<Vec<NsmRegistration>>;

    // --- Statistics ---

    /// Scans the file table of a share and returns raw usage counters.
    /// Expensive; callers go through the TTL cache.
    async fn scan_statistics(&mut self, share: &str) -> Result<FsStatistics>;
}

/// Mutating operations. Nothing becomes visible until [`WriteTx::commit`].
#[async_trait]
pub trait WriteTx: ReadTx {
    // --- File entries ---

    async fn put_file(&mut self, entry: &FileEntry) -> Result<()>;

    /// Removes the file record along with its parent backpointer and
    /// link count row. Directory edges are the caller's to remove.
    async fn delete_file(&mut self, id: FileId) -> Result<()>;

    // --- Directory child map ---

    async fn set_child(&mut self, dir: FileId, name: &str, child: FileId) -> Result<()>;

    async fn delete_child(&mut self, dir: FileId, name: &str) -> Result<()>;

    // --- Parent backpointer / link counts ---

    async fn set_parent(&mut self, id: FileId, parent: FileId) -> Result<()>;

    async fn set_link_count(&mut self, id: FileId, count: u32) -> Result<()>;

    // --- Shares ---

    /// Fails with [`Error::AlreadyExists`] on duplicate names.
    async fn create_share(&mut self, share: &Share) -> Result<()>;

    async fn update_share_options(&mut self, name: &str, options: &ShareOptions) -> Result<()>;

    async fn delete_share(&mut self, name: &str) -> Result<()>;

    /// Idempotently creates a share's root directory entry. When the
    /// root already exists, attribute drift between the requested
    /// mode/uid/gid and the persisted values is reconciled in favour of
    /// the caller's current request.
    async fn create_root_directory(
        &mut self,
        share: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<FileEntry> {
        let root = self.get_root_id(share).await?;
        match self.get_file(root).await {
            Ok(mut entry) => {
                if entry.mode != mode || entry.uid != uid || entry.gid != gid {
                    entry.mode = mode;
                    entry.uid = uid;
                    entry.gid = gid;
                    entry.touch_changed();
                    self.put_file(&entry).await?;
                }
                Ok(entry)
            }
            Err(Error::NotFound) => {
                let mut entry = FileEntry::new(root, share, "/", FileType::Directory, mode);
                entry.uid = uid;
                entry.gid = gid;
                self.put_file(&entry).await?;
                self.set_link_count(root, entry.nlink).await?;
                Ok(entry)
            }
            Err(e) => Err(e),
        }
    }

    // --- Filesystem metadata / server config ---

    async fn put_fs_meta(&mut self, key: &str, value: &[u8]) -> Result<()>;

    async fn set_server_config(&mut self, config: &CoreConfig) -> Result<()>;

    /// Increments and persists the server epoch; returns the new value.
    async fn bump_server_epoch(&mut self) -> Result<u64> {
        let next = self.server_epoch().await? + 1;
        self.put_fs_meta(SERVER_EPOCH_KEY, &next.to_be_bytes()).await?;
        Ok(next)
    }

    // --- Payload index ---

    async fn put_object(&mut self, object: &ObjectRecord) -> Result<()>;

    async fn delete_object(&mut self, hash: ContentHash) -> Result<()>;

    async fn put_chunk(&mut self, chunk: &ChunkRecord) -> Result<()>;

    async fn delete_chunk(&mut self, hash: ContentHash) -> Result<()>;

    async fn put_block(&mut self, block: &BlockRecord) -> Result<()>;

    async fn delete_block(&mut self, hash: ContentHash) -> Result<()>;

    async fn increment_object_refcount(&mut self, hash: ContentHash) -> Result<u64> {
        let mut object = self.get_object(hash).await?;
        object.refcount += 1;
        self.put_object(&object).await?;
        Ok(object.refcount)
    }

    /// Saturates at zero.
    async fn decrement_object_refcount(&mut self, hash: ContentHash) -> Result<u64> {
        let mut object = self.get_object(hash).await?;
        object.refcount = object.refcount.saturating_sub(1);
        self.put_object(&object).await?;
        Ok(object.refcount)
    }

    async fn increment_chunk_refcount(&mut self, hash: ContentHash) -> Result<u64> {
        let mut chunk = self.get_chunk(hash).await?;
        chunk.refcount += 1;
        self.put_chunk(&chunk).await?;
        Ok(chunk.refcount)
    }

    /// Saturates at zero.
    async fn decrement_chunk_refcount(&mut self, hash: ContentHash) -> Result<u64> {
        let mut chunk = self.get_chunk(hash).await?;
        chunk.refcount = chunk.refcount.saturating_sub(1);
        self.put_chunk(&chunk).await?;
        Ok(chunk.refcount)
    }

    async fn increment_block_refcount(&mut self, hash: ContentHash) -> Result<u64> {
        let mut block = self.get_block(hash).await?;
        block.refcount += 1;
        self.put_block(&block).await?;
        Ok(block.refcount)
    }

    /// Saturates at zero.
    async fn decrement_block_refcount(&mut self, hash: ContentHash) -> Result<u64> {
        let mut block = self.get_block(hash).await?;
        block.refcount = block.refcount.saturating_sub(1);
        self.put_block(&block).await?;
        Ok(block.refcount)
    }

    /// Records the upload completion time; the block is durable from
    /// this point on.
    async fn mark_block_uploaded(&mut self, hash: ContentHash, when: FileTime) -> Result<()> {
        let mut block = self.get_block(hash).await?;
        block.uploaded_at = Some(when);
        self.put_block(&block).await
    }

    // --- Lock records ---

    async fn put_lock(&mut self, lock: &LockRecord) -> Result<()>;

    async fn delete_lock(&mut self, id: LockId) -> Result<()>;

    /// Removes every lock of a client; returns how many went away.
    async fn delete_locks_by_client(&mut self, client: &ClientId) -> Result<u64>;

    /// Removes every lock on a file; returns how many went away.
    async fn delete_locks_by_file(&mut self, file: FileId) -> Result<u64>;

    // --- Monitored-peer registry ---

    async fn put_client_registration(&mut self, registration: &NsmRegistration) -> Result<()>;

    async fn delete_client_registration(&mut self, client: &ClientId) -> Result<()>;

    /// Atomically publishes every staged write.
    async fn commit(self: Box<Self>) -> Result<()>;
}

/// A metadata storage backend. Implementations are dispatched once per
/// operation through this interface; the service never sees the engine
/// underneath.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn begin_read(&self) -> Result<Box<dyn ReadTx>>;

    async fn begin_write(&self) -> Result<Box<dyn WriteTx>>;

    /// Immutable feature flags initialised at construction.
    fn capabilities(&self) -> &Capabilities;

    /// Mints a fresh entry identifier and the opaque handle naming it
    /// within a share.
    fn generate_handle(&self, share: &str) -> Result<(FileId, FileHandle)> {
        let id = FileId::generate();
        Ok((id, FileHandle::encode(share, id)?))
    }
}

/// Runs a write-transaction closure with commit, transparently retrying
/// retryable conflicts up to `retry_max` times with escalating backoff.
///
/// The closure must be safe to re-run from scratch: it receives a fresh
/// transaction on every attempt and must not hold state across attempts.
pub async fn with_write<T, F>(
    backend: &dyn Backend,
    retry_max: u32,
    backoff_base: Duration,
    op: F,
) -> Result<T>
where
    T: Send,
    F: for<'a> Fn(&'a mut (dyn WriteTx + 'static)) -> BoxFuture<'a, Result<T>> + Send + Sync,
{
    let mut backoff = backoff_base;
    let mut attempt = 0u32;
    loop {
        let mut tx = backend.begin_write().await?;
        let outcome = match op(tx.as_mut()).await {
            Ok(value) => tx.commit().await.map(|()| value),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < retry_max => {
                attempt += 1;
                debug!(attempt, error = %e, "retrying write transaction");
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Key of the persisted server epoch in the filesystem-meta namespace
/// used by backends that store it as a plain key.
pub(crate) const SERVER_EPOCH_KEY: &str = "srvepoch";

/// Key of the persisted server configuration for backends that store it
/// as a plain key.
pub(crate) const SERVER_CONFIG_KEY: &str = "srvconfig";
