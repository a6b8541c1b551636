//! Embedded persistent key-value backend over an LSM tree (`sled`).
//!
//! Every logical entity is keyed by a byte-stable prefixed key; values
//! are versioned records produced by the entity codec. Write
//! transactions stage their writes in an overlay merged over the tree
//! for read-your-writes, serialize against each other through a writer
//! mutex, and publish atomically as one batch on commit.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::backend::{Backend, ReadTx, WriteTx, SERVER_CONFIG_KEY, SERVER_EPOCH_KEY};
use crate::codec;
use crate::config::CoreConfig;
use crate::entity::{
    BlockRecord, ChunkRecord, ClientId, ContentHash, FileEntry, FileId, LockId, LockQuery,
    LockRecord, NsmRegistration, ObjectRecord, Share, ShareOptions,
};
use crate::error::{Error, Result};
use crate::stats::{Capabilities, FsStatistics};

mod keys {
    use super::*;

    pub const FILE: &[u8] = b"file:";
    pub const CHILD: &[u8] = b"child:";
    pub const PARENT: &[u8] = b"parent:";
    pub const LINK_COUNT: &[u8] = b"linkcount:";
    pub const SHARE: &[u8] = b"share:";
    pub const FS_META: &[u8] = b"fsmeta:";
    pub const LOCK: &[u8] = b"lock:";
    pub const LOCK_BY_FILE: &[u8] = b"lkfile:";
    pub const LOCK_BY_OWNER: &[u8] = b"lkowner:";
    pub const LOCK_BY_CLIENT: &[u8] = b"lkclient:";
    pub const OBJECT: &[u8] = b"obj:";
    pub const CHUNK: &[u8] = b"chunk:";
    pub const BLOCK: &[u8] = b"block:";
    pub const OBJECT_CHUNKS: &[u8] = b"obj-chunks:";
    pub const CHUNK_BLOCKS: &[u8] = b"chunk-blocks:";
    pub const FILE_BY_PAYLOAD: &[u8] = b"fpayload:";
    pub const NSM: &[u8] = b"nsm:";

    pub fn concat(parts: &[&[u8]]) -> Vec<u8> {
        let mut key = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
        for part in parts {
            key.extend_from_slice(part);
        }
        key
    }

    pub fn file(id: FileId) -> Vec<u8> {
        concat(&[FILE, id.as_bytes()])
    }

    pub fn child(dir: FileId, name: &str) -> Vec<u8> {
        concat(&[CHILD, dir.as_bytes(), name.as_bytes()])
    }

    pub fn child_prefix(dir: FileId) -> Vec<u8> {
        concat(&[CHILD, dir.as_bytes()])
    }

    pub fn parent(id: FileId) -> Vec<u8> {
        concat(&[PARENT, id.as_bytes()])
    }

    pub fn link_count(id: FileId) -> Vec<u8> {
        concat(&[LINK_COUNT, id.as_bytes()])
    }

    pub fn share(name: &str) -> Vec<u8> {
        concat(&[SHARE, name.as_bytes()])
    }

    pub fn fs_meta(key: &str) -> Vec<u8> {
        concat(&[FS_META, key.as_bytes()])
    }

    pub fn lock(id: LockId) -> Vec<u8> {
        concat(&[LOCK, id.as_bytes()])
    }

    pub fn lock_by_file(file: FileId, id: LockId) -> Vec<u8> {
        concat(&[LOCK_BY_FILE, file.as_bytes(), id.as_bytes()])
    }

    pub fn lock_by_file_prefix(file: FileId) -> Vec<u8> {
        concat(&[LOCK_BY_FILE, file.as_bytes()])
    }

    pub fn lock_by_owner(owner: &str, id: LockId) -> Vec<u8> {
        concat(&[LOCK_BY_OWNER, owner.as_bytes(), b"\0", id.as_bytes()])
    }

    pub fn lock_by_owner_prefix(owner: &str) -> Vec<u8> {
        concat(&[LOCK_BY_OWNER, owner.as_bytes(), b"\0"])
    }

    pub fn lock_by_client(client: &str, id: LockId) -> Vec<u8> {
        concat(&[LOCK_BY_CLIENT, client.as_bytes(), b"\0", id.as_bytes()])
    }

    pub fn lock_by_client_prefix(client: &str) -> Vec<u8> {
        concat(&[LOCK_BY_CLIENT, client.as_bytes(), b"\0"])
    }

    pub fn object(hash: ContentHash) -> Vec<u8> {
        concat(&[OBJECT, &hash.0])
    }

    pub fn chunk(hash: ContentHash) -> Vec<u8> {
        concat(&[CHUNK, &hash.0])
    }

    pub fn block(hash: ContentHash) -> Vec<u8> {
        concat(&[BLOCK, &hash.0])
    }

    pub fn object_chunk(object: ContentHash, chunk: ContentHash) -> Vec<u8> {
        concat(&[OBJECT_CHUNKS, &object.0, &chunk.0])
    }

    pub fn object_chunks_prefix(object: ContentHash) -> Vec<u8> {
        concat(&[OBJECT_CHUNKS, &object.0])
    }

    pub fn chunk_block(chunk: ContentHash, block: ContentHash) -> Vec<u8> {
        concat(&[CHUNK_BLOCKS, &chunk.0, &block.0])
    }

    pub fn chunk_blocks_prefix(chunk: ContentHash) -> Vec<u8> {
        concat(&[CHUNK_BLOCKS, &chunk.0])
    }

    pub fn file_by_payload(payload_id: &str, id: FileId) -> Vec<u8> {
        concat(&[FILE_BY_PAYLOAD, payload_id.as_bytes(), b"\0", id.as_bytes()])
    }

    pub fn file_by_payload_prefix(payload_id: &str) -> Vec<u8> {
        concat(&[FILE_BY_PAYLOAD, payload_id.as_bytes(), b"\0"])
    }

    pub fn nsm(client: &str) -> Vec<u8> {
        concat(&[NSM, client.as_bytes()])
    }

    /// Trailing identifier of an index key.
    pub fn id_suffix(key: &[u8]) -> Option<FileId> {
        if key.len() < 16 {
            return None;
        }
        FileId::from_slice(&key[key.len() - 16..])
    }

    pub fn lock_id_suffix(key: &[u8]) -> Option<LockId> {
        if key.len() < 16 {
            return None;
        }
        LockId::from_slice(&key[key.len() - 16..])
    }

    pub fn hash_suffix(key: &[u8]) -> Option<ContentHash> {
        if key.len() < 32 {
            return None;
        }
        let arr: [u8; 32] = key[key.len() - 32..].try_into().ok()?;
        Some(ContentHash(arr))
    }
}

fn map_sled(e: sled::Error) -> Error {
    Error::io(format!("kv backend: {e}"))
}

fn reject_nul(label: &str, value: &str) -> Result<()> {
    if value.contains('\0') {
        return Err(Error::InvalidArgument(format!("{label} must not contain NUL")));
    }
    Ok(())
}

/// Persistent single-node backend over an embedded LSM tree.
pub struct KvBackend {
    _db: sled::Db,
    tree: sled::Tree,
    writer: Arc<Mutex<()>>,
    capabilities: Capabilities,
}

impl KvBackend {
    /// Opens (or creates) the store rooted at `path`.
    pub fn open(path: impl AsRef<Path>, config: &CoreConfig) -> Result<Self> {
        let db = sled::open(path).map_err(map_sled)?;
        let tree = db.open_tree("dittofs").map_err(map_sled)?;
        Ok(Self {
            _db: db,
            tree,
            writer: Arc::new(Mutex::new(())),
            capabilities: Capabilities::from_config(config),
        })
    }
}

#[async_trait]
impl Backend for KvBackend {
    async fn begin_read(&self) -> Result<Box<dyn ReadTx>> {
        Ok(Box::new(KvReadTx { tree: self.tree.clone() }))
    }

    async fn begin_write(&self) -> Result<Box<dyn WriteTx>> {
        let guard = Arc::clone(&self.writer).lock_owned().await;
        Ok(Box::new(KvWriteTx {
            tree: self.tree.clone(),
            _guard: guard,
            staged: BTreeMap::new(),
        }))
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }
}

/// Point-read and prefix-scan view shared by both transaction kinds.
trait View {
    fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Key-ordered scan of every live pair under a prefix.
    fn scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

struct KvReadTx {
    tree: sled::Tree,
}

impl View for KvReadTx {
    fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.tree.get(key).map_err(map_sled)?.map(|v| v.to_vec()))
    }

    fn scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut pairs = Vec::new();
        for item in self.tree.scan_prefix(prefix) {
            let (key, value) = item.map_err(map_sled)?;
            pairs.push((key.to_vec(), value.to_vec()));
        }
        Ok(pairs)
    }
}

struct KvWriteTx {
    tree: sled::Tree,
    _guard: OwnedMutexGuard<()>,
    /// Overlay of staged writes; `None` marks a staged deletion.
    staged: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl KvWriteTx {
    fn stage_put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.staged.insert(key, Some(value));
    }

    fn stage_delete(&mut self, key: Vec<u8>) {
        self.staged.insert(key, None);
    }

    /// Stages a deletion after confirming the key is live; callers turn
    /// `false` into [`Error::NotFound`].
    fn stage_delete_existing(&mut self, key: Vec<u8>) -> Result<bool> {
        if self.read(&key)?.is_none() {
            return Ok(false);
        }
        self.stage_delete(key);
        Ok(true)
    }
}

impl View for KvWriteTx {
    fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(staged) = self.staged.get(key) {
            return Ok(staged.clone());
        }
        Ok(self.tree.get(key).map_err(map_sled)?.map(|v| v.to_vec()))
    }

    fn scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        for item in self.tree.scan_prefix(prefix) {
            let (key, value) = item.map_err(map_sled)?;
            merged.insert(key.to_vec(), value.to_vec());
        }
        for (key, staged) in &self.staged {
            if key.starts_with(prefix) {
                match staged {
                    Some(value) => {
                        merged.insert(key.clone(), value.clone());
                    }
                    None => {
                        merged.remove(key);
                    }
                }
            }
        }
        Ok(merged.into_iter().collect())
    }
}

fn view_get_file(view: &impl View, id: FileId) -> Result<FileEntry> {
    match view.read(&keys::file(id))? {
        Some(bytes) => codec::decode(&bytes),
        None => Err(Error::NotFound),
    }
}

fn view_find_file_by_payload_id(view: &impl View, payload_id: &str) -> Result<FileEntry> {
    let pairs = view.scan(&keys::file_by_payload_prefix(payload_id))?;
    let (key, _) = pairs.first().ok_or(Error::NotFound)?;
    let id = keys::id_suffix(key).ok_or_else(|| Error::io("malformed payload index key"))?;
    view_get_file(view, id)
}

fn view_get_child(view: &impl View, dir: FileId, name: &str) -> Result<FileId> {
    match view.read(&keys::child(dir, name))? {
        Some(bytes) => FileId::from_slice(&bytes).ok_or_else(|| Error::io("malformed child edge")),
        None => Err(Error::NotFound),
    }
}

fn view_list_children(
    view: &impl View,
    dir: FileId,
    cursor: Option<&str>,
    limit: usize,
) -> Result<Vec<(String, FileId)>> {
    let prefix = keys::child_prefix(dir);
    let mut entries = Vec::new();
    for (key, value) in view.scan(&prefix)? {
        let name = std::str::from_utf8(&key[prefix.len()..])
            .map_err(|_| Error::io("malformed child name"))?;
        if let Some(cursor) = cursor {
            if name <= cursor {
                continue;
            }
        }
        let child =
            FileId::from_slice(&value).ok_or_else(|| Error::io("malformed child edge"))?;
        entries.push((name.to_owned(), child));
        if entries.len() == limit {
            break;
        }
    }
    Ok(entries)
}

fn view_get_lock(view: &impl View, id: LockId) -> Result<LockRecord> {
    match view.read(&keys::lock(id))? {
        Some(bytes) => codec::decode(&bytes),
        None => Err(Error::NotFound),
    }
}

fn view_list_locks(view: &impl View, query: &LockQuery) -> Result<Vec<LockRecord>> {
    // Narrow through the most selective secondary index available.
    let ids: Vec<LockId> = if let Some(file) = query.file {
        view.scan(&keys::lock_by_file_prefix(file))?
            .iter()
            .filter_map(|(key, _)| keys::lock_id_suffix(key))
            .collect()
    } else if let Some(owner) = &query.owner {
        view.scan(&keys::lock_by_owner_prefix(&owner.0))?
            .iter()
            .filter_map(|(key, _)| keys::lock_id_suffix(key))
            .collect()
    } else if let Some(client) = &query.client {
        view.scan(&keys::lock_by_client_prefix(&client.0))?
            .iter()
            .filter_map(|(key, _)| keys::lock_id_suffix(key))
            .collect()
    } else {
        let mut records = Vec::new();
        for (_, bytes) in view.scan(keys::LOCK)? {
            records.push(codec::decode::<LockRecord>(&bytes)?);
        }
        return Ok(records.into_iter().filter(|r| query.matches(r)).collect());
    };
    let mut records = Vec::new();
    for id in ids {
        let record = view_get_lock(view, id)?;
        if query.matches(&record) {
            records.push(record);
        }
    }
    Ok(records)
}

macro_rules! impl_kv_read_tx {
    ($target:ty) => {
        #[async_trait]
        impl ReadTx for $target {
            async fn get_file(&mut self, id: FileId) -> Result<FileEntry> {
                view_get_file(self, id)
            }

            async fn find_file_by_payload_id(&mut self, payload_id: &str) -> Result<FileEntry> {
                view_find_file_by_payload_id(self, payload_id)
            }

            async fn get_child(&mut self, dir: FileId, name: &str) -> Result<FileId> {
                view_get_child(self, dir, name)
            }

            async fn list_children(
                &mut self,
                dir: FileId,
                cursor: Option<&str>,
                limit: usize,
            ) -> Result<Vec<(String, FileId)>> {
                view_list_children(self, dir, cursor, limit)
            }

            async fn get_parent(&mut self, id: FileId) -> Result<FileId> {
                match self.read(&keys::parent(id))? {
                    Some(bytes) => FileId::from_slice(&bytes)
                        .ok_or_else(|| Error::io("malformed parent edge")),
                    None => Err(Error::NotFound),
                }
            }

            async fn get_link_count(&mut self, id: FileId) -> Result<u32> {
                match self.read(&keys::link_count(id))? {
                    Some(bytes) => {
                        let arr: [u8; 4] = bytes
                            .as_slice()
                            .try_into()
                            .map_err(|_| Error::io("malformed link count"))?;
                        Ok(u32::from_be_bytes(arr))
                    }
                    None => Err(Error::NotFound),
                }
            }

            async fn get_share(&mut self, name: &str) -> Result<Share> {
                match self.read(&keys::share(name))? {
                    Some(bytes) => codec::decode(&bytes),
                    None => Err(Error::NotFound),
                }
            }

            async fn list_shares(&mut self) -> Result<Vec<Share>> {
                let mut shares = Vec::new();
                for (_, bytes) in self.scan(keys::SHARE)? {
                    shares.push(codec::decode::<Share>(&bytes)?);
                }
                Ok(shares)
            }

            async fn get_fs_meta(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
                self.read(&keys::fs_meta(key))
            }

            async fn get_server_config(&mut self) -> Result<Option<CoreConfig>> {
                match self.read(SERVER_CONFIG_KEY.as_bytes())? {
                    Some(bytes) => Ok(Some(codec::decode(&bytes)?)),
                    None => Ok(None),
                }
            }

            async fn server_epoch(&mut self) -> Result<u64> {
                match self.read(SERVER_EPOCH_KEY.as_bytes())? {
                    Some(bytes) => {
                        let arr: [u8; 8] = bytes
                            .as_slice()
                            .try_into()
                            .map_err(|_| Error::io("malformed epoch"))?;
                        Ok(u64::from_be_bytes(arr))
                    }
                    None => Ok(0),
                }
            }

            async fn get_object(&mut self, hash: ContentHash) -> Result<ObjectRecord> {
                match self.read(&keys::object(hash))? {
                    Some(bytes) => codec::decode(&bytes),
                    None => Err(Error::NotFound),
                }
            }

            async fn get_chunk(&mut self, hash: ContentHash) -> Result<ChunkRecord> {
                match self.read(&keys::chunk(hash))? {
                    Some(bytes) => codec::decode(&bytes),
                    None => Err(Error::NotFound),
                }
            }

            async fn get_chunks_by_object(
                &mut self,
                object: ContentHash,
            ) -> Result<Vec<ChunkRecord>> {
                let mut chunks = Vec::new();
                for (key, _) in self.scan(&keys::object_chunks_prefix(object))? {
                    let hash = keys::hash_suffix(&key)
                        .ok_or_else(|| Error::io("malformed chunk index key"))?;
                    match self.read(&keys::chunk(hash))? {
                        Some(bytes) => chunks.push(codec::decode::<ChunkRecord>(&bytes)?),
                        None => return Err(Error::io("dangling chunk index entry")),
                    }
                }
                chunks.sort_by_key(|chunk| chunk.index);
                Ok(chunks)
            }

            async fn get_block(&mut self, hash: ContentHash) -> Result<BlockRecord> {
                match self.read(&keys::block(hash))? {
                    Some(bytes) => codec::decode(&bytes),
                    None => Err(Error::NotFound),
                }
            }

            async fn get_blocks_by_chunk(
                &mut self,
                chunk: ContentHash,
            ) -> Result<Vec<BlockRecord>> {
                let mut blocks = Vec::new();
                for (key, _) in self.scan(&keys::chunk_blocks_prefix(chunk))? {
                    let hash = keys::hash_suffix(&key)
                        .ok_or_else(|| Error::io("malformed block index key"))?;
                    match self.read(&keys::block(hash))? {
                        Some(bytes) => blocks.push(codec::decode::<BlockRecord>(&bytes)?),
                        None => return Err(Error::io("dangling block index entry")),
                    }
                }
                blocks.sort_by_key(|block| block.index);
                Ok(blocks)
            }

            async fn get_lock(&mut self, id: LockId) -> Result<LockRecord> {
                view_get_lock(self, id)
            }

            async fn list_locks(&mut self, query: &LockQuery) -> Result<Vec<LockRecord>> {
                view_list_locks(self, query)
            }

            async fn list_client_registrations(&mut self) -> Result<Vec<NsmRegistration>> {
                let mut registrations = Vec::new();
                for (_, bytes) in self.scan(keys::NSM)? {
                    registrations.push(codec::decode::<NsmRegistration>(&bytes)?);
                }
                Ok(registrations)
            }

            async fn scan_statistics(&mut self, share: &str) -> Result<FsStatistics> {
                let mut used_bytes = 0u64;
                let mut used_inodes = 0u64;
                for (_, bytes) in self.scan(keys::FILE)? {
                    let entry: FileEntry = codec::decode(&bytes)?;
                    if entry.share == share {
                        used_bytes = used_bytes.saturating_add(entry.size);
                        used_inodes += 1;
                    }
                }
                Ok(FsStatistics::from_usage(used_bytes, used_inodes))
            }
        }
    };
}

impl_kv_read_tx!(KvReadTx);
impl_kv_read_tx!(KvWriteTx);

#[async_trait]
impl WriteTx for KvWriteTx {
    async fn put_file(&mut self, entry: &FileEntry) -> Result<()> {
        // Keep the payload-identifier index in step with the record.
        let old_payload = match view_get_file(self, entry.id) {
            Ok(old) => Some(old.payload_id),
            Err(Error::NotFound) => None,
            Err(e) => return Err(e),
        };
        if let Some(old) = old_payload {
            if !old.is_empty() && old != entry.payload_id {
                self.stage_delete(keys::file_by_payload(&old, entry.id));
            }
        }
        if !entry.payload_id.is_empty() {
            reject_nul("payload identifier", &entry.payload_id)?;
            self.stage_put(keys::file_by_payload(&entry.payload_id, entry.id), Vec::new());
        }
        let bytes = codec::encode(entry)?;
        self.stage_put(keys::file(entry.id), bytes);
        Ok(())
    }

    async fn delete_file(&mut self, id: FileId) -> Result<()> {
        let entry = view_get_file(self, id)?;
        if !entry.payload_id.is_empty() {
            self.stage_delete(keys::file_by_payload(&entry.payload_id, id));
        }
        self.stage_delete(keys::file(id));
        self.stage_delete(keys::parent(id));
        self.stage_delete(keys::link_count(id));
        for (key, _) in self.scan(&keys::child_prefix(id))? {
            self.stage_delete(key);
        }
        Ok(())
    }

    async fn set_child(&mut self, dir: FileId, name: &str, child: FileId) -> Result<()> {
        self.stage_put(keys::child(dir, name), child.as_bytes().to_vec());
        Ok(())
    }

    async fn delete_child(&mut self, dir: FileId, name: &str) -> Result<()> {
        if !self.stage_delete_existing(keys::child(dir, name))? {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    async fn set_parent(&mut self, id: FileId, parent: FileId) -> Result<()> {
        self.stage_put(keys::parent(id), parent.as_bytes().to_vec());
        Ok(())
    }

    async fn set_link_count(&mut self, id: FileId, count: u32) -> Result<()> {
        self.stage_put(keys::link_count(id), count.to_be_bytes().to_vec());
        Ok(())
    }

    async fn create_share(&mut self, share: &Share) -> Result<()> {
        let key = keys::share(&share.name);
        if self.read(&key)?.is_some() {
            return Err(Error::AlreadyExists);
        }
        let bytes = codec::encode(share)?;
        self.stage_put(key, bytes);
        Ok(())
    }

    async fn update_share_options(&mut self, name: &str, options: &ShareOptions) -> Result<()> {
        let mut share = self.get_share(name).await?;
        share.options = options.clone();
        let bytes = codec::encode(&share)?;
        self.stage_put(keys::share(name), bytes);
        Ok(())
    }

    async fn delete_share(&mut self, name: &str) -> Result<()> {
        if !self.stage_delete_existing(keys::share(name))? {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    async fn put_fs_meta(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.stage_put(keys::fs_meta(key), value.to_vec());
        Ok(())
    }

    async fn set_server_config(&mut self, config: &CoreConfig) -> Result<()> {
        let bytes = codec::encode(config)?;
        self.stage_put(SERVER_CONFIG_KEY.as_bytes().to_vec(), bytes);
        Ok(())
    }

    async fn bump_server_epoch(&mut self) -> Result<u64> {
        let next = self.server_epoch().await? + 1;
        self.stage_put(SERVER_EPOCH_KEY.as_bytes().to_vec(), next.to_be_bytes().to_vec());
        Ok(next)
    }

    async fn put_object(&mut self, object: &ObjectRecord) -> Result<()> {
        let bytes = codec::encode(object)?;
        self.stage_put(keys::object(object.hash), bytes);
        Ok(())
    }

    async fn delete_object(&mut self, hash: ContentHash) -> Result<()> {
        if !self.stage_delete_existing(keys::object(hash))? {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    async fn put_chunk(&mut self, chunk: &ChunkRecord) -> Result<()> {
        let bytes = codec::encode(chunk)?;
        self.stage_put(keys::chunk(chunk.hash), bytes);
        self.stage_put(keys::object_chunk(chunk.object, chunk.hash), Vec::new());
        Ok(())
    }

    async fn delete_chunk(&mut self, hash: ContentHash) -> Result<()> {
        let chunk = self.get_chunk(hash).await?;
        self.stage_delete(keys::object_chunk(chunk.object, hash));
        self.stage_delete(keys::chunk(hash));
        Ok(())
    }

    async fn put_block(&mut self, block: &BlockRecord) -> Result<()> {
        let bytes = codec::encode(block)?;
        self.stage_put(keys::block(block.hash), bytes);
        self.stage_put(keys::chunk_block(block.chunk, block.hash), Vec::new());
        Ok(())
    }

    async fn delete_block(&mut self, hash: ContentHash) -> Result<()> {
        let block = self.get_block(hash).await?;
        self.stage_delete(keys::chunk_block(block.chunk, hash));
        self.stage_delete(keys::block(hash));
        Ok(())
    }

    async fn put_lock(&mut self, lock: &LockRecord) -> Result<()> {
        reject_nul("lock owner", &lock.owner.0)?;
        reject_nul("lock client", &lock.client.0)?;
        let bytes = codec::encode(lock)?;
        self.stage_put(keys::lock(lock.id), bytes);
        self.stage_put(keys::lock_by_file(lock.file, lock.id), Vec::new());
        self.stage_put(keys::lock_by_owner(&lock.owner.0, lock.id), Vec::new());
        self.stage_put(keys::lock_by_client(&lock.client.0, lock.id), Vec::new());
        Ok(())
    }

    async fn delete_lock(&mut self, id: LockId) -> Result<()> {
        let record = view_get_lock(self, id)?;
        self.stage_delete(keys::lock_by_file(record.file, id));
        self.stage_delete(keys::lock_by_owner(&record.owner.0, id));
        self.stage_delete(keys::lock_by_client(&record.client.0, id));
        self.stage_delete(keys::lock(id));
        Ok(())
    }

    async fn delete_locks_by_client(&mut self, client: &ClientId) -> Result<u64> {
        let records = view_list_locks(
            self,
            &LockQuery { client: Some(client.clone()), ..LockQuery::default() },
        )?;
        let count = records.len() as u64;
        for record in records {
            self.delete_lock(record.id).await?;
        }
        Ok(count)
    }

    async fn delete_locks_by_file(&mut self, file: FileId) -> Result<u64> {
        let records =
            view_list_locks(self, &LockQuery { file: Some(file), ..LockQuery::default() })?;
        let count = records.len() as u64;
        for record in records {
            self.delete_lock(record.id).await?;
        }
        Ok(count)
    }

    async fn put_client_registration(&mut self, registration: &NsmRegistration) -> Result<()> {
        let bytes = codec::encode(registration)?;
        self.stage_put(keys::nsm(&registration.client.0), bytes);
        Ok(())
    }

    async fn delete_client_registration(&mut self, client: &ClientId) -> Result<()> {
        if !self.stage_delete_existing(keys::nsm(&client.0))? {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let KvWriteTx { tree, _guard, staged } = *self;
        let mut batch = sled::Batch::default();
        for (key, staged_value) in staged {
            match staged_value {
                Some(value) => batch.insert(key, value),
                None => batch.remove(key),
            }
        }
        tree.apply_batch(batch).map_err(map_sled)?;
        tree.flush_async().await.map_err(map_sled)?;
        Ok(())
    }
}
