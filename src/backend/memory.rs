//! In-memory backend: maps guarded by a single read/write mutex.
//!
//! Write transactions operate on a copy of the state and swap it in on
//! commit, so dropping an uncommitted transaction leaves nothing behind.
//! Suitable for tests and ephemeral deployments; everything is lost on
//! process exit.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::backend::{Backend, ReadTx, WriteTx};
use crate::config::CoreConfig;
use crate::entity::{
    BlockRecord, ChunkRecord, ClientId, ContentHash, FileEntry, FileId, LockId, LockQuery,
    LockRecord, NsmRegistration, ObjectRecord, Share, ShareOptions,
};
use crate::error::{Error, Result};
use crate::stats::{Capabilities, FsStatistics};

#[derive(Debug, Clone, Default)]
struct State {
    files: BTreeMap<FileId, FileEntry>,
    children: BTreeMap<FileId, BTreeMap<String, FileId>>,
    parents: BTreeMap<FileId, FileId>,
    link_counts: BTreeMap<FileId, u32>,
    shares: BTreeMap<String, Share>,
    fs_meta: BTreeMap<String, Vec<u8>>,
    server_config: Option<CoreConfig>,
    objects: BTreeMap<ContentHash, ObjectRecord>,
    chunks: BTreeMap<ContentHash, ChunkRecord>,
    blocks: BTreeMap<ContentHash, BlockRecord>,
    locks: BTreeMap<LockId, LockRecord>,
    registrations: BTreeMap<String, NsmRegistration>,
}

/// Ephemeral backend for tests and in-process deployments.
pub struct MemoryBackend {
    state: Arc<RwLock<State>>,
    capabilities: Capabilities,
}

impl MemoryBackend {
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
            capabilities: Capabilities::from_config(config),
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn begin_read(&self) -> Result<Box<dyn ReadTx>> {
        let guard = Arc::clone(&self.state).read_owned().await;
        Ok(Box::new(MemoryReadTx { state: guard }))
    }

    async fn begin_write(&self) -> Result<Box<dyn WriteTx>> {
        let guard = Arc::clone(&self.state).write_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryWriteTx { guard, staged }))
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }
}

struct MemoryReadTx {
    state: OwnedRwLockReadGuard<State>,
}

struct MemoryWriteTx {
    guard: OwnedRwLockWriteGuard<State>,
    staged: State,
}

fn get_file(state: &State, id: FileId) -> Result<FileEntry> {
    state.files.get(&id).cloned().ok_or(Error::NotFound)
}

fn find_file_by_payload_id(state: &State, payload_id: &str) -> Result<FileEntry> {
    state
        .files
        .values()
        .find(|entry| !entry.payload_id.is_empty() && entry.payload_id == payload_id)
        .cloned()
        .ok_or(Error::NotFound)
}

fn get_child(state: &State, dir: FileId, name: &str) -> Result<FileId> {
    state.children.get(&dir).and_then(|edges| edges.get(name)).copied().ok_or(Error::NotFound)
}

fn list_children(
    state: &State,
    dir: FileId,
    cursor: Option<&str>,
    limit: usize,
) -> Result<Vec<(String, FileId)>> {
    let edges = match state.children.get(&dir) {
        Some(edges) => edges,
        None => return Ok(Vec::new()),
    };
    let start = match cursor {
        Some(name) => Bound::Excluded(name.to_owned()),
        None => Bound::Unbounded,
    };
    Ok(edges
        .range((start, Bound::Unbounded))
        .take(limit)
        .map(|(name, id)| (name.clone(), *id))
        .collect())
}

fn list_locks(state: &State, query: &LockQuery) -> Vec<LockRecord> {
    state.locks.values().filter(|record| query.matches(record)).cloned().collect()
}

fn scan_statistics(state: &State, share: &str) -> FsStatistics {
    let mut used_bytes = 0u64;
    let mut used_inodes = 0u64;
    for entry in state.files.values() {
        if entry.share == share {
            used_bytes = used_bytes.saturating_add(entry.size);
            used_inodes += 1;
        }
    }
    FsStatistics::from_usage(used_bytes, used_inodes)
}

macro_rules! impl_read_tx {
    ($target:ty, $state:ident) => {
        #[async_trait]
        impl ReadTx for $target {
            async fn get_file(&mut self, id: FileId) -> Result<FileEntry> {
                get_file(&self.$state, id)
            }

            async fn find_file_by_payload_id(&mut self, payload_id: &str) -> Result<FileEntry> {
                find_file_by_payload_id(&self.$state, payload_id)
            }

            async fn get_child(&mut self, dir: FileId, name: &str) -> Result<FileId> {
                get_child(&self.$state, dir, name)
            }

            async fn list_children(
                &mut self,
                dir: FileId,
                cursor: Option<&str>,
                limit: usize,
            ) -> Result<Vec<(String, FileId)>> {
                list_children(&self.$state, dir, cursor, limit)
            }

            async fn get_parent(&mut self, id: FileId) -> Result<FileId> {
                self.$state.parents.get(&id).copied().ok_or(Error::NotFound)
            }

            async fn get_link_count(&mut self, id: FileId) -> Result<u32> {
                self.$state.link_counts.get(&id).copied().ok_or(Error::NotFound)
            }

            async fn get_share(&mut self, name: &str) -> Result<Share> {
                self.$state.shares.get(name).cloned().ok_or(Error::NotFound)
            }

            async fn list_shares(&mut self) -> Result<Vec<Share>> {
                Ok(self.$state.shares.values().cloned().collect())
            }

            async fn get_fs_meta(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
                Ok(self.$state.fs_meta.get(key).cloned())
            }

            async fn get_server_config(&mut self) -> Result<Option<CoreConfig>> {
                Ok(self.$state.server_config.clone())
            }

            async fn get_object(&mut self, hash: ContentHash) -> Result<ObjectRecord> {
                self.$state.objects.get(&hash).cloned().ok_or(Error::NotFound)
            }

            async fn get_chunk(&mut self, hash: ContentHash) -> Result<ChunkRecord> {
                self.$state.chunks.get(&hash).cloned().ok_or(Error::NotFound)
            }

            async fn get_chunks_by_object(
                &mut self,
                object: ContentHash,
            ) -> Result<Vec<ChunkRecord>> {
                let mut chunks: Vec<ChunkRecord> = self
                    .$state
                    .chunks
                    .values()
                    .filter(|chunk| chunk.object == object)
                    .cloned()
                    .collect();
                chunks.sort_by_key(|chunk| chunk.index);
                Ok(chunks)
            }

            async fn get_block(&mut self, hash: ContentHash) -> Result<BlockRecord> {
                self.$state.blocks.get(&hash).cloned().ok_or(Error::NotFound)
            }

            async fn get_blocks_by_chunk(
                &mut self,
                chunk: ContentHash,
            ) -> Result<Vec<BlockRecord>> {
                let mut blocks: Vec<BlockRecord> = self
                    .$state
                    .blocks
                    .values()
                    .filter(|block| block.chunk == chunk)
                    .cloned()
                    .collect();
                blocks.sort_by_key(|block| block.index);
                Ok(blocks)
            }

            async fn get_lock(&mut self, id: LockId) -> Result<LockRecord> {
                self.$state.locks.get(&id).cloned().ok_or(Error::NotFound)
            }

            async fn list_locks(&mut self, query: &LockQuery) -> Result<Vec<LockRecord>> {
                Ok(list_locks(&self.$state, query))
            }

            async fn list_client_registrations(&mut self) -> Result<Vec<NsmRegistration>> {
                Ok(self.$state.registrations.values().cloned().collect())
            }

            async fn scan_statistics(&mut self, share: &str) -> Result<FsStatistics> {
                Ok(scan_statistics(&self.$state, share))
            }
        }
    };
}

impl_read_tx!(MemoryReadTx, state);
impl_read_tx!(MemoryWriteTx, staged);

#[async_trait]
impl WriteTx for MemoryWriteTx {
    async fn put_file(&mut self, entry: &FileEntry) -> Result<()> {
        self.staged.files.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn delete_file(&mut self, id: FileId) -> Result<()> {
        self.staged.files.remove(&id).ok_or(Error::NotFound)?;
        self.staged.parents.remove(&id);
        self.staged.link_counts.remove(&id);
        self.staged.children.remove(&id);
        Ok(())
    }

    async fn set_child(&mut self, dir: FileId, name: &str, child: FileId) -> Result<()> {
        self.staged.children.entry(dir).or_default().insert(name.to_owned(), child);
        Ok(())
    }

    async fn delete_child(&mut self, dir: FileId, name: &str) -> Result<()> {
        self.staged
            .children
            .get_mut(&dir)
            .and_then(|edges| edges.remove(name))
            .ok_or(Error::NotFound)?;
        Ok(())
    }

    async fn set_parent(&mut self, id: FileId, parent: FileId) -> Result<()> {
        self.staged.parents.insert(id, parent);
        Ok(())
    }

    async fn set_link_count(&mut self, id: FileId, count: u32) -> Result<()> {
        self.staged.link_counts.insert(id, count);
        Ok(())
    }

    async fn create_share(&mut self, share: &Share) -> Result<()> {
        if self.staged.shares.contains_key(&share.name) {
            return Err(Error::AlreadyExists);
        }
        self.staged.shares.insert(share.name.clone(), share.clone());
        Ok(())
    }

    async fn update_share_options(&mut self, name: &str, options: &ShareOptions) -> Result<()> {
        let share = self.staged.shares.get_mut(name).ok_or(Error::NotFound)?;
        share.options = options.clone();
        Ok(())
    }

    async fn delete_share(&mut self, name: &str) -> Result<()> {
        self.staged.shares.remove(name).ok_or(Error::NotFound)?;
        Ok(())
    }

    async fn put_fs_meta(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.staged.fs_meta.insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    async fn set_server_config(&mut self, config: &CoreConfig) -> Result<()> {
        self.staged.server_config = Some(config.clone());
        Ok(())
    }

    async fn put_object(&mut self, object: &ObjectRecord) -> Result<()> {
        self.staged.objects.insert(object.hash, object.clone());
        Ok(())
    }

    async fn delete_object(&mut self, hash: ContentHash) -> Result<()> {
        self.staged.objects.remove(&hash).ok_or(Error::NotFound)?;
        Ok(())
    }

    async fn put_chunk(&mut self, chunk: &ChunkRecord) -> Result<()> {
        self.staged.chunks.insert(chunk.hash, chunk.clone());
        Ok(())
    }

    async fn delete_chunk(&mut self, hash: ContentHash) -> Result<()> {
        self.staged.chunks.remove(&hash).ok_or(Error::NotFound)?;
        Ok(())
    }

    async fn put_block(&mut self, block: &BlockRecord) -> Result<()> {
        self.staged.blocks.insert(block.hash, block.clone());
        Ok(())
    }

    async fn delete_block(&mut self, hash: ContentHash) -> Result<()> {
        self.staged.blocks.remove(&hash).ok_or(Error::NotFound)?;
        Ok(())
    }

    async fn put_lock(&mut self, lock: &LockRecord) -> Result<()> {
        self.staged.locks.insert(lock.id, lock.clone());
        Ok(())
    }

    async fn delete_lock(&mut self, id: LockId) -> Result<()> {
        self.staged.locks.remove(&id).ok_or(Error::NotFound)?;
        Ok(())
    }

    async fn delete_locks_by_client(&mut self, client: &ClientId) -> Result<u64> {
        let before = self.staged.locks.len();
        self.staged.locks.retain(|_, record| record.client != *client);
        Ok((before - self.staged.locks.len()) as u64)
    }

    async fn delete_locks_by_file(&mut self, file: FileId) -> Result<u64> {
        let before = self.staged.locks.len();
        self.staged.locks.retain(|_, record| record.file != file);
        Ok((before - self.staged.locks.len()) as u64)
    }

    async fn put_client_registration(&mut self, registration: &NsmRegistration) -> Result<()> {
        self.staged.registrations.insert(registration.client.0.clone(), registration.clone());
        Ok(())
    }

    async fn delete_client_registration(&mut self, client: &ClientId) -> Result<()> {
        self.staged.registrations.remove(&client.0).ok_or(Error::NotFound)?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryWriteTx { mut guard, staged } = *self;
        *guard = staged;
        Ok(())
    }
}
