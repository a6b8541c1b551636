//! Content-addressed payload index --- [`PayloadIndex`].
//!
//! A typed facade over the backend's object/chunk/block tables. The
//! index tracks topology and reference state; payload bytes live in an
//! external store keyed by the payload identifier (the hex form of the
//! object hash).
//!
//! Reference counts form a tree: an object's refcount is the number of
//! file entries naming it, a chunk's refcount is the number of objects
//! containing it, a block's refcount is the number of chunks containing
//! it. Deleting a parent never cascades inside a transaction; callers
//! drain refcounts and collect zero-refcount records out of band.

use std::sync::Arc;
use std::time::Duration;

use futures::future::FutureExt;
use tracing::debug;

use crate::backend::{self, Backend, WriteTx};
use crate::config::CoreConfig;
use crate::entity::{BlockRecord, ChunkRecord, ContentHash, FileTime, ObjectRecord};
use crate::error::{Error, Result};

/// Block description supplied by the adapter after hashing content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockManifest {
    pub hash: ContentHash,
    pub size: u32,
}

/// Chunk description: an ordered run of blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkManifest {
    pub blocks: Vec<BlockManifest>,
}

impl ChunkManifest {
    /// Chunk hash, derived from the ordered block hashes.
    pub fn hash(&self) -> ContentHash {
        ContentHash::digest_children(self.blocks.iter().map(|b| &b.hash))
    }

    pub fn size(&self) -> u64 {
        self.blocks.iter().map(|b| b.size as u64).sum()
    }
}

/// Full description of one logical payload version. The adapter chunks
/// and hashes content on the write path and hands the core this
/// topology; the core never sees the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadManifest {
    pub chunks: Vec<ChunkManifest>,
}

impl PayloadManifest {
    /// Object hash, derived from the ordered chunk hashes. Its hex form
    /// is the payload identifier assigned to the file entry.
    pub fn object_hash(&self) -> ContentHash {
        let hashes: Vec<ContentHash> = self.chunks.iter().map(|c| c.hash()).collect();
        ContentHash::digest_children(hashes.iter())
    }

    pub fn size(&self) -> u64 {
        self.chunks.iter().map(|c| c.size()).sum()
    }
}

/// Typed facade over the payload tables.
pub struct PayloadIndex {
    backend: Arc<dyn Backend>,
    retry_max: u32,
    backoff_base: Duration,
}

impl PayloadIndex {
    pub fn new(backend: Arc<dyn Backend>, config: &CoreConfig) -> Self {
        Self {
            backend,
            retry_max: config.transaction_retry_max,
            backoff_base: config.retry_backoff_base(),
        }
    }

    async fn with_write<T, F>(&self, op: F) -> Result<T>
    where
        T: Send,
        F: for<'a> Fn(
                &'a mut (dyn WriteTx + 'static),
            ) -> futures::future::BoxFuture<'a, Result<T>>
            + Send
            + Sync,
    {
        backend::with_write(self.backend.as_ref(), self.retry_max, self.backoff_base, op).await
    }

    // --- Objects ---

    pub async fn get_object(&self, hash: ContentHash) -> Result<ObjectRecord> {
        self.backend.begin_read().await?.get_object(hash).await
    }

    pub async fn put_object(&self, object: &ObjectRecord) -> Result<()> {
        self.with_write(|tx| {
            let object = object.clone();
            async move { tx.put_object(&object).await }.boxed()
        })
        .await
    }

    pub async fn delete_object(&self, hash: ContentHash) -> Result<()> {
        self.with_write(move |tx| async move { tx.delete_object(hash).await }.boxed()).await
    }

    pub async fn increment_object_refcount(&self, hash: ContentHash) -> Result<u64> {
        self.with_write(move |tx| async move { tx.increment_object_refcount(hash).await }.boxed())
            .await
    }

    pub async fn decrement_object_refcount(&self, hash: ContentHash) -> Result<u64> {
        self.with_write(move |tx| async move { tx.decrement_object_refcount(hash).await }.boxed())
            .await
    }

    /// Marks an object complete once every block of every chunk has been
    /// uploaded durably.
    pub async fn finalize_object(&self, hash: ContentHash) -> Result<()> {
        self.with_write(move |tx| {
            async move {
                let mut object = tx.get_object(hash).await?;
                object.finalized = true;
                tx.put_object(&object).await
            }
            .boxed()
        })
        .await
    }

    // --- Chunks ---

    pub async fn get_chunks_by_object(&self, object: ContentHash) -> Result<Vec<ChunkRecord>> {
        self.backend.begin_read().await?.get_chunks_by_object(object).await
    }

    /// Records a chunk. The parent object must already exist.
    pub async fn put_chunk(&self, chunk: &ChunkRecord) -> Result<()> {
        self.with_write(|tx| {
            let chunk = chunk.clone();
            async move {
                tx.get_object(chunk.object).await.map_err(|e| match e {
                    Error::NotFound => {
                        Error::InvalidArgument(format!("chunk parent object {} missing", chunk.object))
                    }
                    other => other,
                })?;
                tx.put_chunk(&chunk).await
            }
            .boxed()
        })
        .await
    }

    pub async fn delete_chunk(&self, hash: ContentHash) -> Result<()> {
        self.with_write(move |tx| async move { tx.delete_chunk(hash).await }.boxed()).await
    }

    pub async fn increment_chunk_refcount(&self, hash: ContentHash) -> Result<u64> {
        self.with_write(move |tx| async move { tx.increment_chunk_refcount(hash).await }.boxed())
            .await
    }

    pub async fn decrement_chunk_refcount(&self, hash: ContentHash) -> Result<u64> {
        self.with_write(move |tx| async move { tx.decrement_chunk_refcount(hash).await }.boxed())
            .await
    }

    // --- Blocks ---

    pub async fn get_blocks_by_chunk(&self, chunk: ContentHash) -> Result<Vec<BlockRecord>> {
        self.backend.begin_read().await?.get_blocks_by_chunk(chunk).await
    }

    /// Deduplication probe; absence is a value, never an error.
    pub async fn find_block_by_hash(&self, hash: ContentHash) -> Result<Option<BlockRecord>> {
        self.backend.begin_read().await?.find_block_by_hash(hash).await
    }

    /// Records a block. The parent chunk must already exist.
    pub async fn put_block(&self, block: &BlockRecord) -> Result<()> {
        self.with_write(|tx| {
            let block = block.clone();
            async move {
                tx.get_chunk(block.chunk).await.map_err(|e| match e {
                    Error::NotFound => {
                        Error::InvalidArgument(format!("block parent chunk {} missing", block.chunk))
                    }
                    other => other,
                })?;
                tx.put_block(&block).await
            }
            .boxed()
        })
        .await
    }

    pub async fn delete_block(&self, hash: ContentHash) -> Result<()> {
        self.with_write(move |tx| async move { tx.delete_block(hash).await }.boxed()).await
    }

    pub async fn increment_block_refcount(&self, hash: ContentHash) -> Result<u64> {
        self.with_write(move |tx| async move { tx.increment_block_refcount(hash).await }.boxed())
            .await
    }

    pub async fn decrement_block_refcount(&self, hash: ContentHash) -> Result<u64> {
        self.with_write(move |tx| async move { tx.decrement_block_refcount(hash).await }.boxed())
            .await
    }

    pub async fn mark_block_uploaded(&self, hash: ContentHash, when: FileTime) -> Result<()> {
        self.with_write(move |tx| async move { tx.mark_block_uploaded(hash, when).await }.boxed())
            .await
    }

    // --- Write-commit walk ---

    /// Records a payload manifest with deduplication and returns the
    /// payload identifier to assign to the file entry.
    pub async fn record_manifest(&self, manifest: &PayloadManifest) -> Result<String> {
        self.with_write(|tx| {
            let manifest = manifest.clone();
            async move { record_manifest_tx(tx, &manifest).await }.boxed()
        })
        .await
    }

    /// Drains one reference from a payload identifier's object tree.
    pub async fn release_payload(&self, payload_id: &str) -> Result<()> {
        self.with_write(|tx| {
            let payload_id = payload_id.to_owned();
            async move { release_payload_tx(tx, &payload_id).await }.boxed()
        })
        .await
    }
}

/// Transaction-level dedup walk, shared with the metadata service so a
/// write-commit can update the index and the file entry atomically.
///
/// For every block, a hash hit increments the existing refcount and a
/// miss inserts a fresh record; chunks and objects walk up the same way.
pub async fn record_manifest_tx<T: WriteTx + ?Sized>(
    tx: &mut T,
    manifest: &PayloadManifest,
) -> Result<String> {
    let object_hash = manifest.object_hash();
    match tx.get_object(object_hash).await {
        Ok(_) => {
            tx.increment_object_refcount(object_hash).await?;
            return Ok(object_hash.to_hex());
        }
        Err(Error::NotFound) => {}
        Err(e) => return Err(e),
    }
    for (chunk_index, chunk) in manifest.chunks.iter().enumerate() {
        let chunk_hash = chunk.hash();
        match tx.get_chunk(chunk_hash).await {
            Ok(_) => {
                tx.increment_chunk_refcount(chunk_hash).await?;
                continue;
            }
            Err(Error::NotFound) => {}
            Err(e) => return Err(e),
        }
        for (block_index, block) in chunk.blocks.iter().enumerate() {
            match tx.find_block_by_hash(block.hash).await? {
                Some(_) => {
                    tx.increment_block_refcount(block.hash).await?;
                }
                None => {
                    tx.put_block(&BlockRecord {
                        hash: block.hash,
                        chunk: chunk_hash,
                        index: block_index as u32,
                        size: block.size,
                        refcount: 1,
                        uploaded_at: None,
                    })
                    .await?;
                }
            }
        }
        tx.put_chunk(&ChunkRecord {
            hash: chunk_hash,
            object: object_hash,
            index: chunk_index as u32,
            size: chunk.size(),
            block_count: chunk.blocks.len() as u32,
            refcount: 1,
        })
        .await?;
    }
    tx.put_object(&ObjectRecord {
        hash: object_hash,
        size: manifest.size(),
        chunk_count: manifest.chunks.len() as u32,
        refcount: 1,
        finalized: false,
        created_at: FileTime::now(),
    })
    .await?;
    debug!(object = %object_hash, chunks = manifest.chunks.len(), "recorded payload manifest");
    Ok(object_hash.to_hex())
}

/// Transaction-level refcount drain for a truncate or unlink. Records
/// whose refcount reaches zero stay behind as garbage-collection
/// candidates. A payload identifier that no longer resolves is treated
/// as already drained.
pub async fn release_payload_tx<T: WriteTx + ?Sized>(tx: &mut T, payload_id: &str) -> Result<()> {
    let object_hash = match ContentHash::from_hex(payload_id) {
        Ok(hash) => hash,
        Err(_) => return Ok(()),
    };
    match tx.get_object(object_hash).await {
        Ok(_) => {}
        Err(Error::NotFound) => return Ok(()),
        Err(e) => return Err(e),
    }
    if tx.decrement_object_refcount(object_hash).await? > 0 {
        return Ok(());
    }
    for chunk in tx.get_chunks_by_object(object_hash).await? {
        if tx.decrement_chunk_refcount(chunk.hash).await? > 0 {
            continue;
        }
        for block in tx.get_blocks_by_chunk(chunk.hash).await? {
            tx.decrement_block_refcount(block.hash).await?;
        }
    }
    debug!(object = %object_hash, "released payload reference");
    Ok(())
}
