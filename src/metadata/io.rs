//! Read/write preparation and commit.
//!
//! Byte I/O happens in an external payload store; the core only
//! validates permissions, hands out payload identifiers and commits
//! attribute changes. `prepare-write` / `commit-write` form a two-phase
//! protocol: preparation validates and proposes a fresh content
//! identifier, the adapter moves bytes (and typically indexes them into
//! the payload tables), and commit publishes the new attributes
//! atomically.

use futures::future::FutureExt;
use uuid::Uuid;

use crate::context::CallerContext;
use crate::entity::{ContentHash, FileEntry, FileHandle, FileId};
use crate::error::{Error, Result};
use crate::metadata::access::{self, AccessMask};
use crate::metadata::{load_target, require_writable, MetadataService};
use crate::payload::{self, PayloadManifest};

/// Everything an adapter needs to locate payload bytes for a read.
#[derive(Debug, Clone)]
pub struct ReadPlan {
    pub entry: FileEntry,
    /// Identifier of the external bytes; `None` for an empty file.
    pub payload_id: Option<String>,
}

/// In-flight write state between preparation and commit.
#[derive(Debug, Clone)]
pub struct WriteOperation {
    pub handle: FileHandle,
    pub file: FileId,
    pub share: String,
    /// Attributes as they stood at preparation, for weak cache
    /// consistency replies.
    pub pre: FileEntry,
    /// Content identifier to assign at commit. Preparation proposes a
    /// fresh one; an adapter that indexes content through the payload
    /// tables replaces it with the deduplicated object hash.
    pub payload_id: String,
    /// Size the write extends the file to. Commit never shrinks: the
    /// committed size is the maximum of this and the current size.
    pub new_size: u64,
}

impl MetadataService {
    /// Validates read permission and returns what the adapter needs to
    /// fetch payload bytes.
    pub async fn prepare_read(&self, ctx: &CallerContext, handle: &FileHandle) -> Result<ReadPlan> {
        ctx.check_cancelled()?;
        let mut tx = self.backend().begin_read().await?;
        let tx = tx.as_mut();
        let (_, entry) = load_target(tx, ctx, handle).await?;
        if entry.is_directory() {
            return Err(Error::IsDirectory);
        }
        if !entry.is_regular() {
            return Err(Error::InvalidArgument("read targets a regular file".into()));
        }
        access::require(&entry, ctx, AccessMask::READ)?;
        let payload_id =
            if entry.payload_id.is_empty() { None } else { Some(entry.payload_id.clone()) };
        Ok(ReadPlan { entry, payload_id })
    }

    /// Validates write permission and opens a write operation carrying
    /// the pre-write attributes and a fresh proposed content
    /// identifier.
    pub async fn prepare_write(
        &self,
        ctx: &CallerContext,
        handle: &FileHandle,
        new_size: u64,
    ) -> Result<WriteOperation> {
        ctx.check_cancelled()?;
        let mut tx = self.backend().begin_read().await?;
        let tx = tx.as_mut();
        let (share, entry) = load_target(tx, ctx, handle).await?;
        require_writable(&share)?;
        if entry.is_directory() {
            return Err(Error::IsDirectory);
        }
        if !entry.is_regular() {
            return Err(Error::InvalidArgument("write targets a regular file".into()));
        }
        access::require(&entry, ctx, AccessMask::WRITE)?;
        Ok(WriteOperation {
            handle: handle.clone(),
            file: entry.id,
            share: share.name,
            payload_id: ContentHash::digest(Uuid::new_v4().as_bytes()).to_hex(),
            new_size,
            pre: entry,
        })
    }

    /// Commits a prepared write: assigns the operation's payload
    /// identifier, advances modify/change times, drops setuid/setgid
    /// and grows the size monotonically (`max(current, new)`); only
    /// `set_attr` truncates.
    pub async fn commit_write(
        &self,
        ctx: &CallerContext,
        op: &WriteOperation,
    ) -> Result<FileEntry> {
        self.commit_write_inner(ctx, op, None).await
    }

    /// Commit variant that records a payload manifest (deduplicating
    /// against existing blocks/chunks/objects) in the same transaction
    /// and assigns the resulting object hash as the file's payload
    /// identifier.
    pub async fn commit_write_with_manifest(
        &self,
        ctx: &CallerContext,
        op: &WriteOperation,
        manifest: &PayloadManifest,
    ) -> Result<FileEntry> {
        self.commit_write_inner(ctx, op, Some(manifest)).await
    }

    async fn commit_write_inner(
        &self,
        ctx: &CallerContext,
        op: &WriteOperation,
        manifest: Option<&PayloadManifest>,
    ) -> Result<FileEntry> {
        ctx.check_cancelled()?;
        let committed = self
            .with_write(|tx| {
                let ctx = ctx.clone();
                let op = op.clone();
                let manifest = manifest.cloned();
                async move {
                    let ctx = &ctx;
                    let (share, mut entry) = load_target(tx, ctx, &op.handle).await?;
                    require_writable(&share)?;
                    if !entry.is_regular() {
                        return Err(Error::InvalidArgument("write targets a regular file".into()));
                    }
                    access::require(&entry, ctx, AccessMask::WRITE)?;
                    let new_payload = match &manifest {
                        Some(manifest) => payload::record_manifest_tx(tx, manifest).await?,
                        None => op.payload_id.clone(),
                    };
                    if !new_payload.is_empty() && new_payload != entry.payload_id {
                        if !entry.payload_id.is_empty() {
                            payload::release_payload_tx(tx, &entry.payload_id).await?;
                        }
                        entry.payload_id = new_payload;
                    }
                    entry.size = entry.size.max(op.new_size);
                    entry.clear_setid();
                    entry.touch_modified();
                    tx.put_file(&entry).await?;
                    Ok(entry)
                }
                .boxed()
            })
            .await?;
        self.invalidate_stats(&committed.share).await;
        self.notify_entry_modified(&committed).await;
        Ok(committed)
    }
}
