//! POSIX-correct metadata service --- [`MetadataService`].
//!
//! A thin layer over the backend transaction interface that protocol
//! adapters call. Each operation takes a validated [`CallerContext`] and
//! a target (a parent handle plus name, or a handle). Reads run against
//! a read transaction; mutations run inside the retrying write
//! transaction closure; adapter callbacks are emitted only after commit.
//!
//! The service embeds its collaborators (backend, lock manager, payload
//! index, statistics cache, grace coordinator) --- there is no
//! process-global state.

pub mod access;
mod attr;
mod io;
mod namespace;
mod remove;
mod rename;
mod share;

pub use access::AccessMask;
pub use attr::{SetAttrs, SetTime};
pub use io::{ReadPlan, WriteOperation};
pub use namespace::{CreateAttrs, DirEntry, DirPage};
pub use share::RootAttrs;

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use tracing::debug;

use crate::backend::{self, Backend, ReadTx, WriteTx};
use crate::config::CoreConfig;
use crate::context::CallerContext;
use crate::entity::{
    file::{MAX_NAME_LEN, MAX_PATH_LEN},
    FileEntry, FileHandle, FileId, Share,
};
use crate::error::{Error, Result};
use crate::lock::{GraceCoordinator, LockManager};
use crate::payload::{self, PayloadIndex};
use crate::stats::{Capabilities, FsStatistics, StatsCache};

/// The typed API protocol adapters consume.
pub struct MetadataService {
    backend: Arc<dyn Backend>,
    locks: Arc<LockManager>,
    payload: PayloadIndex,
    stats: StatsCache,
    config: CoreConfig,
    /// Adapter-signalled open handle counts, for unlink-while-open
    /// retention and purge.
    open_files: Arc<DashMap<FileId, u32>>,
}

impl MetadataService {
    pub fn new(backend: Arc<dyn Backend>, locks: Arc<LockManager>, config: CoreConfig) -> Self {
        let payload = PayloadIndex::new(Arc::clone(&backend), &config);
        let stats = StatsCache::new(Arc::clone(&backend), config.stats_cache_ttl());
        Self { backend, locks, payload, stats, config, open_files: Arc::new(DashMap::new()) }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn payload_index(&self) -> &PayloadIndex {
        &self.payload
    }

    pub fn grace(&self) -> &Arc<GraceCoordinator> {
        self.locks.grace()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Immutable feature flags of the underlying backend.
    pub fn capabilities(&self) -> &Capabilities {
        self.backend.capabilities()
    }

    /// Opaque handle naming an entry. Adapters pass it back verbatim.
    pub fn handle_for(&self, entry: &FileEntry) -> Result<FileHandle> {
        FileHandle::encode(&entry.share, entry.id)
    }

    /// Cached per-share statistics snapshot.
    pub async fn fs_statistics(&self, ctx: &CallerContext, share: &str) -> Result<Arc<FsStatistics>> {
        ctx.check_cancelled()?;
        self.stats.get(share).await
    }

    /// Entry behind a handle, without permission checks beyond handle
    /// possession. Orphaned (`nlink == 0`) entries resolve as long as a
    /// handle still references them.
    pub async fn get_attr(&self, ctx: &CallerContext, handle: &FileHandle) -> Result<FileEntry> {
        ctx.check_cancelled()?;
        let (_, id) = handle.decode()?;
        let mut tx = self.backend.begin_read().await?;
        load_entry(tx.as_mut(), id).await
    }

    /// Advisory permission probe: the granted subset of the requested
    /// mask. Denial is a value here, never an error.
    pub async fn check_permissions(
        &self,
        ctx: &CallerContext,
        handle: &FileHandle,
        requested: AccessMask,
    ) -> Result<AccessMask> {
        ctx.check_cancelled()?;
        let (_, id) = handle.decode()?;
        let mut tx = self.backend.begin_read().await?;
        let entry = load_entry(tx.as_mut(), id).await?;
        Ok(access::granted(&entry, ctx, requested))
    }

    /// Signals one more open handle on the entry. Orphans stay alive
    /// while this count is positive.
    pub async fn open_file(&self, ctx: &CallerContext, handle: &FileHandle) -> Result<FileEntry> {
        let entry = self.get_attr(ctx, handle).await?;
        *self.open_files.entry(entry.id).or_insert(0) += 1;
        Ok(entry)
    }

    /// Signals an open handle going away. The transition to zero opens
    /// purges entries that were unlinked while open.
    pub async fn release_file(&self, ctx: &CallerContext, handle: &FileHandle) -> Result<()> {
        ctx.check_cancelled()?;
        let (_, id) = handle.decode()?;
        let now_closed = {
            let Some(mut count) = self.open_files.get_mut(&id) else {
                return Ok(());
            };
            *count = count.saturating_sub(1);
            *count == 0
        };
        if !now_closed {
            return Ok(());
        }
        self.open_files.remove(&id);
        self.with_write(|tx| {
            async move {
                match tx.get_file(id).await {
                    Ok(entry) if entry.nlink == 0 => {
                        debug!(file = %id, "purging released orphan");
                        purge_entry(tx, &entry).await
                    }
                    Ok(_) => Ok(()),
                    // Already destroyed; release is idempotent.
                    Err(Error::NotFound) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            .boxed()
        })
        .await
    }

    /// Open-handle count the adapters have signalled for an entry.
    pub fn open_count(&self, id: FileId) -> u32 {
        self.open_files.get(&id).map(|count| *count).unwrap_or(0)
    }

    pub(crate) async fn with_write<T, F>(&self, op: F) -> Result<T>
    where
        T: Send,
        F: for<'a> Fn(&'a mut (dyn WriteTx + 'static)) -> BoxFuture<'a, Result<T>> + Send + Sync,
    {
        backend::with_write(
            self.backend.as_ref(),
            self.config.transaction_retry_max,
            self.config.retry_backoff_base(),
            op,
        )
        .await
    }

    pub(crate) fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub(crate) async fn invalidate_stats(&self, share: &str) {
        self.stats.invalidate(share).await;
    }
}

/// Loads an entry by identifier, mapping absence to [`Error::Stale`]:
/// a decodable handle whose entry is gone points at a destroyed file.
pub(crate) async fn load_entry<T: ReadTx + ?Sized>(tx: &mut T, id: FileId) -> Result<FileEntry> {
    match tx.get_file(id).await {
        Ok(entry) => Ok(entry),
        Err(Error::NotFound) => Err(Error::Stale),
        Err(e) => Err(e),
    }
}

/// Loads the share and the directory entry a (handle, name) operation
/// targets, enforcing share admission for the caller.
pub(crate) async fn load_dir<T: ReadTx + ?Sized>(
    tx: &mut T,
    ctx: &CallerContext,
    handle: &FileHandle,
) -> Result<(Share, FileEntry)> {
    let (share_name, id) = handle.decode()?;
    let share = match tx.get_share(&share_name).await {
        Ok(share) => share,
        Err(Error::NotFound) => return Err(Error::Stale),
        Err(e) => return Err(e),
    };
    authorize_share(&share, ctx)?;
    let entry = load_entry(tx, id).await?;
    if !entry.is_directory() {
        return Err(Error::NotDirectory);
    }
    Ok((share, entry))
}

/// Loads the share and entry a handle-target operation addresses.
pub(crate) async fn load_target<T: ReadTx + ?Sized>(
    tx: &mut T,
    ctx: &CallerContext,
    handle: &FileHandle,
) -> Result<(Share, FileEntry)> {
    let (share_name, id) = handle.decode()?;
    let share = match tx.get_share(&share_name).await {
        Ok(share) => share,
        Err(Error::NotFound) => return Err(Error::Stale),
        Err(e) => return Err(e),
    };
    authorize_share(&share, ctx)?;
    let entry = load_entry(tx, id).await?;
    Ok((share, entry))
}

/// Share admission: authentication requirement, method allow-list and
/// client allow/deny lists (deny wins).
pub(crate) fn authorize_share(share: &Share, ctx: &CallerContext) -> Result<()> {
    let options = &share.options;
    if options.require_auth && ctx.anonymous {
        return Err(Error::PermissionDenied);
    }
    if !options.auth_methods.is_empty() && !options.auth_methods.contains(&ctx.auth) {
        return Err(Error::PermissionDenied);
    }
    if let Some(addr) = &ctx.client_addr {
        let addr = addr.to_string();
        if options.denied_clients.iter().any(|denied| *denied == addr) {
            return Err(Error::PermissionDenied);
        }
        if !options.allowed_clients.is_empty()
            && !options.allowed_clients.iter().any(|allowed| *allowed == addr)
        {
            return Err(Error::PermissionDenied);
        }
    }
    Ok(())
}

/// Refuses mutations on read-only shares.
pub(crate) fn require_writable(share: &Share) -> Result<()> {
    if share.options.read_only {
        Err(Error::ReadOnly)
    } else {
        Ok(())
    }
}

/// Validates a directory entry name: byte-exact, no separators, no NUL,
/// bounded length. `.` and `..` are synthesized by the service and never
/// valid operation targets.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("empty name".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidArgument(format!("name too long: {} bytes", name.len())));
    }
    if name == "." || name == ".." {
        return Err(Error::InvalidArgument(format!("reserved name: {name}")));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(Error::InvalidArgument("name contains / or NUL".into()));
    }
    Ok(())
}

/// Joins a directory path and an entry name.
pub(crate) fn join_path(parent: &str, name: &str) -> Result<String> {
    let joined = if parent == "/" {
        format!("/{name}")
    } else {
        format!("{}/{name}", parent.trim_end_matches('/'))
    };
    if joined.len() > MAX_PATH_LEN {
        return Err(Error::InvalidArgument(format!("path too long: {} bytes", joined.len())));
    }
    Ok(joined)
}

/// Sticky-bit restriction on rename/unlink/rmdir: with the bit set on
/// the parent, only the child's owner, the parent's owner or root may
/// remove or rename the child.
pub(crate) fn check_sticky(
    parent: &FileEntry,
    child: &FileEntry,
    ctx: &CallerContext,
) -> Result<()> {
    if parent.mode & FileEntry::STICKY == 0 || ctx.is_root() {
        return Ok(());
    }
    if !ctx.anonymous && (ctx.uid == child.uid || ctx.uid == parent.uid) {
        return Ok(());
    }
    Err(Error::PermissionDenied)
}

/// Destroys an entry for good: drains its payload references, drops its
/// lock records and deletes the file record.
pub(crate) async fn purge_entry<T: WriteTx + ?Sized>(tx: &mut T, entry: &FileEntry) -> Result<()> {
    if entry.is_regular() && !entry.payload_id.is_empty() {
        payload::release_payload_tx(tx, &entry.payload_id).await?;
    }
    tx.delete_locks_by_file(entry.id).await?;
    tx.delete_file(entry.id).await
}
