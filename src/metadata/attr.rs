//! Attribute manipulation: chmod, chown, truncate, timestamps.

use futures::future::FutureExt;

use crate::context::CallerContext;
use crate::entity::{Acl, FileEntry, FileHandle, FileTime};
use crate::error::{Error, Result};
use crate::lock::DirectoryChangeKind;
use crate::metadata::access::{self, AccessMask};
use crate::metadata::{load_target, require_writable, MetadataService};
use crate::payload;

/// Strategy for updating a timestamp.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum SetTime {
    #[default]
    DontChange,
    /// Stamp with the server clock; needs write permission or ownership.
    ServerCurrent,
    /// Stamp with a client-provided time; needs ownership (or root).
    Client(FileTime),
}

/// Attribute modification. Unset fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct SetAttrs {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Truncate (or extend) to this size; regular files only.
    pub size: Option<u64>,
    pub atime: SetTime,
    pub mtime: SetTime,
    pub hidden: Option<bool>,
    /// Replace the access-control list (`Some(None)` clears it).
    pub acl: Option<Option<Acl>>,
}

impl MetadataService {
    /// Applies attribute changes with POSIX ownership rules:
    /// - mode changes need ownership (or root); a non-member setting
    ///   setgid has the bit silently cleared;
    /// - changing the owner uid is a privileged operation;
    /// - the owner may change the group only to one of their groups,
    ///   and a non-root chown clears setuid/setgid;
    /// - truncation needs write permission and clears setuid/setgid;
    /// - client-provided times need ownership, server-time stamping
    ///   needs ownership or write permission.
    pub async fn set_attr(
        &self,
        ctx: &CallerContext,
        handle: &FileHandle,
        changes: SetAttrs,
    ) -> Result<FileEntry> {
        ctx.check_cancelled()?;
        let (updated, released_payload) = self
            .with_write(|tx| {
                let ctx = ctx.clone();
                let handle = handle.clone();
                let changes = changes.clone();
                async move {
                    let ctx = &ctx;
                    let (share, mut entry) = load_target(tx, ctx, &handle).await?;
                    require_writable(&share)?;
                    let granted = access::evaluate(&entry, ctx);
                    let owner = ctx.is_root() || (!ctx.anonymous && ctx.uid == entry.uid);
                    let changes = &changes;
                    let mut released = false;

                    if let Some(mode) = changes.mode {
                        if !granted.contains(AccessMask::CHANGE_PERMS) {
                            return Err(Error::PermissionDenied);
                        }
                        if mode & !0o7777 != 0 {
                            return Err(Error::InvalidArgument(format!(
                                "mode {mode:o} exceeds 12 bits"
                            )));
                        }
                        let mut mode = mode;
                        if mode & FileEntry::SETGID != 0
                            && !ctx.is_root()
                            && !ctx.in_group(entry.gid)
                        {
                            mode &= !FileEntry::SETGID;
                        }
                        entry.mode = mode;
                    }

                    if let Some(uid) = changes.uid {
                        if uid != entry.uid {
                            if !ctx.is_root() {
                                return Err(Error::PrivilegeRequired);
                            }
                            entry.uid = uid;
                        }
                    }

                    if let Some(gid) = changes.gid {
                        if gid != entry.gid {
                            if !ctx.is_root() {
                                if !owner {
                                    return Err(Error::PermissionDenied);
                                }
                                if !ctx.in_group(gid) {
                                    return Err(Error::PermissionDenied);
                                }
                                entry.clear_setid();
                            }
                            entry.gid = gid;
                        }
                    }

                    if let Some(size) = changes.size {
                        if entry.is_directory() {
                            return Err(Error::IsDirectory);
                        }
                        if !entry.is_regular() {
                            return Err(Error::InvalidArgument(
                                "size applies to regular files".into(),
                            ));
                        }
                        if !owner {
                            access::require(&entry, ctx, AccessMask::WRITE)?;
                        }
                        if size != entry.size {
                            entry.size = size;
                            entry.clear_setid();
                            entry.touch_modified();
                            if size == 0 && !entry.payload_id.is_empty() {
                                payload::release_payload_tx(tx, &entry.payload_id).await?;
                                entry.payload_id = String::new();
                                released = true;
                            }
                        }
                    }

                    apply_time(&mut entry, changes.atime, TimeField::Access, ctx, owner, granted)?;
                    apply_time(&mut entry, changes.mtime, TimeField::Modify, ctx, owner, granted)?;

                    if let Some(hidden) = changes.hidden {
                        if !owner {
                            return Err(Error::PermissionDenied);
                        }
                        entry.hidden = hidden;
                    }

                    if let Some(acl) = &changes.acl {
                        if !granted.contains(AccessMask::CHANGE_PERMS) {
                            return Err(Error::PermissionDenied);
                        }
                        entry.acl = acl.clone();
                    }

                    entry.touch_changed();
                    tx.put_file(&entry).await?;
                    Ok((entry, released))
                }
                .boxed()
            })
            .await?;
        if released_payload {
            self.invalidate_stats(&updated.share).await;
        }
        self.notify_entry_modified(&updated).await;
        Ok(updated)
    }

    /// Emits a directory-change notification for an entry mutation,
    /// best-effort: an entry without a live parent edge (orphan, root)
    /// notifies nobody.
    pub(crate) async fn notify_entry_modified(&self, entry: &FileEntry) {
        let Ok(mut tx) = self.backend().begin_read().await else {
            return;
        };
        if let Ok(parent) = tx.get_parent(entry.id).await {
            let name = entry.path.rsplit('/').next().unwrap_or_default().to_owned();
            if !name.is_empty() {
                self.lock_manager().notify_directory_change(
                    parent,
                    &name,
                    DirectoryChangeKind::Modified,
                );
            }
        }
    }
}

enum TimeField {
    Access,
    Modify,
}

fn apply_time(
    entry: &mut FileEntry,
    strategy: SetTime,
    field: TimeField,
    ctx: &CallerContext,
    owner: bool,
    granted: AccessMask,
) -> Result<()> {
    let stamp = match strategy {
        SetTime::DontChange => return Ok(()),
        SetTime::ServerCurrent => {
            if !owner && !granted.contains(AccessMask::WRITE) {
                return Err(Error::PermissionDenied);
            }
            FileTime::now()
        }
        SetTime::Client(time) => {
            if !owner && !ctx.is_root() {
                return Err(Error::PermissionDenied);
            }
            time
        }
    };
    match field {
        TimeField::Access => entry.atime = stamp,
        TimeField::Modify => entry.mtime = stamp,
    }
    Ok(())
}
