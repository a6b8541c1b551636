//! Atomic rename/replace with transitive path maintenance.

use futures::future::FutureExt;
use tracing::debug;

use crate::backend::{ReadTx, WriteTx};
use crate::context::CallerContext;
use crate::entity::{FileHandle, FileId};
use crate::error::{Error, Result};
use crate::lock::DirectoryChangeKind;
use crate::metadata::access::{self, AccessMask};
use crate::metadata::{
    check_sticky, join_path, load_dir, purge_entry, require_writable, validate_name,
    MetadataService,
};

impl MetadataService {
    /// Moves `src_name` in `src_dir` to `dst_name` in `dst_dir`,
    /// atomically replacing a compatible existing destination:
    /// - a directory cannot replace a file and vice versa;
    /// - a replaced directory must be empty;
    /// - a replaced file's link count decrements, entering the
    ///   unlink-while-open state when handles remain;
    /// - cross-directory moves of a directory require the caller to own
    ///   it (or root), and a directory can never move under itself;
    /// - the sticky bit on either parent restricts who may move or
    ///   replace;
    /// - the moved entry keeps its identifier and handle, and every
    ///   descendant path is rewritten in the same transaction.
    pub async fn rename(
        &self,
        ctx: &CallerContext,
        src_dir: &FileHandle,
        src_name: &str,
        dst_dir: &FileHandle,
        dst_name: &str,
    ) -> Result<()> {
        ctx.check_cancelled()?;
        validate_name(src_name)?;
        validate_name(dst_name)?;
        let (src_share, src_dir_id) = src_dir.decode()?;
        let (dst_share, dst_dir_id) = dst_dir.decode()?;
        if src_share != dst_share {
            return Err(Error::InvalidArgument("cross-share rename".into()));
        }
        let same_dir = src_dir_id == dst_dir_id;
        let open_files = self.open_files.clone();
        let changed = self
            .with_write(|tx| {
                let ctx = ctx.clone();
                let src_dir = src_dir.clone();
                let dst_dir = dst_dir.clone();
                let src_name = src_name.to_owned();
                let dst_name = dst_name.to_owned();
                let open_files = open_files.clone();
                async move {
                    let ctx = &ctx;
                    let src_name = src_name.as_str();
                    let dst_name = dst_name.as_str();
                    let (share, mut from) = load_dir(tx, ctx, &src_dir).await?;
                    require_writable(&share)?;
                    access::require(&from, ctx, AccessMask::WRITE | AccessMask::EXECUTE)?;
                    let mut to = if same_dir {
                        None
                    } else {
                        let (_, to) = load_dir(tx, ctx, &dst_dir).await?;
                        access::require(&to, ctx, AccessMask::WRITE | AccessMask::EXECUTE)?;
                        Some(to)
                    };

                    let moved_id = tx.get_child(from.id, src_name).await?;
                    let mut moved = tx.get_file(moved_id).await?;
                    if same_dir && src_name == dst_name {
                        return Ok(false);
                    }
                    check_sticky(&from, &moved, ctx)?;
                    if moved.is_directory() && !same_dir {
                        if !(ctx.is_root() || (!ctx.anonymous && ctx.uid == moved.uid)) {
                            return Err(Error::PermissionDenied);
                        }
                        if is_ancestor(tx, moved_id, dst_dir_id).await? {
                            return Err(Error::InvalidArgument(
                                "cannot move a directory under itself".into(),
                            ));
                        }
                    }

                    let target_parent = to.as_ref().unwrap_or(&from);
                    match tx.get_child(target_parent.id, dst_name).await {
                        Ok(existing_id) if existing_id == moved_id => {
                            // Both names alias the same entry; rename is
                            // a no-op by POSIX.
                            return Ok(false);
                        }
                        Ok(existing_id) => {
                            let existing = tx.get_file(existing_id).await?;
                            check_sticky(target_parent, &existing, ctx)?;
                            if existing.is_directory() && !moved.is_directory() {
                                return Err(Error::IsDirectory);
                            }
                            if !existing.is_directory() && moved.is_directory() {
                                return Err(Error::NotDirectory);
                            }
                            if existing.is_directory() {
                                if !tx.list_children(existing_id, None, 1).await?.is_empty() {
                                    return Err(Error::NotEmpty);
                                }
                                tx.delete_file(existing_id).await?;
                                match &mut to {
                                    Some(to) => to.nlink = to.nlink.saturating_sub(1),
                                    None => from.nlink = from.nlink.saturating_sub(1),
                                }
                            } else {
                                let mut existing = existing;
                                existing.nlink = existing.nlink.saturating_sub(1);
                                existing.touch_changed();
                                if existing.nlink == 0 {
                                    let open = open_files
                                        .get(&existing_id)
                                        .map(|count| *count)
                                        .unwrap_or(0);
                                    if open > 0 {
                                        debug!(file = %existing_id, "replaced while open, retaining orphan");
                                        tx.put_file(&existing).await?;
                                        tx.set_link_count(existing_id, 0).await?;
                                    } else {
                                        purge_entry(tx, &existing).await?;
                                    }
                                } else {
                                    tx.put_file(&existing).await?;
                                    tx.set_link_count(existing_id, existing.nlink).await?;
                                }
                            }
                        }
                        Err(Error::NotFound) => {}
                        Err(e) => return Err(e),
                    }

                    tx.delete_child(from.id, src_name).await?;
                    let target_parent_id = to.as_ref().map(|d| d.id).unwrap_or(from.id);
                    tx.set_child(target_parent_id, dst_name, moved_id).await?;
                    tx.set_parent(moved_id, target_parent_id).await?;

                    if moved.is_directory() {
                        if let Some(to) = &mut to {
                            // The moved directory's `..` now references
                            // the new parent.
                            from.nlink = from.nlink.saturating_sub(1);
                            to.nlink += 1;
                        }
                    }

                    let base = to.as_ref().map(|d| d.path.clone()).unwrap_or_else(|| from.path.clone());
                    moved.path = join_path(&base, dst_name)?;
                    moved.touch_changed();
                    tx.put_file(&moved).await?;
                    if moved.is_directory() {
                        rewrite_descendant_paths(tx, moved_id, &moved.path).await?;
                    }

                    from.touch_modified();
                    tx.put_file(&from).await?;
                    tx.set_link_count(from.id, from.nlink).await?;
                    if let Some(mut to) = to {
                        to.touch_modified();
                        tx.put_file(&to).await?;
                        tx.set_link_count(to.id, to.nlink).await?;
                    }
                    Ok(true)
                }
                .boxed()
            })
            .await?;
        if changed {
            self.lock_manager().notify_directory_change(
                src_dir_id,
                src_name,
                DirectoryChangeKind::Renamed,
            );
            if !same_dir {
                self.lock_manager().notify_directory_change(
                    dst_dir_id,
                    dst_name,
                    DirectoryChangeKind::Renamed,
                );
            }
        }
        Ok(())
    }
}

/// Walks parent edges upward from `node` looking for `candidate`.
async fn is_ancestor<T: ReadTx + ?Sized>(
    tx: &mut T,
    candidate: FileId,
    mut node: FileId,
) -> Result<bool> {
    loop {
        if node == candidate {
            return Ok(true);
        }
        match tx.get_parent(node).await {
            Ok(parent) if parent == node => return Ok(false),
            Ok(parent) => node = parent,
            Err(Error::NotFound) => return Ok(false),
            Err(e) => return Err(e),
        }
    }
}

/// Rewrites the stored path of every descendant after a directory move,
/// page by page, within the caller's transaction.
async fn rewrite_descendant_paths<T: WriteTx + ?Sized>(
    tx: &mut T,
    root: FileId,
    root_path: &str,
) -> Result<()> {
    let mut stack = vec![(root, root_path.to_owned())];
    while let Some((dir, dir_path)) = stack.pop() {
        let mut cursor: Option<String> = None;
        loop {
            let page = tx.list_children(dir, cursor.as_deref(), 256).await?;
            let Some((last, _)) = page.last() else {
                break;
            };
            cursor = Some(last.clone());
            for (name, child) in page {
                let mut entry = tx.get_file(child).await?;
                entry.path = join_path(&dir_path, &name)?;
                tx.put_file(&entry).await?;
                if entry.is_directory() {
                    stack.push((child, entry.path.clone()));
                }
            }
        }
    }
    Ok(())
}
