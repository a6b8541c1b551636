//! Entry removal, including the unlink-while-open (silly-rename) state.

use futures::future::FutureExt;
use tracing::debug;

use crate::context::CallerContext;
use crate::entity::{FileHandle, FileId};
use crate::error::{Error, Result};
use crate::lock::DirectoryChangeKind;
use crate::metadata::access::{self, AccessMask};
use crate::metadata::{
    check_sticky, load_dir, purge_entry, require_writable, validate_name, MetadataService,
};

impl MetadataService {
    /// Unlinks a non-directory entry. When the link count falls to zero
    /// while an open handle remains, the record is retained: invisible
    /// to name lookup, still served by handle, destroyed when the last
    /// open handle is released.
    pub async fn remove_file(
        &self,
        ctx: &CallerContext,
        parent: &FileHandle,
        name: &str,
    ) -> Result<()> {
        ctx.check_cancelled()?;
        validate_name(name)?;
        let (share_name, _) = parent.decode()?;
        let open_files = self.open_files.clone();
        let dir_id = self
            .with_write(|tx| {
                let ctx = ctx.clone();
                let parent = parent.clone();
                let name = name.to_owned();
                let open_files = open_files.clone();
                async move {
                    let ctx = &ctx;
                    let name = name.as_str();
                    let (share, mut dir) = load_dir(tx, ctx, &parent).await?;
                    require_writable(&share)?;
                    access::require(&dir, ctx, AccessMask::WRITE | AccessMask::EXECUTE)?;
                    let child = tx.get_child(dir.id, name).await?;
                    let mut entry = tx.get_file(child).await?;
                    if entry.is_directory() {
                        return Err(Error::IsDirectory);
                    }
                    check_sticky(&dir, &entry, ctx)?;
                    tx.delete_child(dir.id, name).await?;
                    entry.nlink = entry.nlink.saturating_sub(1);
                    entry.touch_changed();
                    if entry.nlink == 0 {
                        let open =
                            open_files.get(&entry.id).map(|count| *count).unwrap_or(0);
                        if open > 0 {
                            debug!(file = %entry.id, "unlinked while open, retaining orphan");
                            tx.put_file(&entry).await?;
                            tx.set_link_count(entry.id, 0).await?;
                        } else {
                            purge_entry(tx, &entry).await?;
                        }
                    } else {
                        tx.put_file(&entry).await?;
                        tx.set_link_count(entry.id, entry.nlink).await?;
                    }
                    dir.touch_modified();
                    tx.put_file(&dir).await?;
                    Ok(dir.id)
                }
                .boxed()
            })
            .await?;
        self.lock_manager().notify_directory_change(dir_id, name, DirectoryChangeKind::Removed);
        self.invalidate_stats(&share_name).await;
        Ok(())
    }

    /// Removes an empty directory.
    pub async fn remove_dir(
        &self,
        ctx: &CallerContext,
        parent: &FileHandle,
        name: &str,
    ) -> Result<()> {
        ctx.check_cancelled()?;
        validate_name(name)?;
        let outcome = self
            .with_write(|tx| {
                let ctx = ctx.clone();
                let parent = parent.clone();
                let name = name.to_owned();
                async move {
                    let ctx = &ctx;
                    let name = name.as_str();
                    let (share, mut dir) = load_dir(tx, ctx, &parent).await?;
                    require_writable(&share)?;
                    access::require(&dir, ctx, AccessMask::WRITE | AccessMask::EXECUTE)?;
                    let child = tx.get_child(dir.id, name).await?;
                    let entry = tx.get_file(child).await?;
                    if !entry.is_directory() {
                        return Err(Error::NotDirectory);
                    }
                    check_sticky(&dir, &entry, ctx)?;
                    if !tx.list_children(child, None, 1).await?.is_empty() {
                        return Err(Error::NotEmpty);
                    }
                    tx.delete_child(dir.id, name).await?;
                    tx.delete_file(child).await?;
                    // The removed directory's `..` no longer references
                    // the parent.
                    dir.nlink = dir.nlink.saturating_sub(1);
                    dir.touch_modified();
                    tx.put_file(&dir).await?;
                    tx.set_link_count(dir.id, dir.nlink).await?;
                    Ok((dir.id, entry.share))
                }
                .boxed()
            })
            .await?;
        let (dir_id, share): (FileId, String) = outcome;
        self.lock_manager().notify_directory_change(dir_id, name, DirectoryChangeKind::Removed);
        self.invalidate_stats(&share).await;
        Ok(())
    }
}
