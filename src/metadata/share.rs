//! Share lifecycle: creation with idempotent root, option updates,
//! listing and deletion.

use futures::future::FutureExt;
use tracing::debug;

use crate::context::CallerContext;
use crate::entity::{FileHandle, FileId, Share, ShareOptions};
use crate::error::{Error, Result};
use crate::metadata::MetadataService;

/// Root directory attributes requested at share creation.
#[derive(Debug, Clone, Copy)]
pub struct RootAttrs {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

impl Default for RootAttrs {
    fn default() -> Self {
        Self { mode: 0o755, uid: 0, gid: 0 }
    }
}

impl MetadataService {
    /// Creates a share, or converges an existing one: options are
    /// replaced and root attribute drift (mode/uid/gid) is reconciled
    /// in favour of this request. The root directory entry is created
    /// idempotently.
    pub async fn create_share(
        &self,
        ctx: &CallerContext,
        name: &str,
        options: ShareOptions,
        root: RootAttrs,
    ) -> Result<Share> {
        ctx.check_cancelled()?;
        validate_share_name(name)?;
        let fresh_root = FileId::generate();
        let options = &options;
        let share = self
            .with_write(|tx| {
                async move {
                    let share = match tx.get_share(name).await {
                        Ok(mut existing) => {
                            existing.options = options.clone();
                            tx.update_share_options(name, options).await?;
                            existing
                        }
                        Err(Error::NotFound) => {
                            let share = Share::new(name, options.clone(), fresh_root);
                            tx.create_share(&share).await?;
                            share
                        }
                        Err(e) => return Err(e),
                    };
                    tx.create_root_directory(name, root.mode, root.uid, root.gid).await?;
                    Ok(share)
                }
                .boxed()
            })
            .await?;
        debug!(share = name, "share ready");
        Ok(share)
    }

    /// Replaces a share's mutable options.
    pub async fn update_share(
        &self,
        ctx: &CallerContext,
        name: &str,
        options: ShareOptions,
    ) -> Result<Share> {
        ctx.check_cancelled()?;
        let options = &options;
        self.with_write(|tx| {
            async move {
                tx.update_share_options(name, options).await?;
                tx.get_share(name).await
            }
            .boxed()
        })
        .await
    }

    /// Deletes a share whose namespace has been emptied. A share still
    /// holding entries under its root is refused.
    pub async fn delete_share(&self, ctx: &CallerContext, name: &str) -> Result<()> {
        ctx.check_cancelled()?;
        self.with_write(|tx| {
            async move {
                let share = tx.get_share(name).await?;
                match tx.list_children(share.root, None, 1).await {
                    Ok(children) if !children.is_empty() => return Err(Error::NotEmpty),
                    Ok(_) | Err(Error::NotFound) => {}
                    Err(e) => return Err(e),
                }
                match tx.delete_file(share.root).await {
                    Ok(()) | Err(Error::NotFound) => {}
                    Err(e) => return Err(e),
                }
                tx.delete_share(name).await
            }
            .boxed()
        })
        .await?;
        self.invalidate_stats(name).await;
        Ok(())
    }

    pub async fn get_share(&self, ctx: &CallerContext, name: &str) -> Result<Share> {
        ctx.check_cancelled()?;
        self.backend().begin_read().await?.get_share(name).await
    }

    pub async fn list_shares(&self, ctx: &CallerContext) -> Result<Vec<Share>> {
        ctx.check_cancelled()?;
        self.backend().begin_read().await?.list_shares().await
    }

    /// Handle of a share's root directory; the mount-time entry point
    /// for every adapter.
    pub async fn root_handle(&self, ctx: &CallerContext, name: &str) -> Result<FileHandle> {
        let share = self.get_share(ctx, name).await?;
        FileHandle::encode(&share.name, share.root)
    }
}

fn validate_share_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 46 {
        return Err(Error::InvalidArgument("share name must be 1..=46 bytes".into()));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(Error::InvalidArgument("share name contains / or NUL".into()));
    }
    Ok(())
}
