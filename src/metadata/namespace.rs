//! Namespace operations: lookup, entry creation, hard links, directory
//! enumeration and symlink reading.

use futures::future::FutureExt;

use crate::context::CallerContext;
use crate::entity::{Acl, AclEntry, Device, FileEntry, FileHandle, FileId, FileType};
use crate::error::{Error, Result};
use crate::lock::DirectoryChangeKind;
use crate::metadata::access::{self, AccessMask};
use crate::metadata::{
    join_path, load_dir, load_entry, validate_name, require_writable, MetadataService,
};

/// Caller-requested attributes for entry creation. A zero mode means
/// "apply the default" (0755) for directories and is stored as given
/// otherwise. Explicit ownership is honoured only where the caller may
/// assign it.
#[derive(Debug, Clone, Default)]
pub struct CreateAttrs {
    pub mode: u32,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub hidden: bool,
}

/// One directory listing entry with inline attributes.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub entry: FileEntry,
}

/// One page of a stable directory enumeration. The cursor for the next
/// page is the last real entry name; enumeration resumes strictly after
/// it.
#[derive(Debug, Clone)]
pub struct DirPage {
    pub entries: Vec<DirEntry>,
    pub eof: bool,
}

/// Internal description of the entry a create-family operation builds.
#[derive(Clone)]
struct NewEntry {
    file_type: FileType,
    mode: u32,
    symlink_target: Option<String>,
    device: Option<Device>,
    size: u64,
}

/// Access-control entries a child inherits from its parent directory.
fn inherited_acl(parent: &FileEntry, directory: bool) -> Option<Acl> {
    let acl = parent.acl.as_ref()?;
    let wanted = if directory { AclEntry::FLAG_DIR_INHERIT } else { AclEntry::FLAG_FILE_INHERIT };
    let entries: Vec<AclEntry> = acl
        .entries
        .iter()
        .filter(|ace| ace.flags & wanted != 0)
        .map(|ace| AclEntry { flags: ace.flags & !AclEntry::FLAG_INHERIT_ONLY, ..*ace })
        .collect();
    if entries.is_empty() {
        None
    } else {
        Some(Acl { entries })
    }
}

impl MetadataService {
    /// Resolves `name` within a directory. Requires execute (lookup)
    /// permission on the parent; `.` and `..` are never valid targets.
    pub async fn lookup(
        &self,
        ctx: &CallerContext,
        parent: &FileHandle,
        name: &str,
    ) -> Result<FileEntry> {
        ctx.check_cancelled()?;
        validate_name(name)?;
        let mut tx = self.backend().begin_read().await?;
        let tx = tx.as_mut();
        let (_, dir) = load_dir(tx, ctx, parent).await?;
        access::require(&dir, ctx, AccessMask::EXECUTE)?;
        let child = tx.get_child(dir.id, name).await?;
        tx.get_file(child).await
    }

    /// Creates a regular file.
    pub async fn create(
        &self,
        ctx: &CallerContext,
        parent: &FileHandle,
        name: &str,
        attrs: CreateAttrs,
    ) -> Result<FileEntry> {
        let shape = NewEntry {
            file_type: FileType::Regular,
            mode: attrs.mode,
            symlink_target: None,
            device: None,
            size: 0,
        };
        self.create_entry(ctx, parent, name, attrs, shape).await
    }

    /// Creates a directory. A zero mode defaults to 0755.
    pub async fn make_dir(
        &self,
        ctx: &CallerContext,
        parent: &FileHandle,
        name: &str,
        attrs: CreateAttrs,
    ) -> Result<FileEntry> {
        let mode = if attrs.mode == 0 { 0o755 } else { attrs.mode };
        let shape = NewEntry {
            file_type: FileType::Directory,
            mode,
            symlink_target: None,
            device: None,
            size: 0,
        };
        self.create_entry(ctx, parent, name, attrs, shape).await
    }

    /// Creates a symbolic link to `target`.
    pub async fn make_symlink(
        &self,
        ctx: &CallerContext,
        parent: &FileHandle,
        name: &str,
        target: &str,
        attrs: CreateAttrs,
    ) -> Result<FileEntry> {
        if target.is_empty() || target.contains('\0') {
            return Err(Error::InvalidArgument("invalid symlink target".into()));
        }
        let mode = if attrs.mode == 0 { 0o777 } else { attrs.mode };
        let shape = NewEntry {
            file_type: FileType::Symlink,
            mode,
            symlink_target: Some(target.to_owned()),
            device: None,
            size: target.len() as u64,
        };
        self.create_entry(ctx, parent, name, attrs, shape).await
    }

    /// Creates a device node, FIFO or socket. Block and character nodes
    /// carry (major, minor); the other kinds must not.
    pub async fn make_node(
        &self,
        ctx: &CallerContext,
        parent: &FileHandle,
        name: &str,
        file_type: FileType,
        device: Option<Device>,
        attrs: CreateAttrs,
    ) -> Result<FileEntry> {
        match file_type {
            FileType::BlockDevice | FileType::CharDevice => {
                if device.is_none() {
                    return Err(Error::InvalidArgument("device node needs (major, minor)".into()));
                }
            }
            FileType::Fifo | FileType::Socket => {
                if device.is_some() {
                    return Err(Error::InvalidArgument(format!(
                        "{file_type:?} carries no device numbers"
                    )));
                }
            }
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "make_node cannot create {file_type:?}"
                )))
            }
        }
        let shape = NewEntry {
            file_type,
            mode: attrs.mode,
            symlink_target: None,
            device,
            size: 0,
        };
        self.create_entry(ctx, parent, name, attrs, shape).await
    }

    async fn create_entry(
        &self,
        ctx: &CallerContext,
        parent: &FileHandle,
        name: &str,
        attrs: CreateAttrs,
        shape: NewEntry,
    ) -> Result<FileEntry> {
        ctx.check_cancelled()?;
        validate_name(name)?;
        let (share_name, _) = parent.decode()?;
        // Fresh identity minted once; a retried transaction keeps it.
        let (id, _) = self.backend().generate_handle(&share_name)?;
        let created = self
            .with_write(|tx| {
                let ctx = ctx.clone();
                let parent = parent.clone();
                let name = name.to_owned();
                let shape = shape.clone();
                let attrs = attrs.clone();
                async move {
                    let ctx = &ctx;
                    let name = name.as_str();
                    let shape = &shape;
                    let attrs = &attrs;
                    let (share, mut dir) = load_dir(tx, ctx, &parent).await?;
                    require_writable(&share)?;
                    access::require(&dir, ctx, AccessMask::WRITE | AccessMask::EXECUTE)?;
                    match tx.get_child(dir.id, name).await {
                        Ok(_) => return Err(Error::AlreadyExists),
                        Err(Error::NotFound) => {}
                        Err(e) => return Err(e),
                    }
                    let path = join_path(&dir.path, name)?;
                    let mut entry =
                        FileEntry::new(id, &share.name, &path, shape.file_type, shape.mode);
                    entry.size = shape.size;
                    entry.symlink_target = shape.symlink_target.clone();
                    entry.device = shape.device;
                    entry.hidden = attrs.hidden;
                    apply_ownership(&mut entry, &dir, ctx, attrs)?;
                    entry.acl = inherited_acl(&dir, entry.is_directory());
                    tx.put_file(&entry).await?;
                    tx.set_child(dir.id, name, id).await?;
                    tx.set_parent(id, dir.id).await?;
                    tx.set_link_count(id, entry.nlink).await?;
                    dir.touch_modified();
                    if entry.is_directory() {
                        dir.nlink += 1;
                        tx.set_link_count(dir.id, dir.nlink).await?;
                    }
                    tx.put_file(&dir).await?;
                    Ok((dir.id, entry))
                }
                .boxed()
            })
            .await?;
        let (dir_id, entry) = created;
        self.lock_manager().notify_directory_change(dir_id, name, DirectoryChangeKind::Added);
        self.invalidate_stats(&entry.share).await;
        Ok(entry)
    }

    /// Adds a new directory edge to an existing regular entry and bumps
    /// its link count. Directories cannot be hard-linked.
    pub async fn hard_link(
        &self,
        ctx: &CallerContext,
        target: &FileHandle,
        parent: &FileHandle,
        name: &str,
    ) -> Result<FileEntry> {
        ctx.check_cancelled()?;
        validate_name(name)?;
        let (target_share, target_id) = target.decode()?;
        let (parent_share, _) = parent.decode()?;
        if target_share != parent_share {
            return Err(Error::InvalidArgument("cross-share hard link".into()));
        }
        let linked = self
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
                    let mut entry = load_entry(tx, target_id).await?;
                    if entry.is_directory() {
                        return Err(Error::IsDirectory);
                    }
                    match tx.get_child(dir.id, name).await {
                        Ok(_) => return Err(Error::AlreadyExists),
                        Err(Error::NotFound) => {}
                        Err(e) => return Err(e),
                    }
                    entry.nlink += 1;
                    entry.touch_changed();
                    tx.put_file(&entry).await?;
                    tx.set_link_count(entry.id, entry.nlink).await?;
                    tx.set_child(dir.id, name, entry.id).await?;
                    dir.touch_modified();
                    tx.put_file(&dir).await?;
                    Ok((dir.id, entry))
                }
                .boxed()
            })
            .await?;
        let (dir_id, entry) = linked;
        self.lock_manager().notify_directory_change(dir_id, name, DirectoryChangeKind::Added);
        Ok(entry)
    }

    /// Paginated stable enumeration in byte-ordered name sequence.
    /// A `None` cursor starts from the beginning and synthesizes the
    /// `.` and `..` entries; they are never stored.
    pub async fn list_children(
        &self,
        ctx: &CallerContext,
        dir_handle: &FileHandle,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<DirPage> {
        ctx.check_cancelled()?;
        if limit == 0 {
            return Err(Error::InvalidArgument("zero listing limit".into()));
        }
        let mut tx = self.backend().begin_read().await?;
        let tx = tx.as_mut();
        let (_, dir) = load_dir(tx, ctx, dir_handle).await?;
        access::require(&dir, ctx, AccessMask::READ)?;
        let mut entries = Vec::new();
        if cursor.is_none() {
            entries.push(DirEntry { name: ".".to_owned(), entry: dir.clone() });
            let parent = match tx.get_parent(dir.id).await {
                Ok(parent) => load_entry(tx, parent).await?,
                // The share root is its own parent.
                Err(Error::NotFound) => dir.clone(),
                Err(e) => return Err(e),
            };
            entries.push(DirEntry { name: "..".to_owned(), entry: parent });
        }
        let names = tx.list_children(dir.id, cursor, limit + 1).await?;
        let eof = names.len() <= limit;
        for (name, child) in names.into_iter().take(limit) {
            let entry = tx.get_file(child).await?;
            entries.push(DirEntry { name, entry });
        }
        Ok(DirPage { entries, eof })
    }

    /// Target string of a symbolic link.
    pub async fn read_link(&self, ctx: &CallerContext, handle: &FileHandle) -> Result<String> {
        let entry = self.get_attr(ctx, handle).await?;
        entry
            .symlink_target
            .ok_or_else(|| Error::InvalidArgument("not a symbolic link".into()))
    }
}

/// Applies creation-time ownership: the caller's identity by default, a
/// setgid parent propagating its group, explicit overrides only where
/// permitted.
fn apply_ownership(
    entry: &mut FileEntry,
    dir: &FileEntry,
    ctx: &CallerContext,
    attrs: &CreateAttrs,
) -> Result<()> {
    let default_uid = if ctx.anonymous { u32::MAX } else { ctx.uid };
    let setgid_dir = dir.mode & FileEntry::SETGID != 0;
    let default_gid = if setgid_dir {
        dir.gid
    } else if ctx.anonymous {
        u32::MAX
    } else {
        ctx.gid
    };
    entry.uid = match attrs.uid {
        Some(uid) if uid != default_uid && !ctx.is_root() => {
            return Err(Error::PermissionDenied)
        }
        Some(uid) => uid,
        None => default_uid,
    };
    entry.gid = match attrs.gid {
        Some(gid) if gid != default_gid && !ctx.is_root() && !ctx.in_group(gid) => {
            return Err(Error::PermissionDenied)
        }
        Some(gid) => gid,
        None => default_gid,
    };
    // A setgid directory marks created subdirectories setgid as well.
    if setgid_dir && entry.is_directory() {
        entry.mode |= FileEntry::SETGID;
    }
    Ok(())
}
