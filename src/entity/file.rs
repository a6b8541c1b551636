//! Defines the POSIX filesystem entry record --- [`FileEntry`].

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum length of names passed into metadata operations.
pub const MAX_NAME_LEN: usize = 255;

/// Maximum length of paths stored in file entries.
pub const MAX_PATH_LEN: usize = 4096;

/// 128-bit entry identifier, stable across rename.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct FileId(pub Uuid);

impl FileId {
    /// Mints a fresh identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Rebuilds an identifier from its 16-byte form. `None` when the
    /// slice has the wrong length.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        Uuid::from_slice(bytes).ok().map(Self)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Entry type. The discriminants are the on-disk tags used by the
/// relational backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, FromPrimitive)]
pub enum FileType {
    Regular = 0,
    Directory = 1,
    Symlink = 2,
    BlockDevice = 3,
    CharDevice = 4,
    Fifo = 5,
    Socket = 6,
}

/// Time of file metadata operations.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct FileTime {
    pub seconds: i64,
    pub nanos: u32,
}

impl FileTime {
    /// Current wall-clock time.
    pub fn now() -> Self {
        let elapsed = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        Self { seconds: elapsed.as_secs() as i64, nanos: elapsed.subsec_nanos() }
    }
}

/// Major and minor device pair for device nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub major: u32,
    pub minor: u32,
}

/// Whether an access-control entry grants or refuses its bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AclKind {
    Allow,
    Deny,
}

/// Who an access-control entry applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AclPrincipal {
    User(u32),
    Group(u32),
    Everyone,
}

/// One access-control entry. `perms` holds access mask bits; `flags`
/// holds inheritance flags (file-inherit, dir-inherit, inherit-only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclEntry {
    pub kind: AclKind,
    pub principal: AclPrincipal,
    pub perms: u32,
    pub flags: u32,
}

impl AclEntry {
    /// Entries inherited by created files.
    pub const FLAG_FILE_INHERIT: u32 = 0x1;
    /// Entries inherited by created directories.
    pub const FLAG_DIR_INHERIT: u32 = 0x2;
    /// Entry only exists to be inherited; ignored on this entry itself.
    pub const FLAG_INHERIT_ONLY: u32 = 0x4;
}

/// Ordered access-control list. Evaluation is first-match-wins per
/// requested bit; bits no entry covers fall back to the mode bits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Acl {
    pub entries: Vec<AclEntry>,
}

/// A POSIX filesystem entry.
///
/// `nlink == 0` is a valid state: it denotes an orphaned entry kept
/// reachable only by a still-open handle (the unlink-while-open case).
/// Such an entry is invisible to name lookup but remains retrievable by
/// handle until the last open handle is released.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub id: FileId,
    /// Share this entry belongs to.
    pub share: String,
    /// Absolute path within the share, `/`-rooted.
    pub path: String,
    pub file_type: FileType,
    /// 12-bit Unix permission plus setuid/setgid/sticky.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub nlink: u32,
    pub atime: FileTime,
    pub mtime: FileTime,
    pub ctime: FileTime,
    pub birthtime: FileTime,
    pub hidden: bool,
    /// Content identifier naming the external payload bytes. Present iff
    /// the entry is regular and non-empty content exists; empty
    /// otherwise.
    pub payload_id: String,
    /// Target string for symbolic links.
    pub symlink_target: Option<String>,
    /// Packed device numbers for block/character device nodes.
    pub device: Option<Device>,
    /// Optional access-control list.
    pub acl: Option<Acl>,
}

impl FileEntry {
    pub const SETUID: u32 = 0o4000;
    pub const SETGID: u32 = 0o2000;
    pub const STICKY: u32 = 0o1000;

    /// Fresh entry with current timestamps. Link count starts at 1 for
    /// non-directories and 2 for directories (self plus `.`).
    pub fn new(id: FileId, share: &str, path: &str, file_type: FileType, mode: u32) -> Self {
        let now = FileTime::now();
        Self {
            id,
            share: share.to_owned(),
            path: path.to_owned(),
            file_type,
            mode,
            uid: 0,
            gid: 0,
            size: 0,
            nlink: if file_type == FileType::Directory { 2 } else { 1 },
            atime: now,
            mtime: now,
            ctime: now,
            birthtime: now,
            hidden: false,
            payload_id: String::new(),
            symlink_target: None,
            device: None,
            acl: None,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.file_type == FileType::Directory
    }

    pub fn is_regular(&self) -> bool {
        self.file_type == FileType::Regular
    }

    /// Advances modify and change timestamps.
    pub fn touch_modified(&mut self) {
        let now = FileTime::now();
        self.mtime = now;
        self.ctime = now;
    }

    /// Advances the change timestamp only (attribute mutation).
    pub fn touch_changed(&mut self) {
        self.ctime = FileTime::now();
    }

    /// Drops setuid/setgid. Applied on writes and non-root ownership
    /// changes.
    pub fn clear_setid(&mut self) {
        self.mode &= !(Self::SETUID | Self::SETGID);
    }
}
