//! Data model shared by the metadata service, the lock manager, the
//! payload index and the storage backends.
//!
//! Everything here is plain data: records hold identifiers, never
//! language-level references to other records. Relationships (parent,
//! directory children) are separate edges keyed by identifier.

pub mod file;
pub mod handle;
pub mod lock;
pub mod payload;
pub mod share;

pub use file::{Acl, AclEntry, AclKind, AclPrincipal, Device, FileEntry, FileId, FileTime, FileType};
pub use handle::{FileHandle, MAX_HANDLE_LEN};
pub use lock::{
    ByteRange, ClientId, LockDomain, LockId, LockKind, LockMode, LockQuery, LockRecord,
    NsmRegistration, OplockLevel, OwnerId, ShareAccess,
};
pub use payload::{BlockRecord, ChunkRecord, ContentHash, ObjectRecord, HASH_LEN};
pub use share::{Share, ShareOptions};
