//! Defines the unified lock record --- [`LockRecord`].
//!
//! Protocols translate their semantics at the boundary: NLM and SMB
//! byte-range locks share one representation, SMB leases and NFSv4
//! delegations share the oplock representation, and SMB share-access /
//! NFSv4 `OPEN4_SHARE_DENY` share the access-mode reservation. The lock
//! manager and the conflict predicate only ever see these records.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::file::{FileId, FileTime};

/// Lock identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockId(pub Uuid);

impl LockId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        Uuid::from_slice(bytes).ok().map(Self)
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque owner key: an NLM (pid, host) pair, an NFSv4 owner, or an SMB
/// lease key, flattened by the adapter into a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub String);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client session identifier, shared by every lock of one client. Used
/// for client-scoped cleanup and grace reclaim matching.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub String);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Protocol domain a lock was acquired through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockDomain {
    Nlm,
    Nfs4,
    Smb,
}

/// Half-open byte interval `[offset, offset + length)`. A length of
/// [`ByteRange::TO_EOF`] covers everything from `offset` onward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    /// Length value meaning "to end of file".
    pub const TO_EOF: u64 = u64::MAX;

    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Exclusive end of the range, saturating for to-EOF ranges.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    pub fn overlaps(&self, other: &ByteRange) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

/// Byte-range lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Oplock / lease state: a mask over the caching promises the server
/// granted to the holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct OplockLevel(pub u32);

impl OplockLevel {
    /// Holder may cache reads.
    pub const READ_CACHE: u32 = 0x1;
    /// Holder may cache writes; excludes every other caller's cache.
    pub const WRITE_CACHE: u32 = 0x2;
    /// Holder may cache the open handle.
    pub const HANDLE_CACHE: u32 = 0x4;

    pub const NONE: OplockLevel = OplockLevel(0);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, flag: u32) -> bool {
        self.0 & flag == flag
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Access-mode reservation mask (share reservation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ShareAccess(pub u32);

impl ShareAccess {
    pub const READ: u32 = 0x1;
    pub const WRITE: u32 = 0x2;
    pub const DELETE: u32 = 0x4;

    pub const NONE: ShareAccess = ShareAccess(0);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn intersects(self, other: ShareAccess) -> bool {
        self.0 & other.0 != 0
    }
}

/// The three lock shapes the unified manager understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockKind {
    /// Advisory byte-range lock.
    ByteRange { range: ByteRange, mode: LockMode },
    /// Oplock / lease / delegation.
    Oplock { level: OplockLevel },
    /// Access-mode reservation: what the holder does with the handle and
    /// what it denies to others.
    Reservation { access: ShareAccess, deny: ShareAccess },
}

/// One lock as the manager and the backends see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub id: LockId,
    pub file: FileId,
    pub owner: OwnerId,
    pub client: ClientId,
    pub domain: LockDomain,
    pub kind: LockKind,
    /// Server epoch at acquisition; distinguishes pre-restart locks
    /// during grace-period reclaim.
    pub epoch: u64,
    pub acquired_at: FileTime,
    /// Whether the lock must survive a process restart. Persisted locks
    /// are written through to the backend; ephemeral locks live only in
    /// the manager.
    pub persist: bool,
}

impl LockRecord {
    pub fn new(
        file: FileId,
        owner: OwnerId,
        client: ClientId,
        domain: LockDomain,
        kind: LockKind,
    ) -> Self {
        Self {
            id: LockId::generate(),
            file,
            owner,
            client,
            domain,
            kind,
            epoch: 0,
            acquired_at: FileTime::now(),
            persist: false,
        }
    }

    pub fn persistent(mut self) -> Self {
        self.persist = true;
        self
    }

    pub fn with_epoch(mut self, epoch: u64) -> Self {
        self.epoch = epoch;
        self
    }
}

/// Filter for [`list_locks`](crate::backend::ReadTx::list_locks). Unset
/// fields match everything.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LockQuery {
    pub file: Option<FileId>,
    pub owner: Option<OwnerId>,
    pub client: Option<ClientId>,
}

impl LockQuery {
    pub fn matches(&self, record: &LockRecord) -> bool {
        self.file.map_or(true, |f| f == record.file)
            && self.owner.as_ref().map_or(true, |o| *o == record.owner)
            && self.client.as_ref().map_or(true, |c| *c == record.client)
    }
}

/// Monitored-peer registration for NFSv3 crash recovery (NSM). The core
/// stores the registry; the adapter drives the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NsmRegistration {
    pub client: ClientId,
    /// Host the peer asked us to watch.
    pub monitored_host: String,
    /// Where the peer's status daemon listens for notifications.
    pub callback_addr: String,
    /// Opaque data echoed back in notifications.
    pub private_data: Vec<u8>,
    /// Server epoch at registration.
    pub epoch: u64,
}
