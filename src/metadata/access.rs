//! Permission evaluation --- [`AccessMask`], [`evaluate`].
//!
//! A uniform function maps (file attributes, caller identity, requested
//! mask) to the granted mask. Advisory queries return the intersection;
//! enforcement callsites fail with permission-denied when the requested
//! mask is not a subset of the granted mask. Privilege-required is
//! distinct and reserved for operations no unprivileged user may
//! perform.

use crate::context::CallerContext;
use crate::entity::{AclEntry, AclKind, AclPrincipal, FileEntry};
use crate::error::{Error, Result};

/// Mask of access rights.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct AccessMask(u32);

impl AccessMask {
    pub const READ: u32 = 0x01;
    pub const WRITE: u32 = 0x02;
    /// Execute for regular files, lookup for directories.
    pub const EXECUTE: u32 = 0x04;
    pub const DELETE: u32 = 0x08;
    pub const CHANGE_PERMS: u32 = 0x10;
    pub const CHANGE_OWNER: u32 = 0x20;

    pub const ALL: u32 = Self::READ
        | Self::WRITE
        | Self::EXECUTE
        | Self::DELETE
        | Self::CHANGE_PERMS
        | Self::CHANGE_OWNER;

    pub fn new(bits: u32) -> Self {
        Self(bits & Self::ALL)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, flags: u32) -> bool {
        self.0 & flags == flags
    }

    pub fn intersect(self, other: AccessMask) -> AccessMask {
        AccessMask(self.0 & other.0)
    }

    pub fn is_superset_of(self, other: AccessMask) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Maps one rwx permission triplet (already shifted to the low three
/// bits) onto the access mask. Write implies delete of content, not of
/// directory entries; entry removal rights come from the parent.
fn class_bits(triplet: u32) -> u32 {
    let mut bits = 0;
    if triplet & 0o4 != 0 {
        bits |= AccessMask::READ;
    }
    if triplet & 0o2 != 0 {
        bits |= AccessMask::WRITE | AccessMask::DELETE;
    }
    if triplet & 0o1 != 0 {
        bits |= AccessMask::EXECUTE;
    }
    bits
}

fn ace_applies(ace: &AclEntry, ctx: &CallerContext) -> bool {
    if ace.flags & AclEntry::FLAG_INHERIT_ONLY != 0 {
        return false;
    }
    match ace.principal {
        AclPrincipal::Everyone => true,
        AclPrincipal::User(uid) => !ctx.anonymous && ctx.uid == uid,
        AclPrincipal::Group(gid) => ctx.in_group(gid),
    }
}

/// Full granted mask for a caller on an entry.
///
/// Evaluation order: absent identity uses world bits only; root is
/// all-granted; the owner uses owner bits plus change-permissions and
/// change-ownership; group membership uses group bits; everyone else
/// uses world bits. An access-control list, when present, decides the
/// bits it covers first-match-wins; uncovered bits fall back to the
/// mode classes.
pub fn evaluate(entry: &FileEntry, ctx: &CallerContext) -> AccessMask {
    if ctx.anonymous {
        return AccessMask::new(class_bits(entry.mode & 0o7));
    }
    if ctx.is_root() {
        return AccessMask::new(AccessMask::ALL);
    }
    let mode_class = if ctx.uid == entry.uid {
        class_bits((entry.mode >> 6) & 0o7)
    } else if ctx.in_group(entry.gid) {
        class_bits((entry.mode >> 3) & 0o7)
    } else {
        class_bits(entry.mode & 0o7)
    };
    let mut granted = match &entry.acl {
        None => mode_class,
        Some(acl) => {
            let mut allowed = 0u32;
            let mut decided = 0u32;
            for ace in &acl.entries {
                if !ace_applies(ace, ctx) {
                    continue;
                }
                let fresh = ace.perms & AccessMask::ALL & !decided;
                if ace.kind == AclKind::Allow {
                    allowed |= fresh;
                }
                decided |= fresh;
            }
            allowed | (mode_class & !decided)
        }
    };
    if ctx.uid == entry.uid {
        granted |= AccessMask::CHANGE_PERMS | AccessMask::CHANGE_OWNER;
    }
    AccessMask::new(granted)
}

/// Advisory query: granted subset of the requested mask. Never fails
/// for denial.
pub fn granted(entry: &FileEntry, ctx: &CallerContext, requested: AccessMask) -> AccessMask {
    evaluate(entry, ctx).intersect(requested)
}

/// Enforcement: the full requested mask must be granted.
pub fn require(entry: &FileEntry, ctx: &CallerContext, requested: u32) -> Result<()> {
    let requested = AccessMask::new(requested);
    if evaluate(entry, ctx).is_superset_of(requested) {
        Ok(())
    } else {
        Err(Error::PermissionDenied)
    }
}
