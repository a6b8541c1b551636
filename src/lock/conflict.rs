//! The single conflict predicate covering every lock pairing ---
//! [`conflicts_with`].
//!
//! All conflict checks operate on the unified lock view; protocols never
//! see each other's wire types. The predicate is symmetric:
//! `conflicts_with(a, b) == conflicts_with(b, a)` for every valid pair.

use crate::entity::{LockKind, LockMode, LockRecord, OplockLevel};

/// Tells whether two locks on the same file cannot coexist.
pub fn conflicts_with(a: &LockRecord, b: &LockRecord) -> bool {
    if a.file != b.file || a.owner == b.owner {
        return false;
    }
    match (&a.kind, &b.kind) {
        // Overlapping ranges with at least one exclusive side.
        (
            LockKind::ByteRange { range: range_a, mode: mode_a },
            LockKind::ByteRange { range: range_b, mode: mode_b },
        ) => {
            range_a.overlaps(range_b)
                && (*mode_a == LockMode::Exclusive || *mode_b == LockMode::Exclusive)
        }
        // A granted write cache excludes any other holder's cache.
        (LockKind::Oplock { level: level_a }, LockKind::Oplock { level: level_b }) => {
            (level_a.contains(OplockLevel::WRITE_CACHE) && !level_b.is_none())
                || (level_b.contains(OplockLevel::WRITE_CACHE) && !level_a.is_none())
        }
        // A cached view is invalidated by another owner's write.
        (LockKind::Oplock { level }, LockKind::ByteRange { mode, .. })
        | (LockKind::ByteRange { mode, .. }, LockKind::Oplock { level }) => {
            *mode == LockMode::Exclusive
                && (level.contains(OplockLevel::WRITE_CACHE)
                    || level.contains(OplockLevel::READ_CACHE))
        }
        // One side demands an access mode the other side denies.
        (
            LockKind::Reservation { access: access_a, deny: deny_a },
            LockKind::Reservation { access: access_b, deny: deny_b },
        ) => access_a.intersects(*deny_b) || access_b.intersects(*deny_a),
        // Reservations constrain open modes, not byte ranges or caches.
        _ => false,
    }
}
