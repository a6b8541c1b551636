//! Typed lock-manager events and the dispatcher that hands them to the
//! adapter sink --- [`LockEvent`], [`CallbackTask`].
//!
//! Operations emit into an unbounded in-process queue while holding lock
//! state; a dedicated dispatcher task forwards into the adapter-provided
//! bounded sink outside any lock, so a slow adapter can never deadlock
//! the manager. When the sink is full the event is dropped and counted;
//! the adapter owns buffering and wire dispatch.

use tokio::sync::mpsc;
use tracing::warn;

use crate::entity::{FileId, LockId, OplockLevel, OwnerId};

/// What changed in a watched directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryChangeKind {
    Added,
    Removed,
    Renamed,
    Modified,
}

/// Events the core pushes to protocol adapters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockEvent {
    /// A previously blocked acquisition was granted.
    Granted { file: FileId, lock: LockId, owner: OwnerId },
    /// The holder must downgrade its oplock to `to` and acknowledge.
    Break { file: FileId, owner: OwnerId, to: OplockLevel },
    /// The holder's oplock or lock was revoked (break timeout, client
    /// cleanup, post-grace sweep).
    Revoke { file: FileId, owner: OwnerId },
    /// An NFSv4 delegation must be returned.
    Recall { file: FileId, owner: OwnerId },
    /// A directory entry changed; SMB change-notify feeds from this.
    DirectoryChange { dir: FileId, name: String, change: DirectoryChangeKind },
}

/// Dispatcher task pumping the internal queue into the adapter sink.
pub struct CallbackTask;

impl CallbackTask {
    pub(crate) fn spawn(
        mut queue: mpsc::UnboundedReceiver<LockEvent>,
        sink: async_channel::Sender<LockEvent>,
    ) {
        tokio::spawn(async move {
            let mut dropped: u64 = 0;
            while let Some(event) = queue.recv().await {
                match sink.try_send(event) {
                    Ok(()) => {}
                    Err(async_channel::TrySendError::Full(event)) => {
                        dropped += 1;
                        warn!(?event, dropped, "adapter event sink full, dropping event");
                    }
                    Err(async_channel::TrySendError::Closed(_)) => break,
                }
            }
        });
    }
}
