//! Server-restart grace period state machine --- [`GraceCoordinator`].
//!
//! A small coordinator shared across protocol adapters. Reclaims are
//! accepted in any state; fresh acquisitions only once serving. Grace
//! ends when the configured window elapses or every registered client
//! has signalled reclaim completion, whichever comes first.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::debug;

use crate::entity::ClientId;

/// Lifecycle phase of the server with respect to lock recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GracePhase {
    /// Process is starting; no requests served yet.
    Starting,
    /// Only reclaims accepted while prior-epoch holders re-establish
    /// their locks.
    Grace,
    /// Normal operation.
    Serving,
}

struct Inner {
    phase: GracePhase,
    registered: HashSet<ClientId>,
    completed: HashSet<ClientId>,
    entered_at: Option<Instant>,
}

/// Shared grace state machine. One instance per metadata service.
pub struct GraceCoordinator {
    window: Duration,
    inner: Mutex<Inner>,
    serving: Notify,
}

impl GraceCoordinator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            inner: Mutex::new(Inner {
                phase: GracePhase::Starting,
                registered: HashSet::new(),
                completed: HashSet::new(),
                entered_at: None,
            }),
            serving: Notify::new(),
        }
    }

    pub fn phase(&self) -> GracePhase {
        self.inner.lock().expect("grace state poisoned").phase
    }

    /// Configured grace window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Starting -> Serving directly, for a start with nothing to
    /// reclaim.
    pub fn begin_serving(&self) {
        let mut inner = self.inner.lock().expect("grace state poisoned");
        inner.phase = GracePhase::Serving;
        drop(inner);
        self.serving.notify_waiters();
    }

    /// Starting -> Grace with the set of clients expected to reclaim.
    pub fn enter_grace(&self, registered: impl IntoIterator<Item = ClientId>) {
        let mut inner = self.inner.lock().expect("grace state poisoned");
        inner.registered = registered.into_iter().collect();
        inner.completed.clear();
        inner.phase = GracePhase::Grace;
        inner.entered_at = Some(Instant::now());
        debug!(clients = inner.registered.len(), "entered grace period");
    }

    /// Records one client's reclaim-complete signal. Returns true when
    /// this signal ended the grace period.
    pub fn reclaim_complete(&self, client: &ClientId) -> bool {
        let mut inner = self.inner.lock().expect("grace state poisoned");
        if inner.phase != GracePhase::Grace {
            return false;
        }
        inner.completed.insert(client.clone());
        let done = !inner.registered.is_empty()
            && inner.registered.iter().all(|c| inner.completed.contains(c));
        if done {
            inner.phase = GracePhase::Serving;
            debug!("grace ended: every registered client reclaimed");
        }
        drop(inner);
        if done {
            self.serving.notify_waiters();
        }
        done
    }

    /// Grace -> Serving on window expiry. Idempotent.
    pub fn end_grace(&self) {
        let mut inner = self.inner.lock().expect("grace state poisoned");
        if inner.phase == GracePhase::Serving {
            return;
        }
        inner.phase = GracePhase::Serving;
        debug!("grace ended");
        drop(inner);
        self.serving.notify_waiters();
    }

    /// Fresh acquisitions are only accepted while serving.
    pub fn accepts_fresh(&self) -> bool {
        self.phase() == GracePhase::Serving
    }

    /// Any state accepts reclaims.
    pub fn accepts_reclaim(&self) -> bool {
        true
    }

    /// Time left in the current grace window, if grace is active.
    pub fn remaining(&self) -> Option<Duration> {
        let inner = self.inner.lock().expect("grace state poisoned");
        if inner.phase != GracePhase::Grace {
            return None;
        }
        let entered = inner.entered_at?;
        Some(self.window.saturating_sub(entered.elapsed()))
    }

    /// Suspends until the coordinator reaches the serving phase.
    pub async fn wait_serving(&self) {
        loop {
            let notified = self.serving.notified();
            if self.phase() == GracePhase::Serving {
                return;
            }
            notified.await;
        }
    }
}
