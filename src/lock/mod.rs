//! Unified lock manager --- [`LockManager`].
//!
//! A protocol-agnostic locking core serving NFSv3 NLM byte-range locks,
//! NFSv4 stateful locks and SMB oplocks/leases from one lock view, with
//! cross-protocol conflict detection, FIFO wait queues, oplock break
//! scheduling, client-scoped cleanup and grace-period reclaim.
//!
//! The manager owns per-file state behind an async mutex inside a
//! concurrent map. Callbacks to adapters never run under that lock:
//! events go to an unbounded in-process queue drained by a dedicated
//! dispatcher task.

mod callback;
mod conflict;
mod grace;

pub use callback::{CallbackTask, DirectoryChangeKind, LockEvent};
pub use conflict::conflicts_with;
pub use grace::{GraceCoordinator, GracePhase};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::FutureExt;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{self, Backend};
use crate::config::CoreConfig;
use crate::entity::{
    ClientId, FileId, LockDomain, LockId, LockKind, LockQuery, LockRecord, NsmRegistration,
    OplockLevel, OwnerId,
};
use crate::error::{Error, Result};

/// One acquisition request as the adapter hands it over.
#[derive(Debug, Clone)]
pub struct LockRequest {
    pub record: LockRecord,
    /// Park on the wait queue instead of failing with would-block.
    pub blocking: bool,
    /// Re-acquisition of a lock persisted under the prior server epoch.
    pub reclaim: bool,
}

impl LockRequest {
    pub fn new(record: LockRecord) -> Self {
        Self { record, blocking: false, reclaim: false }
    }

    pub fn blocking(mut self) -> Self {
        self.blocking = true;
        self
    }

    pub fn reclaim(mut self) -> Self {
        self.reclaim = true;
        self
    }
}

/// Outcome of [`LockManager::try_acquire`].
pub enum Acquisition {
    /// Lock inserted; the id names it for release.
    Granted(LockId),
    /// Parked on the wait queue; await the handle or cancel it.
    Pending(PendingLock),
    /// Refused because the server is inside its grace period and the
    /// request was not a reclaim. The client should retry after grace.
    DeniedGrace,
}

/// Handle for a parked blocking acquisition.
pub struct PendingLock {
    id: LockId,
    file: FileId,
    state: Arc<Mutex<FileLockState>>,
    shared: Shared,
    rx: oneshot::Receiver<Result<LockId>>,
}

impl PendingLock {
    pub fn id(&self) -> LockId {
        self.id
    }

    /// Suspends until the lock is granted, the wait collapses (client
    /// cleanup), or the caller's token fires. Cancellation removes the
    /// waiter without side effects on other waiters.
    pub async fn wait(self, cancel: &CancellationToken) -> Result<LockId> {
        let PendingLock { id, file, state, shared, rx } = self;
        tokio::select! {
            outcome = rx => match outcome {
                Ok(result) => result,
                Err(_) => Err(Error::Conflict),
            },
            _ = cancel.cancelled() => {
                Self::withdraw(id, file, &state, &shared).await;
                Err(Error::Cancelled)
            }
        }
    }

    /// Abandons the wait.
    pub async fn cancel(self) {
        let PendingLock { id, file, state, shared, .. } = self;
        Self::withdraw(id, file, &state, &shared).await;
    }

    async fn withdraw(id: LockId, file: FileId, state: &Arc<Mutex<FileLockState>>, shared: &Shared) {
        let mut st = state.lock().await;
        if st.remove_waiter(id) {
            return;
        }
        // The grant raced the cancellation; undo it.
        if let Some(removed) = st.remove(id) {
            debug!(lock = %id, file = %file, "cancelled lock was already granted, releasing");
            if removed.persist {
                unpersist_record(shared, &removed).await;
            }
            wake_waiters(shared, &mut st).await;
        }
    }
}

struct Waiter {
    record: LockRecord,
    reclaim: bool,
    tx: oneshot::Sender<Result<LockId>>,
}

struct Breaking {
    to: OplockLevel,
    generation: u64,
    watchers: Vec<oneshot::Sender<()>>,
}

struct OplockState {
    record: LockRecord,
    breaking: Option<Breaking>,
}

impl OplockState {
    fn level(&self) -> OplockLevel {
        match self.record.kind {
            LockKind::Oplock { level } => level,
            _ => OplockLevel::NONE,
        }
    }
}

#[derive(Default)]
struct FileLockState {
    byte_ranges: Vec<LockRecord>,
    oplocks: Vec<OplockState>,
    reservations: Vec<LockRecord>,
    waiters: VecDeque<Waiter>,
}

impl FileLockState {
    fn active(&self) -> impl Iterator<Item = &LockRecord> {
        self.byte_ranges
            .iter()
            .chain(self.oplocks.iter().map(|o| &o.record))
            .chain(self.reservations.iter())
    }

    /// Snapshot of every active lock the proposal cannot coexist with.
    fn conflicting(&self, proposed: &LockRecord) -> Vec<LockRecord> {
        self.active().filter(|held| conflicts_with(held, proposed)).cloned().collect()
    }

    /// Inserts a granted lock. A re-granted oplock replaces the same
    /// owner's previous level.
    fn insert(&mut self, record: LockRecord) {
        match record.kind {
            LockKind::ByteRange { .. } => self.byte_ranges.push(record),
            LockKind::Reservation { .. } => self.reservations.push(record),
            LockKind::Oplock { .. } => {
                if let Some(existing) =
                    self.oplocks.iter_mut().find(|o| o.record.owner == record.owner)
                {
                    if let Some(breaking) = existing.breaking.take() {
                        notify_watchers(breaking);
                    }
                    existing.record = record;
                } else {
                    self.oplocks.push(OplockState { record, breaking: None });
                }
            }
        }
    }

    fn remove(&mut self, id: LockId) -> Option<LockRecord> {
        if let Some(pos) = self.byte_ranges.iter().position(|l| l.id == id) {
            return Some(self.byte_ranges.remove(pos));
        }
        if let Some(pos) = self.reservations.iter().position(|l| l.id == id) {
            return Some(self.reservations.remove(pos));
        }
        if let Some(pos) = self.oplocks.iter().position(|o| o.record.id == id) {
            let mut oplock = self.oplocks.remove(pos);
            if let Some(breaking) = oplock.breaking.take() {
                notify_watchers(breaking);
            }
            return Some(oplock.record);
        }
        None
    }

    fn remove_waiter(&mut self, id: LockId) -> bool {
        if let Some(pos) = self.waiters.iter().position(|w| w.record.id == id) {
            self.waiters.remove(pos);
            true
        } else {
            false
        }
    }
}

fn notify_watchers(breaking: Breaking) {
    for watcher in breaking.watchers {
        let _ = watcher.send(());
    }
}

/// Cheap-clone context handed to detached tasks (break timers, the
/// grace watchdog) so they can persist and emit without the manager.
#[derive(Clone)]
struct Shared {
    events: mpsc::UnboundedSender<LockEvent>,
    store: Option<Arc<dyn Backend>>,
    grace: Arc<GraceCoordinator>,
    retry_max: u32,
    backoff_base: Duration,
}

async fn persist_record(shared: &Shared, record: &LockRecord) -> Result<()> {
    if !record.persist {
        return Ok(());
    }
    let Some(store) = &shared.store else {
        return Ok(());
    };
    backend::with_write(store.as_ref(), shared.retry_max, shared.backoff_base, |tx| {
        let record = record.clone();
        async move { tx.put_lock(&record).await }.boxed()
    })
    .await
}

/// Best-effort removal of a persisted record; failures are logged, not
/// surfaced, since the in-memory release already happened.
async fn unpersist_record(shared: &Shared, record: &LockRecord) {
    if !record.persist {
        return;
    }
    let Some(store) = &shared.store else {
        return;
    };
    let outcome =
        backend::with_write(store.as_ref(), shared.retry_max, shared.backoff_base, |tx| {
            let id = record.id;
            async move {
                match tx.delete_lock(id).await {
                    Ok(()) | Err(Error::NotFound) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            .boxed()
        })
        .await;
    if let Err(e) = outcome {
        warn!(lock = %record.id, error = %e, "failed to delete persisted lock record");
    }
}

/// Scans the wait queue in FIFO order and grants every waiter the
/// current state admits. Reclaims outrank fresh grants while grace is
/// active.
async fn wake_waiters(shared: &Shared, st: &mut FileLockState) {
    let mut index = 0;
    while index < st.waiters.len() {
        if !st.waiters[index].reclaim && !shared.grace.accepts_fresh() {
            index += 1;
            continue;
        }
        let record = st.waiters[index].record.clone();
        if !st.conflicting(&record).is_empty() {
            index += 1;
            continue;
        }
        let waiter = st.waiters.remove(index).expect("indexed waiter");
        if let Err(e) = persist_record(shared, &record).await {
            let _ = waiter.tx.send(Err(e));
            continue;
        }
        st.insert(record.clone());
        let _ = shared.events.send(LockEvent::Granted {
            file: record.file,
            lock: record.id,
            owner: record.owner.clone(),
        });
        let _ = waiter.tx.send(Ok(record.id));
    }
}

/// The protocol-agnostic lock core.
pub struct LockManager {
    files: DashMap<FileId, Arc<Mutex<FileLockState>>>,
    shared: Shared,
    epoch: AtomicU64,
    generations: AtomicU64,
    /// Prior-epoch persisted locks awaiting reclaim during grace.
    reclaimable: StdMutex<Vec<LockRecord>>,
    break_timeout: Duration,
}

impl LockManager {
    /// Builds the manager and spawns its callback dispatcher. `store`
    /// enables lock persistence and restart recovery; pass `None` for a
    /// purely ephemeral manager. `sink` is the adapter-provided bounded
    /// event channel.
    pub fn new(
        config: &CoreConfig,
        grace: Arc<GraceCoordinator>,
        store: Option<Arc<dyn Backend>>,
        sink: async_channel::Sender<LockEvent>,
    ) -> Arc<Self> {
        let (events, queue) = mpsc::unbounded_channel();
        CallbackTask::spawn(queue, sink);
        Arc::new(Self {
            files: DashMap::new(),
            shared: Shared {
                events,
                store,
                grace,
                retry_max: config.transaction_retry_max,
                backoff_base: config.retry_backoff_base(),
            },
            epoch: AtomicU64::new(0),
            generations: AtomicU64::new(0),
            reclaimable: StdMutex::new(Vec::new()),
            break_timeout: config.oplock_break_timeout(),
        })
    }

    pub fn grace(&self) -> &Arc<GraceCoordinator> {
        &self.shared.grace
    }

    /// Server epoch associated with locks granted now.
    pub fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn file_state(&self, file: FileId) -> Arc<Mutex<FileLockState>> {
        self.files.entry(file).or_default().clone()
    }

    /// Declares the manager ready without restart recovery (fresh
    /// deployments and ephemeral backends).
    pub fn start_serving(&self) {
        self.shared.grace.begin_serving();
    }

    /// Restart recovery: bumps the persisted server epoch, loads every
    /// prior-epoch lock as reclaimable and enters the grace period
    /// (skipped when nothing survived). Returns the new epoch.
    pub async fn recover(self: &Arc<Self>) -> Result<u64> {
        let store = self
            .shared
            .store
            .clone()
            .ok_or_else(|| Error::InvalidArgument("lock recovery requires a persistent backend".into()))?;
        let epoch =
            backend::with_write(store.as_ref(), self.shared.retry_max, self.shared.backoff_base, |tx| {
                async move { tx.bump_server_epoch().await }.boxed()
            })
            .await?;
        self.epoch.store(epoch, Ordering::Release);
        let mut tx = store.begin_read().await?;
        let prior: Vec<LockRecord> = tx
            .list_locks(&LockQuery::default())
            .await?
            .into_iter()
            .filter(|record| record.epoch < epoch)
            .collect();
        let clients: Vec<ClientId> =
            tx.list_client_registrations().await?.into_iter().map(|r| r.client).collect();
        drop(tx);
        if prior.is_empty() {
            debug!(epoch, "no prior-epoch locks, serving immediately");
            self.shared.grace.begin_serving();
            return Ok(epoch);
        }
        debug!(epoch, reclaimable = prior.len(), "entering grace period");
        *self.reclaimable.lock().expect("reclaim table poisoned") = prior;
        self.shared.grace.enter_grace(clients);
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(manager.shared.grace.window()) => {
                    manager.shared.grace.end_grace();
                }
                _ = manager.shared.grace.wait_serving() => {}
            }
            manager.finish_grace().await;
        });
        Ok(epoch)
    }

    /// Revokes every prior-epoch persisted lock that survived grace
    /// unreclaimed.
    async fn finish_grace(&self) {
        let stale: Vec<LockRecord> =
            std::mem::take(&mut *self.reclaimable.lock().expect("reclaim table poisoned"));
        for record in stale {
            warn!(lock = %record.id, client = %record.client, "revoking unreclaimed prior-epoch lock");
            unpersist_record(&self.shared, &record).await;
            let _ = self.shared.events.send(LockEvent::Revoke {
                file: record.file,
                owner: record.owner.clone(),
            });
        }
        // Waiters parked during grace may be grantable now.
        let states: Vec<Arc<Mutex<FileLockState>>> =
            self.files.iter().map(|entry| entry.value().clone()).collect();
        for state in states {
            let mut st = state.lock().await;
            wake_waiters(&self.shared, &mut st).await;
        }
    }

    /// Forwards a per-client reclaim-complete signal to the grace
    /// coordinator.
    pub fn reclaim_complete(&self, client: &ClientId) {
        self.shared.grace.reclaim_complete(client);
    }

    /// Attempts an acquisition. See [`Acquisition`] for the outcomes; a
    /// non-blocking request that hits a conflict fails with
    /// [`Error::WouldBlock`] naming the conflicting owner.
    pub async fn try_acquire(self: &Arc<Self>, request: LockRequest) -> Result<Acquisition> {
        let LockRequest { mut record, blocking, reclaim } = request;
        if reclaim {
            return self.reclaim_lock(record).await;
        }
        if !self.shared.grace.accepts_fresh() {
            return Ok(Acquisition::DeniedGrace);
        }
        record.epoch = self.current_epoch();
        let state = self.file_state(record.file);
        let mut st = state.lock().await;
        let conflicts = st.conflicting(&record);
        if conflicts.is_empty() {
            let id = record.id;
            persist_record(&self.shared, &record).await?;
            st.insert(record);
            return Ok(Acquisition::Granted(id));
        }
        // Conflicting oplocks get a break scheduled so the holder can
        // downgrade and unblock this request.
        for held in &conflicts {
            if matches!(held.kind, LockKind::Oplock { .. }) {
                let target = break_target(held, &record);
                self.begin_break(&state, &mut st, &held.owner, target);
            }
        }
        if !blocking {
            return Err(Error::WouldBlock { owner: conflicts[0].owner.0.clone() });
        }
        let (tx, rx) = oneshot::channel();
        let pending = PendingLock {
            id: record.id,
            file: record.file,
            state: Arc::clone(&state),
            shared: self.shared.clone(),
            rx,
        };
        st.waiters.push_back(Waiter { record, reclaim: false, tx });
        Ok(Acquisition::Pending(pending))
    }

    async fn reclaim_lock(self: &Arc<Self>, mut record: LockRecord) -> Result<Acquisition> {
        let matched = {
            let mut table = self.reclaimable.lock().expect("reclaim table poisoned");
            let pos = table.iter().position(|prior| {
                prior.file == record.file
                    && prior.client == record.client
                    && prior.owner == record.owner
                    && prior.kind == record.kind
            });
            pos.map(|p| table.remove(p))
        };
        let matched = matched.ok_or(Error::NotFound)?;
        record.id = matched.id;
        record.persist = true;
        record.epoch = self.current_epoch();
        let state = self.file_state(record.file);
        let mut st = state.lock().await;
        let conflicts = st.conflicting(&record);
        if let Some(held) = conflicts.first() {
            // A conflicting grant already landed in this epoch; the
            // reclaim fails and the prior record goes back for the
            // post-grace sweep.
            self.reclaimable.lock().expect("reclaim table poisoned").push(matched);
            return Err(Error::WouldBlock { owner: held.owner.0.clone() });
        }
        persist_record(&self.shared, &record).await?;
        let id = record.id;
        debug!(lock = %id, client = %record.client, "reclaimed prior-epoch lock");
        st.insert(record);
        Ok(Acquisition::Granted(id))
    }

    /// Advisory conflict probe (NLM TEST, SMB lock queries). Returns the
    /// first conflicting holder, if any.
    pub async fn test_lock(&self, proposed: &LockRecord) -> Option<LockRecord> {
        let state = self.file_state(proposed.file);
        let st = state.lock().await;
        st.conflicting(proposed).into_iter().next()
    }

    /// Releases one lock and re-evaluates the wait queue in FIFO order.
    pub async fn release(&self, file: FileId, id: LockId) -> Result<()> {
        let state = self.file_state(file);
        let mut st = state.lock().await;
        let removed = st.remove(id).ok_or(Error::NotFound)?;
        if removed.persist {
            unpersist_record(&self.shared, &removed).await;
        }
        wake_waiters(&self.shared, &mut st).await;
        Ok(())
    }

    /// Releases every lock an owner holds on a file, atomically with
    /// respect to wait-queue re-evaluation.
    pub async fn release_owner(&self, file: FileId, owner: &OwnerId) -> Result<u64> {
        let state = self.file_state(file);
        let mut st = state.lock().await;
        let ids: Vec<LockId> = st
            .active()
            .filter(|record| record.owner == *owner)
            .map(|record| record.id)
            .collect();
        let mut released = 0u64;
        for id in ids {
            if let Some(removed) = st.remove(id) {
                if removed.persist {
                    unpersist_record(&self.shared, &removed).await;
                }
                released += 1;
            }
        }
        wake_waiters(&self.shared, &mut st).await;
        Ok(released)
    }

    /// Client-scoped cleanup: unmount, lease expiry, session logoff or a
    /// monitored-peer down notification. Deletes every lock of the
    /// client, wakes waiters and revokes the client's oplocks.
    pub async fn cleanup_client(&self, client: &ClientId) -> Result<u64> {
        let states: Vec<(FileId, Arc<Mutex<FileLockState>>)> =
            self.files.iter().map(|entry| (*entry.key(), entry.value().clone())).collect();
        let mut removed_total = 0u64;
        for (file, state) in states {
            let mut st = state.lock().await;
            let ids: Vec<LockId> = st
                .active()
                .filter(|record| record.client == *client)
                .map(|record| record.id)
                .collect();
            for id in ids {
                if let Some(removed) = st.remove(id) {
                    if matches!(removed.kind, LockKind::Oplock { .. }) {
                        let _ = self.shared.events.send(LockEvent::Revoke {
                            file,
                            owner: removed.owner.clone(),
                        });
                    }
                    if removed.persist {
                        unpersist_record(&self.shared, &removed).await;
                    }
                    removed_total += 1;
                }
            }
            // Collapse this client's pending waits.
            let mut index = 0;
            while index < st.waiters.len() {
                if st.waiters[index].record.client == *client {
                    let waiter = st.waiters.remove(index).expect("indexed waiter");
                    let _ = waiter.tx.send(Err(Error::Conflict));
                } else {
                    index += 1;
                }
            }
            wake_waiters(&self.shared, &mut st).await;
        }
        // Drop unreclaimed prior-epoch locks of the client as well.
        {
            let mut table = self.reclaimable.lock().expect("reclaim table poisoned");
            table.retain(|record| record.client != *client);
        }
        if let Some(store) = &self.shared.store {
            let swept = backend::with_write(
                store.as_ref(),
                self.shared.retry_max,
                self.shared.backoff_base,
                |tx| {
                    let client = client.clone();
                    async move { tx.delete_locks_by_client(&client).await }.boxed()
                },
            )
            .await?;
            debug!(client = %client, swept, "deleted persisted client locks");
        }
        Ok(removed_total)
    }

    /// Starts (or tightens) a break on one holder's oplock and spawns
    /// the acknowledgement timer. Emits the break/recall callback.
    fn begin_break(
        &self,
        state: &Arc<Mutex<FileLockState>>,
        st: &mut FileLockState,
        owner: &OwnerId,
        to: OplockLevel,
    ) -> Option<oneshot::Receiver<()>> {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let oplock = st.oplocks.iter_mut().find(|o| o.record.owner == *owner)?;
        let (watch_tx, watch_rx) = oneshot::channel();
        if let Some(breaking) = &mut oplock.breaking {
            // Already breaking; tighten the target and piggyback.
            breaking.to = OplockLevel(breaking.to.bits() & to.bits());
            breaking.watchers.push(watch_tx);
            return Some(watch_rx);
        }
        oplock.breaking = Some(Breaking { to, generation, watchers: vec![watch_tx] });
        let event = match oplock.record.domain {
            LockDomain::Nfs4 => {
                LockEvent::Recall { file: oplock.record.file, owner: owner.clone() }
            }
            _ => LockEvent::Break { file: oplock.record.file, owner: owner.clone(), to },
        };
        let _ = self.shared.events.send(event);
        // Acknowledgement timer: an unanswered break revokes the oplock.
        let shared = self.shared.clone();
        let state = Arc::clone(state);
        let owner = owner.clone();
        let file = oplock.record.file;
        let timeout = self.break_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut st = state.lock().await;
            let expired = st.oplocks.iter().position(|o| {
                o.record.owner == owner
                    && o.breaking.as_ref().map(|b| b.generation) == Some(generation)
            });
            let Some(pos) = expired else { return };
            let mut oplock = st.oplocks.remove(pos);
            if let Some(breaking) = oplock.breaking.take() {
                notify_watchers(breaking);
            }
            warn!(file = %file, owner = %owner, "oplock break timed out, revoking");
            let _ = shared.events.send(LockEvent::Revoke { file, owner: owner.clone() });
            if oplock.record.persist {
                unpersist_record(&shared, &oplock.record).await;
            }
            wake_waiters(&shared, &mut st).await;
        });
        Some(watch_rx)
    }

    /// Holder's answer to a break callback: downgrade to `to` (clamped
    /// to the requested target; [`OplockLevel::NONE`] releases the
    /// oplock entirely). Returns [`Error::Stale`] when the oplock was
    /// already revoked by the acknowledgement timer.
    pub async fn acknowledge_break(
        &self,
        file: FileId,
        owner: &OwnerId,
        to: OplockLevel,
    ) -> Result<()> {
        let state = self.file_state(file);
        let mut st = state.lock().await;
        let Some(pos) = st.oplocks.iter().position(|o| o.record.owner == *owner) else {
            return Err(Error::Stale);
        };
        let Some(breaking) = st.oplocks[pos].breaking.take() else {
            return Err(Error::InvalidArgument("no oplock break in progress".into()));
        };
        let target = OplockLevel(breaking.to.bits() & to.bits());
        notify_watchers(breaking);
        if target.is_none() {
            let oplock = st.oplocks.remove(pos);
            if oplock.record.persist {
                unpersist_record(&self.shared, &oplock.record).await;
            }
        } else {
            let record = &mut st.oplocks[pos].record;
            record.kind = LockKind::Oplock { level: target };
            if record.persist {
                let record = record.clone();
                persist_record(&self.shared, &record).await?;
            }
        }
        wake_waiters(&self.shared, &mut st).await;
        Ok(())
    }

    /// Clears every foreign oplock that caches a view an I/O is about to
    /// invalidate, breaking holders and waiting for acknowledgement (or
    /// the break timeout). Reads break write caches; writes break read
    /// and write caches.
    pub async fn prepare_io(
        self: &Arc<Self>,
        file: FileId,
        requester: &OwnerId,
        write: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let offending = if write {
            OplockLevel::READ_CACHE | OplockLevel::WRITE_CACHE
        } else {
            OplockLevel::WRITE_CACHE
        };
        loop {
            let state = self.file_state(file);
            let mut st = state.lock().await;
            let holders: Vec<(OwnerId, OplockLevel)> = st
                .oplocks
                .iter()
                .filter(|o| o.record.owner != *requester && o.level().bits() & offending != 0)
                .map(|o| (o.record.owner.clone(), o.level()))
                .collect();
            if holders.is_empty() {
                return Ok(());
            }
            let mut watchers = Vec::new();
            for (owner, level) in &holders {
                let target = OplockLevel(level.bits() & !offending);
                if let Some(rx) = self.begin_break(&state, &mut st, owner, target) {
                    watchers.push(rx);
                }
            }
            drop(st);
            for watcher in watchers {
                tokio::select! {
                    _ = watcher => {}
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                }
            }
        }
    }

    /// Emits a directory-change notification through the callback
    /// channel (SMB change-notify, NFSv4 directory delegations).
    pub fn notify_directory_change(&self, dir: FileId, name: &str, change: DirectoryChangeKind) {
        let _ = self.shared.events.send(LockEvent::DirectoryChange {
            dir,
            name: name.to_owned(),
            change,
        });
    }

    // --- Monitored-peer registry (NSM) ---

    /// Persists a monitored-peer registration for NFSv3 crash recovery.
    pub async fn register_client(&self, mut registration: NsmRegistration) -> Result<()> {
        let store = self.registry_store()?;
        registration.epoch = self.current_epoch();
        backend::with_write(store.as_ref(), self.shared.retry_max, self.shared.backoff_base, |tx| {
            let registration = registration.clone();
            async move { tx.put_client_registration(&registration).await }.boxed()
        })
        .await
    }

    pub async fn unregister_client(&self, client: &ClientId) -> Result<()> {
        let store = self.registry_store()?;
        backend::with_write(store.as_ref(), self.shared.retry_max, self.shared.backoff_base, |tx| {
            let client = client.clone();
            async move { tx.delete_client_registration(&client).await }.boxed()
        })
        .await
    }

    pub async fn list_client_registrations(&self) -> Result<Vec<NsmRegistration>> {
        let store = self.registry_store()?;
        store.begin_read().await?.list_client_registrations().await
    }

    fn registry_store(&self) -> Result<Arc<dyn Backend>> {
        self.shared
            .store
            .clone()
            .ok_or_else(|| Error::InvalidArgument("peer registry requires a persistent backend".into()))
    }
}

/// Level a holder must fall to so `proposed` stops conflicting with it.
fn break_target(held: &LockRecord, proposed: &LockRecord) -> OplockLevel {
    let level = match held.kind {
        LockKind::Oplock { level } => level,
        _ => return OplockLevel::NONE,
    };
    match proposed.kind {
        // A foreign write invalidates both cached reads and writes.
        LockKind::ByteRange { .. } => OplockLevel(level.bits() & OplockLevel::HANDLE_CACHE),
        LockKind::Oplock { level: wanted } => {
            if wanted.contains(OplockLevel::WRITE_CACHE) {
                OplockLevel::NONE
            } else {
                OplockLevel(level.bits() & !OplockLevel::WRITE_CACHE)
            }
        }
        LockKind::Reservation { .. } => level,
    }
}
