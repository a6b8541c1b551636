use std::sync::Arc;
use std::time::Duration;

use async_channel::Receiver;
use dittofs::backend::{Backend, MemoryBackend};
use dittofs::config::CoreConfig;
use dittofs::entity::{
    ByteRange, ClientId, FileId, LockDomain, LockKind, LockMode, LockRecord, OplockLevel, OwnerId,
};
use dittofs::lock::{GraceCoordinator, LockEvent, LockManager};

pub struct LockFixture {
    pub backend: Arc<dyn Backend>,
    pub manager: Arc<LockManager>,
    pub events: Receiver<LockEvent>,
    pub config: CoreConfig,
}

impl LockFixture {
    /// Manager over a fresh in-memory backend, already serving.
    pub async fn new() -> Self {
        Self::with_config(CoreConfig::default()).await
    }

    pub async fn with_config(config: CoreConfig) -> Self {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new(&config));
        let (manager, events) = Self::manager_over(&config, &backend);
        manager.start_serving();
        Self { backend, manager, events, config }
    }

    /// A second manager over the same backend, as after a process
    /// restart. Not serving yet; callers drive `recover`.
    pub fn restart(&self) -> (Arc<LockManager>, Receiver<LockEvent>) {
        Self::manager_over(&self.config, &self.backend)
    }

    fn manager_over(
        config: &CoreConfig,
        backend: &Arc<dyn Backend>,
    ) -> (Arc<LockManager>, Receiver<LockEvent>) {
        let grace = Arc::new(GraceCoordinator::new(config.grace_window()));
        let (sink, events) = async_channel::bounded(1024);
        let manager = LockManager::new(config, grace, Some(Arc::clone(backend)), sink);
        (manager, events)
    }
}

pub fn byte_range_lock(
    file: FileId,
    owner: &str,
    client: &str,
    offset: u64,
    length: u64,
    mode: LockMode,
) -> LockRecord {
    LockRecord::new(
        file,
        OwnerId(owner.to_owned()),
        ClientId(client.to_owned()),
        LockDomain::Nlm,
        LockKind::ByteRange { range: ByteRange::new(offset, length), mode },
    )
}

pub fn oplock_record(file: FileId, owner: &str, client: &str, level: u32) -> LockRecord {
    LockRecord::new(
        file,
        OwnerId(owner.to_owned()),
        ClientId(client.to_owned()),
        LockDomain::Smb,
        LockKind::Oplock { level: OplockLevel(level) },
    )
}

/// Receives events until one matches, failing after two seconds.
pub async fn expect_event<F>(events: &Receiver<LockEvent>, mut matches: F) -> LockEvent
where
    F: FnMut(&LockEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .expect("timed out waiting for lock event")
            .expect("event channel closed");
        if matches(&event) {
            return event;
        }
    }
}
