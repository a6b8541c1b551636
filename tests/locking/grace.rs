use std::time::Duration;

use crate::common::{byte_range_lock, expect_event, LockFixture};
use dittofs::entity::{ByteRange, ClientId, FileId, LockKind, LockMode, LockQuery, NsmRegistration, OwnerId};
use dittofs::error::Error;
use dittofs::lock::{Acquisition, GracePhase, LockEvent, LockRequest};

fn registration(client: &str) -> NsmRegistration {
    NsmRegistration {
        client: ClientId(client.to_owned()),
        monitored_host: format!("{client}.example"),
        callback_addr: "10.0.0.9:816".into(),
        private_data: vec![0; 16],
        epoch: 0,
    }
}

#[tokio::test]
async fn recovery_without_prior_locks_serves_immediately() {
    let fixture = LockFixture::new().await;
    let (manager, _events) = fixture.restart();
    let epoch = manager.recover().await.expect("recover");
    assert_eq!(epoch, 1);
    assert_eq!(manager.grace().phase(), GracePhase::Serving);
}

#[tokio::test]
async fn grace_admits_reclaims_and_refuses_fresh_acquisitions() {
    // S5: persisted locks from epoch E are reclaimable in E+1; fresh
    // acquisitions during grace are turned away to retry.
    let fixture = LockFixture::new().await;
    let file = FileId::generate();
    fixture.manager.recover().await.expect("first recovery");
    fixture.manager.register_client(registration("c1")).await.expect("register");
    let held = byte_range_lock(file, "o1", "c1", 0, 1024, LockMode::Exclusive).persistent();
    fixture.manager.try_acquire(LockRequest::new(held.clone())).await.expect("acquire");

    // Restart: a new manager over the same backend.
    let (manager, _events) = fixture.restart();
    let epoch = manager.recover().await.expect("recover");
    assert_eq!(epoch, 2);
    assert_eq!(manager.grace().phase(), GracePhase::Grace);

    let fresh = byte_range_lock(file, "o9", "c9", 4096, 10, LockMode::Exclusive);
    assert!(matches!(
        manager.try_acquire(LockRequest::new(fresh)).await.expect("refused politely"),
        Acquisition::DeniedGrace
    ));

    // The reclaim re-presents the same owner, client and range.
    let reclaim = byte_range_lock(file, "o1", "c1", 0, 1024, LockMode::Exclusive);
    let reclaimed_id =
        match manager.try_acquire(LockRequest::new(reclaim).reclaim()).await.expect("reclaim") {
            Acquisition::Granted(id) => id,
            _ => panic!("reclaim must grant"),
        };
    assert_eq!(reclaimed_id, held.id, "reclaim retains the lock identity");

    // The persisted record now belongs to the new epoch.
    let mut tx = fixture.backend.begin_read().await.expect("begin read");
    let records = tx.list_locks(&LockQuery::default()).await.expect("list");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].epoch, 2);
    assert_eq!(records[0].owner, OwnerId("o1".into()));
    assert_eq!(
        records[0].kind,
        LockKind::ByteRange { range: ByteRange::new(0, 1024), mode: LockMode::Exclusive }
    );

    // Every registered client done reclaiming ends grace early.
    manager.reclaim_complete(&ClientId("c1".into()));
    assert_eq!(manager.grace().phase(), GracePhase::Serving);
    let fresh = byte_range_lock(file, "o9", "c9", 4096, 10, LockMode::Exclusive);
    assert!(matches!(
        manager.try_acquire(LockRequest::new(fresh)).await.expect("acquire"),
        Acquisition::Granted(_)
    ));
}

#[tokio::test]
async fn reclaim_without_a_matching_prior_lock_is_refused() {
    let fixture = LockFixture::new().await;
    let file = FileId::generate();
    fixture.manager.recover().await.expect("first recovery");
    let held = byte_range_lock(file, "o1", "c1", 0, 1024, LockMode::Exclusive).persistent();
    fixture.manager.try_acquire(LockRequest::new(held)).await.expect("acquire");

    let (manager, _events) = fixture.restart();
    manager.recover().await.expect("recover");

    // Wrong range: no prior lock matches.
    let bogus = byte_range_lock(file, "o1", "c1", 512, 512, LockMode::Exclusive);
    assert_eq!(
        manager.try_acquire(LockRequest::new(bogus).reclaim()).await.map(|_| ()),
        Err(Error::NotFound)
    );
}

#[tokio::test]
async fn conflicting_grant_defeats_a_later_reclaim() {
    // P7: a lock granted during the new epoch blocks the reclaim of an
    // overlapping prior-epoch lock.
    let fixture = LockFixture::new().await;
    let file = FileId::generate();
    fixture.manager.recover().await.expect("first recovery");
    // Hand-persist two prior-epoch records that overlap; only one can
    // come back.
    let first = byte_range_lock(file, "o1", "c1", 0, 1024, LockMode::Exclusive)
        .persistent()
        .with_epoch(1);
    let second = byte_range_lock(file, "o2", "c2", 512, 1024, LockMode::Exclusive)
        .persistent()
        .with_epoch(1);
    let mut tx = fixture.backend.begin_write().await.expect("begin write");
    tx.put_lock(&first).await.expect("persist");
    tx.put_lock(&second).await.expect("persist");
    tx.commit().await.expect("commit");

    let (manager, _events) = fixture.restart();
    manager.recover().await.expect("recover");

    let reclaim_first = byte_range_lock(file, "o1", "c1", 0, 1024, LockMode::Exclusive);
    assert!(matches!(
        manager.try_acquire(LockRequest::new(reclaim_first).reclaim()).await.expect("reclaim"),
        Acquisition::Granted(_)
    ));

    let reclaim_second = byte_range_lock(file, "o2", "c2", 512, 1024, LockMode::Exclusive);
    match manager.try_acquire(LockRequest::new(reclaim_second).reclaim()).await {
        Err(Error::WouldBlock { owner }) => assert_eq!(owner, "o1"),
        Ok(_) => panic!("conflicting reclaim must fail"),
        Err(e) => panic!("unexpected error: {e}"),
    }
}

#[tokio::test]
async fn unreclaimed_locks_are_revoked_when_grace_ends() {
    let fixture = LockFixture::new().await;
    let file = FileId::generate();
    fixture.manager.recover().await.expect("first recovery");
    fixture.manager.register_client(registration("c1")).await.expect("register");
    let held = byte_range_lock(file, "o1", "c1", 0, 1024, LockMode::Exclusive).persistent();
    fixture.manager.try_acquire(LockRequest::new(held)).await.expect("acquire");

    let (manager, events) = fixture.restart();
    manager.recover().await.expect("recover");
    // The lone registered client reports completion without actually
    // reclaiming; its surviving prior-epoch lock is revoked.
    manager.reclaim_complete(&ClientId("c1".into()));

    expect_event(&events, |event| {
        matches!(event, LockEvent::Revoke { owner, .. } if *owner == OwnerId("o1".into()))
    })
    .await;
    // And the persisted record is gone.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let mut tx = fixture.backend.begin_read().await.expect("begin read");
        if tx.list_locks(&LockQuery::default()).await.expect("list").is_empty() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "stale lock was never deleted");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn monitored_peer_registry_round_trips() {
    let fixture = LockFixture::new().await;
    fixture.manager.register_client(registration("c1")).await.expect("register");
    fixture.manager.register_client(registration("c2")).await.expect("register");
    let listed = fixture.manager.list_client_registrations().await.expect("list");
    assert_eq!(listed.len(), 2);

    fixture.manager.unregister_client(&ClientId("c1".into())).await.expect("unregister");
    let listed = fixture.manager.list_client_registrations().await.expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].client, ClientId("c2".into()));
}
