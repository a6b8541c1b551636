use std::time::Duration;

use crate::common::{byte_range_lock, expect_event, oplock_record, LockFixture};
use dittofs::config::CoreConfig;
use dittofs::entity::{FileId, LockMode, OplockLevel, OwnerId};
use dittofs::error::Error;
use dittofs::lock::{Acquisition, LockEvent, LockRequest};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn read_caches_coexist_without_breaks() {
    let fixture = LockFixture::new().await;
    let file = FileId::generate();
    for owner in ["o1", "o2"] {
        let record = oplock_record(file, owner, owner, OplockLevel::READ_CACHE);
        assert!(matches!(
            fixture.manager.try_acquire(LockRequest::new(record)).await.expect("acquire"),
            Acquisition::Granted(_)
        ));
    }
}

#[tokio::test]
async fn write_cache_holder_is_broken_for_a_new_oplock() {
    let fixture = LockFixture::new().await;
    let file = FileId::generate();
    let writer = oplock_record(file, "o1", "c1", OplockLevel::WRITE_CACHE);
    fixture.manager.try_acquire(LockRequest::new(writer)).await.expect("grant writer");

    let reader = oplock_record(file, "o2", "c2", OplockLevel::READ_CACHE);
    let pending = match fixture
        .manager
        .try_acquire(LockRequest::new(reader).blocking())
        .await
        .expect("enqueue reader")
    {
        Acquisition::Pending(pending) => pending,
        _ => panic!("expected pending while the break is outstanding"),
    };

    let event = expect_event(&fixture.events, |event| {
        matches!(event, LockEvent::Break { owner, .. } if *owner == OwnerId("o1".into()))
    })
    .await;
    let LockEvent::Break { to, .. } = event else { unreachable!() };
    assert!(!to.contains(OplockLevel::WRITE_CACHE));

    // The holder answers the break by giving the oplock up entirely.
    fixture
        .manager
        .acknowledge_break(file, &OwnerId("o1".into()), OplockLevel::NONE)
        .await
        .expect("acknowledge");

    let token = CancellationToken::new();
    tokio::time::timeout(Duration::from_secs(2), pending.wait(&token))
        .await
        .expect("bounded")
        .expect("reader granted after break");
}

#[tokio::test]
async fn foreign_read_breaks_a_write_cache_before_io() {
    // S4: a read by another client forces the write-cache holder to
    // flush and downgrade before the read proceeds.
    let fixture = LockFixture::new().await;
    let file = FileId::generate();
    let writer = oplock_record(file, "o1", "c1", OplockLevel::WRITE_CACHE | OplockLevel::READ_CACHE);
    fixture.manager.try_acquire(LockRequest::new(writer)).await.expect("grant writer");

    let manager = fixture.manager.clone();
    let events = fixture.events.clone();
    let acker = tokio::spawn(async move {
        expect_event(&events, |event| matches!(event, LockEvent::Break { .. })).await;
        manager
            .acknowledge_break(file, &OwnerId("o1".into()), OplockLevel::READ_CACHE)
            .await
            .expect("acknowledge");
    });

    let token = CancellationToken::new();
    tokio::time::timeout(
        Duration::from_secs(2),
        fixture.manager.prepare_io(file, &OwnerId("o2".into()), false, &token),
    )
    .await
    .expect("bounded")
    .expect("read proceeds after acknowledgement");
    acker.await.expect("acker task");
}

#[tokio::test]
async fn unanswered_break_revokes_after_the_timeout() {
    let mut config = CoreConfig::default();
    config.oplock_break_timeout_ms = 100;
    let fixture = LockFixture::with_config(config).await;
    let file = FileId::generate();
    let writer = oplock_record(file, "o1", "c1", OplockLevel::WRITE_CACHE);
    fixture.manager.try_acquire(LockRequest::new(writer)).await.expect("grant writer");

    let token = CancellationToken::new();
    tokio::time::timeout(
        Duration::from_secs(2),
        fixture.manager.prepare_io(file, &OwnerId("o2".into()), true, &token),
    )
    .await
    .expect("bounded")
    .expect("write proceeds after revoke");

    expect_event(&fixture.events, |event| {
        matches!(event, LockEvent::Revoke { owner, .. } if *owner == OwnerId("o1".into()))
    })
    .await;
    // A late acknowledgement finds nothing to answer.
    assert_eq!(
        fixture
            .manager
            .acknowledge_break(file, &OwnerId("o1".into()), OplockLevel::NONE)
            .await,
        Err(Error::Stale)
    );
}

#[tokio::test]
async fn exclusive_byte_range_breaks_cached_views() {
    let fixture = LockFixture::new().await;
    let file = FileId::generate();
    let holder = oplock_record(file, "o1", "c1", OplockLevel::READ_CACHE);
    fixture.manager.try_acquire(LockRequest::new(holder)).await.expect("grant oplock");

    let writer = byte_range_lock(file, "o2", "c2", 0, 100, LockMode::Exclusive);
    match fixture.manager.try_acquire(LockRequest::new(writer)).await {
        Err(Error::WouldBlock { owner }) => assert_eq!(owner, "o1"),
        Ok(_) => panic!("expected would-block while the cache holder is broken"),
        Err(e) => panic!("unexpected error: {e}"),
    }
    expect_event(&fixture.events, |event| {
        matches!(event, LockEvent::Break { owner, .. } if *owner == OwnerId("o1".into()))
    })
    .await;
}

#[tokio::test]
async fn nfs4_delegations_are_recalled_not_broken() {
    let fixture = LockFixture::new().await;
    let file = FileId::generate();
    let mut delegation = oplock_record(file, "o1", "c1", OplockLevel::READ_CACHE);
    delegation.domain = dittofs::entity::LockDomain::Nfs4;
    fixture.manager.try_acquire(LockRequest::new(delegation)).await.expect("grant delegation");

    let token = CancellationToken::new();
    let manager = fixture.manager.clone();
    let writer = tokio::spawn(async move {
        manager.prepare_io(file, &OwnerId("o2".into()), true, &token).await
    });
    expect_event(&fixture.events, |event| {
        matches!(event, LockEvent::Recall { owner, .. } if *owner == OwnerId("o1".into()))
    })
    .await;
    fixture
        .manager
        .acknowledge_break(file, &OwnerId("o1".into()), OplockLevel::NONE)
        .await
        .expect("return delegation");
    writer.await.expect("writer task").expect("write proceeds");
}
