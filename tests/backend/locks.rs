use crate::common::all_backends;
use dittofs::entity::{
    ByteRange, ClientId, FileId, LockDomain, LockKind, LockMode, LockQuery, LockRecord,
    NsmRegistration, OwnerId,
};
use dittofs::error::Error;

fn byte_range_lock(file: FileId, owner: &str, client: &str) -> LockRecord {
    LockRecord::new(
        file,
        OwnerId(owner.to_owned()),
        ClientId(client.to_owned()),
        LockDomain::Nlm,
        LockKind::ByteRange { range: ByteRange::new(0, 1024), mode: LockMode::Exclusive },
    )
    .persistent()
}

#[tokio::test]
async fn lock_records_round_trip_and_filter() {
    let backends = all_backends().await;
    for (name, backend) in &backends.all {
        let file_a = FileId::generate();
        let file_b = FileId::generate();
        let l1 = byte_range_lock(file_a, "o1", "c1");
        let l2 = byte_range_lock(file_a, "o2", "c2");
        let l3 = byte_range_lock(file_b, "o1", "c1");

        let mut tx = backend.begin_write().await.expect("begin write");
        for lock in [&l1, &l2, &l3] {
            tx.put_lock(lock).await.expect("put lock");
        }
        tx.commit().await.expect("commit");

        let mut tx = backend.begin_read().await.expect("begin read");
        assert_eq!(tx.get_lock(l1.id).await.expect("get lock"), l1, "{name}");
        assert_eq!(
            tx.list_locks(&LockQuery::default()).await.expect("list all").len(),
            3,
            "{name}"
        );
        let by_file = tx
            .list_locks(&LockQuery { file: Some(file_a), ..LockQuery::default() })
            .await
            .expect("list by file");
        assert_eq!(by_file.len(), 2, "{name}");
        let by_owner = tx
            .list_locks(&LockQuery {
                owner: Some(OwnerId("o1".into())),
                ..LockQuery::default()
            })
            .await
            .expect("list by owner");
        assert_eq!(by_owner.len(), 2, "{name}");
        let narrowed = tx
            .list_locks(&LockQuery {
                file: Some(file_a),
                owner: Some(OwnerId("o1".into())),
                ..LockQuery::default()
            })
            .await
            .expect("list narrowed");
        assert_eq!(narrowed.len(), 1, "{name}");
        assert_eq!(narrowed[0].id, l1.id, "{name}");
    }
}

#[tokio::test]
async fn client_and_file_scoped_deletion() {
    let backends = all_backends().await;
    for (name, backend) in &backends.all {
        let file_a = FileId::generate();
        let file_b = FileId::generate();
        let l1 = byte_range_lock(file_a, "o1", "c1");
        let l2 = byte_range_lock(file_a, "o2", "c2");
        let l3 = byte_range_lock(file_b, "o3", "c1");

        let mut tx = backend.begin_write().await.expect("begin write");
        for lock in [&l1, &l2, &l3] {
            tx.put_lock(lock).await.expect("put lock");
        }
        assert_eq!(
            tx.delete_locks_by_client(&ClientId("c1".into())).await.expect("sweep client"),
            2,
            "{name}"
        );
        assert_eq!(tx.delete_locks_by_file(file_a).await.expect("sweep file"), 1, "{name}");
        tx.commit().await.expect("commit");

        let mut tx = backend.begin_read().await.expect("begin read");
        assert!(tx.list_locks(&LockQuery::default()).await.expect("list").is_empty(), "{name}");
        assert_eq!(tx.get_lock(l1.id).await, Err(Error::NotFound), "{name}");
    }
}

#[tokio::test]
async fn nsm_registrations_round_trip() {
    let backends = all_backends().await;
    for (name, backend) in &backends.all {
        let registration = NsmRegistration {
            client: ClientId("c1".into()),
            monitored_host: "client.example".into(),
            callback_addr: "10.0.0.8:816".into(),
            private_data: vec![1, 2, 3, 4],
            epoch: 7,
        };
        let mut tx = backend.begin_write().await.expect("begin write");
        tx.put_client_registration(&registration).await.expect("register");
        tx.commit().await.expect("commit");

        let mut tx = backend.begin_read().await.expect("begin read");
        assert_eq!(
            tx.list_client_registrations().await.expect("list"),
            vec![registration.clone()],
            "{name}"
        );

        let mut tx = backend.begin_write().await.expect("begin write");
        tx.delete_client_registration(&registration.client).await.expect("unregister");
        assert_eq!(
            tx.delete_client_registration(&registration.client).await,
            Err(Error::NotFound),
            "{name}"
        );
        tx.commit().await.expect("commit");
    }
}
