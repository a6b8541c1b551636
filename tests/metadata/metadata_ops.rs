use crate::common::{attrs, root_ctx, user_ctx, Fixture};
use dittofs::context::{AuthMethod, CallerContext};
use dittofs::entity::ContentHash;
use dittofs::error::Error;
use dittofs::metadata::{SetAttrs, SetTime};
use dittofs::payload::{BlockManifest, ChunkManifest, PayloadManifest};

#[tokio::test]
async fn chmod_requires_ownership() {
    let fixture = Fixture::new().await;
    let owner = user_ctx(1000, 100);
    let entry =
        fixture.service.create(&owner, &fixture.root, "f", attrs(0o644)).await.expect("create");
    let handle = fixture.service.handle_for(&entry).expect("handle");

    let changes = SetAttrs { mode: Some(0o600), ..SetAttrs::default() };
    let stranger = user_ctx(2000, 200);
    assert_eq!(
        fixture.service.set_attr(&stranger, &handle, changes.clone()).await.map(|_| ()),
        Err(Error::PermissionDenied)
    );
    let updated = fixture.service.set_attr(&owner, &handle, changes).await.expect("chmod");
    assert_eq!(updated.mode, 0o600);
}

#[tokio::test]
async fn chown_to_foreign_uid_is_privilege_required() {
    let fixture = Fixture::new().await;
    let owner = user_ctx(1000, 100);
    let entry =
        fixture.service.create(&owner, &fixture.root, "f", attrs(0o644)).await.expect("create");
    let handle = fixture.service.handle_for(&entry).expect("handle");

    let changes = SetAttrs { uid: Some(2000), ..SetAttrs::default() };
    assert_eq!(
        fixture.service.set_attr(&owner, &handle, changes.clone()).await.map(|_| ()),
        Err(Error::PrivilegeRequired),
        "even the owner may not give the file away"
    );
    let updated = fixture.service.set_attr(&root_ctx(), &handle, changes).await.expect("chown");
    assert_eq!(updated.uid, 2000);
}

#[tokio::test]
async fn chgrp_needs_membership_and_clears_setid() {
    let fixture = Fixture::new().await;
    let owner = CallerContext::new(1000, 100, vec![300], AuthMethod::Unix);
    let entry =
        fixture.service.create(&owner, &fixture.root, "f", attrs(0o644)).await.expect("create");
    let handle = fixture.service.handle_for(&entry).expect("handle");
    fixture
        .service
        .set_attr(&owner, &handle, SetAttrs { mode: Some(0o4755), ..SetAttrs::default() })
        .await
        .expect("set setuid");

    let to_foreign = SetAttrs { gid: Some(999), ..SetAttrs::default() };
    assert_eq!(
        fixture.service.set_attr(&owner, &handle, to_foreign).await.map(|_| ()),
        Err(Error::PermissionDenied),
        "not a member of the target group"
    );

    let to_member = SetAttrs { gid: Some(300), ..SetAttrs::default() };
    let updated = fixture.service.set_attr(&owner, &handle, to_member).await.expect("chgrp");
    assert_eq!(updated.gid, 300);
    assert_eq!(updated.mode & 0o6000, 0, "non-root chown clears setuid/setgid");
}

#[tokio::test]
async fn truncate_to_zero_releases_the_payload() {
    let fixture = Fixture::new().await;
    let ctx = user_ctx(1000, 100);
    let entry =
        fixture.service.create(&ctx, &fixture.root, "data", attrs(0o644)).await.expect("create");
    let handle = fixture.service.handle_for(&entry).expect("handle");

    let manifest = PayloadManifest {
        chunks: vec![ChunkManifest {
            blocks: vec![BlockManifest { hash: ContentHash::digest(b"bytes"), size: 5 }],
        }],
    };
    let op = fixture.service.prepare_write(&ctx, &handle, 5).await.expect("prepare");
    fixture.service.commit_write_with_manifest(&ctx, &op, &manifest).await.expect("commit");

    let truncated = fixture
        .service
        .set_attr(&ctx, &handle, SetAttrs { size: Some(0), ..SetAttrs::default() })
        .await
        .expect("truncate");
    assert_eq!(truncated.size, 0);
    assert!(truncated.payload_id.is_empty());
    let object = fixture
        .service
        .payload_index()
        .get_object(manifest.object_hash())
        .await
        .expect("object survives as gc candidate");
    assert_eq!(object.refcount, 0);
}

#[tokio::test]
async fn truncating_a_directory_fails() {
    let fixture = Fixture::new().await;
    assert_eq!(
        fixture
            .service
            .set_attr(&root_ctx(), &fixture.root, SetAttrs { size: Some(0), ..SetAttrs::default() })
            .await
            .map(|_| ()),
        Err(Error::IsDirectory)
    );
}

#[tokio::test]
async fn client_times_require_ownership() {
    let fixture = Fixture::new().await;
    let owner = user_ctx(1000, 100);
    let entry =
        fixture.service.create(&owner, &fixture.root, "stamped", attrs(0o666)).await.expect("create");
    let handle = fixture.service.handle_for(&entry).expect("handle");
    let stamp = dittofs::entity::FileTime { seconds: 1_000_000, nanos: 42 };

    let stranger = user_ctx(2000, 200);
    assert_eq!(
        fixture
            .service
            .set_attr(
                &stranger,
                &handle,
                SetAttrs { mtime: SetTime::Client(stamp), ..SetAttrs::default() }
            )
            .await
            .map(|_| ()),
        Err(Error::PermissionDenied)
    );
    // World write bits allow server-time stamping, though.
    fixture
        .service
        .set_attr(
            &stranger,
            &handle,
            SetAttrs { mtime: SetTime::ServerCurrent, ..SetAttrs::default() },
        )
        .await
        .expect("utimes with write permission");

    let updated = fixture
        .service
        .set_attr(&owner, &handle, SetAttrs { mtime: SetTime::Client(stamp), ..SetAttrs::default() })
        .await
        .expect("owner sets explicit time");
    assert_eq!(updated.mtime, stamp);
}

#[tokio::test]
async fn statistics_reflect_usage_through_the_cache() {
    let fixture = Fixture::new().await;
    let ctx = user_ctx(1000, 100);
    let before = fixture.service.fs_statistics(&ctx, "export").await.expect("stats");
    let entry =
        fixture.service.create(&ctx, &fixture.root, "bulk", attrs(0o644)).await.expect("create");
    let handle = fixture.service.handle_for(&entry).expect("handle");
    let op = fixture.service.prepare_write(&ctx, &handle, 1 << 20).await.expect("prepare");
    fixture.service.commit_write(&ctx, &op).await.expect("commit");

    let after = fixture.service.fs_statistics(&ctx, "export").await.expect("stats");
    assert!(after.used_inodes > before.used_inodes);
    assert!(after.used_bytes >= before.used_bytes + (1 << 20));
}

#[tokio::test]
async fn capabilities_mirror_configuration() {
    let fixture = Fixture::new().await;
    let caps = fixture.service.capabilities();
    assert!(caps.supports_hard_links);
    assert!(caps.supports_symlinks);
    assert!(caps.case_sensitive);
    assert_eq!(caps.maximum_name_length, 255);
    assert!(caps.maximum_read_size >= caps.preferred_read_size);
}

#[tokio::test]
async fn share_admission_rules_apply() {
    let fixture = Fixture::new().await;
    let mut options =
        fixture.service.get_share(&root_ctx(), "export").await.expect("share").options;
    options.require_auth = true;
    fixture.service.update_share(&root_ctx(), "export", options).await.expect("update");

    let anonymous = CallerContext::anonymous();
    assert_eq!(
        fixture.service.lookup(&anonymous, &fixture.root, "whatever").await,
        Err(Error::PermissionDenied)
    );
}
