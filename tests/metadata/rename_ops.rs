use crate::common::{attrs, root_ctx, user_ctx, Fixture};
use dittofs::error::Error;

#[tokio::test]
async fn rename_preserves_identity_and_rewrites_paths() {
    // S1: /a/b/c.txt moved to /c2.txt keeps its identifier.
    let fixture = Fixture::new().await;
    let ctx = user_ctx(1000, 100);
    let a = fixture.service.make_dir(&ctx, &fixture.root, "a", attrs(0o755)).await.expect("a");
    let a_handle = fixture.service.handle_for(&a).expect("handle");
    let b = fixture.service.make_dir(&ctx, &a_handle, "b", attrs(0o755)).await.expect("b");
    let b_handle = fixture.service.handle_for(&b).expect("handle");
    let created =
        fixture.service.create(&ctx, &b_handle, "c.txt", attrs(0o644)).await.expect("c.txt");

    fixture
        .service
        .rename(&ctx, &b_handle, "c.txt", &fixture.root, "c2.txt")
        .await
        .expect("rename");

    let moved = fixture.service.lookup(&ctx, &fixture.root, "c2.txt").await.expect("lookup");
    assert_eq!(moved.id, created.id);
    assert_eq!(moved.path, "/c2.txt");
    assert_eq!(fixture.service.lookup(&ctx, &b_handle, "c.txt").await, Err(Error::NotFound));
}

#[tokio::test]
async fn directory_move_rewrites_descendant_paths() {
    let fixture = Fixture::new().await;
    let ctx = user_ctx(1000, 100);
    let outer =
        fixture.service.make_dir(&ctx, &fixture.root, "outer", attrs(0o755)).await.expect("outer");
    let outer_handle = fixture.service.handle_for(&outer).expect("handle");
    let inner =
        fixture.service.make_dir(&ctx, &outer_handle, "inner", attrs(0o755)).await.expect("inner");
    let inner_handle = fixture.service.handle_for(&inner).expect("handle");
    let leaf =
        fixture.service.create(&ctx, &inner_handle, "leaf", attrs(0o644)).await.expect("leaf");

    fixture
        .service
        .rename(&ctx, &fixture.root, "outer", &fixture.root, "renamed")
        .await
        .expect("rename dir");

    let inner_after = fixture.service.get_attr(&ctx, &inner_handle).await.expect("inner attr");
    assert_eq!(inner_after.path, "/renamed/inner");
    let leaf_after = fixture
        .service
        .get_attr(&ctx, &fixture.service.handle_for(&leaf).expect("handle"))
        .await
        .expect("leaf attr");
    assert_eq!(leaf_after.path, "/renamed/inner/leaf");
}

#[tokio::test]
async fn rename_replaces_compatible_destination() {
    let fixture = Fixture::new().await;
    let ctx = user_ctx(1000, 100);
    fixture.service.create(&ctx, &fixture.root, "src", attrs(0o644)).await.expect("src");
    let victim =
        fixture.service.create(&ctx, &fixture.root, "dst", attrs(0o644)).await.expect("dst");

    fixture.service.rename(&ctx, &fixture.root, "src", &fixture.root, "dst").await.expect("replace");
    let now = fixture.service.lookup(&ctx, &fixture.root, "dst").await.expect("lookup");
    assert_ne!(now.id, victim.id);
    assert_eq!(fixture.service.lookup(&ctx, &fixture.root, "src").await, Err(Error::NotFound));
    // The replaced entry is destroyed outright (no open handles).
    assert_eq!(
        fixture
            .service
            .get_attr(&ctx, &fixture.service.handle_for(&victim).expect("handle"))
            .await,
        Err(Error::Stale)
    );
}

#[tokio::test]
async fn rename_type_mismatches_fail() {
    let fixture = Fixture::new().await;
    let ctx = user_ctx(1000, 100);
    fixture.service.create(&ctx, &fixture.root, "file", attrs(0o644)).await.expect("file");
    fixture.service.make_dir(&ctx, &fixture.root, "dir", attrs(0o755)).await.expect("dir");

    assert_eq!(
        fixture.service.rename(&ctx, &fixture.root, "file", &fixture.root, "dir").await,
        Err(Error::IsDirectory)
    );
    assert_eq!(
        fixture.service.rename(&ctx, &fixture.root, "dir", &fixture.root, "file").await,
        Err(Error::NotDirectory)
    );
}

#[tokio::test]
async fn rename_over_non_empty_directory_fails() {
    let fixture = Fixture::new().await;
    let ctx = user_ctx(1000, 100);
    fixture.service.make_dir(&ctx, &fixture.root, "src", attrs(0o755)).await.expect("src");
    let dst =
        fixture.service.make_dir(&ctx, &fixture.root, "dst", attrs(0o755)).await.expect("dst");
    let dst_handle = fixture.service.handle_for(&dst).expect("handle");
    fixture.service.create(&ctx, &dst_handle, "occupant", attrs(0o644)).await.expect("occupant");

    assert_eq!(
        fixture.service.rename(&ctx, &fixture.root, "src", &fixture.root, "dst").await,
        Err(Error::NotEmpty)
    );
}

#[tokio::test]
async fn directory_cannot_move_under_itself() {
    let fixture = Fixture::new().await;
    let ctx = user_ctx(1000, 100);
    let outer =
        fixture.service.make_dir(&ctx, &fixture.root, "outer", attrs(0o755)).await.expect("outer");
    let outer_handle = fixture.service.handle_for(&outer).expect("handle");
    fixture.service.make_dir(&ctx, &outer_handle, "inner", attrs(0o755)).await.expect("inner");

    assert!(matches!(
        fixture.service.rename(&ctx, &fixture.root, "outer", &outer_handle, "loop").await,
        Err(Error::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn cross_directory_move_of_directory_needs_ownership() {
    let fixture = Fixture::new().await;
    let alice = user_ctx(1000, 100);
    let bob = user_ctx(2000, 200);
    fixture
        .service
        .make_dir(&alice, &fixture.root, "hers", attrs(0o777))
        .await
        .expect("make dir");
    let dest =
        fixture.service.make_dir(&bob, &fixture.root, "his", attrs(0o777)).await.expect("dest");
    let dest_handle = fixture.service.handle_for(&dest).expect("handle");

    assert_eq!(
        fixture.service.rename(&bob, &fixture.root, "hers", &dest_handle, "taken").await,
        Err(Error::PermissionDenied)
    );
    fixture
        .service
        .rename(&alice, &fixture.root, "hers", &dest_handle, "moved")
        .await
        .expect("owner moves");
    fixture
        .service
        .rename(&root_ctx(), &dest_handle, "moved", &fixture.root, "back")
        .await
        .expect("root may move anything");
}

#[tokio::test]
async fn rename_onto_itself_is_a_no_op() {
    let fixture = Fixture::new().await;
    let ctx = user_ctx(1000, 100);
    let entry =
        fixture.service.create(&ctx, &fixture.root, "same", attrs(0o644)).await.expect("create");
    fixture.service.rename(&ctx, &fixture.root, "same", &fixture.root, "same").await.expect("noop");
    let after = fixture.service.lookup(&ctx, &fixture.root, "same").await.expect("lookup");
    assert_eq!(after.id, entry.id);
}
