use crate::common::{attrs, root_ctx, user_ctx, Fixture};
use dittofs::error::Error;

#[tokio::test]
async fn mkdir_links_parent_and_child() {
    let fixture = Fixture::new().await;
    let ctx = user_ctx(1000, 100);
    let dir = fixture
        .service
        .make_dir(&ctx, &fixture.root, "sub", attrs(0))
        .await
        .expect("make dir");
    // Zero mode defaults to 0755; empty directories carry two links.
    assert_eq!(dir.mode, 0o755);
    assert_eq!(dir.nlink, 2);

    let root = fixture.service.get_attr(&ctx, &fixture.root).await.expect("root attr");
    assert_eq!(root.nlink, 3, "parent gains a link from the child's ..");
}

#[tokio::test]
async fn listing_is_sorted_and_synthesizes_dot_entries() {
    let fixture = Fixture::new().await;
    let ctx = user_ctx(1000, 100);
    for name in ["zeta", "alpha", "mid"] {
        fixture.service.create(&ctx, &fixture.root, name, attrs(0o644)).await.expect("create");
    }
    let page =
        fixture.service.list_children(&ctx, &fixture.root, None, 100).await.expect("list");
    assert!(page.eof);
    let names: Vec<&str> = page.entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec![".", "..", "alpha", "mid", "zeta"]);
    // The root is its own parent.
    assert_eq!(page.entries[0].entry.id, page.entries[1].entry.id);
}

#[tokio::test]
async fn listing_paginates_strictly_after_the_cursor() {
    let fixture = Fixture::new().await;
    let ctx = user_ctx(1000, 100);
    for index in 0..10 {
        fixture
            .service
            .create(&ctx, &fixture.root, &format!("f{index:02}"), attrs(0o644))
            .await
            .expect("create");
    }
    let first = fixture.service.list_children(&ctx, &fixture.root, None, 4).await.expect("page");
    assert!(!first.eof);
    let real: Vec<String> = first
        .entries
        .iter()
        .filter(|e| e.name != "." && e.name != "..")
        .map(|e| e.name.clone())
        .collect();
    assert_eq!(real, vec!["f00", "f01", "f02", "f03"]);

    let second = fixture
        .service
        .list_children(&ctx, &fixture.root, Some("f03"), 100)
        .await
        .expect("page");
    assert!(second.eof);
    assert_eq!(second.entries.first().map(|e| e.name.as_str()), Some("f04"));
    assert_eq!(second.entries.len(), 6);
}

#[tokio::test]
async fn listing_is_stable_under_concurrent_inserts() {
    let fixture = Fixture::new().await;
    let ctx = user_ctx(1000, 100);
    for name in ["b", "d", "f"] {
        fixture.service.create(&ctx, &fixture.root, name, attrs(0o644)).await.expect("create");
    }
    let first = fixture.service.list_children(&ctx, &fixture.root, None, 4).await.expect("page");
    let cursor = first.entries.last().expect("entry").name.clone();
    assert_eq!(cursor, "d");

    // An insert before the cursor must not disturb the continuation.
    fixture.service.create(&ctx, &fixture.root, "a", attrs(0o644)).await.expect("create");
    let rest = fixture
        .service
        .list_children(&ctx, &fixture.root, Some(&cursor), 100)
        .await
        .expect("page");
    let names: Vec<&str> = rest.entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["f"]);
}

#[tokio::test]
async fn listing_needs_read_permission() {
    let fixture = Fixture::new().await;
    let owner = user_ctx(1000, 100);
    let dir = fixture
        .service
        .make_dir(&owner, &fixture.root, "opaque", attrs(0o711))
        .await
        .expect("make dir");
    let handle = fixture.service.handle_for(&dir).expect("handle");
    let stranger = user_ctx(2000, 200);
    assert_eq!(
        fixture.service.list_children(&stranger, &handle, None, 10).await.map(|_| ()),
        Err(Error::PermissionDenied)
    );
}

#[tokio::test]
async fn listing_a_file_is_not_directory() {
    let fixture = Fixture::new().await;
    let ctx = root_ctx();
    let entry =
        fixture.service.create(&ctx, &fixture.root, "flat", attrs(0o644)).await.expect("create");
    let handle = fixture.service.handle_for(&entry).expect("handle");
    assert_eq!(
        fixture.service.list_children(&ctx, &handle, None, 10).await.map(|_| ()),
        Err(Error::NotDirectory)
    );
}
