use crate::common::{all_backends, dir_entry, file_entry};
use dittofs::error::Error;

#[tokio::test]
async fn child_edges_round_trip() {
    let backends = all_backends().await;
    for (name, backend) in &backends.all {
        let dir = dir_entry("export", "/d");
        let child = file_entry("export", "/d/f");
        let mut tx = backend.begin_write().await.expect("begin write");
        tx.put_file(&dir).await.expect("put dir");
        tx.put_file(&child).await.expect("put child");
        tx.set_child(dir.id, "f", child.id).await.expect("set child");
        tx.commit().await.expect("commit");

        let mut tx = backend.begin_read().await.expect("begin read");
        assert_eq!(tx.get_child(dir.id, "f").await.expect("get child"), child.id, "{name}");
        assert_eq!(tx.get_child(dir.id, "missing").await, Err(Error::NotFound), "{name}");

        let mut tx = backend.begin_write().await.expect("begin write");
        tx.delete_child(dir.id, "f").await.expect("delete child");
        assert_eq!(tx.delete_child(dir.id, "f").await, Err(Error::NotFound), "{name}");
        tx.commit().await.expect("commit");
    }
}

#[tokio::test]
async fn listing_is_byte_ordered_and_cursor_paginated() {
    let backends = all_backends().await;
    // Deliberately unsorted insertion; byte order puts "B" before "a".
    let names = ["delta", "a", "B", "zz", "m"];
    let mut sorted: Vec<&str> = names.to_vec();
    sorted.sort_unstable();
    for (backend_name, backend) in &backends.all {
        let dir = dir_entry("export", "/d");
        let mut tx = backend.begin_write().await.expect("begin write");
        tx.put_file(&dir).await.expect("put dir");
        for name in names {
            let child = file_entry("export", &format!("/d/{name}"));
            tx.put_file(&child).await.expect("put child");
            tx.set_child(dir.id, name, child.id).await.expect("set child");
        }
        tx.commit().await.expect("commit");

        let mut tx = backend.begin_read().await.expect("begin read");
        let full = tx.list_children(dir.id, None, 100).await.expect("list all");
        let listed: Vec<&str> = full.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(listed, sorted, "{backend_name}: listing order");

        // Page strictly after the cursor, two entries at a time.
        let mut paged = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page =
                tx.list_children(dir.id, cursor.as_deref(), 2).await.expect("list page");
            if page.is_empty() {
                break;
            }
            cursor = Some(page.last().expect("page entry").0.clone());
            paged.extend(page.into_iter().map(|(n, _)| n));
        }
        assert_eq!(paged, sorted, "{backend_name}: paged listing");
    }
}

#[tokio::test]
async fn listing_empty_directory_is_empty_not_an_error() {
    let backends = all_backends().await;
    for (name, backend) in &backends.all {
        let dir = dir_entry("export", "/empty");
        let mut tx = backend.begin_write().await.expect("begin write");
        tx.put_file(&dir).await.expect("put dir");
        tx.commit().await.expect("commit");

        let mut tx = backend.begin_read().await.expect("begin read");
        assert!(
            tx.list_children(dir.id, None, 10).await.expect("list").is_empty(),
            "{name}"
        );
    }
}
