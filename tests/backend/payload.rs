use crate::common::all_backends;
use dittofs::entity::{BlockRecord, ChunkRecord, ContentHash, FileTime, ObjectRecord};
use dittofs::error::Error;

fn object(tag: &[u8]) -> ObjectRecord {
    ObjectRecord {
        hash: ContentHash::digest(tag),
        size: 4096,
        chunk_count: 1,
        refcount: 1,
        finalized: false,
        created_at: FileTime::now(),
    }
}

fn chunk(tag: &[u8], object: ContentHash, index: u32) -> ChunkRecord {
    ChunkRecord {
        hash: ContentHash::digest(tag),
        object,
        index,
        size: 4096,
        block_count: 1,
        refcount: 1,
    }
}

fn block(tag: &[u8], chunk: ContentHash, index: u32) -> BlockRecord {
    BlockRecord {
        hash: ContentHash::digest(tag),
        chunk,
        index,
        size: 4096,
        refcount: 1,
        uploaded_at: None,
    }
}

#[tokio::test]
async fn object_chunk_block_round_trip() {
    let backends = all_backends().await;
    for (name, backend) in &backends.all {
        let obj = object(b"o1");
        let c0 = chunk(b"c0", obj.hash, 0);
        let c1 = chunk(b"c1", obj.hash, 1);
        let b0 = block(b"b0", c0.hash, 0);
        let b1 = block(b"b1", c0.hash, 1);

        let mut tx = backend.begin_write().await.expect("begin write");
        tx.put_object(&obj).await.expect("put object");
        // Insert out of index order; reads must come back ordered.
        tx.put_chunk(&c1).await.expect("put chunk");
        tx.put_chunk(&c0).await.expect("put chunk");
        tx.put_block(&b1).await.expect("put block");
        tx.put_block(&b0).await.expect("put block");
        tx.commit().await.expect("commit");

        let mut tx = backend.begin_read().await.expect("begin read");
        assert_eq!(tx.get_object(obj.hash).await.expect("get object"), obj, "{name}");
        let chunks = tx.get_chunks_by_object(obj.hash).await.expect("chunks");
        assert_eq!(
            chunks.iter().map(|c| c.index).collect::<Vec<_>>(),
            vec![0, 1],
            "{name}: chunk order"
        );
        let blocks = tx.get_blocks_by_chunk(c0.hash).await.expect("blocks");
        assert_eq!(
            blocks.iter().map(|b| b.index).collect::<Vec<_>>(),
            vec![0, 1],
            "{name}: block order"
        );
    }
}

#[tokio::test]
async fn find_block_by_hash_is_nullable() {
    let backends = all_backends().await;
    for (name, backend) in &backends.all {
        let obj = object(b"o2");
        let c = chunk(b"c2", obj.hash, 0);
        let b = block(b"b2", c.hash, 0);
        let mut tx = backend.begin_write().await.expect("begin write");
        tx.put_object(&obj).await.expect("put object");
        tx.put_chunk(&c).await.expect("put chunk");
        tx.put_block(&b).await.expect("put block");
        tx.commit().await.expect("commit");

        let mut tx = backend.begin_read().await.expect("begin read");
        assert_eq!(
            tx.find_block_by_hash(b.hash).await.expect("probe"),
            Some(b.clone()),
            "{name}"
        );
        assert_eq!(
            tx.find_block_by_hash(ContentHash::digest(b"absent")).await.expect("probe"),
            None,
            "{name}: absence must be a value, not an error"
        );
    }
}

#[tokio::test]
async fn refcounts_saturate_at_zero() {
    // P8: stored refcount equals max(0, puts + increments - decrements).
    let backends = all_backends().await;
    for (name, backend) in &backends.all {
        let obj = object(b"o3");
        let mut tx = backend.begin_write().await.expect("begin write");
        tx.put_object(&obj).await.expect("put object");
        assert_eq!(tx.increment_object_refcount(obj.hash).await.expect("incr"), 2, "{name}");
        assert_eq!(tx.decrement_object_refcount(obj.hash).await.expect("decr"), 1, "{name}");
        assert_eq!(tx.decrement_object_refcount(obj.hash).await.expect("decr"), 0, "{name}");
        assert_eq!(
            tx.decrement_object_refcount(obj.hash).await.expect("decr saturates"),
            0,
            "{name}"
        );
        tx.commit().await.expect("commit");

        let mut tx = backend.begin_read().await.expect("begin read");
        assert_eq!(tx.get_object(obj.hash).await.expect("get").refcount, 0, "{name}");
    }
}

#[tokio::test]
async fn block_upload_marking_makes_it_durable() {
    let backends = all_backends().await;
    for (name, backend) in &backends.all {
        let obj = object(b"o4");
        let c = chunk(b"c4", obj.hash, 0);
        let b = block(b"b4", c.hash, 0);
        let mut tx = backend.begin_write().await.expect("begin write");
        tx.put_object(&obj).await.expect("put object");
        tx.put_chunk(&c).await.expect("put chunk");
        tx.put_block(&b).await.expect("put block");
        tx.commit().await.expect("commit");

        let mut tx = backend.begin_read().await.expect("begin read");
        assert!(!tx.get_block(b.hash).await.expect("get").is_durable(), "{name}");

        let when = FileTime::now();
        let mut tx = backend.begin_write().await.expect("begin write");
        tx.mark_block_uploaded(b.hash, when).await.expect("mark uploaded");
        tx.commit().await.expect("commit");

        let mut tx = backend.begin_read().await.expect("begin read");
        let stored = tx.get_block(b.hash).await.expect("get");
        assert_eq!(stored.uploaded_at, Some(when), "{name}");
        assert!(stored.is_durable(), "{name}");
    }
}

#[tokio::test]
async fn deleting_records_requires_existence() {
    let backends = all_backends().await;
    for (name, backend) in &backends.all {
        let mut tx = backend.begin_write().await.expect("begin write");
        let ghost = ContentHash::digest(b"ghost");
        assert_eq!(tx.delete_object(ghost).await, Err(Error::NotFound), "{name}");
        assert_eq!(tx.delete_chunk(ghost).await, Err(Error::NotFound), "{name}");
        assert_eq!(tx.delete_block(ghost).await, Err(Error::NotFound), "{name}");
    }
}
