use crate::common::{attrs, user_ctx, Fixture};
use dittofs::entity::{Device, FileType};
use dittofs::error::Error;

#[tokio::test]
async fn symlink_round_trips_its_target() {
    let fixture = Fixture::new().await;
    let ctx = user_ctx(1000, 100);
    let link = fixture
        .service
        .make_symlink(&ctx, &fixture.root, "ln", "../target/file", attrs(0))
        .await
        .expect("symlink");
    assert_eq!(link.file_type, FileType::Symlink);
    assert_eq!(link.mode, 0o777);
    assert_eq!(link.size, "../target/file".len() as u64);

    let handle = fixture.service.handle_for(&link).expect("handle");
    assert_eq!(
        fixture.service.read_link(&ctx, &handle).await.expect("read link"),
        "../target/file"
    );
}

#[tokio::test]
async fn read_link_on_a_file_is_invalid() {
    let fixture = Fixture::new().await;
    let ctx = user_ctx(1000, 100);
    let entry =
        fixture.service.create(&ctx, &fixture.root, "plain", attrs(0o644)).await.expect("create");
    let handle = fixture.service.handle_for(&entry).expect("handle");
    assert!(matches!(
        fixture.service.read_link(&ctx, &handle).await,
        Err(Error::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn device_nodes_carry_major_minor() {
    let fixture = Fixture::new().await;
    let ctx = user_ctx(1000, 100);
    let node = fixture
        .service
        .make_node(
            &ctx,
            &fixture.root,
            "disk",
            FileType::BlockDevice,
            Some(Device { major: 8, minor: 1 }),
            attrs(0o660),
        )
        .await
        .expect("mknod");
    assert_eq!(node.device, Some(Device { major: 8, minor: 1 }));

    assert!(matches!(
        fixture
            .service
            .make_node(&ctx, &fixture.root, "bad", FileType::CharDevice, None, attrs(0o660))
            .await,
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        fixture
            .service
            .make_node(
                &ctx,
                &fixture.root,
                "worse",
                FileType::Fifo,
                Some(Device { major: 1, minor: 2 }),
                attrs(0o660)
            )
            .await,
        Err(Error::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn fifos_and_sockets_are_plain_nodes() {
    let fixture = Fixture::new().await;
    let ctx = user_ctx(1000, 100);
    let fifo = fixture
        .service
        .make_node(&ctx, &fixture.root, "pipe", FileType::Fifo, None, attrs(0o644))
        .await
        .expect("fifo");
    assert_eq!(fifo.file_type, FileType::Fifo);
    let socket = fixture
        .service
        .make_node(&ctx, &fixture.root, "sock", FileType::Socket, None, attrs(0o644))
        .await
        .expect("socket");
    assert_eq!(socket.file_type, FileType::Socket);
}

#[tokio::test]
async fn directories_cannot_be_hard_linked() {
    let fixture = Fixture::new().await;
    let ctx = user_ctx(1000, 100);
    let dir =
        fixture.service.make_dir(&ctx, &fixture.root, "d", attrs(0o755)).await.expect("mkdir");
    let handle = fixture.service.handle_for(&dir).expect("handle");
    assert_eq!(
        fixture.service.hard_link(&ctx, &handle, &fixture.root, "alias").await.map(|_| ()),
        Err(Error::IsDirectory)
    );
}
