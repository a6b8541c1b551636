use std::sync::Arc;

use dittofs::backend::{Backend, KvBackend, MemoryBackend, SqlBackend};
use dittofs::config::CoreConfig;
use dittofs::entity::{FileEntry, FileId, FileType, Share, ShareOptions};
use tempfile::TempDir;

/// The three backends under one temp directory; every conformance test
/// runs its sequence against each of them.
pub struct Backends {
    pub tempdir: TempDir,
    pub all: Vec<(&'static str, Arc<dyn Backend>)>,
}

pub async fn all_backends() -> Backends {
    let tempdir = TempDir::new().expect("create temp dir");
    let config = CoreConfig::default();
    let memory: Arc<dyn Backend> = Arc::new(MemoryBackend::new(&config));
    let kv: Arc<dyn Backend> = Arc::new(
        KvBackend::open(tempdir.path().join("kv"), &config).expect("open kv backend"),
    );
    let sql: Arc<dyn Backend> = Arc::new(
        SqlBackend::open(tempdir.path().join("meta.db"), &config)
            .await
            .expect("open sql backend"),
    );
    Backends { tempdir, all: vec![("memory", memory), ("kv", kv), ("sql", sql)] }
}

pub fn file_entry(share: &str, path: &str) -> FileEntry {
    FileEntry::new(FileId::generate(), share, path, FileType::Regular, 0o644)
}

pub fn dir_entry(share: &str, path: &str) -> FileEntry {
    FileEntry::new(FileId::generate(), share, path, FileType::Directory, 0o755)
}

pub fn share(name: &str) -> Share {
    Share::new(name, ShareOptions::default(), FileId::generate())
}
