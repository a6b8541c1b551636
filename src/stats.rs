//! Filesystem-wide statistics and capability flags --- [`StatsCache`],
//! [`Capabilities`].

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::Backend;
use crate::config::CoreConfig;
use crate::error::{Error, Result};

/// Logical capacity advertised per share. The core tracks usage, not
/// physical media; totals are fixed advertisement values.
pub const TOTAL_BYTES: u64 = 1 << 40;

/// Advertised inode capacity per share.
pub const TOTAL_INODES: u64 = 1 << 24;

/// Dynamic usage counters for one share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FsStatistics {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub total_inodes: u64,
    pub used_inodes: u64,
    pub available_inodes: u64,
}

impl FsStatistics {
    /// Builds the advertised view from raw scan counters.
    pub fn from_usage(used_bytes: u64, used_inodes: u64) -> Self {
        Self {
            total_bytes: TOTAL_BYTES,
            used_bytes,
            available_bytes: TOTAL_BYTES.saturating_sub(used_bytes),
            total_inodes: TOTAL_INODES,
            used_inodes,
            available_inodes: TOTAL_INODES.saturating_sub(used_inodes),
        }
    }
}

/// Immutable feature flags initialised at startup from the core
/// configuration. Protocol adapters answer FSINFO / PATHCONF /
/// FS_ATTRIBUTE_INFORMATION queries from this record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub maximum_read_size: u32,
    pub preferred_read_size: u32,
    pub maximum_write_size: u32,
    pub preferred_write_size: u32,
    pub maximum_file_size: u64,
    pub maximum_name_length: u32,
    pub maximum_path_length: u32,
    pub maximum_hard_links: u32,
    pub supports_hard_links: bool,
    pub supports_symlinks: bool,
    pub supports_acls: bool,
    pub case_sensitive: bool,
    pub case_preserving: bool,
    pub timestamp_resolution_nanos: u32,
}

impl Capabilities {
    pub fn from_config(config: &CoreConfig) -> Self {
        Self {
            maximum_read_size: config.maximum_read_size,
            preferred_read_size: config.preferred_read_size,
            maximum_write_size: config.maximum_write_size,
            preferred_write_size: config.preferred_write_size,
            maximum_file_size: u64::MAX,
            maximum_name_length: crate::entity::file::MAX_NAME_LEN as u32,
            maximum_path_length: crate::entity::file::MAX_PATH_LEN as u32,
            maximum_hard_links: u32::MAX,
            supports_hard_links: true,
            supports_symlinks: true,
            supports_acls: true,
            case_sensitive: config.case_sensitive,
            case_preserving: true,
            timestamp_resolution_nanos: config.timestamp_resolution_nanos,
        }
    }
}

/// Per-share statistics snapshots with TTL expiry.
///
/// Computing statistics scans the file table, so snapshots are cached
/// and refreshed single-flight: one reader performs the scan while
/// concurrent readers wait for the same snapshot.
pub struct StatsCache {
    backend: Arc<dyn Backend>,
    cache: Cache<String, Arc<FsStatistics>>,
}

impl StatsCache {
    pub fn new(backend: Arc<dyn Backend>, ttl: Duration) -> Self {
        let cache = Cache::builder().max_capacity(1024).time_to_live(ttl).build();
        Self { backend, cache }
    }

    /// Snapshot for a share, refreshed at most once per TTL window.
    pub async fn get(&self, share: &str) -> Result<Arc<FsStatistics>> {
        let backend = Arc::clone(&self.backend);
        let name = share.to_owned();
        self.cache
            .try_get_with(name.clone(), async move {
                debug!(share = %name, "refreshing statistics snapshot");
                let mut tx = backend.begin_read().await?;
                tx.scan_statistics(&name).await.map(Arc::new)
            })
            .await
            .map_err(|e: Arc<Error>| (*e).clone())
    }

    /// Drops the cached snapshot so the next reader rescans.
    pub async fn invalidate(&self, share: &str) {
        self.cache.invalidate(share).await;
    }
}
