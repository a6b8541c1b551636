//! Defines the core configuration record --- [`CoreConfig`].
//!
//! There are no process-wide globals; each option flows through the
//! metadata service configuration record at construction. The record
//! deserializes from TOML so deployments can ship a config file, and
//! persists through the backend `server_config` slot.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Options recognized by the core. Durations are expressed as integer
/// seconds or milliseconds in the file form; accessors return
/// [`Duration`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Post-restart window during which only lock reclaims are accepted.
    pub grace_window_secs: u64,
    /// Client lease duration used by stateful protocols.
    pub lease_duration_secs: u64,
    /// How long an oplock holder may take to acknowledge a break before
    /// the oplock is revoked.
    pub oplock_break_timeout_ms: u64,
    /// How long a filesystem statistics snapshot stays fresh.
    pub stats_cache_ttl_secs: u64,
    /// Upper bound on relational backend connections.
    pub connection_pool_max: u32,
    /// Connections the relational backend keeps warm.
    pub connection_pool_min: u32,
    /// Hard bound on waiting for a pooled connection. Exceeding it fails
    /// the call with an i/o error; no caller blocks indefinitely.
    pub connection_pool_acquire_timeout_ms: u64,
    /// How many times a transaction closure is re-run on retryable
    /// conflicts before the error is surfaced.
    pub transaction_retry_max: u32,
    /// First retry backoff; doubles on each subsequent attempt.
    pub retry_backoff_base_ms: u64,
    /// Largest read the server accepts in one call.
    pub maximum_read_size: u32,
    /// Read size the server performs best at.
    pub preferred_read_size: u32,
    /// Largest write the server accepts in one call.
    pub maximum_write_size: u32,
    /// Write size the server performs best at.
    pub preferred_write_size: u32,
    /// Whether name lookup distinguishes case. Names are stored
    /// byte-exact either way.
    pub case_sensitive: bool,
    /// Granularity of stored timestamps, in nanoseconds.
    pub timestamp_resolution_nanos: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            grace_window_secs: 90,
            lease_duration_secs: 30,
            oplock_break_timeout_ms: 30_000,
            stats_cache_ttl_secs: 5,
            connection_pool_max: 16,
            connection_pool_min: 1,
            connection_pool_acquire_timeout_ms: 5_000,
            transaction_retry_max: 3,
            retry_backoff_base_ms: 10,
            maximum_read_size: 1 << 20,
            preferred_read_size: 256 << 10,
            maximum_write_size: 1 << 20,
            preferred_write_size: 256 << 10,
            case_sensitive: true,
            timestamp_resolution_nanos: 1,
        }
    }
}

impl CoreConfig {
    /// Parses a TOML document. Unknown or malformed options fail with
    /// [`Error::InvalidArgument`].
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::InvalidArgument(format!("config: {e}")))
    }

    pub fn grace_window(&self) -> Duration {
        Duration::from_secs(self.grace_window_secs)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    pub fn oplock_break_timeout(&self) -> Duration {
        Duration::from_millis(self.oplock_break_timeout_ms)
    }

    pub fn stats_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.stats_cache_ttl_secs)
    }

    pub fn connection_pool_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_pool_acquire_timeout_ms)
    }

    pub fn retry_backoff_base(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_base_ms)
    }
}
