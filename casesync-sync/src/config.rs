//! Engine configuration.

use crate::error::SyncResult;
use crate::queue::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the sync engine.
///
/// Durations are stored in milliseconds so the struct can be read from the
/// host application's JSON settings as-is. Missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Quiet period after the last edit before the merged patch is flushed.
    pub debounce_ms: u64,
    /// Upper bound on how long continuous editing may postpone a flush.
    pub debounce_max_wait_ms: Option<u64>,
    /// Retry policy for retryable write failures.
    pub retry: RetryPolicy,
    /// How long `saved` stays visible before reverting to `idle`.
    pub status_grace_ms: u64,
    /// Timeout applied to each persistence request.
    pub request_timeout_ms: u64,
    /// Capacity of each entity worker's command channel.
    pub command_buffer: usize,
    /// Capacity of the presentation event channel.
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 300,
            debounce_max_wait_ms: None,
            retry: RetryPolicy::default(),
            status_grace_ms: 2_000,
            request_timeout_ms: 10_000,
            command_buffer: 64,
            event_buffer: 256,
        }
    }
}

impl SyncConfig {
    /// Parses a configuration from JSON. Absent keys keep their defaults.
    pub fn from_json_str(json: &str) -> SyncResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Debounce quiet period.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Maximum debounce wait, if bounded.
    pub fn debounce_max_wait(&self) -> Option<Duration> {
        self.debounce_max_wait_ms.map(Duration::from_millis)
    }

    /// Grace period for the `saved` status.
    pub fn status_grace(&self) -> Duration {
        Duration::from_millis(self.status_grace_ms)
    }

    /// Per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
