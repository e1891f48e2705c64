//! Saga configuration.

use std::time::Duration;

use edupanel_core::defaults::{ATTACHMENT_MAX_BYTES, BATCH_MAX_CONCURRENT, SAGA_CALL_TIMEOUT_SECS};

/// Configuration shared by the saga, the batch coordinator and the deletion guard.
#[derive(Debug, Clone, PartialEq)]
pub struct SagaConfig {
    /// Upper bound on a single record-store or attachment-store call.
    pub call_timeout: Duration,
    /// Maximum number of sub-operations a batch runs at once.
    pub batch_max_concurrent: usize,
    /// Largest attachment accepted, in bytes.
    pub max_attachment_bytes: u64,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(SAGA_CALL_TIMEOUT_SECS),
            batch_max_concurrent: BATCH_MAX_CONCURRENT,
            max_attachment_bytes: ATTACHMENT_MAX_BYTES,
        }
    }
}

impl SagaConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `SAGA_CALL_TIMEOUT_SECS` | `30` | Per-call collaborator timeout |
    /// | `BATCH_MAX_CONCURRENT` | `16` | Concurrent sub-operations per batch |
    /// | `ATTACHMENT_MAX_BYTES` | `26214400` | Attachment size limit |
    pub fn from_env() -> Self {
        let call_timeout = std::env::var("SAGA_CALL_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(SAGA_CALL_TIMEOUT_SECS));

        let batch_max_concurrent = std::env::var("BATCH_MAX_CONCURRENT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(BATCH_MAX_CONCURRENT)
            .max(1);

        let max_attachment_bytes = std::env::var("ATTACHMENT_MAX_BYTES")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(ATTACHMENT_MAX_BYTES);

        Self {
            call_timeout,
            batch_max_concurrent,
            max_attachment_bytes,
        }
    }

    /// Set the per-call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Set the batch concurrency limit (at least 1).
    pub fn with_batch_max_concurrent(mut self, max: usize) -> Self {
        self.batch_max_concurrent = max.max(1);
        self
    }

    /// Set the attachment size limit.
    pub fn with_max_attachment_bytes(mut self, max: u64) -> Self {
        self.max_attachment_bytes = max;
        self
    }
}
