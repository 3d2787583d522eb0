use std::time::Duration;

use partlog_primitives::SpillType;
use serde::{Deserialize, Serialize};

/// [`crate::ServerData`] knobs.
///
/// Every subsystem receives the configuration explicitly; there are no
/// process-wide singletons.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TLogConfig {
    /// Restore-pipeline sizing, passed through to external restore tooling.
    pub num_loaders: usize,
    /// See [`Self::num_loaders`].
    pub num_appliers: usize,
    /// How newly recruited generations spill overflowing memory.
    pub spill_type: SpillType,
    /// Spill starts once `bytes_input - bytes_durable` exceeds this.
    ///
    /// Default: 1.5GB
    pub spill_threshold_bytes: u64,
    /// Commits stall (with jitter) while `bytes_input - bytes_durable` is at
    /// or above this.
    ///
    /// Default: 3GB
    pub hard_limit_bytes: u64,
    /// Pending disk-queue bytes that force an immediate queue commit.
    ///
    /// Default: 4MB
    pub max_queue_commit_bytes: u64,
    /// Size of the shared message blocks team indices reference into.
    ///
    /// Default: 10MB
    pub default_block_bytes: usize,
    /// A single message above this size is accepted but warned about.
    ///
    /// Default: 2MB
    pub max_message_size: usize,
    /// Process-wide cap on in-flight peek response bytes.
    ///
    /// Default: 32MiB
    pub peek_memory_bytes: usize,
    /// Target size of a single peek reply.
    ///
    /// Default: 150KB
    pub peek_reply_bytes: usize,
    /// Concurrency bound for spilled-record reads serving one peek.
    pub concurrent_log_router_reads: usize,
    /// Hard deadline for creating a group's stores during recruitment.
    pub tlog_max_create_duration: Duration,
    /// A commit slower than this logs a warning while it keeps waiting.
    pub warning_timeout: Duration,
    /// Whether commits wait for disk-queue durability.
    ///
    /// Disabling elects the in-memory-only commit mode: the queue push is
    /// skipped and the queue-committed version advances without an fsync.
    /// Recovery then starts empty.
    pub durable_queue_commit: bool,
    /// Payload bytes per disk-queue file before rotation is attempted.
    pub disk_queue_file_bytes: u64,
}

impl Default for TLogConfig {
    fn default() -> Self {
        Self {
            num_loaders: 8,
            num_appliers: 8,
            spill_type: SpillType::default(),
            spill_threshold_bytes: 1_500_000_000,
            hard_limit_bytes: 3_000_000_000,
            max_queue_commit_bytes: 4_000_000,
            default_block_bytes: 10_000_000,
            max_message_size: 2_000_000,
            peek_memory_bytes: 32 << 20,
            peek_reply_bytes: 150_000,
            concurrent_log_router_reads: 4,
            tlog_max_create_duration: Duration::from_secs(10),
            warning_timeout: Duration::from_millis(100),
            durable_queue_commit: true,
            disk_queue_file_bytes: 128 * 1024 * 1024,
        }
    }
}
