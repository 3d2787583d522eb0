use std::io;
use std::time::Duration;

use partlog_diskqueue::error::QueueError;
use partlog_kvstore::KvError;
use partlog_primitives::buf::DecodeError;
use partlog_primitives::{StorageTeamId, TLogGroupId};
use thiserror::Error;

/// The error taxonomy of the TLog server.
///
/// Commit/peek/pop failures are returned to the caller and leave the
/// generation running; [`TLogError::WorkerRemoved`] and the I/O variants are
/// tier failures which terminate the owning group or worker.
#[derive(Debug, Error)]
pub enum TLogError {
    /// A commit reached a stopped generation, or the generation stopped
    /// while the commit waited for queue durability.
    #[error("tlog stopped")]
    TLogStopped,
    /// The current active generation does not know this storage team.
    #[error("storage team {0} not found in the active generation")]
    TeamNotFound(StorageTeamId),
    /// The worker hosts no such group.
    #[error("tlog group {0} not found")]
    GroupNotFound(TLogGroupId),
    /// Displaced by newer cluster information; all generations of this
    /// worker are removed.
    #[error("worker removed")]
    WorkerRemoved,
    /// Fatal error during `tlog_start`; in-flight recruitment promises are
    /// rejected.
    #[error("recruitment failed: {reason}")]
    RecruitmentFailed { reason: String },
    /// The disk subsystem did not answer within the configured duration.
    #[error("disk operation exceeded {0:?}")]
    IoTimeout(Duration),
    /// The disk subsystem is degraded; the group is terminated.
    #[error("disk subsystem degraded")]
    IoDegraded,
    /// Durable format violation in the disk queue.
    #[error("corrupt log")]
    CorruptLog(#[source] QueueError),
    /// A durable record failed to decode.
    #[error("corrupt queue entry")]
    CorruptEntry(#[source] DecodeError),
    /// The group store carries a format marker this build cannot serve.
    #[error("unsupported store format: {0}")]
    UnsupportedFormat(String),
    /// Normal termination signal from disk-queue replay.
    #[error("end of stream")]
    EndOfStream,
    /// The owning handle was dropped. Not an error at shutdown.
    #[error("operation cancelled")]
    OperationCancelled,
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<QueueError> for TLogError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Io(e) => TLogError::Io(e),
            other => TLogError::CorruptLog(other),
        }
    }
}

impl TLogError {
    /// `true` for errors which terminate the group or worker rather than
    /// just the failed request.
    pub fn is_tier_failure(&self) -> bool {
        matches!(
            self,
            TLogError::WorkerRemoved
                | TLogError::IoTimeout(_)
                | TLogError::IoDegraded
                | TLogError::CorruptLog(_)
                | TLogError::Io(_)
        )
    }
}
