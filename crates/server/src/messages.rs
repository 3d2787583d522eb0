//! Wire messages of the TLog endpoints, and the channel-backed interface a
//! recruiter receives.
//!
//! Each message type carries a stable `FILE_IDENTIFIER` for schema routing.
//! Endpoint wiring is data-driven: [`TLogInterface::endpoints`] yields the
//! ordered descriptor list for the interface's transfer model rather than
//! relying on dispatch over some interface hierarchy.

use partlog_primitives::buf::{BufReader, BufWriter, DecodeError};
use partlog_primitives::{Epoch, RecruitmentId, SpillType, StorageTeamId, TLogGroupId, Tag, Version};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::error::TLogError;

/// Marker carried by every wire message for schema routing.
pub trait WireMessage {
    const FILE_IDENTIFIER: u32;
}

macro_rules! file_identifier {
    ($ty:ty = $id:literal) => {
        impl WireMessage for $ty {
            const FILE_IDENTIFIER: u32 = $id;
        }
    };
}

/// How consumers receive messages from this log worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageTransferModel {
    /// The worker pushes committed subsequences to storage servers.
    ActivelyPush,
    /// Storage servers pull via peek/pop.
    PassivelyPull,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TLogCommitRequest {
    pub span_id: u64,
    pub storage_team: StorageTeamId,
    /// Packed message bytes for this team at `version`.
    pub messages: Vec<u8>,
    /// The previously committed version of the owning group; serializes
    /// commits within a generation.
    pub prev_version: Version,
    pub version: Version,
    pub known_committed_version: Version,
    pub min_known_committed_version: Version,
    pub debug_id: Option<u64>,
}
file_identifier!(TLogCommitRequest = 4022206);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TLogCommitReply {
    pub durable_known_committed_version: Version,
}
file_identifier!(TLogCommitReply = 3);

/// Per-consumer ordering token; out-of-order sequences are dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeekCursor {
    pub client_id: u128,
    pub sequence: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TLogPeekRequest {
    pub storage_team: StorageTeamId,
    pub begin_version: Version,
    pub end_version: Option<Version>,
    pub only_spilled: bool,
    /// Reply immediately with `end = begin_version` instead of waiting for
    /// data to arrive.
    pub return_if_blocked: bool,
    pub cursor: Option<PeekCursor>,
    pub debug_id: Option<u64>,
}
file_identifier!(TLogPeekRequest = 11001131);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TLogPeekReply {
    /// Packed `(version, message bytes)` entries; see [`pack_messages`].
    pub data: Vec<u8>,
    /// Highest version included in `data`.
    pub end: Version,
    pub popped: Option<Version>,
    pub max_known_version: Version,
    pub min_known_committed_version: Version,
    /// Set when the served range started later than requested.
    pub begin: Option<Version>,
    /// Whether `data` ends within the spilled region.
    pub only_spilled: bool,
}
file_identifier!(TLogPeekReply = 11365689);

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TLogPopRequest {
    pub storage_team: StorageTeamId,
    pub tag: Tag,
    /// Versions `<= version` are durable on storage.
    pub version: Version,
    pub durable_known_committed_version: Version,
}
file_identifier!(TLogPopRequest = 5386987);

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TLogLockRequest {
    pub group: TLogGroupId,
}
file_identifier!(TLogLockRequest = 11822027);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TLogLockResult {
    pub end: Version,
    pub known_committed_version: Version,
}
file_identifier!(TLogLockResult = 11822028);

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TLogQueuingMetricsRequest {
    pub group: TLogGroupId,
}
file_identifier!(TLogQueuingMetricsRequest = 7798476);

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TLogQueuingMetricsReply {
    /// Seconds since the unix epoch at the serving worker.
    pub local_time: f64,
    pub instance_id: u64,
    pub bytes_durable: u64,
    pub bytes_input: u64,
    pub storage_bytes: u64,
    pub v: Version,
}
file_identifier!(TLogQueuingMetricsReply = 7798477);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TLogSnapRequest {
    pub snap_id: u128,
    pub payload: Vec<u8>,
}
file_identifier!(TLogSnapRequest = 8184128);

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TLogDisablePopRequest {
    pub snap_id: u128,
}
file_identifier!(TLogDisablePopRequest = 4022806);

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TLogEnablePopRequest {
    pub snap_id: u128,
}
file_identifier!(TLogEnablePopRequest = 4022809);

/// One group to host, with its storage-team assignment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TLogGroupRecruitment {
    pub group_id: TLogGroupId,
    pub teams: Vec<StorageTeamId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitializeTLogRequest {
    pub epoch: Epoch,
    pub recruitment_id: RecruitmentId,
    pub spill_type: SpillType,
    pub locality: i32,
    pub is_primary: bool,
    pub transfer_model: MessageTransferModel,
    pub groups: Vec<TLogGroupRecruitment>,
    /// The reserved transaction-state team, always spilled by value.
    pub txs_team: Option<StorageTeamId>,
}
file_identifier!(InitializeTLogRequest = 15604392);

/// Pack `(version, messages)` pairs into a peek reply payload.
///
/// Layout per entry: `version:u64 ‖ len:u32 ‖ bytes`.
pub fn pack_messages<'a>(entries: impl IntoIterator<Item = (Version, &'a [u8])>) -> Vec<u8> {
    let mut out = Vec::new();
    for (version, bytes) in entries {
        out.put_u64(version.0);
        out.put_u32(bytes.len() as u32);
        out.put_slice(bytes);
    }
    out
}

/// Inverse of [`pack_messages`].
pub fn unpack_messages(mut data: &[u8]) -> Result<Vec<(Version, Vec<u8>)>, DecodeError> {
    let mut out = Vec::new();
    while data.remaining() > 0 {
        let version = Version(data.get_u64()?);
        let len = data.get_u32()? as usize;
        out.push((version, data.get_slice(len)?.to_vec()));
    }
    Ok(out)
}

pub type ReplyTo<T> = oneshot::Sender<Result<T, TLogError>>;

/// The request stream behind a [`TLogInterface`].
pub enum TLogRequest {
    Commit(TLogCommitRequest, ReplyTo<TLogCommitReply>),
    Peek(TLogPeekRequest, ReplyTo<TLogPeekReply>),
    Pop(TLogPopRequest, ReplyTo<()>),
    Lock(TLogLockRequest, ReplyTo<TLogLockResult>),
    QueuingMetrics(TLogQueuingMetricsRequest, ReplyTo<TLogQueuingMetricsReply>),
    ConfirmRunning(ReplyTo<()>),
    WaitFailure(ReplyTo<()>),
    RecoveryFinished(ReplyTo<()>),
    Snap(TLogSnapRequest, ReplyTo<()>),
    DisablePop(TLogDisablePopRequest, ReplyTo<()>),
    EnablePop(TLogEnablePopRequest, ReplyTo<()>),
}

/// Descriptor of one hosted endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub name: &'static str,
    pub file_identifier: u32,
}

/// Handle to a recruited TLog worker.
///
/// Methods enqueue onto the worker's request stream and resolve with its
/// reply; a dropped worker surfaces as
/// [`TLogError::OperationCancelled`].
#[derive(Clone, Debug)]
pub struct TLogInterface {
    pub instance_id: u64,
    pub transfer_model: MessageTransferModel,
    tx: mpsc::Sender<TLogRequest>,
}

macro_rules! interface_call {
    ($name:ident, $variant:ident, $req:ty, $reply:ty) => {
        pub async fn $name(&self, req: $req) -> Result<$reply, TLogError> {
            let (reply_tx, reply_rx) = oneshot::channel();
            self.tx
                .send(TLogRequest::$variant(req, reply_tx))
                .await
                .map_err(|_| TLogError::OperationCancelled)?;
            reply_rx.await.map_err(|_| TLogError::OperationCancelled)?
        }
    };
    ($name:ident, $variant:ident) => {
        pub async fn $name(&self) -> Result<(), TLogError> {
            let (reply_tx, reply_rx) = oneshot::channel();
            self.tx
                .send(TLogRequest::$variant(reply_tx))
                .await
                .map_err(|_| TLogError::OperationCancelled)?;
            reply_rx.await.map_err(|_| TLogError::OperationCancelled)?
        }
    };
}

impl TLogInterface {
    pub(crate) fn new(
        instance_id: u64,
        transfer_model: MessageTransferModel,
        tx: mpsc::Sender<TLogRequest>,
    ) -> Self {
        Self {
            instance_id,
            transfer_model,
            tx,
        }
    }

    interface_call!(commit, Commit, TLogCommitRequest, TLogCommitReply);
    interface_call!(peek_messages, Peek, TLogPeekRequest, TLogPeekReply);
    interface_call!(pop_messages, Pop, TLogPopRequest, ());
    interface_call!(lock, Lock, TLogLockRequest, TLogLockResult);
    interface_call!(get_queuing_metrics, QueuingMetrics, TLogQueuingMetricsRequest, TLogQueuingMetricsReply);
    interface_call!(confirm_running, ConfirmRunning);
    interface_call!(wait_failure, WaitFailure);
    interface_call!(recovery_finished, RecoveryFinished);
    interface_call!(snap_request, Snap, TLogSnapRequest, ());
    interface_call!(disable_pop_request, DisablePop, TLogDisablePopRequest, ());
    interface_call!(enable_pop_request, EnablePop, TLogEnablePopRequest, ());

    /// The ordered endpoint set of this interface.
    pub fn endpoints(&self) -> Vec<EndpointDescriptor> {
        let mut endpoints = vec![
            EndpointDescriptor {
                name: "commit",
                file_identifier: TLogCommitRequest::FILE_IDENTIFIER,
            },
            EndpointDescriptor {
                name: "peekMessages",
                file_identifier: TLogPeekRequest::FILE_IDENTIFIER,
            },
            EndpointDescriptor {
                name: "popMessages",
                file_identifier: TLogPopRequest::FILE_IDENTIFIER,
            },
            EndpointDescriptor {
                name: "lock",
                file_identifier: TLogLockRequest::FILE_IDENTIFIER,
            },
            EndpointDescriptor {
                name: "getQueuingMetrics",
                file_identifier: TLogQueuingMetricsRequest::FILE_IDENTIFIER,
            },
            EndpointDescriptor {
                name: "confirmRunning",
                file_identifier: 4022808,
            },
            EndpointDescriptor {
                name: "waitFailure",
                file_identifier: 4022807,
            },
            EndpointDescriptor {
                name: "recoveryFinished",
                file_identifier: 4022810,
            },
            EndpointDescriptor {
                name: "snapRequest",
                file_identifier: TLogSnapRequest::FILE_IDENTIFIER,
            },
        ];
        if self.transfer_model == MessageTransferModel::PassivelyPull {
            endpoints.push(EndpointDescriptor {
                name: "disablePopRequest",
                file_identifier: TLogDisablePopRequest::FILE_IDENTIFIER,
            });
            endpoints.push(EndpointDescriptor {
                name: "enablePopRequest",
                file_identifier: TLogEnablePopRequest::FILE_IDENTIFIER,
            });
        }
        endpoints
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn packed_messages_roundtrip() {
        let entries = vec![
            (Version(10), b"a".to_vec()),
            (Version(20), b"bb".to_vec()),
            (Version(21), Vec::new()),
        ];
        let packed = pack_messages(entries.iter().map(|(v, b)| (*v, b.as_slice())));
        assert_eq!(unpack_messages(&packed).unwrap(), entries);
    }

    #[test]
    fn pull_interface_exposes_pop_control() {
        let (tx, _rx) = mpsc::channel(1);
        let push = TLogInterface::new(1, MessageTransferModel::ActivelyPush, tx.clone());
        let pull = TLogInterface::new(1, MessageTransferModel::PassivelyPull, tx);

        let names = |i: &TLogInterface| -> Vec<&'static str> { i.endpoints().iter().map(|e| e.name).collect() };
        assert!(!names(&push).contains(&"disablePopRequest"));
        assert!(names(&pull).ends_with(&["disablePopRequest", "enablePopRequest"]));

        // Identifiers are unique within an interface.
        let ids: std::collections::HashSet<_> = pull.endpoints().iter().map(|e| e.file_identifier).collect();
        assert_eq!(ids.len(), pull.endpoints().len());
    }
}
