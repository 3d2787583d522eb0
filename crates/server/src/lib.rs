//! The partitioned, generation-aware transaction log server.
//!
//! A worker ([`ServerData`]) hosts several TLog groups. Each group
//! ([`group::GroupData`]) owns a disk queue and a key/value store and runs
//! one or more generations ([`generation::GenerationData`]), of which at
//! most one accepts commits at a time. Commit proxies push versioned
//! mutation batches per storage team; storage servers peek them back out
//! and pop the durable prefix, which lets memory blocks, spill records and
//! disk-queue bytes be reclaimed.

mod block;
mod notified;
mod queue_entry;

pub mod config;
pub mod error;
pub mod generation;
pub mod group;
pub mod messages;
pub mod server;

pub use crate::{
    config::TLogConfig,
    error::TLogError,
    messages::{InitializeTLogRequest, MessageTransferModel, TLogGroupRecruitment, TLogInterface},
    notified::NotifiedVersion,
    queue_entry::QueueEntry,
    server::{ClusterInfo, GroupStores, ServerData},
};

#[cfg(any(test, feature = "test"))]
pub use crate::server::MemoryStores;
