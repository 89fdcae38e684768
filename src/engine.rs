//! Interfaces to the external collaborators of the streaming engine.
//!
//! The storage engine, the in-memory checkpoint manager, the replica
//! vbucket store, and the network layer all live outside this crate; the
//! traits here are the only surface the engine consumes.

use std::sync::Arc;

use crate::dcp::active::ActiveStream;
use crate::dcp::stream::StreamRequest;
use crate::error::EngineStatus;
use crate::item::{Item, QueuedItem};
use crate::types::{ConnCookie, VbUuid, Vbid, VbucketState};

/// Outcome of validating a stream request against the failover history.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RollbackCheck {
    /// The requested `{uuid, snapshot}` is consistent with local history.
    NoRollback,
    /// The peer must roll back to this seqno before streaming.
    RollbackAt(u64),
    /// The vbucket is unknown here.
    NoVbucket,
}

/// Disk backfill source. Implementations deliver items asynchronously via
/// the stream's `mark_disk_snapshot` / `backfill_received` /
/// `complete_backfill` / `scan_error` callbacks; a `false` return from
/// `backfill_received` asks the scan to pause until the stream drains.
pub trait BackfillScheduler: Send + Sync {
    fn begin_backfill(&self, stream: Arc<ActiveStream>, start_seqno: u64, end_seqno: u64);
}

/// Producer-side view of a vbucket and its checkpoint manager.
pub trait CheckpointAccess: Send + Sync {
    fn vbucket_state(&self, vb: Vbid) -> Option<VbucketState>;

    fn high_seqno(&self, vb: Vbid) -> u64;

    fn vb_uuid(&self, vb: Vbid) -> VbUuid;

    /// Validates the request against the failover table.
    fn rollback_check(&self, vb: Vbid, req: &StreamRequest) -> RollbackCheck;

    /// Registers a named cursor so checkpoint items at or past
    /// `start_seqno` stay pinned until the stream has read them.
    fn register_cursor(&self, vb: Vbid, cursor: &str, start_seqno: u64);

    fn remove_cursor(&self, vb: Vbid, cursor: &str);

    /// Drains the cursor's outstanding items: a contiguous batch in seqno
    /// order, with any queued vbucket state changes embedded in place.
    fn get_outstanding_items(&self, vb: Vbid, cursor: &str) -> Vec<QueuedItem>;
}

/// Consumer-side application surface: replicated messages are applied to
/// the local vbucket under its own locking, outside this crate.
pub trait ReplicaVbuckets: Send + Sync {
    fn apply_mutation(&self, vb: Vbid, item: &Item) -> EngineStatus;

    fn apply_deletion(&self, vb: Vbid, item: &Item) -> EngineStatus;

    fn set_vbucket_state(&self, vb: Vbid, state: VbucketState) -> EngineStatus;

    /// A snapshot has been fully received; `on_disk` marks it as a disk
    /// snapshot whose end seqno should be persisted as high-completed.
    fn record_snapshot_end(&self, vb: Vbid, end_seqno: u64, on_disk: bool);

    /// Resume coordinates for re-requesting a stream on this vbucket.
    fn stream_resume_info(&self, vb: Vbid) -> Option<StreamResumeInfo>;
}

/// Where a consumer restarts a stream from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamResumeInfo {
    pub start_seqno: u64,
    pub vb_uuid: VbUuid,
    pub snap_start_seqno: u64,
    pub snap_end_seqno: u64,
}

/// Network layer wakeups for paused connections.
pub trait IoNotifier: Send + Sync {
    fn notify_io_complete(&self, cookie: ConnCookie, status: EngineStatus);
}
