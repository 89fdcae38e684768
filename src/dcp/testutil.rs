//! Mock collaborators shared by the dcp unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::dcp::active::ActiveStream;
use crate::dcp::stream::StreamRequest;
use crate::engine::{
    BackfillScheduler, CheckpointAccess, IoNotifier, ReplicaVbuckets, RollbackCheck,
    StreamResumeInfo,
};
use crate::error::EngineStatus;
use crate::item::{Item, QueuedItem};
use crate::types::{ConnCookie, StreamFlags, VbUuid, Vbid, VbucketState, OPEN_ENDED};

pub(crate) fn stream_request(vb: Vbid, start: u64, end: u64) -> StreamRequest {
    StreamRequest {
        name: "test-conn".to_string(),
        flags: StreamFlags::none(),
        opaque: 99,
        vbucket: vb,
        start_seqno: start,
        end_seqno: end,
        vb_uuid: VbUuid(0xabcd),
        snap_start_seqno: start,
        snap_end_seqno: start,
    }
}

pub(crate) fn open_request(vb: Vbid) -> StreamRequest {
    stream_request(vb, 0, OPEN_ENDED)
}

pub(crate) fn mutation(vb: Vbid, seqno: u64) -> Item {
    Item::new(
        Bytes::from(format!("key-{seqno}")),
        Some(Bytes::from(format!("value-{seqno}"))),
        vb,
        seqno,
    )
}

struct MockVbucket {
    state: VbucketState,
    uuid: VbUuid,
    high_seqno: u64,
    disk: Vec<Item>,
    checkpoint: Vec<QueuedItem>,
    cursors: HashSet<String>,
    rollback_at: Option<u64>,
}

impl Default for MockVbucket {
    fn default() -> Self {
        Self {
            state: VbucketState::Active,
            uuid: VbUuid(0),
            high_seqno: 0,
            disk: Vec::new(),
            checkpoint: Vec::new(),
            cursors: HashSet::new(),
            rollback_at: None,
        }
    }
}

/// Producer-side mock: vbuckets with disk contents and an in-memory
/// checkpoint queue. Backfills run synchronously inside `begin_backfill`.
#[derive(Default)]
pub(crate) struct MockEngine {
    vbuckets: Mutex<HashMap<Vbid, MockVbucket>>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn create_vbucket(&self, vb: Vbid, uuid: VbUuid) {
        self.vbuckets.lock().unwrap().insert(
            vb,
            MockVbucket {
                uuid,
                ..MockVbucket::default()
            },
        );
    }

    /// Seeds seqnos `1..=count` on disk and moves the high seqno.
    pub fn seed_disk(&self, vb: Vbid, count: u64) {
        let mut vbuckets = self.vbuckets.lock().unwrap();
        let entry = vbuckets.get_mut(&vb).expect("vbucket missing");
        for seqno in 1..=count {
            entry.disk.push(mutation(vb, seqno));
        }
        entry.high_seqno = entry.high_seqno.max(count);
    }

    /// Appends an item to the checkpoint queue and moves the high seqno.
    pub fn queue_memory_item(&self, vb: Vbid, item: Item) {
        let mut vbuckets = self.vbuckets.lock().unwrap();
        let entry = vbuckets.get_mut(&vb).expect("vbucket missing");
        entry.high_seqno = entry.high_seqno.max(item.by_seqno);
        entry.checkpoint.push(QueuedItem::Item(item));
    }

    pub fn set_rollback_at(&self, vb: Vbid, seqno: u64) {
        let mut vbuckets = self.vbuckets.lock().unwrap();
        vbuckets.get_mut(&vb).expect("vbucket missing").rollback_at = Some(seqno);
    }

    pub fn has_cursor(&self, vb: Vbid, cursor: &str) -> bool {
        self.vbuckets
            .lock()
            .unwrap()
            .get(&vb)
            .is_some_and(|entry| entry.cursors.contains(cursor))
    }
}

impl CheckpointAccess for MockEngine {
    fn vbucket_state(&self, vb: Vbid) -> Option<VbucketState> {
        self.vbuckets.lock().unwrap().get(&vb).map(|e| e.state)
    }

    fn high_seqno(&self, vb: Vbid) -> u64 {
        self.vbuckets
            .lock()
            .unwrap()
            .get(&vb)
            .map_or(0, |e| e.high_seqno)
    }

    fn vb_uuid(&self, vb: Vbid) -> VbUuid {
        self.vbuckets
            .lock()
            .unwrap()
            .get(&vb)
            .map_or(VbUuid(0), |e| e.uuid)
    }

    fn rollback_check(&self, vb: Vbid, req: &StreamRequest) -> RollbackCheck {
        let vbuckets = self.vbuckets.lock().unwrap();
        let Some(entry) = vbuckets.get(&vb) else {
            return RollbackCheck::NoVbucket;
        };
        if req.vb_uuid != entry.uuid {
            let point = entry
                .rollback_at
                .unwrap_or_else(|| req.snap_start_seqno.min(entry.high_seqno));
            return RollbackCheck::RollbackAt(point);
        }
        RollbackCheck::NoRollback
    }

    fn register_cursor(&self, vb: Vbid, cursor: &str, _start_seqno: u64) {
        let mut vbuckets = self.vbuckets.lock().unwrap();
        if let Some(entry) = vbuckets.get_mut(&vb) {
            entry.cursors.insert(cursor.to_string());
        }
    }

    fn remove_cursor(&self, vb: Vbid, cursor: &str) {
        let mut vbuckets = self.vbuckets.lock().unwrap();
        if let Some(entry) = vbuckets.get_mut(&vb) {
            entry.cursors.remove(cursor);
        }
    }

    fn get_outstanding_items(&self, vb: Vbid, _cursor: &str) -> Vec<QueuedItem> {
        let mut vbuckets = self.vbuckets.lock().unwrap();
        vbuckets
            .get_mut(&vb)
            .map(|entry| std::mem::take(&mut entry.checkpoint))
            .unwrap_or_default()
    }
}

impl BackfillScheduler for MockEngine {
    fn begin_backfill(&self, stream: Arc<ActiveStream>, start_seqno: u64, end_seqno: u64) {
        let vb = stream.vbucket();
        let items: Vec<Item> = {
            let vbuckets = self.vbuckets.lock().unwrap();
            vbuckets
                .get(&vb)
                .map(|entry| {
                    entry
                        .disk
                        .iter()
                        .filter(|item| {
                            item.by_seqno >= start_seqno && item.by_seqno <= end_seqno
                        })
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };
        if !items.is_empty() {
            stream.incr_backfill_remaining(items.len() as u64);
            stream.mark_disk_snapshot(start_seqno.saturating_sub(1), end_seqno);
            for item in items {
                stream.backfill_received(item, true);
            }
        }
        stream.complete_backfill();
    }
}

/// Backfill scheduler that records nothing and delivers nothing; the test
/// drives the storage callbacks by hand.
pub(crate) struct NoopBackfill;

impl BackfillScheduler for NoopBackfill {
    fn begin_backfill(&self, _stream: Arc<ActiveStream>, _start_seqno: u64, _end_seqno: u64) {}
}

#[derive(Default)]
struct ReplicaState {
    applied: Vec<(Vbid, Item)>,
    states: HashMap<Vbid, VbucketState>,
    snapshot_ends: Vec<(Vbid, u64, bool)>,
    resume: HashMap<Vbid, StreamResumeInfo>,
    tmpfail_applies: usize,
}

/// Consumer-side mock vbucket store.
#[derive(Default)]
pub(crate) struct MockReplica {
    state: Mutex<ReplicaState>,
}

impl MockReplica {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_vbucket(self: Arc<Self>, vb: Vbid, resume: StreamResumeInfo) -> Arc<Self> {
        self.state.lock().unwrap().resume.insert(vb, resume);
        self
    }

    /// The next `count` applies return tmpfail.
    pub fn fail_applies(&self, count: usize) {
        self.state.lock().unwrap().tmpfail_applies = count;
    }

    pub fn applied(&self) -> Vec<(Vbid, Item)> {
        self.state.lock().unwrap().applied.clone()
    }

    pub fn applied_count(&self) -> usize {
        self.state.lock().unwrap().applied.len()
    }

    pub fn snapshot_ends(&self) -> Vec<(Vbid, u64, bool)> {
        self.state.lock().unwrap().snapshot_ends.clone()
    }

    pub fn vbucket_state(&self, vb: Vbid) -> Option<VbucketState> {
        self.state.lock().unwrap().states.get(&vb).copied()
    }

    fn apply(&self, vb: Vbid, item: &Item) -> EngineStatus {
        let mut state = self.state.lock().unwrap();
        if state.tmpfail_applies > 0 {
            state.tmpfail_applies -= 1;
            return EngineStatus::Tmpfail;
        }
        state.applied.push((vb, item.clone()));
        EngineStatus::Success
    }
}

impl ReplicaVbuckets for MockReplica {
    fn apply_mutation(&self, vb: Vbid, item: &Item) -> EngineStatus {
        self.apply(vb, item)
    }

    fn apply_deletion(&self, vb: Vbid, item: &Item) -> EngineStatus {
        self.apply(vb, item)
    }

    fn set_vbucket_state(&self, vb: Vbid, new_state: VbucketState) -> EngineStatus {
        self.state.lock().unwrap().states.insert(vb, new_state);
        EngineStatus::Success
    }

    fn record_snapshot_end(&self, vb: Vbid, end_seqno: u64, on_disk: bool) {
        self.state
            .lock()
            .unwrap()
            .snapshot_ends
            .push((vb, end_seqno, on_disk));
    }

    fn stream_resume_info(&self, vb: Vbid) -> Option<StreamResumeInfo> {
        self.state.lock().unwrap().resume.get(&vb).copied()
    }
}

/// Captures io-complete wakeups.
#[derive(Default)]
pub(crate) struct MockIo {
    notifications: Mutex<Vec<(ConnCookie, EngineStatus)>>,
}

impl MockIo {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn notifications(&self) -> Vec<(ConnCookie, EngineStatus)> {
        self.notifications.lock().unwrap().clone()
    }
}

impl IoNotifier for MockIo {
    fn notify_io_complete(&self, cookie: ConnCookie, status: EngineStatus) {
        self.notifications.lock().unwrap().push((cookie, status));
    }
}
