//! Producer-side stream state machine.
//!
//! An active stream replays a vbucket to a peer in two phases: a disk
//! backfill bounded by the high seqno at request time, then a live drain
//! of the vbucket's in-memory checkpoints. Takeover streams append a
//! vbucket hand-off exchange. All responses leave through the ready
//! queue in per-vbucket seqno order, bracketed by snapshot markers.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use crate::config::DcpConfig;
use crate::dcp::processor::CheckpointProcessor;
use crate::dcp::producer::DcpProducer;
use crate::dcp::ready_queue::ReadyQueue;
use crate::dcp::response::{DcpResponse, SnapshotMarker, marker_flags};
use crate::dcp::stream::{StreamCore, StreamRequest, StreamState};
use crate::engine::{BackfillScheduler, CheckpointAccess};
use crate::error::StreamEndReason;
use crate::item::{Item, QueuedItem};
use crate::metrics;
use crate::types::{Vbid, VbucketState, OPEN_ENDED};

/// Whether mutations carry values or only keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationPayload {
    KeyAndValue,
    KeyOnly,
}

#[derive(Debug)]
struct ActiveInner {
    ready_q: ReadyQueue,
    first_marker_sent: bool,
    last_sent_snap_end: u64,
    wait_for_snapshot: u32,
    takeover_deadline: Option<Instant>,
}

enum BackfillPlan {
    Scan { start: u64, end: u64 },
    Nothing,
}

pub struct ActiveStream {
    core: StreamCore,
    self_handle: Weak<ActiveStream>,
    producer: Weak<DcpProducer>,
    engine: Arc<dyn CheckpointAccess>,
    backfill: Arc<dyn BackfillScheduler>,
    processor: Arc<CheckpointProcessor>,

    payload: MutationPayload,
    takeover_send_max_time: Duration,
    backfill_buffer_max_bytes: u32,
    backfill_buffer_max_items: u32,

    /// Watermarks: sent never overtakes read.
    last_read_seqno: AtomicU64,
    last_sent_seqno: AtomicU64,
    /// Last seqno known to the checkpoint cursor.
    cur_chk_seqno: AtomicU64,

    backfill_remaining: AtomicU64,
    backfill_disk_items: AtomicU64,
    backfill_memory_items: AtomicU64,
    backfill_sent_items: AtomicU64,
    items_from_memory: AtomicU64,
    buffered_backfill_bytes: AtomicU32,
    buffered_backfill_items: AtomicU32,
    backfill_task_running: AtomicBool,
    chk_extraction_in_progress: AtomicBool,

    inner: Mutex<ActiveInner>,
}

impl ActiveStream {
    pub fn new(
        producer: Weak<DcpProducer>,
        engine: Arc<dyn CheckpointAccess>,
        backfill: Arc<dyn BackfillScheduler>,
        processor: Arc<CheckpointProcessor>,
        config: &DcpConfig,
        req: StreamRequest,
    ) -> Arc<Self> {
        let ready_q = ReadyQueue::new();
        let ready_bytes = ready_q.bytes_handle();
        let payload = if req.flags.key_only() {
            MutationPayload::KeyOnly
        } else {
            MutationPayload::KeyAndValue
        };
        let start = req.start_seqno;

        Arc::new_cyclic(|self_handle| Self {
            core: StreamCore::new(req, ready_bytes),
            self_handle: self_handle.clone(),
            producer,
            engine,
            backfill,
            processor,
            payload,
            takeover_send_max_time: Duration::from_secs(config.takeover_send_max_time_secs),
            backfill_buffer_max_bytes: config.backfill_buffer_max_bytes,
            backfill_buffer_max_items: config.backfill_buffer_max_items,
            last_read_seqno: AtomicU64::new(start),
            last_sent_seqno: AtomicU64::new(start),
            cur_chk_seqno: AtomicU64::new(start),
            backfill_remaining: AtomicU64::new(0),
            backfill_disk_items: AtomicU64::new(0),
            backfill_memory_items: AtomicU64::new(0),
            backfill_sent_items: AtomicU64::new(0),
            items_from_memory: AtomicU64::new(0),
            buffered_backfill_bytes: AtomicU32::new(0),
            buffered_backfill_items: AtomicU32::new(0),
            backfill_task_running: AtomicBool::new(false),
            chk_extraction_in_progress: AtomicBool::new(false),
            inner: Mutex::new(ActiveInner {
                ready_q,
                first_marker_sent: false,
                last_sent_snap_end: start,
                wait_for_snapshot: 0,
                takeover_deadline: None,
            }),
        })
    }

    pub fn vbucket(&self) -> Vbid {
        self.core.vbucket()
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn state(&self) -> StreamState {
        self.core.state()
    }

    pub fn is_active(&self) -> bool {
        self.core.is_active()
    }

    pub fn items_ready(&self) -> bool {
        self.core.items_ready()
    }

    pub fn ready_q_bytes(&self) -> u64 {
        self.core.ready_q_bytes()
    }

    pub fn last_sent_seqno(&self) -> u64 {
        self.last_sent_seqno.load(Ordering::Acquire)
    }

    pub fn last_read_seqno(&self) -> u64 {
        self.last_read_seqno.load(Ordering::Acquire)
    }

    pub fn is_key_only(&self) -> bool {
        self.payload == MutationPayload::KeyOnly
    }

    /// Value compression is negotiated per connection; the ratio floor
    /// lives on the registry.
    pub fn is_compression_enabled(&self) -> bool {
        self.producer
            .upgrade()
            .is_some_and(|producer| producer.compression_enabled())
    }

    /// Kicks a pending stream into the backfill phase. The scan itself is
    /// launched after the stream mutex is released: storage callbacks
    /// re-enter this stream.
    pub fn set_active(&self) {
        let plan = {
            let mut inner = self.lock_inner();
            if self.core.state() != StreamState::Pending {
                return;
            }
            self.core.transition(StreamState::Backfilling);
            self.plan_backfill(&mut inner)
        };
        if let BackfillPlan::Scan { start, end } = plan
            && let Some(me) = self.self_handle.upgrade()
        {
            self.backfill.begin_backfill(me, start, end);
        }
    }

    fn plan_backfill(&self, inner: &mut MutexGuard<'_, ActiveInner>) -> BackfillPlan {
        let vb = self.core.vbucket();
        let req = &self.core.req;
        let high = self.engine.high_seqno(vb);
        self.engine.register_cursor(vb, self.core.name(), req.start_seqno);
        self.cur_chk_seqno.fetch_max(high, Ordering::AcqRel);

        let scan_start = req.start_seqno.saturating_add(1);
        let scan_end = req.end_seqno.min(high);
        if scan_start <= scan_end {
            self.backfill_task_running.store(true, Ordering::Release);
            tracing::info!(
                vbucket = %vb,
                stream = self.core.name(),
                start = scan_start,
                end = scan_end,
                "scheduling backfill"
            );
            BackfillPlan::Scan {
                start: scan_start,
                end: scan_end,
            }
        } else {
            self.transition_after_backfill(inner);
            BackfillPlan::Nothing
        }
    }

    /// Storage callback: the disk snapshot about to be replayed.
    /// Queued ahead of any mutation so the peer can bracket the range.
    pub fn mark_disk_snapshot(&self, snap_start: u64, snap_end: u64) {
        let mut inner = self.lock_inner();
        if self.core.state() != StreamState::Backfilling {
            return;
        }
        let end = snap_end.min(self.core.req.end_seqno);
        inner.first_marker_sent = true;
        inner.last_sent_snap_end = end;
        tracing::info!(
            vbucket = %self.core.vbucket(),
            stream = self.core.name(),
            start = snap_start,
            end,
            "sending disk snapshot"
        );
        let marker = SnapshotMarker {
            opaque: self.core.opaque(),
            vbucket: self.core.vbucket(),
            start_seqno: snap_start,
            end_seqno: end,
            flags: marker_flags::DISK | marker_flags::CHK,
        };
        self.push_response(&mut inner, DcpResponse::SnapshotMarker(marker));
    }

    /// Storage callback: one scanned item. Returns false once the
    /// buffered inventory crosses its bounds; the scan should pause until
    /// the peer drains.
    pub fn backfill_received(&self, item: Item, from_disk: bool) -> bool {
        let mut inner = self.lock_inner();
        if self.core.state() != StreamState::Backfilling {
            return false;
        }
        let seqno = item.by_seqno;
        let req = &self.core.req;
        if seqno < req.start_seqno || seqno > req.end_seqno {
            return true;
        }
        if !inner.first_marker_sent {
            tracing::warn!(
                vbucket = %self.core.vbucket(),
                stream = self.core.name(),
                seqno,
                "dropping backfill item delivered before its snapshot marker"
            );
            return true;
        }
        if seqno <= self.last_read_seqno.load(Ordering::Acquire) {
            tracing::warn!(
                vbucket = %self.core.vbucket(),
                stream = self.core.name(),
                seqno,
                "dropping out-of-order backfill item"
            );
            return true;
        }

        self.last_read_seqno.store(seqno, Ordering::Release);
        if from_disk {
            self.backfill_disk_items.fetch_add(1, Ordering::Relaxed);
        } else {
            self.backfill_memory_items.fetch_add(1, Ordering::Relaxed);
        }
        metrics::backfill_item(from_disk);
        let _ = self
            .backfill_remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |remaining| {
                remaining.checked_sub(1)
            });

        let resp = self.make_response(item);
        let bytes = self
            .buffered_backfill_bytes
            .fetch_add(resp.message_size() as u32, Ordering::AcqRel)
            .saturating_add(resp.message_size() as u32);
        let items = self
            .buffered_backfill_items
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1);
        self.push_response(&mut inner, resp);

        bytes < self.backfill_buffer_max_bytes && items < self.backfill_buffer_max_items
    }

    /// Storage callback: the scan finished cleanly.
    pub fn complete_backfill(&self) {
        self.backfill_task_running.store(false, Ordering::Release);
        let mut inner = self.lock_inner();
        if self.core.state() != StreamState::Backfilling {
            return;
        }
        tracing::info!(
            vbucket = %self.core.vbucket(),
            stream = self.core.name(),
            disk = self.backfill_disk_items.load(Ordering::Relaxed),
            memory = self.backfill_memory_items.load(Ordering::Relaxed),
            "backfill complete"
        );
        self.transition_after_backfill(&mut inner);
    }

    /// Storage callback: the scan failed.
    pub fn scan_error(&self) {
        tracing::error!(
            vbucket = %self.core.vbucket(),
            stream = self.core.name(),
            "backfill scan error"
        );
        self.backfill_task_running.store(false, Ordering::Release);
        self.set_dead(StreamEndReason::State);
    }

    pub fn incr_backfill_remaining(&self, by: u64) {
        self.backfill_remaining.fetch_add(by, Ordering::Relaxed);
    }

    fn transition_after_backfill(&self, inner: &mut MutexGuard<'_, ActiveInner>) {
        let req = &self.core.req;
        let bounded_done = req.end_seqno != OPEN_ENDED
            && self.last_read_seqno.load(Ordering::Acquire) >= req.end_seqno;
        if req.flags.disk_only() || bounded_done {
            self.end_stream(inner, StreamEndReason::Ok);
        } else {
            self.core.transition(StreamState::InMemory);
            self.schedule_drain();
        }
    }

    /// Non-blocking poll for the next outbound response.
    pub fn next(&self) -> Option<DcpResponse> {
        let mut inner = self.lock_inner();
        let resp = match self.core.state() {
            StreamState::Pending | StreamState::Reading => None,
            StreamState::Backfilling => self.next_queued(&mut inner),
            StreamState::InMemory => self.in_memory_phase(&mut inner),
            StreamState::TakeoverSend => self.takeover_send_phase(&mut inner),
            StreamState::TakeoverWait => self.takeover_wait_phase(&mut inner),
            StreamState::Dead => self.next_queued(&mut inner),
        };
        if inner.ready_q.is_empty() {
            self.core.clear_items_ready();
        }
        resp
    }

    fn next_queued(&self, inner: &mut MutexGuard<'_, ActiveInner>) -> Option<DcpResponse> {
        let resp = inner.ready_q.pop()?;
        self.record_sent(&resp);
        Some(resp)
    }

    fn record_sent(&self, resp: &DcpResponse) {
        if let Some(seqno) = resp.by_seqno() {
            debug_assert!(seqno <= self.last_read_seqno.load(Ordering::Acquire));
            self.last_sent_seqno.store(seqno, Ordering::Release);
            metrics::items_sent(1);
            if self.buffered_backfill_items.load(Ordering::Acquire) > 0 {
                self.buffered_backfill_items.fetch_sub(1, Ordering::AcqRel);
                let size = resp.message_size() as u32;
                let _ = self.buffered_backfill_bytes.fetch_update(
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    |bytes| Some(bytes.saturating_sub(size)),
                );
                self.backfill_sent_items.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn in_memory_phase(&self, inner: &mut MutexGuard<'_, ActiveInner>) -> Option<DcpResponse> {
        // Never hand out a half-extracted snapshot.
        if self.chk_extraction_in_progress.load(Ordering::Acquire) {
            return None;
        }
        if let Some(resp) = self.next_queued(inner) {
            return Some(resp);
        }
        if self.end_reached() {
            self.end_stream(inner, StreamEndReason::Ok);
            return self.next_queued(inner);
        }
        if self.takeover_ready(inner) {
            self.core.transition(StreamState::TakeoverSend);
            inner.takeover_deadline = Some(Instant::now() + self.takeover_send_max_time);
            return self.takeover_send_phase(inner);
        }
        self.schedule_drain();
        None
    }

    fn takeover_send_phase(&self, inner: &mut MutexGuard<'_, ActiveInner>) -> Option<DcpResponse> {
        if self.takeover_expired(inner) {
            self.end_stream(inner, StreamEndReason::Slow);
            return self.next_queued(inner);
        }
        if let Some(resp) = self.next_queued(inner) {
            return Some(resp);
        }
        if self.chk_extraction_in_progress.load(Ordering::Acquire) {
            return None;
        }
        if self.cur_chk_seqno.load(Ordering::Acquire) > self.last_read_seqno.load(Ordering::Acquire)
        {
            self.schedule_drain();
            return None;
        }
        if inner.wait_for_snapshot > 0 {
            return None;
        }
        // Everything sent and acked; hand the vbucket over.
        self.core.transition(StreamState::TakeoverWait);
        Some(DcpResponse::SetVBucketState {
            opaque: self.core.opaque(),
            vbucket: self.core.vbucket(),
            state: VbucketState::Active,
        })
    }

    fn takeover_wait_phase(&self, inner: &mut MutexGuard<'_, ActiveInner>) -> Option<DcpResponse> {
        if self.takeover_expired(inner) {
            self.end_stream(inner, StreamEndReason::Slow);
        }
        self.next_queued(inner)
    }

    fn takeover_expired(&self, inner: &MutexGuard<'_, ActiveInner>) -> bool {
        inner
            .takeover_deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    fn end_reached(&self) -> bool {
        let end = self.core.req.end_seqno;
        end != OPEN_ENDED && self.last_sent_seqno.load(Ordering::Acquire) >= end
    }

    fn takeover_ready(&self, inner: &MutexGuard<'_, ActiveInner>) -> bool {
        self.core.req.flags.takeover()
            && self.last_sent_seqno.load(Ordering::Acquire) >= inner.last_sent_snap_end
    }

    /// Best-effort signal that data up to `seqno` exists. Must never block
    /// on anything heavier than the processor queue lock.
    pub fn notify_seqno_available(&self, seqno: u64) {
        self.cur_chk_seqno.fetch_max(seqno, Ordering::AcqRel);
        match self.core.state() {
            StreamState::InMemory | StreamState::TakeoverSend => self.schedule_drain(),
            _ => {}
        }
    }

    fn schedule_drain(&self) {
        if let Some(me) = self.self_handle.upgrade() {
            self.processor.schedule(&me);
        }
    }

    /// Runs on the checkpoint processor. Extracts the cursor's
    /// outstanding items and turns them into marker-bracketed responses.
    pub fn next_checkpoint_item_task(&self) {
        if !matches!(
            self.core.state(),
            StreamState::InMemory | StreamState::TakeoverSend
        ) {
            return;
        }
        self.chk_extraction_in_progress.store(true, Ordering::Release);
        let items = self
            .engine
            .get_outstanding_items(self.core.vbucket(), self.core.name());
        self.process_items(items);
        self.chk_extraction_in_progress.store(false, Ordering::Release);
    }

    pub fn process_items(&self, items: Vec<QueuedItem>) {
        let mut inner = self.lock_inner();
        if !self.core.is_active() {
            return;
        }
        let end_seqno = self.core.req.end_seqno;
        let mut pending: Vec<Item> = Vec::new();
        for queued in items {
            match queued {
                QueuedItem::Item(item) => {
                    // Skip what the backfill already covered, and anything
                    // past the requested range.
                    if item.by_seqno <= self.last_read_seqno.load(Ordering::Acquire)
                        || item.by_seqno > end_seqno
                    {
                        continue;
                    }
                    debug_assert!(
                        pending.last().is_none_or(|prev| prev.by_seqno < item.by_seqno),
                        "checkpoint batch must be seqno ordered"
                    );
                    pending.push(item);
                }
                QueuedItem::SetVBucketState(state) => {
                    self.flush_snapshot(&mut inner, &mut pending);
                    if self.core.req.flags.takeover() {
                        let resp = DcpResponse::SetVBucketState {
                            opaque: self.core.opaque(),
                            vbucket: self.core.vbucket(),
                            state,
                        };
                        self.push_response(&mut inner, resp);
                    }
                }
            }
        }
        self.flush_snapshot(&mut inner, &mut pending);

        if end_seqno != OPEN_ENDED && self.last_read_seqno.load(Ordering::Acquire) >= end_seqno {
            self.end_stream(&mut inner, StreamEndReason::Ok);
        }
    }

    /// Emits a memory snapshot: marker first, then its mutations. Empty
    /// ranges produce no marker.
    fn flush_snapshot(&self, inner: &mut MutexGuard<'_, ActiveInner>, pending: &mut Vec<Item>) {
        let (Some(first), Some(last)) = (pending.first(), pending.last()) else {
            return;
        };
        let (snap_start, snap_end) = (first.by_seqno, last.by_seqno);

        let mut flags = marker_flags::MEMORY | marker_flags::CHK;
        if self.core.req.flags.takeover() {
            flags |= marker_flags::ACK;
            inner.wait_for_snapshot += 1;
        }
        inner.first_marker_sent = true;
        inner.last_sent_snap_end = snap_end;

        let marker = SnapshotMarker {
            opaque: self.core.opaque(),
            vbucket: self.core.vbucket(),
            start_seqno: snap_start,
            end_seqno: snap_end,
            flags,
        };
        self.push_response(inner, DcpResponse::SnapshotMarker(marker));

        let count = pending.len() as u64;
        for item in pending.drain(..) {
            let resp = self.make_response(item);
            self.push_response(inner, resp);
        }
        self.items_from_memory.fetch_add(count, Ordering::Relaxed);
        self.last_read_seqno.fetch_max(snap_end, Ordering::AcqRel);
        self.cur_chk_seqno.fetch_max(snap_end, Ordering::AcqRel);
    }

    fn make_response(&self, item: Item) -> DcpResponse {
        let opaque = self.core.opaque();
        if item.deleted {
            DcpResponse::Deletion { opaque, item }
        } else {
            let item = match self.payload {
                MutationPayload::KeyAndValue => item,
                MutationPayload::KeyOnly => item.key_only(),
            };
            DcpResponse::Mutation { opaque, item }
        }
    }

    fn push_response(&self, inner: &mut MutexGuard<'_, ActiveInner>, resp: DcpResponse) {
        inner.ready_q.push(resp);
        if self.core.raise_items_ready()
            && let Some(producer) = self.producer.upgrade()
        {
            producer.notify_stream_ready(self.core.vbucket());
        }
    }

    /// Consumer acked a snapshot marker.
    pub fn snapshot_marker_ack_received(&self) {
        let mut inner = self.lock_inner();
        if inner.wait_for_snapshot > 0 {
            inner.wait_for_snapshot -= 1;
        }
    }

    /// Consumer acked the takeover hand-off.
    pub fn set_vbucket_state_ack_received(&self) {
        let mut inner = self.lock_inner();
        if self.core.state() == StreamState::TakeoverWait {
            tracing::info!(
                vbucket = %self.core.vbucket(),
                stream = self.core.name(),
                "takeover acknowledged"
            );
            self.end_stream(&mut inner, StreamEndReason::Ok);
        }
    }

    /// Force-terminates the stream. Idempotent. Anything still queued is
    /// dropped; a lone StreamEnd is left for the peer to drain. Returns
    /// the dropped count.
    pub fn set_dead(&self, reason: StreamEndReason) -> usize {
        let mut inner = self.lock_inner();
        let dropped = inner.ready_q.clear();
        self.core.clear_items_ready();
        if self.core.is_active() {
            self.end_stream(&mut inner, reason);
        }
        dropped
    }

    fn end_stream(&self, inner: &mut MutexGuard<'_, ActiveInner>, reason: StreamEndReason) {
        if !self.core.is_active() {
            return;
        }
        self.push_response(
            inner,
            DcpResponse::StreamEnd {
                opaque: self.core.opaque(),
                vbucket: self.core.vbucket(),
                reason,
            },
        );
        self.core.transition(StreamState::Dead);
        self.engine
            .remove_cursor(self.core.vbucket(), self.core.name());
        metrics::stream_end(reason);
        tracing::info!(
            vbucket = %self.core.vbucket(),
            stream = self.core.name(),
            reason = %reason,
            "stream ended"
        );
    }

    /// Estimate of items left to send.
    pub fn items_remaining(&self) -> u64 {
        let chk_pending = self
            .cur_chk_seqno
            .load(Ordering::Acquire)
            .saturating_sub(self.last_read_seqno.load(Ordering::Acquire));
        self.backfill_remaining.load(Ordering::Acquire) + chk_pending
    }

    pub fn add_stats(&self, sink: &mut dyn crate::metrics::StatSink) {
        let prefix = format!("{}:stream_{}", self.core.name(), self.core.vbucket().0);
        sink.stat(&format!("{prefix}_state"), self.core.state().as_str().to_string());
        sink.stat(&format!("{prefix}_opaque"), self.core.opaque().to_string());
        sink.stat(
            &format!("{prefix}_start_seqno"),
            self.core.req.start_seqno.to_string(),
        );
        sink.stat(
            &format!("{prefix}_end_seqno"),
            self.core.req.end_seqno.to_string(),
        );
        sink.stat(
            &format!("{prefix}_vb_uuid"),
            self.core.req.vb_uuid.to_string(),
        );
        sink.stat(
            &format!("{prefix}_last_read_seqno"),
            self.last_read_seqno.load(Ordering::Acquire).to_string(),
        );
        sink.stat(
            &format!("{prefix}_last_sent_seqno"),
            self.last_sent_seqno.load(Ordering::Acquire).to_string(),
        );
        sink.stat(
            &format!("{prefix}_ready_queue_bytes"),
            self.core.ready_q_bytes().to_string(),
        );
        sink.stat(
            &format!("{prefix}_backfill_disk_items"),
            self.backfill_disk_items.load(Ordering::Relaxed).to_string(),
        );
        sink.stat(
            &format!("{prefix}_backfill_mem_items"),
            self.backfill_memory_items.load(Ordering::Relaxed).to_string(),
        );
        sink.stat(
            &format!("{prefix}_backfill_sent"),
            self.backfill_sent_items.load(Ordering::Relaxed).to_string(),
        );
        sink.stat(
            &format!("{prefix}_memory_phase_items"),
            self.items_from_memory.load(Ordering::Relaxed).to_string(),
        );
    }

    pub fn add_takeover_stats(&self, sink: &mut dyn crate::metrics::StatSink) {
        sink.stat("name", self.core.name().to_string());
        sink.stat("estimate", self.items_remaining().to_string());
        let status = match self.core.state() {
            StreamState::Backfilling => "backfilling",
            StreamState::Dead => "does_not_exist",
            _ => "in-memory",
        };
        sink.stat("status", status.to_string());
    }

    fn lock_inner(&self) -> MutexGuard<'_, ActiveInner> {
        self.inner.lock().expect("stream mutex poisoned")
    }
}
