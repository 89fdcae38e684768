//! Consumer-side stream: buffers inbound replication messages and applies
//! them to the local vbucket inside snapshot bounds.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::config::DcpConfig;
use crate::dcp::consumer::DcpConsumer;
use crate::dcp::ready_queue::ReadyQueue;
use crate::dcp::response::{DcpResponse, SnapshotMarker};
use crate::dcp::stream::{StreamCore, StreamRequest, StreamState};
use crate::engine::ReplicaVbuckets;
use crate::error::{EngineStatus, StreamEndReason};
use crate::item::Item;
use crate::metrics;
use crate::types::{Vbid, VbucketState};

/// Result of a buffered-message drain pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessResult {
    AllProcessed,
    MoreToProcess,
    CannotProcess,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum SnapshotType {
    None = 0,
    Disk = 1,
    Memory = 2,
}

impl SnapshotType {
    fn from_u8(raw: u8) -> SnapshotType {
        match raw {
            1 => SnapshotType::Disk,
            2 => SnapshotType::Memory,
            _ => SnapshotType::None,
        }
    }
}

#[derive(Debug, Default)]
struct BufferInner {
    messages: VecDeque<DcpResponse>,
    bytes: usize,
}

/// Inbound FIFO ahead of vbucket application.
///
/// Lock order: this mutex is always acquired before the stream mutex when
/// both are needed.
#[derive(Debug)]
struct MessageBuffer {
    max_bytes: usize,
    max_items: usize,
    inner: Mutex<BufferInner>,
}

#[derive(Debug)]
struct PassiveInner {
    ready_q: ReadyQueue,
    opaque: u32,
    cur_snapshot_ack: bool,
}

pub struct PassiveStream {
    core: StreamCore,
    consumer: Weak<DcpConsumer>,
    vbuckets: Arc<dyn ReplicaVbuckets>,

    last_seqno: AtomicU64,
    cur_snapshot_start: AtomicU64,
    cur_snapshot_end: AtomicU64,
    cur_snapshot_type: AtomicU8,

    buffer: MessageBuffer,
    inner: Mutex<PassiveInner>,
}

impl PassiveStream {
    pub fn new(
        consumer: Weak<DcpConsumer>,
        vbuckets: Arc<dyn ReplicaVbuckets>,
        config: &DcpConfig,
        req: StreamRequest,
    ) -> Arc<Self> {
        let mut ready_q = ReadyQueue::new();
        let ready_bytes = ready_q.bytes_handle();
        let opaque = req.opaque;
        let start = req.start_seqno;
        // The negotiation request itself is the first thing the network
        // layer drains from this stream.
        ready_q.push(DcpResponse::StreamReq(req.clone()));

        let stream = Arc::new(Self {
            core: StreamCore::new(req, ready_bytes),
            consumer,
            vbuckets,
            last_seqno: AtomicU64::new(start),
            cur_snapshot_start: AtomicU64::new(0),
            cur_snapshot_end: AtomicU64::new(0),
            cur_snapshot_type: AtomicU8::new(SnapshotType::None as u8),
            buffer: MessageBuffer {
                max_bytes: config.consumer_buffer_max_bytes,
                max_items: config.consumer_buffer_max_items,
                inner: Mutex::new(BufferInner::default()),
            },
            inner: Mutex::new(PassiveInner {
                ready_q,
                opaque,
                cur_snapshot_ack: false,
            }),
        });
        stream.core.raise_items_ready();
        stream
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

    pub fn last_seqno(&self) -> u64 {
        self.last_seqno.load(Ordering::Acquire)
    }

    pub fn opaque(&self) -> u32 {
        self.lock_inner().opaque
    }

    pub fn next(&self) -> Option<DcpResponse> {
        let mut inner = self.lock_inner();
        let resp = inner.ready_q.pop();
        if inner.ready_q.is_empty() {
            self.core.clear_items_ready();
        }
        resp
    }

    /// Finalizes negotiation. Success moves the stream into READING.
    pub fn accept_stream(&self, status: EngineStatus, add_opaque: u32) {
        let mut inner = self.lock_inner();
        let resp = DcpResponse::AddStreamResponse {
            opaque: inner.opaque,
            add_opaque,
            status,
        };
        if status.is_success() {
            if self.core.state() == StreamState::Pending {
                self.core.transition(StreamState::Reading);
            }
        } else {
            tracing::warn!(
                vbucket = %self.core.vbucket(),
                stream = self.core.name(),
                status = %status,
                "stream request rejected by producer"
            );
            self.core.transition(StreamState::Dead);
        }
        self.push_response(&mut inner, resp);
    }

    /// Resets negotiation after a producer-side restart: stale buffered
    /// messages are dropped and a fresh request is queued.
    pub fn reconnect_stream(&self, new_opaque: u32, start_seqno: u64) {
        self.clear_buffer();
        let mut inner = self.lock_inner();
        inner.opaque = new_opaque;
        self.last_seqno.store(start_seqno, Ordering::Release);

        let snapshot_known = self.snapshot_type() != SnapshotType::None;
        let (snap_start, snap_end) = if snapshot_known {
            (
                self.cur_snapshot_start.load(Ordering::Acquire),
                self.cur_snapshot_end.load(Ordering::Acquire),
            )
        } else {
            (start_seqno, start_seqno)
        };
        let req = StreamRequest {
            name: self.core.req.name.clone(),
            flags: self.core.req.flags,
            opaque: new_opaque,
            vbucket: self.core.vbucket(),
            start_seqno,
            end_seqno: self.core.req.end_seqno,
            vb_uuid: self.core.req.vb_uuid,
            snap_start_seqno: snap_start,
            snap_end_seqno: snap_end,
        };
        tracing::info!(
            vbucket = %self.core.vbucket(),
            stream = self.core.name(),
            start_seqno,
            "reconnecting stream"
        );
        self.core.transition(StreamState::Pending);
        self.push_response(&mut inner, DcpResponse::StreamReq(req));
    }

    /// Enqueues an inbound message. `Tmpfail` tells the transport to back
    /// off; the message was not taken.
    pub fn message_received(&self, resp: DcpResponse) -> EngineStatus {
        if !self.core.is_active() {
            return EngineStatus::Disconnect;
        }
        if let Some(seqno) = resp.by_seqno()
            && seqno == 0
        {
            return EngineStatus::Einval;
        }

        let size = resp.message_size();
        let mut buf = self.lock_buffer();
        if buf.messages.len() >= self.buffer.max_items
            || buf.bytes + size > self.buffer.max_bytes
        {
            metrics::consumer_buffer_full();
            return EngineStatus::Tmpfail;
        }
        buf.bytes += size;
        buf.messages.push_back(resp);
        EngineStatus::Success
    }

    /// Applies buffered messages up to the byte budget.
    pub fn process_buffered_messages(&self, batch_bytes: usize) -> ProcessResult {
        let mut processed = 0usize;
        loop {
            let msg = {
                let mut buf = self.lock_buffer();
                let Some(msg) = buf.messages.pop_front() else {
                    return ProcessResult::AllProcessed;
                };
                buf.bytes = buf.bytes.saturating_sub(msg.message_size());
                msg
            };
            let size = msg.message_size();

            match self.process_message(&msg) {
                EngineStatus::Success => processed += size,
                EngineStatus::Tmpfail => {
                    // Put it back; the caller retries the whole batch.
                    let mut buf = self.lock_buffer();
                    buf.bytes += size;
                    buf.messages.push_front(msg);
                    return ProcessResult::CannotProcess;
                }
                // Fatal statuses have already killed the stream.
                _ => return ProcessResult::AllProcessed,
            }

            if processed >= batch_bytes {
                let buf = self.lock_buffer();
                return if buf.messages.is_empty() {
                    ProcessResult::AllProcessed
                } else {
                    ProcessResult::MoreToProcess
                };
            }
        }
    }

    fn process_message(&self, msg: &DcpResponse) -> EngineStatus {
        match msg {
            DcpResponse::Mutation { item, .. } => self.process_mutation(item),
            DcpResponse::Deletion { item, .. } => self.process_deletion(item),
            DcpResponse::SnapshotMarker(marker) => self.process_marker(*marker),
            DcpResponse::SetVBucketState { state, .. } => self.process_set_vbucket_state(*state),
            DcpResponse::StreamEnd { reason, .. } => {
                let _inner = self.lock_inner();
                tracing::info!(
                    vbucket = %self.core.vbucket(),
                    stream = self.core.name(),
                    reason = %reason,
                    "producer ended stream"
                );
                if self.core.is_active() {
                    self.core.transition(StreamState::Dead);
                }
                EngineStatus::Success
            }
            other => {
                tracing::warn!(
                    vbucket = %self.core.vbucket(),
                    stream = self.core.name(),
                    message = other.type_name(),
                    "unexpected message on passive stream"
                );
                EngineStatus::Einval
            }
        }
    }

    fn process_mutation(&self, item: &Item) -> EngineStatus {
        match self.check_snapshot_window(item.by_seqno) {
            WindowCheck::Fatal => return EngineStatus::Einval,
            WindowCheck::Duplicate => return EngineStatus::Success,
            WindowCheck::Ok => {}
        }
        let status = self.vbuckets.apply_mutation(self.core.vbucket(), item);
        self.after_apply(item.by_seqno, status)
    }

    fn process_deletion(&self, item: &Item) -> EngineStatus {
        match self.check_snapshot_window(item.by_seqno) {
            WindowCheck::Fatal => return EngineStatus::Einval,
            WindowCheck::Duplicate => return EngineStatus::Success,
            WindowCheck::Ok => {}
        }
        let status = self.vbuckets.apply_deletion(self.core.vbucket(), item);
        self.after_apply(item.by_seqno, status)
    }

    fn check_snapshot_window(&self, seqno: u64) -> WindowCheck {
        let snap_start = self.cur_snapshot_start.load(Ordering::Acquire);
        let snap_end = self.cur_snapshot_end.load(Ordering::Acquire);
        if self.snapshot_type() == SnapshotType::None || seqno < snap_start || seqno > snap_end {
            tracing::error!(
                vbucket = %self.core.vbucket(),
                stream = self.core.name(),
                seqno,
                snap_start,
                snap_end,
                "mutation outside current snapshot"
            );
            self.set_dead(StreamEndReason::State);
            return WindowCheck::Fatal;
        }
        if seqno <= self.last_seqno.load(Ordering::Acquire) {
            tracing::warn!(
                vbucket = %self.core.vbucket(),
                stream = self.core.name(),
                seqno,
                "ignoring replayed seqno"
            );
            return WindowCheck::Duplicate;
        }
        WindowCheck::Ok
    }

    fn after_apply(&self, seqno: u64, status: EngineStatus) -> EngineStatus {
        match status {
            EngineStatus::Success => {
                self.last_seqno.store(seqno, Ordering::Release);
                self.handle_snapshot_end(seqno);
                EngineStatus::Success
            }
            EngineStatus::Tmpfail => EngineStatus::Tmpfail,
            other => {
                tracing::error!(
                    vbucket = %self.core.vbucket(),
                    stream = self.core.name(),
                    seqno,
                    status = %other,
                    "vbucket apply failed"
                );
                self.set_dead(StreamEndReason::State);
                other
            }
        }
    }

    fn process_marker(&self, marker: SnapshotMarker) -> EngineStatus {
        if marker.start_seqno > marker.end_seqno {
            tracing::error!(
                vbucket = %self.core.vbucket(),
                stream = self.core.name(),
                start = marker.start_seqno,
                end = marker.end_seqno,
                "inverted snapshot marker"
            );
            self.set_dead(StreamEndReason::State);
            return EngineStatus::Einval;
        }
        self.cur_snapshot_start
            .store(marker.start_seqno, Ordering::Release);
        self.cur_snapshot_end
            .store(marker.end_seqno, Ordering::Release);
        let snap_type = if marker.from_disk() {
            SnapshotType::Disk
        } else {
            SnapshotType::Memory
        };
        self.cur_snapshot_type
            .store(snap_type as u8, Ordering::Release);
        let mut inner = self.lock_inner();
        inner.cur_snapshot_ack = marker.requests_ack();
        EngineStatus::Success
    }

    fn handle_snapshot_end(&self, seqno: u64) {
        let snap_type = self.snapshot_type();
        if snap_type == SnapshotType::None
            || seqno != self.cur_snapshot_end.load(Ordering::Acquire)
        {
            return;
        }
        self.vbuckets.record_snapshot_end(
            self.core.vbucket(),
            seqno,
            snap_type == SnapshotType::Disk,
        );
        self.cur_snapshot_type
            .store(SnapshotType::None as u8, Ordering::Release);

        let mut inner = self.lock_inner();
        if inner.cur_snapshot_ack {
            inner.cur_snapshot_ack = false;
            let resp = DcpResponse::SnapshotMarkerAck {
                opaque: inner.opaque,
                vbucket: self.core.vbucket(),
                status: EngineStatus::Success,
            };
            self.push_response(&mut inner, resp);
        }
    }

    fn process_set_vbucket_state(&self, state: VbucketState) -> EngineStatus {
        let status = self.vbuckets.set_vbucket_state(self.core.vbucket(), state);
        if !status.is_success() {
            return status;
        }
        let mut inner = self.lock_inner();
        let resp = DcpResponse::SetVBucketStateAck {
            opaque: inner.opaque,
            vbucket: self.core.vbucket(),
        };
        self.push_response(&mut inner, resp);
        EngineStatus::Success
    }

    /// Force-terminates and flushes the inbound buffer. Returns the count
    /// of dropped buffered messages.
    pub fn set_dead(&self, reason: StreamEndReason) -> usize {
        let (dropped, dropped_bytes) = self.clear_buffer();
        let _inner = self.lock_inner();
        if self.core.is_active() {
            self.core.transition(StreamState::Dead);
            metrics::stream_end(reason);
            tracing::info!(
                vbucket = %self.core.vbucket(),
                stream = self.core.name(),
                reason = %reason,
                dropped_bytes,
                "passive stream ended"
            );
        }
        dropped
    }

    pub fn buffered_bytes(&self) -> usize {
        self.lock_buffer().bytes
    }

    pub fn add_stats(&self, sink: &mut dyn crate::metrics::StatSink) {
        let prefix = format!("{}:stream_{}", self.core.name(), self.core.vbucket().0);
        sink.stat(&format!("{prefix}_state"), self.core.state().as_str().to_string());
        sink.stat(
            &format!("{prefix}_last_seqno"),
            self.last_seqno.load(Ordering::Acquire).to_string(),
        );
        sink.stat(
            &format!("{prefix}_cur_snapshot_start"),
            self.cur_snapshot_start.load(Ordering::Acquire).to_string(),
        );
        sink.stat(
            &format!("{prefix}_cur_snapshot_end"),
            self.cur_snapshot_end.load(Ordering::Acquire).to_string(),
        );
        let buf = self.lock_buffer();
        sink.stat(&format!("{prefix}_buffer_items"), buf.messages.len().to_string());
        sink.stat(&format!("{prefix}_buffer_bytes"), buf.bytes.to_string());
    }

    fn clear_buffer(&self) -> (usize, usize) {
        let mut buf = self.lock_buffer();
        let dropped = buf.messages.len();
        let bytes = buf.bytes;
        buf.messages.clear();
        buf.bytes = 0;
        (dropped, bytes)
    }

    fn snapshot_type(&self) -> SnapshotType {
        SnapshotType::from_u8(self.cur_snapshot_type.load(Ordering::Acquire))
    }

    fn push_response(&self, inner: &mut MutexGuard<'_, PassiveInner>, resp: DcpResponse) {
        inner.ready_q.push(resp);
        if self.core.raise_items_ready()
            && let Some(consumer) = self.consumer.upgrade()
        {
            consumer.notify_stream_ready(self.core.vbucket());
        }
    }

    fn lock_buffer(&self) -> MutexGuard<'_, BufferInner> {
        self.buffer.inner.lock().expect("buffer mutex poisoned")
    }

    fn lock_inner(&self) -> MutexGuard<'_, PassiveInner> {
        self.inner.lock().expect("stream mutex poisoned")
    }
}

enum WindowCheck {
    Ok,
    Duplicate,
    Fatal,
}
