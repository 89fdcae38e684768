//! Notifier streams: a peer asks to hear that data exists at or past a
//! seqno without opening a full stream.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::dcp::producer::DcpProducer;
use crate::dcp::ready_queue::ReadyQueue;
use crate::dcp::response::DcpResponse;
use crate::dcp::stream::{StreamCore, StreamRequest, StreamState};
use crate::error::StreamEndReason;
use crate::metrics;
use crate::types::Vbid;

pub struct NotifierStream {
    core: StreamCore,
    producer: Weak<DcpProducer>,
    ready_q: Mutex<ReadyQueue>,
}

impl NotifierStream {
    pub fn new(producer: Weak<DcpProducer>, req: StreamRequest) -> Arc<Self> {
        let ready_q = ReadyQueue::new();
        let ready_bytes = ready_q.bytes_handle();
        Arc::new(Self {
            core: StreamCore::new(req, ready_bytes),
            producer,
            ready_q: Mutex::new(ready_q),
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

    pub fn next(&self) -> Option<DcpResponse> {
        let mut q = self.lock_q();
        let resp = q.pop();
        if q.is_empty() {
            self.core.clear_items_ready();
        }
        resp
    }

    /// Fires the one-shot notification once data reaches the watch point,
    /// then the stream is done.
    pub fn notify_seqno_available(&self, seqno: u64) {
        let mut q = self.lock_q();
        if !self.core.is_active() || seqno < self.core.req.start_seqno {
            return;
        }
        q.push(DcpResponse::SeqnoNotification {
            opaque: self.core.opaque(),
            vbucket: self.core.vbucket(),
            seqno,
        });
        self.core.transition(StreamState::Dead);
        tracing::debug!(
            vbucket = %self.core.vbucket(),
            stream = self.core.name(),
            seqno,
            "seqno notification queued"
        );
        drop(q);
        self.wake_producer();
    }

    pub fn set_dead(&self, reason: StreamEndReason) -> usize {
        let mut q = self.lock_q();
        let dropped = q.clear();
        self.core.clear_items_ready();
        if self.core.is_active() {
            q.push(DcpResponse::StreamEnd {
                opaque: self.core.opaque(),
                vbucket: self.core.vbucket(),
                reason,
            });
            self.core.transition(StreamState::Dead);
            metrics::stream_end(reason);
            drop(q);
            self.wake_producer();
        }
        dropped
    }

    pub fn add_stats(&self, sink: &mut dyn crate::metrics::StatSink) {
        let prefix = format!("{}:stream_{}", self.core.name(), self.core.vbucket().0);
        sink.stat(&format!("{prefix}_state"), self.core.state().as_str().to_string());
        sink.stat(
            &format!("{prefix}_start_seqno"),
            self.core.req.start_seqno.to_string(),
        );
        sink.stat(
            &format!("{prefix}_ready_queue_bytes"),
            self.core.ready_q_bytes().to_string(),
        );
    }

    fn wake_producer(&self) {
        if self.core.raise_items_ready()
            && let Some(producer) = self.producer.upgrade()
        {
            producer.notify_stream_ready(self.core.vbucket());
        }
    }

    fn lock_q(&self) -> MutexGuard<'_, ReadyQueue> {
        self.ready_q.lock().expect("stream mutex poisoned")
    }
}
