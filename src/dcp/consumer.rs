//! Consumer connection: owns the passive streams replicating vbuckets
//! into this node and drives their buffered-message processing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Instant;

use crate::config::DcpConfig;
use crate::dcp::connmap::ConnNotifier;
use crate::dcp::passive::{PassiveStream, ProcessResult};
use crate::dcp::response::DcpResponse;
use crate::dcp::stream::StreamRequest;
use crate::engine::ReplicaVbuckets;
use crate::error::{EngineStatus, StreamEndReason};
use crate::types::{ConnCookie, StreamFlags, Vbid, VbucketState, OPEN_ENDED};

#[derive(Default)]
struct ReadyList {
    order: VecDeque<Vbid>,
    queued: HashSet<Vbid>,
}

struct OpaqueEntry {
    vbucket: Vbid,
    add_opaque: u32,
}

pub struct DcpConsumer {
    cookie: ConnCookie,
    name: String,
    self_handle: Weak<DcpConsumer>,

    config: DcpConfig,
    vbuckets: Arc<dyn ReplicaVbuckets>,
    conn_notifier: Option<Arc<ConnNotifier>>,

    disconnect: AtomicBool,
    paused: AtomicBool,
    notify_sent: AtomicBool,
    last_walk: Mutex<Instant>,
    task_cancelled: AtomicBool,
    opaque_counter: AtomicU32,

    streams: RwLock<HashMap<Vbid, Arc<PassiveStream>>>,
    opaque_map: Mutex<HashMap<u32, OpaqueEntry>>,
    ready: Mutex<ReadyList>,
}

impl DcpConsumer {
    pub fn new(
        cookie: ConnCookie,
        name: String,
        config: DcpConfig,
        vbuckets: Arc<dyn ReplicaVbuckets>,
        conn_notifier: Option<Arc<ConnNotifier>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_handle| Self {
            cookie,
            name,
            self_handle: self_handle.clone(),
            config,
            vbuckets,
            conn_notifier,
            disconnect: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            notify_sent: AtomicBool::new(false),
            last_walk: Mutex::new(Instant::now()),
            task_cancelled: AtomicBool::new(false),
            opaque_counter: AtomicU32::new(0),
            streams: RwLock::new(HashMap::new()),
            opaque_map: Mutex::new(HashMap::new()),
            ready: Mutex::new(ReadyList::default()),
        })
    }

    pub fn cookie(&self) -> ConnCookie {
        self.cookie
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_disconnect(&self) {
        self.disconnect.store(true, Ordering::Release);
    }

    pub fn do_disconnect(&self) -> bool {
        self.disconnect.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn notify_sent(&self) -> bool {
        self.notify_sent.load(Ordering::Acquire)
    }

    pub fn set_notify_sent(&self, sent: bool) {
        self.notify_sent.store(sent, Ordering::Release);
    }

    pub fn last_walk_time(&self) -> Instant {
        *self.last_walk.lock().expect("consumer walk time poisoned")
    }

    /// Opens a passive stream for a vbucket. The stream immediately
    /// queues its negotiation request for the network layer to drain.
    pub fn add_stream(&self, add_opaque: u32, vb: Vbid, flags: StreamFlags) -> EngineStatus {
        if self.do_disconnect() {
            return EngineStatus::Disconnect;
        }
        let Some(info) = self.vbuckets.stream_resume_info(vb) else {
            return EngineStatus::NotMyVbucket;
        };

        let mut streams = self.streams.write().expect("stream map poisoned");
        if streams.get(&vb).is_some_and(|s| s.is_active()) {
            tracing::warn!(conn = self.name, vbucket = %vb, "stream already open");
            return EngineStatus::KeyEexists;
        }

        let opaque = self.opaque_counter.fetch_add(1, Ordering::AcqRel) + 1;
        let req = StreamRequest {
            name: self.name.clone(),
            flags,
            opaque,
            vbucket: vb,
            start_seqno: info.start_seqno,
            end_seqno: OPEN_ENDED,
            vb_uuid: info.vb_uuid,
            snap_start_seqno: info.snap_start_seqno,
            snap_end_seqno: info.snap_end_seqno,
        };
        let stream = PassiveStream::new(
            self.self_handle.clone(),
            Arc::clone(&self.vbuckets),
            &self.config,
            req,
        );
        streams.insert(vb, stream);
        drop(streams);

        self.opaque_map
            .lock()
            .expect("opaque map poisoned")
            .insert(opaque, OpaqueEntry {
                vbucket: vb,
                add_opaque,
            });
        self.notify_stream_ready(vb);
        EngineStatus::Success
    }

    /// The producer answered our stream request.
    pub fn accept_stream(&self, opaque: u32, status: EngineStatus) -> EngineStatus {
        let entry = {
            let map = self.opaque_map.lock().expect("opaque map poisoned");
            map.get(&opaque).map(|entry| (entry.vbucket, entry.add_opaque))
        };
        let Some((vb, add_opaque)) = entry else {
            return EngineStatus::KeyEnoent;
        };
        let Some(stream) = self.get_stream(vb) else {
            return EngineStatus::KeyEnoent;
        };
        stream.accept_stream(status, add_opaque);
        EngineStatus::Success
    }

    pub fn close_stream(&self, vb: Vbid) -> EngineStatus {
        let Some(stream) = self.get_stream(vb) else {
            return EngineStatus::KeyEnoent;
        };
        stream.set_dead(StreamEndReason::Closed);
        EngineStatus::Success
    }

    pub fn close_all_streams(&self) {
        let drained: Vec<Arc<PassiveStream>> = {
            let mut streams = self.streams.write().expect("stream map poisoned");
            streams.drain().map(|(_, s)| s).collect()
        };
        for stream in drained {
            stream.set_dead(StreamEndReason::Disconnected);
        }
        self.opaque_map.lock().expect("opaque map poisoned").clear();
    }

    /// Routes an inbound replication message to its vbucket's stream.
    pub fn message_received(&self, resp: DcpResponse) -> EngineStatus {
        if self.do_disconnect() {
            return EngineStatus::Disconnect;
        }
        let Some(vb) = resp.vbucket() else {
            return EngineStatus::Einval;
        };
        let Some(stream) = self.get_stream(vb) else {
            return EngineStatus::KeyEnoent;
        };
        stream.message_received(resp)
    }

    /// One drain pass over all streams, each bounded by the batch byte
    /// budget. Runs on the consumer's processing task.
    pub fn process_buffered_items(&self) -> ProcessResult {
        if self.task_cancelled.load(Ordering::Acquire) {
            return ProcessResult::AllProcessed;
        }
        let streams: Vec<Arc<PassiveStream>> = {
            let map = self.streams.read().expect("stream map poisoned");
            map.values().cloned().collect()
        };
        let mut result = ProcessResult::AllProcessed;
        for stream in streams {
            match stream.process_buffered_messages(self.config.consumer_batch_bytes) {
                ProcessResult::AllProcessed => {}
                ProcessResult::MoreToProcess => {
                    if result == ProcessResult::AllProcessed {
                        result = ProcessResult::MoreToProcess;
                    }
                }
                ProcessResult::CannotProcess => result = ProcessResult::CannotProcess,
            }
        }
        result
    }

    /// Stops the buffered-message processing task.
    pub fn cancel_task(&self) {
        self.task_cancelled.store(true, Ordering::Release);
    }

    /// True when a live passive stream exists for the vbucket.
    pub fn is_stream_present(&self, vb: Vbid) -> bool {
        self.streams
            .read()
            .expect("stream map poisoned")
            .get(&vb)
            .is_some_and(|s| s.is_active())
    }

    pub fn vbucket_state_changed(&self, vb: Vbid, _state: VbucketState) {
        if let Some(stream) = self.get_stream(vb) {
            stream.set_dead(StreamEndReason::State);
        }
    }

    /// Drains the next outbound message (negotiation requests and acks).
    pub fn next(&self) -> Option<DcpResponse> {
        *self.last_walk.lock().expect("consumer walk time poisoned") = Instant::now();
        loop {
            let vb = {
                let mut ready = self.lock_ready();
                match ready.order.pop_front() {
                    Some(vb) => {
                        ready.queued.remove(&vb);
                        vb
                    }
                    None => {
                        self.paused.store(true, Ordering::Release);
                        return None;
                    }
                }
            };
            let Some(stream) = self.get_stream(vb) else {
                continue;
            };
            if let Some(resp) = stream.next() {
                if stream.items_ready() {
                    self.push_ready(vb);
                }
                self.paused.store(false, Ordering::Release);
                self.notify_sent.store(false, Ordering::Release);
                return Some(resp);
            }
        }
    }

    pub fn notify_stream_ready(&self, vb: Vbid) {
        self.push_ready(vb);
        if self.is_paused()
            && !self.notify_sent.swap(true, Ordering::AcqRel)
            && let Some(notifier) = &self.conn_notifier
        {
            notifier.notify(self.cookie);
        }
    }

    fn push_ready(&self, vb: Vbid) {
        let mut ready = self.lock_ready();
        if ready.queued.insert(vb) {
            ready.order.push_back(vb);
        }
    }

    pub fn add_stats(&self, sink: &mut dyn crate::metrics::StatSink) {
        sink.stat(&format!("{}:type", self.name), "consumer".to_string());
        let streams: Vec<Arc<PassiveStream>> = {
            let map = self.streams.read().expect("stream map poisoned");
            map.values().cloned().collect()
        };
        sink.stat(&format!("{}:num_streams", self.name), streams.len().to_string());
        for stream in streams {
            stream.add_stats(sink);
        }
    }

    fn get_stream(&self, vb: Vbid) -> Option<Arc<PassiveStream>> {
        self.streams
            .read()
            .expect("stream map poisoned")
            .get(&vb)
            .cloned()
    }

    fn lock_ready(&self) -> MutexGuard<'_, ReadyList> {
        self.ready.lock().expect("ready list poisoned")
    }
}
