//! Producer connection: owns the active/notifier streams requested by one
//! peer and multiplexes their ready queues into a single drain order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Instant;

use crate::config::DcpConfig;
use crate::dcp::active::ActiveStream;
use crate::dcp::connmap::ConnNotifier;
use crate::dcp::notifier::NotifierStream;
use crate::dcp::processor::{CheckpointProcessor, ProcessorTask};
use crate::dcp::response::DcpResponse;
use crate::dcp::stream::StreamRequest;
use crate::engine::{BackfillScheduler, CheckpointAccess, RollbackCheck};
use crate::error::{EngineStatus, StreamEndReason};
use crate::types::{ConnCookie, Vbid, VbucketState};

/// Answer to a stream request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamReqOutcome {
    Accepted,
    /// The peer's `{uuid, snapshot}` does not match local failover
    /// history; it must restart from this seqno.
    Rollback(u64),
    Fail(EngineStatus),
}

#[derive(Clone)]
pub enum ProducerStream {
    Active(Arc<ActiveStream>),
    Notifier(Arc<NotifierStream>),
}

impl ProducerStream {
    pub fn name(&self) -> &str {
        match self {
            ProducerStream::Active(s) => s.name(),
            ProducerStream::Notifier(s) => s.name(),
        }
    }

    pub fn is_active(&self) -> bool {
        match self {
            ProducerStream::Active(s) => s.is_active(),
            ProducerStream::Notifier(s) => s.is_active(),
        }
    }

    pub fn items_ready(&self) -> bool {
        match self {
            ProducerStream::Active(s) => s.items_ready(),
            ProducerStream::Notifier(s) => s.items_ready(),
        }
    }

    pub fn next(&self) -> Option<DcpResponse> {
        match self {
            ProducerStream::Active(s) => s.next(),
            ProducerStream::Notifier(s) => s.next(),
        }
    }

    pub fn set_dead(&self, reason: StreamEndReason) -> usize {
        match self {
            ProducerStream::Active(s) => s.set_dead(reason),
            ProducerStream::Notifier(s) => s.set_dead(reason),
        }
    }

    pub fn notify_seqno_available(&self, seqno: u64) {
        match self {
            ProducerStream::Active(s) => s.notify_seqno_available(seqno),
            ProducerStream::Notifier(s) => s.notify_seqno_available(seqno),
        }
    }

    pub fn add_stats(&self, sink: &mut dyn crate::metrics::StatSink) {
        match self {
            ProducerStream::Active(s) => s.add_stats(sink),
            ProducerStream::Notifier(s) => s.add_stats(sink),
        }
    }
}

#[derive(Default)]
struct ReadyList {
    order: VecDeque<Vbid>,
    queued: HashSet<Vbid>,
}

pub struct DcpProducer {
    cookie: ConnCookie,
    name: String,
    notify_only: bool,
    self_handle: Weak<DcpProducer>,

    config: DcpConfig,
    engine: Arc<dyn CheckpointAccess>,
    backfill: Arc<dyn BackfillScheduler>,
    conn_notifier: Option<Arc<ConnNotifier>>,

    processor: Arc<CheckpointProcessor>,
    processor_task: Mutex<Option<ProcessorTask>>,

    disconnect: AtomicBool,
    compression_enabled: AtomicBool,
    paused: AtomicBool,
    notify_sent: AtomicBool,
    last_walk: Mutex<Instant>,

    streams: RwLock<HashMap<Vbid, ProducerStream>>,
    ready: Mutex<ReadyList>,
}

impl DcpProducer {
    pub fn new(
        cookie: ConnCookie,
        name: String,
        notify_only: bool,
        config: DcpConfig,
        engine: Arc<dyn CheckpointAccess>,
        backfill: Arc<dyn BackfillScheduler>,
        conn_notifier: Option<Arc<ConnNotifier>>,
    ) -> Arc<Self> {
        let task = CheckpointProcessor::spawn(config.snapshot_marker_yield_limit);
        Self::with_processor(cookie, name, notify_only, config, engine, backfill, conn_notifier, task)
    }

    /// Construction with a caller-provided processor task; lets tests
    /// drive drain passes synchronously.
    pub fn with_processor(
        cookie: ConnCookie,
        name: String,
        notify_only: bool,
        config: DcpConfig,
        engine: Arc<dyn CheckpointAccess>,
        backfill: Arc<dyn BackfillScheduler>,
        conn_notifier: Option<Arc<ConnNotifier>>,
        task: ProcessorTask,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_handle| Self {
            cookie,
            name,
            notify_only,
            self_handle: self_handle.clone(),
            config,
            engine,
            backfill,
            conn_notifier,
            processor: Arc::clone(task.processor()),
            processor_task: Mutex::new(Some(task)),
            disconnect: AtomicBool::new(false),
            compression_enabled: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            notify_sent: AtomicBool::new(false),
            last_walk: Mutex::new(Instant::now()),
            streams: RwLock::new(HashMap::new()),
            ready: Mutex::new(ReadyList::default()),
        })
    }

    pub fn cookie(&self) -> ConnCookie {
        self.cookie
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_notify_only(&self) -> bool {
        self.notify_only
    }

    pub fn set_disconnect(&self) {
        self.disconnect.store(true, Ordering::Release);
    }

    pub fn do_disconnect(&self) -> bool {
        self.disconnect.load(Ordering::Acquire)
    }

    pub fn set_compression_enabled(&self, enabled: bool) {
        self.compression_enabled.store(enabled, Ordering::Release);
    }

    pub fn compression_enabled(&self) -> bool {
        self.compression_enabled.load(Ordering::Acquire)
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
        *self.last_walk.lock().expect("producer walk time poisoned")
    }

    /// Handles a peer's stream request: validate, check failover history,
    /// then stand up the stream and start its backfill.
    pub fn stream_req(&self, req: StreamRequest) -> StreamReqOutcome {
        if self.do_disconnect() {
            return StreamReqOutcome::Fail(EngineStatus::Disconnect);
        }
        if let Err(err) = req.validate() {
            tracing::warn!(
                conn = self.name,
                vbucket = %req.vbucket,
                error = %err,
                "rejecting stream request"
            );
            return StreamReqOutcome::Fail(err.status());
        }
        let vb = req.vbucket;
        let Some(vb_state) = self.engine.vbucket_state(vb) else {
            return StreamReqOutcome::Fail(EngineStatus::NotMyVbucket);
        };
        if vb_state == VbucketState::Dead {
            return StreamReqOutcome::Fail(EngineStatus::NotMyVbucket);
        }
        match self.engine.rollback_check(vb, &req) {
            RollbackCheck::NoRollback => {}
            RollbackCheck::NoVbucket => {
                return StreamReqOutcome::Fail(EngineStatus::NotMyVbucket);
            }
            RollbackCheck::RollbackAt(seqno) => {
                tracing::info!(
                    conn = self.name,
                    vbucket = %vb,
                    requested_uuid = %req.vb_uuid,
                    rollback_seqno = seqno,
                    "uuid mismatch, requesting rollback"
                );
                return StreamReqOutcome::Rollback(seqno);
            }
        }

        let mut streams = self.streams.write().expect("stream map poisoned");
        if streams.get(&vb).is_some_and(ProducerStream::is_active) {
            return StreamReqOutcome::Fail(EngineStatus::KeyEexists);
        }

        let stream = if self.notify_only {
            let start_seqno = req.start_seqno;
            let stream = NotifierStream::new(self.self_handle.clone(), req);
            // Data may already be past the watch point.
            let high = self.engine.high_seqno(vb);
            if high >= start_seqno && high > 0 {
                stream.notify_seqno_available(high);
            }
            ProducerStream::Notifier(stream)
        } else {
            let stream = ActiveStream::new(
                self.self_handle.clone(),
                Arc::clone(&self.engine),
                Arc::clone(&self.backfill),
                Arc::clone(&self.processor),
                &self.config,
                req,
            );
            stream.set_active();
            ProducerStream::Active(stream)
        };
        streams.insert(vb, stream);
        drop(streams);
        // Make sure the new stream gets polled at least once.
        self.notify_stream_ready(vb);
        StreamReqOutcome::Accepted
    }

    /// Drains the next response across all ready streams. Round-robin per
    /// vbucket; the ready-list lock is never held across a stream call.
    pub fn next(&self) -> Option<DcpResponse> {
        *self.last_walk.lock().expect("producer walk time poisoned") = Instant::now();
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
            let stream = {
                let streams = self.streams.read().expect("stream map poisoned");
                streams.get(&vb).cloned()
            };
            let Some(stream) = stream else { continue };
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

    /// Called by a stream whose ready queue just became non-empty.
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

    pub fn notify_seqno_available(&self, vb: Vbid, seqno: u64) {
        let stream = {
            let streams = self.streams.read().expect("stream map poisoned");
            streams.get(&vb).cloned()
        };
        if let Some(stream) = stream
            && stream.is_active()
        {
            stream.notify_seqno_available(seqno);
        }
    }

    pub fn vbucket_state_changed(&self, vb: Vbid, _state: VbucketState) {
        let stream = {
            let streams = self.streams.read().expect("stream map poisoned");
            streams.get(&vb).cloned()
        };
        if let Some(stream) = stream {
            stream.set_dead(StreamEndReason::State);
        }
    }

    pub fn close_stream(&self, vb: Vbid) -> EngineStatus {
        let stream = {
            let streams = self.streams.read().expect("stream map poisoned");
            streams.get(&vb).cloned()
        };
        match stream {
            Some(stream) => {
                stream.set_dead(StreamEndReason::Closed);
                EngineStatus::Success
            }
            None => EngineStatus::KeyEnoent,
        }
    }

    /// Asks this producer to close a named slow stream; true when the
    /// stream was found here.
    pub fn close_slow_stream(&self, vb: Vbid, name: &str) -> bool {
        let stream = {
            let streams = self.streams.read().expect("stream map poisoned");
            streams.get(&vb).cloned()
        };
        if let Some(stream) = stream
            && stream.is_active()
            && stream.name() == name
        {
            tracing::warn!(conn = self.name, vbucket = %vb, "closing slow stream");
            stream.set_dead(StreamEndReason::Slow);
            return true;
        }
        false
    }

    pub fn close_all_streams(&self) -> Vec<Vbid> {
        let drained: Vec<(Vbid, ProducerStream)> = {
            let mut streams = self.streams.write().expect("stream map poisoned");
            streams.drain().collect()
        };
        let mut vbids = Vec::with_capacity(drained.len());
        for (vb, stream) in drained {
            stream.set_dead(StreamEndReason::Disconnected);
            vbids.push(vb);
        }
        vbids
    }

    pub fn clear_checkpoint_processor_queue(&self) {
        self.processor.clear();
    }

    /// Stops and joins the checkpoint processor worker.
    pub fn shutdown_tasks(&self) {
        let task = self
            .processor_task
            .lock()
            .expect("processor task poisoned")
            .take();
        if let Some(mut task) = task {
            task.stop();
        }
    }

    pub fn snapshot_marker_ack(&self, vb: Vbid) {
        if let Some(ProducerStream::Active(stream)) = self.get_stream(vb) {
            stream.snapshot_marker_ack_received();
        }
    }

    pub fn set_vbucket_state_ack(&self, vb: Vbid) {
        if let Some(ProducerStream::Active(stream)) = self.get_stream(vb) {
            stream.set_vbucket_state_ack_received();
        }
    }

    pub fn stream_vbids(&self) -> Vec<Vbid> {
        self.streams
            .read()
            .expect("stream map poisoned")
            .keys()
            .copied()
            .collect()
    }

    pub fn num_streams(&self) -> usize {
        self.streams.read().expect("stream map poisoned").len()
    }

    fn get_stream(&self, vb: Vbid) -> Option<ProducerStream> {
        self.streams
            .read()
            .expect("stream map poisoned")
            .get(&vb)
            .cloned()
    }

    pub fn add_stats(&self, sink: &mut dyn crate::metrics::StatSink) {
        sink.stat(&format!("{}:type", self.name), "producer".to_string());
        sink.stat(&format!("{}:paused", self.name), self.is_paused().to_string());
        sink.stat(
            &format!("{}:num_streams", self.name),
            self.num_streams().to_string(),
        );
        let streams: Vec<ProducerStream> = {
            let map = self.streams.read().expect("stream map poisoned");
            map.values().cloned().collect()
        };
        for stream in streams {
            stream.add_stats(sink);
        }
    }

    fn lock_ready(&self) -> MutexGuard<'_, ReadyList> {
        self.ready.lock().expect("ready list poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::dcp::testutil::{mutation, open_request, stream_request, MockEngine};
    use crate::types::{StreamFlags, VbUuid};

    const VB: Vbid = Vbid(0);

    fn producer_on(engine: &Arc<MockEngine>, notify_only: bool) -> Arc<DcpProducer> {
        DcpProducer::new(
            ConnCookie::generate(),
            "dcpq:test".to_string(),
            notify_only,
            DcpConfig::default(),
            Arc::clone(engine) as Arc<dyn CheckpointAccess>,
            Arc::clone(engine) as Arc<dyn BackfillScheduler>,
            None,
        )
    }

    #[test]
    fn stream_req_accepts_then_rejects_duplicates() {
        let engine = MockEngine::new();
        engine.create_vbucket(VB, VbUuid(0xabcd));
        let producer = producer_on(&engine, false);

        assert_eq!(
            producer.stream_req(open_request(VB)),
            StreamReqOutcome::Accepted
        );
        assert_eq!(
            producer.stream_req(open_request(VB)),
            StreamReqOutcome::Fail(EngineStatus::KeyEexists)
        );
        assert_eq!(producer.num_streams(), 1);
        producer.shutdown_tasks();
    }

    #[test]
    fn stream_req_for_unknown_vbucket_fails() {
        let engine = MockEngine::new();
        let producer = producer_on(&engine, false);
        assert_eq!(
            producer.stream_req(open_request(VB)),
            StreamReqOutcome::Fail(EngineStatus::NotMyVbucket)
        );
        producer.shutdown_tasks();
    }

    #[test]
    fn stream_req_with_inverted_range_fails() {
        let engine = MockEngine::new();
        engine.create_vbucket(VB, VbUuid(0xabcd));
        let producer = producer_on(&engine, false);

        let mut req = open_request(VB);
        req.start_seqno = 10;
        req.snap_start_seqno = 5;
        req.snap_end_seqno = 12;
        assert_eq!(
            producer.stream_req(req),
            StreamReqOutcome::Fail(EngineStatus::Einval)
        );
        producer.shutdown_tasks();
    }

    #[test]
    fn stale_uuid_requests_rollback_without_creating_a_stream() {
        let engine = MockEngine::new();
        engine.create_vbucket(VB, VbUuid(0x1111));
        engine.seed_disk(VB, 20);
        engine.set_rollback_at(VB, 12);
        let producer = producer_on(&engine, false);

        // Request carries uuid 0xabcd, local history says 0x1111.
        let outcome = producer.stream_req(stream_request(VB, 15, crate::types::OPEN_ENDED));
        assert_eq!(outcome, StreamReqOutcome::Rollback(12));
        assert_eq!(producer.num_streams(), 0);
        assert!(producer.next().is_none(), "no responses without a stream");
        producer.shutdown_tasks();
    }

    #[test]
    fn next_drains_streams_and_pauses_when_empty() {
        let engine = MockEngine::new();
        engine.create_vbucket(VB, VbUuid(0xabcd));
        engine.seed_disk(VB, 3);
        let producer = producer_on(&engine, false);
        producer.stream_req(stream_request(VB, 0, 3));

        let mut responses = Vec::new();
        while let Some(resp) = producer.next() {
            responses.push(resp);
        }
        // Marker, three mutations, stream end.
        assert_eq!(responses.len(), 5);
        assert!(producer.is_paused());
        producer.shutdown_tasks();
    }

    #[test]
    fn notify_only_producer_uses_notifier_streams() {
        let engine = MockEngine::new();
        engine.create_vbucket(VB, VbUuid(0xabcd));
        let producer = producer_on(&engine, true);
        let mut req = open_request(VB);
        req.start_seqno = 10;
        req.snap_start_seqno = 10;
        req.snap_end_seqno = 10;
        assert_eq!(producer.stream_req(req), StreamReqOutcome::Accepted);

        // Nothing past the watch point yet.
        assert!(producer.next().is_none());

        producer.notify_seqno_available(VB, 11);
        let resp = producer.next().expect("notification");
        assert!(matches!(
            resp,
            DcpResponse::SeqnoNotification { seqno: 11, .. }
        ));
        producer.shutdown_tasks();
    }

    #[test]
    fn notify_only_producer_fires_immediately_when_data_exists() {
        let engine = MockEngine::new();
        engine.create_vbucket(VB, VbUuid(0xabcd));
        engine.seed_disk(VB, 5);
        let producer = producer_on(&engine, true);

        let mut req = open_request(VB);
        req.start_seqno = 2;
        req.snap_start_seqno = 2;
        req.snap_end_seqno = 2;
        producer.stream_req(req);
        assert!(matches!(
            producer.next(),
            Some(DcpResponse::SeqnoNotification { seqno: 5, .. })
        ));
        producer.shutdown_tasks();
    }

    #[test]
    fn close_slow_stream_matches_by_name() {
        let engine = MockEngine::new();
        engine.create_vbucket(VB, VbUuid(0xabcd));
        let producer = producer_on(&engine, false);
        producer.stream_req(open_request(VB));

        assert!(!producer.close_slow_stream(VB, "someone-else"));
        assert!(producer.close_slow_stream(VB, "test-conn"));
        // Already dead; nothing further to close.
        assert!(!producer.close_slow_stream(VB, "test-conn"));
        producer.shutdown_tasks();
    }

    #[test]
    fn vbucket_state_change_ends_stream_with_state() {
        let engine = MockEngine::new();
        engine.create_vbucket(VB, VbUuid(0xabcd));
        let producer = producer_on(&engine, false);
        producer.stream_req(open_request(VB));

        producer.vbucket_state_changed(VB, VbucketState::Replica);
        let responses: Vec<_> = std::iter::from_fn(|| producer.next()).collect();
        assert!(matches!(
            responses.last(),
            Some(DcpResponse::StreamEnd {
                reason: StreamEndReason::State,
                ..
            })
        ));
        producer.shutdown_tasks();
    }

    #[test]
    fn close_all_streams_reports_vbids() {
        let engine = MockEngine::new();
        for vb in 0..4u16 {
            engine.create_vbucket(Vbid(vb), VbUuid(0xabcd));
        }
        let producer = producer_on(&engine, false);
        for vb in 0..4u16 {
            let mut req = open_request(Vbid(vb));
            req.name = format!("stream-{vb}");
            producer.stream_req(req);
        }

        let mut vbids = producer.close_all_streams();
        vbids.sort();
        assert_eq!(vbids, vec![Vbid(0), Vbid(1), Vbid(2), Vbid(3)]);
        assert_eq!(producer.num_streams(), 0);
        producer.shutdown_tasks();
    }

    #[test]
    fn dead_stream_slot_can_be_reused() {
        let engine = MockEngine::new();
        engine.create_vbucket(VB, VbUuid(0xabcd));
        engine.seed_disk(VB, 1);
        let producer = producer_on(&engine, false);

        producer.stream_req(stream_request(VB, 0, 1));
        // Bounded stream completed synchronously; a new request succeeds.
        assert_eq!(
            producer.stream_req(stream_request(VB, 1, crate::types::OPEN_ENDED)),
            StreamReqOutcome::Accepted
        );
        producer.shutdown_tasks();
    }

    #[test]
    fn takeover_ack_routing_reaches_stream() {
        let engine = MockEngine::new();
        engine.create_vbucket(VB, VbUuid(0xabcd));
        let producer = producer_on(&engine, false);
        let mut req = open_request(VB);
        req.flags = StreamFlags(StreamFlags::TAKEOVER);
        producer.stream_req(req);

        let handoff = producer.next().expect("hand-off");
        assert!(matches!(handoff, DcpResponse::SetVBucketState { .. }));
        producer.set_vbucket_state_ack(VB);

        let responses: Vec<_> = std::iter::from_fn(|| producer.next()).collect();
        assert!(matches!(
            responses.last(),
            Some(DcpResponse::StreamEnd {
                reason: StreamEndReason::Ok,
                ..
            })
        ));
        producer.shutdown_tasks();
    }

    #[test]
    fn memory_items_flow_through_background_processor() {
        let engine = MockEngine::new();
        engine.create_vbucket(VB, VbUuid(0xabcd));
        let producer = producer_on(&engine, false);
        producer.stream_req(open_request(VB));

        // Prime the pump: draining the empty stream schedules it.
        assert!(producer.next().is_none());
        engine.queue_memory_item(VB, mutation(VB, 1));
        producer.notify_seqno_available(VB, 1);

        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        let mut responses = Vec::new();
        while responses.len() < 2 && Instant::now() < deadline {
            match producer.next() {
                Some(resp) => responses.push(resp),
                None => std::thread::sleep(std::time::Duration::from_millis(5)),
            }
        }
        assert!(matches!(responses[0], DcpResponse::SnapshotMarker(_)));
        assert_eq!(responses[1].by_seqno(), Some(1));
        producer.shutdown_tasks();
    }
}
