//! Registry of producer and consumer connections.
//!
//! Multiplexes per-vbucket notifications over a shard-striped index so
//! the hot path (a flusher announcing a new seqno) touches exactly one
//! shard lock, and meters concurrent disk backfills against the bucket
//! quota.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};

use crate::config::DcpConfig;
use crate::dcp::consumer::DcpConsumer;
use crate::dcp::producer::{DcpProducer, StreamReqOutcome};
use crate::dcp::stream::StreamRequest;
use crate::engine::{BackfillScheduler, CheckpointAccess, IoNotifier, ReplicaVbuckets};
use crate::error::EngineStatus;
use crate::metrics;
use crate::types::{ConnCookie, StreamFlags, Vbid, VbucketState};

/// Protocol tag prefixed to every user-supplied connection name.
pub const CONN_NAME_PREFIX: &str = "dcpq:";

/// Assumed per-backfill file memory footprint.
const DB_FILE_MEM: usize = 10 * 1024;
/// Hard cap on concurrently admitted backfills.
const NUM_BACKFILLS_THRESHOLD: usize = 4096;
/// Percentage of the bucket quota granted to backfill inventory.
const NUM_BACKFILLS_MEM_THRESHOLD_PCT: usize = 1;

/// Shard count for the per-vbucket connection index.
const VB_CONN_SHARDS: usize = 32;

#[derive(Clone)]
pub enum Connection {
    Producer(Arc<DcpProducer>),
    Consumer(Arc<DcpConsumer>),
}

impl Connection {
    pub fn cookie(&self) -> ConnCookie {
        match self {
            Connection::Producer(p) => p.cookie(),
            Connection::Consumer(c) => c.cookie(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Connection::Producer(p) => p.name(),
            Connection::Consumer(c) => c.name(),
        }
    }

    fn set_disconnect(&self) {
        match self {
            Connection::Producer(p) => p.set_disconnect(),
            Connection::Consumer(c) => c.set_disconnect(),
        }
    }

    fn wants_notify(&self, now: Instant, max_idle: Duration) -> bool {
        let (paused, disconnect, notify_sent, last_walk) = match self {
            Connection::Producer(p) => (
                p.is_paused(),
                p.do_disconnect(),
                p.notify_sent(),
                p.last_walk_time(),
            ),
            Connection::Consumer(c) => (
                c.is_paused(),
                c.do_disconnect(),
                c.notify_sent(),
                c.last_walk_time(),
            ),
        };
        (paused || disconnect) && (!notify_sent || last_walk + max_idle < now)
    }

    fn set_notify_sent(&self) {
        match self {
            Connection::Producer(p) => p.set_notify_sent(true),
            Connection::Consumer(c) => c.set_notify_sent(true),
        }
    }
}

/// Background thread handing wakeups to the network layer so no stream
/// path ever blocks on the transport.
pub struct ConnNotifier {
    tx: Sender<ConnCookie>,
    stopped: Arc<AtomicBool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ConnNotifier {
    fn spawn(io: Arc<dyn IoNotifier>) -> Arc<Self> {
        let (tx, rx): (Sender<ConnCookie>, Receiver<ConnCookie>) =
            crossbeam::channel::unbounded();
        let stopped = Arc::new(AtomicBool::new(false));
        let worker_stopped = Arc::clone(&stopped);
        let join = std::thread::spawn(move || {
            while !worker_stopped.load(Ordering::Acquire) {
                match rx.recv_timeout(Duration::from_millis(200)) {
                    Ok(cookie) => io.notify_io_complete(cookie, EngineStatus::Success),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });
        Arc::new(Self {
            tx,
            stopped,
            join: Mutex::new(Some(join)),
        })
    }

    pub fn notify(&self, cookie: ConnCookie) {
        if !self.stopped.load(Ordering::Acquire) {
            let _ = self.tx.send(cookie);
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let join = self.join.lock().expect("notifier join poisoned").take();
        if let Some(join) = join {
            let _ = join.join();
        }
    }
}

#[derive(Default)]
struct ConnRegistry {
    all: Vec<Connection>,
    by_cookie: HashMap<ConnCookie, Connection>,
    dead: VecDeque<Connection>,
}

struct BackfillAdmission {
    active: usize,
    max: usize,
}

pub struct DcpConnMap {
    config: DcpConfig,
    engine: Arc<dyn CheckpointAccess>,
    backfill: Arc<dyn BackfillScheduler>,
    vbuckets: Arc<dyn ReplicaVbuckets>,
    notifier: Arc<ConnNotifier>,

    conns: Mutex<ConnRegistry>,
    /// Held around connection destruction to keep destructor work off the
    /// registry lock.
    release_lock: Mutex<()>,

    vb_conn_shards: Vec<parking_lot::Mutex<HashMap<Vbid, Vec<Arc<DcpProducer>>>>>,
    backfills: parking_lot::Mutex<BackfillAdmission>,
    min_compression_ratio: AtomicU32,
}

impl DcpConnMap {
    pub fn new(
        config: DcpConfig,
        engine: Arc<dyn CheckpointAccess>,
        backfill: Arc<dyn BackfillScheduler>,
        vbuckets: Arc<dyn ReplicaVbuckets>,
        io: Arc<dyn IoNotifier>,
    ) -> Arc<Self> {
        let max_backfills = Self::backfill_limit(config.max_data_size);
        let min_ratio = config.min_compression_ratio;
        Arc::new(Self {
            config,
            engine,
            backfill,
            vbuckets,
            notifier: ConnNotifier::spawn(io),
            conns: Mutex::new(ConnRegistry::default()),
            release_lock: Mutex::new(()),
            vb_conn_shards: (0..VB_CONN_SHARDS)
                .map(|_| parking_lot::Mutex::new(HashMap::new()))
                .collect(),
            backfills: parking_lot::Mutex::new(BackfillAdmission {
                active: 0,
                max: max_backfills,
            }),
            min_compression_ratio: AtomicU32::new(min_ratio.to_bits()),
        })
    }

    fn backfill_limit(max_data_size: usize) -> usize {
        let budget = max_data_size * NUM_BACKFILLS_MEM_THRESHOLD_PCT / 100 / DB_FILE_MEM;
        budget.clamp(1, NUM_BACKFILLS_THRESHOLD)
    }

    /// Registers a producer connection. A connection reusing a logical
    /// name bumps the previous holder, which is then torn down on its own
    /// disconnect path.
    pub fn new_producer(
        &self,
        cookie: ConnCookie,
        name: &str,
        notify_only: bool,
    ) -> Arc<DcpProducer> {
        let conn_name = format!("{CONN_NAME_PREFIX}{name}");
        let mut conns = self.lock_conns();
        self.bump_named_connection(&mut *conns, &conn_name);

        let producer = DcpProducer::new(
            cookie,
            conn_name,
            notify_only,
            self.config.clone(),
            Arc::clone(&self.engine),
            Arc::clone(&self.backfill),
            Some(Arc::clone(&self.notifier)),
        );
        tracing::info!(conn = producer.name(), %cookie, "producer connection created");
        let conn = Connection::Producer(Arc::clone(&producer));
        conns.all.push(conn.clone());
        conns.by_cookie.insert(cookie, conn);
        producer
    }

    pub fn new_consumer(&self, cookie: ConnCookie, name: &str) -> Arc<DcpConsumer> {
        let conn_name = format!("{CONN_NAME_PREFIX}{name}");
        let mut conns = self.lock_conns();
        self.bump_named_connection(&mut *conns, &conn_name);

        let consumer = DcpConsumer::new(
            cookie,
            conn_name,
            self.config.clone(),
            Arc::clone(&self.vbuckets),
            Some(Arc::clone(&self.notifier)),
        );
        tracing::info!(conn = consumer.name(), %cookie, "consumer connection created");
        let conn = Connection::Consumer(Arc::clone(&consumer));
        conns.all.push(conn.clone());
        conns.by_cookie.insert(cookie, conn);
        consumer
    }

    fn bump_named_connection(&self, conns: &mut ConnRegistry, name: &str) {
        if let Some(pos) = conns.all.iter().position(|conn| conn.name() == name) {
            let old = conns.all.remove(pos);
            tracing::info!(conn = name, "marking stale connection for disconnect");
            old.set_disconnect();
        }
    }

    pub fn find_by_cookie(&self, cookie: ConnCookie) -> Option<Connection> {
        self.lock_conns().by_cookie.get(&cookie).cloned()
    }

    /// Routes a stream request to the producer owning `cookie` and, on
    /// success, indexes it for per-vbucket notifications.
    pub fn stream_req(&self, cookie: ConnCookie, req: StreamRequest) -> StreamReqOutcome {
        let Some(Connection::Producer(producer)) = self.find_by_cookie(cookie) else {
            return StreamReqOutcome::Fail(EngineStatus::Disconnect);
        };
        let vb = req.vbucket;
        let outcome = producer.stream_req(req);
        if outcome == StreamReqOutcome::Accepted {
            self.add_vb_conn(vb, Arc::clone(&producer));
        }
        outcome
    }

    pub fn close_stream(&self, cookie: ConnCookie, vb: Vbid) -> EngineStatus {
        let Some(Connection::Producer(producer)) = self.find_by_cookie(cookie) else {
            return EngineStatus::Disconnect;
        };
        let status = producer.close_stream(vb);
        if status.is_success() {
            self.remove_vb_conn(vb, cookie);
        }
        status
    }

    /// Opens a passive stream; at most one may exist per vbucket across
    /// all connections.
    pub fn add_passive_stream(
        &self,
        cookie: ConnCookie,
        add_opaque: u32,
        vb: Vbid,
        flags: StreamFlags,
    ) -> EngineStatus {
        let conns = self.lock_conns();
        for conn in &conns.all {
            if let Connection::Consumer(consumer) = conn
                && consumer.is_stream_present(vb)
            {
                tracing::warn!(
                    vbucket = %vb,
                    holder = consumer.name(),
                    "rejecting passive stream, one already exists for the vbucket"
                );
                return EngineStatus::KeyEexists;
            }
        }
        let Some(Connection::Consumer(consumer)) = conns.by_cookie.get(&cookie).cloned() else {
            return EngineStatus::Disconnect;
        };
        // Held across add_stream so two peers cannot race the uniqueness
        // check for the same vbucket.
        consumer.add_stream(add_opaque, vb, flags)
    }

    /// Fans a vbucket state change out to every producer, and to
    /// consumers when inbound streams must close too.
    pub fn vbucket_state_changed(&self, vb: Vbid, state: VbucketState, close_inbound: bool) {
        let conns: Vec<Connection> = {
            let registry = self.lock_conns();
            registry.by_cookie.values().cloned().collect()
        };
        for conn in conns {
            match conn {
                Connection::Producer(producer) => producer.vbucket_state_changed(vb, state),
                Connection::Consumer(consumer) if close_inbound => {
                    consumer.vbucket_state_changed(vb, state)
                }
                Connection::Consumer(_) => {}
            }
        }
    }

    /// Asks producers on this vbucket to close a named slow stream.
    pub fn close_slow_stream(&self, vb: Vbid, name: &str) -> bool {
        let shard = self.shard(vb).lock();
        if let Some(producers) = shard.get(&vb) {
            for producer in producers {
                if producer.close_slow_stream(vb, name) {
                    return true;
                }
            }
        }
        false
    }

    /// Hot path: a new seqno is available on a vbucket; wake every
    /// producer streaming it. Touches exactly one shard lock.
    pub fn notify_vb_connections(&self, vb: Vbid, by_seqno: u64) {
        let shard = self.shard(vb).lock();
        if let Some(producers) = shard.get(&vb) {
            for producer in producers {
                producer.notify_seqno_available(vb, by_seqno);
            }
        }
    }

    /// Backfill admission: claims a slot if the quota allows.
    pub fn can_add_backfill_to_active_q(&self) -> bool {
        let mut backfills = self.backfills.lock();
        if backfills.active < backfills.max {
            backfills.active += 1;
            true
        } else {
            metrics::backfill_admission_denied();
            false
        }
    }

    pub fn decr_num_active_snoozing_backfills(&self) {
        let mut backfills = self.backfills.lock();
        if backfills.active > 0 {
            backfills.active -= 1;
        } else {
            tracing::warn!("active snoozing backfills already zero");
        }
    }

    pub fn num_active_snoozing_backfills(&self) -> usize {
        self.backfills.lock().active
    }

    /// Recomputes the admission ceiling after a quota change.
    pub fn update_max_active_snoozing_backfills(&self, max_data_size: usize) {
        let max = Self::backfill_limit(max_data_size);
        self.backfills.lock().max = max;
        tracing::debug!(max, "max active snoozing backfills set");
    }

    pub fn update_min_compression_ratio(&self, ratio: f32) {
        self.min_compression_ratio
            .store(ratio.to_bits(), Ordering::Release);
    }

    pub fn min_compression_ratio(&self) -> f32 {
        f32::from_bits(self.min_compression_ratio.load(Ordering::Acquire))
    }

    /// Tears a connection out of the registry. The connection object is
    /// parked on the dead list; `manage_connections` releases it.
    pub fn disconnect(&self, cookie: ConnCookie) {
        let mut conns = self.lock_conns();
        if let Some(pos) = conns.all.iter().position(|c| c.cookie() == cookie) {
            conns.all.remove(pos);
        }
        let Some(conn) = conns.by_cookie.remove(&cookie) else {
            return;
        };
        conn.set_disconnect();
        tracing::info!(conn = conn.name(), %cookie, "removing connection");
        match &conn {
            Connection::Producer(producer) => {
                producer.close_all_streams();
                producer.clear_checkpoint_processor_queue();
            }
            Connection::Consumer(consumer) => {
                consumer.cancel_task();
                consumer.close_all_streams();
            }
        }
        conns.dead.push_back(conn);
        metrics::set_dead_connections(conns.dead.len() as u64);
    }

    /// Periodic reaper: releases dead connections and re-notifies paused
    /// peers that have idled past the bound.
    pub fn manage_connections(&self) {
        let mut release = Vec::new();
        let mut to_notify = Vec::new();
        {
            let mut conns = self.lock_conns();
            while let Some(conn) = conns.dead.pop_front() {
                release.push(conn);
            }
            metrics::set_dead_connections(0);

            let now = Instant::now();
            let max_idle = Duration::from_secs(self.config.max_idle_time_secs);
            for conn in conns.by_cookie.values() {
                if conn.wants_notify(now, max_idle) {
                    to_notify.push(conn.clone());
                }
            }
        }

        for conn in to_notify {
            self.notifier.notify(conn.cookie());
            conn.set_notify_sent();
        }

        let _release_guard = self.release_lock.lock().expect("release lock poisoned");
        for conn in release {
            if let Connection::Producer(producer) = &conn {
                producer.shutdown_tasks();
            }
            self.remove_vb_conns_for(conn.cookie());
            tracing::debug!(conn = conn.name(), "released dead connection");
        }
    }

    /// Closes everything synchronously so bucket teardown never waits on
    /// the periodic reaper.
    pub fn shutdown_all_connections(&self) {
        tracing::info!("shutting down dcp connections");
        self.notifier.stop();

        let to_release: Vec<Connection> = {
            let mut conns = self.lock_conns();
            let to_release = conns.all.clone();
            for conn in &to_release {
                conn.set_disconnect();
                match conn {
                    Connection::Producer(producer) => {
                        producer.close_all_streams();
                        producer.clear_checkpoint_processor_queue();
                    }
                    Connection::Consumer(consumer) => {
                        consumer.cancel_task();
                        consumer.close_all_streams();
                    }
                }
            }
            conns.all.clear();
            conns.by_cookie.clear();
            to_release
        };

        {
            let _release_guard = self.release_lock.lock().expect("release lock poisoned");
            for conn in &to_release {
                if let Connection::Producer(producer) = conn {
                    producer.shutdown_tasks();
                }
                self.remove_vb_conns_for(conn.cookie());
            }
        }

        self.manage_connections();
    }

    pub fn add_stats(&self, sink: &mut dyn crate::metrics::StatSink) {
        let conns = self.lock_conns();
        sink.stat("ep_dcp_count", conns.all.len().to_string());
        sink.stat("ep_dcp_dead_conn_count", conns.dead.len().to_string());
        sink.stat(
            "ep_dcp_num_active_snoozing_backfills",
            self.num_active_snoozing_backfills().to_string(),
        );
    }

    fn add_vb_conn(&self, vb: Vbid, producer: Arc<DcpProducer>) {
        let mut shard = self.shard(vb).lock();
        let conns = shard.entry(vb).or_default();
        if !conns.iter().any(|p| p.cookie() == producer.cookie()) {
            conns.push(producer);
        }
    }

    fn remove_vb_conn(&self, vb: Vbid, cookie: ConnCookie) {
        let mut shard = self.shard(vb).lock();
        if let Some(conns) = shard.get_mut(&vb) {
            conns.retain(|p| p.cookie() != cookie);
            if conns.is_empty() {
                shard.remove(&vb);
            }
        }
    }

    fn remove_vb_conns_for(&self, cookie: ConnCookie) {
        for shard in &self.vb_conn_shards {
            let mut shard = shard.lock();
            shard.retain(|_, conns| {
                conns.retain(|p| p.cookie() != cookie);
                !conns.is_empty()
            });
        }
    }

    fn shard(&self, vb: Vbid) -> &parking_lot::Mutex<HashMap<Vbid, Vec<Arc<DcpProducer>>>> {
        &self.vb_conn_shards[vb.0 as usize % VB_CONN_SHARDS]
    }

    fn lock_conns(&self) -> MutexGuard<'_, ConnRegistry> {
        self.conns.lock().expect("connection registry poisoned")
    }
}
