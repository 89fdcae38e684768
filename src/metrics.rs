//! Metric emission helpers.
//!
//! Counters and gauges are emitted as structured tracing events by default.
//! Tests can install a capturing sink.

use std::sync::{Arc, OnceLock, RwLock};

use crate::error::StreamEndReason;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricValue {
    Counter(u64),
    Gauge(u64),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricEvent {
    pub name: &'static str,
    pub value: MetricValue,
    pub label: Option<&'static str>,
}

pub trait MetricSink: Send + Sync {
    fn record(&self, event: MetricEvent);
}

struct TracingSink;

impl MetricSink for TracingSink {
    fn record(&self, event: MetricEvent) {
        let value = match event.value {
            MetricValue::Counter(value) | MetricValue::Gauge(value) => value,
        };
        tracing::info!(
            target: "metrics",
            metric = event.name,
            value,
            label = event.label
        );
    }
}

static METRIC_SINK: OnceLock<RwLock<Arc<dyn MetricSink>>> = OnceLock::new();

fn sink() -> Arc<dyn MetricSink> {
    METRIC_SINK
        .get_or_init(|| RwLock::new(Arc::new(TracingSink)))
        .read()
        .expect("metrics sink lock poisoned")
        .clone()
}

pub fn set_sink(new_sink: Arc<dyn MetricSink>) {
    let lock = METRIC_SINK.get_or_init(|| RwLock::new(Arc::new(TracingSink)));
    *lock.write().expect("metrics sink lock poisoned") = new_sink;
}

fn emit(name: &'static str, value: MetricValue, label: Option<&'static str>) {
    sink().record(MetricEvent { name, value, label });
}

/// Sink for per-object stat publication (`add_stats`).
pub trait StatSink {
    fn stat(&mut self, key: &str, value: String);
}

impl<F: FnMut(&str, String)> StatSink for F {
    fn stat(&mut self, key: &str, value: String) {
        self(key, value)
    }
}

pub fn stream_end(reason: StreamEndReason) {
    let label = match reason {
        StreamEndReason::Ok => "ok",
        StreamEndReason::Closed => "closed",
        StreamEndReason::State => "state",
        StreamEndReason::Disconnected => "disconnected",
        StreamEndReason::Slow => "slow",
    };
    emit("dcp_stream_end", MetricValue::Counter(1), Some(label));
}

pub fn backfill_item(from_disk: bool) {
    let label = if from_disk { "disk" } else { "memory" };
    emit("dcp_backfill_item", MetricValue::Counter(1), Some(label));
}

pub fn items_sent(count: u64) {
    emit("dcp_items_sent", MetricValue::Counter(count), None);
}

pub fn consumer_buffer_full() {
    emit("dcp_consumer_buffer_full", MetricValue::Counter(1), None);
}

pub fn backfill_admission_denied() {
    emit("dcp_backfill_admission_denied", MetricValue::Counter(1), None);
}

pub fn set_dead_connections(count: u64) {
    emit("dcp_dead_connections", MetricValue::Gauge(count), None);
}

pub fn processor_queue_len(len: u64) {
    emit("dcp_checkpoint_queue_len", MetricValue::Gauge(len), None);
}
