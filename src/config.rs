//! Streaming engine configuration knobs (normative defaults).

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DcpConfig {
    /// Below this compression ratio an item value is sent uncompressed.
    pub min_compression_ratio: f32,

    /// Streams drained per checkpoint-processor pass before yielding.
    pub snapshot_marker_yield_limit: usize,

    /// Upper bound on the takeover send phase, in seconds.
    pub takeover_send_max_time_secs: u64,

    /// Idle bound after which the reaper re-notifies a paused connection.
    pub max_idle_time_secs: u64,

    /// Bucket quota; input to the backfill admission formula.
    pub max_data_size: usize,

    /// Consumer-side inbound buffer bounds. Exceeding either returns
    /// tmpfail to the transport so it can apply flow control.
    pub consumer_buffer_max_bytes: usize,
    pub consumer_buffer_max_items: usize,

    /// Byte budget for one process_buffered_messages pass.
    pub consumer_batch_bytes: usize,

    /// Producer-side backfill inventory bounds; crossing them asks the
    /// storage scan to pause until the ready queue drains.
    pub backfill_buffer_max_bytes: u32,
    pub backfill_buffer_max_items: u32,
}

impl Default for DcpConfig {
    fn default() -> Self {
        Self {
            min_compression_ratio: 0.85,
            snapshot_marker_yield_limit: 10,
            takeover_send_max_time_secs: 10,
            max_idle_time_secs: 5,
            max_data_size: 1024 * 1024 * 1024,
            consumer_buffer_max_bytes: 10 * 1024 * 1024,
            consumer_buffer_max_items: 50_000,
            consumer_batch_bytes: 512 * 1024,
            backfill_buffer_max_bytes: 16 * 1024 * 1024,
            backfill_buffer_max_items: 4096,
        }
    }
}
