//! Per-stream outbound FIFO with a lock-free byte footprint.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::dcp::response::DcpResponse;

/// Ordered responses awaiting transmission. The queue itself is only
/// touched under the owning stream's mutex; the byte footprint is shared
/// out as an atomic so stat readers never take that mutex.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    messages: VecDeque<DcpResponse>,
    bytes: Arc<AtomicU64>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for lock-free footprint reads.
    pub fn bytes_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.bytes)
    }

    pub fn push(&mut self, resp: DcpResponse) {
        self.bytes
            .fetch_add(resp.message_size() as u64, Ordering::Relaxed);
        self.messages.push_back(resp);
    }

    pub fn pop(&mut self) -> Option<DcpResponse> {
        let resp = self.messages.pop_front()?;
        let size = resp.message_size() as u64;
        let prev = self.bytes.fetch_sub(size, Ordering::Relaxed);
        debug_assert!(prev >= size, "ready queue byte accounting underflow");
        Some(resp)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Drops everything queued; returns how many responses were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.messages.len();
        self.messages.clear();
        self.bytes.store(0, Ordering::Relaxed);
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamEndReason;
    use crate::item::Item;
    use crate::types::Vbid;
    use bytes::Bytes;

    fn mutation(seqno: u64) -> DcpResponse {
        DcpResponse::Mutation {
            opaque: 0,
            item: Item::new(
                Bytes::from_static(b"key"),
                Some(Bytes::from_static(b"value")),
                Vbid(0),
                seqno,
            ),
        }
    }

    #[test]
    fn bytes_track_queue_contents() {
        let mut q = ReadyQueue::new();
        let bytes = q.bytes_handle();

        q.push(mutation(1));
        q.push(mutation(2));
        let expected: u64 = 2 * mutation(1).message_size() as u64;
        assert_eq!(bytes.load(Ordering::Relaxed), expected);

        let popped = q.pop().unwrap();
        assert_eq!(popped.by_seqno(), Some(1));
        assert_eq!(
            bytes.load(Ordering::Relaxed),
            mutation(2).message_size() as u64
        );

        q.pop().unwrap();
        assert_eq!(bytes.load(Ordering::Relaxed), 0);
        assert!(q.pop().is_none());
    }

    #[test]
    fn clear_resets_accounting() {
        let mut q = ReadyQueue::new();
        let bytes = q.bytes_handle();
        q.push(mutation(1));
        q.push(DcpResponse::StreamEnd {
            opaque: 0,
            vbucket: Vbid(0),
            reason: StreamEndReason::Ok,
        });

        assert_eq!(q.clear(), 2);
        assert!(q.is_empty());
        assert_eq!(bytes.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn pop_preserves_order() {
        let mut q = ReadyQueue::new();
        for seqno in 1..=5 {
            q.push(mutation(seqno));
        }
        for seqno in 1..=5 {
            assert_eq!(q.pop().unwrap().by_seqno(), Some(seqno));
        }
    }
}
