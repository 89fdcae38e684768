//! Shared checkpoint drain task.
//!
//! Checkpoint cursors are drained off the network path by a single task
//! per producer: streams enqueue themselves (deduplicated per vbucket),
//! and the task drains a bounded number of streams per pass so one busy
//! producer cannot monopolize the checkpoint manager.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};

use crate::dcp::active::ActiveStream;
use crate::metrics;
use crate::types::Vbid;

#[derive(Default)]
struct ProcessorQueue {
    streams: VecDeque<(Vbid, Weak<ActiveStream>)>,
    queued_vbuckets: HashSet<Vbid>,
}

pub struct CheckpointProcessor {
    queue: Mutex<ProcessorQueue>,
    notified: AtomicBool,
    yield_limit: usize,
    wakeup_tx: Sender<()>,
}

impl CheckpointProcessor {
    pub fn new(yield_limit: usize) -> (Arc<Self>, Receiver<()>) {
        let (wakeup_tx, wakeup_rx) = crossbeam::channel::unbounded();
        let processor = Arc::new(Self {
            queue: Mutex::new(ProcessorQueue::default()),
            notified: AtomicBool::new(false),
            yield_limit: yield_limit.max(1),
            wakeup_tx,
        });
        (processor, wakeup_rx)
    }

    /// Starts the worker thread driving `run_once` passes.
    pub fn spawn(yield_limit: usize) -> ProcessorTask {
        let (processor, wakeup_rx) = Self::new(yield_limit);
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker = Arc::clone(&processor);
        let worker_shutdown = Arc::clone(&shutdown);
        let join = std::thread::spawn(move || {
            while !worker_shutdown.load(Ordering::Acquire) {
                match wakeup_rx.recv_timeout(Duration::from_millis(200)) {
                    Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                while worker.run_once() {
                    if worker_shutdown.load(Ordering::Acquire) {
                        break;
                    }
                }
            }
        });

        ProcessorTask {
            processor,
            shutdown,
            join: Some(join),
        }
    }

    /// Enqueues a stream for a drain pass. A vbucket already queued is a
    /// no-op, so notification storms on one vbucket cost one slot.
    pub fn schedule(&self, stream: &Arc<ActiveStream>) {
        let vb = stream.vbucket();
        {
            let mut queue = self.queue.lock().expect("processor queue poisoned");
            if !queue.queued_vbuckets.insert(vb) {
                return;
            }
            queue.streams.push_back((vb, Arc::downgrade(stream)));
            metrics::processor_queue_len(queue.streams.len() as u64);
        }
        self.wakeup();
    }

    pub fn wakeup(&self) {
        if !self.notified.swap(true, Ordering::AcqRel) {
            let _ = self.wakeup_tx.send(());
        }
    }

    /// One fair pass: drains up to the yield limit, then reports whether
    /// streams remain queued.
    pub fn run_once(&self) -> bool {
        self.notified.store(false, Ordering::Release);
        for _ in 0..self.yield_limit {
            let Some(stream) = self.pop() else {
                return false;
            };
            stream.next_checkpoint_item_task();
        }
        !self.is_empty()
    }

    /// Drops all queued work. Used at connection teardown.
    pub fn clear(&self) {
        let mut queue = self.queue.lock().expect("processor queue poisoned");
        queue.streams.clear();
        queue.queued_vbuckets.clear();
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().expect("processor queue poisoned").streams.len()
    }

    fn is_empty(&self) -> bool {
        self.queue
            .lock()
            .expect("processor queue poisoned")
            .streams
            .is_empty()
    }

    fn pop(&self) -> Option<Arc<ActiveStream>> {
        loop {
            let weak = {
                let mut queue = self.queue.lock().expect("processor queue poisoned");
                let (vb, weak) = queue.streams.pop_front()?;
                queue.queued_vbuckets.remove(&vb);
                weak
            };
            // A dead handle means the stream was torn down after being
            // scheduled; skip it.
            if let Some(stream) = weak.upgrade() {
                return Some(stream);
            }
        }
    }
}

/// Worker-thread handle; stops and joins on `stop`.
pub struct ProcessorTask {
    processor: Arc<CheckpointProcessor>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ProcessorTask {
    pub fn processor(&self) -> &Arc<CheckpointProcessor> {
        &self.processor
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.processor.wakeup();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ProcessorTask {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::DcpConfig;
    use crate::dcp::testutil::{open_request, stream_request, MockEngine, NoopBackfill};
    use crate::engine::{BackfillScheduler, CheckpointAccess};
    use crate::item::QueuedItem;
    use crate::types::VbUuid;

    fn stream_on(
        engine: &Arc<MockEngine>,
        processor: &Arc<CheckpointProcessor>,
        vb: Vbid,
    ) -> Arc<ActiveStream> {
        engine.create_vbucket(vb, VbUuid(0xabcd));
        ActiveStream::new(
            Weak::new(),
            Arc::clone(engine) as Arc<dyn CheckpointAccess>,
            Arc::new(NoopBackfill) as Arc<dyn BackfillScheduler>,
            Arc::clone(processor),
            &DcpConfig::default(),
            open_request(vb),
        )
    }

    #[test]
    fn schedule_dedups_per_vbucket() {
        let engine = MockEngine::new();
        let (processor, _wakeups) = CheckpointProcessor::new(10);
        let stream = stream_on(&engine, &processor, Vbid(1));

        processor.schedule(&stream);
        processor.schedule(&stream);
        assert_eq!(processor.queue_len(), 1);

        // A different vbucket gets its own slot.
        let other = stream_on(&engine, &processor, Vbid(2));
        processor.schedule(&other);
        assert_eq!(processor.queue_len(), 2);
    }

    #[test]
    fn run_once_respects_yield_limit() {
        let engine = MockEngine::new();
        let (processor, _wakeups) = CheckpointProcessor::new(2);
        let streams: Vec<_> = (1..=3u16)
            .map(|vb| stream_on(&engine, &processor, Vbid(vb)))
            .collect();
        for stream in &streams {
            processor.schedule(stream);
        }

        assert!(processor.run_once(), "one stream should remain queued");
        assert_eq!(processor.queue_len(), 1);
        assert!(!processor.run_once());
        assert_eq!(processor.queue_len(), 0);
    }

    #[test]
    fn dropped_streams_are_skipped() {
        let engine = MockEngine::new();
        let (processor, _wakeups) = CheckpointProcessor::new(10);
        let stream = stream_on(&engine, &processor, Vbid(1));
        processor.schedule(&stream);
        drop(stream);

        assert!(!processor.run_once());
        assert_eq!(processor.queue_len(), 0);
    }

    #[test]
    fn rescheduling_after_pop_is_allowed() {
        let engine = MockEngine::new();
        let (processor, _wakeups) = CheckpointProcessor::new(10);
        let stream = stream_on(&engine, &processor, Vbid(1));
        stream.set_active();

        engine.queue_memory_item(Vbid(1), crate::dcp::testutil::mutation(Vbid(1), 1));
        processor.schedule(&stream);
        assert!(!processor.run_once());
        assert!(stream.next().is_some(), "drain produced responses");

        // The vbucket slot is free again once popped.
        processor.schedule(&stream);
        assert_eq!(processor.queue_len(), 1);
    }

    #[test]
    fn worker_thread_drains_scheduled_streams() {
        let engine = MockEngine::new();
        let mut task = CheckpointProcessor::spawn(10);
        let stream = stream_on(&engine, task.processor(), Vbid(1));
        stream.set_active();

        engine.queue_memory_item(Vbid(1), crate::dcp::testutil::mutation(Vbid(1), 1));
        task.processor().schedule(&stream);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !stream.items_ready() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(stream.items_ready(), "worker never drained the stream");
        task.stop();
    }

    #[test]
    fn clear_empties_the_queue() {
        let engine = MockEngine::new();
        let (processor, _wakeups) = CheckpointProcessor::new(10);
        let stream = stream_on(&engine, &processor, Vbid(1));
        processor.schedule(&stream);
        processor.clear();
        assert_eq!(processor.queue_len(), 0);
    }

    #[test]
    fn processed_batches_stay_within_request_range() {
        let engine = MockEngine::new();
        let (processor, _wakeups) = CheckpointProcessor::new(10);
        engine.create_vbucket(Vbid(5), VbUuid(0xabcd));
        let stream = ActiveStream::new(
            Weak::new(),
            Arc::clone(&engine) as Arc<dyn CheckpointAccess>,
            Arc::new(NoopBackfill) as Arc<dyn BackfillScheduler>,
            Arc::clone(&processor),
            &DcpConfig::default(),
            stream_request(Vbid(5), 0, 2),
        );
        stream.set_active();

        stream.process_items(vec![
            QueuedItem::Item(crate::dcp::testutil::mutation(Vbid(5), 1)),
            QueuedItem::Item(crate::dcp::testutil::mutation(Vbid(5), 2)),
            QueuedItem::Item(crate::dcp::testutil::mutation(Vbid(5), 3)),
        ]);
        let mut seqnos = Vec::new();
        while let Some(resp) = stream.next() {
            if let Some(seqno) = resp.by_seqno() {
                seqnos.push(seqno);
            }
        }
        assert_eq!(seqnos, vec![1, 2]);
        assert_eq!(stream.state(), crate::dcp::stream::StreamState::Dead);
    }
}
