//! Shared stream identity and the state word common to all variants.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use crate::error::StreamRequestError;
use crate::types::{StreamFlags, VbUuid, Vbid};

/// Immutable stream parameters, fixed at negotiation time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamRequest {
    pub name: String,
    pub flags: StreamFlags,
    pub opaque: u32,
    pub vbucket: Vbid,
    pub start_seqno: u64,
    pub end_seqno: u64,
    pub vb_uuid: VbUuid,
    pub snap_start_seqno: u64,
    pub snap_end_seqno: u64,
}

impl StreamRequest {
    /// Range sanity: start_seqno <= snap_start_seqno <= snap_end_seqno.
    pub fn validate(&self) -> Result<(), StreamRequestError> {
        if self.start_seqno <= self.snap_start_seqno
            && self.snap_start_seqno <= self.snap_end_seqno
        {
            Ok(())
        } else {
            Err(StreamRequestError::InvalidRange {
                start: self.start_seqno,
                snap_start: self.snap_start_seqno,
                snap_end: self.snap_end_seqno,
            })
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    Pending = 0,
    Backfilling = 1,
    InMemory = 2,
    TakeoverSend = 3,
    TakeoverWait = 4,
    Reading = 5,
    Dead = 6,
}

impl StreamState {
    fn from_u8(raw: u8) -> StreamState {
        match raw {
            0 => StreamState::Pending,
            1 => StreamState::Backfilling,
            2 => StreamState::InMemory,
            3 => StreamState::TakeoverSend,
            4 => StreamState::TakeoverWait,
            5 => StreamState::Reading,
            _ => StreamState::Dead,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StreamState::Pending => "pending",
            StreamState::Backfilling => "backfilling",
            StreamState::InMemory => "in-memory",
            StreamState::TakeoverSend => "takeover-send",
            StreamState::TakeoverWait => "takeover-wait",
            StreamState::Reading => "reading",
            StreamState::Dead => "dead",
        }
    }
}

/// State shared by every stream variant: identity, the atomic state word,
/// the items-ready flag used to suppress redundant wakeups, and the
/// ready-queue byte footprint handle.
#[derive(Debug)]
pub struct StreamCore {
    pub req: StreamRequest,
    state: AtomicU8,
    items_ready: AtomicBool,
    ready_bytes: Arc<AtomicU64>,
}

impl StreamCore {
    pub fn new(req: StreamRequest, ready_bytes: Arc<AtomicU64>) -> Self {
        Self {
            req,
            state: AtomicU8::new(StreamState::Pending as u8),
            items_ready: AtomicBool::new(false),
            ready_bytes,
        }
    }

    pub fn vbucket(&self) -> Vbid {
        self.req.vbucket
    }

    pub fn opaque(&self) -> u32 {
        self.req.opaque
    }

    pub fn name(&self) -> &str {
        &self.req.name
    }

    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() != StreamState::Dead
    }

    /// Caller must hold the owning stream's mutex.
    pub fn transition(&self, to: StreamState) {
        let from = self.state.swap(to as u8, Ordering::AcqRel);
        tracing::debug!(
            vbucket = %self.req.vbucket,
            stream = %self.req.name,
            from = StreamState::from_u8(from).as_str(),
            to = to.as_str(),
            "stream transition"
        );
    }

    pub fn ready_q_bytes(&self) -> u64 {
        self.ready_bytes.load(Ordering::Relaxed)
    }

    pub fn items_ready(&self) -> bool {
        self.items_ready.load(Ordering::Acquire)
    }

    /// Marks the queue non-empty; returns true when this call flipped the
    /// flag (the caller should wake the owning connection).
    pub fn raise_items_ready(&self) -> bool {
        !self.items_ready.swap(true, Ordering::AcqRel)
    }

    pub fn clear_items_ready(&self) {
        self.items_ready.store(false, Ordering::Release);
    }
}
