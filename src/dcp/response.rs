//! Response objects handed across the `next()` / `message_received()`
//! boundary, with their advertised wire footprints.

use crate::dcp::stream::StreamRequest;
use crate::error::{EngineStatus, StreamEndReason};
use crate::item::Item;
use crate::types::{Vbid, VbucketState};

/// Snapshot marker flag bits, wire-compatible.
pub mod marker_flags {
    pub const MEMORY: u32 = 0x01;
    pub const DISK: u32 = 0x02;
    pub const CHK: u32 = 0x04;
    pub const ACK: u32 = 0x08;
}

/// Framing record bracketing a contiguous seqno range of mutations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SnapshotMarker {
    pub opaque: u32,
    pub vbucket: Vbid,
    pub start_seqno: u64,
    pub end_seqno: u64,
    pub flags: u32,
}

impl SnapshotMarker {
    pub fn from_disk(self) -> bool {
        self.flags & marker_flags::DISK != 0
    }

    pub fn requests_ack(self) -> bool {
        self.flags & marker_flags::ACK != 0
    }
}

// Per-message header footprints (request header plus extras).
const STREAM_REQ_BASE: usize = 72;
const ADD_STREAM_RESP_BASE: usize = 28;
const SNAPSHOT_MARKER_BASE: usize = 44;
const MUTATION_BASE: usize = 55;
const DELETION_BASE: usize = 42;
const SET_VB_STATE_BASE: usize = 25;
const STREAM_END_BASE: usize = 28;
const ACK_BASE: usize = 24;
const SEQNO_NOTIFY_BASE: usize = 32;

#[derive(Clone, Debug, PartialEq)]
pub enum DcpResponse {
    /// Consumer-originated stream negotiation request.
    StreamReq(StreamRequest),
    /// Producer's answer relayed back through the consumer's queue.
    AddStreamResponse {
        opaque: u32,
        add_opaque: u32,
        status: EngineStatus,
    },
    SnapshotMarker(SnapshotMarker),
    Mutation { opaque: u32, item: Item },
    Deletion { opaque: u32, item: Item },
    SetVBucketState {
        opaque: u32,
        vbucket: Vbid,
        state: VbucketState,
    },
    StreamEnd {
        opaque: u32,
        vbucket: Vbid,
        reason: StreamEndReason,
    },
    SnapshotMarkerAck {
        opaque: u32,
        vbucket: Vbid,
        status: EngineStatus,
    },
    SetVBucketStateAck { opaque: u32, vbucket: Vbid },
    /// NotifierStream payload: data exists at or past `seqno`.
    SeqnoNotification {
        opaque: u32,
        vbucket: Vbid,
        seqno: u64,
    },
}

impl DcpResponse {
    /// Advertised footprint used for ready-queue and consumer-buffer
    /// accounting.
    pub fn message_size(&self) -> usize {
        match self {
            DcpResponse::StreamReq(req) => STREAM_REQ_BASE + req.name.len(),
            DcpResponse::AddStreamResponse { .. } => ADD_STREAM_RESP_BASE,
            DcpResponse::SnapshotMarker(_) => SNAPSHOT_MARKER_BASE,
            DcpResponse::Mutation { item, .. } => {
                MUTATION_BASE + item.key.len() + item.value_len()
            }
            DcpResponse::Deletion { item, .. } => DELETION_BASE + item.key.len(),
            DcpResponse::SetVBucketState { .. } => SET_VB_STATE_BASE,
            DcpResponse::StreamEnd { .. } => STREAM_END_BASE,
            DcpResponse::SnapshotMarkerAck { .. } => ACK_BASE,
            DcpResponse::SetVBucketStateAck { .. } => ACK_BASE,
            DcpResponse::SeqnoNotification { .. } => SEQNO_NOTIFY_BASE,
        }
    }

    pub fn vbucket(&self) -> Option<Vbid> {
        match self {
            DcpResponse::StreamReq(req) => Some(req.vbucket),
            DcpResponse::AddStreamResponse { .. } => None,
            DcpResponse::SnapshotMarker(marker) => Some(marker.vbucket),
            DcpResponse::Mutation { item, .. } | DcpResponse::Deletion { item, .. } => {
                Some(item.vbucket)
            }
            DcpResponse::SetVBucketState { vbucket, .. }
            | DcpResponse::StreamEnd { vbucket, .. }
            | DcpResponse::SnapshotMarkerAck { vbucket, .. }
            | DcpResponse::SetVBucketStateAck { vbucket, .. }
            | DcpResponse::SeqnoNotification { vbucket, .. } => Some(*vbucket),
        }
    }

    pub fn by_seqno(&self) -> Option<u64> {
        match self {
            DcpResponse::Mutation { item, .. } | DcpResponse::Deletion { item, .. } => {
                Some(item.by_seqno)
            }
            _ => None,
        }
    }

    pub fn is_mutation_or_deletion(&self) -> bool {
        matches!(
            self,
            DcpResponse::Mutation { .. } | DcpResponse::Deletion { .. }
        )
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            DcpResponse::StreamReq(_) => "stream_req",
            DcpResponse::AddStreamResponse { .. } => "add_stream_response",
            DcpResponse::SnapshotMarker(_) => "snapshot_marker",
            DcpResponse::Mutation { .. } => "mutation",
            DcpResponse::Deletion { .. } => "deletion",
            DcpResponse::SetVBucketState { .. } => "set_vbucket_state",
            DcpResponse::StreamEnd { .. } => "stream_end",
            DcpResponse::SnapshotMarkerAck { .. } => "snapshot_marker_ack",
            DcpResponse::SetVBucketStateAck { .. } => "set_vbucket_state_ack",
            DcpResponse::SeqnoNotification { .. } => "seqno_notification",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn mutation_size_includes_key_and_value() {
        let item = Item::new(
            Bytes::from_static(b"key"),
            Some(Bytes::from_static(b"value")),
            Vbid(0),
            1,
        );
        let resp = DcpResponse::Mutation { opaque: 0, item };
        assert_eq!(resp.message_size(), MUTATION_BASE + 3 + 5);
    }

    #[test]
    fn marker_flag_helpers() {
        let marker = SnapshotMarker {
            opaque: 0,
            vbucket: Vbid(0),
            start_seqno: 0,
            end_seqno: 10,
            flags: marker_flags::DISK | marker_flags::ACK,
        };
        assert!(marker.from_disk());
        assert!(marker.requests_ack());
    }
}
