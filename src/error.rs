//! Status codes crossing the engine boundary and stream-end taxonomy.

use std::fmt;

use thiserror::Error;

/// Status returned across the network-facing surface. Mirrors the engine
/// error codes the transport understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineStatus {
    Success,
    KeyEexists,
    KeyEnoent,
    Einval,
    Tmpfail,
    Disconnect,
    NotMyVbucket,
    Erollback,
    NotSupported,
}

impl EngineStatus {
    pub fn is_success(self) -> bool {
        self == EngineStatus::Success
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EngineStatus::Success => "success",
            EngineStatus::KeyEexists => "key_eexists",
            EngineStatus::KeyEnoent => "key_enoent",
            EngineStatus::Einval => "einval",
            EngineStatus::Tmpfail => "tmpfail",
            EngineStatus::Disconnect => "disconnect",
            EngineStatus::NotMyVbucket => "not_my_vbucket",
            EngineStatus::Erollback => "erollback",
            EngineStatus::NotSupported => "not_supported",
        }
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a stream ended. Carried in StreamEnd responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum StreamEndReason {
    /// All requested items were streamed, or a takeover was acked.
    Ok = 0,
    /// The peer requested the close.
    Closed = 1,
    /// Vbucket state changed, uuid mismatch, or a protocol violation.
    State = 2,
    /// The transport went away.
    Disconnected = 3,
    /// The takeover or the consumer could not keep up.
    Slow = 4,
}

impl StreamEndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamEndReason::Ok => "The stream ended due to all items being streamed",
            StreamEndReason::Closed => "The stream closed early due to a close stream message",
            StreamEndReason::State => "The stream closed early because the vbucket state changed",
            StreamEndReason::Disconnected => {
                "The stream closed early because the conn was disconnected"
            }
            StreamEndReason::Slow => "The stream was closed early because it was too slow",
        }
    }

    pub fn wire_value(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for StreamEndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejection of a stream request before any stream exists.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum StreamRequestError {
    #[error("seqno range invalid: start {start} snap [{snap_start}, {snap_end}]")]
    InvalidRange {
        start: u64,
        snap_start: u64,
        snap_end: u64,
    },
    #[error("vbucket does not exist on this node")]
    NoVbucket,
    #[error("a stream already exists for the vbucket")]
    StreamExists,
}

impl StreamRequestError {
    pub fn status(self) -> EngineStatus {
        match self {
            StreamRequestError::InvalidRange { .. } => EngineStatus::Einval,
            StreamRequestError::NoVbucket => EngineStatus::NotMyVbucket,
            StreamRequestError::StreamExists => EngineStatus::KeyEexists,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_reason_wire_values_are_stable() {
        assert_eq!(StreamEndReason::Ok.wire_value(), 0);
        assert_eq!(StreamEndReason::Closed.wire_value(), 1);
        assert_eq!(StreamEndReason::State.wire_value(), 2);
        assert_eq!(StreamEndReason::Disconnected.wire_value(), 3);
        assert_eq!(StreamEndReason::Slow.wire_value(), 4);
    }

    #[test]
    fn request_errors_map_to_statuses() {
        assert_eq!(
            StreamRequestError::NoVbucket.status(),
            EngineStatus::NotMyVbucket
        );
        assert_eq!(
            StreamRequestError::StreamExists.status(),
            EngineStatus::KeyEexists
        );
    }
}
