//! Identity newtypes and protocol-level flag words.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `end_seqno` sentinel for a tail stream that never completes on its own.
pub const OPEN_ENDED: u64 = u64::MAX;

/// A vbucket id: the hash-partition a stream is scoped to.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Vbid(pub u16);

impl fmt::Display for Vbid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vb:{}", self.0)
    }
}

/// Identifier of a vbucket's failover epoch. Changes after a failover and
/// invalidates previously negotiated seqno ranges.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct VbUuid(pub u64);

impl fmt::Display for VbUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// Opaque identity of a peer connection, assigned by the network layer.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConnCookie(Uuid);

impl ConnCookie {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for ConnCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Stream-request flag word.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFlags(pub u32);

impl StreamFlags {
    pub const TAKEOVER: u32 = 0x01;
    pub const DISK_ONLY: u32 = 0x02;
    pub const LATEST: u32 = 0x04;
    pub const NO_VALUE: u32 = 0x08;

    pub fn none() -> Self {
        Self(0)
    }

    pub fn takeover(self) -> bool {
        self.0 & Self::TAKEOVER != 0
    }

    pub fn disk_only(self) -> bool {
        self.0 & Self::DISK_ONLY != 0
    }

    pub fn latest(self) -> bool {
        self.0 & Self::LATEST != 0
    }

    pub fn key_only(self) -> bool {
        self.0 & Self::NO_VALUE != 0
    }
}

/// State of a vbucket as seen by the streaming layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VbucketState {
    Active,
    Replica,
    Pending,
    Dead,
}

impl VbucketState {
    pub fn as_str(self) -> &'static str {
        match self {
            VbucketState::Active => "active",
            VbucketState::Replica => "replica",
            VbucketState::Pending => "pending",
            VbucketState::Dead => "dead",
        }
    }
}

impl fmt::Display for VbucketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_flags_decompose() {
        let flags = StreamFlags(StreamFlags::TAKEOVER | StreamFlags::NO_VALUE);
        assert!(flags.takeover());
        assert!(flags.key_only());
        assert!(!flags.disk_only());
        assert!(!StreamFlags::none().takeover());
    }

    #[test]
    fn vbid_displays_with_prefix() {
        assert_eq!(Vbid(7).to_string(), "vb:7");
    }
}
