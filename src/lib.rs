#![forbid(unsafe_code)]

pub mod config;
pub mod dcp;
pub mod engine;
pub mod error;
pub mod item;
pub mod metrics;
pub mod types;

pub use crate::config::DcpConfig;
pub use crate::dcp::connmap::DcpConnMap;
pub use crate::dcp::consumer::DcpConsumer;
pub use crate::dcp::producer::{DcpProducer, StreamReqOutcome};
pub use crate::dcp::response::DcpResponse;
pub use crate::dcp::stream::{StreamRequest, StreamState};
pub use crate::error::{EngineStatus, StreamEndReason};
pub use crate::item::{Item, QueuedItem};
pub use crate::types::{ConnCookie, StreamFlags, VbUuid, Vbid, VbucketState, OPEN_ENDED};
