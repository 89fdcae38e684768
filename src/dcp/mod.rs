//! DCP streaming engine: stream state machines, checkpoint drain
//! scheduling, and the connection registry.

pub mod active;
pub mod connmap;
pub mod consumer;
pub mod notifier;
pub mod passive;
pub mod processor;
pub mod producer;
pub mod ready_queue;
pub mod response;
pub mod stream;

#[cfg(test)]
pub(crate) mod testutil;

pub use active::ActiveStream;
pub use connmap::DcpConnMap;
pub use consumer::DcpConsumer;
pub use notifier::NotifierStream;
pub use passive::PassiveStream;
pub use processor::CheckpointProcessor;
pub use producer::DcpProducer;
pub use ready_queue::ReadyQueue;
pub use response::{DcpResponse, SnapshotMarker, marker_flags};
pub use stream::{StreamRequest, StreamState};
