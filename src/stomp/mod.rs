//! STOMP workload implementation.
//!
//! This module provides the per-connection STOMP protocol core, along with
//! supporting abstractions for:
//! - Frame model and wire codec
//! - Heart-beat negotiation and liveness monitoring
//! - Acknowledgement tracking (auto, client, client-individual)
//! - Client transactions (BEGIN / COMMIT / ABORT)
//! - Consumer sessions and message selectors
//! - Producer route caching with backpressure

pub mod acks;
pub mod codec;
pub mod connection;
pub mod consumer;
pub mod frame;
pub mod heartbeat;
pub mod routes;
pub mod selector;
pub mod transactions;

pub use self::acks::{AckError, AckMode, AckTracker};
pub use self::codec::{identifiable, CodecError, CodecHandle, StompCodec};
pub use self::connection::{
    ConnectionDiagnostics, ProtocolVersion, StompConnection, SUPPORTED_VERSIONS,
};
pub use self::consumer::{ConsumerSession, FallbackAckIndex};
pub use self::frame::{command, header, Frame, StompItem};
pub use self::heartbeat::{negotiate, HeartBeatMonitor, HeartBeatTimes};
pub use self::routes::ProducerRoutes;
pub use self::selector::{Selector, SelectorError};
pub use self::transactions::{TransactionError, TransactionRegistry, TxAction};
