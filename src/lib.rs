#![deny(clippy::all)]
// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
// Function complexity: some dispatch functions are inherently long
#![allow(clippy::too_many_lines)]
#![allow(clippy::too_many_arguments)]
// Documentation style: protocol terms don't need backticks
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// API ergonomics: prefer simplicity over must_use annotations
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
// Format strings: allow non-inlined for readability
#![allow(clippy::uninlined_format_args)]

//! Photon - STOMP workload core for an embedded message broker.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::config` - Per-connection configuration knobs
//!
//! ## Broker interfaces
//! - `broker` - Router, queue, virtual-host, and store collaborator traits,
//!   plus the `Delivery` / `BindingSpec` / `Destination` data model
//!
//! ## STOMP
//! - `stomp::frame` - Frame model and wire items
//! - `stomp::codec` - Wire framing, byte counters, buffer-pool attachment
//! - `stomp::heartbeat` - Heart-beat negotiation and liveness monitoring
//! - `stomp::acks` - Acknowledgement tracking
//! - `stomp::transactions` - Client transactions
//! - `stomp::selector` - Message selectors
//! - `stomp::consumer` - Per-subscription consumer sessions
//! - `stomp::routes` - Producer route LRU
//! - `stomp::connection` - The per-connection state machine

// Core infrastructure
pub mod core;

// Broker collaborator surface
pub mod broker;

// STOMP workload
pub mod stomp;

// Re-exports for convenience
pub use self::core::config::ConnectionConfig;
pub use broker::{
    BindingSpec, Delivery, Destination, DestinationKind, HostRegistry, Route, Router,
    SecurityContext, Store, StoreUow, VirtualHost,
};
pub use stomp::connection::{ConnectionDiagnostics, StompConnection};
pub use stomp::frame::{Frame, StompItem};
