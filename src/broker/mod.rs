//! Broker-side collaborator interfaces.
//!
//! The connection core mediates between a STOMP client and a broker whose
//! router, queues, durable store, and virtual-host registry live elsewhere.
//! This module pins down the surface the core consumes:
//! - `Router` / `Route` / `BrokerQueue` - message routing and fan-out
//! - `VirtualHost` / `HostRegistry` - session binding and authentication
//! - `Store` / `StoreUow` - atomic units of work against the durable store
//! - `Delivery` / `BindingSpec` / `Destination` - the data passed across
//!
//! Asynchronous collaborator calls return boxed futures; their completions
//! are awaited from the owning connection task, which is what keeps all
//! connection state single-threaded.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stomp::consumer::ConsumerSession;
use crate::stomp::frame::Frame;

/// Boxed future returned by collaborator calls.
pub type BrokerFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Origin protocol tag carried by deliveries produced by this core.
pub const STOMP_PROTOCOL: &str = "stomp";

// ---------------------------------------------------------------------------
// Destinations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    /// Point-to-point domain: each message is consumed once.
    Queue,
    /// Pub/sub domain: each message fans out to all bound subscriptions.
    Topic,
}

/// Logical address of a queue or topic, parsed from `/queue/...` or
/// `/topic/...` header values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub kind: DestinationKind,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid destination: {0}")]
pub struct DestinationError(pub String);

impl Destination {
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            kind: DestinationKind::Queue,
            name: name.into(),
        }
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            kind: DestinationKind::Topic,
            name: name.into(),
        }
    }

    pub fn parse(value: &str) -> Result<Self, DestinationError> {
        if let Some(name) = value.strip_prefix("/queue/") {
            if !name.is_empty() {
                return Ok(Self::queue(name));
            }
        }
        if let Some(name) = value.strip_prefix("/topic/") {
            if !name.is_empty() {
                return Ok(Self::topic(name));
            }
        }
        Err(DestinationError(value.to_string()))
    }

    pub fn is_topic(&self) -> bool {
        self.kind == DestinationKind::Topic
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DestinationKind::Queue => write!(f, "/queue/{}", self.name),
            DestinationKind::Topic => write!(f, "/topic/{}", self.name),
        }
    }
}

// ---------------------------------------------------------------------------
// Deliveries
// ---------------------------------------------------------------------------

/// Acknowledgement callback attached to a delivery. Invoked once the
/// consuming side establishes durability or consumption, optionally inside a
/// store unit of work.
pub type AckFn = Box<dyn FnOnce(Option<&dyn StoreUow>) + Send>;

/// A message in flight between the connection core and the router layer.
pub struct Delivery {
    pub message: Frame,
    pub size: usize,
    pub sender_protocol: &'static str,
    pub uow: Option<Arc<dyn StoreUow>>,
    pub ack: Option<AckFn>,
}

impl Delivery {
    pub fn new(message: Frame) -> Self {
        let size = message.size();
        Self {
            message,
            size,
            sender_protocol: STOMP_PROTOCOL,
            uow: None,
            ack: None,
        }
    }

    pub fn with_uow(mut self, uow: Option<Arc<dyn StoreUow>>) -> Self {
        self.uow = uow;
        self
    }

    pub fn with_ack(mut self, ack: AckFn) -> Self {
        self.ack = Some(ack);
        self
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("command", &self.message.command)
            .field("size", &self.size)
            .field("sender_protocol", &self.sender_protocol)
            .field("uow", &self.uow.is_some())
            .field("ack", &self.ack.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Bindings
// ---------------------------------------------------------------------------

/// Persistent description of how a queue is attached to a destination, used
/// to recreate the attachment after a broker restart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BindingSpec {
    PointToPoint {
        destination: Destination,
    },
    DurableSubscription {
        destination: Destination,
        subscription_id: String,
        selector: Option<String>,
    },
}

impl BindingSpec {
    pub fn destination(&self) -> &Destination {
        match self {
            BindingSpec::PointToPoint { destination }
            | BindingSpec::DurableSubscription { destination, .. } => destination,
        }
    }

    pub fn is_durable(&self) -> bool {
        matches!(self, BindingSpec::DurableSubscription { .. })
    }
}

// ---------------------------------------------------------------------------
// Security
// ---------------------------------------------------------------------------

/// Credentials captured from the CONNECT frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityContext {
    pub user: Option<String>,
    pub password: Option<String>,
}

pub trait Authenticator: Send + Sync {
    fn authenticate(&self, ctx: &SecurityContext) -> BrokerFuture<bool>;
}

// ---------------------------------------------------------------------------
// Durable store
// ---------------------------------------------------------------------------

/// An atomic batch against the durable store. Actions attached to one unit
/// of work become durable together.
pub trait StoreUow: Send + Sync {
    fn on_complete(&self, callback: Box<dyn FnOnce() + Send>);
    fn release(&self);
}

pub trait Store: Send + Sync {
    fn create_uow(&self) -> Arc<dyn StoreUow>;
}

/// Pool the frame codec checks large bodies out of, when the host has one.
pub trait BufferPool: Send + Sync {
    fn checkout(&self, len: usize) -> BytesMut;
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// Router-side object that accepts deliveries from one producer and fans
/// them out to interested consumers.
pub trait Route: Send + Sync {
    /// Hand a delivery to the route. Returns `false` when the route refuses
    /// it outright (shut down); accepted deliveries may still fill the route.
    fn offer(&self, delivery: Delivery) -> bool;

    /// Whether anything is listening on the route's destination.
    fn has_targets(&self) -> bool;

    /// Whether the route has no remaining capacity. A full route requires
    /// the producer to stop reading until [`Route::refilled`] resolves.
    fn is_full(&self) -> bool;

    /// Resolves once the route has capacity again.
    fn refilled(&self) -> BrokerFuture<()>;
}

pub trait BrokerQueue: Send + Sync {
    fn bind(&self, consumers: Vec<Arc<ConsumerSession>>);
    fn unbind(&self, consumers: Vec<Arc<ConsumerSession>>);
}

pub trait Router: Send + Sync {
    /// Create (or attach to) the producer route for `destination`.
    fn connect(
        &self,
        destination: &Destination,
        producer_id: &str,
    ) -> BrokerFuture<anyhow::Result<Arc<dyn Route>>>;

    /// Detach a producer route previously returned by [`Router::connect`].
    fn disconnect(&self, route: &Arc<dyn Route>);

    /// Attach a consumer directly to a destination (topic subscriptions).
    fn bind(
        &self,
        destination: &Destination,
        consumer: &Arc<ConsumerSession>,
    ) -> BrokerFuture<anyhow::Result<()>>;

    fn unbind(&self, destination: &Destination, consumer: &Arc<ConsumerSession>);

    fn create_queue(&self, binding: &BindingSpec) -> BrokerFuture<Option<Arc<dyn BrokerQueue>>>;

    fn destroy_queue(&self, binding: &BindingSpec) -> BrokerFuture<bool>;

    fn get_queue(&self, binding: &BindingSpec) -> BrokerFuture<Option<Arc<dyn BrokerQueue>>>;
}

// ---------------------------------------------------------------------------
// Virtual hosts
// ---------------------------------------------------------------------------

pub trait VirtualHost: Send + Sync {
    fn id(&self) -> &str;

    /// Monotonic per-host counter used to mint session ids.
    fn next_session(&self) -> u64;

    fn router(&self) -> Arc<dyn Router>;

    fn authenticator(&self) -> Option<Arc<dyn Authenticator>>;

    fn store(&self) -> Option<Arc<dyn Store>>;

    fn buffer_pool(&self) -> Option<Arc<dyn BufferPool>>;
}

pub trait HostRegistry: Send + Sync {
    /// Resolve a virtual host by the CONNECT `host` header; `None` selects
    /// the registry's default host.
    fn lookup(&self, name: Option<&str>) -> BrokerFuture<Option<Arc<dyn VirtualHost>>>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
