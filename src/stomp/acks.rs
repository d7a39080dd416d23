//! Acknowledgement tracking for subscriptions.
//!
//! Each subscription owns one tracker in one of three modes:
//! - `auto` - deliveries are acknowledged the moment they are tracked and
//!   inbound ACK frames are a protocol error;
//! - `client` - cumulative: acknowledging message M acknowledges every
//!   tracked delivery up to and including M, in tracking order (the legacy
//!   `session` header value selects this mode too);
//! - `client-individual` - only the named message is acknowledged.
//!
//! Callbacks receive the optional store unit of work the ACK executes under,
//! so transactional ACKs become durable with the rest of their transaction.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use thiserror::Error;

use crate::broker::{AckFn, StoreUow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    Auto,
    Client,
    ClientIndividual,
}

impl AckMode {
    /// Parse the SUBSCRIBE `ack` header. Absent defaults to `auto`.
    pub fn parse(value: Option<&str>) -> Result<Self, AckError> {
        match value {
            None | Some("auto") => Ok(AckMode::Auto),
            Some("client") | Some("session") => Ok(AckMode::Client),
            Some("client-individual") => Ok(AckMode::ClientIndividual),
            Some(other) => Err(AckError::UnsupportedMode(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AckMode::Auto => "auto",
            AckMode::Client => "client",
            AckMode::ClientIndividual => "client-individual",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AckError {
    #[error("unsupported ack mode: {0}")]
    UnsupportedMode(String),
    #[error("the subscription ack mode does not expect ACK frames")]
    UnexpectedAck,
    #[error("ACK failed, invalid message id: {0}")]
    InvalidMessageId(String),
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

pub enum AckTracker {
    Auto,
    Client {
        entries: VecDeque<(String, Option<AckFn>)>,
    },
    ClientIndividual {
        entries: HashMap<String, Option<AckFn>>,
    },
}

impl AckTracker {
    pub fn new(mode: AckMode) -> Self {
        match mode {
            AckMode::Auto => AckTracker::Auto,
            AckMode::Client => AckTracker::Client {
                entries: VecDeque::new(),
            },
            AckMode::ClientIndividual => AckTracker::ClientIndividual {
                entries: HashMap::new(),
            },
        }
    }

    pub fn mode(&self) -> AckMode {
        match self {
            AckTracker::Auto => AckMode::Auto,
            AckTracker::Client { .. } => AckMode::Client,
            AckTracker::ClientIndividual { .. } => AckMode::ClientIndividual,
        }
    }

    /// Record a delivery pending acknowledgement. In `auto` mode the
    /// callback fires immediately under the delivery's own unit of work.
    pub fn track(&mut self, message_id: &str, ack: Option<AckFn>, uow: Option<&dyn StoreUow>) {
        match self {
            AckTracker::Auto => {
                if let Some(ack) = ack {
                    ack(uow);
                }
            }
            AckTracker::Client { entries } => {
                entries.push_back((message_id.to_string(), ack));
            }
            AckTracker::ClientIndividual { entries } => {
                entries.insert(message_id.to_string(), ack);
            }
        }
    }

    /// Apply an inbound ACK frame for `message_id` under `uow`.
    pub fn perform_ack(
        &mut self,
        message_id: &str,
        uow: Option<&dyn StoreUow>,
    ) -> Result<(), AckError> {
        match self {
            AckTracker::Auto => Err(AckError::UnexpectedAck),
            AckTracker::Client { entries } => {
                let Some(end) = entries.iter().position(|(id, _)| id == message_id) else {
                    return Err(AckError::InvalidMessageId(message_id.to_string()));
                };
                for (_, ack) in entries.drain(..=end) {
                    if let Some(ack) = ack {
                        ack(uow);
                    }
                }
                Ok(())
            }
            AckTracker::ClientIndividual { entries } => {
                let Some(ack) = entries.remove(message_id) else {
                    return Err(AckError::InvalidMessageId(message_id.to_string()));
                };
                if let Some(ack) = ack {
                    ack(uow);
                }
                Ok(())
            }
        }
    }

    /// Deliveries tracked but not yet acknowledged.
    pub fn pending(&self) -> usize {
        match self {
            AckTracker::Auto => 0,
            AckTracker::Client { entries } => entries.len(),
            AckTracker::ClientIndividual { entries } => entries.len(),
        }
    }
}

impl fmt::Debug for AckTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckTracker")
            .field("mode", &self.mode().as_str())
            .field("pending", &self.pending())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
