//! Client transactions (BEGIN / COMMIT / ABORT).
//!
//! A transaction is a connection-local, ordered queue of deferred actions.
//! SEND and ACK frames naming a transaction are recorded instead of executed;
//! COMMIT replays the queue in insertion order under a single store unit of
//! work, and ABORT discards it without executing anything. Deferring both
//! sides into one unit of work is what makes a transaction atomic against
//! the store.

use std::collections::HashMap;

use thiserror::Error;

use crate::broker::Destination;
use crate::stomp::frame::Frame;

/// An action deferred under a transaction, replayed by the connection on
/// COMMIT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxAction {
    Send {
        destination: Destination,
        frame: Frame,
    },
    Ack {
        subscription: String,
        message_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    #[error("transaction already active: {0}")]
    AlreadyActive(String),
    #[error("transaction not active: {0}")]
    NotActive(String),
}

/// Per-connection map of transaction id to its pending action queue. Never
/// shared between connections.
#[derive(Debug, Default)]
pub struct TransactionRegistry {
    queues: HashMap<String, Vec<TxAction>>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, id: &str) -> Result<(), TransactionError> {
        if self.queues.contains_key(id) {
            return Err(TransactionError::AlreadyActive(id.to_string()));
        }
        self.queues.insert(id.to_string(), Vec::new());
        Ok(())
    }

    /// Record an action for later replay. Creates the queue when the client
    /// skipped BEGIN, matching the forgiving get-or-create contract.
    pub fn enqueue(&mut self, id: &str, action: TxAction) {
        self.queues.entry(id.to_string()).or_default().push(action);
    }

    /// Remove the transaction, returning its actions for replay in
    /// insertion order.
    pub fn commit(&mut self, id: &str) -> Result<Vec<TxAction>, TransactionError> {
        self.queues
            .remove(id)
            .ok_or_else(|| TransactionError::NotActive(id.to_string()))
    }

    /// Remove the transaction and drop its actions. None of them execute.
    pub fn abort(&mut self, id: &str) -> Result<usize, TransactionError> {
        self.queues
            .remove(id)
            .map(|actions| actions.len())
            .ok_or_else(|| TransactionError::NotActive(id.to_string()))
    }

    pub fn active(&self) -> usize {
        self.queues.len()
    }

    pub fn clear(&mut self) {
        self.queues.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
