//! Error types for Trellis Core

use crate::replication::state::NodeState;
use crate::replication::transaction::TransactionId;
use thiserror::Error;

/// Result type alias using Trellis Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for the replication subsystem
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from sockets
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed header, wrong section count, bad checksum
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A client write reached a node that does not accept writes
    #[error("Not master: node is {state}")]
    NotMaster {
        /// State the node was in when the write arrived
        state: NodeState,
    },

    /// Predecessor mismatch for a replicated transaction
    #[error("Causal gap in store '{store}': expected predecessor {expected}, got {actual}")]
    CausalGap {
        /// Store the transaction targets
        store: String,
        /// Local chain `last`
        expected: TransactionId,
        /// Predecessor carried by the transaction
        actual: TransactionId,
    },

    /// Store does not exist on this node
    #[error("Store not found: {0}")]
    StoreNotFound(String),

    /// Store name cannot travel in a message header
    #[error("Invalid store name: {0:?}")]
    InvalidStoreName(String),

    /// Errors reported by the storage engine
    #[error("Storage error: {0}")]
    Storage(String),

    /// Catch-up synchronization errors
    #[error("Sync error: {0}")]
    Sync(String),

    /// Node hit a fatal local fault and refuses further work
    #[error("Node is broken: {0}")]
    Broken(String),

    /// Requested state change is not allowed from the current state
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Current state
        from: NodeState,
        /// Requested state
        to: NodeState,
    },

    /// Peer did not answer in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Peer closed the connection
    #[error("Connection closed")]
    ConnectionClosed,

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a sync error
    pub fn sync(msg: impl Into<String>) -> Self {
        Self::Sync(msg.into())
    }

    /// Create a broken-node error
    pub fn broken(msg: impl Into<String>) -> Self {
        Self::Broken(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True for errors after which the connection cannot carry more messages
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::ConnectionClosed | Self::Timeout(_) | Self::Protocol(_)
        )
    }
}
