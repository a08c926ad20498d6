//! Replication subsystem
//!
//! A master accepts client writes, stamps each one with a fresh id and the
//! store's current chain tail as predecessor, applies it locally and then
//! broadcasts it to every slave that opened a `listen` subscription.
//!
//! Slaves validate the predecessor of every replicated transaction against
//! their own chain. A mismatch means a broadcast was missed, and the slave
//! runs catch-up: it sends its per-store cursor and the master replays the
//! missing history, one acknowledged message at a time.
//!
//! ```text
//! ┌─────────────────┐  txn store id pred  ┌─────────────────┐
//! │     Master      │ ──────────────────► │     Slave 1     │
//! │                 │   (live, one-way)   └─────────────────┘
//! │  Writes go here │                     ┌─────────────────┐
//! │                 │ ◄── sync cursor ─── │     Slave 2     │
//! │                 │ ── txn/ACK ... ───► │   (catching up) │
//! └─────────────────┘ ── endsync OK ────► └─────────────────┘
//! ```

pub mod chain;
pub mod client;
pub mod config;
pub mod node;
pub mod protocol;
pub mod server;
pub mod slaves;
pub mod state;
pub mod sync;
pub mod transaction;
pub mod transport;

pub use chain::{AppendOutcome, ChainRegistry, StoreChain};
pub use client::AdminClient;
pub use config::ReplicationConfig;
pub use node::{ApplyMode, ApplyOutcome, Node, NodeStats};
pub use protocol::{MasterPolicy, MessageKind, ReplicationMessage, SyncCursor, SyncStatus};
pub use server::ConnectionManager;
pub use slaves::{SlaveConnection, SlaveRegistry};
pub use state::NodeState;
pub use transaction::{Transaction, TransactionBody, TransactionId, TransactionKind};
pub use transport::{
    Connector, MemoryNetwork, MemoryTransport, TcpConnector, TcpTransport, Transport,
};

/// Default replication port
pub const DEFAULT_REPLICATION_PORT: u16 = 15480;
