//! Trellis Core - replication core of a clustered graph-store node
//!
//! This crate keeps a master copy and any number of slave copies of a set of
//! named stores consistent:
//! - Per-store causal chains of transaction ids (gap and duplicate detection)
//! - Master/slave node state machine with write-quorum gating
//! - Text wire protocol over framed TCP or in-memory transports
//! - Catch-up synchronization for slaves that join late or miss broadcasts
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │        ConnectionManager (listener)          │
//! │   ping / master / slaveof / sync / listen    │
//! └──────────────┬───────────────────────────────┘
//!                │
//! ┌──────────────┴───────────────────────────────┐
//! │               Node (orchestrator)            │
//! │   state machine, chains, slave registry      │
//! └──────────────┬───────────────────────────────┘
//!                │
//! ┌──────────────┴───────────────────────────────┐
//! │            StorageEngine (external)          │
//! │   durable apply, history, job completions    │
//! └──────────────────────────────────────────────┘
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod engine;
pub mod error;
pub mod replication;

pub use error::{Error, Result};
