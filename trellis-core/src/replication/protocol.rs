//! Replication wire protocol
//!
//! Every message is UTF-8 text. The first line is the header: a keyword
//! followed by space-separated arguments. Everything after the first newline
//! is the body.
//!
//! ```text
//! ping                         -> pong
//! master      {json policy}    -> ACK | NAK
//! slaveof host port            -> ACK | NAK
//! sync        {cursor lines}   -> txn/spu/+store/-store ... endsync OK|FAIL
//! listen                       -> (connection stays open for broadcasts)
//! txn / spu   store id pred    -> ACK | NAK
//! +store name / -store name    -> ACK | NAK
//! endsync OK|FAIL [stores..]   -> ACK
//! ```

use crate::replication::transaction::{Transaction, TransactionId, TransactionKind};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Longest store name accepted in a header
pub const MAX_STORE_NAME_LEN: usize = 1024;

/// Header keywords
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Liveness check
    Ping,
    /// Liveness reply
    Pong,
    /// Designate this node master
    Master,
    /// Make this node a slave of another
    SlaveOf,
    /// Catch-up request from a slave
    Sync,
    /// Live broadcast subscription from a slave
    Listen,
    /// Update transaction
    Txn,
    /// Query-update transaction
    Spu,
    /// Create store
    CreateStore,
    /// Delete store
    DeleteStore,
    /// End of catch-up stream
    EndSync,
    /// Positive acknowledgement
    Ack,
    /// Negative acknowledgement
    Nak,
}

impl MessageKind {
    /// Keyword as it appears on the wire
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Master => "master",
            Self::SlaveOf => "slaveof",
            Self::Sync => "sync",
            Self::Listen => "listen",
            Self::Txn => "txn",
            Self::Spu => "spu",
            Self::CreateStore => "+store",
            Self::DeleteStore => "-store",
            Self::EndSync => "endsync",
            Self::Ack => "ACK",
            Self::Nak => "NAK",
        }
    }
}

impl TryFrom<&str> for MessageKind {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "ping" => Ok(Self::Ping),
            "pong" => Ok(Self::Pong),
            "master" => Ok(Self::Master),
            "slaveof" => Ok(Self::SlaveOf),
            "sync" => Ok(Self::Sync),
            "listen" => Ok(Self::Listen),
            "txn" => Ok(Self::Txn),
            "spu" => Ok(Self::Spu),
            "+store" => Ok(Self::CreateStore),
            "-store" => Ok(Self::DeleteStore),
            "endsync" => Ok(Self::EndSync),
            "ACK" => Ok(Self::Ack),
            "NAK" => Ok(Self::Nak),
            _ => Err(Error::protocol(format!("Unknown message keyword: {}", value))),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// Policy handed to a node when it is designated master
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MasterPolicy {
    /// Live slaves required before writes are accepted
    pub write_quorum: u32,
}

impl MasterPolicy {
    /// Policy with the given quorum
    pub fn new(write_quorum: u32) -> Self {
        Self { write_quorum }
    }
}

/// Slave's view of each store it holds: store id -> last known transaction id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncCursor {
    entries: BTreeMap<String, TransactionId>,
}

impl SyncCursor {
    /// Empty cursor
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the last known id for a store
    pub fn insert(&mut self, store_id: impl Into<String>, last: TransactionId) {
        self.entries.insert(store_id.into(), last);
    }

    /// Last known id for a store, if the slave knows it
    pub fn get(&self, store_id: &str) -> Option<TransactionId> {
        self.entries.get(store_id).copied()
    }

    /// Reported stores in name order
    pub fn stores(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of reported stores
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no store was reported
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn encode(&self) -> String {
        self.entries
            .iter()
            .map(|(store, last)| format!("{} {}\n", store, last))
            .collect()
    }

    fn decode(body: &str) -> Result<Self> {
        let mut cursor = Self::new();
        for line in body.lines().filter(|l| !l.trim().is_empty()) {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next(), parts.next()) {
                (Some(store), Some(last), None) => {
                    validate_store_name(store)?;
                    cursor.insert(store, last.parse()?);
                }
                _ => {
                    return Err(Error::protocol(format!("Malformed sync cursor line: {:?}", line)));
                }
            }
        }
        Ok(cursor)
    }
}

impl FromIterator<(String, TransactionId)> for SyncCursor {
    fn from_iter<I: IntoIterator<Item = (String, TransactionId)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Outcome carried by `endsync`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    /// Every store replayed cleanly
    Ok,
    /// Replay failed for the listed stores
    Failed {
        /// Stores whose replay was aborted
        stores: Vec<String>,
    },
}

impl SyncStatus {
    /// True for `Ok`
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Replication messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationMessage {
    /// Liveness check
    Ping,
    /// Liveness reply
    Pong,
    /// Designate the receiving node master
    Master(MasterPolicy),
    /// Make the receiving node a slave of `host:port`
    SlaveOf {
        /// Master host
        host: String,
        /// Master port
        port: u16,
    },
    /// Catch-up request carrying the slave's cursor
    Sync(SyncCursor),
    /// Register the sender for live broadcasts
    Listen,
    /// Replicated transaction (`txn` or `spu` depending on body)
    Transaction(Transaction),
    /// Create a store
    CreateStore(String),
    /// Drop a store
    DeleteStore(String),
    /// End of a catch-up stream
    EndSync(SyncStatus),
    /// Positive acknowledgement
    Ack,
    /// Negative acknowledgement; `close` asks the peer to tear the connection down
    Nak {
        /// Connection should be closed
        close: bool,
    },
}

impl ReplicationMessage {
    /// Get message kind
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Ping => MessageKind::Ping,
            Self::Pong => MessageKind::Pong,
            Self::Master(_) => MessageKind::Master,
            Self::SlaveOf { .. } => MessageKind::SlaveOf,
            Self::Sync(_) => MessageKind::Sync,
            Self::Listen => MessageKind::Listen,
            Self::Transaction(txn) => match txn.kind() {
                TransactionKind::Update => MessageKind::Txn,
                TransactionKind::QueryUpdate => MessageKind::Spu,
            },
            Self::CreateStore(_) => MessageKind::CreateStore,
            Self::DeleteStore(_) => MessageKind::DeleteStore,
            Self::EndSync(_) => MessageKind::EndSync,
            Self::Ack => MessageKind::Ack,
            Self::Nak { .. } => MessageKind::Nak,
        }
    }

    /// Plain negative acknowledgement
    pub fn nak() -> Self {
        Self::Nak { close: false }
    }

    /// Encode message to text
    pub fn encode(&self) -> Result<String> {
        let mut args: Vec<String> = Vec::new();
        let mut body = String::new();

        match self {
            Self::Ping | Self::Pong | Self::Listen | Self::Ack => {}
            Self::Master(policy) => {
                body = serde_json::to_string(policy)
                    .map_err(|e| Error::protocol(format!("Serialization failed: {}", e)))?;
            }
            Self::SlaveOf { host, port } => {
                if host.is_empty() || host.contains(char::is_whitespace) {
                    return Err(Error::protocol(format!("Invalid master host: {:?}", host)));
                }
                args.push(host.clone());
                args.push(port.to_string());
            }
            Self::Sync(cursor) => body = cursor.encode(),
            Self::Transaction(txn) => {
                validate_store_name(&txn.store_id)?;
                args = txn.header_args();
                body = txn.body.encode();
            }
            Self::CreateStore(name) | Self::DeleteStore(name) => {
                validate_store_name(name)?;
                args.push(name.clone());
            }
            Self::EndSync(SyncStatus::Ok) => args.push("OK".into()),
            Self::EndSync(SyncStatus::Failed { stores }) => {
                args.push("FAIL".into());
                args.extend(stores.iter().cloned());
            }
            Self::Nak { close } => {
                if *close {
                    args.push("close".into());
                }
            }
        }

        let mut out = String::from(self.kind().keyword());
        for arg in &args {
            out.push(' ');
            out.push_str(arg);
        }
        out.push('\n');
        out.push_str(&body);
        Ok(out)
    }

    /// Decode message from text
    pub fn decode(text: &str) -> Result<Self> {
        let (header, body) = text.split_once('\n').unwrap_or((text, ""));
        let mut words = header.split_whitespace();
        let keyword = words
            .next()
            .ok_or_else(|| Error::protocol("Empty message header"))?;
        let args: Vec<&str> = words.collect();
        let kind = MessageKind::try_from(keyword)?;

        let expect_args = |n: usize| -> Result<()> {
            if args.len() != n {
                return Err(Error::protocol(format!(
                    "'{}' expects {} argument(s), got {}",
                    kind,
                    n,
                    args.len()
                )));
            }
            Ok(())
        };

        let msg = match kind {
            MessageKind::Ping => Self::Ping,
            MessageKind::Pong => Self::Pong,
            MessageKind::Listen => Self::Listen,
            MessageKind::Ack => Self::Ack,
            MessageKind::Nak => match args.as_slice() {
                [] => Self::Nak { close: false },
                ["close"] => Self::Nak { close: true },
                _ => return Err(Error::protocol(format!("Malformed NAK: {:?}", header))),
            },
            MessageKind::Master => {
                let policy = if body.trim().is_empty() {
                    MasterPolicy::default()
                } else {
                    serde_json::from_str(body)
                        .map_err(|e| Error::protocol(format!("Invalid master policy: {}", e)))?
                };
                Self::Master(policy)
            }
            MessageKind::SlaveOf => {
                expect_args(2)?;
                let port = args[1]
                    .parse()
                    .map_err(|_| Error::protocol(format!("Invalid port: {}", args[1])))?;
                Self::SlaveOf {
                    host: args[0].to_string(),
                    port,
                }
            }
            MessageKind::Sync => Self::Sync(SyncCursor::decode(body)?),
            MessageKind::Txn => {
                Self::Transaction(Transaction::from_parts(TransactionKind::Update, &args, body)?)
            }
            MessageKind::Spu => Self::Transaction(Transaction::from_parts(
                TransactionKind::QueryUpdate,
                &args,
                body,
            )?),
            MessageKind::CreateStore | MessageKind::DeleteStore => {
                expect_args(1)?;
                header_store_name(args[0])?;
                let name = args[0].to_string();
                if kind == MessageKind::CreateStore {
                    Self::CreateStore(name)
                } else {
                    Self::DeleteStore(name)
                }
            }
            MessageKind::EndSync => match args.split_first() {
                Some((&"OK", [])) => Self::EndSync(SyncStatus::Ok),
                Some((&"FAIL", stores)) => Self::EndSync(SyncStatus::Failed {
                    stores: stores.iter().map(|s| s.to_string()).collect(),
                }),
                _ => return Err(Error::protocol(format!("Malformed endsync: {:?}", header))),
            },
        };

        if let Self::Transaction(txn) = &msg {
            header_store_name(&txn.store_id)?;
        }

        Ok(msg)
    }
}

/// A bad store name in a received header is a malformed message
fn header_store_name(name: &str) -> Result<()> {
    validate_store_name(name).map_err(|e| Error::protocol(e.to_string()))
}

/// Check that a store name can travel as a single header argument
pub fn validate_store_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.len() > MAX_STORE_NAME_LEN
        || name.chars().any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(Error::InvalidStoreName(name.to_string()));
    }
    Ok(())
}
