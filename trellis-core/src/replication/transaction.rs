//! Transaction envelope
//!
//! A [`Transaction`] is the unit of replicated work: the store it targets, its
//! own id, the id that must precede it in the store's causal chain, and a body.
//!
//! Wire form (header keyword plus `storeId id predecessorId`):
//!
//! ```text
//! txn orders <id> <predecessor>      spu orders <id> <predecessor>
//! <preconditions>                    <expression ...>
//! ||
//! <deletes>
//! ||
//! <inserts>
//! ||
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Line that terminates each section of an update body
pub const SECTION_SENTINEL: &str = "||";

/// Number of sections in an update body
const UPDATE_SECTIONS: usize = 3;

/// 128-bit transaction identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Sentinel id of an empty chain
    pub const EMPTY: TransactionId = TransactionId(Uuid::nil());

    /// Allocate a fresh id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// True for the empty-chain sentinel
    pub fn is_empty(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for TransactionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::protocol(format!("Invalid transaction id '{}': {}", s, e)))
    }
}

/// Kind of a transaction, as recorded in store history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionKind {
    /// Triple-level update with preconditions
    Update,
    /// Query-language update expression
    QueryUpdate,
}

impl TransactionKind {
    /// Header keyword used on the wire
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Update => "txn",
            Self::QueryUpdate => "spu",
        }
    }
}

/// Payload of a transaction, independent of its position in a chain
///
/// Update sections are sets of triple lines. Decoding splits them with
/// [`str::lines`], so a trailing newline or a `\r` before a line break does
/// not survive a round trip. Query-update expressions travel verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionBody {
    /// Update-triples transaction
    Update {
        /// Triples that must exist for the update to apply
        preconditions: String,
        /// Triples to remove
        deletes: String,
        /// Triples to add
        inserts: String,
    },
    /// Query-language update transaction
    QueryUpdate {
        /// Update expression text
        expression: String,
    },
}

impl TransactionBody {
    /// Build an update body
    pub fn update(
        preconditions: impl Into<String>,
        deletes: impl Into<String>,
        inserts: impl Into<String>,
    ) -> Self {
        Self::Update {
            preconditions: preconditions.into(),
            deletes: deletes.into(),
            inserts: inserts.into(),
        }
    }

    /// Build a query-update body
    pub fn query_update(expression: impl Into<String>) -> Self {
        Self::QueryUpdate {
            expression: expression.into(),
        }
    }

    /// Kind of this body
    pub fn kind(&self) -> TransactionKind {
        match self {
            Self::Update { .. } => TransactionKind::Update,
            Self::QueryUpdate { .. } => TransactionKind::QueryUpdate,
        }
    }

    /// Encode the message body (everything after the header line)
    pub fn encode(&self) -> String {
        match self {
            Self::Update {
                preconditions,
                deletes,
                inserts,
            } => {
                let mut out = String::new();
                for section in [preconditions, deletes, inserts] {
                    if !section.is_empty() {
                        out.push_str(section);
                        if !section.ends_with('\n') {
                            out.push('\n');
                        }
                    }
                    out.push_str(SECTION_SENTINEL);
                    out.push('\n');
                }
                out
            }
            Self::QueryUpdate { expression } => expression.clone(),
        }
    }

    /// Decode a message body for the given kind
    pub fn decode(kind: TransactionKind, body: &str) -> Result<Self> {
        match kind {
            TransactionKind::QueryUpdate => Ok(Self::query_update(body)),
            TransactionKind::Update => {
                let mut sections: Vec<String> = Vec::with_capacity(UPDATE_SECTIONS);
                let mut current: Vec<&str> = Vec::new();

                for line in body.lines() {
                    if line == SECTION_SENTINEL {
                        if sections.len() == UPDATE_SECTIONS {
                            return Err(Error::protocol("Update body has more than 3 sections"));
                        }
                        sections.push(current.join("\n"));
                        current.clear();
                    } else if sections.len() == UPDATE_SECTIONS {
                        if !line.trim().is_empty() {
                            return Err(Error::protocol(
                                "Unexpected content after final update section",
                            ));
                        }
                    } else {
                        current.push(line);
                    }
                }

                if sections.len() != UPDATE_SECTIONS {
                    return Err(Error::protocol(format!(
                        "Update body has {} sections, expected {}",
                        sections.len(),
                        UPDATE_SECTIONS
                    )));
                }

                let inserts = sections.pop().unwrap_or_default();
                let deletes = sections.pop().unwrap_or_default();
                let preconditions = sections.pop().unwrap_or_default();
                Ok(Self::Update {
                    preconditions,
                    deletes,
                    inserts,
                })
            }
        }
    }
}

/// A replicated unit of work positioned in a store's causal chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Target store
    pub store_id: String,
    /// Unique id, assigned once by the accepting node
    pub id: TransactionId,
    /// Id that must immediately precede this one in the store chain
    pub predecessor_id: TransactionId,
    /// Work to apply
    pub body: TransactionBody,
}

impl Transaction {
    /// Create a transaction
    pub fn new(
        store_id: impl Into<String>,
        id: TransactionId,
        predecessor_id: TransactionId,
        body: TransactionBody,
    ) -> Self {
        Self {
            store_id: store_id.into(),
            id,
            predecessor_id,
            body,
        }
    }

    /// Kind of the body
    pub fn kind(&self) -> TransactionKind {
        self.body.kind()
    }

    /// Header arguments: `storeId id predecessorId`
    pub fn header_args(&self) -> Vec<String> {
        vec![
            self.store_id.clone(),
            self.id.to_string(),
            self.predecessor_id.to_string(),
        ]
    }

    /// Rebuild from header arguments and body
    pub fn from_parts(kind: TransactionKind, args: &[&str], body: &str) -> Result<Self> {
        let [store_id, id, predecessor_id] = args else {
            return Err(Error::protocol(format!(
                "'{}' expects 3 arguments (storeId id predecessorId), got {}",
                kind.keyword(),
                args.len()
            )));
        };

        Ok(Self {
            store_id: (*store_id).to_string(),
            id: id.parse()?,
            predecessor_id: predecessor_id.parse()?,
            body: TransactionBody::decode(kind, body)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_body_layout() {
        let body = TransactionBody::update("<a> <b> <c> .", "", "<x> <y> <z> .\n<x> <y> <w> .");
        assert_eq!(
            body.encode(),
            "<a> <b> <c> .\n||\n||\n<x> <y> <z> .\n<x> <y> <w> .\n||\n"
        );
    }

    #[test]
    fn test_update_body_decode() {
        let body = TransactionBody::decode(TransactionKind::Update, "p1\np2\n||\nd1\n||\n||\n").unwrap();
        assert_eq!(body, TransactionBody::update("p1\np2", "d1", ""));
    }

    #[test]
    fn test_update_body_missing_section() {
        let result = TransactionBody::decode(TransactionKind::Update, "p1\n||\nd1\n||\n");
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[test]
    fn test_update_body_extra_section() {
        let result = TransactionBody::decode(TransactionKind::Update, "||\n||\n||\n||\n");
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[test]
    fn test_query_update_body_has_no_sentinel() {
        let body = TransactionBody::query_update("DELETE DATA { <a> <b> <c> }");
        assert_eq!(body.encode(), "DELETE DATA { <a> <b> <c> }");
        assert!(!body.encode().contains(SECTION_SENTINEL));
    }

    #[test]
    fn test_from_parts_wrong_arity() {
        let id = TransactionId::new().to_string();
        let result = Transaction::from_parts(TransactionKind::QueryUpdate, &["orders", id.as_str()], "");
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[test]
    fn test_empty_id() {
        assert!(TransactionId::EMPTY.is_empty());
        assert!(!TransactionId::new().is_empty());
        let parsed: TransactionId = TransactionId::EMPTY.to_string().parse().unwrap();
        assert_eq!(parsed, TransactionId::EMPTY);
    }

    #[test]
    fn test_update_sections_are_line_sets() {
        let body = TransactionBody::update("p1\r\n", "", "i1\n\n");
        let decoded = TransactionBody::decode(TransactionKind::Update, &body.encode()).unwrap();
        assert_eq!(decoded, TransactionBody::update("p1", "", "i1\n"));
    }
}
