//! Node lifecycle states
//!
//! ```text
//!                  ┌──────────────────────┐ quorum reached
//!      quorum > 0  │ AwaitingSlaveQuorum  ├──────────────┐
//!        ┌────────►└──────────────────────┘              ▼
//! ┌──────┴─────────┐     quorum = 0               ┌────────────┐
//! │ AwaitingMaster ├─────────────────────────────►│   Master   │
//! └──────┬─────────┘                              └────────────┘
//!        │ slaveof
//!        ▼            endsync OK            ┌───────┐
//! ┌─────────────────┐──────────────────────►│ Slave │
//! │ SyncingToMaster │◄──────────────────────┴───────┘
//! └───────┬─────────┘  gap / lost subscription   ▲
//!         │ endsync FAIL                         │ endsync OK
//!         ▼                                      │
//! ┌────────────────────┐─────────────────────────┘
//! │ FullResyncToMaster │
//! └────────────────────┘
//!
//! any state ──(local apply failure)──► Broken (terminal)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    /// Started, no role assigned yet
    AwaitingMaster,
    /// Designated master, waiting for enough slaves to subscribe
    AwaitingSlaveQuorum,
    /// Accepting client writes
    Master,
    /// Catching up with a master
    SyncingToMaster,
    /// Re-fetching stores whose catch-up failed
    FullResyncToMaster,
    /// In sync, following live broadcasts
    Slave,
    /// Fatal local fault; terminal until restart
    Broken,
}

impl NodeState {
    /// All states, in declaration order
    pub const ALL: [NodeState; 7] = [
        NodeState::AwaitingMaster,
        NodeState::AwaitingSlaveQuorum,
        NodeState::Master,
        NodeState::SyncingToMaster,
        NodeState::FullResyncToMaster,
        NodeState::Slave,
        NodeState::Broken,
    ];

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: NodeState) -> bool {
        use NodeState::*;

        match (self, next) {
            (Broken, _) => false,
            (_, Broken) => true,
            (AwaitingMaster, AwaitingSlaveQuorum)
            | (AwaitingMaster, Master)
            | (AwaitingSlaveQuorum, Master)
            | (AwaitingMaster, SyncingToMaster)
            | (Slave, SyncingToMaster)
            | (SyncingToMaster, Slave)
            | (SyncingToMaster, FullResyncToMaster)
            | (FullResyncToMaster, Slave) => true,
            _ => false,
        }
    }

    /// Only a master accepts client-originated writes
    pub fn accepts_client_writes(self) -> bool {
        self == NodeState::Master
    }

    /// Master-side roles: may serve `sync` and `listen`
    pub fn is_master_role(self) -> bool {
        matches!(self, NodeState::Master | NodeState::AwaitingSlaveQuorum)
    }

    /// Slave-side roles: may apply replicated transactions
    pub fn is_slave_role(self) -> bool {
        matches!(
            self,
            NodeState::Slave | NodeState::SyncingToMaster | NodeState::FullResyncToMaster
        )
    }

    /// True while a catch-up handshake is running
    pub fn is_syncing(self) -> bool {
        matches!(
            self,
            NodeState::SyncingToMaster | NodeState::FullResyncToMaster
        )
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
