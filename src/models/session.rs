//! Observable session status.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use super::resource::TxId;

/// Locking status of a session as seen by observers.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Holds no row locks and is not waiting for one.
    #[default]
    Idle,
    /// Suspended inside a lock acquisition.
    Waiting,
    /// Holds at least one row lock.
    Acquired,
}

impl Display for SessionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Waiting => "waiting",
            Self::Acquired => "acquired",
        };
        f.write_str(label)
    }
}

/// Snapshot published on every session state change.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionState {
    /// Current locking status.
    pub status: SessionStatus,
    /// Whether an explicit transaction is open.
    pub in_transaction: bool,
    /// Id of the open transaction, if any.
    pub transaction_id: Option<TxId>,
    /// A statement is currently in flight.
    pub busy: bool,
}

impl SessionState {
    /// Idle and not in the middle of a statement.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.status == SessionStatus::Idle && !self.busy
    }
}
