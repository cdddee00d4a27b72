//! Lockable resource keys and transaction identifiers.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier of a lockable unit, rendered as `<table>:<row-id>`.
///
/// The lock manager never looks inside the key; only [`ResourceKey::row`]
/// knows how one is composed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    /// Key for a single row. Table names are case-folded so that `Accounts`
    /// and `accounts` contend for the same row.
    #[must_use]
    pub fn row(table: &str, row_id: i64) -> Self {
        Self(format!("{}:{row_id}", table.to_ascii_lowercase()))
    }

    /// Wrap an already-composed key.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Borrow the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ResourceKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one logical unit of work between BEGIN and COMMIT/ROLLBACK.
///
/// Minted fresh for every BEGIN, so two transactions of the same session
/// never share an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(Uuid);

impl TxId {
    /// Mint a new, never-before-seen transaction id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, for log lines and timeline text.
    #[must_use]
    pub fn short(&self) -> String {
        self.0.simple().to_string().chars().take(8).collect()
    }
}

impl Display for TxId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
