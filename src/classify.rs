//! SQL statement classification by locking intent.
//!
//! The engine is a black box, so locking intent is inferred from the raw
//! statement text. Matching is case-insensitive and whitespace-tolerant;
//! leading comments and trailing semicolons are ignored. Anything the
//! patterns do not recognise is [`Statement::Other`] and runs without locks.

use regex::Regex;

use crate::models::ResourceKey;
use crate::{AppError, Result};

/// Locking intent of one statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// Opens an explicit transaction.
    Begin,
    /// Commits the open transaction.
    Commit,
    /// Rolls back the open transaction.
    Rollback,
    /// `SELECT ... FOR UPDATE` on a single row.
    LockingRead {
        /// Target table, unquoted.
        table: String,
        /// Value of the `id` equality predicate.
        row_id: i64,
    },
    /// `UPDATE ... WHERE id = <n>` on a single row.
    LockingWrite {
        /// Target table, unquoted.
        table: String,
        /// Value of the `id` equality predicate.
        row_id: i64,
    },
    /// No locking implication.
    Other,
}

impl Statement {
    /// Row resource this statement locks, if any.
    #[must_use]
    pub fn resource(&self) -> Option<ResourceKey> {
        match self {
            Self::LockingRead { table, row_id } | Self::LockingWrite { table, row_id } => {
                Some(ResourceKey::row(table, *row_id))
            }
            _ => None,
        }
    }

    /// `COMMIT` or `ROLLBACK`.
    #[must_use]
    pub fn ends_transaction(&self) -> bool {
        matches!(self, Self::Commit | Self::Rollback)
    }

    /// Short name used in logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Begin => "begin",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
            Self::LockingRead { .. } => "locking_read",
            Self::LockingWrite { .. } => "locking_write",
            Self::Other => "other",
        }
    }
}

/// Compiled patterns for [`Statement`] classification.
#[derive(Debug)]
pub struct StatementClassifier {
    begin: Regex,
    commit: Regex,
    rollback: Regex,
    locking_read: Regex,
    locking_write: Regex,
    where_clause: Regex,
    row_id: Regex,
    for_update: Regex,
}

impl StatementClassifier {
    /// Compile the classification patterns.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a pattern fails to compile.
    pub fn new() -> Result<Self> {
        Ok(Self {
            begin: compile(
                r"(?i)^(?:BEGIN(?:\s+(?:DEFERRED|IMMEDIATE|EXCLUSIVE))?(?:\s+TRANSACTION)?|START\s+TRANSACTION)$",
            )?,
            commit: compile(r"(?i)^(?:COMMIT|END)(?:\s+TRANSACTION)?$")?,
            rollback: compile(r"(?i)^ROLLBACK(?:\s+TRANSACTION)?$")?,
            locking_read: compile(
                r#"(?is)^SELECT\s.+?\sFROM\s+(?P<table>"[^"]+"|[A-Za-z_][A-Za-z0-9_]*)(?P<rest>.*)\sFOR\s+UPDATE(?:\s+(?:NOWAIT|SKIP\s+LOCKED))?$"#,
            )?,
            locking_write: compile(
                r#"(?is)^UPDATE\s+(?:OR\s+[A-Za-z]+\s+)?(?P<table>"[^"]+"|[A-Za-z_][A-Za-z0-9_]*)\s+SET\s.+?\sWHERE\s(?P<pred>.+)$"#,
            )?,
            where_clause: compile(r"(?is)\bWHERE\s(?P<pred>.+)$")?,
            row_id: compile(r#"(?i)\bid"?\s*=\s*'?(?P<id>-?\d+)\b"#)?,
            for_update: compile(r"(?i)\s+FOR\s+UPDATE(?:\s+(?:NOWAIT|SKIP\s+LOCKED))?")?,
        })
    }

    /// Classify one statement.
    #[must_use]
    pub fn classify(&self, sql: &str) -> Statement {
        let text = normalize(sql);

        if self.begin.is_match(text) {
            return Statement::Begin;
        }
        if self.commit.is_match(text) {
            return Statement::Commit;
        }
        if self.rollback.is_match(text) {
            return Statement::Rollback;
        }

        if let Some(caps) = self.locking_read.captures(text) {
            let predicate = self
                .where_clause
                .captures(&caps["rest"])
                .and_then(|w| w.name("pred").map(|m| m.as_str().to_owned()));
            if let Some(row_id) = predicate.and_then(|pred| self.row_id_in(&pred)) {
                return Statement::LockingRead {
                    table: unquote(&caps["table"]),
                    row_id,
                };
            }
            return Statement::Other;
        }

        if let Some(caps) = self.locking_write.captures(text) {
            if let Some(row_id) = self.row_id_in(&caps["pred"]) {
                return Statement::LockingWrite {
                    table: unquote(&caps["table"]),
                    row_id,
                };
            }
        }

        Statement::Other
    }

    /// Remove `FOR UPDATE` clauses for engines that cannot parse them.
    #[must_use]
    pub fn strip_locking_clause(&self, sql: &str) -> String {
        self.for_update.replace_all(sql, "").into_owned()
    }

    fn row_id_in(&self, predicate: &str) -> Option<i64> {
        self.row_id
            .captures(predicate)
            .and_then(|caps| caps["id"].parse().ok())
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|err| AppError::Config(format!("invalid statement pattern: {err}")))
}

fn unquote(ident: &str) -> String {
    ident.trim_matches('"').to_owned()
}

/// Drop leading comments, surrounding whitespace and trailing semicolons.
pub(crate) fn normalize(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map_or("", |(_, tail)| tail).trim_start();
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map_or("", |(_, tail)| tail).trim_start();
        } else {
            break;
        }
    }
    rest.trim_end().trim_end_matches(';').trim_end()
}
