//! Simulator configuration parsing and validation.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{AppError, Result};

/// Embedded engine settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    /// Database file shared by all sessions.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// How long the engine retries a busy database before failing a statement.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("txlock-sim.db")
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_sessions() -> Vec<String> {
    vec!["A".into(), "B".into()]
}

fn default_true() -> bool {
    true
}

/// Top-level configuration parsed from `txlock-sim.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SimulatorConfig {
    /// Session labels, created in this order.
    #[serde(default = "default_sessions")]
    pub sessions: Vec<String>,
    /// Tables re-read for idle peers after a commit or rollback.
    #[serde(default)]
    pub watched_tables: Vec<String>,
    /// Row-lock autocommit `UPDATE`s for the duration of the statement.
    #[serde(default = "default_true")]
    pub autocommit_write_locks: bool,
    /// Optional JSONL file receiving every timeline event.
    #[serde(default)]
    pub timeline_log: Option<PathBuf>,
    /// Statements run once on a dedicated connection before sessions start.
    #[serde(default)]
    pub seed: Vec<String>,
    /// Engine settings.
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            sessions: default_sessions(),
            watched_tables: Vec::new(),
            autocommit_write_locks: true,
            timeline_log: None,
            seed: Vec::new(),
            engine: EngineConfig::default(),
        }
    }
}

impl SimulatorConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.sessions.is_empty() {
            return Err(AppError::Config("sessions must not be empty".into()));
        }

        let mut seen = HashSet::new();
        for label in &self.sessions {
            if label.trim().is_empty() || label.contains(':') {
                return Err(AppError::Config(format!(
                    "invalid session label {label:?}: must be non-blank and contain no ':'"
                )));
            }
            if !seen.insert(label.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate session label {label:?}"
                )));
            }
        }

        // Watched tables are interpolated into SELECT statements.
        if let Some(bad) = self.watched_tables.iter().find(|t| !is_identifier(t)) {
            return Err(AppError::Config(format!(
                "watched table {bad:?} is not a plain identifier"
            )));
        }

        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
