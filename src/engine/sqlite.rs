//! `SQLite` engine backed by a single `sqlx` connection per session.

use std::fmt::Write as _;
use std::time::Duration;

use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqliteRow};
use sqlx::{Column, ConnectOptions, Connection, Row, TypeInfo, ValueRef};
use tracing::debug;

use super::{Engine, EngineConnector, EngineFuture, QueryResult};
use crate::classify::normalize;
use crate::config::EngineConfig;
use crate::AppError;

/// Opens `SQLite` connections to one shared database file.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    options: SqliteConnectOptions,
}

impl SqliteConnector {
    /// Build connection options from engine configuration.
    ///
    /// WAL journaling lets sessions read while another holds the write lock.
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        let options = SqliteConnectOptions::new()
            .filename(&config.database_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));
        Self { options }
    }
}

impl EngineConnector for SqliteConnector {
    fn connect(&self) -> EngineFuture<'_, Box<dyn Engine>> {
        Box::pin(async move {
            let conn = self
                .options
                .connect()
                .await
                .map_err(|err| AppError::Db(format!("failed to open connection: {err}")))?;
            debug!("sqlite connection opened");
            Ok(Box::new(SqliteEngine { conn }) as Box<dyn Engine>)
        })
    }
}

/// One open `SQLite` connection.
pub struct SqliteEngine {
    conn: SqliteConnection,
}

impl Engine for SqliteEngine {
    fn query<'a>(&'a mut self, sql: &'a str) -> EngineFuture<'a, QueryResult> {
        Box::pin(async move {
            // Ad-hoc statements; keep them out of the prepared-statement cache.
            if returns_rows(sql) {
                let rows = sqlx::query(sql)
                    .persistent(false)
                    .fetch_all(&mut self.conn)
                    .await?;
                Ok(to_result(&rows))
            } else {
                let done = sqlx::query(sql)
                    .persistent(false)
                    .execute(&mut self.conn)
                    .await?;
                Ok(QueryResult {
                    rows_affected: done.rows_affected(),
                    ..QueryResult::default()
                })
            }
        })
    }

    fn close(self: Box<Self>) -> EngineFuture<'static, ()> {
        let engine = *self;
        Box::pin(async move {
            engine
                .conn
                .close()
                .await
                .map_err(|err| AppError::Db(format!("failed to close connection: {err}")))?;
            debug!("sqlite connection closed");
            Ok(())
        })
    }

    fn supports_locking_reads(&self) -> bool {
        false
    }
}

fn returns_rows(sql: &str) -> bool {
    let text = normalize(sql);
    let head = text.split_whitespace().next().unwrap_or_default();
    ["SELECT", "WITH", "VALUES", "PRAGMA", "EXPLAIN"]
        .iter()
        .any(|kw| head.eq_ignore_ascii_case(kw))
        || has_returning_clause(text)
}

/// `RETURNING` as a bare keyword, ignoring quoted literals and identifiers.
fn has_returning_clause(sql: &str) -> bool {
    let mut quote = None;
    let mut bare = String::with_capacity(sql.len());
    for ch in sql.chars() {
        match quote {
            Some(open) if ch == open => quote = None,
            Some(_) => {}
            None if matches!(ch, '\'' | '"' | '`') => {
                quote = Some(ch);
                bare.push(' ');
            }
            None => bare.push(ch),
        }
    }
    bare.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .any(|word| word.eq_ignore_ascii_case("RETURNING"))
}

fn to_result(rows: &[SqliteRow]) -> QueryResult {
    let columns = rows
        .first()
        .map(|row| {
            row.columns()
                .iter()
                .map(|col| col.name().to_owned())
                .collect()
        })
        .unwrap_or_default();
    let rows = rows
        .iter()
        .map(|row| (0..row.len()).map(|idx| cell(row, idx)).collect())
        .collect();
    QueryResult {
        columns,
        rows,
        rows_affected: 0,
    }
}

/// Decode one cell by its runtime storage class.
fn cell(row: &SqliteRow, idx: usize) -> Value {
    let storage = match row.try_get_raw(idx) {
        Ok(raw) if raw.is_null() => return Value::Null,
        Ok(raw) => raw.type_info().name().to_owned(),
        Err(_) => return Value::Null,
    };
    let decoded = match storage.as_str() {
        "INTEGER" | "BOOLEAN" => row.try_get_unchecked::<i64, _>(idx).map(Value::from),
        "REAL" | "NUMERIC" => row.try_get_unchecked::<f64, _>(idx).map(Value::from),
        "BLOB" => row
            .try_get_unchecked::<Vec<u8>, _>(idx)
            .map(|bytes| Value::String(hex(&bytes))),
        _ => row.try_get_unchecked::<String, _>(idx).map(Value::from),
    };
    decoded.unwrap_or(Value::Null)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}
