//! Embedded SQL engine boundary.
//!
//! The simulator treats the engine as a black box that runs one statement
//! at a time on a connection owned by a single session. [`sqlite`] provides
//! the production implementation; tests substitute recording fakes.

pub mod sqlite;

use std::future::Future;
use std::pin::Pin;

use serde::Serialize;

use crate::Result;

/// Boxed future returned by engine operations.
pub type EngineFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Rows and metadata produced by one statement.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct QueryResult {
    /// Column names, in select-list order. Empty when no rows came back.
    pub columns: Vec<String>,
    /// Row values.
    pub rows: Vec<Vec<serde_json::Value>>,
    /// Rows changed by a write statement.
    pub rows_affected: u64,
}

/// One open connection to the embedded engine.
pub trait Engine: Send {
    /// Run a single statement.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Engine`](crate::AppError::Engine) carrying the
    /// engine's message when the statement is rejected.
    fn query<'a>(&'a mut self, sql: &'a str) -> EngineFuture<'a, QueryResult>;

    /// Close the connection. Any open engine transaction is discarded.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Db`](crate::AppError::Db) if the close fails.
    fn close(self: Box<Self>) -> EngineFuture<'static, ()>;

    /// Whether the dialect accepts `SELECT ... FOR UPDATE`.
    fn supports_locking_reads(&self) -> bool {
        true
    }
}

/// Factory for engine connections; shared by all sessions.
pub trait EngineConnector: Send + Sync {
    /// Open a fresh connection.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Db`](crate::AppError::Db) if the connection cannot
    /// be established.
    fn connect(&self) -> EngineFuture<'_, Box<dyn Engine>>;
}
