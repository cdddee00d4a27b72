//! Per-client statement interception and transaction tracking.
//!
//! A [`Session`] owns one [`ConnectionLease`], classifies every statement it
//! is given, gates row-locking statements on the shared [`LockManager`], and
//! publishes its [`SessionState`] on a `watch` channel for observers.

pub mod lease;

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

pub use lease::ConnectionLease;

use crate::classify::{Statement, StatementClassifier};
use crate::engine::{EngineConnector, QueryResult};
use crate::lock_manager::{Acquire, LockManager};
use crate::models::{ResourceKey, SessionState, SessionStatus, TimelineEvent, TxId};
use crate::timeline::EventSink;
use crate::Result;

/// Collaborators shared by every session of one orchestrator.
#[derive(Clone)]
pub struct SessionServices {
    /// Shared lock table.
    pub locks: Arc<LockManager>,
    /// Statement classifier.
    pub classifier: Arc<StatementClassifier>,
    /// Factory for engine connections.
    pub connector: Arc<dyn EngineConnector>,
    /// Destination of timeline events.
    pub sink: Arc<dyn EventSink>,
}

/// Behavioural switches for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Outside a transaction, hold the row lock of an `UPDATE` for the
    /// duration of that one statement. When `false`, autocommit statements
    /// never touch the lock table.
    pub autocommit_write_locks: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            autocommit_write_locks: true,
        }
    }
}

/// A successfully executed statement.
#[derive(Debug, Clone)]
pub struct Execution {
    /// How the statement was classified.
    pub statement: Statement,
    /// What the engine returned.
    pub result: QueryResult,
}

/// One client's view of the shared database.
pub struct Session {
    label: String,
    services: SessionServices,
    options: SessionOptions,
    lease: ConnectionLease,
    transaction: Option<TxId>,
    state: watch::Sender<SessionState>,
}

impl Session {
    /// Create an idle session. No connection is opened yet.
    #[must_use]
    pub fn new(label: impl Into<String>, services: SessionServices, options: SessionOptions) -> Self {
        let lease = ConnectionLease::new(Arc::clone(&services.connector));
        let (state, _) = watch::channel(SessionState::default());
        Self {
            label: label.into(),
            services,
            options,
            lease,
            transaction: None,
            state,
        }
    }

    /// Session label used on the timeline.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Id of the open transaction, if any.
    #[must_use]
    pub fn transaction_id(&self) -> Option<TxId> {
        self.transaction
    }

    /// Whether an explicit transaction is open.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// Current published state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Read-only feed of state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Whether the lease currently holds an open connection.
    #[must_use]
    pub fn has_connection(&self) -> bool {
        self.lease.is_open()
    }

    /// Open and close one connection so storage is initialised before use.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the connection cannot be opened.
    pub async fn initialize(&mut self) -> Result<()> {
        self.lease.engine().await?;
        self.lease.release().await;
        Ok(())
    }

    /// Run one statement, waiting for its row lock first when it needs one.
    ///
    /// May suspend indefinitely while another transaction holds the row.
    /// A failed statement leaves the transaction and its locks untouched;
    /// the caller decides whether to roll back.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Engine` with the engine's message when the
    /// statement is rejected, or `AppError::Db` if no connection can be opened.
    pub async fn execute(&mut self, sql: &str) -> Result<Execution> {
        let span = info_span!("execute", session = %self.label);
        self.execute_inner(sql).instrument(span).await
    }

    async fn execute_inner(&mut self, sql: &str) -> Result<Execution> {
        self.state.send_modify(|s| s.busy = true);

        let statement = self.services.classifier.classify(sql);
        debug!(kind = statement.kind(), "statement classified");
        let outcome = self.dispatch(&statement, sql).await;

        if self.transaction.is_none() {
            self.lease.release().await;
        }
        self.state.send_modify(|s| s.busy = false);

        let text = sql.trim();
        match &outcome {
            Ok(_) => self.emit(text),
            Err(err) => {
                warn!(%err, "statement failed");
                self.emit(format!("{text} -- {err}"));
            }
        }

        outcome.map(|result| Execution { statement, result })
    }

    async fn dispatch(&mut self, statement: &Statement, sql: &str) -> Result<QueryResult> {
        self.lease.engine().await?;
        match statement {
            Statement::Begin => self.begin(sql).await,
            Statement::Commit | Statement::Rollback => self.finish(sql).await,
            Statement::LockingRead { .. } | Statement::LockingWrite { .. } => {
                self.locked(statement, sql).await
            }
            Statement::Other => self.forward(sql).await,
        }
    }

    async fn begin(&mut self, sql: &str) -> Result<QueryResult> {
        if let Some(tx) = self.transaction {
            warn!(tx = %tx, "BEGIN ignored: transaction already open");
            return Ok(QueryResult::default());
        }

        let result = self.forward(sql).await?;
        let tx = TxId::generate();
        self.transaction = Some(tx);
        self.state.send_modify(|s| {
            s.in_transaction = true;
            s.transaction_id = Some(tx);
        });
        info!(tx = %tx, "transaction started");
        Ok(result)
    }

    async fn finish(&mut self, sql: &str) -> Result<QueryResult> {
        let result = self.forward(sql).await?;
        self.end_transaction();
        Ok(result)
    }

    fn end_transaction(&mut self) {
        if let Some(tx) = self.transaction.take() {
            let released = self.services.locks.release_all(tx);
            info!(tx = %tx, released, "transaction ended");
        }
        self.state.send_modify(|s| {
            s.status = SessionStatus::Idle;
            s.in_transaction = false;
            s.transaction_id = None;
        });
    }

    async fn locked(&mut self, statement: &Statement, sql: &str) -> Result<QueryResult> {
        let Some(resource) = statement.resource() else {
            return self.forward(sql).await;
        };

        if let Some(tx) = self.transaction {
            self.acquire(&resource, tx).await;
            return self.forward_locking(statement, sql).await;
        }

        if matches!(statement, Statement::LockingWrite { .. }) && self.options.autocommit_write_locks
        {
            // Implicit one-statement transaction.
            let tx = TxId::generate();
            self.acquire(&resource, tx).await;
            let result = self.forward_locking(statement, sql).await;
            self.services.locks.release_all(tx);
            self.set_status(SessionStatus::Idle);
            return result;
        }

        debug!(%resource, "autocommit; running without row lock");
        self.forward_locking(statement, sql).await
    }

    async fn acquire(&mut self, resource: &ResourceKey, tx: TxId) {
        loop {
            match self.services.locks.request(resource, tx) {
                Acquire::Granted => {
                    debug!(%resource, "row lock granted");
                    break;
                }
                Acquire::Reentrant => break,
                Acquire::Queued(wait) => {
                    info!(%resource, holder = %wait.holder(), "waiting for row lock");
                    self.set_status(SessionStatus::Waiting);
                    self.emit(format!(
                        "waiting for {resource} (held by tx {})",
                        wait.holder().short()
                    ));
                    if wait.granted().await {
                        info!(%resource, "row lock acquired after wait");
                        self.emit(format!("acquired {resource}"));
                        break;
                    }
                }
            }
        }
        self.set_status(SessionStatus::Acquired);
    }

    async fn forward(&mut self, sql: &str) -> Result<QueryResult> {
        self.lease.engine().await?.query(sql).await
    }

    async fn forward_locking(&mut self, statement: &Statement, sql: &str) -> Result<QueryResult> {
        let engine = self.lease.engine().await?;
        if matches!(statement, Statement::LockingRead { .. }) && !engine.supports_locking_reads() {
            let rewritten = self.services.classifier.strip_locking_clause(sql);
            return engine.query(&rewritten).await;
        }
        engine.query(sql).await
    }

    /// Read a whole table for an observer. Produces no timeline event.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Engine` if the table cannot be read.
    pub async fn read_table(&mut self, table: &str) -> Result<QueryResult> {
        let sql = format!("SELECT * FROM {table}");
        let result = self.forward(&sql).await;
        if self.transaction.is_none() {
            self.lease.release().await;
        }
        result
    }

    /// Drop the connection, discarding any open engine transaction, and
    /// release the row locks that transaction held.
    pub async fn close(&mut self) {
        self.lease.release().await;
        self.end_transaction();
    }

    fn set_status(&self, status: SessionStatus) {
        self.state.send_modify(|s| s.status = status);
    }

    fn emit(&self, content: impl Into<String>) {
        self.services
            .sink
            .record(TimelineEvent::new(self.label.as_str(), content));
    }
}
