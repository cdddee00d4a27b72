//! Coordination of several sessions over one shared database.
//!
//! The [`Orchestrator`] owns the sessions, the shared lock table and the
//! timeline. After a session commits or rolls back it pushes a
//! [`RefreshNotice`] for every idle peer outside a transaction so observers
//! can redraw that peer's view of the watched tables.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

use crate::classify::StatementClassifier;
use crate::config::SimulatorConfig;
use crate::engine::{EngineConnector, QueryResult};
use crate::lock_manager::LockManager;
use crate::models::{SessionState, TimelineEvent};
use crate::session::{Execution, Session, SessionOptions, SessionServices};
use crate::timeline::{EventSink, JsonlTimelineWriter, Timeline};
use crate::{AppError, Result};

const REFRESH_CAPACITY: usize = 64;

/// Contents of one watched table as seen by one session.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TableView {
    /// Table name.
    pub table: String,
    /// Rows read through the session's connection.
    pub result: QueryResult,
}

/// Fresh view of the watched tables for one idle session.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RefreshNotice {
    /// Session whose view was refreshed.
    pub session_label: String,
    /// One entry per watched table that could be read.
    pub views: Vec<TableView>,
}

struct SessionSlot {
    label: String,
    session: Arc<Mutex<Session>>,
    state: watch::Receiver<SessionState>,
}

/// Owner of every session, the lock table and the timeline.
pub struct Orchestrator {
    locks: Arc<LockManager>,
    timeline: Arc<Timeline>,
    slots: Vec<SessionSlot>,
    watched_tables: Vec<String>,
    refresh: broadcast::Sender<RefreshNotice>,
}

impl Orchestrator {
    /// Seed the database and bring up the configured sessions.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the timeline log cannot be opened,
    /// `AppError::Engine` if a seed statement fails, or `AppError::Db` if a
    /// session cannot connect.
    pub async fn start(config: &SimulatorConfig, connector: Arc<dyn EngineConnector>) -> Result<Self> {
        let timeline = match &config.timeline_log {
            Some(path) => Timeline::with_writer(JsonlTimelineWriter::new(path.clone())?),
            None => Timeline::new(),
        };
        Self::with_timeline(config, connector, Arc::new(timeline)).await
    }

    /// Like [`start`](Self::start), recording into a caller-supplied timeline.
    ///
    /// # Errors
    ///
    /// Same as [`start`](Self::start), minus timeline log failures.
    pub async fn with_timeline(
        config: &SimulatorConfig,
        connector: Arc<dyn EngineConnector>,
        timeline: Arc<Timeline>,
    ) -> Result<Self> {
        seed(connector.as_ref(), &config.seed).await?;

        let services = SessionServices {
            locks: Arc::new(LockManager::new()),
            classifier: Arc::new(StatementClassifier::new()?),
            connector,
            sink: Arc::clone(&timeline) as Arc<dyn EventSink>,
        };
        let options = SessionOptions {
            autocommit_write_locks: config.autocommit_write_locks,
        };

        // Sequential on purpose: concurrent first connections race while the
        // shared database file is being initialised.
        let mut slots = Vec::with_capacity(config.sessions.len());
        for label in &config.sessions {
            let mut session = Session::new(label.as_str(), services.clone(), options);
            session.initialize().await?;
            info!(session = %label, "session initialized");
            slots.push(SessionSlot {
                label: label.clone(),
                state: session.subscribe(),
                session: Arc::new(Mutex::new(session)),
            });
        }

        let (refresh, _) = broadcast::channel(REFRESH_CAPACITY);
        Ok(Self {
            locks: services.locks,
            timeline,
            slots,
            watched_tables: config.watched_tables.clone(),
            refresh,
        })
    }

    /// Run `sql` on the session called `label`.
    ///
    /// Statements on one session run one at a time; a statement waiting for
    /// a row lock holds back later statements of the same session only.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown label, otherwise whatever
    /// [`Session::execute`] returns.
    pub async fn execute(&self, label: &str, sql: &str) -> Result<Execution> {
        let slot = self.slot(label)?;
        let execution = slot.session.lock().await.execute(sql).await?;
        if execution.statement.ends_transaction() {
            self.on_session_idle_after_commit(label).await;
        }
        Ok(execution)
    }

    /// Push a refreshed view to every other session that is idle, not
    /// mid-statement and outside a transaction. Returns how many peers were
    /// refreshed.
    pub async fn on_session_idle_after_commit(&self, committing: &str) -> usize {
        let mut refreshed = 0;
        for slot in self.slots.iter().filter(|slot| slot.label != committing) {
            let idle = slot.state.borrow().is_idle();
            if !idle {
                debug!(peer = %slot.label, "peer not idle; refresh skipped");
                continue;
            }
            let Ok(mut session) = slot.session.try_lock() else {
                debug!(peer = %slot.label, "peer about to run a statement; refresh skipped");
                continue;
            };
            // A read on the peer's connection would pin a snapshot inside
            // its open transaction and fail its later writes.
            if session.in_transaction() {
                debug!(peer = %slot.label, "peer inside a transaction; refresh skipped");
                continue;
            }

            let mut views = Vec::with_capacity(self.watched_tables.len());
            for table in &self.watched_tables {
                match session.read_table(table).await {
                    Ok(result) => views.push(TableView {
                        table: table.clone(),
                        result,
                    }),
                    Err(err) => warn!(peer = %slot.label, table = %table, %err, "refresh read failed"),
                }
            }
            drop(session);

            // No subscribers is fine; the notice is advisory.
            let _ = self.refresh.send(RefreshNotice {
                session_label: slot.label.clone(),
                views,
            });
            refreshed += 1;
        }
        debug!(committing, refreshed, "idle peers refreshed");
        refreshed
    }

    /// Append an event to the shared timeline.
    pub fn record_event(&self, event: TimelineEvent) {
        self.timeline.record(event);
    }

    /// Session labels in creation order.
    #[must_use]
    pub fn labels(&self) -> Vec<&str> {
        self.slots.iter().map(|slot| slot.label.as_str()).collect()
    }

    /// Latest published state of a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown label.
    pub fn state(&self, label: &str) -> Result<SessionState> {
        Ok(*self.slot(label)?.state.borrow())
    }

    /// Feed of state changes for a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown label.
    pub fn watch(&self, label: &str) -> Result<watch::Receiver<SessionState>> {
        Ok(self.slot(label)?.state.clone())
    }

    /// Direct handle to a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown label.
    pub fn session(&self, label: &str) -> Result<Arc<Mutex<Session>>> {
        Ok(Arc::clone(&self.slot(label)?.session))
    }

    /// Shared timeline.
    #[must_use]
    pub fn timeline(&self) -> &Arc<Timeline> {
        &self.timeline
    }

    /// Shared lock table.
    #[must_use]
    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Live feed of refresh notices.
    #[must_use]
    pub fn subscribe_refresh(&self) -> broadcast::Receiver<RefreshNotice> {
        self.refresh.subscribe()
    }

    /// Close every session that is not mid-statement.
    pub async fn shutdown(&self) {
        for slot in &self.slots {
            match slot.session.try_lock() {
                Ok(mut session) => session.close().await,
                Err(_) => warn!(session = %slot.label, "session busy at shutdown; left open"),
            }
        }
        info!("orchestrator shut down");
    }

    fn slot(&self, label: &str) -> Result<&SessionSlot> {
        self.slots
            .iter()
            .find(|slot| slot.label == label)
            .ok_or_else(|| AppError::NotFound(format!("session {label:?} does not exist")))
    }
}

async fn seed(connector: &dyn EngineConnector, statements: &[String]) -> Result<()> {
    if statements.is_empty() {
        return Ok(());
    }
    let mut engine = connector.connect().await?;
    for sql in statements {
        engine.query(sql).await?;
    }
    engine.close().await?;
    info!(count = statements.len(), "seed statements applied");
    Ok(())
}
