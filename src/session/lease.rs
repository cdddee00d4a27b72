//! Lazily acquired, deterministically released engine connection.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::engine::{Engine, EngineConnector};
use crate::{AppError, Result};

/// A session's claim on one engine connection.
///
/// The connection is opened on first use and closed by [`release`]
/// whenever the session has no open transaction, so engine-side locks
/// never outlive a unit of work.
///
/// [`release`]: ConnectionLease::release
pub struct ConnectionLease {
    connector: Arc<dyn EngineConnector>,
    engine: Option<Box<dyn Engine>>,
}

impl ConnectionLease {
    /// Create an unopened lease.
    #[must_use]
    pub fn new(connector: Arc<dyn EngineConnector>) -> Self {
        Self {
            connector,
            engine: None,
        }
    }

    /// Whether a connection is currently open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.engine.is_some()
    }

    /// Borrow the connection, opening it first if necessary.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the connection cannot be opened.
    pub async fn engine(&mut self) -> Result<&mut (dyn Engine + 'static)> {
        if self.engine.is_none() {
            self.engine = Some(self.connector.connect().await?);
            debug!("connection leased");
        }
        self.engine
            .as_deref_mut()
            .ok_or_else(|| AppError::Db("connection unavailable".into()))
    }

    /// Close the connection if one is open. Close failures are logged only.
    pub async fn release(&mut self) {
        if let Some(engine) = self.engine.take() {
            match engine.close().await {
                Ok(()) => debug!("connection returned"),
                Err(err) => warn!(%err, "failed to close connection"),
            }
        }
    }
}
