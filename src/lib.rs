#![forbid(unsafe_code)]

//! Transactional row-lock simulator.
//!
//! Several [`session::Session`]s share one embedded database. Statements
//! are classified by locking intent, row-locking statements wait on the
//! shared [`lock_manager::LockManager`], and every step lands on an ordered
//! [`timeline::Timeline`].

pub mod classify;
pub mod config;
pub mod engine;
pub mod errors;
pub mod lock_manager;
pub mod models;
pub mod orchestrator;
pub mod script;
pub mod session;
pub mod timeline;

pub use config::SimulatorConfig;
pub use errors::{AppError, Result};
