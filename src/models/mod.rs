//! Domain model module declarations.

pub mod resource;
pub mod session;
pub mod timeline;

pub use resource::{ResourceKey, TxId};
pub use session::{SessionState, SessionStatus};
pub use timeline::TimelineEvent;
