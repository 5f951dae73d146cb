//! Sessions and the commitment protocol.

pub mod state;
pub mod store;
pub mod manager;

pub use state::{
    AuditRecord, GameContext, PlayerId, ServerSecret, Session, SessionId, SessionRow, SessionStatus, SessionView,
};
pub use store::{FileSessionStore, MemorySessionStore, SessionStore};
pub use manager::{CommitmentManager, SessionCreated, SessionHandle};
