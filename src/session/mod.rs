//! Session state: phases, data model, per-user locks, and the store

pub mod locks;
pub mod phase;
pub mod store;
pub mod types;

pub use locks::LockTable;
pub use phase::{transition, SessionPhase, TurnEvent};
pub use store::SessionStore;
pub use types::{DocumentDraft, DocumentKind, HistoryEntry, Session, UserId};
