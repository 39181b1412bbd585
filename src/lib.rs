//! Scrivener - session and quota core for a conversational
//! document-drafting assistant
//!
//! This library provides the state machine, concurrency control, and
//! rate limiting behind a multi-user drafting service where users build
//! documents through conversational turns.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `session`: Phase model, session data, per-user locks, and the store
//! - `quota`: Monthly request counting, tiers, and bans
//! - `coordinator`: The per-turn pipeline tying everything together
//! - `collaborators`: Planner and renderer trait seams for embedders
//! - `admin`: Administrative control plane and introspection
//! - `storage`: SQLite and in-memory persistence backends
//! - `config`: Configuration management and validation
//! - `error`: Error types and result aliases
//! - `cli`: Command-line interface definition
//!
//! # Example
//!
//! ```no_run
//! use scrivener::config::Config;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     config.validate()?;
//!
//!     // Coordinator wiring would go here
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod cli;
pub mod collaborators;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod quota;
pub mod session;
pub mod storage;

// Re-export commonly used types
pub use config::Config;
pub use coordinator::{Instruction, TurnCoordinator, TurnReply, TurnResult};
pub use error::{Result, ScrivenerError};
pub use quota::{DenialReason, QuotaDecision, QuotaLedger, Tier};
pub use session::{DocumentKind, Session, SessionPhase, UserId};
