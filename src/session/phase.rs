//! Session phase model and transition table
//!
//! Every session moves through a closed set of phases. The legality of
//! an event in a given phase is a single table lookup in [`transition`],
//! not scattered conditionals, so it can be tested exhaustively.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Phase of a document-drafting session
///
/// `Idle` means no session row exists for the user; it never appears in
/// the store and exists only so the transition table is total.
/// `Finalized` and `Cancelled` are terminal: entering either removes
/// the session from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionPhase {
    /// No active session
    Idle,
    /// Gathering the initial document intent
    Creating,
    /// Accepting free-form edit instructions
    Editing,
    /// Analysis/preview requested; no draft mutation
    Reviewing,
    /// Terminal: document delivered
    Finalized,
    /// Terminal: user or system aborted
    Cancelled,
}

impl SessionPhase {
    /// Whether this phase is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionPhase::Finalized | SessionPhase::Cancelled)
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Idle => "Idle",
            SessionPhase::Creating => "Creating",
            SessionPhase::Editing => "Editing",
            SessionPhase::Reviewing => "Reviewing",
            SessionPhase::Finalized => "Finalized",
            SessionPhase::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

/// Event driving a phase transition
///
/// Produced by the coordinator from a parsed instruction (or from the
/// inactivity sweep, for `InactivityTimeout`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEvent {
    /// A new-document request while no session exists
    NewDocument,
    /// The first free-form message of a `Creating` session
    InitialContent,
    /// A free-form edit instruction
    Edit,
    /// An analysis/preview request
    Analyze,
    /// A finalize request
    Done,
    /// A cancel request
    Cancel,
    /// The inactivity timeout fired (system-driven, not a user turn)
    InactivityTimeout,
}

/// Look up the legal transition for `(phase, event)`
///
/// Returns `None` for illegal combinations; the caller maps that to an
/// `InvalidState` result and leaves the session untouched.
///
/// # Examples
///
/// ```
/// use scrivener::session::{transition, SessionPhase, TurnEvent};
///
/// assert_eq!(
///     transition(SessionPhase::Idle, TurnEvent::NewDocument),
///     Some(SessionPhase::Creating)
/// );
/// assert_eq!(transition(SessionPhase::Idle, TurnEvent::Done), None);
/// ```
pub fn transition(phase: SessionPhase, event: TurnEvent) -> Option<SessionPhase> {
    use SessionPhase::*;
    use TurnEvent::*;

    match (phase, event) {
        (Idle, NewDocument) => Some(Creating),
        (Creating, InitialContent) => Some(Editing),
        (Editing, Edit) => Some(Editing),
        (Editing, Analyze) => Some(Reviewing),
        // Any further edit drops Reviewing back to Editing; repeating the
        // analysis request stays put
        (Reviewing, Edit) | (Reviewing, InitialContent) => Some(Editing),
        (Reviewing, Analyze) => Some(Reviewing),
        (Editing, Done) | (Reviewing, Done) => Some(Finalized),
        // Cancel and timeout end any non-terminal phase
        (Idle, Cancel)
        | (Creating, Cancel)
        | (Editing, Cancel)
        | (Reviewing, Cancel)
        | (Idle, InactivityTimeout)
        | (Creating, InactivityTimeout)
        | (Editing, InactivityTimeout)
        | (Reviewing, InactivityTimeout) => Some(Cancelled),
        _ => None,
    }
}
