//! Record types shared between the persistence layer and its callers

use crate::session::types::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of event recorded in the append-only activity log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityAction {
    /// A turn was accepted and committed
    TurnAccepted,
    /// A turn was denied by the quota ledger
    TurnDenied,
    /// A turn was rejected as illegal for the current phase
    TurnInvalid,
    /// A turn failed on a collaborator call (timeout or error)
    TurnFailed,
    /// A new session was created
    SessionStarted,
    /// A session reached `Finalized` and was delivered
    SessionFinalized,
    /// A session was cancelled by its user
    SessionCancelled,
    /// A session was expired by the inactivity sweep
    SessionExpired,
    /// An admin banned a user
    Banned,
    /// An admin unbanned a user
    Unbanned,
    /// An admin granted VIP tier
    VipGranted,
    /// An admin revoked VIP tier
    VipRevoked,
    /// An admin force-cancelled a user's session
    ForceCancelled,
    /// A broadcast target snapshot was taken
    Broadcast,
}

impl ActivityAction {
    /// Stable string form used in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityAction::TurnAccepted => "TURN_ACCEPTED",
            ActivityAction::TurnDenied => "TURN_DENIED",
            ActivityAction::TurnInvalid => "TURN_INVALID",
            ActivityAction::TurnFailed => "TURN_FAILED",
            ActivityAction::SessionStarted => "SESSION_STARTED",
            ActivityAction::SessionFinalized => "SESSION_FINALIZED",
            ActivityAction::SessionCancelled => "SESSION_CANCELLED",
            ActivityAction::SessionExpired => "SESSION_EXPIRED",
            ActivityAction::Banned => "BANNED",
            ActivityAction::Unbanned => "UNBANNED",
            ActivityAction::VipGranted => "VIP_GRANTED",
            ActivityAction::VipRevoked => "VIP_REVOKED",
            ActivityAction::ForceCancelled => "FORCE_CANCELLED",
            ActivityAction::Broadcast => "BROADCAST",
        }
    }

    /// Parse the stable string form; unknown strings yield `None`
    pub fn parse(s: &str) -> Option<Self> {
        let action = match s {
            "TURN_ACCEPTED" => ActivityAction::TurnAccepted,
            "TURN_DENIED" => ActivityAction::TurnDenied,
            "TURN_INVALID" => ActivityAction::TurnInvalid,
            "TURN_FAILED" => ActivityAction::TurnFailed,
            "SESSION_STARTED" => ActivityAction::SessionStarted,
            "SESSION_FINALIZED" => ActivityAction::SessionFinalized,
            "SESSION_CANCELLED" => ActivityAction::SessionCancelled,
            "SESSION_EXPIRED" => ActivityAction::SessionExpired,
            "BANNED" => ActivityAction::Banned,
            "UNBANNED" => ActivityAction::Unbanned,
            "VIP_GRANTED" => ActivityAction::VipGranted,
            "VIP_REVOKED" => ActivityAction::VipRevoked,
            "FORCE_CANCELLED" => ActivityAction::ForceCancelled,
            "BROADCAST" => ActivityAction::Broadcast,
            _ => return None,
        };
        Some(action)
    }
}

/// One append-only activity log entry
///
/// Never mutated after append. `actor` is `None` for system-initiated
/// events (expiry sweep) and console admin actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    /// Who performed the action, when known
    pub actor: Option<UserId>,
    /// What happened
    pub action: ActivityAction,
    /// The affected user, when the action has a target
    pub target: Option<UserId>,
    /// Free-form detail (kept short; no message content for privacy)
    pub details: String,
    /// When the entry was appended
    pub at: DateTime<Utc>,
}

impl ActivityEntry {
    /// Create an entry timestamped now
    pub fn new(
        actor: Option<UserId>,
        action: ActivityAction,
        target: Option<UserId>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            actor,
            action,
            target,
            details: details.into(),
            at: Utc::now(),
        }
    }
}
