//! Turn coordinator
//!
//! Front door for user turns. One call to [`TurnCoordinator::handle_turn`]
//! runs the whole pipeline for a single instruction: per-user lock,
//! quota reservation, phase check, collaborator calls under timeout,
//! and the compare-and-swap commit with bounded retry.
//!
//! Expected failures (denied, illegal phase, collaborator trouble,
//! stale write) come back as [`TurnResult`] variants so the embedder
//! can phrase them to the user. `Err` is reserved for the fatal case:
//! a turn whose side effects may already be visible could not be
//! persisted within the retry budget.

use crate::collaborators::{EditPlanner, ExportedDocument, Renderer, SessionContext};
use crate::config::Config;
use crate::error::{Result, ScrivenerError};
use crate::quota::{DenialReason, QuotaDecision, QuotaLedger};
use crate::session::{
    transition, DocumentKind, LockTable, Session, SessionPhase, SessionStore, TurnEvent, UserId,
};
use crate::storage::{ActivityAction, ActivityEntry, Persistence};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// A parsed user instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Start a new document of the given kind
    NewDocument {
        /// Kind of document to create
        kind: DocumentKind,
    },
    /// Free-form content or edit text
    Edit {
        /// The instruction text
        text: String,
    },
    /// Request an analysis/preview of the draft
    Analyze,
    /// Finalize and deliver the document
    Done,
    /// Abandon the session
    Cancel,
}

impl Instruction {
    /// Map this instruction to a phase-transition event
    ///
    /// Free-form text is the initial content while the session is still
    /// `Creating` and an edit afterwards.
    pub fn event_for(&self, phase: SessionPhase) -> TurnEvent {
        match self {
            Instruction::NewDocument { .. } => TurnEvent::NewDocument,
            Instruction::Edit { .. } if phase == SessionPhase::Creating => {
                TurnEvent::InitialContent
            }
            Instruction::Edit { .. } => TurnEvent::Edit,
            Instruction::Analyze => TurnEvent::Analyze,
            Instruction::Done => TurnEvent::Done,
            Instruction::Cancel => TurnEvent::Cancel,
        }
    }

    /// Short form recorded in session history and the activity log
    pub fn describe(&self) -> String {
        match self {
            Instruction::NewDocument { kind } => format!("/new {kind}"),
            Instruction::Edit { text } => text.clone(),
            Instruction::Analyze => "/analyze".to_string(),
            Instruction::Done => "/done".to_string(),
            Instruction::Cancel => "/cancel".to_string(),
        }
    }
}

/// What a completed turn hands back to the embedder
#[derive(Debug, Clone)]
pub struct TurnReply {
    /// Text to show the user
    pub text: String,
    /// Phase after the turn
    pub phase: SessionPhase,
    /// Session version after the turn (0 when no session remains)
    pub version: u64,
    /// Present only on a finalize turn
    pub exported: Option<ExportedDocument>,
}

/// Outcome of one turn
#[derive(Debug, Clone)]
pub enum TurnResult {
    /// The turn was accepted and committed
    Completed(TurnReply),
    /// Denied before any state mutation; the slot was never kept
    Denied(DenialReason),
    /// The instruction is illegal for the current phase
    InvalidState {
        /// The phase the session was in
        phase: SessionPhase,
    },
    /// A collaborator failed; draft and version are unchanged
    MutationFailed {
        /// Collaborator error detail
        detail: String,
    },
    /// A collaborator exceeded its deadline; slot refunded
    TimedOut {
        /// The deadline that elapsed
        seconds: u64,
    },
    /// A concurrent writer won the version race; slot refunded
    Conflict,
}

/// Introspection view of a live session
#[derive(Debug, Clone)]
pub struct SessionStatus {
    /// Current phase
    pub phase: SessionPhase,
    /// Kind of document being built
    pub document_kind: DocumentKind,
    /// Current version
    pub version: u64,
    /// Accepted turns so far
    pub turns: usize,
    /// When the session was created
    pub created_at: DateTime<Utc>,
    /// Last accepted turn
    pub last_activity_at: DateTime<Utc>,
}

enum CommitOutcome {
    Committed,
    Conflict,
}

/// Coordinates every user turn end to end
pub struct TurnCoordinator {
    config: Config,
    locks: Arc<LockTable>,
    ledger: Arc<QuotaLedger>,
    store: Arc<SessionStore>,
    persistence: Arc<dyn Persistence>,
    planner: Arc<dyn EditPlanner>,
    renderer: Arc<dyn Renderer>,
}

impl TurnCoordinator {
    /// Wire up a coordinator from its collaborators
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        locks: Arc<LockTable>,
        ledger: Arc<QuotaLedger>,
        store: Arc<SessionStore>,
        persistence: Arc<dyn Persistence>,
        planner: Arc<dyn EditPlanner>,
        renderer: Arc<dyn Renderer>,
    ) -> Self {
        Self {
            config,
            locks,
            ledger,
            store,
            persistence,
            planner,
            renderer,
        }
    }

    /// Handle one turn for `user`
    ///
    /// Turns for the same user serialize in arrival order; turns for
    /// different users run independently.
    ///
    /// # Errors
    ///
    /// Returns `Err` only when a committed turn's state could not be
    /// persisted within the configured retry budget. Everything else is
    /// a `TurnResult` variant.
    pub async fn handle_turn(&self, user: UserId, instruction: Instruction) -> Result<TurnResult> {
        let _guard = self.locks.acquire(user).await;

        match self.ledger.check_and_reserve(user)? {
            QuotaDecision::Allowed { remaining } => {
                tracing::debug!(user = %user, ?remaining, "turn slot reserved");
            }
            QuotaDecision::Denied(reason) => {
                tracing::info!(user = %user, ?reason, "turn denied");
                self.log_activity(ActivityEntry::new(
                    Some(user),
                    ActivityAction::TurnDenied,
                    None,
                    format!("{reason:?}"),
                ));
                return Ok(TurnResult::Denied(reason));
            }
        }

        let session = self.load_live_session(user)?;
        let phase = session
            .as_ref()
            .map(|s| s.phase)
            .unwrap_or(SessionPhase::Idle);

        let event = instruction.event_for(phase);
        let Some(next_phase) = transition(phase, event) else {
            tracing::info!(user = %user, %phase, ?event, "illegal instruction for phase");
            self.log_activity(ActivityEntry::new(
                Some(user),
                ActivityAction::TurnInvalid,
                None,
                format!("{event:?} in {phase}"),
            ));
            return Ok(TurnResult::InvalidState { phase });
        };

        match instruction {
            Instruction::NewDocument { kind } => self.start_session(user, kind).await,
            Instruction::Edit { text } => {
                // transition() only yields a next phase here when a
                // session exists
                let session = session.ok_or_else(|| {
                    ScrivenerError::InvalidState {
                        phase: phase.to_string(),
                    }
                })?;
                self.apply_edit_turn(user, session, next_phase, &text).await
            }
            Instruction::Analyze => {
                let session = session.ok_or_else(|| {
                    ScrivenerError::InvalidState {
                        phase: phase.to_string(),
                    }
                })?;
                self.analyze_turn(user, session, next_phase).await
            }
            Instruction::Done => {
                let session = session.ok_or_else(|| {
                    ScrivenerError::InvalidState {
                        phase: phase.to_string(),
                    }
                })?;
                self.finalize_turn(user, session).await
            }
            Instruction::Cancel => self.cancel_turn(user, session).await,
        }
    }

    /// The user's session status, if a live session exists
    pub fn session_status(&self, user: UserId) -> Result<Option<SessionStatus>> {
        Ok(self.load_live_session(user)?.map(|session| SessionStatus {
            phase: session.phase,
            document_kind: session.document_kind,
            version: session.version,
            turns: session.history().len(),
            created_at: session.created_at,
            last_activity_at: session.last_activity_at,
        }))
    }

    /// The user's quota standing, for `/usage`-style queries
    pub fn usage(&self, user: UserId) -> Result<crate::quota::QuotaStatus> {
        self.ledger.status(user)
    }

    /// The user's full turn history, oldest first
    pub fn session_history(&self, user: UserId) -> Result<Vec<crate::session::HistoryEntry>> {
        Ok(self
            .load_live_session(user)?
            .map(|session| session.history().to_vec())
            .unwrap_or_default())
    }

    async fn start_session(&self, user: UserId, kind: DocumentKind) -> Result<TurnResult> {
        let session = Session::new(user, kind);
        let version = session.version;

        match self
            .commit_with_retry(user, || self.store.create(session.clone()))
            .await?
        {
            CommitOutcome::Committed => {}
            CommitOutcome::Conflict => {
                self.ledger.release(user)?;
                return Ok(TurnResult::Conflict);
            }
        }

        self.log_activity(ActivityEntry::new(
            Some(user),
            ActivityAction::SessionStarted,
            None,
            format!("kind={kind}"),
        ));
        self.log_activity(ActivityEntry::new(
            Some(user),
            ActivityAction::TurnAccepted,
            None,
            format!("/new {kind}"),
        ));

        Ok(TurnResult::Completed(TurnReply {
            text: format!(
                "Starting a new {kind} document. Describe what it should contain."
            ),
            phase: SessionPhase::Creating,
            version,
            exported: None,
        }))
    }

    async fn apply_edit_turn(
        &self,
        user: UserId,
        mut session: Session,
        next_phase: SessionPhase,
        text: &str,
    ) -> Result<TurnResult> {
        let context =
            SessionContext::from_session(&session, self.config.session.max_context_turns);

        let model_deadline = self.config.collaborators.model_timeout_seconds;
        let plan = match timeout(
            Duration::from_secs(model_deadline),
            self.planner.generate_edit_plan(&context, text),
        )
        .await
        {
            Err(_) => return self.fail_timed_out(user, model_deadline),
            Ok(Err(e)) => return self.fail_mutation(user, e),
            Ok(Ok(plan)) => plan,
        };

        let render_deadline = self.config.collaborators.render_timeout_seconds;
        let new_draft = match timeout(
            Duration::from_secs(render_deadline),
            self.renderer.apply_edit(&session.draft, &plan),
        )
        .await
        {
            Err(_) => return self.fail_timed_out(user, render_deadline),
            Ok(Err(e)) => return self.fail_mutation(user, e),
            Ok(Ok(draft)) => draft,
        };

        let expected_version = session.version;
        session.commit_draft(new_draft);
        session.phase = next_phase;
        session.append_history(text, "edit applied");
        session.touch();

        match self
            .commit_with_retry(user, || self.store.commit(&session, expected_version))
            .await?
        {
            CommitOutcome::Committed => {}
            CommitOutcome::Conflict => {
                self.ledger.release(user)?;
                return Ok(TurnResult::Conflict);
            }
        }

        self.log_activity(ActivityEntry::new(
            Some(user),
            ActivityAction::TurnAccepted,
            None,
            format!("edit -> v{}", session.version),
        ));

        Ok(TurnResult::Completed(TurnReply {
            text: plan.reply,
            phase: session.phase,
            version: session.version,
            exported: None,
        }))
    }

    async fn analyze_turn(
        &self,
        user: UserId,
        mut session: Session,
        next_phase: SessionPhase,
    ) -> Result<TurnResult> {
        let context =
            SessionContext::from_session(&session, self.config.session.max_context_turns);

        let model_deadline = self.config.collaborators.model_timeout_seconds;
        let analysis = match timeout(
            Duration::from_secs(model_deadline),
            self.planner.analyze(&context),
        )
        .await
        {
            Err(_) => return self.fail_timed_out(user, model_deadline),
            Ok(Err(e)) => return self.fail_mutation(user, e),
            Ok(Ok(analysis)) => analysis,
        };

        // Analysis never mutates the draft, so the version stays put;
        // only phase, history, and the activity clock move
        let expected_version = session.version;
        session.phase = next_phase;
        session.append_history("/analyze", "analysis delivered");
        session.touch();

        match self
            .commit_with_retry(user, || self.store.commit(&session, expected_version))
            .await?
        {
            CommitOutcome::Committed => {}
            CommitOutcome::Conflict => {
                self.ledger.release(user)?;
                return Ok(TurnResult::Conflict);
            }
        }

        self.log_activity(ActivityEntry::new(
            Some(user),
            ActivityAction::TurnAccepted,
            None,
            "analysis".to_string(),
        ));

        Ok(TurnResult::Completed(TurnReply {
            text: analysis,
            phase: session.phase,
            version: session.version,
            exported: None,
        }))
    }

    async fn finalize_turn(&self, user: UserId, session: Session) -> Result<TurnResult> {
        if session.draft.is_empty() {
            self.log_activity(ActivityEntry::new(
                Some(user),
                ActivityAction::TurnInvalid,
                None,
                "finalize with empty draft".to_string(),
            ));
            return Ok(TurnResult::InvalidState {
                phase: session.phase,
            });
        }

        let render_deadline = self.config.collaborators.render_timeout_seconds;
        let exported = match timeout(
            Duration::from_secs(render_deadline),
            self.renderer.export(&session.draft, session.document_kind),
        )
        .await
        {
            Err(_) => return self.fail_timed_out(user, render_deadline),
            Ok(Err(e)) => return self.fail_mutation(user, e),
            Ok(Ok(exported)) => exported,
        };

        // Terminal phase: the session row is removed rather than kept
        match self
            .commit_with_retry(user, || self.store.remove(user))
            .await?
        {
            CommitOutcome::Committed => {}
            CommitOutcome::Conflict => {
                self.ledger.release(user)?;
                return Ok(TurnResult::Conflict);
            }
        }

        self.log_activity(ActivityEntry::new(
            Some(user),
            ActivityAction::SessionFinalized,
            None,
            format!("v{} {}", session.version, exported.file_name),
        ));
        self.log_activity(ActivityEntry::new(
            Some(user),
            ActivityAction::TurnAccepted,
            None,
            "/done".to_string(),
        ));

        Ok(TurnResult::Completed(TurnReply {
            text: format!("Your {} document is ready.", session.document_kind),
            phase: SessionPhase::Finalized,
            version: session.version,
            exported: Some(exported),
        }))
    }

    async fn cancel_turn(&self, user: UserId, session: Option<Session>) -> Result<TurnResult> {
        let (version, text) = match session {
            Some(session) => {
                // Terminal removal is committed state like any other
                // write and gets the same bounded retry
                match self
                    .commit_with_retry(user, || self.store.remove(user))
                    .await?
                {
                    CommitOutcome::Committed => {}
                    CommitOutcome::Conflict => {
                        self.ledger.release(user)?;
                        return Ok(TurnResult::Conflict);
                    }
                }
                self.log_activity(ActivityEntry::new(
                    Some(user),
                    ActivityAction::SessionCancelled,
                    None,
                    format!("v{}", session.version),
                ));
                (session.version, "Session cancelled; the draft was discarded.")
            }
            // Cancel with nothing active completes as a no-op turn
            None => (0, "No active session to cancel."),
        };

        self.log_activity(ActivityEntry::new(
            Some(user),
            ActivityAction::TurnAccepted,
            None,
            "/cancel".to_string(),
        ));

        Ok(TurnResult::Completed(TurnReply {
            text: text.to_string(),
            phase: SessionPhase::Cancelled,
            version,
            exported: None,
        }))
    }

    /// Load the user's session, expiring it first if it sat idle too long
    fn load_live_session(&self, user: UserId) -> Result<Option<Session>> {
        let Some(session) = self.store.get(user)? else {
            return Ok(None);
        };

        let idle_limit = ChronoDuration::hours(self.config.session.timeout_hours as i64);
        if session.is_expired(idle_limit, Utc::now()) {
            tracing::info!(user = %user, session = %session.id, "expiring idle session");
            self.store.remove(user)?;
            self.log_activity(ActivityEntry::new(
                None,
                ActivityAction::SessionExpired,
                Some(user),
                format!("idle > {}h", self.config.session.timeout_hours),
            ));
            return Ok(None);
        }
        Ok(Some(session))
    }

    fn fail_timed_out(&self, user: UserId, seconds: u64) -> Result<TurnResult> {
        // The collaborator never finished, so nothing is visible to the
        // user; the slot goes back
        self.ledger.release(user)?;
        self.log_activity(ActivityEntry::new(
            Some(user),
            ActivityAction::TurnFailed,
            None,
            format!("timeout after {seconds}s"),
        ));
        Ok(TurnResult::TimedOut { seconds })
    }

    fn fail_mutation(&self, user: UserId, error: anyhow::Error) -> Result<TurnResult> {
        let detail = error.to_string();
        tracing::warn!(user = %user, %detail, "collaborator call failed");
        self.log_activity(ActivityEntry::new(
            Some(user),
            ActivityAction::TurnFailed,
            None,
            detail.clone(),
        ));
        Ok(TurnResult::MutationFailed { detail })
    }

    /// Run a persistence write with bounded retry and jittered backoff
    ///
    /// A version conflict is not retried: the other writer's turn won
    /// and this one must surface `Conflict`. Exhausting the budget on
    /// any other failure is fatal because the turn's effects may already
    /// be visible.
    async fn commit_with_retry(
        &self,
        user: UserId,
        op: impl Fn() -> Result<()>,
    ) -> Result<CommitOutcome> {
        let attempts = self.config.storage.persist_retry_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match op() {
                Ok(()) => return Ok(CommitOutcome::Committed),
                Err(e) => {
                    if matches!(
                        e.downcast_ref::<ScrivenerError>(),
                        Some(ScrivenerError::ConcurrencyConflict { .. })
                    ) {
                        tracing::info!(user = %user, "stale write rejected");
                        return Ok(CommitOutcome::Conflict);
                    }
                    tracing::warn!(
                        user = %user,
                        attempt,
                        attempts,
                        error = %e,
                        "persistence write failed"
                    );
                    last_error = Some(e);
                }
            }

            if attempt < attempts {
                let jitter = rand::rng().random_range(10..50u64);
                tokio::time::sleep(Duration::from_millis(attempt as u64 * jitter)).await;
            }
        }

        let error = last_error.unwrap_or_else(|| {
            ScrivenerError::Storage("persistence retry exhausted".into()).into()
        });
        tracing::error!(user = %user, error = %error, "persistence retry budget exhausted");
        Err(error.context(format!(
            "failed to persist turn for user {user} after {attempts} attempts"
        )))
    }

    fn log_activity(&self, entry: ActivityEntry) {
        // Activity logging is best-effort; a full disk must not turn a
        // committed turn into an error
        if let Err(e) = self.persistence.append_activity(&entry) {
            tracing::warn!(error = %e, "failed to append activity entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_for_maps_text_by_phase() {
        let edit = Instruction::Edit {
            text: "add a title".to_string(),
        };
        assert_eq!(
            edit.event_for(SessionPhase::Creating),
            TurnEvent::InitialContent
        );
        assert_eq!(edit.event_for(SessionPhase::Editing), TurnEvent::Edit);
        assert_eq!(edit.event_for(SessionPhase::Reviewing), TurnEvent::Edit);
    }

    #[test]
    fn test_event_for_commands() {
        assert_eq!(
            Instruction::Analyze.event_for(SessionPhase::Editing),
            TurnEvent::Analyze
        );
        assert_eq!(
            Instruction::Done.event_for(SessionPhase::Reviewing),
            TurnEvent::Done
        );
        assert_eq!(
            Instruction::Cancel.event_for(SessionPhase::Idle),
            TurnEvent::Cancel
        );
        assert_eq!(
            Instruction::NewDocument {
                kind: DocumentKind::Word
            }
            .event_for(SessionPhase::Idle),
            TurnEvent::NewDocument
        );
    }

    #[test]
    fn test_describe() {
        assert_eq!(
            Instruction::NewDocument {
                kind: DocumentKind::Pdf
            }
            .describe(),
            "/new PDF"
        );
        assert_eq!(
            Instruction::Edit {
                text: "shorter".to_string()
            }
            .describe(),
            "shorter"
        );
        assert_eq!(Instruction::Done.describe(), "/done");
    }
}
