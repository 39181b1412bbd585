//! Collaborator interfaces
//!
//! The turn coordinator never talks to a model or a document renderer
//! directly; it drives these two traits. Production embedders plug in
//! real backends, tests plug in stubs. Every call made through them is
//! bounded by the timeouts in
//! [`CollaboratorConfig`](crate::config::CollaboratorConfig).

use crate::error::Result;
use crate::session::{DocumentKind, Session, SessionPhase};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Read-only view of a session handed to the planner
///
/// Carries at most the configured number of recent turns, not the full
/// history, so planner context stays bounded while the session keeps
/// everything.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Owning user
    pub user: crate::session::UserId,
    /// Kind of document being built
    pub document_kind: DocumentKind,
    /// Current phase
    pub phase: SessionPhase,
    /// Current draft text
    pub draft_content: String,
    /// Hash of the current draft, for collaborator-side caching
    pub draft_hash: String,
    /// Recent instructions, oldest first
    pub recent_turns: Vec<String>,
}

impl SessionContext {
    /// Build a context from a session, bounding history to `max_turns`
    pub fn from_session(session: &Session, max_turns: usize) -> Self {
        Self {
            user: session.owner,
            document_kind: session.document_kind,
            phase: session.phase,
            draft_content: session.draft.content().to_string(),
            draft_hash: session.draft.content_hash().to_string(),
            recent_turns: session
                .recent_history(max_turns)
                .iter()
                .map(|entry| entry.instruction.clone())
                .collect(),
        }
    }
}

/// A planned edit produced by the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditPlan {
    /// Short reply shown to the user
    pub reply: String,
    /// The new document content the renderer should apply
    pub content: String,
}

/// A document rendered for delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedDocument {
    /// Suggested file name, extension included
    pub file_name: String,
    /// Document kind
    pub kind: DocumentKind,
    /// Rendered bytes
    pub bytes: Vec<u8>,
}

/// Model-backed planning collaborator
///
/// # Examples
///
/// ```no_run
/// use async_trait::async_trait;
/// use scrivener::collaborators::{EditPlan, EditPlanner, SessionContext};
/// use scrivener::error::Result;
///
/// struct EchoPlanner;
///
/// #[async_trait]
/// impl EditPlanner for EchoPlanner {
///     async fn generate_edit_plan(
///         &self,
///         _context: &SessionContext,
///         instruction: &str,
///     ) -> Result<EditPlan> {
///         Ok(EditPlan {
///             reply: "done".to_string(),
///             content: instruction.to_string(),
///         })
///     }
///
///     async fn analyze(&self, context: &SessionContext) -> Result<String> {
///         Ok(format!("{} chars", context.draft_content.len()))
///     }
/// }
/// ```
#[async_trait]
pub trait EditPlanner: Send + Sync {
    /// Turn a free-form instruction into a concrete edit plan
    async fn generate_edit_plan(
        &self,
        context: &SessionContext,
        instruction: &str,
    ) -> Result<EditPlan>;

    /// Produce an analysis/preview of the current draft
    ///
    /// Must not mutate anything; the coordinator leaves draft and
    /// version untouched around this call.
    async fn analyze(&self, context: &SessionContext) -> Result<String>;
}

/// Document rendering collaborator
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Apply a planned edit to the draft, returning the new draft
    ///
    /// The input draft is borrowed; on failure the caller keeps it
    /// unchanged.
    async fn apply_edit(
        &self,
        draft: &crate::session::DocumentDraft,
        plan: &EditPlan,
    ) -> Result<crate::session::DocumentDraft>;

    /// Render the finished draft into a deliverable document
    async fn export(
        &self,
        draft: &crate::session::DocumentDraft,
        kind: DocumentKind,
    ) -> Result<ExportedDocument>;
}
