//! Session data model
//!
//! The [`Session`] is the mutable per-user state tracking document
//! drafting progress: the owned draft, the append-only turn history,
//! and the monotonically increasing version used for stale-write
//! detection.

use crate::session::phase::SessionPhase;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// Opaque, stable identifier of a chat participant
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        UserId(id)
    }
}

/// Kind of document a session is building
///
/// Set once on session creation and immutable thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    /// Word-processing document
    Word,
    /// PDF document
    Pdf,
    /// Spreadsheet
    Excel,
    /// Presentation
    PowerPoint,
}

impl DocumentKind {
    /// File extension used when the document is exported
    pub fn extension(&self) -> &'static str {
        match self {
            DocumentKind::Word => "docx",
            DocumentKind::Pdf => "pdf",
            DocumentKind::Excel => "xlsx",
            DocumentKind::PowerPoint => "pptx",
        }
    }

    /// Parse a kind from a user-supplied name or file extension
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "word" | "doc" | "docx" => Some(DocumentKind::Word),
            "pdf" => Some(DocumentKind::Pdf),
            "excel" | "xls" | "xlsx" | "sheet" => Some(DocumentKind::Excel),
            "powerpoint" | "ppt" | "pptx" | "slides" => Some(DocumentKind::PowerPoint),
            _ => None,
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DocumentKind::Word => "Word",
            DocumentKind::Pdf => "PDF",
            DocumentKind::Excel => "Excel",
            DocumentKind::PowerPoint => "PowerPoint",
        };
        f.write_str(name)
    }
}

/// The draft document owned exclusively by a session
///
/// Passed by reference to the renderer collaborator for mutation and
/// never shared across sessions. Carries a content hash so downstream
/// caches can detect unchanged content cheaply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentDraft {
    content: String,
    hash: String,
}

impl DocumentDraft {
    /// Create an empty draft
    pub fn empty() -> Self {
        Self {
            content: String::new(),
            hash: hash_content(""),
        }
    }

    /// Create a draft from initial content
    pub fn from_content(content: impl Into<String>) -> Self {
        let content = content.into();
        let hash = hash_content(&content);
        Self { content, hash }
    }

    /// The draft text
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Whether the draft has no content yet
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Short SHA-256 hash of the current content
    pub fn content_hash(&self) -> &str {
        &self.hash
    }
}

impl Default for DocumentDraft {
    fn default() -> Self {
        Self::empty()
    }
}

fn hash_content(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    // 16 hex chars are plenty for change detection
    let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    hex
}

/// One accepted turn: the instruction and its outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// The user's instruction text (commands are recorded as entered)
    pub instruction: String,
    /// Short outcome description for introspection queries
    pub outcome: String,
    /// When the turn completed
    pub at: DateTime<Utc>,
}

/// One user's document-drafting session
///
/// Created on the first document-creation instruction while no active
/// session exists, mutated in place by every accepted turn, and removed
/// from the store on finalize, cancel, or administrative termination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Stable session id, used for log correlation
    pub id: Uuid,
    /// Owning user; immutable
    pub owner: UserId,
    /// Current phase
    pub phase: SessionPhase,
    /// Kind of document being built; immutable after creation
    pub document_kind: DocumentKind,
    /// The draft, owned exclusively by this session
    pub draft: DocumentDraft,
    /// Append-only record of accepted turns
    history: Vec<HistoryEntry>,
    /// When the session was created
    pub created_at: DateTime<Utc>,
    /// Updated on every accepted turn; drives inactivity expiry
    pub last_activity_at: DateTime<Utc>,
    /// Incremented on every successful draft mutation; stale concurrent
    /// writes are rejected by compare-and-swap on this value
    pub version: u64,
}

impl Session {
    /// Create a fresh session in the `Creating` phase
    pub fn new(owner: UserId, kind: DocumentKind) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner,
            phase: SessionPhase::Creating,
            document_kind: kind,
            draft: DocumentDraft::empty(),
            history: Vec::new(),
            created_at: now,
            last_activity_at: now,
            version: 0,
        }
    }

    /// Refresh the activity timestamp
    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    /// Whether the session has been inactive longer than `timeout`
    pub fn is_expired(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        now - self.last_activity_at > timeout
    }

    /// Append one accepted turn to the history
    ///
    /// The history is append-only; it is never trimmed on the session.
    pub fn append_history(&mut self, instruction: impl Into<String>, outcome: impl Into<String>) {
        self.history.push(HistoryEntry {
            instruction: instruction.into(),
            outcome: outcome.into(),
            at: Utc::now(),
        });
    }

    /// Replace the draft and bump the version
    ///
    /// Called only after the renderer collaborator succeeded; a failed
    /// mutation must leave both draft and version unchanged.
    pub fn commit_draft(&mut self, draft: DocumentDraft) {
        self.draft = draft;
        self.version += 1;
    }

    /// Full turn history, oldest first
    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// The most recent `limit` history entries, oldest first
    ///
    /// Used to bound the context handed to the planner; the stored
    /// history itself is not trimmed.
    pub fn recent_history(&self, limit: usize) -> &[HistoryEntry] {
        let start = self.history.len().saturating_sub(limit);
        &self.history[start..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_display_and_from() {
        let id = UserId::from(42);
        assert_eq!(id.to_string(), "42");
        assert_eq!(id, UserId(42));
    }

    #[test]
    fn test_document_kind_parse() {
        assert_eq!(DocumentKind::parse("word"), Some(DocumentKind::Word));
        assert_eq!(DocumentKind::parse("DOCX"), Some(DocumentKind::Word));
        assert_eq!(DocumentKind::parse("pdf"), Some(DocumentKind::Pdf));
        assert_eq!(DocumentKind::parse("xlsx"), Some(DocumentKind::Excel));
        assert_eq!(
            DocumentKind::parse("slides"),
            Some(DocumentKind::PowerPoint)
        );
        assert_eq!(DocumentKind::parse("midi"), None);
    }

    #[test]
    fn test_document_kind_extension() {
        assert_eq!(DocumentKind::Word.extension(), "docx");
        assert_eq!(DocumentKind::PowerPoint.extension(), "pptx");
    }

    #[test]
    fn test_empty_draft() {
        let draft = DocumentDraft::empty();
        assert!(draft.is_empty());
        assert_eq!(draft.content(), "");
    }

    #[test]
    fn test_draft_hash_tracks_content() {
        let a = DocumentDraft::from_content("alpha");
        let b = DocumentDraft::from_content("alpha");
        let c = DocumentDraft::from_content("beta");
        assert_eq!(a.content_hash(), b.content_hash());
        assert_ne!(a.content_hash(), c.content_hash());
        assert_eq!(a.content_hash().len(), 16);
    }

    #[test]
    fn test_new_session_starts_creating_at_version_zero() {
        let session = Session::new(UserId(1), DocumentKind::Word);
        assert_eq!(session.phase, SessionPhase::Creating);
        assert_eq!(session.version, 0);
        assert!(session.draft.is_empty());
        assert!(session.history().is_empty());
        assert_eq!(session.owner, UserId(1));
    }

    #[test]
    fn test_commit_draft_bumps_version() {
        let mut session = Session::new(UserId(1), DocumentKind::Pdf);
        session.commit_draft(DocumentDraft::from_content("v1"));
        session.commit_draft(DocumentDraft::from_content("v2"));
        assert_eq!(session.version, 2);
        assert_eq!(session.draft.content(), "v2");
    }

    #[test]
    fn test_history_is_append_only() {
        let mut session = Session::new(UserId(1), DocumentKind::Excel);
        for i in 0..25 {
            session.append_history(format!("edit {i}"), "ok");
        }
        assert_eq!(session.history().len(), 25);
        assert_eq!(session.history()[0].instruction, "edit 0");
        assert_eq!(session.history()[24].instruction, "edit 24");
    }

    #[test]
    fn test_recent_history_bounds_context() {
        let mut session = Session::new(UserId(1), DocumentKind::Word);
        for i in 0..12 {
            session.append_history(format!("edit {i}"), "ok");
        }
        let recent = session.recent_history(10);
        assert_eq!(recent.len(), 10);
        assert_eq!(recent[0].instruction, "edit 2");

        // A limit larger than the history returns everything
        assert_eq!(session.recent_history(100).len(), 12);
    }

    #[test]
    fn test_expiry() {
        let mut session = Session::new(UserId(1), DocumentKind::Word);
        let now = Utc::now();
        assert!(!session.is_expired(Duration::hours(1), now));

        session.last_activity_at = now - Duration::hours(2);
        assert!(session.is_expired(Duration::hours(1), now));
        assert!(!session.is_expired(Duration::hours(3), now));
    }

    #[test]
    fn test_session_serde_roundtrip() {
        let mut session = Session::new(UserId(7), DocumentKind::PowerPoint);
        session.append_history("make slides", "created");
        session.commit_draft(DocumentDraft::from_content("# Deck"));

        let json = serde_json::to_string(&session).expect("serialize");
        let restored: Session = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(restored.owner, session.owner);
        assert_eq!(restored.version, 1);
        assert_eq!(restored.draft.content(), "# Deck");
        assert_eq!(restored.history().len(), 1);
    }
}
