use async_trait::async_trait;
use scrivener::admin::AdminPlane;
use scrivener::collaborators::{EditPlan, EditPlanner, ExportedDocument, Renderer, SessionContext};
use scrivener::config::Config;
use scrivener::coordinator::TurnCoordinator;
use scrivener::error::Result;
use scrivener::quota::QuotaLedger;
use scrivener::session::{DocumentDraft, DocumentKind, LockTable, SessionStore};
use scrivener::storage::{MemoryPersistence, Persistence};
use std::sync::Arc;
use std::time::Duration;

/// Deterministic planner stub
///
/// Appends the instruction to the draft so tests can follow content and
/// version evolution turn by turn. Optional delay and failure injection
/// drive the timeout and refund paths.
#[derive(Default)]
pub struct StubPlanner {
    pub delay: Option<Duration>,
    pub fail: bool,
}

#[async_trait]
impl EditPlanner for StubPlanner {
    async fn generate_edit_plan(
        &self,
        context: &SessionContext,
        instruction: &str,
    ) -> Result<EditPlan> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            anyhow::bail!("planner unavailable");
        }
        let content = if context.draft_content.is_empty() {
            instruction.to_string()
        } else {
            format!("{}\n{}", context.draft_content, instruction)
        };
        Ok(EditPlan {
            reply: format!("applied: {instruction}"),
            content,
        })
    }

    async fn analyze(&self, context: &SessionContext) -> Result<String> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            anyhow::bail!("planner unavailable");
        }
        Ok(format!(
            "draft has {} lines",
            context.draft_content.lines().count()
        ))
    }
}

#[derive(Default)]
pub struct StubRenderer {
    pub fail: bool,
}

#[async_trait]
impl Renderer for StubRenderer {
    async fn apply_edit(&self, _draft: &DocumentDraft, plan: &EditPlan) -> Result<DocumentDraft> {
        if self.fail {
            anyhow::bail!("renderer unavailable");
        }
        Ok(DocumentDraft::from_content(plan.content.clone()))
    }

    async fn export(&self, draft: &DocumentDraft, kind: DocumentKind) -> Result<ExportedDocument> {
        if self.fail {
            anyhow::bail!("renderer unavailable");
        }
        Ok(ExportedDocument {
            file_name: format!("document.{}", kind.extension()),
            kind,
            bytes: draft.content().as_bytes().to_vec(),
        })
    }
}

/// Fully wired core over in-memory persistence
pub struct Harness {
    pub coordinator: Arc<TurnCoordinator>,
    pub admin: AdminPlane,
    pub ledger: Arc<QuotaLedger>,
    pub store: Arc<SessionStore>,
    pub persistence: Arc<MemoryPersistence>,
}

#[allow(dead_code)]
pub fn harness(config: Config) -> Harness {
    harness_with(config, StubPlanner::default(), StubRenderer::default())
}

#[allow(dead_code)]
pub fn harness_with(config: Config, planner: StubPlanner, renderer: StubRenderer) -> Harness {
    let memory = Arc::new(MemoryPersistence::new());
    let persistence: Arc<dyn Persistence> = memory.clone();
    let locks = Arc::new(LockTable::new());
    let ledger = Arc::new(QuotaLedger::new(&config.quota, Arc::clone(&persistence)));
    let store = Arc::new(SessionStore::new(Arc::clone(&persistence)));

    let coordinator = Arc::new(TurnCoordinator::new(
        config.clone(),
        Arc::clone(&locks),
        Arc::clone(&ledger),
        Arc::clone(&store),
        Arc::clone(&persistence),
        Arc::new(planner),
        Arc::new(renderer),
    ));
    let admin = AdminPlane::new(
        locks,
        Arc::clone(&ledger),
        Arc::clone(&store),
        persistence,
        config.session.timeout_hours,
        config.storage.persist_retry_attempts,
    );

    Harness {
        coordinator,
        admin,
        ledger,
        store,
        persistence: memory,
    }
}

#[allow(dead_code)]
pub fn config_with_limit(limit: u32) -> Config {
    let mut config = Config::default();
    config.quota.monthly_request_limit = limit;
    config
}
