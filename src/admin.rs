//! Administrative control plane
//!
//! Ban, tier, and session-termination controls plus the introspection
//! queries behind the admin CLI. Mutations that touch a user's session
//! take that user's lock first, so they serialize with in-flight turns
//! instead of racing them.

use crate::error::Result;
use crate::quota::{QuotaLedger, QuotaStatus, Tier};
use crate::session::{LockTable, Session, SessionStore, UserId};
use crate::storage::{ActivityAction, ActivityEntry, Persistence};
use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Point-in-time operational counters
#[derive(Debug, Clone)]
pub struct StatsSummary {
    /// Users with an active session
    pub active_sessions: usize,
    /// Users with a quota record this window
    pub tracked_users: usize,
    /// Requests counted across all users this window
    pub requests_this_window: u64,
    /// Users currently banned
    pub banned_users: usize,
    /// Users with VIP tier (runtime-granted)
    pub vip_users: usize,
}

pub struct AdminPlane {
    locks: Arc<LockTable>,
    ledger: Arc<QuotaLedger>,
    store: Arc<SessionStore>,
    persistence: Arc<dyn Persistence>,
    session_timeout_hours: u64,
    persist_retry_attempts: u32,
}

impl AdminPlane {
    /// Wire up the control plane
    pub fn new(
        locks: Arc<LockTable>,
        ledger: Arc<QuotaLedger>,
        store: Arc<SessionStore>,
        persistence: Arc<dyn Persistence>,
        session_timeout_hours: u64,
        persist_retry_attempts: u32,
    ) -> Self {
        Self {
            locks,
            ledger,
            store,
            persistence,
            session_timeout_hours,
            persist_retry_attempts,
        }
    }

    /// Ban a user
    ///
    /// Takes effect for any turn that has not yet passed its reservation
    /// check. The user's active session, if any, is left in place; they
    /// simply cannot act on it. Returns `false` when the user was
    /// already banned or is a config-listed admin.
    pub async fn ban(&self, actor: Option<UserId>, target: UserId) -> Result<bool> {
        let _guard = self.locks.acquire(target).await;
        let changed = self.ledger.set_banned(target, true)?;
        if changed {
            self.log(ActivityEntry::new(
                actor,
                ActivityAction::Banned,
                Some(target),
                String::new(),
            ));
        }
        Ok(changed)
    }

    /// Lift a user's ban; returns `false` when they were not banned
    pub async fn unban(&self, actor: Option<UserId>, target: UserId) -> Result<bool> {
        let _guard = self.locks.acquire(target).await;
        let changed = self.ledger.set_banned(target, false)?;
        if changed {
            self.log(ActivityEntry::new(
                actor,
                ActivityAction::Unbanned,
                Some(target),
                String::new(),
            ));
        }
        Ok(changed)
    }

    /// Grant VIP tier; returns `false` when already unlimited
    pub async fn grant_vip(&self, actor: Option<UserId>, target: UserId) -> Result<bool> {
        let _guard = self.locks.acquire(target).await;
        let changed = self.ledger.set_tier(target, Tier::Vip)?;
        if changed {
            self.log(ActivityEntry::new(
                actor,
                ActivityAction::VipGranted,
                Some(target),
                String::new(),
            ));
        }
        Ok(changed)
    }

    /// Revoke runtime-granted VIP tier
    pub async fn revoke_vip(&self, actor: Option<UserId>, target: UserId) -> Result<bool> {
        let _guard = self.locks.acquire(target).await;
        let changed = self.ledger.set_tier(target, Tier::Standard)?;
        if changed {
            self.log(ActivityEntry::new(
                actor,
                ActivityAction::VipRevoked,
                Some(target),
                String::new(),
            ));
        }
        Ok(changed)
    }

    /// Terminate a user's session regardless of phase
    ///
    /// Waits behind any in-flight turn for the user, so a turn already
    /// holding the lock completes first. Returns `false` when the user
    /// had no session.
    pub async fn force_cancel(&self, actor: Option<UserId>, target: UserId) -> Result<bool> {
        let _guard = self.locks.acquire(target).await;
        let Some(session) = self.store.get(target)? else {
            return Ok(false);
        };
        self.remove_with_retry(target).await?;
        self.log(ActivityEntry::new(
            actor,
            ActivityAction::ForceCancelled,
            Some(target),
            format!("was {} v{}", session.phase, session.version),
        ));
        Ok(true)
    }

    /// Remove every session idle past the inactivity limit
    ///
    /// Each user's lock is taken for the duration of their check only,
    /// so the sweep never stalls unrelated turns.
    pub async fn expire_idle(&self) -> Result<usize> {
        let idle_limit = ChronoDuration::hours(self.session_timeout_hours as i64);
        let now = Utc::now();
        let mut expired = 0;

        for user in self.store.user_ids()? {
            let _guard = self.locks.acquire(user).await;
            let Some(session) = self.store.get(user)? else {
                continue;
            };
            if !session.is_expired(idle_limit, now) {
                continue;
            }
            tracing::info!(user = %user, session = %session.id, "sweeping idle session");
            self.remove_with_retry(user).await?;
            self.log(ActivityEntry::new(
                None,
                ActivityAction::SessionExpired,
                Some(user),
                format!("idle > {}h", self.session_timeout_hours),
            ));
            expired += 1;
        }
        Ok(expired)
    }

    /// Users eligible for a broadcast: everyone with a quota record who
    /// is not banned
    pub fn broadcast_targets(&self, actor: Option<UserId>) -> Result<Vec<UserId>> {
        let targets: Vec<UserId> = self
            .ledger
            .snapshot()?
            .into_iter()
            .filter(|record| !record.banned)
            .map(|record| record.owner)
            .collect();

        self.log(ActivityEntry::new(
            actor,
            ActivityAction::Broadcast,
            None,
            format!("{} targets", targets.len()),
        ));
        Ok(targets)
    }

    /// Operational counters for the stats command
    pub fn stats(&self) -> Result<StatsSummary> {
        let records = self.ledger.snapshot()?;
        Ok(StatsSummary {
            active_sessions: self.store.active_count()?,
            tracked_users: records.len(),
            requests_this_window: records.iter().map(|r| r.count as u64).sum(),
            banned_users: records.iter().filter(|r| r.banned).count(),
            vip_users: records.iter().filter(|r| r.tier == Tier::Vip).count(),
        })
    }

    /// Quota standing for one user
    pub fn usage(&self, user: UserId) -> Result<QuotaStatus> {
        self.ledger.status(user)
    }

    /// Currently banned users
    pub fn ban_list(&self) -> Result<Vec<UserId>> {
        Ok(self
            .ledger
            .snapshot()?
            .into_iter()
            .filter(|r| r.banned)
            .map(|r| r.owner)
            .collect())
    }

    /// Users with runtime-granted VIP tier
    pub fn vip_list(&self) -> Result<Vec<UserId>> {
        Ok(self
            .ledger
            .snapshot()?
            .into_iter()
            .filter(|r| r.tier == Tier::Vip)
            .map(|r| r.owner)
            .collect())
    }

    /// Every active session, for the sessions listing
    pub fn sessions(&self) -> Result<Vec<Session>> {
        self.store.all_sessions()
    }

    /// The most recent activity entries, newest first
    pub fn recent_activity(&self, limit: usize) -> Result<Vec<ActivityEntry>> {
        self.persistence.recent_activity(limit)
    }

    /// Drop activity entries older than the retention window
    pub fn purge_activity(&self, retention_days: u32) -> Result<usize> {
        let cutoff = Utc::now() - ChronoDuration::days(retention_days as i64);
        self.persistence.purge_activity_before(cutoff)
    }

    /// Remove a session with the same bounded, jittered retry every
    /// other committed-state write gets
    async fn remove_with_retry(&self, user: UserId) -> Result<()> {
        let attempts = self.persist_retry_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.store.remove(user) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(
                        user = %user,
                        attempt,
                        attempts,
                        error = %e,
                        "session removal failed"
                    );
                    last_error = Some(e);
                }
            }
            if attempt < attempts {
                let jitter = rand::rng().random_range(10..50u64);
                tokio::time::sleep(Duration::from_millis(attempt as u64 * jitter)).await;
            }
        }

        Err(last_error
            .unwrap_or_else(|| anyhow::anyhow!("session removal retry exhausted"))
            .context(format!(
                "failed to remove session for user {user} after {attempts} attempts"
            )))
    }

    fn log(&self, entry: ActivityEntry) {
        if let Err(e) = self.persistence.append_activity(&entry) {
            tracing::warn!(error = %e, "failed to append activity entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuotaConfig;
    use crate::quota::QuotaDecision;
    use crate::session::DocumentKind;
    use crate::storage::MemoryPersistence;

    fn plane() -> (AdminPlane, Arc<SessionStore>, Arc<QuotaLedger>) {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let config = QuotaConfig {
            monthly_request_limit: 5,
            admin_users: vec![900],
            vip_users: vec![],
        };
        let locks = Arc::new(LockTable::new());
        let ledger = Arc::new(QuotaLedger::new(&config, Arc::clone(&persistence)));
        let store = Arc::new(SessionStore::new(Arc::clone(&persistence)));
        let plane = AdminPlane::new(
            locks,
            Arc::clone(&ledger),
            Arc::clone(&store),
            persistence,
            1,
            3,
        );
        (plane, store, ledger)
    }

    #[tokio::test]
    async fn test_ban_denies_and_unban_restores() {
        let (plane, _store, ledger) = plane();
        assert!(plane.ban(Some(UserId(900)), UserId(1)).await.expect("ban"));
        assert!(matches!(
            ledger.check_and_reserve(UserId(1)).expect("check"),
            QuotaDecision::Denied(_)
        ));

        // Repeat ban is a no-op
        assert!(!plane.ban(None, UserId(1)).await.expect("ban again"));

        assert!(plane.unban(None, UserId(1)).await.expect("unban"));
        assert!(matches!(
            ledger.check_and_reserve(UserId(1)).expect("check"),
            QuotaDecision::Allowed { .. }
        ));
    }

    #[tokio::test]
    async fn test_admins_cannot_be_banned() {
        let (plane, _store, ledger) = plane();
        assert!(!plane.ban(None, UserId(900)).await.expect("ban"));
        assert!(!ledger.is_banned(UserId(900)).expect("is_banned"));
    }

    #[tokio::test]
    async fn test_ban_clears_runtime_vip() {
        let (plane, _store, _ledger) = plane();
        assert!(plane.grant_vip(None, UserId(2)).await.expect("grant"));
        assert_eq!(plane.vip_list().expect("vips"), vec![UserId(2)]);

        plane.ban(None, UserId(2)).await.expect("ban");
        assert!(plane.vip_list().expect("vips").is_empty());
        assert_eq!(plane.ban_list().expect("bans"), vec![UserId(2)]);
    }

    #[tokio::test]
    async fn test_force_cancel_removes_session() {
        let (plane, store, _ledger) = plane();
        store
            .create(Session::new(UserId(3), DocumentKind::Word))
            .expect("create");

        assert!(plane.force_cancel(None, UserId(3)).await.expect("cancel"));
        assert!(store.get(UserId(3)).expect("get").is_none());

        // Nothing left to cancel
        assert!(!plane.force_cancel(None, UserId(3)).await.expect("cancel"));
    }

    #[tokio::test]
    async fn test_expire_idle_sweeps_only_stale_sessions() {
        let (plane, store, _ledger) = plane();

        let fresh = Session::new(UserId(1), DocumentKind::Word);
        let mut stale = Session::new(UserId(2), DocumentKind::Pdf);
        stale.last_activity_at = Utc::now() - ChronoDuration::hours(3);
        store.create(fresh).expect("create");
        store.create(stale).expect("create");

        let expired = plane.expire_idle().await.expect("sweep");
        assert_eq!(expired, 1);
        assert!(store.get(UserId(1)).expect("get").is_some());
        assert!(store.get(UserId(2)).expect("get").is_none());
    }

    #[tokio::test]
    async fn test_broadcast_skips_banned_users() {
        let (plane, _store, ledger) = plane();
        ledger.check_and_reserve(UserId(1)).expect("seed");
        ledger.check_and_reserve(UserId(2)).expect("seed");
        plane.ban(None, UserId(2)).await.expect("ban");

        let targets = plane.broadcast_targets(None).expect("targets");
        assert_eq!(targets, vec![UserId(1)]);
    }

    #[tokio::test]
    async fn test_stats_counts() {
        let (plane, store, ledger) = plane();
        store
            .create(Session::new(UserId(1), DocumentKind::Excel))
            .expect("create");
        ledger.check_and_reserve(UserId(1)).expect("seed");
        ledger.check_and_reserve(UserId(1)).expect("seed");
        ledger.check_and_reserve(UserId(2)).expect("seed");
        plane.ban(None, UserId(3)).await.expect("ban");

        let stats = plane.stats().expect("stats");
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.tracked_users, 3);
        assert_eq!(stats.requests_this_window, 3);
        assert_eq!(stats.banned_users, 1);
    }
}
