//! Quota ledger: monthly request counting, tiers, and bans
//!
//! Tracks per-user request counts against a calendar-month window with
//! a VIP bypass and an admin-managed ban list. Reservation is
//! optimistic: a slot is consumed at the start of a turn and refunded
//! only when the turn fails before any externally visible effect.

use crate::config::QuotaConfig;
use crate::error::Result;
use crate::session::types::UserId;
use crate::storage::Persistence;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Privilege tier of a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Bounded by the monthly ceiling
    Standard,
    /// Bypasses the numeric ceiling entirely
    Vip,
}

impl Tier {
    /// Stable string form used in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Standard => "standard",
            Tier::Vip => "vip",
        }
    }

    /// Parse the stable string form
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "standard" => Some(Tier::Standard),
            "vip" => Some(Tier::Vip),
            _ => None,
        }
    }
}

/// Per-user quota state for one billing window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaRecord {
    /// Owning user
    pub owner: UserId,
    /// Calendar-month window in `YYYY-MM` form
    pub window: String,
    /// Requests reserved in the current window
    pub count: u32,
    /// Persisted tier (config-listed VIPs are applied on top)
    pub tier: Tier,
    /// Whether the user is banned
    pub banned: bool,
    /// First request in the current window
    pub first_request_at: Option<DateTime<Utc>>,
    /// Most recent request in the current window
    pub last_request_at: Option<DateTime<Utc>>,
}

impl QuotaRecord {
    /// Create a fresh record for `window`
    pub fn new(owner: UserId, window: String) -> Self {
        Self {
            owner,
            window,
            count: 0,
            tier: Tier::Standard,
            banned: false,
            first_request_at: None,
            last_request_at: None,
        }
    }
}

/// Why a turn was denied before any state mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    /// The user is on the ban list
    Banned,
    /// The monthly ceiling is exhausted
    QuotaExceeded {
        /// Requests already counted this window
        used: u32,
        /// The configured ceiling
        limit: u32,
    },
}

/// Outcome of a reservation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    /// One slot reserved; `remaining` is `None` for VIP users
    Allowed {
        /// Slots left in the window after this reservation
        remaining: Option<u32>,
    },
    /// No slot reserved
    Denied(DenialReason),
}

/// Point-in-time quota status for a user, for `/usage`-style queries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaStatus {
    /// The user
    pub user: UserId,
    /// Requests counted this window
    pub used: u32,
    /// Monthly ceiling; `None` means unlimited (VIP)
    pub limit: Option<u32>,
    /// Slots remaining; `None` means unlimited
    pub remaining: Option<u32>,
    /// Effective tier after config overlays
    pub tier: Tier,
    /// Whether the user is banned
    pub banned: bool,
    /// Current window
    pub window: String,
    /// Date the window rolls over (`YYYY-MM-DD`)
    pub reset_date: String,
}

/// Thread-safe monthly quota ledger
///
/// Records are sharded behind per-user mutexes: the outer map mutex
/// only guards the map structure and is never held across persistence
/// I/O, so unrelated users never serialize on each other's reads or
/// write-throughs. The per-user mutex covers the whole
/// read-modify-write, so concurrent `check_and_reserve` calls for the
/// same user cannot both observe the last free slot. Records are loaded
/// lazily from persistence and every mutation is written through inside
/// the same per-user critical section.
pub struct QuotaLedger {
    limit: u32,
    admin_users: HashSet<i64>,
    vip_users: HashSet<i64>,
    records: Mutex<HashMap<UserId, Arc<Mutex<Option<QuotaRecord>>>>>,
    persistence: Arc<dyn Persistence>,
}

impl QuotaLedger {
    /// Create a ledger from quota configuration
    pub fn new(config: &QuotaConfig, persistence: Arc<dyn Persistence>) -> Self {
        Self {
            limit: config.monthly_request_limit,
            admin_users: config.admin_users.iter().copied().collect(),
            vip_users: config.vip_users.iter().copied().collect(),
            records: Mutex::new(HashMap::new()),
            persistence,
        }
    }

    /// The configured monthly ceiling for standard-tier users
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Whether a user id is config-listed as an admin
    pub fn is_admin(&self, user: UserId) -> bool {
        self.admin_users.contains(&user.0)
    }

    fn config_vip(&self, user: UserId) -> bool {
        self.vip_users.contains(&user.0) || self.admin_users.contains(&user.0)
    }

    fn effective_tier(&self, record: &QuotaRecord) -> Tier {
        if self.config_vip(record.owner) {
            Tier::Vip
        } else {
            record.tier
        }
    }

    /// Current calendar-month window string (`YYYY-MM`)
    pub fn window_for(now: DateTime<Utc>) -> String {
        format!("{:04}-{:02}", now.year(), now.month())
    }

    /// First day of the next window (`YYYY-MM-DD`)
    pub fn reset_date(now: DateTime<Utc>) -> String {
        let (year, month) = if now.month() == 12 {
            (now.year() + 1, 1)
        } else {
            (now.year(), now.month() + 1)
        };
        format!("{year:04}-{month:02}-01")
    }

    /// Run `f` against the user's record with rollover applied, then
    /// persist when `f` reports a mutation. The whole read-modify-write
    /// is atomic with respect to every other ledger call for the same
    /// user; the map mutex is released before any persistence I/O so
    /// other users proceed unhindered.
    fn with_record<R>(
        &self,
        user: UserId,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut QuotaRecord) -> (R, bool),
    ) -> Result<R> {
        let slot = {
            let mut records = self.records.lock().expect("quota ledger poisoned");
            Arc::clone(records.entry(user).or_default())
        };
        let mut guard = slot.lock().expect("quota record poisoned");

        if guard.is_none() {
            let loaded = self
                .persistence
                .load_quota(user)?
                .unwrap_or_else(|| QuotaRecord::new(user, Self::window_for(now)));
            *guard = Some(loaded);
        }
        let record = guard.as_mut().expect("record just loaded");

        // Calendar-month rollover, atomic with the check that follows
        let window = Self::window_for(now);
        let mut dirty = false;
        if record.window != window {
            tracing::info!(user = %user, window = %window, "quota window rollover");
            record.window = window;
            record.count = 0;
            record.first_request_at = None;
            record.last_request_at = None;
            dirty = true;
        }

        let (result, mutated) = f(record);
        if mutated || dirty {
            self.persistence.save_quota(record)?;
        }
        Ok(result)
    }

    /// Check the user's standing and reserve one slot
    ///
    /// Banned users are always denied regardless of tier or count; VIP
    /// users are always allowed unless banned. The count is incremented
    /// for every allowed call (VIP included, for stats). Check and
    /// increment happen in one critical section: two concurrent calls
    /// can never both take the last free slot.
    pub fn check_and_reserve(&self, user: UserId) -> Result<QuotaDecision> {
        self.check_and_reserve_at(user, Utc::now())
    }

    /// `check_and_reserve` with an explicit clock, for tests
    pub fn check_and_reserve_at(&self, user: UserId, now: DateTime<Utc>) -> Result<QuotaDecision> {
        let limit = self.limit;
        let decision = self.with_record(user, now, |record| {
            if record.banned {
                return (QuotaDecision::Denied(DenialReason::Banned), false);
            }

            let vip = self.effective_tier(record) == Tier::Vip;
            if !vip && record.count >= limit {
                return (
                    QuotaDecision::Denied(DenialReason::QuotaExceeded {
                        used: record.count,
                        limit,
                    }),
                    false,
                );
            }

            record.count += 1;
            record.last_request_at = Some(now);
            if record.first_request_at.is_none() {
                record.first_request_at = Some(now);
            }
            let remaining = if vip {
                None
            } else {
                Some(limit.saturating_sub(record.count))
            };
            (QuotaDecision::Allowed { remaining }, true)
        })?;
        tracing::debug!(user = %user, ?decision, "quota decision");
        Ok(decision)
    }

    /// Refund one reserved slot
    ///
    /// Compensating call for a reservation whose turn failed before any
    /// externally visible effect. A no-op when the count is already
    /// zero or the window has rolled since the reservation.
    pub fn release(&self, user: UserId) -> Result<()> {
        self.release_at(user, Utc::now())
    }

    /// `release` with an explicit clock, for tests
    pub fn release_at(&self, user: UserId, now: DateTime<Utc>) -> Result<()> {
        self.with_record(user, now, |record| {
            if record.count > 0 {
                record.count -= 1;
                (true, true)
            } else {
                (false, false)
            }
        })
        .map(|refunded| {
            if refunded {
                tracing::debug!(user = %user, "quota slot refunded");
            }
        })
    }

    /// Set a user's persisted tier
    ///
    /// Returns `false` when the tier was already set, or when granting
    /// VIP to a config-listed VIP/admin (already unlimited).
    pub fn set_tier(&self, user: UserId, tier: Tier) -> Result<bool> {
        if tier == Tier::Vip && self.config_vip(user) {
            return Ok(false);
        }
        let changed = self.with_record(user, Utc::now(), |record| {
            if record.tier == tier {
                (false, false)
            } else {
                record.tier = tier;
                (true, true)
            }
        })?;
        if changed {
            tracing::info!(user = %user, tier = tier.as_str(), "tier updated");
        }
        Ok(changed)
    }

    /// Ban or unban a user
    ///
    /// Banning clears a runtime-granted VIP tier. Config-listed admins
    /// cannot be banned. Takes effect immediately for any turn not yet
    /// past its reservation check. Returns `false` when nothing changed.
    pub fn set_banned(&self, user: UserId, banned: bool) -> Result<bool> {
        if banned && self.is_admin(user) {
            tracing::warn!(user = %user, "refusing to ban an admin");
            return Ok(false);
        }
        let changed = self.with_record(user, Utc::now(), |record| {
            if record.banned == banned {
                (false, false)
            } else {
                record.banned = banned;
                if banned {
                    record.tier = Tier::Standard;
                }
                (true, true)
            }
        })?;
        if changed {
            tracing::info!(user = %user, banned, "ban flag updated");
        }
        Ok(changed)
    }

    /// Whether the user is currently banned
    pub fn is_banned(&self, user: UserId) -> Result<bool> {
        self.with_record(user, Utc::now(), |record| (record.banned, false))
    }

    /// Full quota status for a user
    pub fn status(&self, user: UserId) -> Result<QuotaStatus> {
        let now = Utc::now();
        let limit = self.limit;
        self.with_record(user, now, |record| {
            let tier = if self.config_vip(record.owner) {
                Tier::Vip
            } else {
                record.tier
            };
            let (limit, remaining) = match tier {
                Tier::Vip => (None, None),
                Tier::Standard => (Some(limit), Some(limit.saturating_sub(record.count))),
            };
            (
                QuotaStatus {
                    user,
                    used: record.count,
                    limit,
                    remaining,
                    tier,
                    banned: record.banned,
                    window: record.window.clone(),
                    reset_date: Self::reset_date(now),
                },
                false,
            )
        })
    }

    /// Consistent snapshot of every known quota record
    ///
    /// Backed by persistence with in-memory records overlaid; intended
    /// for stats and broadcast target enumeration, not per-turn checks.
    pub fn snapshot(&self) -> Result<Vec<QuotaRecord>> {
        let mut by_user: HashMap<UserId, QuotaRecord> = self
            .persistence
            .all_quota_records()?
            .into_iter()
            .map(|r| (r.owner, r))
            .collect();
        let slots: Vec<Arc<Mutex<Option<QuotaRecord>>>> = {
            let records = self.records.lock().expect("quota ledger poisoned");
            records.values().map(Arc::clone).collect()
        };
        for slot in slots {
            let guard = slot.lock().expect("quota record poisoned");
            if let Some(record) = guard.as_ref() {
                by_user.insert(record.owner, record.clone());
            }
        }
        let mut all: Vec<QuotaRecord> = by_user.into_values().collect();
        all.sort_by_key(|r| r.owner);
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::Session;
    use crate::storage::{ActivityEntry, MemoryPersistence};
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn ledger_with_limit(limit: u32) -> QuotaLedger {
        let config = QuotaConfig {
            monthly_request_limit: limit,
            admin_users: vec![900],
            vip_users: vec![901],
        };
        QuotaLedger::new(&config, Arc::new(MemoryPersistence::new()))
    }

    #[test]
    fn test_window_formatting() {
        let now = Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap();
        assert_eq!(QuotaLedger::window_for(now), "2026-03");
        assert_eq!(QuotaLedger::reset_date(now), "2026-04-01");
    }

    #[test]
    fn test_reset_date_wraps_december() {
        let now = Utc.with_ymd_and_hms(2026, 12, 2, 0, 0, 0).unwrap();
        assert_eq!(QuotaLedger::reset_date(now), "2027-01-01");
    }

    #[test]
    fn test_reserve_until_ceiling() {
        let ledger = ledger_with_limit(3);
        let user = UserId(1);
        for i in 0..3 {
            let decision = ledger.check_and_reserve(user).expect("reserve");
            assert_eq!(
                decision,
                QuotaDecision::Allowed {
                    remaining: Some(2 - i)
                }
            );
        }
        let denied = ledger.check_and_reserve(user).expect("reserve");
        assert_eq!(
            denied,
            QuotaDecision::Denied(DenialReason::QuotaExceeded { used: 3, limit: 3 })
        );
    }

    #[test]
    fn test_vip_bypasses_ceiling() {
        let ledger = ledger_with_limit(2);
        let user = UserId(5);
        ledger.set_tier(user, Tier::Vip).expect("set tier");
        for _ in 0..20 {
            let decision = ledger.check_and_reserve(user).expect("reserve");
            assert_eq!(decision, QuotaDecision::Allowed { remaining: None });
        }
    }

    #[test]
    fn test_config_vip_and_admin_are_unlimited() {
        let ledger = ledger_with_limit(1);
        for user in [UserId(900), UserId(901)] {
            for _ in 0..5 {
                let decision = ledger.check_and_reserve(user).expect("reserve");
                assert_eq!(decision, QuotaDecision::Allowed { remaining: None });
            }
        }
    }

    #[test]
    fn test_banned_always_denied() {
        let ledger = ledger_with_limit(10);
        let user = UserId(7);
        ledger.set_tier(user, Tier::Vip).expect("set tier");
        assert!(ledger.set_banned(user, true).expect("ban"));
        let decision = ledger.check_and_reserve(user).expect("reserve");
        assert_eq!(decision, QuotaDecision::Denied(DenialReason::Banned));
    }

    #[test]
    fn test_ban_clears_runtime_vip() {
        let ledger = ledger_with_limit(10);
        let user = UserId(7);
        ledger.set_tier(user, Tier::Vip).expect("set tier");
        ledger.set_banned(user, true).expect("ban");
        ledger.set_banned(user, false).expect("unban");
        let status = ledger.status(user).expect("status");
        assert_eq!(status.tier, Tier::Standard);
        assert!(!status.banned);
    }

    #[test]
    fn test_cannot_ban_admin() {
        let ledger = ledger_with_limit(10);
        assert!(!ledger.set_banned(UserId(900), true).expect("ban"));
        assert!(!ledger.is_banned(UserId(900)).expect("is_banned"));
    }

    #[test]
    fn test_release_refunds_one_slot() {
        let ledger = ledger_with_limit(2);
        let user = UserId(3);
        ledger.check_and_reserve(user).expect("reserve");
        ledger.check_and_reserve(user).expect("reserve");
        assert!(matches!(
            ledger.check_and_reserve(user).expect("reserve"),
            QuotaDecision::Denied(_)
        ));

        ledger.release(user).expect("release");
        assert!(matches!(
            ledger.check_and_reserve(user).expect("reserve"),
            QuotaDecision::Allowed { .. }
        ));
    }

    #[test]
    fn test_release_at_zero_is_noop() {
        let ledger = ledger_with_limit(2);
        ledger.release(UserId(4)).expect("release");
        let status = ledger.status(UserId(4)).expect("status");
        assert_eq!(status.used, 0);
    }

    #[test]
    fn test_window_rollover_resets_count() {
        let ledger = ledger_with_limit(2);
        let user = UserId(8);
        let march = Utc.with_ymd_and_hms(2026, 3, 30, 0, 0, 0).unwrap();
        let april = Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap();

        ledger.check_and_reserve_at(user, march).expect("reserve");
        ledger.check_and_reserve_at(user, march).expect("reserve");
        assert!(matches!(
            ledger.check_and_reserve_at(user, march).expect("reserve"),
            QuotaDecision::Denied(_)
        ));

        // Arriving after the window boundary triggers a reset before
        // the count check
        let decision = ledger.check_and_reserve_at(user, april).expect("reserve");
        assert_eq!(
            decision,
            QuotaDecision::Allowed {
                remaining: Some(1)
            }
        );
        let status = ledger.status(user).expect("status");
        assert_eq!(status.window, QuotaLedger::window_for(Utc::now()));
    }

    #[test]
    fn test_status_reports_standard_budget() {
        let ledger = ledger_with_limit(10);
        let user = UserId(6);
        ledger.check_and_reserve(user).expect("reserve");
        let status = ledger.status(user).expect("status");
        assert_eq!(status.used, 1);
        assert_eq!(status.limit, Some(10));
        assert_eq!(status.remaining, Some(9));
        assert_eq!(status.tier, Tier::Standard);
    }

    #[test]
    fn test_records_survive_ledger_restart() {
        let persistence: Arc<MemoryPersistence> = Arc::new(MemoryPersistence::new());
        let config = QuotaConfig {
            monthly_request_limit: 5,
            admin_users: vec![],
            vip_users: vec![],
        };
        let user = UserId(11);
        {
            let ledger = QuotaLedger::new(&config, Arc::clone(&persistence) as Arc<dyn Persistence>);
            ledger.check_and_reserve(user).expect("reserve");
            ledger.check_and_reserve(user).expect("reserve");
        }
        let ledger = QuotaLedger::new(&config, persistence as Arc<dyn Persistence>);
        let status = ledger.status(user).expect("status");
        assert_eq!(status.used, 2);
    }

    #[test]
    fn test_snapshot_lists_all_records() {
        let ledger = ledger_with_limit(5);
        ledger.check_and_reserve(UserId(1)).expect("reserve");
        ledger.check_and_reserve(UserId(2)).expect("reserve");
        let snapshot = ledger.snapshot().expect("snapshot");
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].owner, UserId(1));
    }

    /// Delegating backend that stalls quota write-throughs for one user
    struct SlowQuotaSaves {
        inner: MemoryPersistence,
        slow_user: UserId,
        entered: Arc<AtomicBool>,
    }

    impl Persistence for SlowQuotaSaves {
        fn load_session(&self, user: UserId) -> Result<Option<Session>> {
            self.inner.load_session(user)
        }
        fn insert_session(&self, session: &Session) -> Result<()> {
            self.inner.insert_session(session)
        }
        fn save_session(&self, session: &Session, expected_version: u64) -> Result<()> {
            self.inner.save_session(session, expected_version)
        }
        fn delete_session(&self, user: UserId) -> Result<()> {
            self.inner.delete_session(user)
        }
        fn session_user_ids(&self) -> Result<Vec<UserId>> {
            self.inner.session_user_ids()
        }
        fn all_sessions(&self) -> Result<Vec<Session>> {
            self.inner.all_sessions()
        }
        fn load_quota(&self, user: UserId) -> Result<Option<QuotaRecord>> {
            self.inner.load_quota(user)
        }
        fn save_quota(&self, record: &QuotaRecord) -> Result<()> {
            if record.owner == self.slow_user {
                self.entered.store(true, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(300));
            }
            self.inner.save_quota(record)
        }
        fn all_quota_records(&self) -> Result<Vec<QuotaRecord>> {
            self.inner.all_quota_records()
        }
        fn append_activity(&self, entry: &ActivityEntry) -> Result<()> {
            self.inner.append_activity(entry)
        }
        fn recent_activity(&self, limit: usize) -> Result<Vec<ActivityEntry>> {
            self.inner.recent_activity(limit)
        }
        fn purge_activity_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
            self.inner.purge_activity_before(cutoff)
        }
    }

    #[test]
    fn test_slow_write_for_one_user_does_not_stall_others() {
        let entered = Arc::new(AtomicBool::new(false));
        let persistence = Arc::new(SlowQuotaSaves {
            inner: MemoryPersistence::new(),
            slow_user: UserId(1),
            entered: Arc::clone(&entered),
        });
        let config = QuotaConfig {
            monthly_request_limit: 10,
            admin_users: vec![],
            vip_users: vec![],
        };
        let ledger = Arc::new(QuotaLedger::new(&config, persistence as Arc<dyn Persistence>));

        let slow = Arc::clone(&ledger);
        let handle = std::thread::spawn(move || {
            slow.check_and_reserve(UserId(1)).expect("reserve");
        });

        while !entered.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }

        // User 1 is mid write-through; user 2's reservation must not
        // queue behind it
        let started = std::time::Instant::now();
        ledger.check_and_reserve(UserId(2)).expect("reserve");
        assert!(
            started.elapsed() < std::time::Duration::from_millis(200),
            "unrelated user waited on another user's quota write"
        );

        handle.join().expect("thread panicked");
    }

    #[test]
    fn test_tier_string_roundtrip() {
        assert_eq!(Tier::parse(Tier::Vip.as_str()), Some(Tier::Vip));
        assert_eq!(Tier::parse(Tier::Standard.as_str()), Some(Tier::Standard));
        assert_eq!(Tier::parse("gold"), None);
    }
}
