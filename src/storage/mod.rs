//! Persistent record store
//!
//! The core treats persistence as a collaborator providing per-key
//! get/put/delete plus an atomic compare-and-swap on the session
//! `version`. [`SqlitePersistence`] is the production backend;
//! [`MemoryPersistence`] backs tests and embedders that do not need
//! durability.

use crate::error::{Result, ScrivenerError};
use crate::quota::{QuotaRecord, Tier};
use crate::session::types::{Session, UserId};
use anyhow::Context;
use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

pub mod types;
pub use types::{ActivityAction, ActivityEntry};

/// Store contract consumed by the session store, quota ledger, and
/// admin plane
///
/// Implementations must make `save_session` an atomic compare-and-swap
/// keyed on the session version and `save_quota` an atomic per-key
/// upsert. All methods are synchronous; callers hold no async lock that
/// other users wait on while calling them.
pub trait Persistence: Send + Sync {
    /// Load a user's persisted session, if any
    fn load_session(&self, user: UserId) -> Result<Option<Session>>;

    /// Insert a brand-new session row; fails if one already exists
    fn insert_session(&self, session: &Session) -> Result<()>;

    /// Replace a session row only if its stored version equals
    /// `expected_version`
    ///
    /// # Errors
    ///
    /// Returns `ScrivenerError::ConcurrencyConflict` when the stored
    /// version differs (stale write) or the row is gone.
    fn save_session(&self, session: &Session, expected_version: u64) -> Result<()>;

    /// Delete a user's session row; idempotent
    fn delete_session(&self, user: UserId) -> Result<()>;

    /// All users with a persisted session
    fn session_user_ids(&self) -> Result<Vec<UserId>>;

    /// Every persisted session (admin listing; not a per-turn path)
    fn all_sessions(&self) -> Result<Vec<Session>>;

    /// Load a user's quota record, if any
    fn load_quota(&self, user: UserId) -> Result<Option<QuotaRecord>>;

    /// Upsert a quota record
    fn save_quota(&self, record: &QuotaRecord) -> Result<()>;

    /// Every persisted quota record
    fn all_quota_records(&self) -> Result<Vec<QuotaRecord>>;

    /// Append one activity log entry
    fn append_activity(&self, entry: &ActivityEntry) -> Result<()>;

    /// The most recent `limit` activity entries, newest first
    fn recent_activity(&self, limit: usize) -> Result<Vec<ActivityEntry>>;

    /// Delete activity entries older than `cutoff`; returns the count
    fn purge_activity_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// SQLite-backed persistence
///
/// Sessions are stored as JSON blobs beside their version column so the
/// compare-and-swap is a single `UPDATE ... WHERE version = ?`.
pub struct SqlitePersistence {
    db_path: PathBuf,
}

impl SqlitePersistence {
    /// Create a store in the platform data directory
    ///
    /// The `SCRIVENER_DB` environment variable overrides the path,
    /// which makes it easy to point the binary at a test DB or an
    /// alternate file without touching the user's data dir.
    pub fn new() -> Result<Self> {
        if let Ok(override_path) = std::env::var("SCRIVENER_DB") {
            return Self::new_with_path(override_path);
        }

        let proj_dirs = ProjectDirs::from("com", "xbcsmith", "scrivener")
            .ok_or_else(|| ScrivenerError::Storage("Could not determine data directory".into()))?;

        let data_dir = proj_dirs.data_dir();
        std::fs::create_dir_all(data_dir)
            .context("Failed to create data directory")
            .map_err(|e| ScrivenerError::Storage(e.to_string()))?;

        Self::new_with_path(data_dir.join("scrivener.db"))
    }

    /// Create a store at an explicit database path
    ///
    /// # Examples
    ///
    /// ```
    /// use scrivener::storage::SqlitePersistence;
    ///
    /// let store = SqlitePersistence::new_with_path("/tmp/scrivener_doc.db").unwrap();
    /// ```
    pub fn new_with_path<P: Into<PathBuf>>(db_path: P) -> Result<Self> {
        let db_path = db_path.into();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .context("Failed to create parent directory for database")
                .map_err(|e| ScrivenerError::Storage(e.to_string()))?;
        }

        let store = Self { db_path };
        store.init()?;
        Ok(store)
    }

    /// The database path in use
    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }

    fn open(&self) -> Result<Connection> {
        Connection::open(&self.db_path)
            .context("Failed to open database")
            .map_err(|e| ScrivenerError::Storage(e.to_string()).into())
    }

    /// Initialize the database schema
    fn init(&self) -> Result<()> {
        let conn = self.open()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                user_id INTEGER PRIMARY KEY,
                version INTEGER NOT NULL,
                updated_at TEXT NOT NULL,
                data JSON NOT NULL
            );
            CREATE TABLE IF NOT EXISTS quota_records (
                user_id INTEGER PRIMARY KEY,
                window TEXT NOT NULL,
                count INTEGER NOT NULL,
                tier TEXT NOT NULL,
                banned INTEGER NOT NULL,
                first_request_at TEXT,
                last_request_at TEXT
            );
            CREATE TABLE IF NOT EXISTS activity_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                actor INTEGER,
                action TEXT NOT NULL,
                target INTEGER,
                details TEXT NOT NULL,
                at TEXT NOT NULL
            );",
        )
        .context("Failed to create tables")
        .map_err(|e| ScrivenerError::Storage(e.to_string()))?;

        Ok(())
    }
}

impl Persistence for SqlitePersistence {
    fn load_session(&self, user: UserId) -> Result<Option<Session>> {
        let conn = self.open()?;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM sessions WHERE user_id = ?",
                params![user.0],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query session")
            .map_err(|e| ScrivenerError::Storage(e.to_string()))?;

        match data {
            Some(json) => {
                let session: Session = serde_json::from_str(&json)
                    .context("Failed to deserialize session")
                    .map_err(|e| ScrivenerError::Storage(e.to_string()))?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    fn insert_session(&self, session: &Session) -> Result<()> {
        let conn = self.open()?;
        let json = serde_json::to_string(session)
            .context("Failed to serialize session")
            .map_err(|e| ScrivenerError::Storage(e.to_string()))?;

        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO sessions (user_id, version, updated_at, data)
                VALUES (?, ?, ?, ?)",
                params![
                    session.owner.0,
                    session.version as i64,
                    Utc::now().to_rfc3339(),
                    json
                ],
            )
            .context("Failed to insert session")
            .map_err(|e| ScrivenerError::Storage(e.to_string()))?;

        if inserted == 0 {
            return Err(ScrivenerError::Storage(format!(
                "active session already exists for user {}",
                session.owner
            ))
            .into());
        }
        Ok(())
    }

    fn save_session(&self, session: &Session, expected_version: u64) -> Result<()> {
        let conn = self.open()?;
        let json = serde_json::to_string(session)
            .context("Failed to serialize session")
            .map_err(|e| ScrivenerError::Storage(e.to_string()))?;

        let updated = conn
            .execute(
                "UPDATE sessions SET version = ?, updated_at = ?, data = ?
                WHERE user_id = ? AND version = ?",
                params![
                    session.version as i64,
                    Utc::now().to_rfc3339(),
                    json,
                    session.owner.0,
                    expected_version as i64
                ],
            )
            .context("Failed to update session")
            .map_err(|e| ScrivenerError::Storage(e.to_string()))?;

        if updated == 0 {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT version FROM sessions WHERE user_id = ?",
                    params![session.owner.0],
                    |row| row.get(0),
                )
                .optional()
                .context("Failed to query session version")
                .map_err(|e| ScrivenerError::Storage(e.to_string()))?;

            return Err(ScrivenerError::ConcurrencyConflict {
                expected: expected_version,
                found: found.unwrap_or(0) as u64,
            }
            .into());
        }
        Ok(())
    }

    fn delete_session(&self, user: UserId) -> Result<()> {
        let conn = self.open()?;
        conn.execute("DELETE FROM sessions WHERE user_id = ?", params![user.0])
            .context("Failed to delete session")
            .map_err(|e| ScrivenerError::Storage(e.to_string()))?;
        Ok(())
    }

    fn session_user_ids(&self) -> Result<Vec<UserId>> {
        let conn = self.open()?;
        let mut stmt = conn
            .prepare("SELECT user_id FROM sessions ORDER BY user_id")
            .context("Failed to prepare statement")
            .map_err(|e| ScrivenerError::Storage(e.to_string()))?;

        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))
            .context("Failed to query session users")
            .map_err(|e| ScrivenerError::Storage(e.to_string()))?
            .filter_map(|r| r.ok())
            .map(UserId)
            .collect();
        Ok(ids)
    }

    fn all_sessions(&self) -> Result<Vec<Session>> {
        let conn = self.open()?;
        let mut stmt = conn
            .prepare("SELECT data FROM sessions ORDER BY user_id")
            .context("Failed to prepare statement")
            .map_err(|e| ScrivenerError::Storage(e.to_string()))?;

        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("Failed to query sessions")
            .map_err(|e| ScrivenerError::Storage(e.to_string()))?;

        let mut sessions = Vec::new();
        for json in rows.flatten() {
            match serde_json::from_str::<Session>(&json) {
                Ok(session) => sessions.push(session),
                Err(e) => tracing::warn!("skipping undecodable session row: {e}"),
            }
        }
        Ok(sessions)
    }

    fn load_quota(&self, user: UserId) -> Result<Option<QuotaRecord>> {
        let conn = self.open()?;
        let record = conn
            .query_row(
                "SELECT window, count, tier, banned, first_request_at, last_request_at
                FROM quota_records WHERE user_id = ?",
                params![user.0],
                |row| {
                    let window: String = row.get(0)?;
                    let count: i64 = row.get(1)?;
                    let tier: String = row.get(2)?;
                    let banned: bool = row.get(3)?;
                    let first: Option<String> = row.get(4)?;
                    let last: Option<String> = row.get(5)?;
                    Ok((window, count, tier, banned, first, last))
                },
            )
            .optional()
            .context("Failed to query quota record")
            .map_err(|e| ScrivenerError::Storage(e.to_string()))?;

        Ok(record.map(|(window, count, tier, banned, first, last)| QuotaRecord {
            owner: user,
            window,
            count: count.max(0) as u32,
            tier: Tier::parse(&tier).unwrap_or(Tier::Standard),
            banned,
            first_request_at: first.and_then(|s| parse_rfc3339(&s)),
            last_request_at: last.and_then(|s| parse_rfc3339(&s)),
        }))
    }

    fn save_quota(&self, record: &QuotaRecord) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO quota_records
                (user_id, window, count, tier, banned, first_request_at, last_request_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                window = excluded.window,
                count = excluded.count,
                tier = excluded.tier,
                banned = excluded.banned,
                first_request_at = excluded.first_request_at,
                last_request_at = excluded.last_request_at",
            params![
                record.owner.0,
                record.window,
                record.count as i64,
                record.tier.as_str(),
                record.banned,
                record.first_request_at.map(|t| t.to_rfc3339()),
                record.last_request_at.map(|t| t.to_rfc3339()),
            ],
        )
        .context("Failed to upsert quota record")
        .map_err(|e| ScrivenerError::Storage(e.to_string()))?;
        Ok(())
    }

    fn all_quota_records(&self) -> Result<Vec<QuotaRecord>> {
        let conn = self.open()?;
        let mut stmt = conn
            .prepare(
                "SELECT user_id, window, count, tier, banned, first_request_at, last_request_at
                FROM quota_records ORDER BY user_id",
            )
            .context("Failed to prepare statement")
            .map_err(|e| ScrivenerError::Storage(e.to_string()))?;

        let rows = stmt
            .query_map([], |row| {
                let user_id: i64 = row.get(0)?;
                let window: String = row.get(1)?;
                let count: i64 = row.get(2)?;
                let tier: String = row.get(3)?;
                let banned: bool = row.get(4)?;
                let first: Option<String> = row.get(5)?;
                let last: Option<String> = row.get(6)?;
                Ok(QuotaRecord {
                    owner: UserId(user_id),
                    window,
                    count: count.max(0) as u32,
                    tier: Tier::parse(&tier).unwrap_or(Tier::Standard),
                    banned,
                    first_request_at: first.and_then(|s| parse_rfc3339(&s)),
                    last_request_at: last.and_then(|s| parse_rfc3339(&s)),
                })
            })
            .context("Failed to query quota records")
            .map_err(|e| ScrivenerError::Storage(e.to_string()))?;

        Ok(rows.flatten().collect())
    }

    fn append_activity(&self, entry: &ActivityEntry) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO activity_log (actor, action, target, details, at)
            VALUES (?, ?, ?, ?, ?)",
            params![
                entry.actor.map(|u| u.0),
                entry.action.as_str(),
                entry.target.map(|u| u.0),
                entry.details,
                entry.at.to_rfc3339(),
            ],
        )
        .context("Failed to append activity")
        .map_err(|e| ScrivenerError::Storage(e.to_string()))?;
        Ok(())
    }

    fn recent_activity(&self, limit: usize) -> Result<Vec<ActivityEntry>> {
        let conn = self.open()?;
        let mut stmt = conn
            .prepare(
                "SELECT actor, action, target, details, at
                FROM activity_log ORDER BY id DESC LIMIT ?",
            )
            .context("Failed to prepare statement")
            .map_err(|e| ScrivenerError::Storage(e.to_string()))?;

        let rows = stmt
            .query_map(params![limit as i64], |row| {
                let actor: Option<i64> = row.get(0)?;
                let action: String = row.get(1)?;
                let target: Option<i64> = row.get(2)?;
                let details: String = row.get(3)?;
                let at: String = row.get(4)?;
                Ok((actor, action, target, details, at))
            })
            .context("Failed to query activity")
            .map_err(|e| ScrivenerError::Storage(e.to_string()))?;

        let mut entries = Vec::new();
        for (actor, action, target, details, at) in rows.flatten() {
            let Some(action) = ActivityAction::parse(&action) else {
                tracing::warn!("skipping unknown activity action: {action}");
                continue;
            };
            entries.push(ActivityEntry {
                actor: actor.map(UserId),
                action,
                target: target.map(UserId),
                details,
                at: parse_rfc3339(&at).unwrap_or_else(Utc::now),
            });
        }
        Ok(entries)
    }

    fn purge_activity_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.open()?;
        let removed = conn
            .execute(
                "DELETE FROM activity_log WHERE at < ?",
                params![cutoff.to_rfc3339()],
            )
            .context("Failed to purge activity")
            .map_err(|e| ScrivenerError::Storage(e.to_string()))?;
        Ok(removed)
    }
}

fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// In-memory persistence backend
///
/// Implements the same contract as [`SqlitePersistence`] over maps.
/// `fail_session_saves` lets tests exercise the coordinator's bounded
/// persistence retry.
#[derive(Default)]
pub struct MemoryPersistence {
    sessions: Mutex<BTreeMap<UserId, (u64, String)>>,
    quota: Mutex<BTreeMap<UserId, QuotaRecord>>,
    activity: Mutex<VecDeque<ActivityEntry>>,
    fail_session_saves: AtomicBool,
    fail_session_deletes: AtomicU32,
}

impl MemoryPersistence {
    /// Create an empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `save_session`/`insert_session` fail until reset
    pub fn set_fail_session_saves(&self, fail: bool) {
        self.fail_session_saves.store(fail, Ordering::SeqCst);
    }

    /// Make the next `count` `delete_session` calls fail
    pub fn fail_next_session_deletes(&self, count: u32) {
        self.fail_session_deletes.store(count, Ordering::SeqCst);
    }

    fn check_failpoint(&self) -> Result<()> {
        if self.fail_session_saves.load(Ordering::SeqCst) {
            return Err(ScrivenerError::Storage("injected save failure".into()).into());
        }
        Ok(())
    }
}

impl Persistence for MemoryPersistence {
    fn load_session(&self, user: UserId) -> Result<Option<Session>> {
        let sessions = self.sessions.lock().expect("sessions poisoned");
        match sessions.get(&user) {
            Some((_, json)) => Ok(Some(serde_json::from_str(json)?)),
            None => Ok(None),
        }
    }

    fn insert_session(&self, session: &Session) -> Result<()> {
        self.check_failpoint()?;
        let mut sessions = self.sessions.lock().expect("sessions poisoned");
        if sessions.contains_key(&session.owner) {
            return Err(ScrivenerError::Storage(format!(
                "active session already exists for user {}",
                session.owner
            ))
            .into());
        }
        sessions.insert(
            session.owner,
            (session.version, serde_json::to_string(session)?),
        );
        Ok(())
    }

    fn save_session(&self, session: &Session, expected_version: u64) -> Result<()> {
        self.check_failpoint()?;
        let mut sessions = self.sessions.lock().expect("sessions poisoned");
        match sessions.get_mut(&session.owner) {
            Some((version, json)) if *version == expected_version => {
                *version = session.version;
                *json = serde_json::to_string(session)?;
                Ok(())
            }
            Some((version, _)) => Err(ScrivenerError::ConcurrencyConflict {
                expected: expected_version,
                found: *version,
            }
            .into()),
            None => Err(ScrivenerError::ConcurrencyConflict {
                expected: expected_version,
                found: 0,
            }
            .into()),
        }
    }

    fn delete_session(&self, user: UserId) -> Result<()> {
        let remaining = self.fail_session_deletes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_session_deletes.store(remaining - 1, Ordering::SeqCst);
            return Err(ScrivenerError::Storage("injected delete failure".into()).into());
        }
        self.sessions.lock().expect("sessions poisoned").remove(&user);
        Ok(())
    }

    fn session_user_ids(&self) -> Result<Vec<UserId>> {
        Ok(self
            .sessions
            .lock()
            .expect("sessions poisoned")
            .keys()
            .copied()
            .collect())
    }

    fn all_sessions(&self) -> Result<Vec<Session>> {
        let sessions = self.sessions.lock().expect("sessions poisoned");
        let mut all = Vec::with_capacity(sessions.len());
        for (_, json) in sessions.values() {
            all.push(serde_json::from_str(json)?);
        }
        Ok(all)
    }

    fn load_quota(&self, user: UserId) -> Result<Option<QuotaRecord>> {
        Ok(self.quota.lock().expect("quota poisoned").get(&user).cloned())
    }

    fn save_quota(&self, record: &QuotaRecord) -> Result<()> {
        self.quota
            .lock()
            .expect("quota poisoned")
            .insert(record.owner, record.clone());
        Ok(())
    }

    fn all_quota_records(&self) -> Result<Vec<QuotaRecord>> {
        Ok(self
            .quota
            .lock()
            .expect("quota poisoned")
            .values()
            .cloned()
            .collect())
    }

    fn append_activity(&self, entry: &ActivityEntry) -> Result<()> {
        self.activity
            .lock()
            .expect("activity poisoned")
            .push_back(entry.clone());
        Ok(())
    }

    fn recent_activity(&self, limit: usize) -> Result<Vec<ActivityEntry>> {
        let activity = self.activity.lock().expect("activity poisoned");
        Ok(activity.iter().rev().take(limit).cloned().collect())
    }

    fn purge_activity_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut activity = self.activity.lock().expect("activity poisoned");
        let before = activity.len();
        activity.retain(|e| e.at >= cutoff);
        Ok(before - activity.len())
    }
}
