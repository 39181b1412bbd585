//! Session store
//!
//! Write-through cache over the persistence backend. Every mutating
//! call happens while the caller holds the owner's entry in the
//! [`LockTable`](crate::session::locks::LockTable), so the cache and
//! the backing store never disagree about a user's session.
//!
//! The store enforces the one-active-session invariant: `create` fails
//! if a session row already exists for the user, in memory or on disk.

use crate::error::{Result, ScrivenerError};
use crate::session::types::{Session, UserId};
use crate::storage::Persistence;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub struct SessionStore {
    cache: Mutex<HashMap<UserId, Session>>,
    persistence: Arc<dyn Persistence>,
}

impl SessionStore {
    /// Create a store over the given backend
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            persistence,
        }
    }

    /// The user's active session, if any
    ///
    /// Falls back to the backend on a cache miss so sessions survive a
    /// process restart.
    pub fn get(&self, user: UserId) -> Result<Option<Session>> {
        {
            let cache = self.cache.lock().expect("session cache poisoned");
            if let Some(session) = cache.get(&user) {
                return Ok(Some(session.clone()));
            }
        }

        let loaded = self.persistence.load_session(user)?;
        if let Some(session) = &loaded {
            let mut cache = self.cache.lock().expect("session cache poisoned");
            cache.entry(user).or_insert_with(|| session.clone());
        }
        Ok(loaded)
    }

    /// Insert a brand-new session
    ///
    /// # Errors
    ///
    /// Fails if the user already has an active session; the caller maps
    /// that to an invalid-turn result.
    pub fn create(&self, session: Session) -> Result<()> {
        if self.get(session.owner)?.is_some() {
            return Err(ScrivenerError::Storage(format!(
                "active session already exists for user {}",
                session.owner
            ))
            .into());
        }

        self.persistence.insert_session(&session)?;
        let mut cache = self.cache.lock().expect("session cache poisoned");
        cache.insert(session.owner, session);
        Ok(())
    }

    /// Commit a mutated session, compare-and-swap on `expected_version`
    ///
    /// The backend write happens first; the cache is only updated once
    /// the write succeeded, so a failed commit leaves the cached session
    /// at its previous state.
    ///
    /// # Errors
    ///
    /// Propagates `ScrivenerError::ConcurrencyConflict` from the backend
    /// when the stored version is not `expected_version`.
    pub fn commit(&self, session: &Session, expected_version: u64) -> Result<()> {
        self.persistence.save_session(session, expected_version)?;
        let mut cache = self.cache.lock().expect("session cache poisoned");
        cache.insert(session.owner, session.clone());
        Ok(())
    }

    /// Remove the user's session; idempotent
    pub fn remove(&self, user: UserId) -> Result<()> {
        self.persistence.delete_session(user)?;
        let mut cache = self.cache.lock().expect("session cache poisoned");
        cache.remove(&user);
        Ok(())
    }

    /// Users with an active session, cached or persisted
    pub fn user_ids(&self) -> Result<Vec<UserId>> {
        let mut ids = self.persistence.session_user_ids()?;
        {
            let cache = self.cache.lock().expect("session cache poisoned");
            ids.extend(cache.keys().copied());
        }
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    /// Number of active sessions
    pub fn active_count(&self) -> Result<usize> {
        Ok(self.user_ids()?.len())
    }

    /// Every active session (admin listing)
    pub fn all_sessions(&self) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();
        for user in self.user_ids()? {
            if let Some(session) = self.get(user)? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::DocumentKind;
    use crate::storage::MemoryPersistence;

    fn store() -> SessionStore {
        SessionStore::new(Arc::new(MemoryPersistence::new()))
    }

    #[test]
    fn test_create_and_get() {
        let store = store();
        let session = Session::new(UserId(1), DocumentKind::Word);
        store.create(session).expect("create");

        let loaded = store.get(UserId(1)).expect("get").expect("some");
        assert_eq!(loaded.owner, UserId(1));
        assert_eq!(store.active_count().expect("count"), 1);
    }

    #[test]
    fn test_one_active_session_per_user() {
        let store = store();
        store
            .create(Session::new(UserId(1), DocumentKind::Word))
            .expect("create");
        assert!(store
            .create(Session::new(UserId(1), DocumentKind::Pdf))
            .is_err());

        // The original session is untouched
        let loaded = store.get(UserId(1)).expect("get").expect("some");
        assert_eq!(loaded.document_kind, DocumentKind::Word);
    }

    #[test]
    fn test_commit_rejects_stale_version() {
        let store = store();
        let mut session = Session::new(UserId(1), DocumentKind::Word);
        store.create(session.clone()).expect("create");

        session.version = 1;
        store.commit(&session, 0).expect("commit");

        // A second writer holding the old version must fail, and the
        // cached session must keep the committed state
        let mut stale = session.clone();
        stale.version = 5;
        assert!(store.commit(&stale, 0).is_err());
        let loaded = store.get(UserId(1)).expect("get").expect("some");
        assert_eq!(loaded.version, 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let store = store();
        store
            .create(Session::new(UserId(1), DocumentKind::Excel))
            .expect("create");
        store.remove(UserId(1)).expect("remove");
        store.remove(UserId(1)).expect("remove again");
        assert!(store.get(UserId(1)).expect("get").is_none());
        assert_eq!(store.active_count().expect("count"), 0);
    }

    #[test]
    fn test_get_falls_back_to_persistence() {
        let persistence = Arc::new(MemoryPersistence::new());
        let session = Session::new(UserId(3), DocumentKind::Pdf);
        persistence.insert_session(&session).expect("insert");

        // A fresh store with an empty cache sees the persisted session
        let store = SessionStore::new(persistence);
        let loaded = store.get(UserId(3)).expect("get").expect("some");
        assert_eq!(loaded.id, session.id);
        assert_eq!(store.user_ids().expect("ids"), vec![UserId(3)]);
    }
}
