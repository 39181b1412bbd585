//! Per-user lock table
//!
//! Mutating work on a user's session and quota record happens under
//! that user's lock so overlapping turns serialize in arrival order.
//! Locks are created on demand and keyed by [`UserId`]; there is no
//! global lock, so unrelated users never block each other.

use crate::session::types::UserId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Keyed table of per-user async mutexes
///
/// The outer `std::sync::Mutex` only guards the map itself; it is held
/// for the duration of a lookup, never across an await. The per-user
/// lock is a `tokio::sync::Mutex` acquired as an owned guard so it can
/// be held across the long-running collaborator calls of a turn.
#[derive(Default)]
pub struct LockTable {
    locks: Mutex<HashMap<UserId, Arc<AsyncMutex<()>>>>,
}

impl LockTable {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the exclusive lock for `user`, waiting behind any
    /// in-flight turn for the same user
    ///
    /// Waiters are served in FIFO order by the underlying tokio mutex,
    /// which is what gives turns their per-user arrival-order guarantee.
    pub async fn acquire(&self, user: UserId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().expect("lock table poisoned");
            Arc::clone(locks.entry(user).or_default())
        };
        lock.lock_owned().await
    }

    /// Number of users with a lock entry (for stats)
    pub fn entry_count(&self) -> usize {
        self.locks.lock().expect("lock table poisoned").len()
    }
}
