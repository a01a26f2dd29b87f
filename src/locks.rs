//! # Repository Locks
//!
//! Named, non-blocking locks serializing all work on a single repository.
//! A lock records the job id of its holder so concurrent triggers can report
//! *who* is already deploying. Idle entries are reaped after a TTL.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

/// Registry handing out the unique lock for each repository name.
#[derive(Debug)]
pub struct RepoLockRegistry {
    entries: Mutex<HashMap<String, Arc<RepoLock>>>,
    ttl: Duration,
}

/// Non-blocking lock for one repository. At most one holder at any time.
#[derive(Debug, Default)]
pub struct RepoLock {
    state: Mutex<LockState>,
}

#[derive(Debug)]
struct LockState {
    holder: Option<String>,
    last_used: Instant,
}

impl Default for LockState {
    fn default() -> Self {
        Self {
            holder: None,
            last_used: Instant::now(),
        }
    }
}

impl RepoLock {
    /// Try to take the lock for `holder_id`. Returns `false` without
    /// blocking when another job already holds it.
    pub fn try_lock(&self, holder_id: &str) -> bool {
        let mut state = self.state.lock().expect("repo lock poisoned");
        if state.holder.is_some() {
            return false;
        }
        state.holder = Some(holder_id.to_string());
        state.last_used = Instant::now();
        true
    }

    /// Job id of the current holder, if any.
    pub fn holder(&self) -> Option<String> {
        self.state.lock().expect("repo lock poisoned").holder.clone()
    }

    /// Release the lock and clear the holder.
    pub fn unlock(&self) {
        let mut state = self.state.lock().expect("repo lock poisoned");
        state.holder = None;
        state.last_used = Instant::now();
    }

    fn is_idle_since(&self, cutoff: Instant) -> bool {
        let state = self.state.lock().expect("repo lock poisoned");
        state.holder.is_none() && state.last_used < cutoff
    }
}

impl RepoLockRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Return the unique lock for `name`, creating it on first use.
    /// Two different names never contend.
    pub fn get(&self, name: &str) -> Arc<RepoLock> {
        let mut entries = self.entries.lock().expect("lock registry poisoned");
        Arc::clone(
            entries
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(RepoLock::default())),
        )
    }

    /// Drop entries that are unheld, unreferenced and idle for longer than
    /// the TTL. Invoked periodically from the cleanup task.
    pub fn cleanup(&self) {
        let cutoff = match Instant::now().checked_sub(self.ttl) {
            Some(cutoff) => cutoff,
            None => return,
        };
        let mut entries = self.entries.lock().expect("lock registry poisoned");
        let before = entries.len();
        entries.retain(|_, lock| Arc::strong_count(lock) > 1 || !lock.is_idle_since(cutoff));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "reaped idle repository locks");
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}
