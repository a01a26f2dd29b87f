//! # Deployer Limiter
//!
//! Bounds global deployment parallelism and serializes deployments for the
//! same repository when they target different refs. Deployments for the same
//! repository + same ref (e.g. multiple stacks from one push) run in
//! parallel up to the remaining global capacity.
//!
//! Waiting ref-groups form a FIFO queue per repository: the first ref to
//! wait becomes the next active ref, and *all* waiters for that ref wake
//! together. Cancellation at any point rolls the bookkeeping back to the
//! state before the call.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::observability::metrics;

/// Error returned when an acquisition is abandoned.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AcquireError {
    #[error("deployment acquisition cancelled")]
    Cancelled,
}

/// Global semaphore + per-repository ref-group serializer.
pub struct DeployLimiter {
    global: Arc<Semaphore>,
    repos: Mutex<HashMap<String, Arc<RepoEntry>>>,
    next_waiter_id: AtomicU64,
    ttl: Duration,
}

#[derive(Debug)]
struct RepoEntry {
    repo: String,
    state: Mutex<RefGroups>,
}

#[derive(Debug)]
struct RefGroups {
    active_ref: Option<String>,
    ref_counts: HashMap<String, usize>,
    waiters: VecDeque<Waiter>,
    last_used: Instant,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    ref_name: String,
    tx: oneshot::Sender<()>,
}

/// Held for the duration of one stack deployment. Dropping it releases the
/// global slot, then the ref-group membership, waking the next group when
/// this was the last member.
#[derive(Debug)]
pub struct DeploySlot {
    permit: Option<OwnedSemaphorePermit>,
    _membership: RefMembership,
}

/// Rollback guard for the ref-group count. Lives inside [`DeploySlot`] once
/// the slot is granted; dropped on its own it undoes a partial acquisition.
#[derive(Debug)]
struct RefMembership {
    entry: Arc<RepoEntry>,
    ref_name: String,
}

impl Drop for RefMembership {
    fn drop(&mut self) {
        self.entry.release_ref(&self.ref_name);
    }
}

impl Drop for DeploySlot {
    fn drop(&mut self) {
        // Global slot first, then group bookkeeping via _membership
        if self.permit.take().is_some() {
            metrics::dec_deployments_active(&self._membership.entry.repo);
        }
    }
}

impl RepoEntry {
    /// Decrement the count for `ref_name`; when the entry has no active refs
    /// left, hand activeness to the first waiting group.
    fn release_ref(&self, ref_name: &str) {
        let mut state = self.state.lock().expect("limiter entry poisoned");
        state.last_used = Instant::now();
        if let Some(count) = state.ref_counts.get_mut(ref_name) {
            *count -= 1;
            if *count == 0 {
                state.ref_counts.remove(ref_name);
            }
        }
        if state.ref_counts.is_empty() {
            state.active_ref = None;
            Self::wake_next(&mut state, &self.repo);
        }
    }

    /// Make the ref of `waiters[0]` active and wake every waiter with that
    /// ref, pre-counting each so a racing release cannot clear activeness
    /// between the wake and the join.
    fn wake_next(state: &mut RefGroups, repo: &str) {
        while state.active_ref.is_none() {
            let Some(front) = state.waiters.front() else {
                return;
            };
            let next_ref = front.ref_name.clone();
            state.active_ref = Some(next_ref.clone());

            let mut index = 0;
            while index < state.waiters.len() {
                if state.waiters[index].ref_name == next_ref {
                    let waiter = state
                        .waiters
                        .remove(index)
                        .expect("index checked against len");
                    metrics::dec_deployments_queued(repo);
                    *state.ref_counts.entry(next_ref.clone()).or_insert(0) += 1;
                    if waiter.tx.send(()).is_err() {
                        // Receiver is gone (future dropped); undo the join
                        if let Some(count) = state.ref_counts.get_mut(&next_ref) {
                            *count -= 1;
                            if *count == 0 {
                                state.ref_counts.remove(&next_ref);
                            }
                        }
                    }
                } else {
                    index += 1;
                }
            }

            if state.ref_counts.is_empty() {
                // Every woken waiter had vanished; try the next group
                state.active_ref = None;
            }
        }
    }
}

impl DeployLimiter {
    /// `capacity` bounds the number of concurrently running deployments
    /// across all repositories; `ttl` controls entry cleanup.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            global: Arc::new(Semaphore::new(capacity)),
            repos: Mutex::new(HashMap::new()),
            next_waiter_id: AtomicU64::new(0),
            ttl,
        }
    }

    fn entry(&self, repo: &str) -> Arc<RepoEntry> {
        let mut repos = self.repos.lock().expect("limiter map poisoned");
        Arc::clone(repos.entry(repo.to_string()).or_insert_with(|| {
            Arc::new(RepoEntry {
                repo: repo.to_string(),
                state: Mutex::new(RefGroups {
                    active_ref: None,
                    ref_counts: HashMap::new(),
                    waiters: VecDeque::new(),
                    last_used: Instant::now(),
                }),
            })
        }))
    }

    /// Wait for a deployment slot for `(repo, ref)`.
    ///
    /// Suspends on the ref-group queue when a different ref is active for
    /// the repository, then on the global semaphore. Cancellation via
    /// `cancel` rolls all bookkeeping back before returning.
    pub async fn acquire(
        &self,
        repo: &str,
        ref_name: &str,
        cancel: &CancellationToken,
    ) -> Result<DeploySlot, AcquireError> {
        let entry = self.entry(repo);

        let waiting = {
            let mut state = entry.state.lock().expect("limiter entry poisoned");
            state.last_used = Instant::now();
            match state.active_ref.as_deref() {
                None => {
                    state.active_ref = Some(ref_name.to_string());
                    state.ref_counts.insert(ref_name.to_string(), 1);
                    None
                }
                Some(active) if active == ref_name => {
                    *state
                        .ref_counts
                        .get_mut(ref_name)
                        .expect("active ref always counted") += 1;
                    None
                }
                Some(_) => {
                    let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back(Waiter {
                        id,
                        ref_name: ref_name.to_string(),
                        tx,
                    });
                    metrics::inc_deployments_queued(repo);
                    Some((id, rx))
                }
            }
        };

        if let Some((id, rx)) = waiting {
            debug!(repo, ref_name, "deployment queued behind another ref");
            tokio::select! {
                joined = rx => {
                    if joined.is_err() {
                        // Sender dropped without a wake; nothing was counted
                        return Err(AcquireError::Cancelled);
                    }
                    // wake_next already counted this join
                }
                () = cancel.cancelled() => {
                    let mut state = entry.state.lock().expect("limiter entry poisoned");
                    if let Some(pos) = state.waiters.iter().position(|w| w.id == id) {
                        state.waiters.remove(pos);
                        metrics::dec_deployments_queued(repo);
                        return Err(AcquireError::Cancelled);
                    }
                    // Already woken and counted; undo like a release
                    drop(state);
                    entry.release_ref(ref_name);
                    return Err(AcquireError::Cancelled);
                }
            }
        }

        // From here the membership guard guarantees rollback on every path
        let membership = RefMembership {
            entry: Arc::clone(&entry),
            ref_name: ref_name.to_string(),
        };

        tokio::select! {
            permit = Arc::clone(&self.global).acquire_owned() => {
                let permit = permit.expect("limiter semaphore never closed");
                metrics::inc_deployments_active(repo);
                Ok(DeploySlot {
                    permit: Some(permit),
                    _membership: membership,
                })
            }
            () = cancel.cancelled() => {
                drop(membership);
                Err(AcquireError::Cancelled)
            }
        }
    }

    /// Non-blocking variant: `None` when another ref is active for the
    /// repository or the global capacity is exhausted.
    pub fn try_acquire(&self, repo: &str, ref_name: &str) -> Option<DeploySlot> {
        let entry = self.entry(repo);

        {
            let mut state = entry.state.lock().expect("limiter entry poisoned");
            state.last_used = Instant::now();
            match state.active_ref.as_deref() {
                None => {
                    state.active_ref = Some(ref_name.to_string());
                    state.ref_counts.insert(ref_name.to_string(), 1);
                }
                Some(active) if active == ref_name => {
                    *state
                        .ref_counts
                        .get_mut(ref_name)
                        .expect("active ref always counted") += 1;
                }
                Some(_) => return None,
            }
        }

        let membership = RefMembership {
            entry,
            ref_name: ref_name.to_string(),
        };

        match Arc::clone(&self.global).try_acquire_owned() {
            Ok(permit) => {
                metrics::inc_deployments_active(repo);
                Some(DeploySlot {
                    permit: Some(permit),
                    _membership: membership,
                })
            }
            Err(_) => None,
        }
    }

    /// Drop repository entries with no counts and no waiters that have been
    /// idle longer than the TTL, zeroing their per-repository gauges.
    pub fn cleanup(&self) {
        let cutoff = match Instant::now().checked_sub(self.ttl) {
            Some(cutoff) => cutoff,
            None => return,
        };
        let mut repos = self.repos.lock().expect("limiter map poisoned");
        let mut removed = Vec::new();
        repos.retain(|repo, entry| {
            if Arc::strong_count(entry) > 1 {
                return true;
            }
            let state = entry.state.lock().expect("limiter entry poisoned");
            let idle = state.ref_counts.is_empty()
                && state.waiters.is_empty()
                && state.last_used < cutoff;
            if idle {
                removed.push(repo.clone());
            }
            !idle
        });
        for repo in removed {
            metrics::reset_repo_gauges(&repo);
            debug!(repo, "reaped idle limiter entry");
        }
    }

    #[cfg(test)]
    fn queue_len(&self, repo: &str) -> usize {
        self.entry(repo).state.lock().unwrap().waiters.len()
    }

    #[cfg(test)]
    fn snapshot(&self, repo: &str) -> (Option<String>, usize) {
        let entry = self.entry(repo);
        let state = entry.state.lock().unwrap();
        (
            state.active_ref.clone(),
            state.ref_counts.values().sum::<usize>(),
        )
    }
}
