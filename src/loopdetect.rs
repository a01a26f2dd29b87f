//! # Deployment-Loop Detection
//!
//! Counts consecutive triggers at the same commit per stack. When a stack is
//! stuck (a container crash re-triggers a deploy that does not change HEAD)
//! the counter eventually forces a recreate instead of skipping the run as
//! "no changes".

use std::collections::HashMap;
use std::sync::Mutex;

/// Per-stack consecutive-same-commit counter.
#[derive(Debug, Default)]
pub struct LoopDetector {
    stacks: Mutex<HashMap<String, LoopEntry>>,
}

#[derive(Debug)]
struct LoopEntry {
    last_commit: String,
    consecutive: u32,
}

impl LoopDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a trigger for `stack` at `latest_commit` and decide whether
    /// the deploy must be forced. `max == 0` disables detection entirely.
    pub fn should_force_deploy(&self, stack: &str, latest_commit: &str, max: u32) -> bool {
        if max == 0 {
            return false;
        }
        let mut stacks = self.stacks.lock().expect("loop detector poisoned");
        let entry = stacks
            .entry(stack.to_string())
            .and_modify(|entry| {
                if entry.last_commit == latest_commit {
                    entry.consecutive += 1;
                } else {
                    entry.last_commit = latest_commit.to_string();
                    entry.consecutive = 1;
                }
            })
            .or_insert_with(|| LoopEntry {
                last_commit: latest_commit.to_string(),
                consecutive: 1,
            });
        entry.consecutive >= max
    }

    /// Forget a stack, e.g. after it was destroyed.
    pub fn reset(&self, stack: &str) {
        self.stacks
            .lock()
            .expect("loop detector poisoned")
            .remove(stack);
    }
}
