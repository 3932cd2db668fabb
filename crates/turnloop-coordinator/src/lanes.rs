//! Per-lane concurrency caps (§5: "A lane-queue mechanism MAY bound
//! concurrency per semantic lane (`main`, `subagent`, etc.) with per-lane
//! caps; unknown lanes default to cap 1").
//!
//! Each lane is backed by a `tokio::sync::Semaphore` sized at registration
//! time (or lazily, at cap 1, the first time an unconfigured lane is used).
//! Holding a permit for the lifetime of a sub-session's run is what bounds
//! how many of that lane can be in flight at once.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Semaphore;

pub struct LaneQueue {
    caps: HashMap<String, usize>,
    default_cap: usize,
    semaphores: DashMap<String, Arc<Semaphore>>,
}

impl LaneQueue {
    pub fn new(caps: HashMap<String, usize>, default_cap: usize) -> Self {
        Self {
            caps,
            default_cap: default_cap.max(1),
            semaphores: DashMap::new(),
        }
    }

    fn semaphore_for(&self, lane: &str) -> Arc<Semaphore> {
        self.semaphores
            .entry(lane.to_string())
            .or_insert_with(|| {
                let cap = self.caps.get(lane).copied().unwrap_or(self.default_cap).max(1);
                Arc::new(Semaphore::new(cap))
            })
            .clone()
    }

    /// Acquires a permit for the given lane, owning a clone of the
    /// semaphore so the permit can outlive this call (an owned permit, not
    /// a borrowed `SemaphorePermit<'_>`).
    pub async fn acquire(&self, lane: &str) -> tokio::sync::OwnedSemaphorePermit {
        let sem = self.semaphore_for(lane);
        sem.acquire_owned().await.expect("lane semaphore is never closed")
    }
}
