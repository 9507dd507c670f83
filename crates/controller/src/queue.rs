//! Per-controller work queue.
//!
//! Requests coalesce by resource id: at most one pending entry per id, and an
//! id handed to a worker is never handed to a second one until it is done.
//! Events for a running id are parked and re-queued on completion. When the
//! ready list is full the oldest entry is deferred by one base backoff, never
//! dropped.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::gauge;
use regent_core::ResourceId;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// `base * 2^(failures-1)`, capped at `max`.
pub(crate) fn backoff(base: Duration, max: Duration, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exp).map_or(max, |d| d.min(max))
}

#[derive(Default)]
struct State {
    ready: VecDeque<ResourceId>,
    queued: FxHashSet<ResourceId>,
    running: FxHashSet<ResourceId>,
    parked: FxHashSet<ResourceId>,
    delayed: FxHashMap<ResourceId, Instant>,
    failures: FxHashMap<ResourceId, u32>,
    deferred: u64,
}

impl State {
    fn enqueue(&mut self, id: ResourceId, cap: usize, defer: Duration) {
        if self.running.contains(&id) {
            self.parked.insert(id);
            return;
        }
        // A fresh event supersedes a pending backoff.
        self.delayed.remove(&id);
        if self.queued.contains(&id) {
            return;
        }
        if self.ready.len() >= cap {
            if let Some(old) = self.ready.pop_front() {
                self.queued.remove(&old);
                self.deferred += 1;
                warn!(id = %old, "work queue full; deferring oldest request");
                self.delayed.insert(old, Instant::now() + defer);
            }
        }
        self.queued.insert(id.clone());
        self.ready.push_back(id);
    }

    fn promote_due(&mut self, now: Instant, cap: usize, defer: Duration) {
        let due: Vec<ResourceId> =
            self.delayed.iter().filter(|(_, at)| **at <= now).map(|(id, _)| id.clone()).collect();
        for id in due {
            self.delayed.remove(&id);
            self.enqueue(id, cap, defer);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.delayed.values().min().copied()
    }

    fn depth(&self) -> usize {
        self.ready.len() + self.delayed.len() + self.parked.len()
    }
}

pub(crate) struct WorkQueue {
    name: String,
    state: Mutex<State>,
    notify: Notify,
    cap: usize,
    base: Duration,
    max: Duration,
}

impl WorkQueue {
    pub fn new(name: impl Into<String>, cap: usize, base: Duration, max: Duration) -> Self {
        Self { name: name.into(), state: Mutex::new(State::default()), notify: Notify::new(), cap: cap.max(1), base, max }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report(&self, st: &State) {
        gauge!("controller_queue_depth", st.depth() as f64, "controller" => self.name.clone());
    }

    pub fn add(&self, id: ResourceId) {
        let mut st = self.lock();
        st.enqueue(id, self.cap, self.base);
        self.report(&st);
        drop(st);
        self.notify.notify_one();
    }

    /// Give back an id taken with [`next`](Self::next) without running it.
    /// It goes to the front of the queue and no failure is counted.
    pub fn release(&self, id: &ResourceId) {
        let mut st = self.lock();
        st.running.remove(id);
        st.parked.remove(id);
        st.delayed.remove(id);
        if st.queued.insert(id.clone()) {
            st.ready.push_front(id.clone());
        }
        self.report(&st);
    }

    /// Wait for the next id to work on. `None` once `cancel` fires.
    pub async fn next(&self, cancel: &CancellationToken) -> Option<ResourceId> {
        loop {
            let deadline = {
                let mut st = self.lock();
                st.promote_due(Instant::now(), self.cap, self.base);
                if let Some(id) = st.ready.pop_front() {
                    st.queued.remove(&id);
                    st.running.insert(id.clone());
                    self.report(&st);
                    return Some(id);
                }
                st.next_deadline()
            };
            let sleep = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.notify.notified() => {}
                _ = sleep => {}
            }
        }
    }

    /// Mark `id` finished. Failures back off unless a newer event arrived
    /// while it ran.
    pub fn done(&self, id: &ResourceId, ok: bool) {
        let mut st = self.lock();
        st.running.remove(id);
        let parked = st.parked.remove(id);
        if ok {
            st.failures.remove(id);
            if parked {
                st.enqueue(id.clone(), self.cap, self.base);
            }
        } else {
            let n = st.failures.entry(id.clone()).or_insert(0);
            *n = n.saturating_add(1);
            let failures = *n;
            if parked {
                st.enqueue(id.clone(), self.cap, self.base);
            } else {
                let at = Instant::now() + backoff(self.base, self.max, failures);
                st.delayed.insert(id.clone(), at);
            }
        }
        self.report(&st);
        drop(st);
        // Wake a sleeper so it re-arms its timer or picks up the parked id.
        self.notify.notify_one();
    }

    #[cfg(test)]
    fn failures(&self, id: &ResourceId) -> u32 {
        self.lock().failures.get(id).copied().unwrap_or(0)
    }

    #[cfg(test)]
    fn deferred(&self) -> u64 {
        self.lock().deferred
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regent_core::{Tenancy, Type};

    fn id(name: &str) -> ResourceId {
        ResourceId::new(Type::new("demo", "v1", "Thing"), Tenancy::default_namespace(), name)
    }

    fn queue() -> WorkQueue {
        WorkQueue::new("test", 16, Duration::from_millis(5), Duration::from_secs(1000))
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(5);
        let max = Duration::from_secs(1000);
        assert_eq!(backoff(base, max, 1), Duration::from_millis(5));
        assert_eq!(backoff(base, max, 2), Duration::from_millis(10));
        assert_eq!(backoff(base, max, 4), Duration::from_millis(40));
        assert_eq!(backoff(base, max, 60), max);
    }

    #[tokio::test]
    async fn coalesces_and_parks_running_ids() {
        let q = queue();
        let cancel = CancellationToken::new();
        q.add(id("a"));
        q.add(id("a"));
        q.add(id("b"));

        let first = q.next(&cancel).await.unwrap();
        assert_eq!(first, id("a"));
        // Arrives while "a" runs: parked, not handed out.
        q.add(id("a"));
        assert_eq!(q.next(&cancel).await.unwrap(), id("b"));

        q.done(&id("b"), true);
        q.done(&first, true);
        assert_eq!(q.next(&cancel).await.unwrap(), id("a"));
        q.done(&id("a"), true);

        cancel.cancel();
        assert!(q.next(&cancel).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failures_back_off_and_fresh_events_supersede() {
        let q = queue();
        let cancel = CancellationToken::new();
        q.add(id("a"));
        let a = q.next(&cancel).await.unwrap();
        q.done(&a, false);

        let started = Instant::now();
        let a = q.next(&cancel).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(5));
        q.done(&a, false);
        assert_eq!(q.failures(&a), 2);

        // Superseded: available now instead of after 10ms.
        q.add(id("a"));
        let started = Instant::now();
        let a = q.next(&cancel).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(10));
        q.done(&a, true);
        assert_eq!(q.failures(&a), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_defers_oldest_instead_of_losing_it() {
        let q = WorkQueue::new("test", 2, Duration::from_millis(5), Duration::from_secs(1));
        let cancel = CancellationToken::new();
        q.add(id("a"));
        q.add(id("b"));
        q.add(id("c"));
        assert_eq!(q.deferred(), 1);

        let mut seen = Vec::new();
        for _ in 0..3 {
            let next = q.next(&cancel).await.unwrap();
            q.done(&next, true);
            seen.push(next.name);
        }
        assert_eq!(seen, vec!["b", "c", "a"]);
    }

    #[tokio::test]
    async fn released_ids_return_to_the_front() {
        let q = queue();
        let cancel = CancellationToken::new();
        q.add(id("a"));
        q.add(id("b"));
        let a = q.next(&cancel).await.unwrap();
        q.add(id("a"));
        q.release(&a);
        assert_eq!(q.failures(&a), 0);
        assert_eq!(q.next(&cancel).await.unwrap(), id("a"));
        assert_eq!(q.next(&cancel).await.unwrap(), id("b"));
    }
}
