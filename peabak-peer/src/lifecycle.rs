//! Building blocks shared by every state machine: the one-shot terminal latch,
//! the keyed instance registry and delay helpers.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use tokio::sync::Notify;

/// How a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Woke {
    Timer,
    Notified,
}

/// Terminal guard: the first `try_finish` wins, every later one loses.
/// The winner of an external transition calls `wake` so the owning task
/// stops waiting; a wake issued before the task waits is not lost.
#[derive(Default)]
pub struct Latch {
    done: AtomicBool,
    notify: Notify,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_finish(&self) -> bool {
        self.done
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Finish and wake in one step. False if someone else already finished.
    pub fn finish_and_wake(&self) -> bool {
        let won = self.try_finish();
        if won {
            self.wake();
        }
        won
    }

    /// Sleep for `d` unless woken first.
    pub async fn sleep(&self, d: Duration) -> Woke {
        tokio::select! {
            _ = tokio::time::sleep(d) => Woke::Timer,
            _ = self.notify.notified() => Woke::Notified,
        }
    }

    /// Wait for the wake that follows an external finish.
    pub async fn woken(&self) {
        self.notify.notified().await
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Live instances by key, at most one per key. Holds only handles; the
/// instance itself is returned to the caller to run, and the caller removes
/// the entry with the generation it got back once the instance finished.
pub struct Registry<K, H> {
    entries: Mutex<HashMap<K, (u64, H)>>,
    next_generation: AtomicU64,
}

impl<K, H> Default for Registry<K, H> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }
}

impl<K: Eq + Hash + Clone, H: Clone> Registry<K, H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute-if-absent. `make` runs under the lock and only when `key` is
    /// free; returns the generation and the instance to run, or `None` if an
    /// instance is already live for `key`.
    pub fn insert_with<M>(&self, key: K, make: impl FnOnce() -> (M, H)) -> Option<(u64, M)> {
        let mut entries = lock(&self.entries);
        if entries.contains_key(&key) {
            return None;
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (machine, handle) = make();
        entries.insert(key, (generation, handle));
        Some((generation, machine))
    }

    pub fn get(&self, key: &K) -> Option<H> {
        lock(&self.entries).get(key).map(|(_, h)| h.clone())
    }

    /// Remove the entry for `key` if it still belongs to `generation`.
    pub fn remove(&self, key: &K, generation: u64) -> bool {
        let mut entries = lock(&self.entries);
        match entries.get(key) {
            Some((g, _)) if *g == generation => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn handles_where(&self, mut pred: impl FnMut(&K) -> bool) -> Vec<H> {
        lock(&self.entries)
            .iter()
            .filter(|(k, _)| pred(k))
            .map(|(_, (_, h))| h.clone())
            .collect()
    }

    pub fn contains(&self, key: &K) -> bool {
        lock(&self.entries).contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `base * 2^attempt`, saturating.
pub fn backoff(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
}

/// Uniform in `[min, max)`; `min` when the range is empty.
pub fn random_between(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let lo = min.as_millis() as u64;
    let hi = max.as_millis() as u64;
    if hi <= lo {
        return min;
    }
    Duration::from_millis(rand::thread_rng().gen_range(lo..hi))
}
