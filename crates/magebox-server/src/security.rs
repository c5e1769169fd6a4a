//! In-memory request guards: a per-client rate limiter and a brute-force
//! lockout tracker.
//!
//! Both are scoped to one [`crate::state::AppState`] and guard their maps
//! with a mutex; there is no cross-process sharing.

use std::collections::HashMap;
use std::hash::Hash;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Rate limiter ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Fixed quota of requests per time window, per key.
#[derive(Debug)]
pub struct RateLimiter<K = IpAddr> {
    limit: u32,
    window: Duration,
    windows: Mutex<HashMap<K, Window>>,
}

impl<K: Eq + Hash + Clone> RateLimiter<K> {
    #[must_use]
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Count a request from `key`. Returns `false` once the quota for the
    /// current window is spent.
    pub fn allow(&self, key: &K) -> bool {
        self.allow_at(key, Instant::now())
    }

    pub fn allow_at(&self, key: &K, now: Instant) -> bool {
        let mut windows = lock(&self.windows);
        let entry = windows.entry(key.clone()).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(entry.started) >= self.window {
            *entry = Window {
                started: now,
                count: 0,
            };
        }
        if entry.count >= self.limit {
            return false;
        }
        entry.count += 1;
        true
    }

    /// Drop windows that have fully elapsed. Returns how many were removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut windows = lock(&self.windows);
        let before = windows.len();
        windows.retain(|_, w| now.duration_since(w.started) < self.window);
        before - windows.len()
    }
}

// ── Login attempts ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
struct Attempts {
    failures: u32,
    locked_until: Option<Instant>,
}

/// Result of recording a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptOutcome {
    /// Consecutive failures including this one.
    pub failures: u32,
    /// The key is now locked out.
    pub locked: bool,
    /// This failure is the one that triggered the lockout.
    pub locked_now: bool,
}

/// Locks a key out for a fixed duration after too many consecutive
/// failures. A success clears the count.
#[derive(Debug)]
pub struct LoginAttemptTracker<K = IpAddr> {
    max_attempts: u32,
    lockout: Duration,
    attempts: Mutex<HashMap<K, Attempts>>,
}

impl<K: Eq + Hash + Clone> LoginAttemptTracker<K> {
    #[must_use]
    pub fn new(max_attempts: u32, lockout: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            lockout,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_failure(&self, key: &K) -> AttemptOutcome {
        self.record_failure_at(key, Instant::now())
    }

    pub fn record_failure_at(&self, key: &K, now: Instant) -> AttemptOutcome {
        let mut attempts = lock(&self.attempts);
        let entry = attempts.entry(key.clone()).or_default();
        if entry.locked_until.is_some_and(|until| now >= until) {
            *entry = Attempts::default();
        }
        if entry.locked_until.is_some() {
            return AttemptOutcome {
                failures: entry.failures,
                locked: true,
                locked_now: false,
            };
        }

        entry.failures += 1;
        let locked_now = entry.failures >= self.max_attempts;
        if locked_now {
            entry.locked_until = Some(now + self.lockout);
        }
        AttemptOutcome {
            failures: entry.failures,
            locked: locked_now,
            locked_now,
        }
    }

    pub fn is_locked(&self, key: &K) -> bool {
        self.is_locked_at(key, Instant::now())
    }

    pub fn is_locked_at(&self, key: &K, now: Instant) -> bool {
        let mut attempts = lock(&self.attempts);
        match attempts.get(key).and_then(|a| a.locked_until) {
            Some(until) if now < until => true,
            Some(_) => {
                attempts.remove(key);
                false
            }
            None => false,
        }
    }

    /// Consecutive failures currently recorded for `key`.
    pub fn failures(&self, key: &K) -> u32 {
        lock(&self.attempts).get(key).map_or(0, |a| a.failures)
    }

    pub fn clear(&self, key: &K) {
        lock(&self.attempts).remove(key);
    }

    /// Forget expired lockouts. Returns how many were removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut attempts = lock(&self.attempts);
        let before = attempts.len();
        attempts.retain(|_, a| a.locked_until.is_none_or(|until| now < until));
        before - attempts.len()
    }
}
