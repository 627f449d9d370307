//! Failed-login tracking
//!
//! After `max_attempts` failures within the lockout window an identifier
//! is locked for the lockout duration. State is in memory; a restart
//! clears it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct AttemptState {
    failures: u32,
    first_failure: Instant,
    locked_until: Option<Instant>,
}

pub struct LoginAttemptTracker {
    max_attempts: u32,
    lockout: Duration,
    attempts: Mutex<HashMap<String, AttemptState>>,
}

impl LoginAttemptTracker {
    pub fn new(max_attempts: u32, lockout: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            lockout,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// `Err(seconds)` while the identifier is locked
    pub fn check(&self, key: &str) -> Result<(), u64> {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> Result<(), u64> {
        let mut attempts = self.attempts.lock();
        if let Some(state) = attempts.get(key) {
            if let Some(until) = state.locked_until {
                if until > now {
                    return Err(remaining_secs(until, now));
                }
                attempts.remove(key);
            }
        }
        Ok(())
    }

    /// Count a failure. Returns the lock duration if this failure locked the key.
    pub fn record_failure(&self, key: &str) -> Option<u64> {
        self.record_failure_at(key, Instant::now())
    }

    fn record_failure_at(&self, key: &str, now: Instant) -> Option<u64> {
        let mut attempts = self.attempts.lock();
        let state = attempts.entry(key.to_string()).or_insert(AttemptState {
            failures: 0,
            first_failure: now,
            locked_until: None,
        });
        if now.duration_since(state.first_failure) > self.lockout {
            state.failures = 0;
            state.first_failure = now;
            state.locked_until = None;
        }
        state.failures += 1;
        if state.failures >= self.max_attempts {
            let until = now + self.lockout;
            state.locked_until = Some(until);
            return Some(remaining_secs(until, now));
        }
        None
    }

    pub fn record_success(&self, key: &str) {
        self.attempts.lock().remove(key);
    }

    /// Drop entries whose window and lock have both passed
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let mut attempts = self.attempts.lock();
        let before = attempts.len();
        attempts.retain(|_, s| match s.locked_until {
            Some(until) => until > now,
            None => now.duration_since(s.first_failure) <= self.lockout,
        });
        before - attempts.len()
    }
}

fn remaining_secs(until: Instant, now: Instant) -> u64 {
    let d = until.saturating_duration_since(now);
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}
