//! Per-client backoff after repeated credential failures.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::AuthConfig;

/// Map size that forces a prune before the next scheduled one.
const PRUNE_AT_LEAST: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct FailureRecord {
    failures: u32,
    last_failure: Instant,
    locked_until: Option<Instant>,
}

impl FailureRecord {
    /// Idle past the window and no longer locked.
    fn expired(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.last_failure) >= window
            && self.locked_until.map_or(true, |until| until <= now)
    }
}

struct Records {
    by_client: HashMap<String, FailureRecord>,
    next_prune: Option<Instant>,
    prune_at: usize,
}

impl Records {
    fn prune(&mut self, now: Instant, window: Duration) {
        let before = self.by_client.len();
        self.by_client.retain(|_, record| !record.expired(now, window));
        let dropped = before - self.by_client.len();
        if dropped > 0 {
            log::debug!("Forgot {} idle auth failure records", dropped);
        }
        self.next_prune = Some(now + window);
        self.prune_at = (self.by_client.len() * 2).max(PRUNE_AT_LEAST);
    }
}

pub struct AuthFailureLimiter {
    records: Mutex<Records>,
    free_failures: u32,
    base: Duration,
    max: Duration,
    window: Duration,
}

impl AuthFailureLimiter {
    pub fn new(config: &AuthConfig) -> Self {
        let max = Duration::from_secs(config.backoff_max_seconds.max(1));
        Self {
            records: Mutex::new(Records {
                by_client: HashMap::new(),
                next_prune: None,
                prune_at: PRUNE_AT_LEAST,
            }),
            free_failures: config.free_failures,
            base: Duration::from_secs(config.backoff_base_seconds.max(1)),
            // A record must outlive its longest lockout
            window: Duration::from_secs(config.failure_window_seconds).max(max),
            max,
        }
    }

    /// Remaining lockout for `client`, rounded up to whole seconds.
    pub fn retry_after(&self, client: &str, now: Instant) -> Option<u64> {
        let records = self.records.lock().ok()?;
        let until = records.by_client.get(client)?.locked_until?;
        let remaining = until.checked_duration_since(now)?;
        if remaining.is_zero() {
            return None;
        }
        Some(ceil_secs(remaining))
    }

    /// Count a failure. Returns the lockout in seconds once the client has
    /// used up its free attempts; each further failure doubles it. Records
    /// idle for longer than the failure window are forgotten.
    pub fn register_failure(&self, client: &str, now: Instant) -> Option<u64> {
        let mut records = match self.records.lock() {
            Ok(records) => records,
            Err(_) => {
                log::error!("Auth limiter mutex poisoned");
                return None;
            }
        };
        let due = records.next_prune.map_or(true, |at| now >= at);
        if due || records.by_client.len() >= records.prune_at {
            records.prune(now, self.window);
        }

        let window = self.window;
        let record = records
            .by_client
            .entry(client.to_string())
            .or_insert(FailureRecord {
                failures: 0,
                last_failure: now,
                locked_until: None,
            });
        if record.expired(now, window) {
            record.failures = 0;
            record.locked_until = None;
        }
        record.failures = record.failures.saturating_add(1);
        record.last_failure = now;

        if record.failures <= self.free_failures {
            return None;
        }

        let exponent = (record.failures - self.free_failures - 1).min(16);
        let backoff = self.base.saturating_mul(1u32 << exponent).min(self.max);
        record.locked_until = Some(now + backoff);
        log::warn!(
            "Client {} locked out for {}s after {} failed credential checks",
            client,
            backoff.as_secs(),
            record.failures
        );
        Some(ceil_secs(backoff))
    }

    pub fn register_success(&self, client: &str) {
        if let Ok(mut records) = self.records.lock() {
            records.by_client.remove(client);
        }
    }

    #[cfg(test)]
    fn tracked_clients(&self) -> usize {
        self.records
            .lock()
            .map(|records| records.by_client.len())
            .unwrap_or_default()
    }
}

fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> AuthFailureLimiter {
        AuthFailureLimiter::new(&AuthConfig {
            free_failures: 2,
            backoff_base_seconds: 2,
            backoff_max_seconds: 10,
            failure_window_seconds: 60,
        })
    }

    #[test]
    fn test_free_failures_do_not_lock() {
        let limiter = limiter();
        let now = Instant::now();
        assert_eq!(limiter.register_failure("1.2.3.4", now), None);
        assert_eq!(limiter.register_failure("1.2.3.4", now), None);
        assert_eq!(limiter.retry_after("1.2.3.4", now), None);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let limiter = limiter();
        let now = Instant::now();
        limiter.register_failure("c", now);
        limiter.register_failure("c", now);
        assert_eq!(limiter.register_failure("c", now), Some(2));
        assert_eq!(limiter.register_failure("c", now), Some(4));
        assert_eq!(limiter.register_failure("c", now), Some(8));
        assert_eq!(limiter.register_failure("c", now), Some(10));
        assert_eq!(limiter.retry_after("c", now), Some(10));
        assert_eq!(limiter.retry_after("c", now + Duration::from_secs(11)), None);
    }

    #[test]
    fn test_success_clears_and_clients_are_independent() {
        let limiter = limiter();
        let now = Instant::now();
        for _ in 0..3 {
            limiter.register_failure("a", now);
        }
        assert!(limiter.retry_after("a", now).is_some());
        assert!(limiter.retry_after("b", now).is_none());

        limiter.register_success("a");
        assert!(limiter.retry_after("a", now).is_none());
        assert_eq!(limiter.register_failure("a", now), None);
    }

    #[test]
    fn test_idle_records_are_forgotten() {
        let limiter = limiter();
        let now = Instant::now();
        for i in 0..5_000 {
            limiter.register_failure(&format!("10.0.{}.{}", i / 256, i % 256), now);
        }
        assert_eq!(limiter.tracked_clients(), 5_000);

        let next_day = now + Duration::from_secs(24 * 3600);
        limiter.register_failure("192.0.2.1", next_day);
        assert_eq!(limiter.tracked_clients(), 1);
    }

    #[test]
    fn test_failure_count_resets_after_idle_window() {
        let limiter = limiter();
        let now = Instant::now();
        for _ in 0..3 {
            limiter.register_failure("c", now);
        }
        assert!(limiter.retry_after("c", now).is_some());

        let later = now + Duration::from_secs(61);
        assert_eq!(limiter.register_failure("c", later), None);
        assert_eq!(limiter.retry_after("c", later), None);
    }

    #[test]
    fn test_locked_records_survive_pruning() {
        let limiter = AuthFailureLimiter::new(&AuthConfig {
            free_failures: 0,
            backoff_base_seconds: 100,
            backoff_max_seconds: 100,
            failure_window_seconds: 1,
        });
        let now = Instant::now();
        assert_eq!(limiter.register_failure("c", now), Some(100));

        // The window is stretched to the longest lockout
        let later = now + Duration::from_secs(50);
        limiter.register_failure("other", later);
        assert!(limiter.retry_after("c", later).is_some());
    }
}
