use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);
const MIN_WAIT: Duration = Duration::from_millis(50);

/// Sliding-window request/token budgets shared by every worker of a run.
/// Admission happens under one mutex; blocked callers wait on the condvar
/// until the earliest entry can leave the window, never on fixed sleeps.
pub struct RateLimiter {
    rpm: Option<u32>,
    tpm: Option<u32>,
    windows: Mutex<Windows>,
    cond: Condvar,
}

#[derive(Default)]
struct Windows {
    requests: VecDeque<Instant>,
    tokens: VecDeque<(Instant, u32)>,
    token_sum: u64,
}

impl Windows {
    fn prune(&mut self, now: Instant) {
        while let Some(&t) = self.requests.front() {
            if now.duration_since(t) < WINDOW {
                break;
            }
            self.requests.pop_front();
        }
        while let Some(&(t, cost)) = self.tokens.front() {
            if now.duration_since(t) < WINDOW {
                break;
            }
            self.tokens.pop_front();
            self.token_sum -= u64::from(cost);
        }
    }

    fn earliest_expiry(&self, now: Instant) -> Option<Duration> {
        let req = self.requests.front().copied();
        let tok = self.tokens.front().map(|&(t, _)| t);
        let earliest = match (req, tok) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }?;
        Some(WINDOW.saturating_sub(now.duration_since(earliest)))
    }
}

impl RateLimiter {
    #[must_use]
    pub fn new(rpm: Option<u32>, tpm: Option<u32>) -> Self {
        Self {
            rpm,
            tpm,
            windows: Mutex::new(Windows::default()),
            cond: Condvar::new(),
        }
    }

    /// Block until both budgets admit a call costing `cost` tokens, then
    /// record it. Unset budgets are unbounded.
    pub fn admit(&self, cost: u32) {
        if self.rpm.is_none() && self.tpm.is_none() {
            return;
        }
        // A cost above the whole token budget would never fit; clamp so the
        // call still runs alone in an empty window.
        let cost = match self.tpm {
            Some(tpm) => cost.min(tpm),
            None => cost,
        };

        let mut w = self.windows.lock().expect("limiter mutex");
        loop {
            let now = Instant::now();
            w.prune(now);
            let req_ok = self.rpm.map_or(true, |rpm| (w.requests.len() as u32) < rpm);
            let tok_ok = self
                .tpm
                .map_or(true, |tpm| w.token_sum + u64::from(cost) <= u64::from(tpm));
            if req_ok && tok_ok {
                w.requests.push_back(now);
                w.tokens.push_back((now, cost));
                w.token_sum += u64::from(cost);
                self.cond.notify_all();
                return;
            }
            let wait = w.earliest_expiry(now).unwrap_or(MIN_WAIT).max(MIN_WAIT);
            let (guard, _) = self
                .cond
                .wait_timeout(w, wait)
                .expect("limiter mutex");
            w = guard;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_admits_immediately() {
        let limiter = RateLimiter::new(None, None);
        for _ in 0..1000 {
            limiter.admit(100_000);
        }
    }

    #[test]
    fn tracks_request_and_token_windows() {
        let limiter = RateLimiter::new(Some(10), Some(1000));
        for _ in 0..3 {
            limiter.admit(100);
        }
        let w = limiter.windows.lock().expect("mutex");
        assert_eq!(w.requests.len(), 3);
        assert_eq!(w.token_sum, 300);
    }

    #[test]
    fn oversized_cost_is_clamped_to_budget() {
        let limiter = RateLimiter::new(None, Some(200));
        // Without clamping this would never admit.
        limiter.admit(10_000);
        let w = limiter.windows.lock().expect("mutex");
        assert_eq!(w.token_sum, 200);
    }

    #[test]
    fn prune_drops_expired_entries() {
        let mut w = Windows::default();
        let Some(old) = Instant::now().checked_sub(Duration::from_secs(61)) else {
            return;
        };
        w.requests.push_back(old);
        w.tokens.push_back((old, 50));
        w.token_sum = 50;
        w.prune(Instant::now());
        assert!(w.requests.is_empty());
        assert_eq!(w.token_sum, 0);
    }
}
