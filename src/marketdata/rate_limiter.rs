//! Daily request budget for the Taiwan Stock Exchange source.
//!
//! One token bucket per process, shared by every request. The counter
//! resets when the UTC day rolls over.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use std::sync::{Arc, Mutex};

use crate::error::{AppError, Result};

static GLOBAL: Lazy<Arc<TwseRateLimiter>> = Lazy::new(|| Arc::new(TwseRateLimiter::new()));

/// Process-wide limiter instance.
pub fn global() -> Arc<TwseRateLimiter> {
    Arc::clone(&GLOBAL)
}

#[derive(Debug)]
struct DayState {
    day: Option<NaiveDate>,
    used: u32,
}

#[derive(Debug)]
pub struct TwseRateLimiter {
    state: Mutex<DayState>,
}

impl TwseRateLimiter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DayState { day: None, used: 0 }),
        }
    }

    /// Take one token from today's budget of `quota` requests.
    pub fn try_acquire(&self, quota: u32, today: NaiveDate) -> Result<()> {
        let mut state = self.state.lock().expect("rate limiter poisoned");

        if state.day != Some(today) {
            state.day = Some(today);
            state.used = 0;
        }

        if state.used >= quota {
            return Err(AppError::RateLimitExceeded(format!(
                "TWSE daily quota of {} requests exhausted",
                quota
            )));
        }

        state.used += 1;
        Ok(())
    }

    /// Requests consumed today.
    pub fn used_today(&self, today: NaiveDate) -> u32 {
        let state = self.state.lock().expect("rate limiter poisoned");
        if state.day == Some(today) {
            state.used
        } else {
            0
        }
    }
}

impl Default for TwseRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_quota_exhaustion() {
        let limiter = TwseRateLimiter::new();
        let today = date(2026, 3, 2);

        for _ in 0..3 {
            limiter.try_acquire(3, today).unwrap();
        }
        let denied = limiter.try_acquire(3, today);
        assert!(matches!(denied, Err(AppError::RateLimitExceeded(_))));
        assert_eq!(limiter.used_today(today), 3);
    }

    #[test]
    fn test_day_rollover_resets_budget() {
        let limiter = TwseRateLimiter::new();
        let monday = date(2026, 3, 2);
        let tuesday = date(2026, 3, 3);

        for _ in 0..3 {
            limiter.try_acquire(3, monday).unwrap();
        }
        assert!(limiter.try_acquire(3, monday).is_err());

        limiter.try_acquire(3, tuesday).unwrap();
        assert_eq!(limiter.used_today(tuesday), 1);
    }

    #[test]
    fn test_shared_across_threads() {
        let limiter = Arc::new(TwseRateLimiter::new());
        let today = date(2026, 3, 2);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || limiter.try_acquire(4, today).is_ok())
            })
            .collect();

        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(granted, 4);
    }
}
