//! Per-platform API budget limiter
//!
//! In-process sliding window over recent call timestamps, keyed by
//! `(platform, action)`. This layer protects the application from
//! being throttled or banned by a platform; it is deliberately local
//! (not shared across instances) and resets on restart, which at worst
//! lets one extra burst through after a deploy.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;

use crate::limiter::Decision;

/// What kind of platform API call is being budgeted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiAction {
    Post,
    Read,
}

impl fmt::Display for ApiAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiAction::Post => write!(f, "post"),
            ApiAction::Read => write!(f, "read"),
        }
    }
}

/// A documented platform limit: at most `limit` calls per `window_ms`.
#[derive(Debug, Clone, Copy)]
pub struct BudgetRule {
    pub limit: usize,
    pub window_ms: i64,
}

pub struct PlatformBudget {
    rules: HashMap<(String, ApiAction), BudgetRule>,
    /// Timestamps (unix ms) of recorded calls, newest at the back.
    events: Mutex<HashMap<(String, ApiAction), VecDeque<i64>>>,
}

impl PlatformBudget {
    /// Budget limiter with explicit rules. Keys without a rule are
    /// unlimited.
    pub fn new(rules: HashMap<(String, ApiAction), BudgetRule>) -> Self {
        Self {
            rules,
            events: Mutex::new(HashMap::new()),
        }
    }

    /// The documented limits of the supported platforms. Write budgets
    /// are far tighter than read budgets everywhere.
    pub fn standard() -> Self {
        let mut rules = HashMap::new();

        rules.insert(
            ("mastodon".to_string(), ApiAction::Post),
            BudgetRule {
                limit: 30,
                window_ms: 30 * 60 * 1000,
            },
        );
        rules.insert(
            ("mastodon".to_string(), ApiAction::Read),
            BudgetRule {
                limit: 300,
                window_ms: 5 * 60 * 1000,
            },
        );
        rules.insert(
            ("x".to_string(), ApiAction::Post),
            BudgetRule {
                limit: 100,
                window_ms: 24 * 60 * 60 * 1000,
            },
        );
        rules.insert(
            ("x".to_string(), ApiAction::Read),
            BudgetRule {
                limit: 15,
                window_ms: 15 * 60 * 1000,
            },
        );
        rules.insert(
            ("mock".to_string(), ApiAction::Post),
            BudgetRule {
                limit: 1000,
                window_ms: 60 * 1000,
            },
        );
        rules.insert(
            ("mock".to_string(), ApiAction::Read),
            BudgetRule {
                limit: 1000,
                window_ms: 60 * 1000,
            },
        );

        Self::new(rules)
    }

    /// Check the budget for one call and, if allowed, record it.
    ///
    /// The prune, compare, and record happen under one lock, so the
    /// window can never admit more than `limit` calls regardless of
    /// caller concurrency.
    pub fn check_and_record(&self, platform: &str, action: ApiAction, now_ms: i64) -> Decision {
        let Some(rule) = self.rules.get(&(platform.to_string(), action)) else {
            return Decision::allow(u32::MAX);
        };

        let mut events = self.events.lock().unwrap();
        let window = events
            .entry((platform.to_string(), action))
            .or_default();

        let cutoff = now_ms - rule.window_ms;
        while window.front().is_some_and(|ts| *ts <= cutoff) {
            window.pop_front();
        }

        if window.len() >= rule.limit {
            // The oldest call still in the window is the next to age out.
            let retry_after = window
                .front()
                .map(|oldest| oldest + rule.window_ms - now_ms)
                .unwrap_or(rule.window_ms);
            return Decision::deny(retry_after.max(0) as u64);
        }

        window.push_back(now_ms);
        Decision::allow((rule.limit - window.len()) as u32)
    }

    /// Drop keys whose every recorded call has aged out of its window.
    /// Called periodically to bound memory.
    pub fn sweep(&self, now_ms: i64) {
        let mut events = self.events.lock().unwrap();
        events.retain(|key, window| {
            let Some(rule) = self.rules.get(key) else {
                return false;
            };
            let cutoff = now_ms - rule.window_ms;
            while window.front().is_some_and(|ts| *ts <= cutoff) {
                window.pop_front();
            }
            !window.is_empty()
        });
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_budget(limit: usize, window_ms: i64) -> PlatformBudget {
        let mut rules = HashMap::new();
        rules.insert(
            ("testnet".to_string(), ApiAction::Post),
            BudgetRule { limit, window_ms },
        );
        PlatformBudget::new(rules)
    }

    #[test]
    fn test_exactly_limit_calls_allowed_in_burst() {
        let budget = test_budget(10, 60_000);
        let now = 1_000_000;

        let mut allowed = 0;
        let mut denied = 0;
        for _ in 0..15 {
            let decision = budget.check_and_record("testnet", ApiAction::Post, now);
            if decision.allowed {
                allowed += 1;
            } else {
                denied += 1;
                assert!(decision.retry_after_ms > 0);
            }
        }

        assert_eq!(allowed, 10);
        assert_eq!(denied, 5);
    }

    #[test]
    fn test_window_slides() {
        let budget = test_budget(2, 10_000);
        let start = 1_000_000;

        assert!(budget.check_and_record("testnet", ApiAction::Post, start).allowed);
        assert!(
            budget
                .check_and_record("testnet", ApiAction::Post, start + 1_000)
                .allowed
        );
        assert!(
            !budget
                .check_and_record("testnet", ApiAction::Post, start + 2_000)
                .allowed
        );

        // First call ages out at start + 10_000.
        assert!(
            budget
                .check_and_record("testnet", ApiAction::Post, start + 10_001)
                .allowed
        );
    }

    #[test]
    fn test_retry_after_points_at_oldest_expiry() {
        let budget = test_budget(1, 10_000);
        let start = 1_000_000;

        budget.check_and_record("testnet", ApiAction::Post, start);
        let decision = budget.check_and_record("testnet", ApiAction::Post, start + 4_000);

        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_ms, 6_000);
    }

    #[test]
    fn test_actions_budgeted_independently() {
        let mut rules = HashMap::new();
        rules.insert(
            ("testnet".to_string(), ApiAction::Post),
            BudgetRule {
                limit: 1,
                window_ms: 60_000,
            },
        );
        rules.insert(
            ("testnet".to_string(), ApiAction::Read),
            BudgetRule {
                limit: 100,
                window_ms: 60_000,
            },
        );
        let budget = PlatformBudget::new(rules);
        let now = 1_000_000;

        assert!(budget.check_and_record("testnet", ApiAction::Post, now).allowed);
        assert!(!budget.check_and_record("testnet", ApiAction::Post, now).allowed);
        // Exhausting the post budget leaves reads untouched.
        assert!(budget.check_and_record("testnet", ApiAction::Read, now).allowed);
    }

    #[test]
    fn test_unknown_key_is_unlimited() {
        let budget = test_budget(1, 10_000);
        let now = 1_000_000;
        for _ in 0..50 {
            assert!(budget.check_and_record("elsewhere", ApiAction::Read, now).allowed);
        }
    }

    #[test]
    fn test_remaining_counts_down() {
        let budget = test_budget(3, 60_000);
        let now = 1_000_000;

        assert_eq!(budget.check_and_record("testnet", ApiAction::Post, now).remaining, 2);
        assert_eq!(budget.check_and_record("testnet", ApiAction::Post, now).remaining, 1);
        assert_eq!(budget.check_and_record("testnet", ApiAction::Post, now).remaining, 0);
    }

    #[test]
    fn test_sweep_drops_stale_keys() {
        let budget = test_budget(5, 10_000);
        let start = 1_000_000;

        budget.check_and_record("testnet", ApiAction::Post, start);
        assert_eq!(budget.tracked_keys(), 1);

        // Still inside the window: key survives.
        budget.sweep(start + 5_000);
        assert_eq!(budget.tracked_keys(), 1);

        budget.sweep(start + 20_000);
        assert_eq!(budget.tracked_keys(), 0);
    }

    #[test]
    fn test_standard_table_covers_known_platforms() {
        let budget = PlatformBudget::standard();
        let now = 1_000_000;

        for platform in ["mastodon", "x", "mock"] {
            assert!(budget.check_and_record(platform, ApiAction::Post, now).allowed);
            assert!(budget.check_and_record(platform, ApiAction::Read, now).allowed);
        }
    }
}
