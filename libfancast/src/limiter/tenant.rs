//! Per-tenant subscription quota limiter
//!
//! Sliding-window counters over the shared `quota_events` table so the
//! same tenant cannot exceed their tier's allowance across multiple
//! application instances. When the store is unreachable the limiter
//! falls back to a local in-memory window, trading strict global
//! accuracy for availability; a denial is always surfaced to the
//! tenant as "quota exceeded", never a silent drop.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;

use tracing::warn;

use crate::db::Database;
use crate::error::{DbError, Result};
use crate::limiter::Decision;
use crate::types::Tier;

/// What a tenant is spending quota on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaAction {
    Generate,
    Post,
}

impl fmt::Display for QuotaAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaAction::Generate => write!(f, "generate"),
            QuotaAction::Post => write!(f, "post"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaPeriod {
    Day,
    Month,
}

impl QuotaPeriod {
    const ALL: [QuotaPeriod; 2] = [QuotaPeriod::Day, QuotaPeriod::Month];

    fn window_secs(&self) -> i64 {
        match self {
            QuotaPeriod::Day => 24 * 60 * 60,
            // Rolling 30 days, not a calendar month.
            QuotaPeriod::Month => 30 * 24 * 60 * 60,
        }
    }
}

/// Tier allowance for one `(action, period)`, `None` meaning unlimited.
fn limit_for(tier: Tier, action: QuotaAction, period: QuotaPeriod) -> Option<u32> {
    use QuotaAction::*;
    use QuotaPeriod::*;

    match (tier, action, period) {
        (Tier::Free, Generate, Day) => Some(5),
        (Tier::Free, Post, Day) => Some(1),
        (Tier::Free, Post, Month) => Some(15),

        (Tier::Creator, Generate, Day) => Some(50),
        (Tier::Creator, Post, Day) => Some(10),
        (Tier::Creator, Post, Month) => Some(300),

        (Tier::Studio, Generate, Day) => Some(500),
        (Tier::Studio, Post, Day) => Some(100),
        (Tier::Studio, Post, Month) => Some(3000),

        (_, Generate, Month) => None,
    }
}

/// How many platforms a tenant may keep connected at once. Checked at
/// connect time against the live account count, not event-windowed.
pub fn connected_platform_limit(tier: Tier) -> u32 {
    match tier {
        Tier::Free => 2,
        Tier::Creator => 5,
        Tier::Studio => 10,
    }
}

pub struct TenantQuota {
    db: Database,
    /// Local windows used only while the shared store is unreachable.
    fallback: Mutex<HashMap<String, VecDeque<(i64, String)>>>,
}

impl TenantQuota {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            fallback: Mutex::new(HashMap::new()),
        }
    }

    /// Check every applicable period window for this action and, if all
    /// allow, record one spend under `key`. A key that has already been
    /// charged is allowed through without spending again, so redelivery
    /// of the same unit of work never consumes quota twice. `now` is
    /// unix seconds.
    pub async fn check_and_record(
        &self,
        tenant_id: &str,
        tier: Tier,
        action: QuotaAction,
        key: &str,
        now: i64,
    ) -> Result<Decision> {
        let scope = format!("{}:{}", tenant_id, action);

        match self.check_via_store(&scope, key, tier, action, now).await {
            Ok(decision) => Ok(decision),
            Err(e) => {
                warn!(
                    error = %e,
                    %scope,
                    "quota store unreachable, falling back to local window"
                );
                Ok(self.check_in_memory(&scope, key, tier, action, now))
            }
        }
    }

    async fn check_via_store(
        &self,
        scope: &str,
        key: &str,
        tier: Tier,
        action: QuotaAction,
        now: i64,
    ) -> Result<Decision> {
        let (prior,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM quota_events WHERE scope = ? AND key = ?
            "#,
        )
        .bind(scope)
        .bind(key)
        .fetch_one(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;
        let charged = prior > 0;

        let mut remaining = u32::MAX;

        for period in QuotaPeriod::ALL {
            let Some(limit) = limit_for(tier, action, period) else {
                continue;
            };

            let cutoff = now - period.window_secs();
            let row: (i64, Option<i64>) = sqlx::query_as(
                r#"
                SELECT COUNT(*), MIN(ts) FROM quota_events
                WHERE scope = ? AND ts > ?
                "#,
            )
            .bind(scope)
            .bind(cutoff)
            .fetch_one(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;

            let (count, oldest) = row;
            if !charged && count >= limit as i64 {
                let retry_after_secs = oldest
                    .map(|ts| ts + period.window_secs() - now)
                    .unwrap_or(period.window_secs());
                return Ok(Decision::deny(retry_after_secs.max(0) as u64 * 1000));
            }

            let spent = count as u32 + if charged { 0 } else { 1 };
            remaining = remaining.min(limit.saturating_sub(spent));
        }

        if !charged {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO quota_events (scope, key, ts) VALUES (?, ?, ?)
                "#,
            )
            .bind(scope)
            .bind(key)
            .bind(now)
            .execute(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;
        }

        Ok(Decision::allow(remaining))
    }

    fn check_in_memory(
        &self,
        scope: &str,
        key: &str,
        tier: Tier,
        action: QuotaAction,
        now: i64,
    ) -> Decision {
        let mut windows = self.fallback.lock().unwrap();
        let events = windows.entry(scope.to_string()).or_default();

        // Events older than the longest applicable window are useless.
        let horizon = now - QuotaPeriod::Month.window_secs();
        while events.front().is_some_and(|(ts, _)| *ts <= horizon) {
            events.pop_front();
        }

        let charged = events.iter().any(|(_, k)| k == key);

        let mut remaining = u32::MAX;
        for period in QuotaPeriod::ALL {
            let Some(limit) = limit_for(tier, action, period) else {
                continue;
            };

            let cutoff = now - period.window_secs();
            let in_window: Vec<i64> = events
                .iter()
                .filter(|(ts, _)| *ts > cutoff)
                .map(|(ts, _)| *ts)
                .collect();

            if !charged && in_window.len() >= limit as usize {
                let retry_after_secs = in_window
                    .first()
                    .map(|ts| ts + period.window_secs() - now)
                    .unwrap_or(period.window_secs());
                return Decision::deny(retry_after_secs.max(0) as u64 * 1000);
            }

            let spent = in_window.len() as u32 + if charged { 0 } else { 1 };
            remaining = remaining.min(limit.saturating_sub(spent));
        }

        if !charged {
            events.push_back((now, key.to_string()));
        }
        Decision::allow(remaining)
    }

    /// Delete events older than every window they could count toward.
    pub async fn cleanup(&self, now: i64) -> Result<u64> {
        let horizon = now - QuotaPeriod::Month.window_secs() - 24 * 60 * 60;
        let result = sqlx::query(
            r#"
            DELETE FROM quota_events WHERE ts < ?
            "#,
        )
        .bind(horizon)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected())
    }
}
