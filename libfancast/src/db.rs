//! Database operations for Fancast
//!
//! One facade over the durable store. Post status changes go through
//! `transition_post`, which enforces the lifecycle table; the only
//! exception is `revert_unscheduled_enqueue`, the dispatcher's
//! queue-unavailable revert path.

use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::path::Path;

use crate::error::{DbError, FancastError, Result};
use crate::types::{ConnectedAccount, Engagement, Post, PostStatus, Tier};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        // Forward slashes work on both Windows and Unix; mode=rwc creates
        // the file if it does not exist.
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));

        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ========================================================================
    // Posts
    // ========================================================================

    pub async fn create_post(&self, post: &Post) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO posts
                (id, tenant_id, platform, content, media, status, scheduled_at,
                 platform_post_id, error_message, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.id)
        .bind(&post.tenant_id)
        .bind(&post.platform)
        .bind(&post.content)
        .bind(&post.media)
        .bind(post.status.as_str())
        .bind(post.scheduled_at)
        .bind(&post.platform_post_id)
        .bind(&post.error_message)
        .bind(post.created_at)
        .bind(post.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_post(&self, post_id: &str) -> Result<Option<Post>> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, platform, content, media, status, scheduled_at,
                   platform_post_id, error_message, created_at, updated_at
            FROM posts WHERE id = ?
            "#,
        )
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(row_to_post))
    }

    /// Posts due for dispatch: scheduled, past due, oldest first, capped.
    pub async fn due_scheduled_posts(&self, now: i64, limit: u32) -> Result<Vec<Post>> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, platform, content, media, status, scheduled_at,
                   platform_post_id, error_message, created_at, updated_at
            FROM posts
            WHERE status = 'scheduled' AND scheduled_at <= ?
            ORDER BY scheduled_at ASC
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows.into_iter().map(row_to_post).collect())
    }

    /// Atomic, lifecycle-checked status transition.
    ///
    /// Returns `Ok(true)` iff the row was still in `from` and moved to
    /// `to`. A legal transition that finds the row in another status
    /// returns `Ok(false)` (somebody else won the race); an illegal
    /// transition is rejected outright.
    pub async fn transition_post(
        &self,
        post_id: &str,
        from: PostStatus,
        to: PostStatus,
    ) -> Result<bool> {
        if !from.can_transition(to) {
            return Err(FancastError::InvalidInput(format!(
                "illegal post transition {} -> {}",
                from, to
            )));
        }

        let result = sqlx::query(
            r#"
            UPDATE posts SET status = ?, updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(to.as_str())
        .bind(chrono::Utc::now().timestamp())
        .bind(post_id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// The dispatcher's claim: `scheduled -> posting`, exactly once.
    pub async fn claim_for_posting(&self, post_id: &str) -> Result<bool> {
        self.transition_post(post_id, PostStatus::Scheduled, PostStatus::Posting)
            .await
    }

    /// The one legitimate reversal of `posting`: the job queue could not
    /// accept the publish job, so the post goes back to `scheduled` for
    /// the next tick. Only the dispatcher calls this.
    pub async fn revert_unscheduled_enqueue(&self, post_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE posts SET status = 'scheduled', updated_at = ?
            WHERE id = ? AND status = 'posting'
            "#,
        )
        .bind(chrono::Utc::now().timestamp())
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Publish success. Guarded on `posting` so a redelivered job whose
    /// post already completed is a no-op.
    pub async fn mark_posted(&self, post_id: &str, platform_post_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET status = 'posted', platform_post_id = ?, error_message = NULL, updated_at = ?
            WHERE id = ? AND status = 'posting'
            "#,
        )
        .bind(platform_post_id)
        .bind(chrono::Utc::now().timestamp())
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Publish failure, terminal for the post. Same `posting` guard.
    pub async fn mark_failed(&self, post_id: &str, error_message: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET status = 'failed', error_message = ?, updated_at = ?
            WHERE id = ? AND status = 'posting'
            "#,
        )
        .bind(error_message)
        .bind(chrono::Utc::now().timestamp())
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Move a draft onto the schedule.
    pub async fn schedule_post(&self, post_id: &str, scheduled_at: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE posts SET status = 'scheduled', scheduled_at = ?, updated_at = ?
            WHERE id = ? AND status = 'draft'
            "#,
        )
        .bind(scheduled_at)
        .bind(chrono::Utc::now().timestamp())
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn count_posts_since(
        &self,
        tenant_id: &str,
        status: PostStatus,
        since: i64,
    ) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM posts
            WHERE tenant_id = ? AND status = ? AND updated_at >= ?
            "#,
        )
        .bind(tenant_id)
        .bind(status.as_str())
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.0)
    }

    // ========================================================================
    // Connected accounts
    // ========================================================================

    /// Insert or refresh a connection. A brand-new `(tenant, platform)`
    /// pair counts against the tier's connected-platform cap; refreshing
    /// an existing connection never does.
    pub async fn upsert_account(&self, account: &ConnectedAccount) -> Result<()> {
        let existing = self
            .get_account(&account.tenant_id, &account.platform)
            .await?;
        if existing.is_none() {
            let tier = self.tenant_tier(&account.tenant_id).await?;
            let cap = crate::limiter::connected_platform_limit(tier) as i64;
            let connected = self.count_valid_accounts(&account.tenant_id).await?;
            if connected >= cap {
                return Err(FancastError::InvalidInput(format!(
                    "tenant {} already has {} connected platforms ({} tier cap)",
                    account.tenant_id,
                    connected,
                    tier.as_str()
                )));
            }
        }

        sqlx::query(
            r#"
            INSERT INTO connected_accounts
                (id, tenant_id, platform, instance_url, access_token, refresh_token,
                 expires_at, valid, last_error, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (tenant_id, platform) DO UPDATE SET
                instance_url = excluded.instance_url,
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                valid = excluded.valid,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&account.id)
        .bind(&account.tenant_id)
        .bind(&account.platform)
        .bind(&account.instance_url)
        .bind(&account.access_token)
        .bind(&account.refresh_token)
        .bind(account.expires_at)
        .bind(account.valid as i32)
        .bind(&account.last_error)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_account(
        &self,
        tenant_id: &str,
        platform: &str,
    ) -> Result<Option<ConnectedAccount>> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, platform, instance_url, access_token, refresh_token,
                   expires_at, valid, last_error, created_at, updated_at
            FROM connected_accounts
            WHERE tenant_id = ? AND platform = ?
            "#,
        )
        .bind(tenant_id)
        .bind(platform)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(row_to_account))
    }

    /// All accounts still usable for polling fan-out.
    pub async fn list_valid_accounts(&self) -> Result<Vec<ConnectedAccount>> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, platform, instance_url, access_token, refresh_token,
                   expires_at, valid, last_error, created_at, updated_at
            FROM connected_accounts
            WHERE valid = 1
            ORDER BY tenant_id, platform
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows.into_iter().map(row_to_account).collect())
    }

    pub async fn count_valid_accounts(&self, tenant_id: &str) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM connected_accounts WHERE tenant_id = ? AND valid = 1
            "#,
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.0)
    }

    /// Store freshly refreshed tokens. Token and expiry land in one
    /// statement so a crash cannot leave them out of step.
    pub async fn update_account_tokens(
        &self,
        tenant_id: &str,
        platform: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE connected_accounts SET
                access_token = ?,
                refresh_token = COALESCE(?, refresh_token),
                expires_at = ?,
                valid = 1,
                last_error = NULL,
                updated_at = ?
            WHERE tenant_id = ? AND platform = ?
            "#,
        )
        .bind(access_token)
        .bind(refresh_token)
        .bind(expires_at)
        .bind(chrono::Utc::now().timestamp())
        .bind(tenant_id)
        .bind(platform)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Clear the validity flag after a non-retryable refresh failure.
    /// The row stays until the tenant explicitly disconnects.
    pub async fn invalidate_account(
        &self,
        tenant_id: &str,
        platform: &str,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE connected_accounts SET valid = 0, last_error = ?, updated_at = ?
            WHERE tenant_id = ? AND platform = ?
            "#,
        )
        .bind(error)
        .bind(chrono::Utc::now().timestamp())
        .bind(tenant_id)
        .bind(platform)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Explicit user disconnect.
    pub async fn delete_account(&self, tenant_id: &str, platform: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM connected_accounts WHERE tenant_id = ? AND platform = ?
            "#,
        )
        .bind(tenant_id)
        .bind(platform)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    // ========================================================================
    // Tenants
    // ========================================================================

    pub async fn upsert_tenant(&self, tenant_id: &str, tier: Tier) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tenants (id, tier, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET tier = excluded.tier
            "#,
        )
        .bind(tenant_id)
        .bind(tier.as_str())
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Unknown tenants fall back to the free tier.
    pub async fn tenant_tier(&self, tenant_id: &str) -> Result<Tier> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT tier FROM tenants WHERE id = ?
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row
            .and_then(|r| Tier::parse(&r.0))
            .unwrap_or(Tier::Free))
    }

    // ========================================================================
    // Engagement, health, alerts, reports
    // ========================================================================

    pub async fn record_engagement(
        &self,
        tenant_id: &str,
        platform: &str,
        engagement: &Engagement,
        pulled_at: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO engagement
                (tenant_id, platform, likes, shares, replies, impressions, pulled_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(tenant_id)
        .bind(platform)
        .bind(engagement.likes)
        .bind(engagement.shares)
        .bind(engagement.replies)
        .bind(engagement.impressions)
        .bind(pulled_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// A passing probe resets the failure streak and re-arms alerting.
    pub async fn record_health_success(
        &self,
        tenant_id: &str,
        platform: &str,
        latency_ms: u64,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO platform_health
                (tenant_id, platform, consecutive_failures, last_latency_ms,
                 last_checked_at, alerted)
            VALUES (?, ?, 0, ?, ?, 0)
            ON CONFLICT (tenant_id, platform) DO UPDATE SET
                consecutive_failures = 0,
                last_latency_ms = excluded.last_latency_ms,
                last_checked_at = excluded.last_checked_at,
                alerted = 0
            "#,
        )
        .bind(tenant_id)
        .bind(platform)
        .bind(latency_ms as i64)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Records a failed probe and returns the new streak length.
    pub async fn record_health_failure(
        &self,
        tenant_id: &str,
        platform: &str,
        now: i64,
    ) -> Result<u32> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO platform_health
                (tenant_id, platform, consecutive_failures, last_checked_at, alerted)
            VALUES (?, ?, 1, ?, 0)
            ON CONFLICT (tenant_id, platform) DO UPDATE SET
                consecutive_failures = consecutive_failures + 1,
                last_checked_at = excluded.last_checked_at
            RETURNING consecutive_failures
            "#,
        )
        .bind(tenant_id)
        .bind(platform)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.0 as u32)
    }

    /// Marks the streak as alerted. Returns false if an alert was
    /// already recorded for this streak, so only one alert job fires.
    pub async fn mark_health_alerted(&self, tenant_id: &str, platform: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE platform_health SET alerted = 1
            WHERE tenant_id = ? AND platform = ? AND alerted = 0
            "#,
        )
        .bind(tenant_id)
        .bind(platform)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn insert_alert(
        &self,
        tenant_id: &str,
        platform: &str,
        message: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO alerts (tenant_id, platform, message, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(tenant_id)
        .bind(platform)
        .bind(message)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn insert_report(
        &self,
        tenant_id: &str,
        period: &str,
        posts_published: i64,
        posts_failed: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO reports (tenant_id, period, posts_published, posts_failed, generated_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(tenant_id)
        .bind(period)
        .bind(posts_published)
        .bind(posts_failed)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }
}

fn row_to_post(r: sqlx::sqlite::SqliteRow) -> Post {
    Post {
        id: r.get("id"),
        tenant_id: r.get("tenant_id"),
        platform: r.get("platform"),
        content: r.get("content"),
        media: r.get("media"),
        status: PostStatus::parse(&r.get::<String, _>("status")).unwrap_or(PostStatus::Draft),
        scheduled_at: r.get("scheduled_at"),
        platform_post_id: r.get("platform_post_id"),
        error_message: r.get("error_message"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    }
}

fn row_to_account(r: sqlx::sqlite::SqliteRow) -> ConnectedAccount {
    ConnectedAccount {
        id: r.get("id"),
        tenant_id: r.get("tenant_id"),
        platform: r.get("platform"),
        instance_url: r.get("instance_url"),
        access_token: r.get("access_token"),
        refresh_token: r.get("refresh_token"),
        expires_at: r.get("expires_at"),
        valid: r.get::<i32, _>("valid") != 0,
        last_error: r.get("last_error"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    }
}
