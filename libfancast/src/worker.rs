//! Job execution
//!
//! One handler per job kind, dispatched from an exhaustive match so a
//! new kind cannot be added without deciding what the worker does with
//! it. Handlers return `Ok` when the job is finished business-wise,
//! even when the business outcome is a failed post; `Err` is reserved
//! for "worth retrying" and feeds the queue's backoff machinery.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::db::Database;
use crate::error::{FancastError, PlatformError, Result};
use crate::limiter::{ApiAction, PlatformBudget, QuotaAction, TenantQuota};
use crate::platforms::PlatformRegistry;
use crate::queue::{FailOutcome, JobLease, JobQueue};
use crate::tokens::TokenManager;
use crate::types::{JobKind, JobPayload, PostStatus};

#[derive(Debug, PartialEq, Eq)]
pub enum WorkOutcome {
    Completed,
    Retrying,
    Dead,
}

pub struct Worker {
    db: Database,
    queue: JobQueue,
    registry: Arc<PlatformRegistry>,
    tokens: Arc<TokenManager>,
    budget: Arc<PlatformBudget>,
    quota: Arc<TenantQuota>,
    health_failure_threshold: u32,
}

impl Worker {
    pub fn new(
        db: Database,
        queue: JobQueue,
        registry: Arc<PlatformRegistry>,
        tokens: Arc<TokenManager>,
        budget: Arc<PlatformBudget>,
        quota: Arc<TenantQuota>,
        health_failure_threshold: u32,
    ) -> Self {
        Self {
            db,
            queue,
            registry,
            tokens,
            budget,
            quota,
            health_failure_threshold,
        }
    }

    /// Claim and run one job of any kind. `Ok(None)` means the queue
    /// had nothing eligible.
    pub async fn poll_once(&self) -> Result<Option<WorkOutcome>> {
        let now = chrono::Utc::now().timestamp();
        let Some(lease) = self.queue.claim(&JobKind::ALL, now).await? else {
            return Ok(None);
        };
        Ok(Some(self.process(lease, now).await?))
    }

    async fn process(&self, lease: JobLease, now: i64) -> Result<WorkOutcome> {
        let payload = match lease.job.decode_payload() {
            Ok(payload) => payload,
            Err(e) => {
                // A payload that does not decode will never decode;
                // park it where an operator can see it.
                warn!(job_id = lease.job.id, error = %e, "malformed job payload");
                lease
                    .fail(&format!("malformed payload: {}", e), false, now)
                    .await?;
                return Ok(WorkOutcome::Dead);
            }
        };

        let publish_post_id = match &payload {
            JobPayload::Publish { post_id, .. } => Some(post_id.clone()),
            _ => None,
        };
        let job_id = lease.job.id;

        let result = match payload {
            JobPayload::Publish {
                post_id,
                tenant_id,
                platform,
                content,
                media: _,
            } => {
                self.handle_publish(&post_id, &tenant_id, &platform, &content, now)
                    .await
            }
            JobPayload::PullEngagement {
                tenant_id,
                platform,
                lookback_hours,
            } => {
                self.handle_pull_engagement(&tenant_id, &platform, lookback_hours, now)
                    .await
            }
            JobPayload::HealthCheck {
                tenant_id,
                platform,
            } => self.handle_health_check(&tenant_id, &platform, now).await,
            JobPayload::Report { tenant_id, period } => {
                self.handle_report(&tenant_id, &period, now).await
            }
            JobPayload::Alert {
                tenant_id,
                platform,
                message,
            } => self.handle_alert(&tenant_id, &platform, &message).await,
        };

        match result {
            Ok(()) => {
                lease.ack().await?;
                Ok(WorkOutcome::Completed)
            }
            Err(e) => {
                let retryable = e.is_retryable();
                let message = e.to_string();
                match lease.fail(&message, retryable, now).await? {
                    FailOutcome::Retrying { delay_secs } => {
                        debug!(job_id, delay_secs, "job retrying");
                        Ok(WorkOutcome::Retrying)
                    }
                    FailOutcome::Dead => {
                        // A publish job that dies takes its post with
                        // it; the guard inside mark_failed keeps this
                        // a no-op if the post already settled.
                        if let Some(post_id) = publish_post_id {
                            self.db.mark_failed(&post_id, &message).await?;
                        }
                        Ok(WorkOutcome::Dead)
                    }
                }
            }
        }
    }

    async fn handle_publish(
        &self,
        post_id: &str,
        tenant_id: &str,
        platform: &str,
        content: &str,
        now: i64,
    ) -> Result<()> {
        let Some(post) = self.db.get_post(post_id).await? else {
            warn!(post_id, "publish job for a deleted post, dropping");
            return Ok(());
        };
        // Redelivery of a job whose post already settled is a no-op.
        if post.status != PostStatus::Posting {
            debug!(post_id, status = %post.status, "post already settled, dropping job");
            return Ok(());
        }

        let account = self
            .db
            .get_account(tenant_id, platform)
            .await?
            .ok_or_else(|| {
                FancastError::InvalidInput(format!(
                    "no connected {} account for tenant {}",
                    platform, tenant_id
                ))
            })?;
        let adapter = self.registry.adapter_for(&account)?;

        // Local validation is free; run it before spending any quota.
        if let Err(e) = adapter.validate_content(content) {
            let message = e.to_string();
            warn!(post_id, platform, %message, "content failed validation");
            self.db.mark_failed(post_id, &message).await?;
            return Ok(());
        }

        // Tenant quota before platform budget, so a denied request never
        // charges the platform's write window. The post id keys the
        // spend, so a retried delivery of the same post is not charged
        // a second time.
        let tier = self.db.tenant_tier(tenant_id).await?;
        let quota = self
            .quota
            .check_and_record(tenant_id, tier, QuotaAction::Post, post_id, now)
            .await?;
        if !quota.allowed {
            let message = format!(
                "quota exceeded: posting allowance used up, retry after {}s",
                quota.retry_after_ms / 1000
            );
            info!(post_id, tenant_id, %message, "post denied by tenant quota");
            self.db.mark_failed(post_id, &message).await?;
            return Ok(());
        }

        let budget = self
            .budget
            .check_and_record(platform, ApiAction::Post, now * 1000);
        if !budget.allowed {
            return Err(PlatformError::RateLimited {
                message: format!("{} write budget exhausted", platform),
                retry_after_secs: budget.retry_after_ms / 1000,
            }
            .into());
        }

        let posted = self
            .tokens
            .with_valid_token(tenant_id, platform, |token| {
                let adapter = adapter.clone();
                let content = content.to_string();
                async move { adapter.post(&token, &content).await }
            })
            .await;

        match posted {
            Ok(platform_post_id) => {
                self.db.mark_posted(post_id, &platform_post_id).await?;
                info!(post_id, platform, platform_post_id, "post published");
                Ok(())
            }
            Err(FancastError::Platform(
                error @ (PlatformError::Rejected(_) | PlatformError::Validation(_)),
            )) => {
                // The platform refused this content; resending the
                // same thing will not go better.
                let message = error.to_string();
                warn!(post_id, platform, %message, "post rejected by platform");
                self.db.mark_failed(post_id, &message).await?;
                Ok(())
            }
            Err(FancastError::Platform(error @ PlatformError::ReconnectRequired { .. })) => {
                let message = error.to_string();
                warn!(post_id, platform, %message, "connection dead, failing post");
                self.db.mark_failed(post_id, &message).await?;
                Ok(())
            }
            // Transient failures bubble up into queue retry.
            Err(e) => Err(e),
        }
    }

    async fn handle_pull_engagement(
        &self,
        tenant_id: &str,
        platform: &str,
        lookback_hours: u32,
        now: i64,
    ) -> Result<()> {
        let Some(account) = self.db.get_account(tenant_id, platform).await? else {
            warn!(tenant_id, platform, "engagement pull for a disconnected account, dropping");
            return Ok(());
        };
        let adapter = self.registry.adapter_for(&account)?;

        // Budget is charged only once the pull is known to have a live
        // account behind it.
        let budget = self
            .budget
            .check_and_record(platform, ApiAction::Read, now * 1000);
        if !budget.allowed {
            return Err(PlatformError::RateLimited {
                message: format!("{} read budget exhausted", platform),
                retry_after_secs: budget.retry_after_ms / 1000,
            }
            .into());
        }

        let since = now - (lookback_hours as i64) * 3600;
        let engagement = self
            .tokens
            .with_valid_token(tenant_id, platform, |token| {
                let adapter = adapter.clone();
                async move { adapter.pull_engagement(&token, since).await }
            })
            .await?;

        self.db
            .record_engagement(tenant_id, platform, &engagement, now)
            .await?;
        debug!(
            tenant_id,
            platform,
            likes = engagement.likes,
            shares = engagement.shares,
            replies = engagement.replies,
            "engagement recorded"
        );
        Ok(())
    }

    async fn handle_health_check(&self, tenant_id: &str, platform: &str, now: i64) -> Result<()> {
        let Some(account) = self.db.get_account(tenant_id, platform).await? else {
            return Ok(());
        };
        let adapter = self.registry.adapter_for(&account)?;

        let healthy = match adapter.check_health().await {
            Ok(status) if status.healthy => {
                self.db
                    .record_health_success(tenant_id, platform, status.latency_ms, now)
                    .await?;
                true
            }
            Ok(_) | Err(_) => false,
        };

        if healthy {
            return Ok(());
        }

        let streak = self.db.record_health_failure(tenant_id, platform, now).await?;
        warn!(tenant_id, platform, streak, "platform health probe failed");

        // One alert per failure streak; the alerted flag re-arms on the
        // next success.
        if streak >= self.health_failure_threshold
            && self.db.mark_health_alerted(tenant_id, platform).await?
        {
            let payload = JobPayload::Alert {
                tenant_id: tenant_id.to_string(),
                platform: platform.to_string(),
                message: format!(
                    "{} has failed {} consecutive health checks",
                    platform, streak
                ),
            };
            if let crate::queue::Enqueue::Unavailable(reason) =
                self.queue.enqueue(&payload, None).await
            {
                warn!(tenant_id, platform, %reason, "could not enqueue alert");
            }
        }

        // The probe ran; an unhealthy platform is a result, not a
        // worker failure.
        Ok(())
    }

    async fn handle_alert(&self, tenant_id: &str, platform: &str, message: &str) -> Result<()> {
        self.db.insert_alert(tenant_id, platform, message).await?;
        warn!(tenant_id, platform, message, "alert raised");
        Ok(())
    }

    async fn handle_report(&self, tenant_id: &str, period: &str, now: i64) -> Result<()> {
        let window_secs = match period {
            "daily" => 24 * 60 * 60,
            "weekly" => 7 * 24 * 60 * 60,
            "monthly" => 30 * 24 * 60 * 60,
            other => {
                return Err(FancastError::InvalidInput(format!(
                    "unknown report period '{}'",
                    other
                )))
            }
        };
        let since = now - window_secs;

        let published = self
            .db
            .count_posts_since(tenant_id, PostStatus::Posted, since)
            .await?;
        let failed = self
            .db
            .count_posts_since(tenant_id, PostStatus::Failed, since)
            .await?;

        self.db
            .insert_report(tenant_id, period, published, failed)
            .await?;
        info!(tenant_id, period, published, failed, "report generated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::platforms::mock::MockPlatform;
    use crate::queue::Enqueue;
    use crate::types::{ConnectedAccount, Engagement, Post, Tier};
    use crate::vault::CredentialVault;
    use secrecy::SecretString;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        db: Database,
        queue: JobQueue,
        mock: Arc<MockPlatform>,
        vault: Arc<CredentialVault>,
        budget: Arc<PlatformBudget>,
        worker: Worker,
    }

    async fn setup() -> Fixture {
        let temp = TempDir::new().unwrap();
        let db_path = temp.path().join("test.db");
        let db = Database::new(&db_path.to_string_lossy()).await.unwrap();

        let queue = JobQueue::new(db.clone(), QueueConfig::default());
        let vault = Arc::new(CredentialVault::with_master(SecretString::from(
            "worker-test-master".to_string(),
        )));

        let mock = Arc::new(MockPlatform::success());
        let mut registry = PlatformRegistry::empty();
        registry.register(mock.clone());
        let registry = Arc::new(registry);

        let tokens = Arc::new(TokenManager::new(
            db.clone(),
            vault.clone(),
            registry.clone(),
            300,
        ));
        let budget = Arc::new(PlatformBudget::standard());
        let quota = Arc::new(TenantQuota::new(db.clone()));

        let worker = Worker::new(
            db.clone(),
            queue.clone(),
            registry,
            tokens,
            budget.clone(),
            quota,
            3,
        );

        Fixture {
            _temp: temp,
            db,
            queue,
            mock,
            vault,
            budget,
            worker,
        }
    }

    async fn connect_account(fixture: &Fixture, tenant: &str) {
        let now = chrono::Utc::now().timestamp();
        let account = ConnectedAccount {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant.to_string(),
            platform: "mock".to_string(),
            instance_url: None,
            access_token: fixture.vault.encrypt("valid-token").unwrap(),
            refresh_token: Some(fixture.vault.encrypt("refresh-token").unwrap()),
            expires_at: None,
            valid: true,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        fixture.db.upsert_account(&account).await.unwrap();
    }

    /// A post already claimed into `posting` with its publish job
    /// enqueued, as the dispatcher leaves things.
    async fn claimed_post(fixture: &Fixture, tenant: &str) -> Post {
        let now = chrono::Utc::now().timestamp();
        let post = Post::scheduled(
            tenant.to_string(),
            "mock".to_string(),
            "Fresh episode is out!".to_string(),
            now - 5,
        );
        fixture.db.create_post(&post).await.unwrap();
        assert!(fixture.db.claim_for_posting(&post.id).await.unwrap());

        let payload = JobPayload::Publish {
            post_id: post.id.clone(),
            tenant_id: tenant.to_string(),
            platform: "mock".to_string(),
            content: post.content.clone(),
            media: None,
        };
        match fixture.queue.enqueue(&payload, None).await {
            Enqueue::Accepted(_) => {}
            Enqueue::Unavailable(e) => panic!("enqueue refused: {}", e),
        }
        post
    }

    #[tokio::test]
    async fn test_publish_happy_path() {
        let fixture = setup().await;
        fixture.db.upsert_tenant("t1", Tier::Studio).await.unwrap();
        connect_account(&fixture, "t1").await;
        let post = claimed_post(&fixture, "t1").await;

        let outcome = fixture.worker.poll_once().await.unwrap().unwrap();
        assert_eq!(outcome, WorkOutcome::Completed);

        let stored = fixture.db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PostStatus::Posted);
        assert_eq!(stored.platform_post_id, Some("mock-post-1".to_string()));

        // The adapter saw the decrypted token and the content.
        assert_eq!(
            fixture.mock.posted_content(),
            vec![("valid-token".to_string(), "Fresh episode is out!".to_string())]
        );
        assert_eq!(fixture.queue.metrics().await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn test_publish_noop_when_post_already_settled() {
        let fixture = setup().await;
        fixture.db.upsert_tenant("t1", Tier::Studio).await.unwrap();
        connect_account(&fixture, "t1").await;
        let post = claimed_post(&fixture, "t1").await;

        // Another delivery already finished the post.
        fixture.db.mark_posted(&post.id, "earlier-run").await.unwrap();

        let outcome = fixture.worker.poll_once().await.unwrap().unwrap();
        assert_eq!(outcome, WorkOutcome::Completed);
        assert_eq!(fixture.mock.post_call_count(), 0);

        let stored = fixture.db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(stored.platform_post_id, Some("earlier-run".to_string()));
    }

    #[tokio::test]
    async fn test_platform_rejection_is_terminal_for_the_post() {
        let fixture = setup().await;
        fixture.db.upsert_tenant("t1", Tier::Studio).await.unwrap();
        connect_account(&fixture, "t1").await;
        let post = claimed_post(&fixture, "t1").await;

        fixture
            .mock
            .set_post_error(Some(PlatformError::Rejected("duplicate content".to_string())));

        let outcome = fixture.worker.poll_once().await.unwrap().unwrap();
        // The job completed; the business outcome is a failed post.
        assert_eq!(outcome, WorkOutcome::Completed);
        assert_eq!(fixture.mock.post_call_count(), 1);

        let stored = fixture.db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PostStatus::Failed);
        assert!(stored.error_message.unwrap().contains("duplicate content"));

        // Nothing left to retry.
        assert!(fixture.worker.poll_once().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_platform_rate_limit_retries_with_post_held() {
        let fixture = setup().await;
        fixture.db.upsert_tenant("t1", Tier::Studio).await.unwrap();
        connect_account(&fixture, "t1").await;
        let post = claimed_post(&fixture, "t1").await;

        fixture.mock.set_post_error(Some(PlatformError::RateLimited {
            message: "slow down".to_string(),
            retry_after_secs: 30,
        }));

        let outcome = fixture.worker.poll_once().await.unwrap().unwrap();
        assert_eq!(outcome, WorkOutcome::Retrying);

        // The post stays claimed while the job waits out its backoff.
        let stored = fixture.db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PostStatus::Posting);
        assert_eq!(fixture.queue.metrics().await.unwrap().delayed, 1);
    }

    #[tokio::test]
    async fn test_quota_denial_is_user_visible() {
        let fixture = setup().await;
        // Free tier: one post per day.
        connect_account(&fixture, "t1").await;

        let first = claimed_post(&fixture, "t1").await;
        let outcome = fixture.worker.poll_once().await.unwrap().unwrap();
        assert_eq!(outcome, WorkOutcome::Completed);
        assert_eq!(
            fixture.db.get_post(&first.id).await.unwrap().unwrap().status,
            PostStatus::Posted
        );

        let second = claimed_post(&fixture, "t1").await;
        let outcome = fixture.worker.poll_once().await.unwrap().unwrap();
        assert_eq!(outcome, WorkOutcome::Completed);

        let stored = fixture.db.get_post(&second.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PostStatus::Failed);
        assert!(stored.error_message.unwrap().contains("quota exceeded"));
        // The platform never saw the denied post.
        assert_eq!(fixture.mock.post_call_count(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_retry_does_not_burn_quota() {
        let fixture = setup().await;
        // Free tier: one post per day, so a spend charged twice for the
        // same post would deny its own retry.
        connect_account(&fixture, "t1").await;
        let post = claimed_post(&fixture, "t1").await;

        fixture
            .mock
            .set_post_error(Some(PlatformError::Network("connection reset".to_string())));
        let outcome = fixture.worker.poll_once().await.unwrap().unwrap();
        assert_eq!(outcome, WorkOutcome::Retrying);

        // The platform recovers; bring the delayed job forward.
        fixture.mock.set_post_error(None);
        let now = chrono::Utc::now().timestamp();
        sqlx::query("UPDATE jobs SET run_at = ? WHERE status = 'delayed'")
            .bind(now - 1)
            .execute(fixture.db.pool())
            .await
            .unwrap();

        let outcome = fixture.worker.poll_once().await.unwrap().unwrap();
        assert_eq!(outcome, WorkOutcome::Completed);

        let stored = fixture.db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PostStatus::Posted);
        assert_eq!(fixture.mock.post_call_count(), 2);

        // One published post, one quota event.
        let (events,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM quota_events")
            .fetch_one(fixture.db.pool())
            .await
            .unwrap();
        assert_eq!(events, 1);
    }

    #[tokio::test]
    async fn test_dead_connection_fails_post_and_account() {
        let fixture = setup().await;
        fixture.db.upsert_tenant("t1", Tier::Studio).await.unwrap();
        connect_account(&fixture, "t1").await;
        let post = claimed_post(&fixture, "t1").await;

        // Every token is rejected and refresh cannot help.
        fixture.mock.require_tokens(&[]);
        fixture
            .mock
            .set_refresh_error(Some(PlatformError::Authentication(
                "invalid_grant".to_string(),
            )));

        let outcome = fixture.worker.poll_once().await.unwrap().unwrap();
        assert_eq!(outcome, WorkOutcome::Completed);

        let stored = fixture.db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PostStatus::Failed);
        assert!(stored
            .error_message
            .unwrap()
            .contains("re-authorization"));

        let account = fixture.db.get_account("t1", "mock").await.unwrap().unwrap();
        assert!(!account.valid);
    }

    #[tokio::test]
    async fn test_engagement_pull_records_metrics() {
        let fixture = setup().await;
        connect_account(&fixture, "t1").await;
        fixture.mock.set_engagement(Engagement {
            likes: 12,
            shares: 3,
            replies: 4,
            impressions: 900,
        });

        match fixture
            .queue
            .enqueue(
                &JobPayload::PullEngagement {
                    tenant_id: "t1".to_string(),
                    platform: "mock".to_string(),
                    lookback_hours: 24,
                },
                None,
            )
            .await
        {
            Enqueue::Accepted(_) => {}
            Enqueue::Unavailable(e) => panic!("enqueue refused: {}", e),
        }

        let outcome = fixture.worker.poll_once().await.unwrap().unwrap();
        assert_eq!(outcome, WorkOutcome::Completed);
        assert_eq!(fixture.mock.pull_call_count(), 1);

        let row: (i64, i64) = sqlx::query_as(
            "SELECT likes, impressions FROM engagement WHERE tenant_id = 't1'",
        )
        .fetch_one(fixture.db.pool())
        .await
        .unwrap();
        assert_eq!(row, (12, 900));
    }

    #[tokio::test]
    async fn test_engagement_pull_without_account_spends_no_budget() {
        let fixture = setup().await;
        // No connected account for this tenant.

        match fixture
            .queue
            .enqueue(
                &JobPayload::PullEngagement {
                    tenant_id: "t1".to_string(),
                    platform: "mock".to_string(),
                    lookback_hours: 24,
                },
                None,
            )
            .await
        {
            Enqueue::Accepted(_) => {}
            Enqueue::Unavailable(e) => panic!("enqueue refused: {}", e),
        }

        let outcome = fixture.worker.poll_once().await.unwrap().unwrap();
        assert_eq!(outcome, WorkOutcome::Completed);
        assert_eq!(fixture.mock.pull_call_count(), 0);

        // The dropped job left the shared read window untouched; this
        // check is the window's first spend.
        let now_ms = chrono::Utc::now().timestamp_millis();
        let decision = fixture
            .budget
            .check_and_record("mock", ApiAction::Read, now_ms);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 999);
    }

    #[tokio::test]
    async fn test_health_failures_alert_once_at_threshold() {
        let fixture = setup().await;
        connect_account(&fixture, "t1").await;
        fixture.mock.set_healthy(false);

        let health_job = JobPayload::HealthCheck {
            tenant_id: "t1".to_string(),
            platform: "mock".to_string(),
        };

        // Threshold is 3; probes 1-5 all fail but only one alert fires.
        for _ in 0..5 {
            fixture.queue.enqueue(&health_job, None).await;
            let outcome = fixture.worker.poll_once().await.unwrap().unwrap();
            assert_eq!(outcome, WorkOutcome::Completed);
        }

        // Run whatever alert jobs were enqueued.
        while fixture.worker.poll_once().await.unwrap().is_some() {}

        let (alerts,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM alerts WHERE tenant_id = 't1'")
                .fetch_one(fixture.db.pool())
                .await
                .unwrap();
        assert_eq!(alerts, 1);

        // Recovery re-arms alerting for the next streak.
        fixture.mock.set_healthy(true);
        fixture.queue.enqueue(&health_job, None).await;
        fixture.worker.poll_once().await.unwrap().unwrap();

        fixture.mock.set_healthy(false);
        for _ in 0..3 {
            fixture.queue.enqueue(&health_job, None).await;
            fixture.worker.poll_once().await.unwrap().unwrap();
        }
        while fixture.worker.poll_once().await.unwrap().is_some() {}

        let (alerts,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM alerts WHERE tenant_id = 't1'")
                .fetch_one(fixture.db.pool())
                .await
                .unwrap();
        assert_eq!(alerts, 2);
    }

    #[tokio::test]
    async fn test_report_counts_published_and_failed() {
        let fixture = setup().await;
        fixture.db.upsert_tenant("t1", Tier::Studio).await.unwrap();
        connect_account(&fixture, "t1").await;

        // One post succeeds, one is rejected.
        claimed_post(&fixture, "t1").await;
        fixture.worker.poll_once().await.unwrap().unwrap();

        fixture
            .mock
            .set_post_error(Some(PlatformError::Rejected("nope".to_string())));
        claimed_post(&fixture, "t1").await;
        fixture.worker.poll_once().await.unwrap().unwrap();

        fixture
            .queue
            .enqueue(
                &JobPayload::Report {
                    tenant_id: "t1".to_string(),
                    period: "daily".to_string(),
                },
                None,
            )
            .await;
        fixture.worker.poll_once().await.unwrap().unwrap();

        let row: (i64, i64) = sqlx::query_as(
            "SELECT posts_published, posts_failed FROM reports WHERE tenant_id = 't1'",
        )
        .fetch_one(fixture.db.pool())
        .await
        .unwrap();
        assert_eq!(row, (1, 1));
    }

    #[tokio::test]
    async fn test_malformed_payload_goes_dead() {
        let fixture = setup().await;
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO jobs (kind, payload, status, attempts, created_at, updated_at)
            VALUES ('publish', 'this is not json', 'waiting', 0, ?, ?)
            "#,
        )
        .bind(now)
        .bind(now)
        .execute(fixture.db.pool())
        .await
        .unwrap();

        let outcome = fixture.worker.poll_once().await.unwrap().unwrap();
        assert_eq!(outcome, WorkOutcome::Dead);

        let failed = fixture.queue.recent_failed(10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert!(failed[0]
            .last_error
            .as_ref()
            .unwrap()
            .contains("malformed payload"));
    }
}
