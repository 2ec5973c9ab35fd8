//! End-to-end pipeline tests: scheduled posts flow through the
//! dispatcher into the job queue, and a worker drains the queue against
//! a mock platform. Exercises the whole stack the way the binaries wire
//! it together, on a throwaway SQLite file.

use std::sync::Arc;

use secrecy::SecretString;
use tempfile::TempDir;

use libfancast::config::QueueConfig;
use libfancast::db::Database;
use libfancast::dispatcher::Dispatcher;
use libfancast::limiter::{PlatformBudget, TenantQuota};
use libfancast::platforms::mock::MockPlatform;
use libfancast::platforms::PlatformRegistry;
use libfancast::poller::Poller;
use libfancast::queue::JobQueue;
use libfancast::tokens::TokenManager;
use libfancast::types::{ConnectedAccount, Post, PostStatus, Tier};
use libfancast::vault::CredentialVault;
use libfancast::worker::Worker;

struct Pipeline {
    _temp: TempDir,
    db: Database,
    queue: JobQueue,
    mock: Arc<MockPlatform>,
    vault: Arc<CredentialVault>,
    dispatcher: Dispatcher,
    poller: Poller,
    worker: Worker,
}

async fn build_pipeline() -> Pipeline {
    let temp = TempDir::new().unwrap();
    let db_path = temp.path().join("pipeline.db");
    let db = Database::new(&db_path.to_string_lossy()).await.unwrap();

    let queue = JobQueue::new(db.clone(), QueueConfig::default());
    let vault = Arc::new(CredentialVault::with_master(SecretString::from(
        "pipeline-test-master".to_string(),
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

    let dispatcher = Dispatcher::new(db.clone(), queue.clone(), 25);
    let poller = Poller::new(db.clone(), queue.clone(), 24);
    let worker = Worker::new(
        db.clone(),
        queue.clone(),
        registry,
        tokens,
        Arc::new(PlatformBudget::standard()),
        Arc::new(TenantQuota::new(db.clone())),
        3,
    );

    Pipeline {
        _temp: temp,
        db,
        queue,
        mock,
        vault,
        dispatcher,
        poller,
        worker,
    }
}

async fn connect(pipeline: &Pipeline, tenant: &str, tier: Tier) {
    pipeline.db.upsert_tenant(tenant, tier).await.unwrap();
    let now = chrono::Utc::now().timestamp();
    let account = ConnectedAccount {
        id: uuid::Uuid::new_v4().to_string(),
        tenant_id: tenant.to_string(),
        platform: "mock".to_string(),
        instance_url: None,
        access_token: pipeline.vault.encrypt("token-for-tenant").unwrap(),
        refresh_token: Some(pipeline.vault.encrypt("refresh-for-tenant").unwrap()),
        expires_at: None,
        valid: true,
        last_error: None,
        created_at: now,
        updated_at: now,
    };
    pipeline.db.upsert_account(&account).await.unwrap();
}

async fn drain(pipeline: &Pipeline) -> usize {
    let mut handled = 0;
    while pipeline.worker.poll_once().await.unwrap().is_some() {
        handled += 1;
        assert!(handled < 100, "worker loop did not drain");
    }
    handled
}

#[tokio::test]
async fn scheduled_post_travels_to_the_platform() {
    let pipeline = build_pipeline().await;
    connect(&pipeline, "studio-a", Tier::Studio).await;

    let now = chrono::Utc::now().timestamp();
    let due = Post::scheduled(
        "studio-a".to_string(),
        "mock".to_string(),
        "New album drops friday".to_string(),
        now - 10,
    );
    let future = Post::scheduled(
        "studio-a".to_string(),
        "mock".to_string(),
        "Not yet".to_string(),
        now + 3600,
    );
    pipeline.db.create_post(&due).await.unwrap();
    pipeline.db.create_post(&future).await.unwrap();

    let summary = pipeline.dispatcher.tick(now).await.unwrap();
    assert_eq!(summary.enqueued, 1);

    assert_eq!(drain(&pipeline).await, 1);

    let stored = pipeline.db.get_post(&due.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PostStatus::Posted);
    assert!(stored.platform_post_id.is_some());

    // The future post is untouched until its time comes.
    let stored = pipeline.db.get_post(&future.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PostStatus::Scheduled);

    // The platform saw the decrypted token, not ciphertext.
    let posted = pipeline.mock.posted_content();
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0].0, "token-for-tenant");
    assert_eq!(posted[0].1, "New album drops friday");
}

#[tokio::test]
async fn dispatch_is_idempotent_across_ticks() {
    let pipeline = build_pipeline().await;
    connect(&pipeline, "studio-a", Tier::Studio).await;

    let now = chrono::Utc::now().timestamp();
    let post = Post::scheduled(
        "studio-a".to_string(),
        "mock".to_string(),
        "Once only".to_string(),
        now - 10,
    );
    pipeline.db.create_post(&post).await.unwrap();

    pipeline.dispatcher.tick(now).await.unwrap();
    let second = pipeline.dispatcher.tick(now).await.unwrap();
    assert_eq!(second.enqueued, 0);

    assert_eq!(drain(&pipeline).await, 1);
    assert_eq!(pipeline.mock.post_call_count(), 1);
}

#[tokio::test]
async fn transient_platform_failure_retries_and_recovers() {
    let pipeline = build_pipeline().await;
    // Free tier has exactly one post per day, so this also shows a
    // retried delivery is not charged as a second post.
    connect(&pipeline, "free-a", Tier::Free).await;

    let now = chrono::Utc::now().timestamp();
    let post = Post::scheduled(
        "free-a".to_string(),
        "mock".to_string(),
        "Flaky network day".to_string(),
        now - 10,
    );
    pipeline.db.create_post(&post).await.unwrap();
    pipeline.dispatcher.tick(now).await.unwrap();

    pipeline.mock.set_post_error(Some(
        libfancast::PlatformError::Network("connection reset".to_string()),
    ));
    pipeline.worker.poll_once().await.unwrap().unwrap();

    // The job is backing off; the post stays claimed.
    let stored = pipeline.db.get_post(&post.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PostStatus::Posting);
    let metrics = pipeline.queue.metrics().await.unwrap();
    assert_eq!(metrics.delayed, 1);

    // Fast-forward past the backoff by making the delayed job due now.
    sqlx::query("UPDATE jobs SET run_at = ? WHERE status = 'delayed'")
        .bind(now - 1)
        .execute(pipeline.db.pool())
        .await
        .unwrap();

    pipeline.mock.set_post_error(None);
    assert_eq!(drain(&pipeline).await, 1);

    let stored = pipeline.db.get_post(&post.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PostStatus::Posted);
    assert!(stored.error_message.is_none());
}

#[tokio::test]
async fn lost_worker_is_reaped_and_job_redelivered() {
    let pipeline = build_pipeline().await;
    connect(&pipeline, "studio-a", Tier::Studio).await;

    let now = chrono::Utc::now().timestamp();
    let post = Post::scheduled(
        "studio-a".to_string(),
        "mock".to_string(),
        "Survives a crash".to_string(),
        now - 10,
    );
    pipeline.db.create_post(&post).await.unwrap();
    pipeline.dispatcher.tick(now).await.unwrap();

    // A worker claims the job and then vanishes without acking.
    let lease = pipeline
        .queue
        .claim(&libfancast::JobKind::ALL, now)
        .await
        .unwrap()
        .unwrap();
    std::mem::forget(lease);

    // Past the visibility deadline the reaper hands the job back.
    let later = now + QueueConfig::default().visibility_timeout_secs as i64 + 1;
    assert_eq!(pipeline.queue.reap_expired(later).await.unwrap(), 1);

    assert_eq!(drain(&pipeline).await, 1);
    let stored = pipeline.db.get_post(&post.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PostStatus::Posted);
}

#[tokio::test]
async fn poller_fans_out_and_worker_records_engagement() {
    let pipeline = build_pipeline().await;
    connect(&pipeline, "studio-a", Tier::Studio).await;
    connect(&pipeline, "studio-b", Tier::Creator).await;

    pipeline.mock.set_engagement(libfancast::types::Engagement {
        likes: 7,
        shares: 2,
        replies: 1,
        impressions: 250,
    });

    let summary = pipeline.poller.enqueue_engagement_pulls().await.unwrap();
    assert_eq!(summary.enqueued, 2);

    assert_eq!(drain(&pipeline).await, 2);
    assert_eq!(pipeline.mock.pull_call_count(), 2);

    let (rows,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM engagement")
        .fetch_one(pipeline.db.pool())
        .await
        .unwrap();
    assert_eq!(rows, 2);
}

#[tokio::test]
async fn unhealthy_platform_raises_one_alert() {
    let pipeline = build_pipeline().await;
    connect(&pipeline, "studio-a", Tier::Studio).await;
    pipeline.mock.set_healthy(false);

    // Threshold is 3 consecutive failures; run four probe rounds.
    for _ in 0..4 {
        pipeline.poller.enqueue_health_checks().await.unwrap();
        drain(&pipeline).await;
    }

    let (alerts,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM alerts")
        .fetch_one(pipeline.db.pool())
        .await
        .unwrap();
    assert_eq!(alerts, 1);
}

#[tokio::test]
async fn free_tier_quota_rejects_the_second_daily_post() {
    let pipeline = build_pipeline().await;
    connect(&pipeline, "hobbyist", Tier::Free).await;

    let now = chrono::Utc::now().timestamp();
    for content in ["first of the day", "one too many"] {
        let post = Post::scheduled(
            "hobbyist".to_string(),
            "mock".to_string(),
            content.to_string(),
            now - 10,
        );
        pipeline.db.create_post(&post).await.unwrap();
    }

    pipeline.dispatcher.tick(now).await.unwrap();
    drain(&pipeline).await;

    let (posted,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM posts WHERE status = 'posted'")
            .fetch_one(pipeline.db.pool())
            .await
            .unwrap();
    let (failed,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM posts WHERE status = 'failed' AND error_message LIKE '%quota%'",
    )
    .fetch_one(pipeline.db.pool())
    .await
    .unwrap();
    assert_eq!(posted, 1);
    assert_eq!(failed, 1);
    assert_eq!(pipeline.mock.post_call_count(), 1);
}
