//! Health and engagement polling fan-out
//!
//! On a periodic trigger, fans one pull-engagement or health-check job
//! out per valid connected account. The jobs themselves run through the
//! normal queue machinery, so a slow or flaky platform only delays its
//! own account's poll.

use tracing::{info, warn};

use crate::db::Database;
use crate::queue::{Enqueue, JobQueue};
use crate::types::JobPayload;

#[derive(Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct PollSummary {
    /// Valid connected accounts considered.
    pub accounts: usize,
    pub enqueued: usize,
    /// Accounts skipped because the queue refused the job.
    pub skipped: usize,
}

pub struct Poller {
    db: Database,
    queue: JobQueue,
    lookback_hours: u32,
}

impl Poller {
    pub fn new(db: Database, queue: JobQueue, lookback_hours: u32) -> Self {
        Self {
            db,
            queue,
            lookback_hours,
        }
    }

    /// Enqueue one engagement pull per valid connected account.
    pub async fn enqueue_engagement_pulls(&self) -> crate::error::Result<PollSummary> {
        self.fan_out("engagement", |account| JobPayload::PullEngagement {
            tenant_id: account.0,
            platform: account.1,
            lookback_hours: self.lookback_hours,
        })
        .await
    }

    /// Enqueue one health probe per valid connected account.
    pub async fn enqueue_health_checks(&self) -> crate::error::Result<PollSummary> {
        self.fan_out("health", |account| JobPayload::HealthCheck {
            tenant_id: account.0,
            platform: account.1,
        })
        .await
    }

    async fn fan_out<F>(&self, what: &str, make_payload: F) -> crate::error::Result<PollSummary>
    where
        F: Fn((String, String)) -> JobPayload,
    {
        let accounts = self.db.list_valid_accounts().await?;
        let mut summary = PollSummary {
            accounts: accounts.len(),
            ..PollSummary::default()
        };

        for account in accounts {
            let payload = make_payload((account.tenant_id.clone(), account.platform.clone()));
            match self.queue.enqueue(&payload, None).await {
                Enqueue::Accepted(_) => summary.enqueued += 1,
                Enqueue::Unavailable(reason) => {
                    warn!(
                        tenant_id = %account.tenant_id,
                        platform = %account.platform,
                        %reason,
                        "queue refused poll job"
                    );
                    summary.skipped += 1;
                }
            }
        }

        info!(
            what,
            accounts = summary.accounts,
            enqueued = summary.enqueued,
            skipped = summary.skipped,
            "poll fan-out"
        );
        Ok(summary)
    }
}
