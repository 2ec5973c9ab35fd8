//! Scheduled post dispatcher
//!
//! Each tick selects due `scheduled` posts, claims them one at a time
//! with a conditional status flip, and enqueues a publish job for each
//! claim won. The claim makes ticks safe to run concurrently (two
//! instances, or a cron overlap): losing the flip just means another
//! dispatcher took the post. If the queue cannot accept the job, the
//! claim is rolled back so the post is picked up again next tick.

use tracing::{debug, error, info, warn};

use crate::db::Database;
use crate::queue::{Enqueue, JobQueue};
use crate::types::JobPayload;

#[derive(Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct TickSummary {
    /// Due posts seen this tick.
    pub due: usize,
    /// Publish jobs enqueued.
    pub enqueued: usize,
    /// Claims rolled back because the queue was unavailable.
    pub reverted: usize,
    /// Posts skipped because another dispatcher claimed them first.
    pub lost_races: usize,
    /// Database errors, logged and skipped.
    pub errors: usize,
}

pub struct Dispatcher {
    db: Database,
    queue: JobQueue,
    batch_size: u32,
}

impl Dispatcher {
    pub fn new(db: Database, queue: JobQueue, batch_size: u32) -> Self {
        Self {
            db,
            queue,
            batch_size,
        }
    }

    /// One dispatch pass over posts due at `now`.
    pub async fn tick(&self, now: i64) -> crate::error::Result<TickSummary> {
        let due = self.db.due_scheduled_posts(now, self.batch_size).await?;
        let mut summary = TickSummary {
            due: due.len(),
            ..TickSummary::default()
        };

        for post in due {
            match self.db.claim_for_posting(&post.id).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(post_id = %post.id, "post claimed by another dispatcher");
                    summary.lost_races += 1;
                    continue;
                }
                Err(e) => {
                    error!(post_id = %post.id, error = %e, "claim failed");
                    summary.errors += 1;
                    continue;
                }
            }

            let payload = JobPayload::Publish {
                post_id: post.id.clone(),
                tenant_id: post.tenant_id.clone(),
                platform: post.platform.clone(),
                content: post.content.clone(),
                media: post.media.clone(),
            };

            match self.queue.enqueue(&payload, None).await {
                Enqueue::Accepted(job_id) => {
                    debug!(post_id = %post.id, job_id, "publish job enqueued");
                    summary.enqueued += 1;
                }
                Enqueue::Unavailable(reason) => {
                    warn!(
                        post_id = %post.id,
                        %reason,
                        "queue unavailable, returning post to schedule"
                    );
                    if let Err(e) = self.db.revert_unscheduled_enqueue(&post.id).await {
                        // The post stays in `posting` until an operator
                        // intervenes; losing it silently would be worse.
                        error!(post_id = %post.id, error = %e, "revert failed");
                        summary.errors += 1;
                    } else {
                        summary.reverted += 1;
                    }
                }
            }
        }

        if summary.due > 0 {
            info!(
                due = summary.due,
                enqueued = summary.enqueued,
                reverted = summary.reverted,
                lost_races = summary.lost_races,
                errors = summary.errors,
                "dispatch tick"
            );
        }
        Ok(summary)
    }
}
