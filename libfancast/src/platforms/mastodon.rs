//! Mastodon platform implementation
//!
//! Talks to Mastodon and API-compatible Fediverse servers through the
//! megalodon library. One adapter is bound to one instance URL; the
//! megalodon client itself is built per call because each call carries
//! a different tenant's access token.

use async_trait::async_trait;
use megalodon::{Megalodon, SNS};

use crate::error::{PlatformError, Result};
use crate::platforms::{Platform, RefreshedToken};
use crate::types::{Engagement, HealthStatus};

/// Default when the instance does not report its own limit.
const DEFAULT_CHARACTER_LIMIT: usize = 500;

pub struct MastodonPlatform {
    instance_url: String,
}

impl MastodonPlatform {
    pub fn new(instance_url: String) -> Self {
        let instance_url = if instance_url.starts_with("http://")
            || instance_url.starts_with("https://")
        {
            instance_url
        } else {
            format!("https://{}", instance_url)
        };

        Self { instance_url }
    }

    fn client(&self, access_token: Option<String>) -> Result<Box<dyn Megalodon + Send + Sync>> {
        megalodon::generator(
            SNS::Mastodon,
            self.instance_url.clone(),
            access_token,
            None,
        )
        .map_err(|e| {
            PlatformError::Authentication(format!("Failed to create Mastodon client: {:?}", e))
                .into()
        })
    }
}

#[async_trait]
impl Platform for MastodonPlatform {
    fn name(&self) -> &str {
        "mastodon"
    }

    fn character_limit(&self) -> Option<usize> {
        Some(DEFAULT_CHARACTER_LIMIT)
    }

    async fn post(&self, access_token: &str, content: &str) -> Result<String> {
        self.validate_content(content)?;

        let client = self.client(Some(access_token.to_string()))?;
        let response = client
            .post_status(content.to_string(), None)
            .await
            .map_err(|e| map_megalodon_error(e, "post status"))?;

        let post_id = match response.json {
            megalodon::megalodon::PostStatusOutput::Status(status) => status.id,
            megalodon::megalodon::PostStatusOutput::ScheduledStatus(scheduled) => scheduled.id,
        };

        Ok(post_id)
    }

    async fn pull_engagement(&self, access_token: &str, since: i64) -> Result<Engagement> {
        let client = self.client(Some(access_token.to_string()))?;

        let account = client
            .verify_account_credentials()
            .await
            .map_err(|e| map_megalodon_error(e, "verify credentials"))?;

        let statuses = client
            .get_account_statuses(account.json.id, None)
            .await
            .map_err(|e| map_megalodon_error(e, "fetch statuses"))?;

        let mut engagement = Engagement::default();
        for status in statuses.json {
            if status.created_at.timestamp() < since {
                continue;
            }
            engagement.likes += status.favourites_count as i64;
            engagement.shares += status.reblogs_count as i64;
            engagement.replies += status.replies_count as i64;
            // Mastodon does not expose impression counts.
        }

        Ok(engagement)
    }

    async fn check_health(&self) -> Result<HealthStatus> {
        let client = self.client(None)?;

        let started = std::time::Instant::now();
        client
            .get_instance()
            .await
            .map_err(|e| map_megalodon_error(e, "fetch instance info"))?;

        Ok(HealthStatus {
            healthy: true,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn refresh_token(&self, _refresh_token: &str) -> Result<RefreshedToken> {
        // Mastodon access tokens do not expire; if the stored token has
        // stopped working, the grant was revoked and only the tenant
        // can restore it.
        Err(PlatformError::ReconnectRequired {
            platform: "mastodon".to_string(),
            reason: "access token revoked; tokens on this platform are not refreshable"
                .to_string(),
        }
        .into())
    }
}

/// Map megalodon errors onto the pipeline's error taxonomy.
///
/// 401/403 mean the token is bad, 422 means the content was refused,
/// 429 is a platform rate limit, and 5xx or anything unclassifiable is
/// treated as a transient network problem.
fn map_megalodon_error(error: megalodon::error::Error, context: &str) -> PlatformError {
    // The library reports HTTP failures structurally; fall back to
    // scraping the message for wrapped transport errors.
    let status = match &error {
        megalodon::error::Error::OwnError(own) => own.status,
        megalodon::error::Error::RequestError(e) => e.status().map(|s| s.as_u16()),
        _ => None,
    };
    let error_str = error.to_string();

    match status.or_else(|| extract_http_status(&error_str)) {
        Some(401) | Some(403) => PlatformError::Authentication(format!(
            "Mastodon authentication failed ({}): {}",
            context, error_str
        )),
        Some(422) => PlatformError::Rejected(format!(
            "Mastodon refused the post ({}): {}",
            context, error_str
        )),
        Some(429) => PlatformError::RateLimited {
            message: format!("Mastodon rate limit hit ({}): {}", context, error_str),
            retry_after_secs: 60,
        },
        _ => {
            let lower = error_str.to_lowercase();
            if lower.contains("unauthorized") || lower.contains("forbidden") {
                PlatformError::Authentication(format!(
                    "Mastodon authentication failed ({}): {}",
                    context, error_str
                ))
            } else if lower.contains("rate limit") || lower.contains("too many requests") {
                PlatformError::RateLimited {
                    message: format!("Mastodon rate limit hit ({}): {}", context, error_str),
                    retry_after_secs: 60,
                }
            } else {
                PlatformError::Network(format!("Mastodon error ({}): {}", context, error_str))
            }
        }
    }
}

/// Pull an HTTP status code out of an error message, if one is there.
fn extract_http_status(error_str: &str) -> Option<u16> {
    for prefix in ["HTTP ", "status ", "code: ", "status_code: "] {
        if let Some(pos) = error_str.find(prefix) {
            let after = &error_str[pos + prefix.len()..];
            if let Some(code_str) = after.get(0..3) {
                if let Ok(code) = code_str.parse::<u16>() {
                    if (100..=599).contains(&code) {
                        return Some(code);
                    }
                }
            }
        }
    }
    None
}
