//! Platform abstraction and implementations
//!
//! Every platform integration implements the same trait so the rest of
//! the pipeline never special-cases a network. Adapters are stateless:
//! access tokens come in per call, which keeps one adapter usable for
//! every tenant connected to that platform.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::PlatformsConfig;
use crate::error::{PlatformError, Result};
use crate::types::{ConnectedAccount, Engagement, HealthStatus};

pub mod mastodon;
pub mod x;

// Mock platform is available for all builds (not just tests) to support
// integration tests.
pub mod mock;

/// A fresh access token issued by a platform's token endpoint.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    /// Some endpoints rotate the refresh token; `None` means keep the
    /// current one.
    pub refresh_token: Option<String>,
    /// Lifetime in seconds, when the platform reports one.
    pub expires_in: Option<i64>,
}

/// Unified interface over social platform APIs.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Lowercase identifier ("mastodon", "x", "mock").
    fn name(&self) -> &str;

    /// Maximum post length, or `None` when the platform has no hard limit.
    fn character_limit(&self) -> Option<usize>;

    /// Check content against platform rules before spending an API call.
    fn validate_content(&self, content: &str) -> Result<()> {
        if content.trim().is_empty() {
            return Err(PlatformError::Validation("Content cannot be empty".to_string()).into());
        }

        if let Some(limit) = self.character_limit() {
            let char_count = content.chars().count();
            if char_count > limit {
                return Err(PlatformError::Validation(format!(
                    "Content exceeds {}'s {} character limit (current: {} characters)",
                    self.name(),
                    limit,
                    char_count
                ))
                .into());
            }
        }

        Ok(())
    }

    /// Publish content, returning the platform-assigned post id.
    async fn post(&self, access_token: &str, content: &str) -> Result<String>;

    /// Aggregate engagement across the account's recent posts, looking
    /// back `since` (unix seconds).
    async fn pull_engagement(&self, access_token: &str, since: i64) -> Result<Engagement>;

    /// Probe platform availability. Does not require a token.
    async fn check_health(&self) -> Result<HealthStatus>;

    /// Exchange a refresh token for a new access token. Platforms whose
    /// tokens never expire return `ReconnectRequired`, since a caller
    /// asking for a refresh there means the stored token is dead.
    async fn refresh_token(&self, refresh_token: &str) -> Result<RefreshedToken>;
}

/// Resolves a connected account to its platform adapter.
///
/// X and mock adapters are shared singletons; the Mastodon adapter is
/// built per account because it is bound to the account's instance URL.
pub struct PlatformRegistry {
    shared: HashMap<String, Arc<dyn Platform>>,
}

impl PlatformRegistry {
    /// Registry with the standard adapters enabled by configuration.
    pub fn standard(config: &PlatformsConfig) -> Self {
        let mut shared: HashMap<String, Arc<dyn Platform>> = HashMap::new();
        shared.insert("mock".to_string(), Arc::new(mock::MockPlatform::success()));

        if let Some(x_config) = &config.x {
            shared.insert(
                "x".to_string(),
                Arc::new(x::XPlatform::new(
                    x_config.client_id.clone(),
                    x_config.client_secret.clone(),
                )),
            );
        }

        Self { shared }
    }

    /// Empty registry. Test seam; pair with `register`.
    pub fn empty() -> Self {
        Self {
            shared: HashMap::new(),
        }
    }

    /// Register (or replace) a shared adapter under its own name.
    pub fn register(&mut self, platform: Arc<dyn Platform>) {
        self.shared.insert(platform.name().to_string(), platform);
    }

    /// Adapter for a connected account.
    pub fn adapter_for(&self, account: &ConnectedAccount) -> Result<Arc<dyn Platform>> {
        if account.platform == "mastodon" {
            // Allow tests to override mastodon with a registered mock.
            if let Some(adapter) = self.shared.get("mastodon") {
                return Ok(adapter.clone());
            }

            let instance_url = account.instance_url.as_ref().ok_or_else(|| {
                PlatformError::Validation(
                    "mastodon account has no instance URL".to_string(),
                )
            })?;
            return Ok(Arc::new(mastodon::MastodonPlatform::new(
                instance_url.clone(),
            )));
        }

        self.shared
            .get(&account.platform)
            .cloned()
            .ok_or_else(|| {
                PlatformError::Validation(format!(
                    "no adapter registered for platform '{}'",
                    account.platform
                ))
                .into()
            })
    }
}
