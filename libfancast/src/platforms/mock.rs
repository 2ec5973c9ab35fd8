//! Mock platform implementation for testing
//!
//! A configurable in-memory platform used by unit and integration
//! tests to exercise the publishing pipeline without network access.
//! Behavior is driven by shared state so a test can keep its own
//! handle and reconfigure or inspect the adapter mid-run.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{PlatformError, Result};
use crate::platforms::{Platform, RefreshedToken};
use crate::types::{Engagement, HealthStatus};

pub struct MockPlatform {
    character_limit: Option<usize>,

    /// When `Some`, only tokens in the set are accepted; anything else
    /// fails with an authentication error. `None` accepts all tokens.
    accepted_tokens: Arc<Mutex<Option<HashSet<String>>>>,

    /// Forced post failure; cleared by the test when done.
    post_error: Arc<Mutex<Option<PlatformError>>>,

    /// Forced refresh failure. When unset, refresh mints a new token
    /// and adds it to the accepted set.
    refresh_error: Arc<Mutex<Option<PlatformError>>>,

    healthy: Arc<AtomicBool>,
    engagement: Arc<Mutex<Engagement>>,

    post_calls: Arc<Mutex<usize>>,
    pull_calls: Arc<Mutex<usize>>,
    health_calls: Arc<Mutex<usize>>,
    refresh_calls: Arc<Mutex<usize>>,

    /// (token, content) pairs for every successful post.
    posted: Arc<Mutex<Vec<(String, String)>>>,

    /// Every credential handed to `refresh_token`.
    refresh_credentials: Arc<Mutex<Vec<String>>>,
}

impl MockPlatform {
    /// A mock where everything succeeds.
    pub fn success() -> Self {
        Self {
            character_limit: None,
            accepted_tokens: Arc::new(Mutex::new(None)),
            post_error: Arc::new(Mutex::new(None)),
            refresh_error: Arc::new(Mutex::new(None)),
            healthy: Arc::new(AtomicBool::new(true)),
            engagement: Arc::new(Mutex::new(Engagement::default())),
            post_calls: Arc::new(Mutex::new(0)),
            pull_calls: Arc::new(Mutex::new(0)),
            health_calls: Arc::new(Mutex::new(0)),
            refresh_calls: Arc::new(Mutex::new(0)),
            posted: Arc::new(Mutex::new(Vec::new())),
            refresh_credentials: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            character_limit: Some(limit),
            ..Self::success()
        }
    }

    pub fn failing_posts(error: PlatformError) -> Self {
        let platform = Self::success();
        platform.set_post_error(Some(error));
        platform
    }

    pub fn unhealthy() -> Self {
        let platform = Self::success();
        platform.set_healthy(false);
        platform
    }

    /// Restrict accepted tokens to the given set.
    pub fn require_tokens(&self, tokens: &[&str]) {
        *self.accepted_tokens.lock().unwrap() =
            Some(tokens.iter().map(|t| t.to_string()).collect());
    }

    pub fn accept_token(&self, token: &str) {
        let mut accepted = self.accepted_tokens.lock().unwrap();
        accepted
            .get_or_insert_with(HashSet::new)
            .insert(token.to_string());
    }

    pub fn set_post_error(&self, error: Option<PlatformError>) {
        *self.post_error.lock().unwrap() = error;
    }

    pub fn set_refresh_error(&self, error: Option<PlatformError>) {
        *self.refresh_error.lock().unwrap() = error;
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_engagement(&self, engagement: Engagement) {
        *self.engagement.lock().unwrap() = engagement;
    }

    pub fn post_call_count(&self) -> usize {
        *self.post_calls.lock().unwrap()
    }

    pub fn pull_call_count(&self) -> usize {
        *self.pull_calls.lock().unwrap()
    }

    pub fn health_call_count(&self) -> usize {
        *self.health_calls.lock().unwrap()
    }

    pub fn refresh_call_count(&self) -> usize {
        *self.refresh_calls.lock().unwrap()
    }

    pub fn posted_content(&self) -> Vec<(String, String)> {
        self.posted.lock().unwrap().clone()
    }

    pub fn refresh_credentials(&self) -> Vec<String> {
        self.refresh_credentials.lock().unwrap().clone()
    }

    fn check_token(&self, token: &str) -> Result<()> {
        let accepted = self.accepted_tokens.lock().unwrap();
        if let Some(set) = accepted.as_ref() {
            if !set.contains(token) {
                return Err(PlatformError::Authentication(format!(
                    "mock rejected token '{}'",
                    token
                ))
                .into());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Platform for MockPlatform {
    fn name(&self) -> &str {
        "mock"
    }

    fn character_limit(&self) -> Option<usize> {
        self.character_limit
    }

    async fn post(&self, access_token: &str, content: &str) -> Result<String> {
        *self.post_calls.lock().unwrap() += 1;

        self.validate_content(content)?;
        self.check_token(access_token)?;

        if let Some(error) = self.post_error.lock().unwrap().clone() {
            return Err(error.into());
        }

        let mut posted = self.posted.lock().unwrap();
        posted.push((access_token.to_string(), content.to_string()));
        Ok(format!("mock-post-{}", posted.len()))
    }

    async fn pull_engagement(&self, access_token: &str, _since: i64) -> Result<Engagement> {
        *self.pull_calls.lock().unwrap() += 1;
        self.check_token(access_token)?;
        Ok(self.engagement.lock().unwrap().clone())
    }

    async fn check_health(&self) -> Result<HealthStatus> {
        *self.health_calls.lock().unwrap() += 1;

        if !self.healthy.load(Ordering::SeqCst) {
            return Err(PlatformError::Network("mock platform is down".to_string()).into());
        }

        Ok(HealthStatus {
            healthy: true,
            latency_ms: 5,
        })
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<RefreshedToken> {
        let call = {
            let mut calls = self.refresh_calls.lock().unwrap();
            *calls += 1;
            *calls
        };
        self.refresh_credentials
            .lock()
            .unwrap()
            .push(refresh_token.to_string());

        if let Some(error) = self.refresh_error.lock().unwrap().clone() {
            return Err(error.into());
        }

        let access_token = format!("mock-access-{}", call);
        self.accept_token(&access_token);

        Ok(RefreshedToken {
            access_token,
            refresh_token: None,
            expires_in: Some(3600),
        })
    }
}
