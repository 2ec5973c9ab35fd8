//! X (Twitter) platform implementation
//!
//! Uses the v2 REST API directly over reqwest: tweet creation, recent
//! tweet metrics via `public_metrics`, and OAuth 2.0 token refresh with
//! confidential-client Basic auth. The adapter holds only the app
//! credentials; per-tenant user tokens come in with each call.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;

use crate::error::{PlatformError, Result};
use crate::platforms::{Platform, RefreshedToken};
use crate::types::{Engagement, HealthStatus};

const API_BASE: &str = "https://api.x.com/2";
const CHARACTER_LIMIT: usize = 280;

pub struct XPlatform {
    client_id: String,
    client_secret: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

#[derive(Deserialize)]
struct TweetResponseWrapper {
    data: TweetResponse,
}

#[derive(Deserialize)]
struct TweetResponse {
    id: String,
}

#[derive(Deserialize)]
struct UserResponseWrapper {
    data: UserResponse,
}

#[derive(Deserialize)]
struct UserResponse {
    id: String,
}

#[derive(Deserialize)]
struct TweetListWrapper {
    #[serde(default)]
    data: Vec<TweetWithMetrics>,
}

#[derive(Deserialize)]
struct TweetWithMetrics {
    #[serde(default)]
    created_at: Option<chrono::DateTime<chrono::Utc>>,
    public_metrics: Option<PublicMetrics>,
}

#[derive(Deserialize, Default)]
struct PublicMetrics {
    #[serde(default)]
    like_count: i64,
    #[serde(default)]
    retweet_count: i64,
    #[serde(default)]
    quote_count: i64,
    #[serde(default)]
    reply_count: i64,
    #[serde(default)]
    impression_count: i64,
}

impl XPlatform {
    pub fn new(client_id: String, client_secret: String) -> Self {
        Self {
            client_id,
            client_secret,
            http: reqwest::Client::new(),
        }
    }

    /// Basic auth header for the OAuth token endpoint (confidential client).
    fn basic_auth_header(&self) -> String {
        let credentials = format!("{}:{}", self.client_id, self.client_secret);
        format!("Basic {}", BASE64.encode(credentials))
    }

    async fn classify_failure(response: reqwest::Response, context: &str) -> PlatformError {
        let status = response.status();
        let retry_after_secs = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(60);
        let body = response.text().await.unwrap_or_default();

        match status.as_u16() {
            401 | 403 => PlatformError::Authentication(format!(
                "X authentication failed ({}): {}",
                context, body
            )),
            400 | 422 => {
                PlatformError::Rejected(format!("X refused the request ({}): {}", context, body))
            }
            429 => PlatformError::RateLimited {
                message: format!("X rate limit hit ({}): {}", context, body),
                retry_after_secs,
            },
            _ => PlatformError::Network(format!(
                "X API error {} ({}): {}",
                status, context, body
            )),
        }
    }

    async fn current_user_id(&self, access_token: &str) -> Result<String> {
        let response = self
            .http
            .get(format!("{}/users/me", API_BASE))
            .header("Authorization", format!("Bearer {}", access_token))
            .send()
            .await
            .map_err(|e| PlatformError::Network(format!("X users/me request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Self::classify_failure(response, "users/me").await.into());
        }

        let wrapper: UserResponseWrapper = response
            .json()
            .await
            .map_err(|e| PlatformError::Network(format!("X users/me parse error: {}", e)))?;

        Ok(wrapper.data.id)
    }
}

#[async_trait]
impl Platform for XPlatform {
    fn name(&self) -> &str {
        "x"
    }

    fn character_limit(&self) -> Option<usize> {
        Some(CHARACTER_LIMIT)
    }

    async fn post(&self, access_token: &str, content: &str) -> Result<String> {
        self.validate_content(content)?;

        let body = serde_json::json!({ "text": content });

        let response = self
            .http
            .post(format!("{}/tweets", API_BASE))
            .header("Authorization", format!("Bearer {}", access_token))
            .json(&body)
            .send()
            .await
            .map_err(|e| PlatformError::Network(format!("X tweet request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Self::classify_failure(response, "post tweet").await.into());
        }

        let wrapper: TweetResponseWrapper = response
            .json()
            .await
            .map_err(|e| PlatformError::Network(format!("X tweet parse error: {}", e)))?;

        Ok(wrapper.data.id)
    }

    async fn pull_engagement(&self, access_token: &str, since: i64) -> Result<Engagement> {
        let user_id = self.current_user_id(access_token).await?;

        let url = format!(
            "{}/users/{}/tweets?tweet.fields=public_metrics,created_at&max_results=100",
            API_BASE, user_id
        );
        let response = self
            .http
            .get(url)
            .header("Authorization", format!("Bearer {}", access_token))
            .send()
            .await
            .map_err(|e| PlatformError::Network(format!("X timeline request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Self::classify_failure(response, "fetch tweets").await.into());
        }

        let wrapper: TweetListWrapper = response
            .json()
            .await
            .map_err(|e| PlatformError::Network(format!("X timeline parse error: {}", e)))?;

        let mut engagement = Engagement::default();
        for tweet in wrapper.data {
            if let Some(created_at) = tweet.created_at {
                if created_at.timestamp() < since {
                    continue;
                }
            }
            let metrics = tweet.public_metrics.unwrap_or_default();
            engagement.likes += metrics.like_count;
            engagement.shares += metrics.retweet_count + metrics.quote_count;
            engagement.replies += metrics.reply_count;
            engagement.impressions += metrics.impression_count;
        }

        Ok(engagement)
    }

    async fn check_health(&self) -> Result<HealthStatus> {
        // Unauthenticated probe; any HTTP answer from the API host
        // counts as "up", only transport failures count against it.
        let started = std::time::Instant::now();
        self.http
            .get(format!("{}/openapi.json", API_BASE))
            .send()
            .await
            .map_err(|e| PlatformError::Network(format!("X health probe failed: {}", e)))?;

        Ok(HealthStatus {
            healthy: true,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<RefreshedToken> {
        let params = [
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];

        let response = self
            .http
            .post(format!("{}/oauth2/token", API_BASE))
            .header("Authorization", self.basic_auth_header())
            .header("Content-Type", "application/x-www-form-urlencoded")
            .form(&params)
            .send()
            .await
            .map_err(|e| PlatformError::Network(format!("X token refresh failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            // invalid_grant means the refresh token itself is dead;
            // only the tenant can fix that.
            if status == 400 && body.contains("invalid_grant") || status == 401 {
                return Err(PlatformError::ReconnectRequired {
                    platform: "x".to_string(),
                    reason: format!("refresh token no longer valid: {}", body),
                }
                .into());
            }
            return Err(PlatformError::Network(format!(
                "X token refresh error {}: {}",
                status, body
            ))
            .into());
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| PlatformError::Network(format!("X token parse error: {}", e)))?;

        Ok(RefreshedToken {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_in: token.expires_in,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_platform() -> XPlatform {
        XPlatform::new("client-id".to_string(), "client-secret".to_string())
    }

    #[test]
    fn test_basic_auth_header_encoding() {
        let platform = test_platform();
        // base64("client-id:client-secret")
        assert_eq!(
            platform.basic_auth_header(),
            "Basic Y2xpZW50LWlkOmNsaWVudC1zZWNyZXQ="
        );
    }

    #[test]
    fn test_character_limit() {
        let platform = test_platform();
        assert_eq!(platform.character_limit(), Some(280));
        assert!(platform.validate_content(&"a".repeat(280)).is_ok());
        assert!(platform.validate_content(&"a".repeat(281)).is_err());
    }

    #[test]
    fn test_token_response_parsing() {
        let json = r#"{
            "token_type": "bearer",
            "access_token": "new-access",
            "refresh_token": "new-refresh",
            "expires_in": 7200,
            "scope": "tweet.write users.read offline.access"
        }"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(token.access_token, "new-access");
        assert_eq!(token.refresh_token, Some("new-refresh".to_string()));
        assert_eq!(token.expires_in, Some(7200));
    }

    #[test]
    fn test_metrics_aggregation_shape() {
        let json = r#"{
            "data": [
                {
                    "id": "1",
                    "created_at": "2026-08-01T12:00:00Z",
                    "public_metrics": {
                        "like_count": 3,
                        "retweet_count": 1,
                        "quote_count": 2,
                        "reply_count": 4,
                        "impression_count": 100
                    }
                },
                { "id": "2" }
            ]
        }"#;
        let wrapper: TweetListWrapper = serde_json::from_str(json).unwrap();
        assert_eq!(wrapper.data.len(), 2);
        let metrics = wrapper.data[0].public_metrics.as_ref().unwrap();
        assert_eq!(metrics.like_count, 3);
        assert_eq!(metrics.retweet_count + metrics.quote_count, 3);
        assert!(wrapper.data[1].public_metrics.is_none());
    }
}
