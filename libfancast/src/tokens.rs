//! OAuth token lifecycle management
//!
//! Single entry point for "give me a working access token". Proactive
//! refresh happens when a token is within the configured threshold of
//! expiry; reactive refresh happens when a platform call comes back
//! with an authentication error. A call gets at most one refresh and
//! one retry; a second authentication failure marks the connection
//! invalid and surfaces `ReconnectRequired`, which only the tenant can
//! resolve by re-authorizing.

use std::future::Future;
use std::sync::Arc;

use secrecy::ExposeSecret;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::error::{FancastError, PlatformError, Result};
use crate::platforms::PlatformRegistry;
use crate::types::ConnectedAccount;
use crate::vault::CredentialVault;

pub struct TokenManager {
    db: Database,
    vault: Arc<CredentialVault>,
    registry: Arc<PlatformRegistry>,
    refresh_threshold_secs: i64,
}

impl TokenManager {
    pub fn new(
        db: Database,
        vault: Arc<CredentialVault>,
        registry: Arc<PlatformRegistry>,
        refresh_threshold_secs: u64,
    ) -> Self {
        Self {
            db,
            vault,
            registry,
            refresh_threshold_secs: refresh_threshold_secs as i64,
        }
    }

    /// A plaintext access token known to be usable right now, refreshed
    /// proactively if it is about to expire.
    pub async fn access_token(&self, account: &ConnectedAccount) -> Result<String> {
        if !account.valid {
            return Err(PlatformError::ReconnectRequired {
                platform: account.platform.clone(),
                reason: account
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "connection marked invalid".to_string()),
            }
            .into());
        }

        let now = chrono::Utc::now().timestamp();
        if let Some(expires_at) = account.expires_at {
            if expires_at <= now + self.refresh_threshold_secs {
                debug!(
                    tenant_id = %account.tenant_id,
                    platform = %account.platform,
                    "access token near expiry, refreshing proactively"
                );
                return self.refresh(account).await;
            }
        }

        Ok(self
            .vault
            .reveal(&account.access_token)?
            .expose_secret()
            .to_string())
    }

    /// Run a platform call with a valid token, retrying once through a
    /// refresh if the platform rejects the token.
    pub async fn with_valid_token<T, F, Fut>(
        &self,
        tenant_id: &str,
        platform: &str,
        op: F,
    ) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let account = self.db.get_account(tenant_id, platform).await?.ok_or_else(|| {
            FancastError::InvalidInput(format!(
                "no connected {} account for tenant {}",
                platform, tenant_id
            ))
        })?;

        let token = self.access_token(&account).await?;

        match op(token).await {
            Err(FancastError::Platform(PlatformError::Authentication(reason))) => {
                info!(
                    tenant_id = %tenant_id,
                    platform = %platform,
                    %reason,
                    "platform rejected token, refreshing and retrying once"
                );

                let token = self.refresh(&account).await?;
                match op(token).await {
                    Err(FancastError::Platform(PlatformError::Authentication(reason))) => {
                        warn!(
                            tenant_id = %tenant_id,
                            platform = %platform,
                            %reason,
                            "freshly refreshed token rejected, marking connection invalid"
                        );
                        self.db
                            .invalidate_account(tenant_id, platform, &reason)
                            .await?;
                        Err(PlatformError::ReconnectRequired {
                            platform: platform.to_string(),
                            reason,
                        }
                        .into())
                    }
                    other => other,
                }
            }
            other => other,
        }
    }

    /// Exchange the stored refresh token for a new access token and
    /// persist the result. Returns the new plaintext access token.
    pub async fn refresh(&self, account: &ConnectedAccount) -> Result<String> {
        let adapter = self.registry.adapter_for(account)?;

        // Platforms without a rotating refresh grant (Mastodon) exchange
        // the long-lived access token itself; the adapter decides
        // whether that credential is refreshable.
        let refresh_cipher = account
            .refresh_token
            .as_ref()
            .unwrap_or(&account.access_token);
        let refresh_plain = self.vault.reveal(refresh_cipher)?;

        let refreshed = match adapter.refresh_token(refresh_plain.expose_secret()).await {
            Ok(refreshed) => refreshed,
            Err(FancastError::Platform(
                error @ (PlatformError::Authentication(_)
                | PlatformError::ReconnectRequired { .. }),
            )) => {
                let reason = error.to_string();
                warn!(
                    tenant_id = %account.tenant_id,
                    platform = %account.platform,
                    %reason,
                    "token refresh refused, marking connection invalid"
                );
                self.db
                    .invalidate_account(&account.tenant_id, &account.platform, &reason)
                    .await?;
                return Err(PlatformError::ReconnectRequired {
                    platform: account.platform.clone(),
                    reason,
                }
                .into());
            }
            // Transient failures leave the account untouched; the
            // caller's retry machinery handles them.
            Err(e) => return Err(e),
        };

        let access_cipher = self.vault.encrypt(&refreshed.access_token)?;
        let refresh_cipher = refreshed
            .refresh_token
            .as_deref()
            .map(|t| self.vault.encrypt(t))
            .transpose()?;
        let expires_at = refreshed
            .expires_in
            .map(|secs| chrono::Utc::now().timestamp() + secs);

        self.db
            .update_account_tokens(
                &account.tenant_id,
                &account.platform,
                &access_cipher,
                refresh_cipher.as_deref(),
                expires_at,
            )
            .await?;

        info!(
            tenant_id = %account.tenant_id,
            platform = %account.platform,
            rotated_refresh_token = refreshed.refresh_token.is_some(),
            "access token refreshed"
        );

        Ok(refreshed.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::mock::MockPlatform;
    use crate::platforms::Platform;
    use secrecy::SecretString;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        db: Database,
        mock: Arc<MockPlatform>,
        manager: TokenManager,
        vault: Arc<CredentialVault>,
    }

    async fn setup() -> Fixture {
        let temp = TempDir::new().unwrap();
        let db_path = temp.path().join("test.db");
        let db = Database::new(&db_path.to_string_lossy()).await.unwrap();

        let vault = Arc::new(CredentialVault::with_master(SecretString::from(
            "test-master".to_string(),
        )));

        let mock = Arc::new(MockPlatform::success());
        let mut registry = PlatformRegistry::empty();
        registry.register(mock.clone());

        let manager = TokenManager::new(db.clone(), vault.clone(), Arc::new(registry), 300);

        Fixture {
            _temp: temp,
            db,
            mock,
            manager,
            vault,
        }
    }

    async fn insert_account(
        fixture: &Fixture,
        access_token: &str,
        expires_at: Option<i64>,
    ) -> ConnectedAccount {
        insert_account_with_refresh(fixture, access_token, Some("refresh-secret"), expires_at)
            .await
    }

    async fn insert_account_with_refresh(
        fixture: &Fixture,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<i64>,
    ) -> ConnectedAccount {
        let now = chrono::Utc::now().timestamp();
        let account = ConnectedAccount {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: "t1".to_string(),
            platform: "mock".to_string(),
            instance_url: None,
            access_token: fixture.vault.encrypt(access_token).unwrap(),
            refresh_token: refresh_token.map(|t| fixture.vault.encrypt(t).unwrap()),
            expires_at,
            valid: true,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        fixture.db.upsert_account(&account).await.unwrap();
        account
    }

    #[tokio::test]
    async fn test_fresh_token_used_without_refresh() {
        let fixture = setup().await;
        let far_future = chrono::Utc::now().timestamp() + 7200;
        let account = insert_account(&fixture, "current-token", Some(far_future)).await;

        let token = fixture.manager.access_token(&account).await.unwrap();
        assert_eq!(token, "current-token");
        assert_eq!(fixture.mock.refresh_call_count(), 0);
    }

    #[tokio::test]
    async fn test_non_expiring_token_never_refreshed() {
        let fixture = setup().await;
        let account = insert_account(&fixture, "eternal-token", None).await;

        let token = fixture.manager.access_token(&account).await.unwrap();
        assert_eq!(token, "eternal-token");
        assert_eq!(fixture.mock.refresh_call_count(), 0);
    }

    #[tokio::test]
    async fn test_proactive_refresh_near_expiry() {
        let fixture = setup().await;
        // Expires inside the 300s threshold.
        let soon = chrono::Utc::now().timestamp() + 60;
        let account = insert_account(&fixture, "stale-token", Some(soon)).await;

        let token = fixture.manager.access_token(&account).await.unwrap();
        assert_eq!(token, "mock-access-1");
        assert_eq!(fixture.mock.refresh_call_count(), 1);

        // New token persisted encrypted, decryptable, and not stale.
        let stored = fixture.db.get_account("t1", "mock").await.unwrap().unwrap();
        assert!(CredentialVault::is_encrypted(&stored.access_token));
        assert_eq!(
            fixture
                .vault
                .reveal(&stored.access_token)
                .unwrap()
                .expose_secret(),
            "mock-access-1"
        );
        assert!(stored.expires_at.unwrap() > chrono::Utc::now().timestamp() + 300);
    }

    #[tokio::test]
    async fn test_reactive_refresh_retries_once() {
        let fixture = setup().await;
        let account = insert_account(&fixture, "revoked-token", None).await;

        // Only refreshed tokens are accepted; the stored one fails auth.
        fixture.mock.require_tokens(&[]);

        let post_id = fixture
            .manager
            .with_valid_token("t1", "mock", |token| {
                let mock = fixture.mock.clone();
                async move { mock.post(&token, "hello again").await }
            })
            .await
            .unwrap();

        assert_eq!(post_id, "mock-post-1");
        assert_eq!(fixture.mock.post_call_count(), 2);
        assert_eq!(fixture.mock.refresh_call_count(), 1);

        let stored = fixture.db.get_account("t1", "mock").await.unwrap().unwrap();
        assert!(stored.valid);
        drop(account);
    }

    #[tokio::test]
    async fn test_second_auth_failure_requires_reconnect() {
        let fixture = setup().await;
        insert_account(&fixture, "revoked-token", None).await;

        // Nothing is ever accepted, and refresh mints tokens that the
        // mock then still rejects.
        fixture.mock.require_tokens(&[]);

        let fixture_mock = fixture.mock.clone();
        let result = fixture
            .manager
            .with_valid_token("t1", "mock", |token| {
                let mock = fixture_mock.clone();
                async move {
                    // Reject even refreshed tokens.
                    mock.require_tokens(&[]);
                    mock.post(&token, "hello").await
                }
            })
            .await;

        assert!(matches!(
            result,
            Err(FancastError::Platform(PlatformError::ReconnectRequired { .. }))
        ));
        assert_eq!(fixture.mock.refresh_call_count(), 1);

        let stored = fixture.db.get_account("t1", "mock").await.unwrap().unwrap();
        assert!(!stored.valid);
        assert!(stored.last_error.is_some());
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token_exchanges_access_token() {
        let fixture = setup().await;
        let soon = chrono::Utc::now().timestamp() + 60;
        let account =
            insert_account_with_refresh(&fixture, "long-lived-token", None, Some(soon)).await;

        let token = fixture.manager.access_token(&account).await.unwrap();
        assert_eq!(token, "mock-access-1");

        // The stored access token itself was the refresh credential.
        assert_eq!(
            fixture.mock.refresh_credentials(),
            vec!["long-lived-token".to_string()]
        );
    }

    #[tokio::test]
    async fn test_refresh_refusal_without_refresh_token_invalidates_account() {
        let fixture = setup().await;
        let soon = chrono::Utc::now().timestamp() + 60;
        let account =
            insert_account_with_refresh(&fixture, "revoked-token", None, Some(soon)).await;

        // The platform cannot refresh this credential, as Mastodon
        // reports for a revoked grant.
        fixture
            .mock
            .set_refresh_error(Some(PlatformError::ReconnectRequired {
                platform: "mock".to_string(),
                reason: "access token revoked".to_string(),
            }));

        let result = fixture.manager.access_token(&account).await;
        assert!(matches!(
            result,
            Err(FancastError::Platform(PlatformError::ReconnectRequired { .. }))
        ));

        // Invalid accounts stop being fanned out to new jobs.
        let stored = fixture.db.get_account("t1", "mock").await.unwrap().unwrap();
        assert!(!stored.valid);
        assert!(stored.last_error.is_some());
    }

    #[tokio::test]
    async fn test_refresh_refusal_invalidates_account() {
        let fixture = setup().await;
        let soon = chrono::Utc::now().timestamp() + 10;
        let account = insert_account(&fixture, "old-token", Some(soon)).await;

        fixture
            .mock
            .set_refresh_error(Some(PlatformError::Authentication(
                "invalid_grant".to_string(),
            )));

        let result = fixture.manager.access_token(&account).await;
        assert!(matches!(
            result,
            Err(FancastError::Platform(PlatformError::ReconnectRequired { .. }))
        ));

        let stored = fixture.db.get_account("t1", "mock").await.unwrap().unwrap();
        assert!(!stored.valid);
    }

    #[tokio::test]
    async fn test_invalid_account_short_circuits() {
        let fixture = setup().await;
        insert_account(&fixture, "token", None).await;
        fixture
            .db
            .invalidate_account("t1", "mock", "previously revoked")
            .await
            .unwrap();

        let result = fixture
            .manager
            .with_valid_token("t1", "mock", |_token| async move {
                panic!("operation must not run for an invalid connection");
                #[allow(unreachable_code)]
                Ok(())
            })
            .await;

        assert!(matches!(
            result,
            Err(FancastError::Platform(PlatformError::ReconnectRequired { .. }))
        ));
        assert_eq!(fixture.mock.refresh_call_count(), 0);
    }
}
