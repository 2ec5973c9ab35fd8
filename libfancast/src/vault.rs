//! Credential vault for Fancast
//!
//! Platform tokens are encrypted at rest with the `age` passphrase
//! scheme and stored base64-encoded in TEXT columns, tagged with an
//! `age:` prefix so stored values are self-describing. Values without
//! the prefix are legacy plaintext from before encryption was enabled
//! and are passed through on read; they get re-encrypted the next time
//! the row is written.
//!
//! The master passphrase lives in the `vault_secrets` table and is
//! created on first open with an insert-if-absent, so concurrent
//! processes racing to initialize all converge on the same secret.

use std::io::{Read, Write};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};

use crate::db::Database;
use crate::error::{DbError, Result, VaultError};

const MASTER_SECRET_NAME: &str = "master-key";
const CIPHERTEXT_PREFIX: &str = "age:";

pub struct CredentialVault {
    master: SecretString,
}

impl CredentialVault {
    /// Load the master secret, creating it on first use.
    pub async fn open(db: &Database) -> Result<Self> {
        if let Some(existing) = load_master(db).await? {
            return Ok(Self { master: existing });
        }

        let mut raw = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut raw);
        let candidate = BASE64.encode(raw);

        // Insert-if-absent: if another process got here first, its
        // secret stays and ours is discarded.
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO vault_secrets (name, value, created_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(MASTER_SECRET_NAME)
        .bind(&candidate)
        .bind(chrono::Utc::now().timestamp())
        .execute(db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        let master = load_master(db).await?.ok_or_else(|| {
            VaultError::SecretStore("master secret missing after initialization".to_string())
        })?;

        Ok(Self { master })
    }

    /// Build a vault from a known passphrase. Test seam.
    pub fn with_master(master: SecretString) -> Self {
        Self { master }
    }

    /// Encrypt a token for storage. Each call salts independently, so
    /// encrypting the same plaintext twice yields different ciphertext.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let encryptor = age::Encryptor::with_user_passphrase(age::secrecy::Secret::new(
            self.master.expose_secret().to_string(),
        ));

        let mut encrypted = vec![];
        let mut writer = encryptor
            .wrap_output(&mut encrypted)
            .map_err(|e| VaultError::Encryption(e.to_string()))?;

        writer
            .write_all(plaintext.as_bytes())
            .map_err(|e| VaultError::Encryption(e.to_string()))?;

        writer
            .finish()
            .map_err(|e| VaultError::Encryption(e.to_string()))?;

        Ok(format!("{}{}", CIPHERTEXT_PREFIX, BASE64.encode(encrypted)))
    }

    /// Decrypt a stored value. Legacy plaintext (no `age:` prefix) is
    /// returned unchanged.
    pub fn reveal(&self, stored: &str) -> Result<SecretString> {
        let Some(encoded) = stored.strip_prefix(CIPHERTEXT_PREFIX) else {
            return Ok(SecretString::from(stored.to_string()));
        };

        let data = BASE64
            .decode(encoded)
            .map_err(|e| VaultError::Decryption(format!("invalid base64: {}", e)))?;

        let decryptor = match age::Decryptor::new(&data[..]) {
            Ok(age::Decryptor::Passphrase(d)) => d,
            Ok(_) => {
                return Err(VaultError::Decryption(
                    "unexpected encryption format (expected passphrase)".to_string(),
                )
                .into())
            }
            Err(e) => return Err(VaultError::Decryption(e.to_string()).into()),
        };

        let mut decrypted = vec![];
        let mut reader = decryptor
            .decrypt(
                &age::secrecy::Secret::new(self.master.expose_secret().to_string()),
                None,
            )
            .map_err(|e| VaultError::Decryption(e.to_string()))?;

        reader
            .read_to_end(&mut decrypted)
            .map_err(|e| VaultError::Decryption(e.to_string()))?;

        let plaintext = String::from_utf8(decrypted)
            .map_err(|e| VaultError::Decryption(format!("invalid UTF-8: {}", e)))?;

        Ok(SecretString::from(plaintext))
    }

    /// Whether a stored value carries the encrypted tag.
    pub fn is_encrypted(stored: &str) -> bool {
        stored.starts_with(CIPHERTEXT_PREFIX)
    }
}

async fn load_master(db: &Database) -> Result<Option<SecretString>> {
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        SELECT value FROM vault_secrets WHERE name = ?
        "#,
    )
    .bind(MASTER_SECRET_NAME)
    .fetch_optional(db.pool())
    .await
    .map_err(DbError::SqlxError)?;

    Ok(row.map(|r| SecretString::from(r.0)))
}
