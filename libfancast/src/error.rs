//! Error types for Fancast

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FancastError>;

#[derive(Error, Debug)]
pub enum FancastError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl FancastError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            FancastError::InvalidInput(_) => 3,
            FancastError::Platform(PlatformError::Authentication(_)) => 2,
            FancastError::Platform(PlatformError::ReconnectRequired { .. }) => 2,
            FancastError::Platform(_) => 1,
            FancastError::Config(_) => 1,
            FancastError::Database(_) => 1,
            FancastError::Queue(_) => 1,
            FancastError::Vault(_) => 1,
        }
    }

    /// Whether a job that hit this error should be retried with backoff.
    ///
    /// Transient infrastructure and rate-limit denials are retryable;
    /// content rejections, credential dead-ends, and malformed payloads
    /// are terminal for the job that hit them.
    pub fn is_retryable(&self) -> bool {
        match self {
            FancastError::Database(_) => true,
            FancastError::Queue(QueueError::Unavailable(_)) => true,
            FancastError::Platform(PlatformError::Network(_)) => true,
            FancastError::Platform(PlatformError::RateLimited { .. }) => true,
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

#[derive(Error, Debug, Clone)]
pub enum PlatformError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Automated refresh can no longer recover; the tenant must
    /// re-authorize through the OAuth flow.
    #[error("{platform} connection requires re-authorization: {reason}")]
    ReconnectRequired { platform: String, reason: String },

    #[error("Content validation failed: {0}")]
    Validation(String),

    /// The platform refused the content itself. Terminal: re-sending
    /// identical content is unlikely to succeed.
    #[error("Platform rejected post: {0}")]
    Rejected(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded: {message} (retry after {retry_after_secs}s)")]
    RateLimited { message: String, retry_after_secs: u64 },
}

#[derive(Error, Debug)]
pub enum QueueError {
    /// The queue backend could not be reached. Callers treat this as
    /// "could not schedule now", never as a domain failure.
    #[error("Queue backend unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to encode job payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Malformed job payload: {0}")]
    MalformedPayload(String),

    #[error("Job not found: {0}")]
    NotFound(i64),
}

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Secret store error: {0}")]
    SecretStore(String),
}
