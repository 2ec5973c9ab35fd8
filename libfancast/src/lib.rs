//! Fancast - durable social publishing for multi-tenant apps
//!
//! This library provides the shared machinery behind the fancast
//! binaries: a SQLite-backed job queue with at-least-once delivery, the
//! post scheduling pipeline, platform adapters, token lifecycle
//! management, and the two-layer rate limiting that keeps tenants and
//! platform APIs happy.

pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod limiter;
pub mod logging;
pub mod platforms;
pub mod poller;
pub mod queue;
pub mod tokens;
pub mod types;
pub mod vault;
pub mod worker;

// Re-export commonly used types
pub use config::Config;
pub use db::Database;
pub use error::{FancastError, PlatformError, QueueError, Result};
pub use queue::{Enqueue, JobLease, JobQueue, QueueMetrics};
pub use types::{ConnectedAccount, Job, JobKind, JobPayload, Post, PostStatus, Tier};
