//! Core types for Fancast

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unit of content targeted at one platform on behalf of one tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub tenant_id: String,
    pub platform: String,
    pub content: String,
    /// JSON array of media references, opaque to the pipeline.
    pub media: Option<String>,
    pub status: PostStatus,
    pub scheduled_at: Option<i64>,
    pub platform_post_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Post {
    pub fn new(tenant_id: String, platform: String, content: String) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id,
            platform,
            content,
            media: None,
            status: PostStatus::Draft,
            scheduled_at: None,
            platform_post_id: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn scheduled(tenant_id: String, platform: String, content: String, at: i64) -> Self {
        let mut post = Self::new(tenant_id, platform, content);
        post.status = PostStatus::Scheduled;
        post.scheduled_at = Some(at);
        post
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    Draft,
    Scheduled,
    Posting,
    Posted,
    Failed,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Draft => "draft",
            PostStatus::Scheduled => "scheduled",
            PostStatus::Posting => "posting",
            PostStatus::Posted => "posted",
            PostStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(PostStatus::Draft),
            "scheduled" => Some(PostStatus::Scheduled),
            "posting" => Some(PostStatus::Posting),
            "posted" => Some(PostStatus::Posted),
            "failed" => Some(PostStatus::Failed),
            _ => None,
        }
    }

    /// Whether `next` is a legal transition from this status.
    ///
    /// `posting -> scheduled` is deliberately absent: the one legitimate
    /// reversal (queue backend unavailable at enqueue time) goes through
    /// the dispatcher's dedicated revert path, never this table.
    pub fn can_transition(&self, next: PostStatus) -> bool {
        matches!(
            (self, next),
            (PostStatus::Draft, PostStatus::Scheduled)
                | (PostStatus::Scheduled, PostStatus::Posting)
                | (PostStatus::Posting, PostStatus::Posted)
                | (PostStatus::Posting, PostStatus::Failed)
        )
    }
}

impl std::fmt::Display for PostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One tenant's credential set for one platform.
///
/// Token fields hold vault ciphertext, never plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedAccount {
    pub id: String,
    pub tenant_id: String,
    pub platform: String,
    pub instance_url: Option<String>,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>,
    pub valid: bool,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    Publish,
    PullEngagement,
    HealthCheck,
    Report,
    Alert,
}

impl JobKind {
    pub const ALL: [JobKind; 5] = [
        JobKind::Publish,
        JobKind::PullEngagement,
        JobKind::HealthCheck,
        JobKind::Report,
        JobKind::Alert,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Publish => "publish",
            JobKind::PullEngagement => "pull-engagement",
            JobKind::HealthCheck => "health-check",
            JobKind::Report => "report",
            JobKind::Alert => "alert",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "publish" => Some(JobKind::Publish),
            "pull-engagement" => Some(JobKind::PullEngagement),
            "health-check" => Some(JobKind::HealthCheck),
            "report" => Some(JobKind::Report),
            "alert" => Some(JobKind::Alert),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The closed set of work the queue carries. Serialized into the job row
/// as tagged JSON; the queue itself never looks inside.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum JobPayload {
    Publish {
        post_id: String,
        tenant_id: String,
        platform: String,
        content: String,
        media: Option<String>,
    },
    PullEngagement {
        tenant_id: String,
        platform: String,
        lookback_hours: u32,
    },
    HealthCheck {
        tenant_id: String,
        platform: String,
    },
    Report {
        tenant_id: String,
        period: String,
    },
    Alert {
        tenant_id: String,
        platform: String,
        message: String,
    },
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::Publish { .. } => JobKind::Publish,
            JobPayload::PullEngagement { .. } => JobKind::PullEngagement,
            JobPayload::HealthCheck { .. } => JobKind::HealthCheck,
            JobPayload::Report { .. } => JobKind::Report,
            JobPayload::Alert { .. } => JobKind::Alert,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Waiting,
        JobStatus::Active,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Delayed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Delayed => "delayed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(JobStatus::Waiting),
            "active" => Some(JobStatus::Active),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "delayed" => Some(JobStatus::Delayed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One unit of queued work as stored in the jobs table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub kind: JobKind,
    pub payload: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub run_at: Option<i64>,
    pub visibility_deadline: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Job {
    pub fn decode_payload(&self) -> std::result::Result<JobPayload, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

/// Engagement metrics pulled from a platform for one account.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Engagement {
    pub likes: i64,
    pub shares: i64,
    pub replies: i64,
    pub impressions: i64,
}

/// Result of a platform health probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub latency_ms: u64,
}

/// Subscription tiers as known to the billing collaborator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Free,
    Creator,
    Studio,
}

impl Tier {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "free" => Some(Tier::Free),
            "creator" => Some(Tier::Creator),
            "studio" => Some(Tier::Studio),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Creator => "creator",
            Tier::Studio => "studio",
        }
    }
}
