//! fan-serve - HTTP control surface for the fancast pipeline
//!
//! Exposes the cron trigger endpoints an external scheduler hits on a
//! timer (dispatch, engagement pulls, health probes) and a small admin
//! surface over the job queue. Both are header-authenticated: cron
//! routes by `x-fancast-cron-secret`, admin routes by
//! `x-fancast-admin-token`.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::info;

use libfancast::config::Config;
use libfancast::db::Database;
use libfancast::dispatcher::Dispatcher;
use libfancast::logging::{LogFormat, LoggingConfig};
use libfancast::poller::Poller;
use libfancast::queue::JobQueue;
use libfancast::{FancastError, PlatformError, QueueError};

const CRON_SECRET_HEADER: &str = "x-fancast-cron-secret";
const ADMIN_TOKEN_HEADER: &str = "x-fancast-admin-token";

#[derive(Parser, Debug)]
#[command(name = "fan-serve")]
#[command(version)]
#[command(about = "HTTP control surface for the fancast pipeline")]
#[command(long_about = "\
fan-serve - HTTP control surface for the fancast pipeline

DESCRIPTION:
    fan-serve hosts the endpoints that drive the pipeline from outside:
    an external scheduler (system cron, a platform cron trigger) POSTs
    to /cron/* on a timer, and operators inspect or repair the job
    queue through /admin/jobs/*.

ROUTES:
    GET  /healthz                     Liveness probe (no auth)
    POST /cron/dispatch               Move due posts into the queue
    POST /cron/engagement             Fan out engagement pull jobs
    POST /cron/health                 Fan out platform health probes
    GET  /admin/jobs/metrics          Queue depth by status
    GET  /admin/jobs/health           Queue connectivity check
    GET  /admin/jobs/failed           Recently failed jobs
    POST /admin/jobs/{id}/retry       Re-queue a failed job
    POST /admin/jobs/clear-failed     Drop all failed jobs

AUTHENTICATION:
    Cron routes require the x-fancast-cron-secret header, admin routes
    the x-fancast-admin-token header. Both values come from the
    [server] section of the config file; a route whose secret is not
    configured refuses requests.

CONFIGURATION:
    Configuration file: ~/.config/fancast/config.toml
    Override with FANCAST_CONFIG.

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Database or configuration error
")]
struct Cli {
    /// Bind address (overrides config)
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,

    /// Log output format: text, json, or pretty
    #[arg(long, value_name = "FORMAT", default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,
}

struct AppState {
    queue: JobQueue,
    dispatcher: Dispatcher,
    poller: Poller,
    cron_secret: Option<String>,
    admin_token: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::new(cli.log_format, "info".to_string(), cli.verbose).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> libfancast::Result<()> {
    let config = Config::load()?;
    let db = Database::new(&config.database.path).await?;
    let queue = JobQueue::new(db.clone(), config.queue.clone());

    let state = Arc::new(AppState {
        queue: queue.clone(),
        dispatcher: Dispatcher::new(db.clone(), queue.clone(), config.dispatcher.batch_size),
        poller: Poller::new(db, queue, config.poller.engagement_lookback_hours),
        cron_secret: config.server.cron_secret.clone(),
        admin_token: config.server.admin_token.clone(),
    });

    let bind = cli.bind.unwrap_or(config.server.bind);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .map_err(|e| FancastError::Config(
            libfancast::error::ConfigError::InvalidValue {
                field: "server.bind".to_string(),
                reason: format!("{}: {}", bind, e),
            },
        ))?;

    info!(%bind, "fan-serve listening");
    axum::serve(listener, app(state))
        .await
        .map_err(|e| FancastError::InvalidInput(format!("server error: {}", e)))?;

    Ok(())
}

fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/cron/dispatch", post(cron_dispatch))
        .route("/cron/engagement", post(cron_engagement))
        .route("/cron/health", post(cron_health))
        .route("/admin/jobs/metrics", get(admin_metrics))
        .route("/admin/jobs/health", get(admin_health))
        .route("/admin/jobs/failed", get(admin_failed))
        .route("/admin/jobs/:id/retry", post(admin_retry))
        .route("/admin/jobs/clear-failed", post(admin_clear_failed))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Authentication
// ============================================================================

fn require_header(
    headers: &HeaderMap,
    name: &str,
    expected: Option<&String>,
) -> Result<(), AppError> {
    let Some(expected) = expected else {
        return Err(AppError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("{} is not configured on this server", name),
        ));
    };
    let presented = headers.get(name).and_then(|v| v.to_str().ok());
    if presented != Some(expected.as_str()) {
        return Err(AppError::new(
            StatusCode::UNAUTHORIZED,
            format!("missing or invalid {} header", name),
        ));
    }
    Ok(())
}

fn require_cron(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    require_header(headers, CRON_SECRET_HEADER, state.cron_secret.as_ref())
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    require_header(headers, ADMIN_TOKEN_HEADER, state.admin_token.as_ref())
}

// ============================================================================
// Handlers
// ============================================================================

async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    if state.queue.healthy().await {
        (StatusCode::OK, Json(json!({"status": "ok"}))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "unavailable"})),
        )
            .into_response()
    }
}

async fn cron_dispatch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    require_cron(&state, &headers)?;
    let now = chrono::Utc::now().timestamp();
    let summary = state.dispatcher.tick(now).await?;
    Ok(Json(summary).into_response())
}

async fn cron_engagement(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    require_cron(&state, &headers)?;
    let summary = state.poller.enqueue_engagement_pulls().await?;
    Ok(Json(summary).into_response())
}

async fn cron_health(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    require_cron(&state, &headers)?;
    let summary = state.poller.enqueue_health_checks().await?;
    Ok(Json(summary).into_response())
}

async fn admin_metrics(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    require_admin(&state, &headers)?;
    let metrics = state.queue.metrics().await?;
    Ok(Json(metrics).into_response())
}

async fn admin_health(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    require_admin(&state, &headers)?;
    let health = state.queue.health().await;
    if health.reachable {
        Ok(Json(health).into_response())
    } else {
        Ok((StatusCode::SERVICE_UNAVAILABLE, Json(health)).into_response())
    }
}

#[derive(Debug, Deserialize)]
struct FailedQuery {
    #[serde(default = "default_failed_limit")]
    limit: u32,
}

fn default_failed_limit() -> u32 {
    20
}

async fn admin_failed(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<FailedQuery>,
) -> Result<Response, AppError> {
    require_admin(&state, &headers)?;
    let jobs = state.queue.recent_failed(query.limit).await?;
    Ok(Json(jobs).into_response())
}

async fn admin_retry(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(job_id): Path<i64>,
) -> Result<Response, AppError> {
    require_admin(&state, &headers)?;
    state.queue.retry(job_id).await?;
    Ok(Json(json!({"retried": job_id})).into_response())
}

async fn admin_clear_failed(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    require_admin(&state, &headers)?;
    let cleared = state.queue.clear_failed().await?;
    Ok(Json(json!({"cleared": cleared})).into_response())
}

// ============================================================================
// Error mapping
// ============================================================================

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    message: String,
    retry_after_secs: Option<u64>,
}

impl AppError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retry_after_secs: None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "status": self.status.as_u16(),
            }
        }));
        let mut response = (self.status, body).into_response();
        if let Some(secs) = self.retry_after_secs {
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

impl From<FancastError> for AppError {
    fn from(err: FancastError) -> Self {
        match &err {
            FancastError::Platform(PlatformError::RateLimited {
                retry_after_secs, ..
            }) => Self {
                status: StatusCode::TOO_MANY_REQUESTS,
                message: err.to_string(),
                retry_after_secs: Some(*retry_after_secs),
            },
            FancastError::Queue(QueueError::NotFound(_)) => {
                Self::new(StatusCode::NOT_FOUND, err.to_string())
            }
            FancastError::InvalidInput(_) => Self::new(StatusCode::BAD_REQUEST, err.to_string()),
            _ => Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        }
    }
}
