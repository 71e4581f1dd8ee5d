//! Admin HTTP surface.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use crate::providers::{ModeCell, ScrapeMode};
use crate::proxy::{ProxyInfo, ProxyPool, ProxyStats};
use crate::scheduler::{CheckScheduler, ScheduleError};
use crate::watcher::{CheckRecord, LinkWatcher, ManualAnnounceError, OutcomeKind, Trigger};

pub struct AppState {
    pub watcher: Arc<LinkWatcher>,
    pub scheduler: Option<Arc<CheckScheduler>>,
    pub pool: Option<Arc<ProxyPool>>,
    pub mode: ModeCell,
}

// ============================================================================
// Request / response bodies
// ============================================================================

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CheckResponse {
    pub outcome: OutcomeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AnnounceRequest {
    #[schema(example = "https://www.canva.com/brand/join?token=abc")]
    pub link: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ModeBody {
    pub mode: ScrapeMode,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ScheduleRequest {
    #[schema(example = "0 */15 * * * *")]
    pub cron: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StatusResponse {
    pub last_link: Option<String>,
    pub mode: ScrapeMode,
    pub schedule: Option<String>,
    pub jitter_secs: Option<u64>,
    pub checks_run: u64,
    pub last_check: Option<CheckRecord>,
    pub proxies: Option<ProxyStats>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

pub struct ApiError(StatusCode, String);

impl ApiError {
    fn bad_request(msg: impl Into<String>) -> Self {
        Self(StatusCode::BAD_REQUEST, msg.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorResponse { error: self.1 })).into_response()
    }
}

// ============================================================================
// Handlers
// ============================================================================

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is up", body = String)),
    tag = "watcher"
)]
pub async fn health() -> &'static str {
    "OK"
}

#[utoipa::path(
    get,
    path = "/status",
    responses((status = 200, description = "Watcher status", body = StatusResponse)),
    tag = "watcher"
)]
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let (schedule, jitter_secs) = match &state.scheduler {
        Some(s) => (Some(s.cron().await), Some(s.jitter_secs())),
        None => (None, None),
    };
    let proxies = match &state.pool {
        Some(pool) => Some(pool.get_stats().await),
        None => None,
    };
    Json(StatusResponse {
        last_link: state.watcher.gate().last().await,
        mode: state.mode.get(),
        schedule,
        jitter_secs,
        checks_run: state.watcher.checks_run(),
        last_check: state.watcher.last_check(),
        proxies,
    })
}

#[utoipa::path(
    post,
    path = "/check",
    responses((status = 200, description = "Outcome of an on-demand check", body = CheckResponse)),
    tag = "watcher"
)]
pub async fn trigger_check(State(state): State<Arc<AppState>>) -> Json<CheckResponse> {
    let outcome = state.watcher.check(Trigger::OnDemand).await;
    Json(CheckResponse {
        outcome: outcome.kind(),
        link: outcome.link().map(str::to_string),
        error: outcome.error().map(str::to_string),
    })
}

#[utoipa::path(
    post,
    path = "/announce",
    request_body = AnnounceRequest,
    responses(
        (status = 200, description = "Link announced", body = MessageResponse),
        (status = 400, description = "Link does not have the target prefix", body = ErrorResponse),
        (status = 502, description = "Announcement failed", body = ErrorResponse)
    ),
    tag = "watcher"
)]
pub async fn announce_link(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AnnounceRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    match state.watcher.announce_manual(&req.link).await {
        Ok(()) => Ok(Json(MessageResponse {
            message: format!("Announced {}", req.link.trim()),
        })),
        Err(e @ ManualAnnounceError::PrefixMismatch(_)) => Err(ApiError::bad_request(e.to_string())),
        Err(e) => Err(ApiError(StatusCode::BAD_GATEWAY, format!("{:#}", e))),
    }
}

#[utoipa::path(
    get,
    path = "/mode",
    responses((status = 200, description = "Current scrape mode", body = ModeBody)),
    tag = "watcher"
)]
pub async fn get_mode(State(state): State<Arc<AppState>>) -> Json<ModeBody> {
    Json(ModeBody {
        mode: state.mode.get(),
    })
}

#[utoipa::path(
    put,
    path = "/mode",
    request_body = ModeBody,
    responses((status = 200, description = "Mode changed", body = ModeBody)),
    tag = "watcher"
)]
pub async fn set_mode(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ModeBody>,
) -> Json<ModeBody> {
    state.mode.set(req.mode);
    tracing::info!("🔧 Scrape mode set to {}", req.mode);
    Json(ModeBody { mode: req.mode })
}

#[utoipa::path(
    put,
    path = "/schedule",
    request_body = ScheduleRequest,
    responses(
        (status = 200, description = "Schedule replaced", body = ScheduleRequest),
        (status = 400, description = "Invalid cron expression", body = ErrorResponse),
        (status = 503, description = "Scheduler not running", body = ErrorResponse)
    ),
    tag = "watcher"
)]
pub async fn set_schedule(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ScheduleRequest>,
) -> Result<Json<ScheduleRequest>, ApiError> {
    let Some(scheduler) = &state.scheduler else {
        return Err(ApiError(
            StatusCode::SERVICE_UNAVAILABLE,
            "scheduler not running".to_string(),
        ));
    };
    match scheduler.reschedule(&req.cron).await {
        Ok(()) => Ok(Json(ScheduleRequest {
            cron: scheduler.cron().await,
        })),
        Err(e @ ScheduleError::InvalidCron(_)) => Err(ApiError::bad_request(e.to_string())),
        Err(e) => Err(ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

fn pool_of(state: &AppState) -> Result<&Arc<ProxyPool>, ApiError> {
    state
        .pool
        .as_ref()
        .ok_or_else(|| ApiError(StatusCode::NOT_FOUND, "proxy pool disabled".to_string()))
}

#[utoipa::path(
    get,
    path = "/proxies",
    responses(
        (status = 200, description = "Every known proxy with its record", body = Vec<ProxyInfo>),
        (status = 404, description = "Proxy pool disabled", body = ErrorResponse)
    ),
    tag = "proxy"
)]
pub async fn list_proxies(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ProxyInfo>>, ApiError> {
    Ok(Json(pool_of(&state)?.list_proxies().await))
}

#[utoipa::path(
    get,
    path = "/proxies/stats",
    responses(
        (status = 200, description = "Aggregate pool statistics", body = ProxyStats),
        (status = 404, description = "Proxy pool disabled", body = ErrorResponse)
    ),
    tag = "proxy"
)]
pub async fn proxy_stats(State(state): State<Arc<AppState>>) -> Result<Json<ProxyStats>, ApiError> {
    Ok(Json(pool_of(&state)?.get_stats().await))
}

#[utoipa::path(
    post,
    path = "/proxies/reset",
    responses(
        (status = 200, description = "Blacklist and consecutive failures cleared", body = MessageResponse),
        (status = 404, description = "Proxy pool disabled", body = ErrorResponse)
    ),
    tag = "proxy"
)]
pub async fn reset_proxies(
    State(state): State<Arc<AppState>>,
) -> Result<Json<MessageResponse>, ApiError> {
    pool_of(&state)?.reset().await;
    Ok(Json(MessageResponse {
        message: "Proxy blacklist reset".to_string(),
    }))
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        get_status,
        trigger_check,
        announce_link,
        get_mode,
        set_mode,
        set_schedule,
        list_proxies,
        proxy_stats,
        reset_proxies
    ),
    components(
        schemas(
            CheckResponse,
            AnnounceRequest,
            ModeBody,
            ScheduleRequest,
            MessageResponse,
            StatusResponse,
            ErrorResponse,
            crate::providers::ScrapeMode,
            crate::watcher::CheckRecord,
            crate::watcher::OutcomeKind,
            crate::watcher::Trigger,
            crate::proxy::ProxyInfo,
            crate::proxy::ProxyState,
            crate::proxy::ProxyRecord,
            crate::proxy::ProxyStats
        )
    ),
    tags(
        (name = "watcher", description = "Link Watcher API"),
        (name = "proxy", description = "Proxy Pool API")
    )
)]
pub struct ApiDoc;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(health))
        .route("/status", get(get_status))
        .route("/check", post(trigger_check))
        .route("/announce", post(announce_link))
        .route("/mode", get(get_mode).put(set_mode))
        .route("/schedule", put(set_schedule))
        .route("/proxies", get(list_proxies))
        .route("/proxies/stats", get(proxy_stats))
        .route("/proxies/reset", post(reset_proxies))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::announcer::testing::RecordingAnnouncer;
    use crate::proxy::testing::ManualClock;
    use crate::providers::seeded_rng;
    use crate::store::MemoryStore;
    use crate::watcher::testing::{serving_provider, watcher_with, LINK};
    use axum::body::{self, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt as _;

    const BODY_LIMIT: usize = 1024 * 1024;

    async fn state(with_scheduler: bool) -> Arc<AppState> {
        let watcher = Arc::new(watcher_with(
            serving_provider(),
            Arc::new(RecordingAnnouncer::default()),
            CancellationToken::new(),
        ));
        let scheduler = if with_scheduler {
            Some(Arc::new(
                CheckScheduler::start(
                    watcher.clone(),
                    "0 */15 * * * *",
                    0,
                    seeded_rng(Some(1)),
                    CancellationToken::new(),
                )
                .await
                .unwrap(),
            ))
        } else {
            None
        };
        let pool = ProxyPool::load(Arc::new(MemoryStore::new()), ManualClock::at(1_000_000.0)).await;
        pool.set_proxies(vec!["http://10.0.0.1:8080".to_string()]).await;
        Arc::new(AppState {
            mode: watcher.resolver().mode().clone(),
            watcher,
            scheduler,
            pool: Some(Arc::new(pool)),
        })
    }

    async fn call(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::String(
            String::from_utf8_lossy(&bytes).into_owned(),
        ));
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let app = router(state(false).await);
        let (status, body) = call(app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::String("OK".to_string()));
    }

    #[tokio::test]
    async fn test_check_outcomes() {
        let state = state(false).await;
        let (status, body) = call(router(state.clone()), "POST", "/check", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"outcome": "announced", "link": LINK}));

        let (_, body) = call(router(state.clone()), "POST", "/check", None).await;
        assert_eq!(body["outcome"], "unchanged");

        let (_, body) = call(router(state), "GET", "/status", None).await;
        assert_eq!(body["last_link"], LINK);
        assert_eq!(body["checks_run"], 2);
        assert_eq!(body["last_check"]["trigger"], "on_demand");
        assert_eq!(body["proxies"]["total_proxies"], 1);
    }

    #[tokio::test]
    async fn test_manual_announce_validates_prefix() {
        let state = state(false).await;
        let (status, body) = call(
            router(state.clone()),
            "POST",
            "/announce",
            Some(json!({"link": "https://example.org/x"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("https://www.canva.com/brand/"));

        let (status, _) = call(router(state), "POST", "/announce", Some(json!({ "link": LINK }))).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_mode_round_trip() {
        let state = state(false).await;
        let (status, body) =
            call(router(state.clone()), "PUT", "/mode", Some(json!({"mode": "api"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"mode": "api"}));
        assert_eq!(state.watcher.resolver().mode().get(), ScrapeMode::Api);

        let (_, body) = call(router(state), "GET", "/mode", None).await;
        assert_eq!(body, json!({"mode": "api"}));
    }

    #[tokio::test]
    async fn test_schedule_change() {
        let state = state(true).await;
        let (status, _) = call(
            router(state.clone()),
            "PUT",
            "/schedule",
            Some(json!({"cron": "whenever"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            router(state.clone()),
            "PUT",
            "/schedule",
            Some(json!({"cron": "0 0 * * * *"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cron"], "0 0 * * * *");
        if let Some(s) = &state.scheduler {
            s.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_schedule_without_scheduler() {
        let (status, _) = call(
            router(state(false).await),
            "PUT",
            "/schedule",
            Some(json!({"cron": "0 0 * * * *"})),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_proxy_endpoints() {
        let state = state(false).await;
        if let Some(pool) = &state.pool {
            for _ in 0..3 {
                pool.report("http://10.0.0.1:8080", false, Some("timeout")).await;
            }
        }
        let (_, body) = call(router(state.clone()), "GET", "/proxies", None).await;
        assert_eq!(body[0]["state"], "blacklisted");
        assert_eq!(body[0]["record"]["consec_fail"], 3);

        let (status, _) = call(router(state.clone()), "POST", "/proxies/reset", None).await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = call(router(state), "GET", "/proxies/stats", None).await;
        assert_eq!(body["blacklisted"], 0);
        assert_eq!(body["cooling_down"], 1);
    }
}
