//! HTTP/SSE surface: REST endpoints, bearer auth, per-IP rate limiting,
//! CORS, and the progress event stream.

pub mod ratelimit;
pub mod sse;

pub use ratelimit::{RateDecision, RateLimiter};
pub use sse::{SseChannel, SseChannelConfig, SseMessage};

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderValue, Method, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use serde_json::{json, Value};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::enhance::StylePreset;
use crate::error::Error;
use crate::pipeline::{Intent, IntentOptions, Pipeline};
use crate::router::Router as LlmRouter;
use crate::store::{Grimoire, GrimoireQuery, History, Inscription, ListOptions};
use crate::validate::Validator;

/// Shared state behind the REST surface. Absent subsystems answer 501.
#[derive(Clone)]
pub struct ApiState {
    pub pipeline: Option<Arc<Pipeline>>,
    pub validator: Arc<Validator>,
    pub llm_router: Option<Arc<LlmRouter>>,
    pub grimoire: Option<Arc<Grimoire>>,
    pub history: Option<Arc<History>>,
    pub progress: Arc<SseChannel>,
    pub limiter: Arc<RateLimiter>,
    /// Bearer token; when set, all endpoints except health and progress
    /// require it.
    pub token: Option<String>,
    pub started: Instant,
    pub requests: Arc<AtomicU64>,
}

impl ApiState {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            pipeline: None,
            validator: Arc::new(Validator::new()),
            llm_router: None,
            grimoire: None,
            history: None,
            progress: Arc::new(SseChannel::new(SseChannelConfig::default())),
            limiter,
            token: None,
            started: Instant::now(),
            requests: Arc::new(AtomicU64::new(0)),
        }
    }
}

fn error_response(error: &Error) -> Response {
    let (status, body) = match error {
        Error::InvalidInput(message) => (StatusCode::BAD_REQUEST, json!({ "error": message })),
        Error::Unauthorized => (StatusCode::UNAUTHORIZED, json!({ "error": "unauthorized" })),
        Error::NotFound(what) => (StatusCode::NOT_FOUND, json!({ "error": what })),
        Error::RateLimited { retry_after_ms } => (
            StatusCode::TOO_MANY_REQUESTS,
            json!({ "error": "rate limited", "retryAfterMs": retry_after_ms }),
        ),
        Error::NotConfigured(what) => (StatusCode::NOT_IMPLEMENTED, json!({ "error": what })),
        other => (
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "error": other.to_string() }),
        ),
    };
    (status, Json(body)).into_response()
}

fn apply_cors(response: &mut Response) {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("authorization, content-type"),
    );
}

fn client_ip(req: &Request<Body>) -> IpAddr {
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse::<IpAddr>().ok())
    {
        return forwarded;
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
        .unwrap_or_else(|| IpAddr::from([127, 0, 0, 1]))
}

fn bearer_ok(req: &Request<Body>, expected: &str) -> bool {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {}", expected))
        .unwrap_or(false)
}

/// Outer middleware: CORS preflight, request counting, rate limiting,
/// bearer auth. `X-RateLimit-Remaining` is set on every response.
async fn guard(State(state): State<ApiState>, req: Request<Body>, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors(&mut response);
        return response;
    }

    state.requests.fetch_add(1, Ordering::Relaxed);
    let ip = client_ip(&req);

    let (rate_outcome, remaining) = match state.limiter.check(ip) {
        Ok(decision) => (Ok(()), decision.remaining),
        Err(e) => (Err(e), 0),
    };

    let mut response = match rate_outcome {
        Err(error) => error_response(&error),
        Ok(()) => {
            let path = req.uri().path();
            let auth_exempt = path == "/api/health" || path == "/api/progress";
            match &state.token {
                Some(expected) if !auth_exempt && !bearer_ok(&req, expected) => {
                    error_response(&Error::Unauthorized)
                }
                _ => next.run(req).await,
            }
        }
    };

    if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
        response.headers_mut().insert("x-ratelimit-remaining", value);
    }
    apply_cors(&mut response);
    response
}

async fn health(State(state): State<ApiState>) -> Response {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started.elapsed().as_secs(),
        "requests": state.requests.load(Ordering::Relaxed),
    }))
    .into_response()
}

async fn models(State(state): State<ApiState>) -> Response {
    match &state.llm_router {
        Some(router) => Json(json!({ "models": router.models() })).into_response(),
        None => error_response(&Error::NotConfigured("no provider router attached".into())),
    }
}

async fn generate(State(state): State<ApiState>, body: Option<Json<Value>>) -> Response {
    let Some(pipeline) = &state.pipeline else {
        return error_response(&Error::NotConfigured("no generate pipeline attached".into()));
    };
    let Some(Json(body)) = body else {
        return error_response(&Error::InvalidInput("request body must be JSON".into()));
    };
    let Some(prompt) = body["prompt"].as_str().filter(|p| !p.trim().is_empty()) else {
        return error_response(&Error::InvalidInput("missing prompt".into()));
    };

    let intent = Intent {
        text: prompt.to_string(),
        options: IntentOptions {
            model: body["model"].as_str().map(|s| s.to_string()),
            style: body["style"]
                .as_str()
                .map(StylePreset::parse)
                .unwrap_or_default(),
            language: body["language"].as_str().map(|s| s.to_string()),
            iterate: body["iterate"].as_bool().unwrap_or(false),
            persona: body["persona"].as_str().map(|s| s.to_string()),
            stream: true,
            inscribe: body["inscribe"].as_bool().unwrap_or(false),
            tags: body["tags"]
                .as_array()
                .map(|tags| {
                    tags.iter()
                        .filter_map(|t| t.as_str().map(|s| s.to_string()))
                        .collect()
                })
                .unwrap_or_default(),
        },
    };

    match pipeline.run(&intent, &CancellationToken::new()).await {
        Ok(result) => Json(json!({
            "html": result.html,
            "score": result.score.total,
            "validation": result.score,
            "model": result.model,
            "iterations": result.iterations,
            "durationMs": result.duration_ms,
            "enhancedPrompt": result.enhanced_prompt,
        }))
        .into_response(),
        Err(error) => error_response(&error),
    }
}

async fn validate(State(state): State<ApiState>, body: Option<Json<Value>>) -> Response {
    let Some(Json(body)) = body else {
        return error_response(&Error::InvalidInput("request body must be JSON".into()));
    };
    let Some(html) = body["html"].as_str() else {
        return error_response(&Error::InvalidInput("missing html".into()));
    };
    Json(serde_json::to_value(state.validator.validate(html)).unwrap_or_default()).into_response()
}

#[derive(Debug, serde::Deserialize)]
struct GrimoireListParams {
    q: Option<String>,
    tag: Option<String>,
    limit: Option<usize>,
}

async fn grimoire_list(
    State(state): State<ApiState>,
    Query(params): Query<GrimoireListParams>,
) -> Response {
    let Some(grimoire) = &state.grimoire else {
        return error_response(&Error::NotConfigured("no grimoire attached".into()));
    };
    let query = GrimoireQuery {
        text: params.q,
        tag: params.tag,
        limit: params.limit,
        ..Default::default()
    };
    match grimoire.search(&query) {
        Ok(entries) => Json(json!({ "spells": entries })).into_response(),
        Err(error) => error_response(&error),
    }
}

async fn grimoire_save(State(state): State<ApiState>, body: Option<Json<Value>>) -> Response {
    let Some(grimoire) = &state.grimoire else {
        return error_response(&Error::NotConfigured("no grimoire attached".into()));
    };
    let Some(Json(body)) = body else {
        return error_response(&Error::InvalidInput("request body must be JSON".into()));
    };
    let Some(prompt) = body["prompt"].as_str().filter(|p| !p.trim().is_empty()) else {
        return error_response(&Error::InvalidInput("missing prompt".into()));
    };

    let inscription = Inscription {
        prompt: prompt.to_string(),
        tags: body["tags"]
            .as_array()
            .map(|tags| {
                tags.iter()
                    .filter_map(|t| t.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default(),
        category: body["category"].as_str().unwrap_or("misc").to_string(),
        score: body["score"].as_f64(),
        metadata: Default::default(),
    };
    match grimoire.inscribe(inscription) {
        Ok(entry) => (StatusCode::CREATED, Json(json!(entry))).into_response(),
        Err(error) => error_response(&error),
    }
}

async fn grimoire_get(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let Some(grimoire) = &state.grimoire else {
        return error_response(&Error::NotConfigured("no grimoire attached".into()));
    };
    match grimoire.get(&id) {
        Ok(entry) => Json(json!(entry)).into_response(),
        Err(error) => error_response(&error),
    }
}

#[derive(Debug, serde::Deserialize)]
struct HistoryListParams {
    limit: Option<usize>,
    provider: Option<String>,
}

async fn history_list(
    State(state): State<ApiState>,
    Query(params): Query<HistoryListParams>,
) -> Response {
    let Some(history) = &state.history else {
        return error_response(&Error::NotConfigured("no history attached".into()));
    };
    let options = ListOptions {
        provider: params.provider,
        limit: params.limit,
        min_grade: None,
    };
    match history.list(&options) {
        Ok(entries) => Json(json!({ "entries": entries })).into_response(),
        Err(error) => error_response(&error),
    }
}

async fn progress(State(state): State<ApiState>) -> Response {
    state.progress.handler()
}

async fn not_found() -> Response {
    error_response(&Error::NotFound("unknown route".into()))
}

/// Build the REST router.
pub fn api_router(state: ApiState) -> axum::Router {
    axum::Router::new()
        .route("/api/health", get(health))
        .route("/api/models", get(models))
        .route("/api/generate", post(generate))
        .route("/api/validate", post(validate))
        .route("/api/grimoire", get(grimoire_list).post(grimoire_save))
        .route("/api/grimoire/:id", get(grimoire_get))
        .route("/api/history", get(history_list))
        .route("/api/progress", get(progress))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state.clone(), guard))
        .with_state(state)
}

/// Serve the API until the token is cancelled.
pub async fn serve(
    state: ApiState,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> crate::error::Result<()> {
    let app = api_router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("failed to bind {}: {}", addr, e)))?;
    tracing::info!(%addr, "api server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { cancel.cancelled().await })
    .await
    .map_err(|e| Error::Internal(format!("api server error: {}", e)))
}
