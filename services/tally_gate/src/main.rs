//! Tally Gate: HTTP entry point for the encoding telemetry insights engine.
//!
//! Writes go through the ingestor one sample per request. Reads are served
//! from the insights cache, which a background task refreshes on a fixed
//! interval. Nothing here touches the fact store directly except health.

use axum::{
    body::Bytes,
    extract::{ConnectInfo, DefaultBodyLimit, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tally_config::TallyConfig;
use tally_runtime::knock::MAX_BODY_BYTES;
use tally_runtime::{spawn_refresh_loop, Ingestor, InsightsCache, RateLimiter, RejectionReason};
use tally_store::FactStore;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod metrics;

const GENERATION_HEADER: &str = "x-tally-generation";

/// Shared application state.
#[derive(Clone)]
struct AppState {
    ingestor: Arc<Ingestor>,
    insights: Arc<InsightsCache>,
    /// `Cache-Control` max-age for the insights body, in seconds.
    cache_max_age: u64,
    trust_forwarded_for: bool,
}

impl AppState {
    fn new(ingestor: Arc<Ingestor>, insights: Arc<InsightsCache>, config: &TallyConfig) -> Self {
        Self {
            ingestor,
            insights,
            cache_max_age: config.refresh_interval.as_secs(),
            trust_forwarded_for: config.trust_forwarded_for,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let config = TallyConfig::from_env();
    info!(
        backend = ?config.store_backend,
        path = %config.store_path.display(),
        "starting tally gate"
    );

    let backend = tally_store::open_backend(config.store_backend, &config.store_path)?;
    let store = Arc::new(FactStore::open(backend)?);
    let ingestor = Arc::new(Ingestor::from_config(store.clone(), &config));
    let insights = Arc::new(InsightsCache::new(
        store.clone(),
        config.aggregation.clone(),
    ));

    spawn_refresh_loop(
        insights.clone(),
        config.refresh_interval,
        metrics::record_refresh,
    );
    if let Some(limiter) = ingestor.limiter() {
        spawn_rate_limit_pruner(limiter.clone());
        info!(per_min = config.rate_limit_per_min, "submission rate limit enabled");
    }

    let app = build_router(AppState::new(ingestor, insights, &config));
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    info!("gate listening on http://{}", config.listen_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    store.flush()?;
    info!("fact store flushed, bye");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tally_runtime=debug,tally_gate=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for ctrl-c, running until killed");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

fn spawn_rate_limit_pruner(limiter: Arc<RateLimiter>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(limiter.config().window);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let tracked = limiter.prune().await;
            debug!(tracked, "rate limiter pruned");
        }
    });
}

fn build_router(state: AppState) -> Router {
    // The dashboard polls the read API from the browser
    let reads = Router::new()
        .route("/api/v1/stats/insights", get(get_insights))
        .route("/api/v1/stats/reliability", get(get_reliability))
        .layer(read_cors());

    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .merge(reads)
        .route("/api/v1/telemetry", post(post_telemetry))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

fn read_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static(GENERATION_HEADER)])
}

async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.ingestor.store().ping() {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({"status": "ok", "system": "tally", "store": "ok"})),
        ),
        Err(e) => {
            warn!(error = %e, "health check: store unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "degraded", "system": "tally", "store": "unavailable"})),
            )
        }
    }
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::encode_metrics(),
    )
}

/// GET /api/v1/stats/insights: the published snapshot, never computed
/// inline.
async fn get_insights(State(state): State<AppState>) -> Response {
    let snapshot = state.insights.snapshot();
    let mut headers = HeaderMap::new();
    if let Ok(v) = HeaderValue::from_str(&format!("public, max-age={}", state.cache_max_age)) {
        headers.insert(header::CACHE_CONTROL, v);
    }
    headers.insert(GENERATION_HEADER, HeaderValue::from(snapshot.generation));
    (headers, Json(snapshot.as_ref())).into_response()
}

/// GET /api/v1/stats/reliability: failure rate per encoder.
async fn get_reliability(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "encoders": state.insights.reliability() }))
}

/// POST /api/v1/telemetry: one sample per call.
async fn post_telemetry(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    metrics::inc_received();
    let origin = resolve_origin(
        &headers,
        peer.map(|ConnectInfo(addr)| addr),
        state.trust_forwarded_for,
    );
    match state.ingestor.ingest(&body, &origin).await {
        Ok(_) => {
            metrics::inc_accepted();
            (StatusCode::ACCEPTED, Json(json!({"status": "accepted"}))).into_response()
        }
        Err(reason) => {
            metrics::inc_rejected(reason.kind());
            rejection_response(&reason)
        }
    }
}

/// Validation and privacy rejections share one body so a probing client
/// cannot tell which check fired.
fn rejection_response(reason: &RejectionReason) -> Response {
    let (status, label) = match reason {
        RejectionReason::Validation(_) | RejectionReason::PrivacyViolation(_) => {
            (StatusCode::BAD_REQUEST, "rejected")
        }
        RejectionReason::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
        RejectionReason::StoreUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
    };
    let mut headers = HeaderMap::new();
    if let Some(secs) = reason.retry_after_secs() {
        headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }
    (status, headers, Json(json!({ "status": label }))).into_response()
}

/// Network origin used as the rate-limit key. `X-Forwarded-For` is only
/// honoured when configured, and only if its first hop is an IP.
fn resolve_origin(headers: &HeaderMap, peer: Option<SocketAddr>, trust_forwarded: bool) -> String {
    if trust_forwarded {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }
    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
