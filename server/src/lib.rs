pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod validation;

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::Request,
    http::{HeaderValue, Method},
    middleware::Next,
    response::Response,
    routing::get,
    Router,
};
use tower::ServiceBuilder;
use tower_governor::{governor::GovernorConfigBuilder, key_extractor::GlobalKeyExtractor, GovernorLayer};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    services::ServeDir,
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};
use tts_core::{MmsEngine, PiperEngine, TtsEngine, TtsService};

use crate::config::ServerConfig;
use crate::metrics::AppMetrics;

/// JSON bodies are small; 5000 characters of text fit comfortably.
const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub tts: Arc<TtsService>,
    pub metrics: AppMetrics,
    pub request_count: Arc<AtomicU64>,
    pub config: ServerConfig,
    pub started: Instant,
}

impl AppState {
    pub fn new(tts: Arc<TtsService>, config: ServerConfig) -> Self {
        Self {
            tts,
            metrics: AppMetrics::new(),
            request_count: Arc::new(AtomicU64::new(0)),
            config,
            started: Instant::now(),
        }
    }
}

/// Wire up both engines from configuration. A missing or broken voice map
/// leaves Piper without voices; health reports it instead of refusing to
/// start.
pub fn build_service(config: &ServerConfig) -> TtsService {
    let piper = PiperEngine::from_map_file(&config.piper_voice_map, config.piper_default_voice.clone())
        .unwrap_or_else(|e| {
            warn!("Could not load {}: {e:#}, using no Piper voices.", config.piper_voice_map.display());
            PiperEngine::empty()
        });

    let mms: Option<Arc<dyn TtsEngine>> = if config.mms_enabled {
        Some(Arc::new(MmsEngine::new(&config.model_dir, config.onnx_provider)))
    } else {
        info!("Multilingual engine disabled");
        None
    };

    TtsService::new(Arc::new(piper), mms, config.tts_settings())
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .allow_credentials(false);

    let origins: Vec<HeaderValue> = config
        .cors_allowed_origins
        .iter()
        .flatten()
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect();

    match (&config.cors_allowed_origins, origins.is_empty()) {
        (Some(_), false) => {
            info!("CORS configured for {} origin(s)", origins.len());
            base.allow_origin(AllowOrigin::list(origins))
        }
        (Some(_), true) => {
            warn!("CORS_ALLOWED_ORIGINS has no valid origins, falling back to permissive CORS");
            base.allow_origin(Any)
        }
        (None, _) => {
            warn!("CORS_ALLOWED_ORIGINS not set, allowing all origins (development mode)");
            base.allow_origin(Any)
        }
    }
}

/// Request ID middleware for tracing
async fn add_request_id(mut request: Request, next: Next) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let header = HeaderValue::from_str(&request_id).ok();
    if let Some(value) = header.clone() {
        request.headers_mut().insert("x-request-id", value);
    }
    let mut response = next.run(request).await;
    if let Some(value) = header {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// The full application: API routes, generated audio, static UI and the
/// middleware stack.
pub fn build_router(state: AppState) -> anyhow::Result<Router> {
    let config = &state.config;

    // Global limit: every client shares one bucket.
    let rpm = u64::from(config.rate_limit_per_minute.max(1));
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_millisecond((60_000 / rpm).max(1))
            .burst_size(config.rate_limit_per_minute.max(1))
            .key_extractor(GlobalKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("invalid rate limit configuration"))?,
    );
    info!("Rate limiting: {} requests per minute", config.rate_limit_per_minute);

    let middleware_stack = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(GovernorLayer::new(governor_conf))
        .layer(TimeoutLayer::new(config.request_timeout()))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(cors_layer(config))
        .into_inner();

    let api = Router::new()
        .route("/health", get(handlers::health))
        .route("/voices", get(handlers::voices))
        .route("/metrics", get(handlers::metrics))
        .route("/tts", axum::routing::post(handlers::tts))
        .route("/tts/stream", get(handlers::stream_get).post(handlers::stream_post));

    let mut app = Router::new()
        .route("/", get(handlers::root))
        .nest("/api", api)
        .nest_service("/output", ServeDir::new(&state.tts.settings().output_dir));

    if config.static_dir.is_dir() {
        info!("Serving static files from {}", config.static_dir.display());
        app = app.nest_service("/static", ServeDir::new(&config.static_dir));
    }

    Ok(app
        .layer(axum::middleware::from_fn(add_request_id))
        .layer(middleware_stack)
        .with_state(state))
}
