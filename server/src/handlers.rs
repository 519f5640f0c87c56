use std::sync::atomic::Ordering;
use std::time::Instant;

use axum::{
    body::{Body, Bytes},
    extract::{Query, State},
    http::header,
    response::{Html, IntoResponse, Response},
    Json,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use tts_core::service::DEFAULT_LANGUAGE;
use tts_core::wav::wav_header;
use tts_core::{EngineId, HealthReport, SynthesisRequest, VoiceCatalog};

use crate::error::ApiError;
use crate::metrics::{DetailedMetricsResponse, EndpointMetrics, EndpointMetricsResponse, SystemMetrics};
use crate::validation::validate_tts_request;
use crate::AppState;

/// Body of `POST /api/tts` and `POST /api/tts/stream`, query of
/// `GET /api/tts/stream`.
#[derive(Debug, Deserialize)]
pub struct TtsRequest {
    pub text: String,
    pub voice: Option<String>,
    #[serde(alias = "language")]
    pub lang: Option<String>,
    pub speed: Option<f32>,
}

impl TtsRequest {
    fn into_synthesis(self) -> Result<SynthesisRequest, ApiError> {
        validate_tts_request(&self.text, self.lang.as_deref(), self.speed)?;
        let mut request = SynthesisRequest::new(self.text)
            .with_language(self.lang.unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()))
            .with_speed(self.speed.unwrap_or(1.0));
        if let Some(voice) = self.voice.filter(|v| !v.trim().is_empty()) {
            request = request.with_voice(voice);
        }
        Ok(request)
    }
}

#[derive(Debug, Serialize)]
pub struct TtsResponse {
    pub success: bool,
    pub audio_url: String,
    pub engine: EngineId,
    pub cached: bool,
}

#[derive(Debug, Serialize)]
pub struct ServiceInfo {
    pub service: &'static str,
    pub status: &'static str,
    pub version: &'static str,
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Count the outcome of a handler against `metrics`.
fn track<T>(metrics: &EndpointMetrics, start: Instant, result: Result<T, ApiError>) -> Result<T, ApiError> {
    match &result {
        Ok(_) => metrics.record_request(elapsed_ms(start)),
        Err(_) => metrics.record_error(),
    }
    result
}

/// The web UI's `index.html` when one is installed, service info otherwise.
pub async fn root(State(state): State<AppState>) -> Response {
    let index = state.config.static_dir.join("index.html");
    if let Ok(page) = tokio::fs::read_to_string(&index).await {
        return Html(page).into_response();
    }
    Json(ServiceInfo {
        service: "tts-gateway",
        status: "running",
        version: env!("CARGO_PKG_VERSION"),
    })
    .into_response()
}

pub async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.tts.health().await)
}

pub async fn voices(State(state): State<AppState>) -> Json<VoiceCatalog> {
    Json(state.tts.voices())
}

pub async fn tts(State(state): State<AppState>, Json(req): Json<TtsRequest>) -> Result<Json<TtsResponse>, ApiError> {
    let start = Instant::now();
    state.request_count.fetch_add(1, Ordering::Relaxed);
    let result = batch(&state, req).await;
    track(&state.metrics.tts, start, result).map(Json)
}

async fn batch(state: &AppState, req: TtsRequest) -> Result<TtsResponse, ApiError> {
    let request = req.into_synthesis()?;
    let output = state
        .tts
        .settings()
        .output_dir
        .join(format!("{}.wav", uuid::Uuid::new_v4()));

    let result = state.tts.synthesize_batch(&request, Some(&output)).await?;
    let path = match result.audio_path.as_deref() {
        Some(path) => path,
        None => {
            // Nothing speakable survived text cleanup: answer with silence.
            let rate = state.tts.settings().stream_sample_rate;
            tokio::fs::write(&output, wav_header(rate, Some(0)))
                .await
                .map_err(|e| ApiError::Internal(format!("failed to write {}: {e}", output.display())))?;
            output.as_path()
        }
    };
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ApiError::Internal("synthesis produced no audio file".to_string()))?;

    info!(engine = %result.engine, cached = result.cached, "wrote {file_name}");
    Ok(TtsResponse {
        success: true,
        audio_url: format!("/output/{file_name}"),
        engine: result.engine,
        cached: result.cached,
    })
}

pub async fn stream_get(State(state): State<AppState>, Query(req): Query<TtsRequest>) -> Result<Response, ApiError> {
    stream(state, req)
}

pub async fn stream_post(State(state): State<AppState>, Json(req): Json<TtsRequest>) -> Result<Response, ApiError> {
    stream(state, req)
}

/// Starts the chunked body; inference happens while the body is polled.
fn stream(state: AppState, req: TtsRequest) -> Result<Response, ApiError> {
    let start = Instant::now();
    state.request_count.fetch_add(1, Ordering::Relaxed);
    let request = track(&state.metrics.stream, start, req.into_synthesis())?;

    let settings = state.tts.settings();
    let content_type = if settings.stream_wav_header {
        "audio/wav".to_string()
    } else {
        format!("audio/L16;rate={};channels=1", settings.stream_sample_rate)
    };

    let errors = state.metrics.stream.clone();
    let frames = state.tts.clone().synthesize_stream(request).map(move |frame| match frame {
        Ok(frame) => Ok(Bytes::from(frame.into_bytes())),
        Err(e) => {
            error!("stream aborted: {e}");
            errors.record_error();
            Err(e)
        }
    });

    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        Body::from_stream(frames),
    )
        .into_response())
}

pub async fn metrics(State(state): State<AppState>) -> Json<DetailedMetricsResponse> {
    let request_count = state.request_count.load(Ordering::Relaxed);
    let uptime = state.started.elapsed().as_secs();

    Json(DetailedMetricsResponse {
        timestamp: chrono::Utc::now(),
        system: SystemMetrics::collect(request_count, uptime),
        endpoints: EndpointMetricsResponse {
            tts: state.metrics.tts.stats(),
            stream: state.metrics.stream.stats(),
        },
        tts: state.tts.stats().snapshot(),
    })
}
