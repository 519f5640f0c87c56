//! Common utilities for integration tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Request, Response},
    Router,
};
use server::config::ServerConfig;
use server::{build_router, AppState};
use tempfile::TempDir;
use tower::ServiceExt;
use tts_core::{
    AudioChunk, EngineHealth, EngineId, EngineRequest, LoadState, TtsEngine, TtsError, TtsService,
};

/// Fixed-output engine: `samples` samples at `rate` per call; text
/// containing "boom" fails.
pub struct FakeEngine {
    pub id: EngineId,
    pub rate: u32,
    pub samples: usize,
    pub calls: AtomicUsize,
}

impl FakeEngine {
    pub fn new(id: EngineId, rate: u32, samples: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            rate,
            samples,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TtsEngine for FakeEngine {
    fn id(&self) -> EngineId {
        self.id
    }

    async fn synthesize(&self, request: &EngineRequest) -> Result<AudioChunk, TtsError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if request.text.contains("boom") {
            return Err(TtsError::Inference("model exploded".into()));
        }
        Ok(AudioChunk::new(vec![0.1; self.samples], self.rate))
    }

    async fn warm_up(&self) -> Result<(), TtsError> {
        Ok(())
    }

    fn health(&self) -> EngineHealth {
        EngineHealth {
            engine: self.id,
            available: true,
            state: LoadState::Ready,
            installed: vec!["ms".into()],
            loaded: Vec::new(),
            error: None,
        }
    }

    fn supports_language(&self, language_tag: &str) -> bool {
        self.id == EngineId::Piper || language_tag.starts_with("ms")
    }

    fn voices(&self) -> Vec<String> {
        match self.id {
            EngineId::Piper => vec!["amy".into()],
            EngineId::Mms => vec!["ms".into()],
        }
    }

    fn default_voice(&self) -> Option<String> {
        (self.id == EngineId::Piper).then(|| "amy".to_string())
    }
}

pub struct TestApp {
    pub router: Router,
    pub piper: Arc<FakeEngine>,
    pub mms: Arc<FakeEngine>,
    pub output: TempDir,
}

impl TestApp {
    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }
}

/// Create a test app instance backed by fake engines; `tweak` adjusts the
/// configuration before the router is built.
pub fn create_test_app_with(tweak: impl FnOnce(&mut ServerConfig)) -> TestApp {
    let output = tempfile::tempdir().unwrap();
    let mut config = ServerConfig {
        output_dir: output.path().to_path_buf(),
        static_dir: output.path().join("no-static"),
        rate_limit_per_minute: 10_000,
        ..ServerConfig::default()
    };
    tweak(&mut config);

    let piper = FakeEngine::new(EngineId::Piper, 24_000, 1_200);
    let mms = FakeEngine::new(EngineId::Mms, 16_000, 800);
    let tts = Arc::new(TtsService::new(
        piper.clone(),
        Some(mms.clone() as Arc<dyn TtsEngine>),
        config.tts_settings(),
    ));
    let router = build_router(AppState::new(tts, config)).unwrap();

    TestApp { router, piper, mms, output }
}

pub fn create_test_app() -> TestApp {
    create_test_app_with(|_| {})
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}
