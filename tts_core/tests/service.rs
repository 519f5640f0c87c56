use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use tts_core::wav::{UNKNOWN_SIZE, WAV_HEADER_LEN};
use tts_core::{
    AudioChunk, EngineHealth, EngineId, EngineRequest, LoadState, StreamFrame, SynthesisRequest, TtsEngine, TtsError,
    TtsService, TtsSettings,
};

/// Emits `samples_per_call` samples at `rate` and counts invocations.
struct FakeEngine {
    id: EngineId,
    rate: u32,
    samples_per_call: usize,
    languages: Vec<&'static str>,
    calls: AtomicUsize,
    warm_ups: AtomicUsize,
}

impl FakeEngine {
    fn new(id: EngineId, rate: u32, samples_per_call: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            rate,
            samples_per_call,
            languages: vec!["ms", "id"],
            calls: AtomicUsize::new(0),
            warm_ups: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
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
            return Err(TtsError::Inference("boom".into()));
        }
        Ok(AudioChunk::new(vec![0.25; self.samples_per_call], self.rate))
    }

    async fn warm_up(&self) -> Result<(), TtsError> {
        self.warm_ups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn health(&self) -> EngineHealth {
        EngineHealth {
            engine: self.id,
            available: true,
            state: LoadState::Ready,
            installed: self.languages.iter().map(|l| l.to_string()).collect(),
            loaded: Vec::new(),
            error: None,
        }
    }

    fn supports_language(&self, language_tag: &str) -> bool {
        self.id == EngineId::Piper || self.languages.iter().any(|l| language_tag.starts_with(l))
    }

    fn voices(&self) -> Vec<String> {
        vec!["amy".to_string()]
    }

    fn default_voice(&self) -> Option<String> {
        Some("amy".to_string())
    }
}

fn service(piper: Arc<FakeEngine>, mms: Option<Arc<FakeEngine>>, settings: TtsSettings) -> Arc<TtsService> {
    Arc::new(TtsService::new(
        piper,
        mms.map(|m| m as Arc<dyn TtsEngine>),
        settings,
    ))
}

async fn collect(service: &Arc<TtsService>, request: SynthesisRequest) -> Vec<Result<StreamFrame, TtsError>> {
    service.clone().synthesize_stream(request).collect().await
}

#[tokio::test]
async fn repeated_batch_request_is_served_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let piper = FakeEngine::new(EngineId::Piper, 22_050, 2_205);
    let svc = service(piper.clone(), None, TtsSettings::default());
    let request = SynthesisRequest::new("Hello there.");

    let first_path = dir.path().join("first.wav");
    let first = svc.synthesize_batch(&request, Some(&first_path)).await.unwrap();
    assert!(!first.cached);
    assert_eq!(first.engine, EngineId::Piper);
    assert_eq!(first.sample_rate, 22_050);
    assert_eq!(first.samples.len(), 2_205);
    assert!(first_path.exists());

    let second = svc
        .synthesize_batch(&request, Some(&dir.path().join("second.wav")))
        .await
        .unwrap();
    assert!(second.cached);
    assert_eq!(second.audio_path.as_deref(), Some(first_path.as_path()));
    assert_eq!(second.sample_rate, 22_050);
    assert_eq!(piper.calls(), 1);

    let stats = svc.stats().snapshot();
    assert_eq!((stats.cache_hits, stats.cache_misses), (1, 1));
}

#[tokio::test]
async fn cache_key_covers_every_audio_parameter() {
    let base = SynthesisRequest::new("Hi");
    let key = TtsService::cache_key(&base, EngineId::Piper);
    assert_eq!(key, TtsService::cache_key(&base.clone(), EngineId::Piper));
    assert_ne!(key, TtsService::cache_key(&base, EngineId::Mms));
    assert_ne!(key, TtsService::cache_key(&base.clone().with_speed(1.5), EngineId::Piper));
    assert_ne!(key, TtsService::cache_key(&base.clone().with_voice("ryan"), EngineId::Piper));
    assert_ne!(key, TtsService::cache_key(&base.clone().with_language("en-gb"), EngineId::Piper));
}

#[tokio::test]
async fn deleted_cache_file_is_resynthesized() {
    let dir = tempfile::tempdir().unwrap();
    let piper = FakeEngine::new(EngineId::Piper, 22_050, 100);
    let svc = service(piper.clone(), None, TtsSettings::default());
    let request = SynthesisRequest::new("Gone soon.");
    let path = dir.path().join("a.wav");

    svc.synthesize_batch(&request, Some(&path)).await.unwrap();
    std::fs::remove_file(&path).unwrap();

    let again = svc.synthesize_batch(&request, Some(&path)).await.unwrap();
    assert!(!again.cached);
    assert!(path.exists());
    assert_eq!(piper.calls(), 2);
}

#[tokio::test]
async fn corrupted_cache_file_counts_as_miss() {
    let dir = tempfile::tempdir().unwrap();
    let piper = FakeEngine::new(EngineId::Piper, 22_050, 100);
    let svc = service(piper.clone(), None, TtsSettings::default());
    let request = SynthesisRequest::new("Overwritten.");
    let path = dir.path().join("b.wav");

    svc.synthesize_batch(&request, Some(&path)).await.unwrap();
    std::fs::write(&path, b"not a wav file").unwrap();

    let again = svc.synthesize_batch(&request, Some(&path)).await.unwrap();
    assert!(!again.cached);
    assert_eq!(again.sample_rate, 22_050);
    assert_eq!(piper.calls(), 2);
    assert_eq!(svc.stats().snapshot().cache_misses, 2);
}

#[tokio::test]
async fn batch_without_output_is_not_cached() {
    let piper = FakeEngine::new(EngineId::Piper, 22_050, 100);
    let svc = service(piper.clone(), None, TtsSettings::default());
    let request = SynthesisRequest::new("No file.");

    let result = svc.synthesize_batch(&request, None).await.unwrap();
    assert!(result.audio_path.is_none());
    svc.synthesize_batch(&request, None).await.unwrap();
    assert_eq!(piper.calls(), 2);
    assert_eq!(svc.cache_len(), 0);
}

#[tokio::test]
async fn empty_text_never_reaches_an_engine() {
    let piper = FakeEngine::new(EngineId::Piper, 22_050, 100);
    let svc = service(piper.clone(), None, TtsSettings::default());

    let result = svc
        .synthesize_batch(&SynthesisRequest::new("  \n\t "), None)
        .await
        .unwrap();
    assert!(result.samples.is_empty());
    assert_eq!(result.sample_rate, 0);

    let frames = collect(&svc, SynthesisRequest::new("   ")).await;
    assert_eq!(frames.len(), 1, "only the header");
    assert_eq!(piper.calls(), 0);
}

#[tokio::test]
async fn two_sentences_stream_as_header_and_two_frames() {
    let piper = FakeEngine::new(EngineId::Piper, 24_000, 1_200);
    let svc = service(piper.clone(), None, TtsSettings::default());

    let frames: Vec<StreamFrame> = collect(&svc, SynthesisRequest::new("Hello. World.").with_language("en-us"))
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(frames.len(), 3);
    let StreamFrame::Header(header) = &frames[0] else {
        panic!("first frame must be the header");
    };
    assert_eq!(header.len(), WAV_HEADER_LEN);
    assert_eq!(u32::from_le_bytes(header[4..8].try_into().unwrap()), UNKNOWN_SIZE);
    assert_eq!(u32::from_le_bytes(header[24..28].try_into().unwrap()), 24_000);

    let pcm: Vec<usize> = frames[1..]
        .iter()
        .map(|f| match f {
            StreamFrame::Pcm(bytes) => bytes.len(),
            StreamFrame::Header(_) => panic!("header after pcm"),
        })
        .collect();
    assert_eq!(pcm, vec![2_400, 2_400]);
    assert!(pcm.iter().all(|len| len % 2 == 0));
    assert_eq!(piper.calls(), 2);

    let stats = svc.stats().snapshot();
    assert_eq!(stats.streams, 1);
    assert_eq!(stats.chunks_streamed, 2);
}

#[tokio::test]
async fn stream_resamples_to_the_output_rate() {
    let piper = FakeEngine::new(EngineId::Piper, 16_000, 1_600);
    let svc = service(piper, None, TtsSettings::default());

    let frames = collect(&svc, SynthesisRequest::new("One chunk only")).await;
    let body: usize = frames
        .into_iter()
        .map(|f| f.unwrap())
        .filter(|f| matches!(f, StreamFrame::Pcm(_)))
        .map(|f| f.into_bytes().len())
        .sum();
    // 1600 samples at 16 kHz -> 2400 at 24 kHz, two bytes each
    assert_eq!(body, 4_800);
}

#[tokio::test]
async fn header_can_be_disabled() {
    let piper = FakeEngine::new(EngineId::Piper, 24_000, 10);
    let settings = TtsSettings {
        stream_wav_header: false,
        ..TtsSettings::default()
    };
    let svc = service(piper, None, settings);

    let frames = collect(&svc, SynthesisRequest::new("A. B. C.")).await;
    assert_eq!(frames.len(), 3);
    assert!(frames.iter().all(|f| matches!(f, Ok(StreamFrame::Pcm(_)))));
}

#[tokio::test]
async fn engine_error_ends_the_stream() {
    let piper = FakeEngine::new(EngineId::Piper, 24_000, 10);
    let svc = service(piper.clone(), None, TtsSettings::default());

    let frames = collect(&svc, SynthesisRequest::new("Fine. Then boom. Never said.")).await;
    assert_eq!(frames.len(), 3);
    assert!(matches!(frames[1], Ok(StreamFrame::Pcm(_))));
    assert!(matches!(frames[2], Err(TtsError::Inference(_))));
    assert_eq!(piper.calls(), 2);
}

#[tokio::test]
async fn dropping_the_stream_stops_synthesis() {
    let piper = FakeEngine::new(EngineId::Piper, 24_000, 10);
    let svc = service(piper.clone(), None, TtsSettings::default());

    let mut stream = svc.clone().synthesize_stream(SynthesisRequest::new("One. Two. Three. Four."));
    assert!(matches!(stream.next().await, Some(Ok(StreamFrame::Header(_)))));
    assert!(matches!(stream.next().await, Some(Ok(StreamFrame::Pcm(_)))));
    drop(stream);
    assert_eq!(piper.calls(), 1);
}

#[tokio::test]
async fn multilingual_requests_route_by_installed_language() {
    let piper = FakeEngine::new(EngineId::Piper, 22_050, 10);
    let mms = FakeEngine::new(EngineId::Mms, 16_000, 10);
    let svc = service(piper.clone(), Some(mms.clone()), TtsSettings::default());

    assert_eq!(svc.select("ms-MY").0, EngineId::Mms);
    assert_eq!(svc.select("en-us").0, EngineId::Piper);
    // allow-listed but not installed
    assert_eq!(svc.select("de").0, EngineId::Piper);

    let result = svc
        .synthesize_batch(&SynthesisRequest::new("Selamat pagi").with_language("ms"), None)
        .await
        .unwrap();
    assert_eq!(result.engine, EngineId::Mms);
    assert_eq!(result.sample_rate, 16_000);
    assert_eq!((piper.calls(), mms.calls()), (0, 1));

    let disabled = service(piper, None, TtsSettings::default());
    assert_eq!(disabled.select("ms").0, EngineId::Piper);
}

#[tokio::test]
async fn health_warms_piper_and_reports_both_engines() {
    let piper = FakeEngine::new(EngineId::Piper, 22_050, 10);
    let svc = service(piper.clone(), None, TtsSettings::default());

    let report = svc.health().await;
    assert_eq!(report.status, "healthy");
    assert_eq!(piper.warm_ups.load(Ordering::SeqCst), 1);
    assert!(report.engines["piper"].available);
    assert!(!report.engines["mms"].available);

    let catalog = svc.voices();
    assert_eq!(catalog.piper.default_voice.as_deref(), Some("amy"));
    assert!(!catalog.mms.enabled);
}
