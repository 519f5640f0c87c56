//! The synthesis service: engine selection, the result cache and the chunked
//! streaming pipeline.
//!
//! One [`TtsService`] is built at startup and shared behind an `Arc`.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use ahash::AHasher;
use dashmap::DashMap;
use futures_core::Stream;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::audio::{pcm16_le_bytes, resample_linear};
use crate::engine::{clean_text, EngineHealth, EngineRequest, TtsEngine};
use crate::error::Result;
use crate::model::LoadState;
use crate::router::{select_engine, EngineId};
use crate::segment::{split_for_streaming, DEFAULT_MAX_CHUNK_CHARS};
use crate::stats::TtsStats;
use crate::wav::wav_header;

pub const DEFAULT_STREAM_SAMPLE_RATE: u32 = 24_000;
pub const DEFAULT_LANGUAGE: &str = "en-us";

#[derive(Debug, Clone, PartialEq)]
pub struct TtsSettings {
    /// Where batch results are written.
    pub output_dir: PathBuf,
    /// Every PCM frame of a stream is resampled to this rate.
    pub stream_sample_rate: u32,
    /// Prefix streams with a WAV header carrying sentinel sizes.
    pub stream_wav_header: bool,
    /// Sentences longer than this are split again at clause separators.
    pub chunk_max_chars: usize,
}

impl Default for TtsSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            stream_sample_rate: DEFAULT_STREAM_SAMPLE_RATE,
            stream_wav_header: true,
            chunk_max_chars: DEFAULT_MAX_CHUNK_CHARS,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice: Option<String>,
    pub language: String,
    pub speed: f32,
}

impl SynthesisRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            voice: None,
            language: DEFAULT_LANGUAGE.to_string(),
            speed: 1.0,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    pub fn with_speed(mut self, speed: f32) -> Self {
        self.speed = speed;
        self
    }

    fn engine_request(&self, text: String) -> EngineRequest {
        EngineRequest {
            text,
            voice: self.voice.clone(),
            language: self.language.clone(),
            speed: self.speed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult {
    pub engine: EngineId,
    /// Set when a file was written or served from the cache.
    pub audio_path: Option<PathBuf>,
    pub cached: bool,
    /// Native rate of the audio; 0 when nothing was synthesized.
    pub sample_rate: u32,
    /// Empty on cache hits, which return only the file.
    pub samples: Vec<f32>,
}

/// One unit of a streamed response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    /// 44-byte WAV header, sent once before any PCM.
    Header(Vec<u8>),
    /// 16-bit little-endian PCM for one text chunk.
    Pcm(Vec<u8>),
}

impl StreamFrame {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            StreamFrame::Header(b) | StreamFrame::Pcm(b) => b,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            StreamFrame::Header(b) | StreamFrame::Pcm(b) => b,
        }
    }
}

pub type FrameStream = Pin<Box<dyn Stream<Item = Result<StreamFrame>> + Send>>;

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// "healthy" when the default English voice is loaded, else "degraded".
    pub status: &'static str,
    pub engines: BTreeMap<String, EngineHealth>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoiceCatalog {
    pub piper: PiperCatalog,
    pub mms: MmsCatalog,
}

#[derive(Debug, Clone, Serialize)]
pub struct PiperCatalog {
    pub default_voice: Option<String>,
    pub voices: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MmsCatalog {
    pub enabled: bool,
    pub languages: Vec<String>,
    pub installed: Vec<String>,
}

pub struct TtsService {
    piper: Arc<dyn TtsEngine>,
    mms: Option<Arc<dyn TtsEngine>>,
    // key -> written WAV, kept for the process lifetime
    cache: DashMap<u64, PathBuf>,
    settings: TtsSettings,
    stats: TtsStats,
}

impl TtsService {
    /// `mms = None` disables the multilingual engine; every request then
    /// goes to Piper.
    pub fn new(piper: Arc<dyn TtsEngine>, mms: Option<Arc<dyn TtsEngine>>, settings: TtsSettings) -> Self {
        Self {
            piper,
            mms,
            cache: DashMap::new(),
            settings,
            stats: TtsStats::new(),
        }
    }

    pub fn settings(&self) -> &TtsSettings {
        &self.settings
    }

    pub fn stats(&self) -> &TtsStats {
        &self.stats
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Engine that serves `language`. Mms only when it has that language on
    /// disk (or loaded).
    pub fn select(&self, language: &str) -> (EngineId, Arc<dyn TtsEngine>) {
        let mms = self.mms.as_ref().filter(|m| m.supports_language(language));
        match (select_engine(language, mms.is_some()), mms) {
            (EngineId::Mms, Some(mms)) => (EngineId::Mms, mms.clone()),
            _ => (EngineId::Piper, self.piper.clone()),
        }
    }

    /// Fingerprint of everything that affects the produced audio.
    pub fn cache_key(request: &SynthesisRequest, engine: EngineId) -> u64 {
        let mut hasher = AHasher::default();
        request.text.hash(&mut hasher);
        engine.as_str().hash(&mut hasher);
        request.voice.hash(&mut hasher);
        request.language.hash(&mut hasher);
        request.speed.to_bits().hash(&mut hasher);
        hasher.finish()
    }

    async fn cached_result(&self, key: u64, engine: EngineId) -> Option<BatchResult> {
        let path = self.cache.get(&key).map(|p| p.clone())?;
        let check_path = path.clone();
        let opened = tokio::task::spawn_blocking(move || {
            hound::WavReader::open(&check_path).map(|reader| reader.spec().sample_rate)
        })
        .await;
        match opened {
            Ok(Ok(sample_rate)) => Some(BatchResult {
                engine,
                audio_path: Some(path),
                cached: true,
                sample_rate,
                samples: Vec::new(),
            }),
            Ok(Err(e)) => {
                debug!("cached file {} unusable ({e}), resynthesizing", path.display());
                self.cache.remove(&key);
                None
            }
            Err(e) => {
                warn!("cache check for {} failed: {e}", path.display());
                None
            }
        }
    }

    /// Synthesize the whole text with one engine call, writing a WAV to
    /// `output` when given. Repeated requests are served from the cache as
    /// long as the earlier file still exists.
    pub async fn synthesize_batch(&self, request: &SynthesisRequest, output: Option<&Path>) -> Result<BatchResult> {
        let (engine_id, engine) = self.select(&request.language);

        let text = clean_text(&request.text);
        if text.is_empty() {
            return Ok(BatchResult {
                engine: engine_id,
                audio_path: None,
                cached: false,
                sample_rate: 0,
                samples: Vec::new(),
            });
        }

        let key = Self::cache_key(request, engine_id);
        if let Some(hit) = self.cached_result(key, engine_id).await {
            self.stats.record_cache(true);
            info!(engine = %engine_id, "cache hit");
            return Ok(hit);
        }
        self.stats.record_cache(false);

        info!(engine = %engine_id, lang = %request.language, "batch synthesis of {} chars", text.chars().count());
        let start = Instant::now();
        let chunk = engine
            .synthesize_to(&request.engine_request(text), output)
            .await?;
        self.stats.record_synthesis(start.elapsed(), chunk.duration_secs());

        if let Some(path) = output {
            self.cache.insert(key, path.to_path_buf());
        }

        Ok(BatchResult {
            engine: engine_id,
            audio_path: output.map(Path::to_path_buf),
            cached: false,
            sample_rate: chunk.sample_rate,
            samples: chunk.samples,
        })
    }

    /// Segment the text and synthesize it chunk by chunk. Frames come out in
    /// chunk order; dropping the stream stops before the next chunk.
    pub fn synthesize_stream(self: Arc<Self>, request: SynthesisRequest) -> FrameStream {
        Box::pin(async_stream::try_stream! {
            let started = Instant::now();
            let (engine_id, engine) = self.select(&request.language);
            let chunks = split_for_streaming(&request.text, self.settings.chunk_max_chars);
            let rate = self.settings.stream_sample_rate;
            self.stats.record_stream();
            info!(engine = %engine_id, chunks = chunks.len(), "streaming synthesis at {rate} Hz");

            if self.settings.stream_wav_header {
                yield StreamFrame::Header(wav_header(rate, None).to_vec());
            }

            let total = chunks.len();
            for (i, text) in chunks.into_iter().enumerate() {
                let t0 = Instant::now();
                let chunk = engine.synthesize(&request.engine_request(text)).await?;
                self.stats.record_synthesis(t0.elapsed(), chunk.duration_secs());

                let samples = resample_linear(&chunk.samples, chunk.sample_rate, rate);
                let pcm = pcm16_le_bytes(&samples);
                if i == 0 {
                    self.stats.record_ttfb(started.elapsed());
                }
                self.stats.record_chunk();
                debug!("chunk {}/{} -> {} bytes", i + 1, total, pcm.len());
                yield StreamFrame::Pcm(pcm);
            }
            info!(elapsed_ms = started.elapsed().as_millis() as u64, "stream finished");
        })
    }

    /// Loads the default Piper voice if needed; Mms is only checked on disk.
    pub async fn health(&self) -> HealthReport {
        if let Err(e) = self.piper.warm_up().await {
            warn!("default voice unavailable: {e}");
        }

        let mut engines = BTreeMap::new();
        let piper = self.piper.health();
        let status = if piper.available { "healthy" } else { "degraded" };
        engines.insert(EngineId::Piper.to_string(), piper);
        engines.insert(
            EngineId::Mms.to_string(),
            match &self.mms {
                Some(mms) => mms.health(),
                None => EngineHealth {
                    engine: EngineId::Mms,
                    available: false,
                    state: LoadState::Unloaded,
                    installed: Vec::new(),
                    loaded: Vec::new(),
                    error: Some("multilingual engine disabled".to_string()),
                },
            },
        );

        HealthReport { status, engines }
    }

    pub fn voices(&self) -> VoiceCatalog {
        let (languages, installed) = match &self.mms {
            Some(mms) => (mms.voices(), mms.health().installed),
            None => (Vec::new(), Vec::new()),
        };
        VoiceCatalog {
            piper: PiperCatalog {
                default_voice: self.piper.default_voice(),
                voices: self.piper.voices(),
            },
            mms: MmsCatalog {
                enabled: self.mms.is_some(),
                languages,
                installed,
            },
        }
    }
}
