//! Multilingual backend: Meta MMS-TTS (VITS) models exported to ONNX, one
//! model per language, executed with `ort`.
//!
//! Expected layout under the model directory:
//!
//! ```text
//! models/
//!   mms-tts-zlm/
//!     model.onnx
//!     vocab.json
//!     config.json            # sampling_rate
//!     tokenizer_config.json  # add_blank, normalize (optional)
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;
use ndarray::Array2;
use ort::execution_providers::CUDAExecutionProvider;
use ort::session::Session;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audio::{apply_speed, AudioChunk};
use crate::engine::{clean_text, EngineHealth, EngineRequest, TtsEngine};
use crate::error::{Result, TtsError};
use crate::model::{LoadState, ModelProxy};
use crate::router::{primary_subtag, EngineId};

/// Language code -> model directory name.
pub const LANGUAGE_MODELS: &[(&str, &str)] = &[
    ("en", "mms-tts-eng"),
    ("ms", "mms-tts-zlm"),
    ("id", "mms-tts-ind"),
    ("zh", "mms-tts-zho"),
    ("ja", "mms-tts-jpn"),
    ("ko", "mms-tts-kor"),
    ("es", "mms-tts-spa"),
    ("fr", "mms-tts-fra"),
    ("de", "mms-tts-deu"),
    ("it", "mms-tts-ita"),
];

const DEFAULT_SAMPLE_RATE: u32 = 16_000;
const MODEL_FILE: &str = "model.onnx";
const VOCAB_FILE: &str = "vocab.json";
const CONFIG_FILE: &str = "config.json";
const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";

/// Where ONNX sessions run. Chosen once from configuration and handed to
/// `ort` when a session is built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionBackend {
    /// Register CUDA and let ONNX Runtime fall back to CPU when it is absent.
    #[default]
    Auto,
    Cpu,
    /// Require CUDA; session creation fails without it.
    Cuda,
}

impl FromStr for ExecutionBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(Self::Auto),
            "cpu" | "cpuexecutionprovider" => Ok(Self::Cpu),
            "cuda" | "gpu" | "cudaexecutionprovider" => Ok(Self::Cuda),
            other => Err(format!("unknown execution backend '{other}' (expected auto, cpu or cuda)")),
        }
    }
}

/// Character-level VITS tokenizer.
#[derive(Debug, Clone)]
pub struct VitsTokenizer {
    vocab: HashMap<String, i64>,
    add_blank: bool,
    lowercase: bool,
}

#[derive(Debug, Default, Deserialize)]
struct TokenizerConfig {
    add_blank: Option<bool>,
    normalize: Option<bool>,
    is_uroman: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct ModelConfig {
    sampling_rate: Option<u32>,
}

impl VitsTokenizer {
    pub fn new(vocab: HashMap<String, i64>, add_blank: bool, lowercase: bool) -> Self {
        Self { vocab, add_blank, lowercase }
    }

    /// Token ids for `text`. Characters outside the vocabulary are dropped;
    /// with `add_blank` every token is surrounded by the blank id 0.
    pub fn encode(&self, text: &str) -> Vec<i64> {
        let text = if self.lowercase { text.to_lowercase() } else { text.to_string() };
        let mut buf = [0u8; 4];
        let tokens: Vec<i64> = text
            .chars()
            .filter_map(|c| self.vocab.get(&*c.encode_utf8(&mut buf)).copied())
            .collect();

        if !self.add_blank || tokens.is_empty() {
            return tokens;
        }
        let mut out = Vec::with_capacity(tokens.len() * 2 + 1);
        out.push(0);
        for t in tokens {
            out.push(t);
            out.push(0);
        }
        out
    }
}

struct VitsModel {
    session: Session,
    tokenizer: VitsTokenizer,
    sample_rate: u32,
    output_name: String,
    wants_attention_mask: bool,
}

impl VitsModel {
    fn load(dir: &Path, backend: ExecutionBackend) -> Result<Self> {
        let model_path = dir.join(MODEL_FILE);
        let vocab_path = dir.join(VOCAB_FILE);
        for path in [&model_path, &vocab_path] {
            if !path.exists() {
                return Err(TtsError::MissingArtifact(path.clone()));
            }
        }

        let vocab: HashMap<String, i64> = read_json(&vocab_path)?;
        let tok_cfg: TokenizerConfig = read_optional_json(&dir.join(TOKENIZER_CONFIG_FILE))?;
        let model_cfg: ModelConfig = read_optional_json(&dir.join(CONFIG_FILE))?;
        if tok_cfg.is_uroman.unwrap_or(false) {
            warn!(
                "{} expects romanized input; characters outside its vocabulary will be dropped",
                dir.display()
            );
        }
        let tokenizer = VitsTokenizer::new(
            vocab,
            tok_cfg.add_blank.unwrap_or(true),
            tok_cfg.normalize.unwrap_or(true),
        );

        let session = build_session(&model_path, backend)?;
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| TtsError::Load(format!("{} declares no outputs", model_path.display())))?;
        let wants_attention_mask = session.inputs.iter().any(|i| i.name == "attention_mask");

        Ok(Self {
            session,
            tokenizer,
            sample_rate: model_cfg.sampling_rate.unwrap_or(DEFAULT_SAMPLE_RATE),
            output_name,
            wants_attention_mask,
        })
    }

    fn infer(&self, ids: Vec<i64>) -> Result<Vec<f32>> {
        let len = ids.len();
        let input_ids = Array2::from_shape_vec((1, len), ids)
            .map_err(|e| TtsError::Inference(e.to_string()))?;
        let attention_mask = Array2::<i64>::ones((1, len));

        let outputs = if self.wants_attention_mask {
            self.session.run(
                ort::inputs![
                    "input_ids" => input_ids.view(),
                    "attention_mask" => attention_mask.view(),
                ]
                .map_err(|e| TtsError::Inference(e.to_string()))?,
            )
        } else {
            self.session.run(
                ort::inputs!["input_ids" => input_ids.view()]
                    .map_err(|e| TtsError::Inference(e.to_string()))?,
            )
        }
        .map_err(|e| TtsError::Inference(e.to_string()))?;

        let waveform = outputs
            .get(self.output_name.as_str())
            .ok_or_else(|| TtsError::Inference(format!("missing output '{}'", self.output_name)))?
            .try_extract_tensor::<f32>()
            .map_err(|e| TtsError::Inference(e.to_string()))?;

        Ok(waveform.view().iter().copied().collect())
    }
}

fn build_session(model_path: &Path, backend: ExecutionBackend) -> Result<Session> {
    let load_err = |e: ort::Error| TtsError::Load(format!("{}: {e}", model_path.display()));

    let builder = Session::builder().map_err(load_err)?;
    let builder = match backend {
        ExecutionBackend::Cpu => builder,
        ExecutionBackend::Auto => builder
            .with_execution_providers([CUDAExecutionProvider::default().build()])
            .map_err(load_err)?,
        ExecutionBackend::Cuda => builder
            .with_execution_providers([CUDAExecutionProvider::default().build().error_on_failure()])
            .map_err(load_err)?,
    };
    info!(backend = ?backend, "building ONNX session for {}", model_path.display());
    builder.commit_from_file(model_path).map_err(load_err)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let parsed = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))
        .and_then(|text| {
            serde_json::from_str(&text).with_context(|| format!("{} is not valid JSON", path.display()))
        })
        .map_err(|e| TtsError::Load(format!("{e:#}")))?;
    Ok(parsed)
}

fn read_optional_json<T: serde::de::DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if path.exists() {
        read_json(path)
    } else {
        Ok(T::default())
    }
}

/// Per-language MMS engine. Each language loads on first use.
pub struct MmsEngine {
    model_dir: PathBuf,
    backend: ExecutionBackend,
    models: BTreeMap<&'static str, ModelProxy<VitsModel>>,
}

impl MmsEngine {
    pub fn new(model_dir: impl Into<PathBuf>, backend: ExecutionBackend) -> Self {
        let model_dir = model_dir.into();
        let models = LANGUAGE_MODELS
            .iter()
            .map(|(lang, name)| (*lang, ModelProxy::new(format!("mms/{name}"))))
            .collect();
        info!("MMS engine using {} ({:?})", model_dir.display(), backend);
        Self { model_dir, backend, models }
    }

    pub fn supported_languages() -> Vec<&'static str> {
        LANGUAGE_MODELS.iter().map(|(lang, _)| *lang).collect()
    }

    fn model_name(language: &str) -> Option<&'static str> {
        LANGUAGE_MODELS
            .iter()
            .find(|(lang, _)| *lang == language)
            .map(|(_, name)| *name)
    }

    fn language_dir(&self, language: &str) -> Option<PathBuf> {
        Self::model_name(language).map(|name| self.model_dir.join(name))
    }

    fn is_installed(&self, language: &str) -> bool {
        self.language_dir(language)
            .is_some_and(|dir| dir.join(MODEL_FILE).exists() && dir.join(VOCAB_FILE).exists())
    }

    fn unsupported(language: &str) -> TtsError {
        TtsError::UnsupportedLanguage {
            language: language.to_string(),
            supported: Self::supported_languages().join(", "),
        }
    }

    /// Native rate of a language's model, read from its config without
    /// loading the model.
    pub fn sample_rate(&self, language_tag: &str) -> Result<u32> {
        let language = primary_subtag(language_tag);
        let dir = self.language_dir(&language).ok_or_else(|| Self::unsupported(&language))?;
        let cfg: ModelConfig = read_optional_json(&dir.join(CONFIG_FILE))?;
        Ok(cfg.sampling_rate.unwrap_or(DEFAULT_SAMPLE_RATE))
    }

    async fn load(&self, language: &str) -> Result<crate::model::SharedModel<VitsModel>> {
        let proxy = self.models.get(language).ok_or_else(|| Self::unsupported(language))?;
        let dir = self.language_dir(language).ok_or_else(|| Self::unsupported(language))?;
        let backend = self.backend;
        proxy.get_or_load(move || VitsModel::load(&dir, backend)).await
    }
}

#[async_trait]
impl TtsEngine for MmsEngine {
    fn id(&self) -> EngineId {
        EngineId::Mms
    }

    async fn synthesize(&self, request: &EngineRequest) -> Result<AudioChunk> {
        let language = primary_subtag(&request.language);
        if Self::model_name(&language).is_none() {
            return Err(Self::unsupported(&language));
        }

        let text = clean_text(&request.text);
        if text.is_empty() {
            return Ok(AudioChunk::empty(self.sample_rate(&language)?));
        }

        let model = self.load(&language).await?;
        let speed = request.speed;
        let preview: String = text.chars().take(50).collect();
        info!(language = %language, "[mms] synthesizing: {preview}...");

        tokio::task::spawn_blocking(move || {
            let model = model.lock().map_err(|_| TtsError::poisoned("mms model"))?;
            let ids = model.tokenizer.encode(&text);
            if ids.is_empty() {
                debug!("no tokens left after vocabulary filtering");
                return Ok(AudioChunk::empty(model.sample_rate));
            }

            let start = Instant::now();
            let samples = model.infer(ids).map_err(|e| {
                tracing::error!("[mms] synthesis failed: {e}");
                e
            })?;
            let chunk = AudioChunk::new(apply_speed(samples, speed), model.sample_rate);
            let elapsed = start.elapsed().as_secs_f64();
            info!(
                "[mms] synthesized {:.2}s of audio in {:.3}s (rtf {:.3})",
                chunk.duration_secs(),
                elapsed,
                elapsed / chunk.duration_secs().max(1e-6)
            );
            Ok(chunk)
        })
        .await?
    }

    async fn warm_up(&self) -> Result<()> {
        // Preload whatever is installed; nothing installed is not an error.
        for (language, _) in LANGUAGE_MODELS {
            if self.is_installed(language) {
                self.load(language).await?;
            }
        }
        Ok(())
    }

    fn health(&self) -> EngineHealth {
        let installed: Vec<String> = LANGUAGE_MODELS
            .iter()
            .filter(|(lang, _)| self.is_installed(lang))
            .map(|(lang, _)| lang.to_string())
            .collect();
        let loaded: Vec<String> = self
            .models
            .iter()
            .filter(|(_, proxy)| proxy.state() == LoadState::Ready)
            .map(|(lang, _)| lang.to_string())
            .collect();
        let error = self.models.values().find_map(|proxy| {
            proxy.last_error().map(|e| format!("{}: {e}", proxy.name()))
        });
        let state = if !loaded.is_empty() {
            LoadState::Ready
        } else if self.models.values().any(|p| p.state() == LoadState::Loading) {
            LoadState::Loading
        } else if error.is_some() {
            LoadState::Failed
        } else {
            LoadState::Unloaded
        };

        EngineHealth {
            engine: EngineId::Mms,
            available: !installed.is_empty() || !loaded.is_empty(),
            state,
            installed,
            loaded,
            error,
        }
    }

    fn supports_language(&self, language_tag: &str) -> bool {
        let language = primary_subtag(language_tag);
        self.models
            .get(language.as_str())
            .is_some_and(|proxy| proxy.state() == LoadState::Ready)
            || self.is_installed(&language)
    }

    fn voices(&self) -> Vec<String> {
        Self::supported_languages().into_iter().map(String::from).collect()
    }

    fn default_voice(&self) -> Option<String> {
        None
    }
}
