//! English-optimized backend: Piper voices run through `piper-rs`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;
use piper_rs::synth::PiperSpeechSynthesizer;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::audio::{apply_speed, AudioChunk};
use crate::engine::{clean_text, EngineHealth, EngineRequest, TtsEngine};
use crate::error::{Result, TtsError};
use crate::model::{LoadState, ModelProxy, SharedModel};
use crate::router::{primary_subtag, EngineId};
use crate::service::DEFAULT_LANGUAGE;

/// One entry of the voice map.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PiperVoiceEntry {
    /// Path to the `<voice>.onnx.json` config; the model sits next to it.
    pub config: PathBuf,
    pub language: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl PiperVoiceEntry {
    pub fn new(config: impl Into<PathBuf>, language: impl Into<String>) -> Self {
        Self {
            config: config.into(),
            language: language.into(),
            display_name: None,
        }
    }

    fn model_path(&self) -> PathBuf {
        onnx_path(&self.config)
    }

    fn is_installed(&self) -> bool {
        self.config.exists() && self.model_path().exists()
    }
}

/// `voice.onnx.json` -> `voice.onnx`.
fn onnx_path(config: &Path) -> PathBuf {
    match config.extension().and_then(|e| e.to_str()) {
        Some("json") => config.with_extension(""),
        _ => config.with_extension("onnx"),
    }
}

/// Parse a voice map.
///
/// Accepted shapes, mixed freely:
///
/// ```json
/// {
///   "amy":   "models/en_US-amy-medium.onnx.json",
///   "ryan":  { "config": "models/en_US-ryan-high.onnx.json", "language": "en-us" },
///   "de_DE": { "default_voice": "thorsten",
///              "voices": { "thorsten": { "config": "models/de_DE-thorsten.onnx.json" } } }
/// }
/// ```
///
/// Returns the voices and the first `default_voice` found in a grouped entry.
pub fn parse_voice_map(json: &serde_json::Value) -> anyhow::Result<(BTreeMap<String, PiperVoiceEntry>, Option<String>)> {
    let obj = json
        .as_object()
        .ok_or_else(|| anyhow::anyhow!("voice map must be a JSON object"))?;

    let mut voices = BTreeMap::new();
    let mut grouped_default = None;

    for (key, value) in obj {
        match value {
            serde_json::Value::String(config) => {
                voices.insert(key.clone(), PiperVoiceEntry::new(config, DEFAULT_LANGUAGE));
            }
            serde_json::Value::Object(o) if o.contains_key("voices") => {
                // Grouped by language: { "default_voice": "...", "voices": {...} }
                let group = o
                    .get("voices")
                    .and_then(|x| x.as_object())
                    .ok_or_else(|| anyhow::anyhow!("missing 'voices' object for language {key}"))?;
                if let Some(default) = o.get("default_voice").and_then(|x| x.as_str()) {
                    if !group.contains_key(default) {
                        anyhow::bail!("default_voice '{default}' for language {key} is not in its voices");
                    }
                    grouped_default.get_or_insert_with(|| default.to_string());
                }
                for (voice_id, voice) in group {
                    let mut entry = voice_entry(voice_id, voice, &key.replace('_', "-").to_lowercase())?;
                    if entry.display_name.is_none() {
                        entry.display_name = Some(voice_id.clone());
                    }
                    voices.insert(voice_id.clone(), entry);
                }
            }
            serde_json::Value::Object(_) => {
                voices.insert(key.clone(), voice_entry(key, value, DEFAULT_LANGUAGE)?);
            }
            _ => anyhow::bail!("invalid entry for key {key} (expected string or object)"),
        }
    }

    Ok((voices, grouped_default))
}

fn voice_entry(voice_id: &str, value: &serde_json::Value, language: &str) -> anyhow::Result<PiperVoiceEntry> {
    if let Some(config) = value.as_str() {
        return Ok(PiperVoiceEntry::new(config, language));
    }
    let config = value
        .get("config")
        .and_then(|x| x.as_str())
        .ok_or_else(|| anyhow::anyhow!("missing 'config' for voice {voice_id}"))?;
    let language = value
        .get("language")
        .and_then(|x| x.as_str())
        .unwrap_or(language);
    Ok(PiperVoiceEntry {
        config: PathBuf::from(config),
        language: language.to_string(),
        display_name: value
            .get("display_name")
            .and_then(|x| x.as_str())
            .map(str::to_string),
    })
}

/// Read `audio.sample_rate` from a Piper voice config.
fn read_sample_rate(config: &Path) -> Result<u32> {
    if !config.exists() {
        return Err(TtsError::MissingArtifact(config.to_path_buf()));
    }
    let rate = fs::read_to_string(config)
        .with_context(|| format!("Failed to read config file: {}", config.display()))
        .and_then(|text| {
            serde_json::from_str::<serde_json::Value>(&text)
                .with_context(|| format!("{} is not valid JSON", config.display()))
        })
        .and_then(|json| {
            json.get("audio")
                .and_then(|a| a.get("sample_rate"))
                .and_then(|sr| sr.as_u64())
                .ok_or_else(|| anyhow::anyhow!("missing or invalid 'audio.sample_rate' in {}", config.display()))
        })
        .map_err(|e| TtsError::Load(format!("{e:#}")))?;
    Ok(rate as u32)
}

struct PiperVoice {
    synth: PiperSpeechSynthesizer,
    sample_rate: u32,
}

impl PiperVoice {
    fn load(entry: &PiperVoiceEntry) -> Result<Self> {
        let sample_rate = read_sample_rate(&entry.config)?;
        let model_path = entry.model_path();
        if !model_path.exists() {
            return Err(TtsError::MissingArtifact(model_path));
        }
        let model = piper_rs::from_config_path(&entry.config)
            .map_err(|e| TtsError::Load(format!("piper load error: {e}")))?;
        let synth = PiperSpeechSynthesizer::new(model)
            .map_err(|e| TtsError::Load(format!("piper synthesizer error: {e}")))?;
        Ok(Self { synth, sample_rate })
    }

    fn synthesize(&self, text: String) -> Result<Vec<f32>> {
        let parts = self
            .synth
            .synthesize_parallel(text, None)
            .map_err(|e| TtsError::Inference(format!("piper synth error: {e}")))?;

        let mut samples = Vec::new();
        for part in parts {
            samples.extend(
                part.map_err(|e| TtsError::Inference(format!("chunk error: {e}")))?
                    .into_vec(),
            );
        }
        Ok(samples)
    }
}

pub struct PiperEngine {
    voices: BTreeMap<String, PiperVoiceEntry>,
    default_voice: Option<String>,
    models: BTreeMap<String, ModelProxy<PiperVoice>>,
}

impl PiperEngine {
    /// `default_voice` falls back to the first voice id when `None`.
    pub fn new(voices: BTreeMap<String, PiperVoiceEntry>, default_voice: Option<String>) -> Result<Self> {
        let default_voice = match default_voice {
            Some(voice) if !voices.contains_key(&voice) => {
                return Err(TtsError::UnknownVoice {
                    voice,
                    available: voices.keys().cloned().collect::<Vec<_>>().join(", "),
                });
            }
            Some(voice) => Some(voice),
            None => voices.keys().next().cloned(),
        };
        let models = voices
            .keys()
            .map(|id| (id.clone(), ModelProxy::new(format!("piper/{id}"))))
            .collect();
        if voices.is_empty() {
            warn!("no Piper voices configured");
        }
        Ok(Self { voices, default_voice, models })
    }

    /// An engine with no voices. Every request fails until voices exist.
    pub fn empty() -> Self {
        warn!("no Piper voices configured");
        Self {
            voices: BTreeMap::new(),
            default_voice: None,
            models: BTreeMap::new(),
        }
    }

    /// Load voices from a map file; see [`parse_voice_map`].
    pub fn from_map_file(path: impl AsRef<Path>, default_voice: Option<String>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("Failed to load {}", path.display()))?;
        let json: serde_json::Value =
            serde_json::from_str(&text).with_context(|| format!("{} is not valid JSON", path.display()))?;
        let (voices, grouped_default) = parse_voice_map(&json)?;
        info!("loaded {} Piper voices from {}", voices.len(), path.display());
        Ok(Self::new(voices, default_voice.or(grouped_default))?)
    }

    pub fn voice_entries(&self) -> &BTreeMap<String, PiperVoiceEntry> {
        &self.voices
    }

    fn available(&self) -> String {
        self.voices.keys().cloned().collect::<Vec<_>>().join(", ")
    }

    /// Pick the voice for a request: the explicit one, else a voice for the
    /// request language, else the default.
    fn resolve_voice(&self, voice: Option<&str>, language: &str) -> Result<&str> {
        if let Some(voice) = voice {
            return self
                .voices
                .get_key_value(voice)
                .map(|(id, _)| id.as_str())
                .ok_or_else(|| TtsError::UnknownVoice {
                    voice: voice.to_string(),
                    available: self.available(),
                });
        }

        let tag = language.replace('_', "-").to_lowercase();
        let subtag = primary_subtag(language);
        let by_language = |exact: bool| {
            self.voices.iter().find(|(_, e)| {
                let lang = e.language.replace('_', "-").to_lowercase();
                if exact {
                    lang == tag
                } else {
                    primary_subtag(&lang) == subtag
                }
            })
        };
        let default_matches = self
            .default_voice
            .as_deref()
            .and_then(|id| self.voices.get(id))
            .is_some_and(|e| primary_subtag(&e.language) == subtag);

        let picked = if default_matches {
            self.default_voice.as_deref()
        } else {
            by_language(true)
                .or_else(|| by_language(false))
                .map(|(id, _)| id.as_str())
                .or(self.default_voice.as_deref())
        };
        picked.ok_or_else(|| TtsError::UnknownVoice {
            voice: "(default)".to_string(),
            available: self.available(),
        })
    }

    fn entry(&self, voice_id: &str) -> Result<&PiperVoiceEntry> {
        self.voices.get(voice_id).ok_or_else(|| TtsError::UnknownVoice {
            voice: voice_id.to_string(),
            available: self.available(),
        })
    }

    async fn load(&self, voice_id: &str) -> Result<SharedModel<PiperVoice>> {
        let entry = self.entry(voice_id)?.clone();
        let proxy = self.models.get(voice_id).ok_or_else(|| TtsError::UnknownVoice {
            voice: voice_id.to_string(),
            available: self.available(),
        })?;
        proxy.get_or_load(move || PiperVoice::load(&entry)).await
    }
}

#[async_trait]
impl TtsEngine for PiperEngine {
    fn id(&self) -> EngineId {
        EngineId::Piper
    }

    async fn synthesize(&self, request: &EngineRequest) -> Result<AudioChunk> {
        let voice_id = self
            .resolve_voice(request.voice.as_deref(), &request.language)?
            .to_string();

        let text = clean_text(&request.text);
        if text.is_empty() {
            return Ok(AudioChunk::empty(read_sample_rate(&self.entry(&voice_id)?.config)?));
        }

        let model = self.load(&voice_id).await?;
        let speed = request.speed;
        let preview: String = text.chars().take(50).collect();
        info!(voice = %voice_id, "[piper] synthesizing: {preview}...");

        tokio::task::spawn_blocking(move || {
            let voice = model.lock().map_err(|_| TtsError::poisoned("piper voice"))?;
            let start = Instant::now();
            let samples = voice.synthesize(text).map_err(|e| {
                error!("[piper] synthesis failed: {e}");
                e
            })?;
            let chunk = AudioChunk::new(apply_speed(samples, speed), voice.sample_rate);
            let elapsed = start.elapsed().as_secs_f64();
            info!(
                "[piper] synthesized {:.2}s of audio in {:.3}s (rtf {:.3})",
                chunk.duration_secs(),
                elapsed,
                elapsed / chunk.duration_secs().max(1e-6)
            );
            Ok(chunk)
        })
        .await?
    }

    async fn warm_up(&self) -> Result<()> {
        let voice_id = self.default_voice.clone().ok_or_else(|| TtsError::UnknownVoice {
            voice: "(default)".to_string(),
            available: self.available(),
        })?;
        self.load(&voice_id).await.map(|_| ())
    }

    fn health(&self) -> EngineHealth {
        let installed = self
            .voices
            .iter()
            .filter(|(_, e)| e.is_installed())
            .map(|(id, _)| id.clone())
            .collect();
        let loaded = self
            .models
            .iter()
            .filter(|(_, proxy)| proxy.state() == LoadState::Ready)
            .map(|(id, _)| id.clone())
            .collect();
        let default = self.default_voice.as_deref().and_then(|id| self.models.get(id));
        let (state, error) = match default {
            Some(proxy) => (proxy.state(), proxy.last_error()),
            None => (LoadState::Failed, Some("no Piper voices configured".to_string())),
        };

        EngineHealth {
            engine: EngineId::Piper,
            available: state == LoadState::Ready,
            state,
            installed,
            loaded,
            error,
        }
    }

    fn supports_language(&self, _language_tag: &str) -> bool {
        // Piper is the fallback for every language.
        !self.voices.is_empty()
    }

    fn voices(&self) -> Vec<String> {
        self.voices.keys().cloned().collect()
    }

    fn default_voice(&self) -> Option<String> {
        self.default_voice.clone()
    }
}
