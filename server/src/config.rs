// Server and synthesis settings read from the environment

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;
use tts_core::segment::DEFAULT_MAX_CHUNK_CHARS;
use tts_core::service::DEFAULT_STREAM_SAMPLE_RATE;
use tts_core::{ExecutionBackend, TtsSettings};

pub const DEFAULT_PORT: u16 = 8879;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub rate_limit_per_minute: u32,
    pub request_timeout_secs: u64,
    pub cors_allowed_origins: Option<Vec<String>>,
    pub model_dir: PathBuf,
    pub piper_voice_map: PathBuf,
    pub piper_default_voice: Option<String>,
    pub mms_enabled: bool,
    pub onnx_provider: ExecutionBackend,
    pub output_dir: PathBuf,
    pub static_dir: PathBuf,
    pub stream_sample_rate: u32,
    pub stream_wav_header: bool,
    pub chunk_max_chars: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            rate_limit_per_minute: 60,
            request_timeout_secs: 60,
            cors_allowed_origins: None,
            model_dir: PathBuf::from("models"),
            piper_voice_map: PathBuf::from("models/map.json"),
            piper_default_voice: None,
            mms_enabled: true,
            onnx_provider: ExecutionBackend::Auto,
            output_dir: PathBuf::from("output"),
            static_dir: PathBuf::from("static"),
            stream_sample_rate: DEFAULT_STREAM_SAMPLE_RATE,
            stream_wav_header: true,
            chunk_max_chars: DEFAULT_MAX_CHUNK_CHARS,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or unparsable values keep their
    /// defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| -> Option<String> {
            lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
        };
        fn number<T: FromStr>(key: &str, raw: Option<String>, default: T) -> T {
            match raw {
                Some(v) => v.parse().unwrap_or_else(|_| {
                    warn!("{key}={v} is not a valid number, using default");
                    default
                }),
                None => default,
            }
        }

        let onnx_provider = match parsed("ONNX_PROVIDER") {
            Some(v) => v.parse().unwrap_or_else(|e| {
                warn!("{e}; using auto");
                ExecutionBackend::Auto
            }),
            None => defaults.onnx_provider,
        };

        let model_dir = parsed("MODEL_DIR").map(PathBuf::from).unwrap_or(defaults.model_dir);
        let piper_voice_map = parsed("PIPER_VOICE_MAP")
            .map(PathBuf::from)
            .unwrap_or_else(|| model_dir.join("map.json"));

        let cors_allowed_origins = parsed("CORS_ALLOWED_ORIGINS").map(|origins| {
            origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        });

        Self {
            port: number("PORT", parsed("PORT"), defaults.port),
            rate_limit_per_minute: number("RATE_LIMIT_PER_MINUTE", parsed("RATE_LIMIT_PER_MINUTE"), defaults.rate_limit_per_minute),
            request_timeout_secs: number("REQUEST_TIMEOUT_SECS", parsed("REQUEST_TIMEOUT_SECS"), defaults.request_timeout_secs),
            cors_allowed_origins,
            model_dir,
            piper_voice_map,
            piper_default_voice: parsed("PIPER_DEFAULT_VOICE"),
            mms_enabled: parsed("MMS_ENABLED")
                .and_then(|v| parse_bool(&v))
                .unwrap_or(defaults.mms_enabled),
            onnx_provider,
            output_dir: parsed("OUTPUT_DIR").map(PathBuf::from).unwrap_or(defaults.output_dir),
            static_dir: parsed("STATIC_DIR").map(PathBuf::from).unwrap_or(defaults.static_dir),
            stream_sample_rate: number("STREAM_SAMPLE_RATE", parsed("STREAM_SAMPLE_RATE"), defaults.stream_sample_rate),
            stream_wav_header: parsed("STREAM_WAV_HEADER")
                .and_then(|v| parse_bool(&v))
                .unwrap_or(defaults.stream_wav_header),
            chunk_max_chars: number("CHUNK_MAX_CHARS", parsed("CHUNK_MAX_CHARS"), defaults.chunk_max_chars),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn tts_settings(&self) -> TtsSettings {
        TtsSettings {
            output_dir: self.output_dir.clone(),
            stream_sample_rate: self.stream_sample_rate.max(1),
            stream_wav_header: self.stream_wav_header,
            chunk_max_chars: self.chunk_max_chars.max(1),
        }
    }
}
