use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the engines and the synthesis service.
#[derive(Debug, Error)]
pub enum TtsError {
    /// A model file, voice config or vocabulary is not on disk.
    #[error("model artifact not found: {}", .0.display())]
    MissingArtifact(PathBuf),

    #[error("unsupported language '{language}' (supported: {supported})")]
    UnsupportedLanguage { language: String, supported: String },

    #[error("unknown voice '{voice}' (available: {available})")]
    UnknownVoice { voice: String, available: String },

    #[error("model load failed: {0}")]
    Load(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("audio encoding failed: {0}")]
    Audio(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TtsError {
    pub(crate) fn poisoned(what: &str) -> Self {
        TtsError::Internal(format!(
            "{what} lock poisoned - a previous inference panicked"
        ))
    }
}

impl From<hound::Error> for TtsError {
    fn from(e: hound::Error) -> Self {
        TtsError::Audio(e.to_string())
    }
}

impl From<std::io::Error> for TtsError {
    fn from(e: std::io::Error) -> Self {
        TtsError::Audio(e.to_string())
    }
}

impl From<tokio::task::JoinError> for TtsError {
    fn from(e: tokio::task::JoinError) -> Self {
        TtsError::Internal(format!("blocking task failed: {e}"))
    }
}

pub type Result<T, E = TtsError> = std::result::Result<T, E>;
