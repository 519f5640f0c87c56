//! The uniform interface every backend implements.

use std::path::Path;

use async_trait::async_trait;
use serde::Serialize;

use crate::audio::AudioChunk;
use crate::error::{Result, TtsError};
use crate::model::LoadState;
use crate::router::EngineId;
use crate::wav;

/// One synthesis call as seen by an engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineRequest {
    pub text: String,
    /// Engine default voice when `None`.
    pub voice: Option<String>,
    pub language: String,
    pub speed: f32,
}

/// Cheap availability snapshot of one engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub engine: EngineId,
    pub available: bool,
    pub state: LoadState,
    /// Voices (Piper) or languages (MMS) whose artifacts are on disk.
    pub installed: Vec<String>,
    /// Voices or languages currently loaded in memory.
    pub loaded: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[async_trait]
pub trait TtsEngine: Send + Sync {
    fn id(&self) -> EngineId;

    /// Synthesize `request.text`, returning samples at the engine's native
    /// rate. Text that normalizes to nothing yields an empty chunk.
    async fn synthesize(&self, request: &EngineRequest) -> Result<AudioChunk>;

    /// Synthesize and, when `output` is given, also write a WAV file there.
    async fn synthesize_to(&self, request: &EngineRequest, output: Option<&Path>) -> Result<AudioChunk> {
        let chunk = self.synthesize(request).await?;
        match output {
            Some(path) => {
                let path = path.to_path_buf();
                tokio::task::spawn_blocking(move || {
                    wav::write_wav_file(&path, &chunk.samples, chunk.sample_rate)?;
                    tracing::info!("saved audio to {}", path.display());
                    Ok::<_, TtsError>(chunk)
                })
                .await?
            }
            None => Ok(chunk),
        }
    }

    /// Force the default model to load.
    async fn warm_up(&self) -> Result<()>;

    /// Availability without loading anything.
    fn health(&self) -> EngineHealth;

    /// Whether a request in `language_tag` can be served right now, judged
    /// from what is on disk.
    fn supports_language(&self, language_tag: &str) -> bool;

    fn voices(&self) -> Vec<String>;

    fn default_voice(&self) -> Option<String>;
}

/// Normalization shared by the engines: drops control characters, swaps
/// typography the phonemizers stumble on for plain equivalents and
/// collapses whitespace.
pub fn clean_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{00AB}' | '\u{00BB}' => out.push('"'),
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '`' => out.push('\''),
            '\u{2014}' | '\u{2013}' => out.push_str(", "),
            '\u{2026}' => out.push_str("..."),
            '&' => out.push_str(" and "),
            '*' | '#' | '_' | '~' | '|' => out.push(' '),
            c if c.is_whitespace() => out.push(' '),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    crate::segment::normalize_whitespace(&out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_text_strips_controls_and_collapses() {
        assert_eq!(clean_text("  Hello\u{0007}\n\tworld  "), "Hello world");
    }

    #[test]
    fn clean_text_substitutes_typography() {
        assert_eq!(
            clean_text("\u{201C}Rock & roll\u{201D} \u{2014} it\u{2019}s fine\u{2026}"),
            "\"Rock and roll\" , it's fine..."
        );
    }

    #[test]
    fn clean_text_drops_markdown_noise() {
        assert_eq!(clean_text("**bold** and __under__"), "bold and under");
    }

    #[test]
    fn clean_text_of_controls_only_is_empty() {
        assert!(clean_text("\u{0000}\u{0001}  \u{001B}").is_empty());
    }
}
