use serde::{Deserialize, Serialize};

/// Backends a request can be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineId {
    /// English-optimized Piper ONNX voices.
    Piper,
    /// Per-language MMS VITS models.
    Mms,
}

impl EngineId {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineId::Piper => "piper",
            EngineId::Mms => "mms",
        }
    }
}

impl std::fmt::Display for EngineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Primary subtags routed to the multilingual engine when it is enabled.
pub const MULTILINGUAL_LANGUAGES: &[&str] = &["ms", "id", "zh", "ja", "ko", "es", "fr", "de", "it"];

/// Primary subtag of a language tag: `en-us` -> `en`, `pt_BR` -> `pt`.
pub fn primary_subtag(language_tag: &str) -> String {
    language_tag
        .trim()
        .split(['-', '_'])
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// Pick the engine for a language tag. Never fails: anything the
/// multilingual engine cannot take goes to Piper.
pub fn select_engine(language_tag: &str, multilingual_available: bool) -> EngineId {
    let primary = primary_subtag(language_tag);
    if primary == "en" {
        return EngineId::Piper;
    }
    if multilingual_available && MULTILINGUAL_LANGUAGES.contains(&primary.as_str()) {
        EngineId::Mms
    } else {
        EngineId::Piper
    }
}
