use crate::error::ApiError;

/// Maximum text length for TTS requests, in characters
pub const MAX_TEXT_LENGTH: usize = 5000;
pub const MIN_SPEED: f32 = 0.25;
pub const MAX_SPEED: f32 = 4.0;

/// Validate TTS request
pub fn validate_tts_request(text: &str, language: Option<&str>, speed: Option<f32>) -> Result<(), ApiError> {
    if text.trim().is_empty() {
        return Err(ApiError::InvalidInput("Text cannot be empty".to_string()));
    }
    if text.chars().count() > MAX_TEXT_LENGTH {
        return Err(ApiError::InvalidInput(format!(
            "Text too long (max {} characters)",
            MAX_TEXT_LENGTH
        )));
    }

    if let Some(lang) = language {
        if !is_valid_language_tag(lang) {
            return Err(ApiError::InvalidInput(format!(
                "Invalid language code format: {}. Expected a tag like en, en-us or zh_CN",
                lang
            )));
        }
    }

    if let Some(speed) = speed {
        if !speed.is_finite() || !(MIN_SPEED..=MAX_SPEED).contains(&speed) {
            return Err(ApiError::InvalidInput(format!(
                "Speed must be between {} and {}",
                MIN_SPEED, MAX_SPEED
            )));
        }
    }

    Ok(())
}

/// Language tag: a 2-3 letter primary subtag, then optional alphanumeric
/// subtags of 2-8 characters joined by `-` or `_` (en, en-us, zh_CN, sr-Latn).
fn is_valid_language_tag(tag: &str) -> bool {
    let mut parts = tag.split(['-', '_']);
    let primary_ok = parts
        .next()
        .is_some_and(|p| (2..=3).contains(&p.len()) && p.chars().all(|c| c.is_ascii_alphabetic()));
    primary_ok && parts.all(|p| (2..=8).contains(&p.len()) && p.chars().all(|c| c.is_ascii_alphanumeric()))
}
