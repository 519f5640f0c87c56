//! Text segmentation for streaming synthesis.
//!
//! Splitting the input into short prosodic chunks lets the first chunk be
//! synthesized and delivered while the rest of the text is still queued,
//! which is what keeps time-to-first-audio low. Chunks are cut after
//! sentence terminators first; any sentence still longer than the
//! threshold is cut again after clause separators. The chunks always
//! concatenate back to the whitespace-normalized input.

/// Default length (in characters) above which a sentence is split at clauses.
pub const DEFAULT_MAX_CHUNK_CHARS: usize = 120;

const SENTENCE_TERMINATORS: &[char] = &['.', '!', '?', '…', '。', '！', '？'];
const CLAUSE_SEPARATORS: &[char] = &[',', ';', ':', '，', '；', '：', '、'];
// Closing marks that belong to the chunk they follow: `He said "no."`
const TRAILING_CLOSERS: &[char] = &['"', '\'', ')', ']', '”', '’', '」', '』', '）'];

// Words whose trailing period does not end a sentence.
const ABBREVIATIONS: &[&str] = &["mr", "mrs", "ms", "dr", "prof", "st", "vs", "etc", "inc", "ltd", "corp"];

/// Collapse every whitespace run to a single space and trim both ends.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split `text` into streaming chunks.
///
/// Returns an empty vector when the text is blank. Text without any
/// punctuation comes back as a single chunk.
pub fn split_for_streaming(text: &str, max_chars: usize) -> Vec<String> {
    let normalized = normalize_whitespace(text);
    if normalized.is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    for sentence in split_after(&normalized, SENTENCE_TERMINATORS) {
        if sentence.chars().count() > max_chars {
            chunks.extend(split_after(&sentence, CLAUSE_SEPARATORS));
        } else {
            chunks.push(sentence);
        }
    }
    chunks
}

/// Cut `text` after every run of `marks`, keeping the marks, any closing
/// quote or bracket and one following space in the preceding fragment.
fn split_after(text: &str, marks: &[char]) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut fragments = Vec::new();
    let mut current = String::new();

    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        current.push(ch);

        if marks.contains(&ch) && is_boundary(&chars, i) {
            // Absorb "?!", "...", closing quotes and the separating space.
            while i + 1 < chars.len()
                && (marks.contains(&chars[i + 1]) || TRAILING_CLOSERS.contains(&chars[i + 1]))
            {
                i += 1;
                current.push(chars[i]);
            }
            if i + 1 < chars.len() && chars[i + 1] == ' ' {
                i += 1;
                current.push(' ');
            }
            fragments.push(std::mem::take(&mut current));
        }

        i += 1;
    }

    if !current.is_empty() {
        fragments.push(current);
    }
    fragments
}

fn is_boundary(chars: &[char], i: usize) -> bool {
    let ch = chars[i];
    let prev = i.checked_sub(1).map(|p| chars[p]);
    let next = chars.get(i + 1).copied();

    // 3.14 and 1,000 are numbers, not boundaries.
    if matches!(ch, '.' | ',')
        && prev.is_some_and(|c| c.is_ascii_digit())
        && next.is_some_and(|c| c.is_ascii_digit())
    {
        return false;
    }

    if ch == '.' && next.is_some() {
        let start = chars[..i]
            .iter()
            .rposition(|c| *c == ' ')
            .map(|p| p + 1)
            .unwrap_or(0);
        let word: String = chars[start..i].iter().collect::<String>().to_lowercase();
        if ABBREVIATIONS.contains(&word.as_str()) {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(text: &str, max_chars: usize) -> Vec<String> {
        let chunks = split_for_streaming(text, max_chars);
        assert_eq!(chunks.concat(), normalize_whitespace(text), "chunks: {chunks:?}");
        assert!(chunks.iter().all(|c| !c.trim().is_empty()));
        chunks
    }

    #[test]
    fn splits_two_short_sentences() {
        let chunks = roundtrip("Hello. World.", DEFAULT_MAX_CHUNK_CHARS);
        assert_eq!(chunks, vec!["Hello. ", "World."]);
    }

    #[test]
    fn text_without_punctuation_is_one_chunk() {
        let chunks = roundtrip("just some words without an ending", DEFAULT_MAX_CHUNK_CHARS);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn blank_text_yields_nothing() {
        assert!(split_for_streaming("   \n\t ", DEFAULT_MAX_CHUNK_CHARS).is_empty());
    }

    #[test]
    fn collapses_whitespace() {
        let chunks = roundtrip("  Hello,\n\n   there!   How   are you?  ", 5);
        assert_eq!(chunks, vec!["Hello, ", "there! ", "How are you?"]);
    }

    #[test]
    fn cjk_terminators_split() {
        let chunks = roundtrip("你好。今天天气很好！我们走吧？", DEFAULT_MAX_CHUNK_CHARS);
        assert_eq!(chunks, vec!["你好。", "今天天气很好！", "我们走吧？"]);
    }

    #[test]
    fn long_sentence_splits_at_clauses() {
        let text = "First clause here, second clause follows; third clause ends it.";
        let chunks = roundtrip(text, 20);
        assert_eq!(
            chunks,
            vec!["First clause here, ", "second clause follows; ", "third clause ends it."]
        );
    }

    #[test]
    fn short_sentence_keeps_its_commas() {
        let chunks = roundtrip("Yes, no, maybe.", DEFAULT_MAX_CHUNK_CHARS);
        assert_eq!(chunks, vec!["Yes, no, maybe."]);
    }

    #[test]
    fn numbers_do_not_split() {
        let chunks = roundtrip("Pi is 3.14 and a grand is 1,000 dollars. Done.", 10);
        assert_eq!(chunks[0], "Pi is 3.14 and a grand is 1,000 dollars. ");
    }

    #[test]
    fn abbreviations_do_not_split() {
        let chunks = roundtrip("Dr. Smith arrived. He sat down.", DEFAULT_MAX_CHUNK_CHARS);
        assert_eq!(chunks, vec!["Dr. Smith arrived. ", "He sat down."]);
    }

    #[test]
    fn repeated_terminators_and_quotes_stay_together() {
        let chunks = roundtrip("Wait... what?! She said \"no.\" Fine.", DEFAULT_MAX_CHUNK_CHARS);
        assert_eq!(chunks, vec!["Wait... ", "what?! ", "She said \"no.\" ", "Fine."]);
    }

    #[test]
    fn concatenation_property_over_mixed_inputs() {
        let samples = [
            "A.B.C.",
            "...",
            "end with comma,",
            "Mixed 中文。English, too! 한국어?",
            "trailing space after terminal. ",
            "a, b, c, d, e, f, g, h, i, j, k, l, m, n, o, p",
        ];
        for text in samples {
            for max in [1, 5, DEFAULT_MAX_CHUNK_CHARS] {
                roundtrip(text, max);
            }
        }
    }
}
