//! Answer text cleaning and anomaly detection
//!
//! Generated answers sometimes repeat a section header (a second
//! `CITATIONS:` block after the first). Only the first occurrence of each
//! section header is kept. [`TextAccumulator`] applies the cleaning while
//! text is still streaming and only releases text that can no longer change,
//! so the concatenation of everything it released equals
//! [`clean_text`] of the full input.

use std::collections::HashSet;

/// Section headers that may appear only once per answer
const SECTION_HEADERS: &[&str] = &["citations", "sources", "references"];

/// Length of the answer opening used to spot restarting generation
const OPENING_LEN: usize = 60;

/// Minimum opening length worth comparing
const MIN_OPENING_LEN: usize = 40;

fn normalize_header(line: &str) -> String {
    line.trim()
        .trim_matches(|c: char| matches!(c, '#' | '*' | '_' | ':' | '=' | '-') || c.is_whitespace())
        .to_lowercase()
}

/// The section header `line` represents, if any
fn section_header(line: &str) -> Option<&'static str> {
    let normalized = normalize_header(line);
    SECTION_HEADERS
        .iter()
        .copied()
        .find(|header| *header == normalized)
}

/// Whether an unfinished line could still turn into a section header
fn could_become_header(partial: &str) -> bool {
    let normalized = normalize_header(partial);
    SECTION_HEADERS
        .iter()
        .any(|header| header.starts_with(normalized.as_str()))
}

/// Remove repeated section headers, keeping the first of each kind
pub fn clean_text(raw: &str) -> String {
    let mut seen = HashSet::new();
    let mut out = String::with_capacity(raw.len());
    for line in raw.split_inclusive('\n') {
        if let Some(header) = section_header(line) {
            if !seen.insert(header) {
                tracing::debug!(header, "Dropping repeated section header");
                continue;
            }
        }
        out.push_str(line);
    }
    out
}

/// Accumulates raw answer text and releases cleaned text incrementally
#[derive(Debug, Default)]
pub struct TextAccumulator {
    raw: String,
    emitted: String,
}

impl TextAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw chunk and return the newly releasable cleaned text
    ///
    /// A trailing partial line that could still become a section header is
    /// held back until its line completes or [`finish`](Self::finish) is
    /// called.
    pub fn push(&mut self, chunk: &str) -> String {
        self.raw.push_str(chunk);
        let stable = self.stable_cleaned();
        self.release(stable)
    }

    /// Release everything still held back
    pub fn finish(&mut self) -> String {
        let full = self.cleaned();
        self.release(full)
    }

    /// Cleaned form of everything accumulated so far
    pub fn cleaned(&self) -> String {
        clean_text(&self.raw)
    }

    /// Cleaned text released so far
    pub fn emitted(&self) -> &str {
        &self.emitted
    }

    /// Raw text received so far
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    fn stable_cleaned(&self) -> String {
        let split = self.raw.rfind('\n').map(|i| i + 1).unwrap_or(0);
        let (complete, tail) = self.raw.split_at(split);
        let mut cleaned = clean_text(complete);
        if !tail.is_empty() && !could_become_header(tail) {
            cleaned.push_str(tail);
        }
        cleaned
    }

    fn release(&mut self, cleaned: String) -> String {
        debug_assert!(cleaned.starts_with(self.emitted.as_str()));
        let delta = cleaned
            .get(self.emitted.len()..)
            .unwrap_or_default()
            .to_string();
        self.emitted.push_str(&delta);
        delta
    }
}

/// Signatures of a damaged generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseAnomaly {
    /// The opening of the answer appears again at `offset`
    Restarted { offset: usize },
    /// The answer stops mid-sentence or inside a code block
    Truncated,
}

/// Detect restarting generation in an accumulated answer
pub fn detect_restart(text: &str) -> Option<ResponseAnomaly> {
    let trimmed = text.trim_start();
    let opening_end = trimmed
        .char_indices()
        .nth(OPENING_LEN)
        .map(|(i, _)| i)
        .unwrap_or(trimmed.len());
    let opening = trimmed[..opening_end].trim_end();
    if opening.len() < MIN_OPENING_LEN {
        return None;
    }
    let lead = text.len() - trimmed.len();
    trimmed[opening_end..]
        .find(opening)
        .map(|pos| ResponseAnomaly::Restarted {
            offset: lead + opening_end + pos,
        })
}

/// Detect an answer that ends abruptly
pub fn detect_truncation(text: &str) -> Option<ResponseAnomaly> {
    let trimmed = text.trim_end();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.matches("```").count() % 2 == 1 {
        return Some(ResponseAnomaly::Truncated);
    }
    if trimmed.chars().count() < 80 {
        return None;
    }
    let last = trimmed.chars().last()?;
    let closed = last.is_ascii_digit()
        || matches!(
            last,
            '.' | '!' | '?' | ')' | ']' | '"' | '\'' | '*' | ':' | '`' | '”' | '’' | '|'
        );
    (!closed).then_some(ResponseAnomaly::Truncated)
}

/// Run every anomaly check on a finished answer
pub fn detect_anomalies(text: &str) -> Vec<ResponseAnomaly> {
    detect_restart(text)
        .into_iter()
        .chain(detect_truncation(text))
        .collect()
}
