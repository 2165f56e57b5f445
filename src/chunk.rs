//! Sliding-window text chunker with heading breadcrumbs.
//!
//! Splits normalized text into overlapping passages (default window 1000
//! characters, overlap 200). A pre-pass records heading-like lines and
//! their offsets; each passage carries the three most recent headings
//! that precede its start, so retrieval results keep their
//! nearest-ancestor context without unbounded metadata.
//!
//! Window arithmetic is in characters; slicing always lands on UTF-8
//! boundaries. Whitespace-only windows are dropped and ordinals stay
//! contiguous from 0. Empty input yields no passages.

pub const DEFAULT_WINDOW_CHARS: usize = 1000;
pub const DEFAULT_OVERLAP_CHARS: usize = 200;

/// Passages never carry more than this many headings; older ones drop
/// first so the nearest context survives.
const MAX_HEADINGS_PER_CHUNK: usize = 3;
const MAX_HEADING_CHARS: usize = 120;

/// Approximate chars-per-token ratio used for the stored estimate.
const CHARS_PER_TOKEN: usize = 4;

/// One window of a document's text, ready for embedding and storage.
#[derive(Debug, Clone, PartialEq)]
pub struct Passage {
    pub ordinal: i64,
    pub text: String,
    /// Character offset of the window start within the source text.
    pub start_char: usize,
    /// Heading breadcrumb, oldest first, at most three entries.
    pub headings: Vec<String>,
    pub token_estimate: i64,
}

/// Split normalized text into overlapping passages.
pub fn split_passages(text: &str, window: usize, overlap: usize) -> Vec<Passage> {
    if text.is_empty() || window == 0 {
        return Vec::new();
    }

    let headings = scan_headings(text);
    let chars: Vec<char> = text.chars().collect();
    // Forward progress even when overlap >= window.
    let step = window.saturating_sub(overlap).max(1);

    let mut passages = Vec::new();
    let mut ordinal: i64 = 0;
    let mut start = 0usize;

    while start < chars.len() {
        let end = (start + window).min(chars.len());
        let piece: String = chars[start..end].iter().collect();

        if !piece.trim().is_empty() {
            let breadcrumb = headings_before(&headings, start);
            let token_estimate = ((end - start) / CHARS_PER_TOKEN).max(1) as i64;
            passages.push(Passage {
                ordinal,
                text: piece,
                start_char: start,
                headings: breadcrumb,
                token_estimate,
            });
            ordinal += 1;
        }

        if end == chars.len() {
            break;
        }
        start += step;
    }

    passages
}

/// Heading-like lines and their character offsets, in document order.
fn scan_headings(text: &str) -> Vec<(usize, String)> {
    let mut headings = Vec::new();
    let mut offset = 0usize;
    for line in text.split('\n') {
        let line_chars = line.chars().count();
        if is_heading_like(line) {
            headings.push((offset, line.trim().to_string()));
        }
        offset += line_chars + 1; // '\n'
    }
    headings
}

/// A line reads as a heading when it starts with a markup heading marker,
/// is fully upper-case with at least one letter, ends with a colon, or
/// starts with a numbered-list prefix — and stays short.
fn is_heading_like(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.chars().count() > MAX_HEADING_CHARS {
        return false;
    }

    if trimmed.starts_with('#') {
        return true;
    }
    if trimmed.ends_with(':') {
        return true;
    }
    if has_numbered_prefix(trimmed) {
        return true;
    }

    let has_letter = trimmed.chars().any(|c| c.is_alphabetic());
    let has_lowercase = trimmed.chars().any(|c| c.is_lowercase());
    has_letter && !has_lowercase
}

/// `1. Intro`, `2.1 Overview`, `3) Setup` — digit groups followed by a
/// separator. A bare number starting a sentence (`1999 was…`) is not a
/// list prefix.
fn has_numbered_prefix(line: &str) -> bool {
    let bytes = line.as_bytes();
    let mut i = 0;
    let mut saw_digit = false;
    let mut saw_dot = false;
    while i < bytes.len() {
        match bytes[i] {
            b'0'..=b'9' => {
                saw_digit = true;
                i += 1;
            }
            b'.' if saw_digit && i + 1 < bytes.len() && bytes[i + 1].is_ascii_digit() => {
                saw_dot = true;
                i += 1;
            }
            _ => break,
        }
    }
    if !saw_digit || i == 0 || i >= bytes.len() {
        return false;
    }
    match bytes[i] {
        b'.' | b')' => bytes.get(i + 1) == Some(&b' '),
        b' ' => saw_dot,
        _ => false,
    }
}

/// The `MAX_HEADINGS_PER_CHUNK` most recent headings whose offset is at
/// or before `start`, oldest first.
fn headings_before(headings: &[(usize, String)], start: usize) -> Vec<String> {
    let applicable: Vec<&String> = headings
        .iter()
        .filter(|(offset, _)| *offset <= start)
        .map(|(_, text)| text)
        .collect();
    applicable
        .iter()
        .rev()
        .take(MAX_HEADINGS_PER_CHUNK)
        .rev()
        .map(|s| (*s).clone())
        .collect()
}
