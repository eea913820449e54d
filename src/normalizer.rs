// 🔍 Identifier Normalizer - canonicalize, deduplicate, merge annotations
//
// Input lines look like:
//   1234567 desc-A
//   (99999999),       (framing characters around the digits)
//   12345678   # PSA 10 rookie
// Output: one candidate per digit string, in first-seen order.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

pub const MIN_DIGITS: usize = 7;
pub const MAX_DIGITS: usize = 9;

const ANNOTATION_SEPARATOR: &str = " ";

// ============================================================================
// CANDIDATE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// Canonical digit string (7-9 digits)
    pub id: String,

    /// Merged free text from every line that named this id
    pub annotation: String,
}

impl Candidate {
    /// Render as a candidate-file line
    pub fn to_line(&self) -> String {
        if self.annotation.is_empty() {
            self.id.clone()
        } else {
            format!("{}\t{}", self.id, self.annotation)
        }
    }
}

// ============================================================================
// LINE PARSING
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineParse {
    Blank,
    Comment,
    Candidate(Candidate),
    Malformed(String),
}

/// Canonicalize one raw identifier token
///
/// Non-digit framing is stripped; whatever is left must be 7-9 ASCII digits.
pub fn normalize_identifier(raw: &str) -> Option<String> {
    let core = raw.trim_matches(|c: char| !c.is_ascii_digit());

    if core.len() < MIN_DIGITS || core.len() > MAX_DIGITS {
        return None;
    }
    if !core.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    Some(core.to_string())
}

/// Split a line into identifier token + annotation
pub fn parse_line(line: &str) -> LineParse {
    let trimmed = line.trim();

    if trimmed.is_empty() {
        return LineParse::Blank;
    }
    if trimmed.starts_with('#') {
        return LineParse::Comment;
    }

    // Token ends at the first whitespace or '#'
    let split_at = trimmed
        .find(|c: char| c.is_whitespace() || c == '#')
        .unwrap_or(trimmed.len());
    let (token, rest) = trimmed.split_at(split_at);

    let annotation = rest
        .trim_start_matches(|c: char| c.is_whitespace() || c == '#')
        .trim();

    match normalize_identifier(token) {
        Some(id) => LineParse::Candidate(Candidate {
            id,
            annotation: annotation.to_string(),
        }),
        None => LineParse::Malformed(trimmed.to_string()),
    }
}

// ============================================================================
// ANNOTATION MERGE
// ============================================================================

/// Merge two annotation fragments without losing text
///
/// - fragment already present in `existing` → unchanged
/// - fragment that already contains `existing` → fragment wins (superset)
/// - otherwise → concatenated with a single space
pub fn merge_annotation(existing: &str, incoming: &str) -> String {
    let existing = existing.trim();
    let incoming = incoming.trim();

    if incoming.is_empty() || existing.contains(incoming) {
        return existing.to_string();
    }
    if existing.is_empty() || incoming.contains(existing) {
        return incoming.to_string();
    }

    format!("{}{}{}", existing, ANNOTATION_SEPARATOR, incoming)
}

// ============================================================================
// NORMALIZED SET
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct NormalizedCandidates {
    candidates: Vec<Candidate>,
    index: HashMap<String, usize>,

    /// Lines that were not blank, not comments and not a valid identifier
    pub malformed: usize,

    /// Lines that named an id seen earlier in the input
    pub duplicates: usize,
}

impl NormalizedCandidates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one candidate, merging into an earlier occurrence if there is one
    pub fn push(&mut self, candidate: Candidate) {
        match self.index.get(&candidate.id) {
            Some(&pos) => {
                let slot = &mut self.candidates[pos];
                slot.annotation = merge_annotation(&slot.annotation, &candidate.annotation);
                self.duplicates += 1;
            }
            None => {
                self.index.insert(candidate.id.clone(), self.candidates.len());
                self.candidates.push(candidate);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&Candidate> {
        self.index.get(id).map(|&pos| &self.candidates[pos])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates.iter()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Render back to candidate-file lines (same order)
    pub fn to_lines(&self) -> Vec<String> {
        self.candidates.iter().map(Candidate::to_line).collect()
    }
}

/// Normalize an ordered sequence of raw lines
///
/// Never fails: malformed lines are skipped and counted.
pub fn normalize_lines<I, S>(lines: I) -> NormalizedCandidates
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = NormalizedCandidates::new();

    for line in lines {
        match parse_line(line.as_ref()) {
            LineParse::Blank | LineParse::Comment => {}
            LineParse::Candidate(candidate) => out.push(candidate),
            LineParse::Malformed(raw) => {
                tracing::debug!(line = %raw, "skipping malformed candidate line");
                out.malformed += 1;
            }
        }
    }

    out
}

// ============================================================================
// FREE-TEXT EXTRACTION
// ============================================================================

/// Every 7-9 digit run in `text` delimited by word boundaries, first-seen order
pub fn extract_identifiers(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();

    identifier_pattern()
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\b[0-9]{7,9}\b").expect("identifier pattern is valid"))
}

// ============================================================================
// TESTS
// ============================================================================
