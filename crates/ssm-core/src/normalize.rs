//! Title normalization: the comparison-key pipeline (spec Section 4.1).
//!
//! `ComparisonKey` is deterministic and side-effect free; callers that want
//! the process-wide cache use [`TitleNormalizer`], which memoizes keys by
//! raw input for the lifetime of the process (spec requirement).

use dashmap::DashMap;
use unicode_normalization::UnicodeNormalization;

const LEADING_ARTICLES: [&str; 3] = ["the", "a", "an"];

/// A scene tag: a configured trailing suffix that must be stripped before
/// comparison. Text/mixed tags match ignoring punctuation and casing
/// differences; pure-punctuation tags match by exact punctuation-sequence
/// equality.
#[derive(Debug, Clone)]
pub struct SceneTag {
    raw: String,
    kind: SceneTagKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SceneTagKind {
    /// Tag has no alphanumeric content: every character is punctuation.
    PunctuationOnly(String),
    /// Tag has at least one alphanumeric token; compared as a normalized
    /// token sequence (casing/punctuation-insensitive).
    Tokens(Vec<String>),
}

impl SceneTag {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let tokens = word_tokens(&raw);
        let kind = if tokens.is_empty() {
            SceneTagKind::PunctuationOnly(punctuation_sequence(&raw))
        } else {
            SceneTagKind::Tokens(tokens)
        };
        Self { raw, kind }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }
}

/// Extract the lowercase alphanumeric "word tokens" from `s`, discarding
/// all punctuation and whitespace.
fn word_tokens(s: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in s.chars() {
        if ch.is_alphanumeric() {
            current.push(ch.to_ascii_lowercase());
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Extract the sequence of non-alphanumeric, non-whitespace characters
/// from `s`, in order, for exact punctuation-sequence comparison.
fn punctuation_sequence(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_alphanumeric() && !c.is_whitespace())
        .collect()
}

/// Strip one trailing scene-tag phrase of the form
/// `… ( TAG )`, `… [ TAG ]`, `… - TAG`, or `… : TAG` from `title`, if any
/// configured tag matches. Returns the stripped title, or `None` if no
/// suffix matched.
fn strip_one_scene_tag(title: &str, tags: &[SceneTag]) -> Option<String> {
    let trimmed = title.trim_end();

    // Bracketed forms: "... ( TAG )" / "... [ TAG ]"
    for (open, close) in [('(', ')'), ('[', ']')] {
        if trimmed.ends_with(close) {
            if let Some(open_idx) = trimmed.rfind(open) {
                let inner = &trimmed[open_idx + open.len_utf8()..trimmed.len() - close.len_utf8()];
                let prefix = trimmed[..open_idx].trim_end();
                if !prefix.is_empty() && tag_matches(inner, tags) {
                    return Some(prefix.to_string());
                }
            }
        }
    }

    // Separator forms: "... - TAG" / "... : TAG"
    for sep in ['-', ':'] {
        if let Some(sep_idx) = trimmed.rfind(sep) {
            let inner = trimmed[sep_idx + sep.len_utf8()..].trim();
            let prefix = trimmed[..sep_idx].trim_end();
            if !prefix.is_empty() && !inner.is_empty() && tag_matches(inner, tags) {
                return Some(prefix.to_string());
            }
        }
    }

    None
}

fn tag_matches(candidate: &str, tags: &[SceneTag]) -> bool {
    let candidate_tokens = word_tokens(candidate);
    let candidate_punct = punctuation_sequence(candidate);
    tags.iter().any(|tag| match &tag.kind {
        SceneTagKind::PunctuationOnly(seq) => candidate_tokens.is_empty() && *seq == candidate_punct,
        SceneTagKind::Tokens(tokens) => !candidate_tokens.is_empty() && candidate_tokens == *tokens,
    })
}

/// Repeatedly strip trailing scene-tag phrases until none match.
///
/// Used for both the comparison key (followed by ASCII folding) and for
/// computing the display title (which preserves everything else).
pub fn strip_scene_tag_suffixes(title: &str, tags: &[SceneTag]) -> String {
    let mut current = title.to_string();
    while let Some(stripped) = strip_one_scene_tag(&current, tags) {
        current = stripped;
    }
    current
}

/// Fold a string to its closest ASCII equivalent, dropping combining
/// marks. Characters with no ASCII decomposition are left as-is; they are
/// removed later by the non-alphanumeric strip in the comparison-key
/// pipeline.
fn ascii_fold(s: &str) -> String {
    s.nfd()
        .filter(|c| !is_combining_mark(*c))
        .map(|c| if c.is_ascii() { c } else { ' ' })
        .collect()
}

/// Unicode general category `Mn` (nonspacing mark) approximation: combining
/// diacritics occupy a few well-known ranges plus a dedicated Unicode
/// property; checking the common Latin/Greek/Cyrillic combining blocks
/// covers the overwhelming majority of real-world titles.
fn is_combining_mark(c: char) -> bool {
    matches!(c,
        '\u{0300}'..='\u{036F}' // Combining Diacritical Marks
        | '\u{1AB0}'..='\u{1AFF}'
        | '\u{1DC0}'..='\u{1DFF}'
        | '\u{20D0}'..='\u{20FF}'
        | '\u{FE20}'..='\u{FE2F}'
    )
}

/// Strip a single leading article (`the`, `a`, `an`) if it is the first
/// whole whitespace-delimited token.
fn strip_leading_article(s: &str) -> String {
    let mut parts = s.splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("");
    let rest = parts.next();
    let first_clean: String = first.chars().filter(|c| c.is_alphanumeric()).collect();
    if LEADING_ARTICLES.contains(&first_clean.to_lowercase().as_str()) {
        rest.unwrap_or("").trim_start().to_string()
    } else {
        s.to_string()
    }
}

/// Strip a single trailing `s` from each whitespace-delimited word.
fn strip_trailing_s_per_word(s: &str) -> String {
    s.split_whitespace()
        .map(|word| word.strip_suffix(['s', 'S']).unwrap_or(word))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Keep only ASCII `[0-9a-z]`, after lowercasing.
fn keep_ascii_alphanumeric_lowercase(s: &str) -> String {
    s.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_digit() || c.is_ascii_lowercase())
        .collect()
}

/// Compute the comparison key for `raw`, per spec Section 4.1's six-step
/// pipeline. Pure and deterministic; does not consult or update any cache.
pub fn comparison_key(raw: &str, scene_tags: &[SceneTag]) -> String {
    let stripped = strip_scene_tag_suffixes(raw, scene_tags);
    let folded = ascii_fold(&stripped);
    let no_article = strip_leading_article(&folded);
    let no_trailing_s = strip_trailing_s_per_word(&no_article);
    keep_ascii_alphanumeric_lowercase(&no_trailing_s)
}

/// The display title: original punctuation preserved, only the stripped
/// trailing scene-tag suffix removed.
pub fn display_title(raw: &str, scene_tags: &[SceneTag]) -> String {
    strip_scene_tag_suffixes(raw, scene_tags)
}

/// Caches comparison keys by raw input for the lifetime of the process
/// (spec requirement: "cache the final key keyed by the raw input").
#[derive(Debug, Default)]
pub struct TitleNormalizer {
    cache: DashMap<String, String>,
}

impl TitleNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute (or fetch from cache) the comparison key for `raw`.
    pub fn comparison_key(&self, raw: &str, scene_tags: &[SceneTag]) -> String {
        if let Some(cached) = self.cache.get(raw) {
            return cached.clone();
        }
        let key = comparison_key(raw, scene_tags);
        self.cache.insert(raw.to_string(), key.clone());
        key
    }

    /// Number of entries currently cached (used in tests/diagnostics).
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}
