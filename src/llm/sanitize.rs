//! Turns raw model output into something a speech engine can read aloud.
//!
//! Steps, in order: drop reasoning spans, unwrap markdown (code, emphasis,
//! headers, links), drop bare URLs, collapse repeated punctuation, expand
//! a few written abbreviations, collapse whitespace, then bound the length
//! to at most N sentences and M characters, cutting on sentence boundaries.

use std::sync::LazyLock;

use regex::Regex;

/// Length bounds for a spoken reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyLimits {
    pub max_sentences: usize,
    pub max_chars: usize,
}

impl Default for ReplyLimits {
    fn default() -> Self {
        Self {
            max_sentences: 3,
            max_chars: 300,
        }
    }
}

static REASONING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)<think>.*?</think>|<thinking>.*?</thinking>|<reasoning>.*?</reasoning>|<reflection>.*?</reflection>|<\|begin_of_thought\|>.*?<\|end_of_thought\|>",
    )
    .expect("valid regex")
});
static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```[A-Za-z0-9_+-]*").expect("valid regex"));
static INLINE_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`([^`]*)`").expect("valid regex"));
static BOLD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*(.+?)\*\*|__(.+?)__").expect("valid regex"));
static ITALIC: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*(.+?)\*").expect("valid regex"));
static HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*#{1,6}\s+").expect("valid regex"));
static LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]+)\]\([^)]+\)").expect("valid regex"));
static URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bhttps?://\S+|\bwww\.\S+").expect("valid regex"));
static DOTS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\.{2,}|…").expect("valid regex"));
static BANGS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"!{2,}").expect("valid regex"));
static QUESTIONS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\?{2,}").expect("valid regex"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

static ABBREVIATIONS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"\bw/o\b", "without"),
        (r"\bw/", "with "),
        (r"(?i)\betc\.", "etcetera"),
        (r"(?i)\be\.g\.", "for example"),
        (r"(?i)\bi\.e\.", "that is"),
    ]
    .into_iter()
    .map(|(p, r)| (Regex::new(p).expect("valid regex"), r))
    .collect()
});

/// Clean `raw` for speech and bound its length.
pub fn sanitize_for_speech(raw: &str, limits: ReplyLimits) -> String {
    let text = REASONING.replace_all(raw, " ");
    let text = CODE_FENCE.replace_all(&text, " ");
    let text = INLINE_CODE.replace_all(&text, "$1");
    let text = BOLD.replace_all(&text, "$1$2");
    let text = ITALIC.replace_all(&text, "$1");
    let text = HEADER.replace_all(&text, "");
    let text = LINK.replace_all(&text, "$1");
    let text = URL.replace_all(&text, "");
    let text = DOTS.replace_all(&text, ".");
    let text = BANGS.replace_all(&text, "!");
    let text = QUESTIONS.replace_all(&text, "?");

    let mut text = text.into_owned();
    for (pattern, replacement) in ABBREVIATIONS.iter() {
        text = pattern.replace_all(&text, *replacement).into_owned();
    }
    let text = WHITESPACE.replace_all(&text, " ");

    truncate(text.trim(), limits)
}

/// Split after `.`, `!` or `?` when followed by whitespace or the end.
fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            let at_boundary = chars.peek().map_or(true, |(_, n)| n.is_whitespace());
            if at_boundary {
                let end = i + c.len_utf8();
                let s = text[start..end].trim();
                if !s.is_empty() {
                    out.push(s);
                }
                start = end;
            }
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

fn truncate(text: &str, limits: ReplyLimits) -> String {
    let mut kept = String::new();
    for sentence in sentences(text).into_iter().take(limits.max_sentences) {
        let extra = usize::from(!kept.is_empty()) + sentence.chars().count();
        if kept.chars().count() + extra > limits.max_chars {
            break;
        }
        if !kept.is_empty() {
            kept.push(' ');
        }
        kept.push_str(sentence);
    }

    if kept.is_empty() && !text.is_empty() && limits.max_sentences > 0 {
        // A single sentence longer than the limit: cut it at a word boundary.
        kept = cut_at_word(text, limits.max_chars);
    }
    kept
}

fn cut_at_word(text: &str, max_chars: usize) -> String {
    let clipped: String = text.chars().take(max_chars).collect();
    if clipped.chars().count() == text.chars().count() {
        return clipped;
    }
    let cut = match clipped.rfind(' ') {
        Some(pos) if pos > 0 => &clipped[..pos],
        _ => clipped.as_str(),
    };
    let cut = cut.trim_end_matches([',', ';', ':', ' ']);
    if cut.is_empty() {
        String::new()
    } else {
        format!("{cut}.")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
