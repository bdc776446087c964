//! Case-insensitive substring matching against the wake phrase and a
//! configurable list of fallback tokens.
//!
//! Fallback tokens let partially recognised multi-word phrases still
//! trigger ("hey mirror" for "hello mirror").  They are broad: any
//! transcript containing one of them matches.

use crate::config::WakeConfig;

#[derive(Debug, Clone)]
pub struct WakeWordMatcher {
    phrase: String,
    fallback_tokens: Vec<String>,
}

impl WakeWordMatcher {
    pub fn new(phrase: &str, fallback_tokens: &[String]) -> Self {
        Self {
            phrase: normalise(phrase),
            fallback_tokens: fallback_tokens
                .iter()
                .map(|t| normalise(t))
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }

    pub fn from_config(config: &WakeConfig) -> Self {
        Self::new(&config.phrase, &config.fallback_tokens)
    }

    /// The configured phrase, lowercased.
    pub fn phrase(&self) -> &str {
        &self.phrase
    }

    /// `true` when `text` contains the phrase or any fallback token.
    ///
    /// Empty or whitespace-only text never matches; it is confirmed silence,
    /// not an error.
    pub fn matches(&self, text: &str) -> bool {
        let text = normalise(text);
        if text.is_empty() {
            return false;
        }
        (!self.phrase.is_empty() && text.contains(&self.phrase))
            || self.fallback_tokens.iter().any(|t| text.contains(t.as_str()))
    }
}

fn normalise(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
