//! Regex post-filters that drop unwanted chunks.

use std::collections::HashMap;

use regex::Regex;

use crate::error::{ChunkerError, Result};

const WILDCARD: &str = "*";

/// Compiled chunk filters, one combined pattern per language.
///
/// A language with no patterns of its own uses the `"*"` patterns.
#[derive(Debug, Clone, Default)]
pub struct ChunkFilter {
    by_lang: HashMap<String, Regex>,
    wildcard: Option<Regex>,
}

impl ChunkFilter {
    /// # Errors
    ///
    /// Returns an error if any pattern fails to compile.
    pub fn new(filters: &HashMap<String, Vec<String>>) -> Result<Self> {
        let mut by_lang = HashMap::new();
        let mut wildcard = None;
        for (language, patterns) in filters {
            let Some(regex) = combine(language, patterns)? else {
                continue;
            };
            if language == WILDCARD {
                wildcard = Some(regex);
            } else {
                by_lang.insert(language.to_lowercase(), regex);
            }
        }
        Ok(Self { by_lang, wildcard })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_lang.is_empty() && self.wildcard.is_none()
    }

    #[must_use]
    pub fn pattern_for(&self, language: &str) -> Option<&Regex> {
        self.by_lang.get(language).or(self.wildcard.as_ref())
    }

    /// Whether the entire `text` matches the filter for `language`.
    #[must_use]
    pub fn rejects(&self, language: &str, text: &str) -> bool {
        self.pattern_for(language).is_some_and(|re| re.is_match(text))
    }
}

fn combine(language: &str, patterns: &[String]) -> Result<Option<Regex>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let alternation = patterns
        .iter()
        .map(|p| format!("(?:{p})"))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"\A(?:{alternation})\z"))
        .map(Some)
        .map_err(|source| ChunkerError::InvalidFilter {
            language: language.to_owned(),
            source,
        })
}
