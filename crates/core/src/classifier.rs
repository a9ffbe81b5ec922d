//! Commit message classification.
//!
//! Authors can keep a change from propagating by putting a marker phrase in
//! its commit message. [`CommitClassifier`] turns a message into a
//! [`ChangeIntent`] that the merge engine acts on.

use std::fmt;

use regex_lite::Regex;
use tracing::warn;

use crate::errors::ConfigError;

/// Marker that suppresses propagation on edges without `mergeAll`.
pub const DO_NOT_MERGE: &str = "DO NOT MERGE";

/// Marker that suppresses propagation on every edge.
pub const DO_NOT_MERGE_ANYWHERE: &str = "DO NOT MERGE ANYWHERE";

/// What the author asked for, derived from the commit message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeIntent {
    Normal,
    /// Skip edges that are not marked `mergeAll`.
    SkipHere,
    /// Skip every edge, `mergeAll` or not.
    SkipEverywhere,
}

impl ChangeIntent {
    /// Whether the source content should be merged on an edge with the given
    /// `mergeAll` flag. `false` means a blank merge is produced instead.
    pub fn merges_content(self, merge_all: bool) -> bool {
        match self {
            ChangeIntent::Normal => true,
            ChangeIntent::SkipHere => merge_all,
            ChangeIntent::SkipEverywhere => false,
        }
    }
}

impl fmt::Display for ChangeIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeIntent::Normal => write!(f, "normal"),
            ChangeIntent::SkipHere => write!(f, "skip-here"),
            ChangeIntent::SkipEverywhere => write!(f, "skip-everywhere"),
        }
    }
}

/// Case-sensitive matcher for the skip markers.
#[derive(Debug, Clone)]
pub struct CommitClassifier {
    skip_here: Vec<Regex>,
    skip_everywhere: Vec<Regex>,
}

impl Default for CommitClassifier {
    fn default() -> Self {
        let literal = |phrase: &str| {
            Regex::new(&regex_lite::escape(phrase)).map(|re| vec![re]).unwrap_or_default()
        };
        Self {
            skip_here: literal(DO_NOT_MERGE),
            skip_everywhere: literal(DO_NOT_MERGE_ANYWHERE),
        }
    }
}

impl CommitClassifier {
    /// Build a classifier from configured patterns.
    ///
    /// An empty pattern list falls back to the default marker phrase for that
    /// intent. Patterns that fail to compile are skipped and returned so the
    /// caller can report them.
    pub fn from_patterns(
        skip_here: &[String],
        skip_everywhere: &[String],
    ) -> (Self, Vec<ConfigError>) {
        let defaults = Self::default();
        let mut errors = Vec::new();

        let mut compile = |patterns: &[String], fallback: Vec<Regex>| -> Vec<Regex> {
            if patterns.is_empty() {
                return fallback;
            }
            patterns
                .iter()
                .filter_map(|p| match Regex::new(p) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        warn!(pattern = %p, error = %e, "ignoring invalid marker pattern");
                        errors.push(ConfigError::InvalidPattern {
                            pattern: p.clone(),
                            detail: e.to_string(),
                        });
                        None
                    }
                })
                .collect()
        };

        let skip_here = compile(skip_here, defaults.skip_here);
        let skip_everywhere = compile(skip_everywhere, defaults.skip_everywhere);

        (
            Self {
                skip_here,
                skip_everywhere,
            },
            errors,
        )
    }

    /// Classify a commit subject or full message.
    pub fn classify(&self, message: &str) -> ChangeIntent {
        if self.skip_everywhere.iter().any(|re| re.is_match(message)) {
            ChangeIntent::SkipEverywhere
        } else if self.skip_here.iter().any(|re| re.is_match(message)) {
            ChangeIntent::SkipHere
        } else {
            ChangeIntent::Normal
        }
    }
}
