use serde::{Deserialize, Serialize};

use crate::ResolveError;

/// How COUNT answers are reported for single-value keys.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CountSemantics {
    /// `max(1, n)`: a single-value key always counts as one logical value.
    #[default]
    AtLeastOne,
    /// `min(n, 1)`: zero when nothing matched.
    Exact,
}

impl CountSemantics {
    #[must_use]
    pub fn apply(self, count: u64) -> u64 {
        match self {
            Self::AtLeastOne => count.max(1),
            Self::Exact => count.min(1),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AtLeastOne => "at_least_one",
            Self::Exact => "exact",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ResolverConfig {
    /// Strand searched first by `metadatum` and used by the title accessors.
    pub default_strand: String,
    /// Strand consulted for image lookups.
    pub image_strand: String,
    /// Parent/package nesting allowed before resolution aborts.
    pub max_depth: usize,
    pub count_semantics: CountSemantics,
    /// Serve live cache entries before running any hook.
    pub read_through_cache: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            default_strand: "text".to_string(),
            image_strand: "images".to_string(),
            max_depth: 32,
            count_semantics: CountSemantics::AtLeastOne,
            read_through_cache: false,
        }
    }
}

impl ResolverConfig {
    /// # Errors
    /// Returns [`ResolveError::Validation`] for a zero depth or blank strands.
    pub fn validate(&self) -> Result<(), ResolveError> {
        if self.max_depth == 0 {
            return Err(ResolveError::Validation("max_depth MUST be at least 1".to_string()));
        }
        if self.default_strand.trim().is_empty() || self.image_strand.trim().is_empty() {
            return Err(ResolveError::Validation("strand names MUST be non-empty".to_string()));
        }
        Ok(())
    }
}
