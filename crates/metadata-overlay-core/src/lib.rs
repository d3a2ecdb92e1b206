//! Temporal, inheritance-aware key/value metadata overlay.
//!
//! Subjects own named *strands* of metadata (`text`, `images`, ...). Each
//! strand holds time-bounded, approval-gated entries. A [`Query`] asks for
//! one key on one strand of one subject at one instant, and a [`Resolver`]
//! answers it by walking a [`HookChain`]: the subject's own entries, then its
//! parent, then its attached packages, then the kind-wide defaults.
//!
//! Persistence is a collaborator: anything implementing [`KeyRegistry`],
//! [`MetadataSource`] and [`QueryCache`] can back the engine. In-memory
//! implementations of all three ship with this crate.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

mod cache;
mod config;
mod entry;
mod hooks;
mod key;
mod query;
mod resolver;
mod source;
mod view;

#[cfg(test)]
pub(crate) mod test_support;

pub use cache::{MemoryCache, NoopCache, QueryCache};
pub use config::{CountSemantics, ResolverConfig};
pub use entry::{
    newest_first, select_active, MetadataEntry, MetadataValue, PackageAttachment, ValueKind,
};
pub use hooks::{
    handle_set, hook_fn, DefaultEntriesHook, FnHook, Hook, HookChain, HookError, HookResult,
    OwnStrandHook, PackageHook, ParentHook,
};
pub use key::{InMemoryKeyRegistry, KeyRef, KeyRegistry, MetadataKey};
pub use query::{Metadatum, Query, QueryOverrides, QueryResult, QueryType};
pub use resolver::{Resolution, Resolver};
pub use source::{EntryScope, InMemorySource, MetadataSource};
pub use view::{ImageOrText, MetadataView, StrandView};

/// Subject kind reserved for packages.
pub const PACKAGE_KIND: &str = "package";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ResolveError {
    #[error("metadata key not found: {0}")]
    KeyNotFound(String),
    #[error("subject {subject} has no metadata strand `{strand}`")]
    UnknownStrand { subject: SubjectRef, strand: String },
    #[error("query failure: hooks [{hooks}] exhausted for {query}")]
    QueryFailure { query: String, hooks: String },
    #[error("recursion limit of {limit} exceeded while resolving {subject}")]
    RecursionLimit { limit: usize, subject: SubjectRef },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("metadata source error: {0}")]
    Source(String),
}

impl ResolveError {
    #[must_use]
    pub fn is_query_failure(&self) -> bool {
        matches!(self, Self::QueryFailure { .. })
    }
}

/// Identity of anything that can own metadata strands.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SubjectRef {
    pub kind: String,
    pub id: String,
}

impl SubjectRef {
    #[must_use]
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self { kind: kind.into(), id: id.into() }
    }

    #[must_use]
    pub fn package(name: impl Into<String>) -> Self {
        Self::new(PACKAGE_KIND, name)
    }

    #[must_use]
    pub fn is_package(&self) -> bool {
        self.kind == PACKAGE_KIND
    }

    /// Parse the `kind:id` form produced by [`Display`].
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let (kind, id) = value.split_once(':')?;
        if kind.is_empty() || id.is_empty() {
            return None;
        }
        Some(Self::new(kind, id))
    }
}

impl Display for SubjectRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EntryId(pub Ulid);

impl EntryId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for EntryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
