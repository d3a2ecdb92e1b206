//! Resolution strategies and the ordered chain the resolver walks.

use std::fmt::{Debug, Formatter};

use crate::config::CountSemantics;
use crate::entry::{MetadataEntry, MetadataValue};
use crate::query::{Query, QueryResult, QueryType};
use crate::resolver::Resolution;
use crate::source::EntryScope;
use crate::ResolveError;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum HookError {
    /// The hook has no opinion; the runner moves on.
    #[error("hook not applicable")]
    NotApplicable,
    /// Abort the whole query.
    #[error(transparent)]
    Fatal(#[from] ResolveError),
}

pub type HookResult = Result<QueryResult, HookError>;

/// One resolution strategy.
pub trait Hook {
    fn name(&self) -> &str;

    /// Answer `query` or decline with [`HookError::NotApplicable`].
    ///
    /// # Errors
    /// [`HookError::NotApplicable`] to defer to the next hook;
    /// [`HookError::Fatal`] to abort resolution.
    fn resolve(&self, query: &Query, resolution: &Resolution<'_, '_>) -> HookResult;
}

/// A named closure hook, built with [`hook_fn`].
pub struct FnHook<F> {
    name: String,
    func: F,
}

impl<F> Hook for FnHook<F>
where
    F: Fn(&Query, &Resolution<'_, '_>) -> HookResult,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn resolve(&self, query: &Query, resolution: &Resolution<'_, '_>) -> HookResult {
        (self.func)(query, resolution)
    }
}

#[must_use]
pub fn hook_fn<F>(name: &str, func: F) -> FnHook<F>
where
    F: Fn(&Query, &Resolution<'_, '_>) -> HookResult,
{
    FnHook { name: name.to_string(), func }
}

/// Reduce active entries (newest first) to an answer for `query_type`.
///
/// Multi-value answers list each distinct value once, at its newest position.
/// COUNT still counts entries.
///
/// # Errors
/// [`HookError::NotApplicable`] for a single-value VALUE query with no entries.
pub fn handle_set(
    entries: Vec<MetadataEntry>,
    allow_multiple: bool,
    query_type: QueryType,
    count_semantics: CountSemantics,
) -> HookResult {
    match query_type {
        QueryType::Value if allow_multiple => {
            let mut values: Vec<MetadataValue> = Vec::with_capacity(entries.len());
            for entry in entries {
                if !values.contains(&entry.value) {
                    values.push(entry.value);
                }
            }
            Ok(QueryResult::Values(values))
        }
        QueryType::Value => entries
            .into_iter()
            .next()
            .map(|entry| QueryResult::Value(entry.value))
            .ok_or(HookError::NotApplicable),
        QueryType::Count => {
            let count = u64::try_from(entries.len()).unwrap_or(u64::MAX);
            Ok(QueryResult::Count(if allow_multiple {
                count
            } else {
                count_semantics.apply(count)
            }))
        }
        QueryType::Exists => Ok(QueryResult::Exists(!entries.is_empty())),
    }
}

fn reduce(query: &Query, entries: Vec<MetadataEntry>) -> HookResult {
    handle_set(entries, query.key().allow_multiple, query.query_type(), query.count_semantics())
}

/// The subject's own entries on the requested strand.
#[derive(Debug, Clone, Copy, Default)]
pub struct OwnStrandHook;

impl Hook for OwnStrandHook {
    fn name(&self) -> &str {
        "own_strand"
    }

    fn resolve(&self, query: &Query, resolution: &Resolution<'_, '_>) -> HookResult {
        let source = resolution.source();
        if !source.has_strand(query.subject(), query.strand())? {
            return Err(HookError::NotApplicable);
        }
        let entries = source.active_entries(
            EntryScope::Subject(query.subject()),
            query.strand(),
            query.key(),
            query.date(),
        )?;
        reduce(query, entries)
    }
}

/// Re-run the whole chain against the subject's parent.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParentHook;

impl Hook for ParentHook {
    fn name(&self) -> &str {
        "parent"
    }

    fn resolve(&self, query: &Query, resolution: &Resolution<'_, '_>) -> HookResult {
        match resolution.source().parent(query.subject())? {
            Some(parent) => resolution.descend(&query.with_subject(parent)),
            None => Err(HookError::NotApplicable),
        }
    }
}

/// First package attachment active at the query date whose chain answers.
#[derive(Debug, Clone, Copy, Default)]
pub struct PackageHook;

impl Hook for PackageHook {
    fn name(&self) -> &str {
        "package"
    }

    fn resolve(&self, query: &Query, resolution: &Resolution<'_, '_>) -> HookResult {
        let date = query.date();
        let attachments = resolution.source().package_attachments(query.subject())?;
        for attachment in attachments.into_iter().filter(|attachment| attachment.is_active_at(date))
        {
            match resolution.descend(&query.with_subject(attachment.package)) {
                Err(HookError::NotApplicable) => {}
                other => return other,
            }
        }
        Err(HookError::NotApplicable)
    }
}

/// Element-less defaults for the subject's kind.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultEntriesHook;

impl Hook for DefaultEntriesHook {
    fn name(&self) -> &str {
        "defaults"
    }

    fn resolve(&self, query: &Query, resolution: &Resolution<'_, '_>) -> HookResult {
        let source = resolution.source();
        if !source.has_strand(query.subject(), query.strand())? {
            return Err(HookError::NotApplicable);
        }
        let entries = source.active_entries(
            EntryScope::Defaults { kind: &query.subject().kind },
            query.strand(),
            query.key(),
            query.date(),
        )?;
        reduce(query, entries)
    }
}

/// Ordered list of hooks, highest priority first.
pub struct HookChain {
    hooks: Vec<Box<dyn Hook>>,
}

impl HookChain {
    #[must_use]
    pub fn new(hooks: Vec<Box<dyn Hook>>) -> Self {
        Self { hooks }
    }

    /// Own strand, parent, package, defaults.
    #[must_use]
    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(OwnStrandHook),
            Box::new(ParentHook),
            Box::new(PackageHook),
            Box::new(DefaultEntriesHook),
        ])
    }

    #[must_use]
    pub fn push(mut self, hook: impl Hook + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Hook> {
        self.hooks.iter().map(|hook| &**hook as &dyn Hook)
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.hooks.iter().map(|hook| hook.name()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl Default for HookChain {
    fn default() -> Self {
        Self::standard()
    }
}

impl Debug for HookChain {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
