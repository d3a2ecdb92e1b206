use std::cell::Cell;

use time::OffsetDateTime;

use crate::cache::QueryCache;
use crate::config::ResolverConfig;
use crate::hooks::{HookChain, HookError, HookResult};
use crate::key::{KeyRef, KeyRegistry};
use crate::query::{Query, QueryResult, QueryType};
use crate::source::MetadataSource;
use crate::view::MetadataView;
use crate::{ResolveError, SubjectRef};

/// Runs queries through a hook chain against borrowed collaborators.
pub struct Resolver<'a> {
    keys: &'a dyn KeyRegistry,
    source: &'a dyn MetadataSource,
    cache: &'a dyn QueryCache,
    chain: HookChain,
    config: ResolverConfig,
}

impl<'a> Resolver<'a> {
    #[must_use]
    pub fn new(
        keys: &'a dyn KeyRegistry,
        source: &'a dyn MetadataSource,
        cache: &'a dyn QueryCache,
    ) -> Self {
        Self { keys, source, cache, chain: HookChain::standard(), config: ResolverConfig::default() }
    }

    #[must_use]
    pub fn with_chain(mut self, chain: HookChain) -> Self {
        self.chain = chain;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: ResolverConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn keys(&self) -> &dyn KeyRegistry {
        self.keys
    }

    #[must_use]
    pub fn source(&self) -> &dyn MetadataSource {
        self.source
    }

    #[must_use]
    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    #[must_use]
    pub fn chain(&self) -> &HookChain {
        &self.chain
    }

    /// Build a query with this resolver's count semantics.
    ///
    /// # Errors
    /// Returns [`ResolveError::KeyNotFound`] for an unregistered key.
    pub fn build_query(
        &self,
        subject: SubjectRef,
        strand: &str,
        key: impl Into<KeyRef>,
        query_type: QueryType,
        date: Option<OffsetDateTime>,
    ) -> Result<Query, ResolveError> {
        Ok(Query::new(self.keys, subject, strand, key, query_type, date)?
            .with_count_semantics(self.config.count_semantics))
    }

    /// Build and run a query in one step.
    ///
    /// # Errors
    /// Propagates [`Self::build_query`] and [`Self::run_query`] failures.
    pub fn query(
        &self,
        subject: SubjectRef,
        strand: &str,
        key: impl Into<KeyRef>,
        query_type: QueryType,
        date: Option<OffsetDateTime>,
    ) -> Result<QueryResult, ResolveError> {
        let query = self.build_query(subject, strand, key, query_type, date)?;
        self.run_query(&query)
    }

    /// Walk the hook chain for `query`.
    ///
    /// # Errors
    /// [`ResolveError::QueryFailure`] when every hook declines; any hard
    /// collaborator or recursion error otherwise.
    pub fn run_query(&self, query: &Query) -> Result<QueryResult, ResolveError> {
        Resolution::new(self, vec![query.subject().clone()]).run(query)
    }

    /// View of `subject` as of now. Queries stay undated.
    #[must_use]
    pub fn metadata(&self, subject: SubjectRef) -> MetadataView<'_, 'a> {
        MetadataView::new(self, subject, None)
    }

    #[must_use]
    pub fn metadata_at(&self, subject: SubjectRef, date: OffsetDateTime) -> MetadataView<'_, 'a> {
        MetadataView::new(self, subject, Some(date))
    }
}

/// One in-flight resolution, carrying the chain of subjects visited so far.
pub struct Resolution<'r, 'a> {
    resolver: &'r Resolver<'a>,
    path: Vec<SubjectRef>,
    /// Set once this level or anything below it declined a lineage cycle.
    cycle_declined: Cell<bool>,
}

impl<'r, 'a> Resolution<'r, 'a> {
    fn new(resolver: &'r Resolver<'a>, path: Vec<SubjectRef>) -> Self {
        Self { resolver, path, cycle_declined: Cell::new(false) }
    }
}

impl Resolution<'_, '_> {
    #[must_use]
    pub fn source(&self) -> &dyn MetadataSource {
        self.resolver.source
    }

    #[must_use]
    pub fn config(&self) -> &ResolverConfig {
        &self.resolver.config
    }

    /// Subjects entered so far, outermost first.
    #[must_use]
    pub fn path(&self) -> &[SubjectRef] {
        &self.path
    }

    /// Run the full chain for `query` one level deeper.
    ///
    /// A subject already on the path and a sub-query that fails outright both
    /// decline.
    ///
    /// # Errors
    /// [`HookError::NotApplicable`] on a cycle or sub-query failure;
    /// [`HookError::Fatal`] once the path exceeds `max_depth`.
    pub fn descend(&self, query: &Query) -> HookResult {
        let subject = query.subject();
        if self.path.contains(subject) {
            tracing::warn!(
                subject = %subject,
                path = ?self.path.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "metadata lineage cycle detected"
            );
            self.cycle_declined.set(true);
            return Err(HookError::NotApplicable);
        }
        if self.path.len() >= self.resolver.config.max_depth {
            return Err(HookError::Fatal(ResolveError::RecursionLimit {
                limit: self.resolver.config.max_depth,
                subject: subject.clone(),
            }));
        }

        let mut path = self.path.clone();
        path.push(subject.clone());
        let nested = Resolution::new(self.resolver, path);
        let outcome = nested.run(query);
        if nested.cycle_declined.get() {
            self.cycle_declined.set(true);
        }
        match outcome {
            Ok(result) => Ok(result),
            Err(err) if err.is_query_failure() => Err(HookError::NotApplicable),
            Err(err) => Err(HookError::Fatal(err)),
        }
    }

    fn run(&self, query: &Query) -> Result<QueryResult, ResolveError> {
        let resolver = self.resolver;
        let cache_key = query.cache_key();

        if resolver.config.read_through_cache {
            match resolver.cache.get(&cache_key) {
                Ok(Some(hit)) => {
                    tracing::debug!(cache_key = %cache_key, "metadata cache hit");
                    return Ok(hit);
                }
                Ok(None) => {}
                Err(err) => tracing::warn!("Metadata cache read failed for {}: {}", cache_key, err),
            }
        }

        let mut result = query.initial_state();
        let mut answered = false;
        for hook in resolver.chain.iter() {
            match hook.resolve(query, self) {
                Err(HookError::NotApplicable) => {
                    tracing::trace!(hook = hook.name(), %query, "hook not applicable");
                }
                Err(HookError::Fatal(err)) => return Err(err),
                Ok(partial) => {
                    tracing::debug!(hook = hook.name(), %query, "hook answered");
                    result = if answered { query.join(result, partial) } else { partial };
                    answered = true;
                    if query.satisfied_by(&result) {
                        break;
                    }
                }
            }
        }

        if !answered {
            return Err(ResolveError::QueryFailure {
                query: query.to_string(),
                hooks: resolver.chain.names().join(", "),
            });
        }

        // A nested answer cut short by a cycle depends on the path above it.
        if self.path.len() > 1 && self.cycle_declined.get() {
            tracing::trace!(cache_key = %cache_key, "skipping cache write for cycle-truncated result");
            return Ok(result);
        }
        if let Err(err) = resolver.cache.set(&cache_key, &result, query.key().cache_duration()) {
            tracing::warn!("Metadata cache write failed for {}: {}", cache_key, err);
        }
        Ok(result)
    }
}
