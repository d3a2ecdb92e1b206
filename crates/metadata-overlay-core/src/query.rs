use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::config::CountSemantics;
use crate::entry::MetadataValue;
use crate::key::{KeyRef, KeyRegistry, MetadataKey};
use crate::{ResolveError, SubjectRef};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Value,
    Exists,
    Count,
}

impl QueryType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Value => "value",
            Self::Exists => "exists",
            Self::Count => "count",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "value" => Some(Self::Value),
            "exists" => Some(Self::Exists),
            "count" => Some(Self::Count),
            _ => None,
        }
    }
}

/// Partial or final answer to a [`Query`].
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "type", content = "result", rename_all = "snake_case")]
pub enum QueryResult {
    /// Seed for VALUE queries before any hook has answered.
    Empty,
    Value(MetadataValue),
    Values(Vec<MetadataValue>),
    Exists(bool),
    Count(u64),
}

impl QueryResult {
    #[must_use]
    pub fn as_exists(&self) -> Option<bool> {
        match self {
            Self::Exists(exists) => Some(*exists),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_count(&self) -> Option<u64> {
        match self {
            Self::Count(count) => Some(*count),
            _ => None,
        }
    }

    /// Flatten a VALUE answer into a sequence.
    #[must_use]
    pub fn into_values(self) -> Vec<MetadataValue> {
        match self {
            Self::Value(value) => vec![value],
            Self::Values(values) => values,
            Self::Empty | Self::Exists(_) | Self::Count(_) => Vec::new(),
        }
    }

    #[must_use]
    pub fn into_metadatum(self) -> Option<Metadatum> {
        match self {
            Self::Value(value) => Some(Metadatum::One(value)),
            Self::Values(values) => Some(Metadatum::Many(values)),
            Self::Empty | Self::Exists(_) | Self::Count(_) => None,
        }
    }
}

/// What a strand lookup hands back to application code.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum Metadatum {
    One(MetadataValue),
    Many(Vec<MetadataValue>),
}

impl Metadatum {
    /// True for a multi-value answer with nothing in it.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Many(values) if values.is_empty())
    }

    /// The newest value, for either shape.
    #[must_use]
    pub fn first(&self) -> Option<&MetadataValue> {
        match self {
            Self::One(value) => Some(value),
            Self::Many(values) => values.first(),
        }
    }
}

/// Field substitutions for [`Query::replace`]. Unset fields keep their value.
#[derive(Debug, Clone, Default)]
pub struct QueryOverrides {
    pub subject: Option<SubjectRef>,
    pub date: Option<OffsetDateTime>,
    pub key: Option<MetadataKey>,
    pub strand: Option<String>,
    pub query_type: Option<QueryType>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Query {
    subject: SubjectRef,
    date: Option<OffsetDateTime>,
    constructed_at: OffsetDateTime,
    key: MetadataKey,
    strand: String,
    query_type: QueryType,
    count_semantics: CountSemantics,
}

impl Query {
    /// Build a query, resolving `key` through `keys` first.
    ///
    /// # Errors
    /// Returns [`ResolveError::KeyNotFound`] when the key is not registered.
    pub fn new(
        keys: &dyn KeyRegistry,
        subject: SubjectRef,
        strand: &str,
        key: impl Into<KeyRef>,
        query_type: QueryType,
        date: Option<OffsetDateTime>,
    ) -> Result<Self, ResolveError> {
        let key = keys.get(&key.into())?;
        Ok(Self::from_key(subject, strand, key, query_type, date))
    }

    #[must_use]
    pub fn from_key(
        subject: SubjectRef,
        strand: &str,
        key: MetadataKey,
        query_type: QueryType,
        date: Option<OffsetDateTime>,
    ) -> Self {
        Self {
            subject,
            date,
            constructed_at: OffsetDateTime::now_utc(),
            key,
            strand: strand.to_string(),
            query_type,
            count_semantics: CountSemantics::default(),
        }
    }

    #[must_use]
    pub fn with_count_semantics(mut self, count_semantics: CountSemantics) -> Self {
        self.count_semantics = count_semantics;
        self
    }

    #[must_use]
    pub fn subject(&self) -> &SubjectRef {
        &self.subject
    }

    #[must_use]
    pub fn key(&self) -> &MetadataKey {
        &self.key
    }

    #[must_use]
    pub fn strand(&self) -> &str {
        &self.strand
    }

    #[must_use]
    pub fn query_type(&self) -> QueryType {
        self.query_type
    }

    #[must_use]
    pub fn count_semantics(&self) -> CountSemantics {
        self.count_semantics
    }

    /// The explicit date, if one was given.
    #[must_use]
    pub fn requested_date(&self) -> Option<OffsetDateTime> {
        self.date
    }

    /// Target instant: the explicit date, or when the query was built.
    #[must_use]
    pub fn date(&self) -> OffsetDateTime {
        self.date.unwrap_or(self.constructed_at)
    }

    #[must_use]
    pub fn initial_state(&self) -> QueryResult {
        match self.query_type {
            QueryType::Value => QueryResult::Empty,
            QueryType::Exists => QueryResult::Exists(false),
            QueryType::Count => QueryResult::Count(0),
        }
    }

    /// Combine two successful answers. `old` takes precedence.
    ///
    /// Multi-value answers merge as an order-preserving union: `old` first,
    /// then `new`, keeping only the first occurrence of any value on either
    /// side.
    #[must_use]
    pub fn join(&self, old: QueryResult, new: QueryResult) -> QueryResult {
        match self.query_type {
            QueryType::Value if !self.key.allow_multiple => old,
            QueryType::Value => {
                let mut merged: Vec<MetadataValue> = Vec::new();
                for value in old.into_values().into_iter().chain(new.into_values()) {
                    if !merged.contains(&value) {
                        merged.push(value);
                    }
                }
                QueryResult::Values(merged)
            }
            QueryType::Exists => QueryResult::Exists(
                old.as_exists().unwrap_or(false) || new.as_exists().unwrap_or(false),
            ),
            QueryType::Count => {
                let sum = old
                    .as_count()
                    .unwrap_or(0)
                    .saturating_add(new.as_count().unwrap_or(0));
                if self.key.allow_multiple {
                    QueryResult::Count(sum)
                } else {
                    QueryResult::Count(self.count_semantics.apply(sum))
                }
            }
        }
    }

    /// Whether later hooks can no longer change `result`.
    #[must_use]
    pub fn satisfied_by(&self, result: &QueryResult) -> bool {
        match self.query_type {
            QueryType::Value => {
                !self.key.allow_multiple && !matches!(result, QueryResult::Empty)
            }
            QueryType::Exists => result.as_exists().unwrap_or(false),
            QueryType::Count => false,
        }
    }

    /// Copy of this query with the given fields substituted.
    ///
    /// The construction instant carries over, so an undated query keeps the
    /// same target date across recursion.
    #[must_use]
    pub fn replace(&self, overrides: QueryOverrides) -> Self {
        Self {
            subject: overrides.subject.unwrap_or_else(|| self.subject.clone()),
            date: overrides.date.or(self.date),
            constructed_at: self.constructed_at,
            key: overrides.key.unwrap_or_else(|| self.key.clone()),
            strand: overrides.strand.unwrap_or_else(|| self.strand.clone()),
            query_type: overrides.query_type.unwrap_or(self.query_type),
            count_semantics: self.count_semantics,
        }
    }

    #[must_use]
    pub fn with_subject(&self, subject: SubjectRef) -> Self {
        self.replace(QueryOverrides { subject: Some(subject), ..QueryOverrides::default() })
    }

    /// Deterministic cache key.
    ///
    /// Each component is escaped (`_` to `__`, `-` to `_d`, space to `_s`)
    /// before joining with `-`, so distinct queries never share a key.
    #[must_use]
    pub fn cache_key(&self) -> String {
        let date = match self.date {
            Some(date) => date
                .format(&Rfc3339)
                .unwrap_or_else(|_| date.unix_timestamp_nanos().to_string()),
            None => "now".to_string(),
        };
        [
            self.subject.kind.as_str(),
            self.subject.id.as_str(),
            date.as_str(),
            self.strand.as_str(),
            self.key.name.as_str(),
            self.query_type.as_str(),
        ]
        .iter()
        .map(|component| escape_component(component))
        .collect::<Vec<_>>()
        .join("-")
    }
}

impl Display for Query {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}[{}].{}",
            self.query_type.as_str(),
            self.subject,
            self.strand,
            self.key.name
        )
    }
}

fn escape_component(component: &str) -> String {
    let mut escaped = String::with_capacity(component.len());
    for ch in component.chars() {
        match ch {
            '_' => escaped.push_str("__"),
            '-' => escaped.push_str("_d"),
            ' ' => escaped.push_str("_s"),
            other => escaped.push(other),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::key::InMemoryKeyRegistry;
    use crate::test_support::{text, year};

    fn key(allow_multiple: bool) -> MetadataKey {
        MetadataKey {
            id: 1,
            name: "k".to_string(),
            description: String::new(),
            allow_multiple,
            cache_seconds: 0,
        }
    }

    fn query(query_type: QueryType, allow_multiple: bool) -> Query {
        Query::from_key(
            SubjectRef::new("show", "1"),
            "text",
            key(allow_multiple),
            query_type,
            Some(year(2012)),
        )
    }

    #[test]
    fn unknown_key_fails_at_construction() {
        let registry = InMemoryKeyRegistry::new();
        let result = Query::new(
            &registry,
            SubjectRef::new("show", "1"),
            "text",
            "missing",
            QueryType::Value,
            None,
        );
        assert_eq!(result, Err(ResolveError::KeyNotFound("missing".to_string())));
    }

    #[test]
    fn initial_state_matches_query_type() {
        assert_eq!(query(QueryType::Value, false).initial_state(), QueryResult::Empty);
        assert_eq!(query(QueryType::Exists, false).initial_state(), QueryResult::Exists(false));
        assert_eq!(query(QueryType::Count, false).initial_state(), QueryResult::Count(0));
    }

    #[test]
    fn single_value_join_keeps_old() {
        let q = query(QueryType::Value, false);
        let joined = q.join(QueryResult::Value(text("old")), QueryResult::Value(text("new")));
        assert_eq!(joined, QueryResult::Value(text("old")));
    }

    #[test]
    fn multi_value_join_is_ordered_union() {
        let q = query(QueryType::Value, true);
        let joined = q.join(
            QueryResult::Values(vec![text("b"), text("a")]),
            QueryResult::Values(vec![text("a"), text("c")]),
        );
        assert_eq!(joined, QueryResult::Values(vec![text("b"), text("a"), text("c")]));
    }

    #[test]
    fn multi_value_join_drops_repeats_within_old() {
        let q = query(QueryType::Value, true);
        let joined = q.join(
            QueryResult::Values(vec![text("a"), text("a"), text("b")]),
            QueryResult::Values(vec![text("b"), text("c"), text("c")]),
        );
        assert_eq!(joined, QueryResult::Values(vec![text("a"), text("b"), text("c")]));
    }

    #[test]
    fn exists_join_is_or() {
        let q = query(QueryType::Exists, false);
        assert_eq!(
            q.join(QueryResult::Exists(false), QueryResult::Exists(true)),
            QueryResult::Exists(true)
        );
        assert_eq!(
            q.join(QueryResult::Exists(false), QueryResult::Exists(false)),
            QueryResult::Exists(false)
        );
    }

    #[test]
    fn count_join_depends_on_multiplicity() {
        let multiple = query(QueryType::Count, true);
        assert_eq!(
            multiple.join(QueryResult::Count(2), QueryResult::Count(3)),
            QueryResult::Count(5)
        );

        let single = query(QueryType::Count, false);
        assert_eq!(single.join(QueryResult::Count(0), QueryResult::Count(0)), QueryResult::Count(1));

        let exact = single.with_count_semantics(CountSemantics::Exact);
        assert_eq!(exact.join(QueryResult::Count(0), QueryResult::Count(0)), QueryResult::Count(0));
        assert_eq!(exact.join(QueryResult::Count(1), QueryResult::Count(1)), QueryResult::Count(1));
    }

    #[test]
    fn satisfied_by_short_circuits_only_where_safe() {
        assert!(query(QueryType::Value, false).satisfied_by(&QueryResult::Value(text("x"))));
        assert!(!query(QueryType::Value, true).satisfied_by(&QueryResult::Values(vec![text("x")])));
        assert!(query(QueryType::Exists, true).satisfied_by(&QueryResult::Exists(true)));
        assert!(!query(QueryType::Exists, true).satisfied_by(&QueryResult::Exists(false)));
        assert!(!query(QueryType::Count, false).satisfied_by(&QueryResult::Count(9)));
    }

    #[test]
    fn replace_substitutes_only_given_fields() {
        let original = query(QueryType::Value, false);
        let replaced = original.replace(QueryOverrides {
            subject: Some(SubjectRef::package("p")),
            query_type: Some(QueryType::Exists),
            ..QueryOverrides::default()
        });
        assert_eq!(replaced.subject(), &SubjectRef::package("p"));
        assert_eq!(replaced.query_type(), QueryType::Exists);
        assert_eq!(replaced.strand(), original.strand());
        assert_eq!(replaced.key(), original.key());
        assert_eq!(replaced.date(), original.date());
    }

    #[test]
    fn undated_query_keeps_construction_instant_across_replace() {
        let undated =
            Query::from_key(SubjectRef::new("show", "1"), "text", key(false), QueryType::Value, None);
        let parent = undated.with_subject(SubjectRef::new("show", "2"));
        assert_eq!(undated.date(), parent.date());
        assert_eq!(parent.requested_date(), None);
        assert!(undated.cache_key().contains("-now-"));
    }

    #[test]
    fn cache_key_escapes_separators() {
        let q = Query::from_key(
            SubjectRef::new("tv_show", "a-b c"),
            "text",
            key(false),
            QueryType::Value,
            None,
        );
        assert_eq!(q.cache_key(), "tv__show-a_db_sc-now-text-k-value");
    }

    proptest! {
        #[test]
        fn cache_key_is_injective(
            kind_a in "[a-z_ -]{1,6}",
            id_a in "[a-z0-9_ -]{1,6}",
            kind_b in "[a-z_ -]{1,6}",
            id_b in "[a-z0-9_ -]{1,6}",
        ) {
            let a = Query::from_key(SubjectRef::new(kind_a.clone(), id_a.clone()), "text", key(false), QueryType::Value, None);
            let b = Query::from_key(SubjectRef::new(kind_b.clone(), id_b.clone()), "text", key(false), QueryType::Value, None);
            if (kind_a, id_a) != (kind_b, id_b) {
                prop_assert_ne!(a.cache_key(), b.cache_key());
            } else {
                prop_assert_eq!(a.cache_key(), b.cache_key());
            }
        }
    }
}
