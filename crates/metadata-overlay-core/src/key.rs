use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::Duration;

use crate::ResolveError;

/// Canonical definition of a metadata key.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct MetadataKey {
    pub id: i64,
    pub name: String,
    pub description: String,
    /// Whether several entries for this key may be active at once (tags, say).
    pub allow_multiple: bool,
    pub cache_seconds: u32,
}

impl MetadataKey {
    #[must_use]
    pub fn cache_duration(&self) -> Duration {
        Duration::seconds(i64::from(self.cache_seconds))
    }

    /// Validate the key definition before it is registered.
    ///
    /// # Errors
    /// Returns [`ResolveError::Validation`] when the name is blank or contains
    /// whitespace.
    pub fn validate(&self) -> Result<(), ResolveError> {
        if self.name.trim().is_empty() {
            return Err(ResolveError::Validation("key name MUST be non-empty".to_string()));
        }
        if self.name.chars().any(char::is_whitespace) {
            return Err(ResolveError::Validation(format!(
                "key name `{}` MUST NOT contain whitespace",
                self.name
            )));
        }
        Ok(())
    }
}

impl Display for MetadataKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Anything a caller may use to name a key.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum KeyRef {
    Name(String),
    Id(i64),
    Key(MetadataKey),
}

impl Display for KeyRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Name(name) => write!(f, "{name}"),
            Self::Id(id) => write!(f, "#{id}"),
            Self::Key(key) => write!(f, "{}", key.name),
        }
    }
}

impl From<&str> for KeyRef {
    fn from(value: &str) -> Self {
        Self::Name(value.to_string())
    }
}

impl From<String> for KeyRef {
    fn from(value: String) -> Self {
        Self::Name(value)
    }
}

impl From<i64> for KeyRef {
    fn from(value: i64) -> Self {
        Self::Id(value)
    }
}

impl From<MetadataKey> for KeyRef {
    fn from(value: MetadataKey) -> Self {
        Self::Key(value)
    }
}

impl From<&MetadataKey> for KeyRef {
    fn from(value: &MetadataKey) -> Self {
        Self::Key(value.clone())
    }
}

pub trait KeyRegistry {
    /// Find a key by name or id.
    ///
    /// # Errors
    /// Returns an error only when the backing store fails; absence is `Ok(None)`.
    fn lookup(&self, key: &KeyRef) -> Result<Option<MetadataKey>, ResolveError>;

    /// Every registered key, ordered by name.
    ///
    /// # Errors
    /// Returns an error when the backing store fails.
    fn keys(&self) -> Result<Vec<MetadataKey>, ResolveError>;

    /// Resolve a key reference, failing when it is not registered.
    ///
    /// # Errors
    /// Returns [`ResolveError::KeyNotFound`] for unknown names or ids.
    fn get(&self, key: &KeyRef) -> Result<MetadataKey, ResolveError> {
        if let KeyRef::Key(resolved) = key {
            return Ok(resolved.clone());
        }
        self.lookup(key)?.ok_or_else(|| ResolveError::KeyNotFound(key.to_string()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryKeyRegistry {
    by_name: BTreeMap<String, MetadataKey>,
    next_id: i64,
}

impl InMemoryKeyRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new key and assign it the next id.
    ///
    /// # Errors
    /// Returns [`ResolveError::Validation`] for invalid or duplicate names.
    pub fn define(
        &mut self,
        name: &str,
        description: &str,
        allow_multiple: bool,
        cache_seconds: u32,
    ) -> Result<MetadataKey, ResolveError> {
        let key = MetadataKey {
            id: self.next_id + 1,
            name: name.to_string(),
            description: description.to_string(),
            allow_multiple,
            cache_seconds,
        };
        self.insert(key.clone())?;
        Ok(key)
    }

    /// Register a key with a caller-chosen id.
    ///
    /// # Errors
    /// Returns [`ResolveError::Validation`] for invalid, duplicate names or ids.
    pub fn insert(&mut self, key: MetadataKey) -> Result<(), ResolveError> {
        key.validate()?;
        if self.by_name.contains_key(&key.name) {
            return Err(ResolveError::Validation(format!("key `{}` already exists", key.name)));
        }
        if self.by_name.values().any(|existing| existing.id == key.id) {
            return Err(ResolveError::Validation(format!("key id {} already exists", key.id)));
        }
        self.next_id = self.next_id.max(key.id);
        self.by_name.insert(key.name.clone(), key);
        Ok(())
    }
}

impl KeyRegistry for InMemoryKeyRegistry {
    fn lookup(&self, key: &KeyRef) -> Result<Option<MetadataKey>, ResolveError> {
        Ok(match key {
            KeyRef::Name(name) => self.by_name.get(name).cloned(),
            KeyRef::Id(id) => self.by_name.values().find(|candidate| candidate.id == *id).cloned(),
            KeyRef::Key(resolved) => self.by_name.get(&resolved.name).cloned(),
        })
    }

    fn keys(&self) -> Result<Vec<MetadataKey>, ResolveError> {
        Ok(self.by_name.values().cloned().collect())
    }
}
