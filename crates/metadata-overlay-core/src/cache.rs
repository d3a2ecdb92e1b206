use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use time::{Duration, OffsetDateTime};

use crate::query::QueryResult;
use crate::ResolveError;

/// Memo store for completed query results. Writes are last-writer-wins.
pub trait QueryCache {
    /// # Errors
    /// Returns an error when the backing store fails. A miss is `Ok(None)`.
    fn get(&self, key: &str) -> Result<Option<QueryResult>, ResolveError>;

    /// Store `result` for `ttl`. A non-positive `ttl` stores nothing.
    ///
    /// # Errors
    /// Returns an error when the backing store fails.
    fn set(&self, key: &str, result: &QueryResult, ttl: Duration) -> Result<(), ResolveError>;
}

/// Cache that never remembers anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCache;

impl QueryCache for NoopCache {
    fn get(&self, _key: &str) -> Result<Option<QueryResult>, ResolveError> {
        Ok(None)
    }

    fn set(&self, _key: &str, _result: &QueryResult, _ttl: Duration) -> Result<(), ResolveError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    slots: Mutex<HashMap<String, (QueryResult, OffsetDateTime)>>,
}

impl MemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored slots, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Drop expired slots, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = OffsetDateTime::now_utc();
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let before = slots.len();
        slots.retain(|_, (_, expires_at)| *expires_at > now);
        before - slots.len()
    }

    fn store_until(&self, key: &str, result: QueryResult, expires_at: OffsetDateTime) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), (result, expires_at));
    }
}

impl QueryCache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<QueryResult>, ResolveError> {
        let now = OffsetDateTime::now_utc();
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(slots
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(result, _)| result.clone()))
    }

    fn set(&self, key: &str, result: &QueryResult, ttl: Duration) -> Result<(), ResolveError> {
        if ttl <= Duration::ZERO {
            return Ok(());
        }
        self.store_until(key, result.clone(), OffsetDateTime::now_utc() + ttl);
        Ok(())
    }
}
