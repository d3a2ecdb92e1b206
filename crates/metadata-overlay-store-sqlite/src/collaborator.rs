use anyhow::{Context, Result};
use metadata_overlay_core::{
    select_active, EntryScope, KeyRef, KeyRegistry, MetadataEntry, MetadataKey, MetadataSource,
    PackageAttachment, QueryCache, QueryResult, ResolveError, SubjectRef,
};
use rusqlite::{params, OptionalExtension};
use time::{Duration, OffsetDateTime};

use crate::{entry_from_row, scope_params, SqliteStore, ENTRY_COLUMNS};

fn source_error(err: &anyhow::Error) -> ResolveError {
    ResolveError::Source(format!("{err:#}"))
}

impl SqliteStore {
    fn stored_entries(
        &self,
        scope: EntryScope<'_>,
        strand: &str,
        key_id: i64,
    ) -> Result<Vec<MetadataEntry>> {
        let (kind, id) = scope_params(scope);
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {ENTRY_COLUMNS}
             FROM metadata_entries
             WHERE subject_kind = ?1 AND subject_id IS ?2 AND strand = ?3 AND key_id = ?4
               AND approver IS NOT NULL"
        ))?;
        let mut rows = stmt.query(params![kind, id, strand, key_id])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(entry_from_row(row)?);
        }
        Ok(entries)
    }

    fn cached_result(&self, cache_key: &str) -> Result<Option<QueryResult>> {
        let raw = self
            .conn
            .query_row(
                "SELECT result_json FROM query_cache WHERE cache_key = ?1 AND expires_at_unix > ?2",
                params![cache_key, OffsetDateTime::now_utc().unix_timestamp()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("failed to read query cache")?;
        raw.map(|raw| serde_json::from_str(&raw).context("failed to decode cached query result"))
            .transpose()
    }

    pub(crate) fn store_result(&self, cache_key: &str, result: &QueryResult, ttl: Duration) -> Result<()> {
        let expires_at = (OffsetDateTime::now_utc() + ttl).unix_timestamp();
        let encoded = serde_json::to_string(result).context("failed to encode query result")?;
        self.conn
            .execute(
                "INSERT INTO query_cache(cache_key, result_json, expires_at_unix) VALUES (?1, ?2, ?3)
                 ON CONFLICT(cache_key)
                 DO UPDATE SET result_json = excluded.result_json,
                               expires_at_unix = excluded.expires_at_unix",
                params![cache_key, encoded, expires_at],
            )
            .context("failed to write query cache")?;
        Ok(())
    }

    /// Delete expired cache rows, returning how many went.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn purge_query_cache(&self) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM query_cache WHERE expires_at_unix <= ?1",
                params![OffsetDateTime::now_utc().unix_timestamp()],
            )
            .context("failed to purge query cache")
    }

    /// # Errors
    /// Returns an error when the delete fails.
    pub fn clear_query_cache(&self) -> Result<usize> {
        self.conn.execute("DELETE FROM query_cache", []).context("failed to clear query cache")
    }
}

impl KeyRegistry for SqliteStore {
    fn lookup(&self, key: &KeyRef) -> Result<Option<MetadataKey>, ResolveError> {
        self.find_key(key).map_err(|err| source_error(&err))
    }

    fn keys(&self) -> Result<Vec<MetadataKey>, ResolveError> {
        self.list_keys().map_err(|err| source_error(&err))
    }
}

impl MetadataSource for SqliteStore {
    fn strands(&self, subject: &SubjectRef) -> Result<Vec<String>, ResolveError> {
        self.list_strands(&subject.kind)
            .map(|strands| strands.into_iter().map(|declared| declared.strand).collect())
            .map_err(|err| source_error(&err))
    }

    fn active_entries(
        &self,
        scope: EntryScope<'_>,
        strand: &str,
        key: &MetadataKey,
        date: OffsetDateTime,
    ) -> Result<Vec<MetadataEntry>, ResolveError> {
        let stored = self.stored_entries(scope, strand, key.id).map_err(|err| source_error(&err))?;
        Ok(select_active(&stored, date))
    }

    fn parent(&self, subject: &SubjectRef) -> Result<Option<SubjectRef>, ResolveError> {
        self.get_parent(subject).map_err(|err| source_error(&err))
    }

    fn package_attachments(
        &self,
        subject: &SubjectRef,
    ) -> Result<Vec<PackageAttachment>, ResolveError> {
        self.list_attachments(subject).map_err(|err| source_error(&err))
    }
}

impl QueryCache for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<QueryResult>, ResolveError> {
        self.cached_result(key).map_err(|err| source_error(&err))
    }

    fn set(&self, key: &str, result: &QueryResult, ttl: Duration) -> Result<(), ResolveError> {
        if ttl <= Duration::ZERO {
            return Ok(());
        }
        self.store_result(key, result, ttl).map_err(|err| source_error(&err))
    }
}
