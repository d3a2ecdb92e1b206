use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::now_rfc3339;

pub(crate) const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS metadata_keys (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE,
  description TEXT NOT NULL,
  allow_multiple INTEGER NOT NULL CHECK (allow_multiple IN (0, 1)),
  cache_seconds INTEGER NOT NULL CHECK (cache_seconds >= 0)
);

CREATE TABLE IF NOT EXISTS subject_strands (
  subject_kind TEXT NOT NULL,
  strand TEXT NOT NULL,
  value_kind TEXT NOT NULL CHECK (value_kind IN ('text','image')),
  PRIMARY KEY (subject_kind, strand)
);

CREATE TABLE IF NOT EXISTS metadata_entries (
  entry_id TEXT PRIMARY KEY,
  subject_kind TEXT NOT NULL,
  subject_id TEXT,
  strand TEXT NOT NULL,
  key_id INTEGER NOT NULL,
  value_kind TEXT NOT NULL CHECK (value_kind IN ('text','image')),
  value TEXT NOT NULL,
  effective_from TEXT NOT NULL,
  effective_to TEXT,
  creator TEXT NOT NULL,
  approver TEXT,
  FOREIGN KEY (key_id) REFERENCES metadata_keys(id),
  FOREIGN KEY (subject_kind, strand) REFERENCES subject_strands(subject_kind, strand)
);

CREATE TABLE IF NOT EXISTS subject_parents (
  subject_kind TEXT NOT NULL,
  subject_id TEXT NOT NULL,
  parent_kind TEXT NOT NULL,
  parent_id TEXT NOT NULL,
  PRIMARY KEY (subject_kind, subject_id),
  CHECK (NOT (subject_kind = parent_kind AND subject_id = parent_id))
);

CREATE TABLE IF NOT EXISTS packages (
  name TEXT PRIMARY KEY,
  description TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS package_attachments (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  subject_kind TEXT NOT NULL,
  subject_id TEXT NOT NULL,
  package TEXT NOT NULL,
  position INTEGER NOT NULL,
  effective_from TEXT NOT NULL,
  effective_to TEXT,
  approver TEXT,
  UNIQUE (subject_kind, subject_id, position),
  FOREIGN KEY (package) REFERENCES packages(name)
);

CREATE INDEX IF NOT EXISTS idx_metadata_entries_lookup
  ON metadata_entries(subject_kind, subject_id, strand, key_id);
CREATE INDEX IF NOT EXISTS idx_package_attachments_subject
  ON package_attachments(subject_kind, subject_id, position);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS query_cache (
  cache_key TEXT PRIMARY KEY,
  result_json TEXT NOT NULL,
  expires_at_unix INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_query_cache_expiry ON query_cache(expires_at_unix);
";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

pub(crate) fn ensure_migrations_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .context("failed to apply schema_migrations table")
}

pub(crate) fn status(conn: &Connection) -> Result<SchemaStatus> {
    ensure_migrations_table(conn)?;
    let current_version = current_schema_version(conn)?;
    let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
        ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
    } else {
        Vec::new()
    };

    Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
}

/// Apply one forward migration inside its own transaction.
pub(crate) fn apply(conn: &mut Connection, version: i64) -> Result<()> {
    let sql = match version {
        1 => MIGRATION_001_SQL,
        2 => MIGRATION_002_SQL,
        other => return Err(anyhow::anyhow!("no migration defined for schema version {other}")),
    };

    let tx = conn
        .transaction()
        .with_context(|| format!("failed to start migration v{version} transaction"))?;
    tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
    tx.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now_rfc3339()?],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;

    tracing::info!("Applied metadata schema migration v{}", version);
    Ok(())
}

pub(crate) fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get::<_, i64>(0)
    })
    .context("failed to read current schema version")
}
