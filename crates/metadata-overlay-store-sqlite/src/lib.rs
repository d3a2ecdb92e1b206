//! `SQLite` persistence for the metadata overlay: key registry, strand
//! declarations, entries, lineage and the query cache.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use metadata_overlay_core::{
    EntryId, EntryScope, KeyRef, MetadataEntry, MetadataKey, MetadataValue, PackageAttachment,
    SubjectRef, ValueKind, PACKAGE_KIND,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

mod collaborator;
mod schema;

pub use schema::SchemaStatus;

/// Strands every package carries.
pub const PACKAGE_STRANDS: [(&str, ValueKind); 2] =
    [("text", ValueKind::Text), ("images", ValueKind::Image)];

const ENTRY_COLUMNS: &str = "entry_id, subject_kind, subject_id, strand, key_id, value_kind, value,
     effective_from, effective_to, creator, approver";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StrandDeclaration {
    pub subject_kind: String,
    pub strand: String,
    pub value_kind: ValueKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed metadata store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        schema::status(&self.conn)
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails.
    pub fn migrate(&mut self) -> Result<SchemaStatus> {
        let status = schema::status(&self.conn)?;
        for version in &status.pending_versions {
            schema::apply(&mut self.conn, *version)?;
        }
        schema::status(&self.conn)
    }

    /// Register a metadata key and return it with its assigned id.
    ///
    /// # Errors
    /// Returns an error for invalid or duplicate names.
    pub fn add_key(
        &self,
        name: &str,
        description: &str,
        allow_multiple: bool,
        cache_seconds: u32,
    ) -> Result<MetadataKey> {
        let mut key = MetadataKey {
            id: 0,
            name: name.to_string(),
            description: description.to_string(),
            allow_multiple,
            cache_seconds,
        };
        key.validate().map_err(|err| anyhow!("key validation failed: {err}"))?;

        self.conn
            .execute(
                "INSERT INTO metadata_keys(name, description, allow_multiple, cache_seconds)
                 VALUES (?1, ?2, ?3, ?4)",
                params![key.name, key.description, key.allow_multiple, key.cache_seconds],
            )
            .with_context(|| format!("failed to insert metadata key {name}"))?;
        key.id = self.conn.last_insert_rowid();
        Ok(key)
    }

    /// All keys, ordered by name.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_keys(&self) -> Result<Vec<MetadataKey>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, description, allow_multiple, cache_seconds
             FROM metadata_keys
             ORDER BY name ASC",
        )?;
        let rows = stmt.query_map([], key_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to read metadata keys")
    }

    /// # Errors
    /// Returns an error when the lookup query fails.
    pub fn find_key(&self, key: &KeyRef) -> Result<Option<MetadataKey>> {
        let sql = "SELECT id, name, description, allow_multiple, cache_seconds FROM metadata_keys";
        let found = match key {
            KeyRef::Id(id) => self
                .conn
                .query_row(&format!("{sql} WHERE id = ?1"), params![id], key_from_row)
                .optional(),
            KeyRef::Name(name) => self
                .conn
                .query_row(&format!("{sql} WHERE name = ?1"), params![name], key_from_row)
                .optional(),
            KeyRef::Key(resolved) => self
                .conn
                .query_row(&format!("{sql} WHERE name = ?1"), params![resolved.name], key_from_row)
                .optional(),
        };
        found.with_context(|| format!("failed to look up metadata key {key}"))
    }

    /// Declare `strand` for every subject of `subject_kind`. Re-declaring with
    /// the same value kind is a no-op.
    ///
    /// # Errors
    /// Returns an error when the strand already exists with another value kind.
    pub fn declare_strand(
        &self,
        subject_kind: &str,
        strand: &str,
        value_kind: ValueKind,
    ) -> Result<StrandDeclaration> {
        if subject_kind.trim().is_empty() || strand.trim().is_empty() {
            return Err(anyhow!("subject kind and strand MUST be non-empty"));
        }
        if let Some(existing) = self.strand_value_kind(subject_kind, strand)? {
            if existing != value_kind {
                return Err(anyhow!(
                    "strand {strand} on {subject_kind} already holds {} values",
                    existing.as_str()
                ));
            }
        } else {
            self.conn
                .execute(
                    "INSERT INTO subject_strands(subject_kind, strand, value_kind) VALUES (?1, ?2, ?3)",
                    params![subject_kind, strand, value_kind.as_str()],
                )
                .with_context(|| format!("failed to declare strand {strand} on {subject_kind}"))?;
        }
        Ok(StrandDeclaration {
            subject_kind: subject_kind.to_string(),
            strand: strand.to_string(),
            value_kind,
        })
    }

    /// Strands declared for `subject_kind`, ordered by name.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_strands(&self, subject_kind: &str) -> Result<Vec<StrandDeclaration>> {
        let mut stmt = self.conn.prepare(
            "SELECT strand, value_kind FROM subject_strands WHERE subject_kind = ?1 ORDER BY strand ASC",
        )?;
        let mut rows = stmt.query(params![subject_kind])?;
        let mut strands = Vec::new();
        while let Some(row) = rows.next()? {
            let value_kind_raw: String = row.get(1)?;
            strands.push(StrandDeclaration {
                subject_kind: subject_kind.to_string(),
                strand: row.get(0)?,
                value_kind: parse_value_kind(&value_kind_raw)?,
            });
        }
        Ok(strands)
    }

    /// Create a package with the standard package strands.
    ///
    /// # Errors
    /// Returns an error for blank or duplicate names.
    pub fn create_package(&mut self, name: &str, description: &str) -> Result<SubjectRef> {
        if name.trim().is_empty() {
            return Err(anyhow!("package name MUST be non-empty"));
        }
        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO packages(name, description, created_at) VALUES (?1, ?2, ?3)",
            params![name, description, now_rfc3339()?],
        )
        .with_context(|| format!("failed to create package {name}"))?;
        for (strand, value_kind) in PACKAGE_STRANDS {
            tx.execute(
                "INSERT OR IGNORE INTO subject_strands(subject_kind, strand, value_kind)
                 VALUES (?1, ?2, ?3)",
                params![PACKAGE_KIND, strand, value_kind.as_str()],
            )
            .context("failed to declare package strands")?;
        }
        tx.commit().context("failed to commit package creation")?;
        Ok(SubjectRef::package(name))
    }

    /// Persist one validated entry.
    ///
    /// # Errors
    /// Returns an error when validation fails, the strand is undeclared or
    /// holds another value kind, the key is unknown, or the insert fails.
    pub fn write_entry(&self, entry: &MetadataEntry) -> Result<()> {
        entry.validate().map_err(|err| anyhow!("entry validation failed: {err}"))?;

        let value_kind = self
            .strand_value_kind(&entry.subject_kind, &entry.strand)?
            .ok_or_else(|| {
                anyhow!("strand {} is not declared for {}", entry.strand, entry.subject_kind)
            })?;
        if value_kind != entry.value.kind() {
            return Err(anyhow!(
                "strand {} holds {} values, got {}",
                entry.strand,
                value_kind.as_str(),
                entry.value.kind().as_str()
            ));
        }
        if entry.subject_kind == PACKAGE_KIND {
            if let Some(package) = &entry.element {
                self.require_package(&package.id)?;
            }
        }

        self.conn
            .execute(
                &format!(
                    "INSERT INTO metadata_entries({ENTRY_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    entry.entry_id.to_string(),
                    entry.subject_kind,
                    entry.element.as_ref().map(|element| element.id.as_str()),
                    entry.strand,
                    entry.key_id,
                    entry.value.kind().as_str(),
                    entry.value.as_str(),
                    rfc3339(entry.effective_from)?,
                    entry.effective_to.map(rfc3339).transpose()?,
                    entry.creator,
                    entry.approver,
                ],
            )
            .context("failed to insert metadata entry")?;
        Ok(())
    }

    /// Approve a pending entry.
    ///
    /// # Errors
    /// Returns an error when the entry does not exist or is already approved.
    pub fn approve_entry(&self, entry_id: EntryId, approver: &str) -> Result<()> {
        if approver.trim().is_empty() {
            return Err(anyhow!("approver MUST be non-empty"));
        }
        let updated = self
            .conn
            .execute(
                "UPDATE metadata_entries SET approver = ?2 WHERE entry_id = ?1 AND approver IS NULL",
                params![entry_id.to_string(), approver],
            )
            .context("failed to approve metadata entry")?;
        if updated == 0 {
            return Err(anyhow!("no pending entry with id {entry_id}"));
        }
        Ok(())
    }

    /// Every stored entry in `scope`, approved or not, newest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_entries(&self, scope: EntryScope<'_>) -> Result<Vec<MetadataEntry>> {
        let (kind, id) = scope_params(scope);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS}
             FROM metadata_entries
             WHERE subject_kind = ?1 AND subject_id IS ?2
             ORDER BY effective_from DESC, entry_id DESC"
        ))?;
        let mut rows = stmt.query(params![kind, id])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(entry_from_row(row)?);
        }
        Ok(entries)
    }

    /// # Errors
    /// Returns an error when the subject is its own parent, a package is
    /// involved, or the write fails.
    pub fn set_parent(&self, child: &SubjectRef, parent: &SubjectRef) -> Result<()> {
        if child.is_package() || parent.is_package() {
            return Err(anyhow!("packages cannot take part in parent lineage"));
        }
        if child == parent {
            return Err(anyhow!("{child} cannot be its own parent"));
        }
        self.conn
            .execute(
                "INSERT INTO subject_parents(subject_kind, subject_id, parent_kind, parent_id)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(subject_kind, subject_id)
                 DO UPDATE SET parent_kind = excluded.parent_kind, parent_id = excluded.parent_id",
                params![child.kind, child.id, parent.kind, parent.id],
            )
            .with_context(|| format!("failed to set parent of {child}"))?;
        Ok(())
    }

    /// Remove a parent link, returning whether one existed.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn clear_parent(&self, child: &SubjectRef) -> Result<bool> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM subject_parents WHERE subject_kind = ?1 AND subject_id = ?2",
                params![child.kind, child.id],
            )
            .with_context(|| format!("failed to clear parent of {child}"))?;
        Ok(removed > 0)
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn get_parent(&self, child: &SubjectRef) -> Result<Option<SubjectRef>> {
        self.conn
            .query_row(
                "SELECT parent_kind, parent_id FROM subject_parents
                 WHERE subject_kind = ?1 AND subject_id = ?2",
                params![child.kind, child.id],
                |row| Ok(SubjectRef::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .with_context(|| format!("failed to read parent of {child}"))
    }

    /// Append a package attachment after any existing ones and return its
    /// position.
    ///
    /// # Errors
    /// Returns an error for an invalid attachment, an unknown package, or a
    /// failed write.
    pub fn attach_package(
        &mut self,
        subject: &SubjectRef,
        attachment: &PackageAttachment,
    ) -> Result<i64> {
        attachment.validate().map_err(|err| anyhow!("attachment validation failed: {err}"))?;
        if subject.is_package() {
            return Err(anyhow!("packages cannot have packages attached"));
        }
        self.require_package(&attachment.package.id)?;

        let tx = self.conn.transaction().context("failed to start transaction")?;
        let position: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(position), 0) + 1 FROM package_attachments
                 WHERE subject_kind = ?1 AND subject_id = ?2",
                params![subject.kind, subject.id],
                |row| row.get(0),
            )
            .context("failed to compute attachment position")?;
        tx.execute(
            "INSERT INTO package_attachments(
                subject_kind, subject_id, package, position, effective_from, effective_to, approver
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                subject.kind,
                subject.id,
                attachment.package.id,
                position,
                rfc3339(attachment.effective_from)?,
                attachment.effective_to.map(rfc3339).transpose()?,
                attachment.approver,
            ],
        )
        .with_context(|| format!("failed to attach {} to {subject}", attachment.package))?;
        tx.commit().context("failed to commit package attachment")?;
        Ok(position)
    }

    /// Attachments in position order, active or not.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_attachments(&self, subject: &SubjectRef) -> Result<Vec<PackageAttachment>> {
        let mut stmt = self.conn.prepare(
            "SELECT package, effective_from, effective_to, approver
             FROM package_attachments
             WHERE subject_kind = ?1 AND subject_id = ?2
             ORDER BY position ASC",
        )?;
        let mut rows = stmt.query(params![subject.kind, subject.id])?;
        let mut attachments = Vec::new();
        while let Some(row) = rows.next()? {
            attachments.push(PackageAttachment {
                package: SubjectRef::package(row.get::<_, String>(0)?),
                effective_from: parse_rfc3339(&row.get::<_, String>(1)?)?,
                effective_to: row
                    .get::<_, Option<String>>(2)?
                    .map(|raw| parse_rfc3339(&raw))
                    .transpose()?,
                approver: row.get(3)?,
            });
        }
        Ok(attachments)
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let foreign_key_violations = stmt
            .query_map([], |row| {
                Ok(ForeignKeyViolation {
                    table: row.get(0)?,
                    rowid: row.get(1)?,
                    parent: row.get(2)?,
                    fk_index: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status: self.schema_status()?,
        })
    }

    fn strand_value_kind(&self, subject_kind: &str, strand: &str) -> Result<Option<ValueKind>> {
        let raw = self
            .conn
            .query_row(
                "SELECT value_kind FROM subject_strands WHERE subject_kind = ?1 AND strand = ?2",
                params![subject_kind, strand],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("failed to read strand declaration")?;
        raw.map(|raw| parse_value_kind(&raw)).transpose()
    }

    fn require_package(&self, name: &str) -> Result<()> {
        let exists = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM packages WHERE name = ?1)",
                params![name],
                |row| row.get::<_, i64>(0),
            )
            .with_context(|| format!("failed to check package {name}"))?;
        if exists == 1 {
            Ok(())
        } else {
            Err(anyhow!("unknown package: {name}"))
        }
    }
}

fn scope_params(scope: EntryScope<'_>) -> (&str, Option<&str>) {
    match scope {
        EntryScope::Subject(subject) => (subject.kind.as_str(), Some(subject.id.as_str())),
        EntryScope::Defaults { kind } => (kind, None),
    }
}

fn key_from_row(row: &Row<'_>) -> rusqlite::Result<MetadataKey> {
    Ok(MetadataKey {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        allow_multiple: row.get(3)?,
        cache_seconds: row.get(4)?,
    })
}

fn entry_from_row(row: &Row<'_>) -> Result<MetadataEntry> {
    let entry_id_raw: String = row.get(0)?;
    let subject_kind: String = row.get(1)?;
    let subject_id: Option<String> = row.get(2)?;
    let value_kind_raw: String = row.get(5)?;

    Ok(MetadataEntry {
        entry_id: parse_entry_id(&entry_id_raw)?,
        element: subject_id.map(|id| SubjectRef::new(subject_kind.clone(), id)),
        subject_kind,
        strand: row.get(3)?,
        key_id: row.get(4)?,
        value: MetadataValue::from_parts(parse_value_kind(&value_kind_raw)?, row.get(6)?),
        effective_from: parse_rfc3339(&row.get::<_, String>(7)?)?,
        effective_to: row.get::<_, Option<String>>(8)?.map(|raw| parse_rfc3339(&raw)).transpose()?,
        creator: row.get(9)?,
        approver: row.get(10)?,
    })
}

fn parse_value_kind(raw: &str) -> Result<ValueKind> {
    ValueKind::parse(raw).ok_or_else(|| anyhow!("unknown value_kind: {raw}"))
}

/// Parse an entry id in its ULID text form.
///
/// # Errors
/// Returns an error when `raw` is not a valid ULID.
pub fn parse_entry_id(raw: &str) -> Result<EntryId> {
    let parsed = Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))?;
    Ok(EntryId(parsed))
}

pub(crate) fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

/// # Errors
/// Returns an error when `value` is not RFC 3339.
pub fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::thread;

    use metadata_overlay_core::{
        KeyRegistry, MetadataSource, NoopCache, QueryCache, QueryResult, QueryType, Resolver,
    };
    use time::{Date, Duration, Month};

    use super::*;

    fn year(year: i32) -> Result<OffsetDateTime> {
        Ok(Date::from_calendar_date(year, Month::January, 1)?.midnight().assume_utc())
    }

    fn migrated_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        store.declare_strand("show", "text", ValueKind::Text)?;
        store.declare_strand("show", "images", ValueKind::Image)?;
        Ok(store)
    }

    fn mk_entry(
        subject: &SubjectRef,
        key: &MetadataKey,
        value: &str,
        effective_from: OffsetDateTime,
        effective_to: Option<OffsetDateTime>,
    ) -> MetadataEntry {
        MetadataEntry {
            entry_id: EntryId::new(),
            element: Some(subject.clone()),
            subject_kind: subject.kind.clone(),
            strand: "text".to_string(),
            key_id: key.id,
            value: MetadataValue::Text(value.to_string()),
            effective_from,
            effective_to,
            creator: "editor".to_string(),
            approver: Some("admin".to_string()),
        }
    }

    fn text(value: &str) -> QueryResult {
        QueryResult::Value(MetadataValue::Text(value.to_string()))
    }

    #[test]
    fn fresh_database_reports_pending_migrations() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        let before = store.schema_status()?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1, 2]);

        let after = store.migrate()?;
        assert_eq!(after.current_version, 2);
        assert!(after.pending_versions.is_empty());

        let again = store.migrate()?;
        assert_eq!(again, after);
        Ok(())
    }

    #[test]
    fn keys_round_trip_and_reject_duplicates() -> Result<()> {
        let store = migrated_store()?;
        let title = store.add_key("title", "Display title", false, 60)?;
        store.add_key("tag", "Free-form tags", true, 0)?;

        let names = store.list_keys()?.into_iter().map(|key| key.name).collect::<Vec<_>>();
        assert_eq!(names, vec!["tag".to_string(), "title".to_string()]);
        assert_eq!(store.find_key(&KeyRef::Id(title.id))?, Some(title.clone()));
        assert_eq!(KeyRegistry::get(&store, &KeyRef::from("title")), Ok(title));
        assert_eq!(
            KeyRegistry::get(&store, &KeyRef::from("missing")),
            Err(metadata_overlay_core::ResolveError::KeyNotFound("missing".to_string()))
        );

        assert!(store.add_key("title", "again", false, 0).is_err());
        assert!(store.add_key("two words", "", false, 0).is_err());
        Ok(())
    }

    #[test]
    fn strand_redeclaration_must_keep_value_kind() -> Result<()> {
        let store = migrated_store()?;
        store.declare_strand("show", "text", ValueKind::Text)?;
        assert!(store.declare_strand("show", "text", ValueKind::Image).is_err());

        let strands = store.list_strands("show")?;
        assert_eq!(
            strands.iter().map(|declared| declared.strand.as_str()).collect::<Vec<_>>(),
            vec!["images", "text"]
        );
        Ok(())
    }

    #[test]
    fn write_entry_enforces_strand_and_key() -> Result<()> {
        let store = migrated_store()?;
        let key = store.add_key("title", "", false, 0)?;
        let subject = SubjectRef::new("show", "1");

        let mut undeclared = mk_entry(&subject, &key, "x", year(2000)?, None);
        undeclared.strand = "audio".to_string();
        assert!(store.write_entry(&undeclared).is_err());

        let mut wrong_kind = mk_entry(&subject, &key, "x", year(2000)?, None);
        wrong_kind.strand = "images".to_string();
        assert!(store.write_entry(&wrong_kind).is_err());

        let mut unknown_key = mk_entry(&subject, &key, "x", year(2000)?, None);
        unknown_key.key_id = 999;
        assert!(store.write_entry(&unknown_key).is_err());

        let inverted = mk_entry(&subject, &key, "x", year(2010)?, Some(year(2000)?));
        assert!(store.write_entry(&inverted).is_err());

        store.write_entry(&mk_entry(&subject, &key, "ok", year(2000)?, None))?;
        assert_eq!(store.list_entries(EntryScope::Subject(&subject))?.len(), 1);
        Ok(())
    }

    #[test]
    fn pending_entries_are_invisible_until_approved() -> Result<()> {
        let store = migrated_store()?;
        let key = store.add_key("title", "", false, 0)?;
        let subject = SubjectRef::new("show", "1");
        let mut pending = mk_entry(&subject, &key, "Pending title", year(2000)?, None);
        pending.approver = None;
        store.write_entry(&pending)?;

        let before = store
            .active_entries(EntryScope::Subject(&subject), "text", &key, year(2012)?)
            .map_err(|err| anyhow!("{err}"))?;
        assert!(before.is_empty());

        store.approve_entry(pending.entry_id, "admin")?;
        assert!(store.approve_entry(pending.entry_id, "admin").is_err());

        let after = store
            .active_entries(EntryScope::Subject(&subject), "text", &key, year(2012)?)
            .map_err(|err| anyhow!("{err}"))?;
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].approver.as_deref(), Some("admin"));
        Ok(())
    }

    #[test]
    fn resolver_answers_scenarios_from_sqlite() -> Result<()> {
        let mut store = migrated_store()?;
        let single = store.add_key("single", "", false, 0)?;
        let multiple = store.add_key("multiple", "", true, 0)?;
        store.add_key("nothere", "", false, 0)?;
        let subject = SubjectRef::new("show", "s");

        for (value, from, to) in [
            ("zillyhoo", 2005, Some(2010)),
            ("moof!", 2010, None),
            ("bank", 2015, Some(2030)),
            ("wello", 2030, None),
        ] {
            let to = to.map(year).transpose()?;
            store.write_entry(&mk_entry(&subject, &single, value, year(from)?, to))?;
        }
        store.write_entry(&mk_entry(&subject, &multiple, "elementA", year(2001)?, None))?;
        store.write_entry(&mk_entry(&subject, &multiple, "elementB", year(2009)?, None))?;

        let package = store.create_package("p", "defaults for shows")?;
        let nothere = store.find_key(&KeyRef::from("nothere"))?.ok_or_else(|| anyhow!("nothere key"))?;
        store.write_entry(&mk_entry(&package, &nothere, "yes it is!", year(2000)?, None))?;
        store.attach_package(
            &subject,
            &PackageAttachment {
                package: package.clone(),
                effective_from: year(2000)?,
                effective_to: None,
                approver: Some("admin".to_string()),
            },
        )?;

        let resolver = Resolver::new(&store, &store, &NoopCache);
        let at = |key: &str, when: i32| -> Result<QueryResult> {
            resolver
                .query(subject.clone(), "text", key, QueryType::Value, Some(year(when)?))
                .map_err(|err| anyhow!("{err}"))
        };

        assert_eq!(at("single", 2006)?, text("zillyhoo"));
        assert_eq!(at("single", 2020)?, text("bank"));
        assert_eq!(at("single", 2422)?, text("wello"));
        assert!(at("single", 1970).is_err());
        assert_eq!(
            at("multiple", 2012)?,
            QueryResult::Values(vec![
                MetadataValue::Text("elementB".to_string()),
                MetadataValue::Text("elementA".to_string()),
            ])
        );
        assert_eq!(at("nothere", 2012)?, text("yes it is!"));
        Ok(())
    }

    #[test]
    fn parent_links_feed_inheritance() -> Result<()> {
        let store = migrated_store()?;
        let key = store.add_key("title", "", false, 0)?;
        let child = SubjectRef::new("show", "child");
        let parent = SubjectRef::new("show", "parent");
        store.write_entry(&mk_entry(&parent, &key, "Inherited", year(2000)?, None))?;

        assert!(store.set_parent(&child, &child).is_err());
        store.set_parent(&child, &parent)?;
        assert_eq!(store.get_parent(&child)?, Some(parent.clone()));

        let resolver = Resolver::new(&store, &store, &NoopCache);
        let inherited = resolver
            .metadata_at(child.clone(), year(2012)?)
            .title()
            .map_err(|err| anyhow!("{err}"))?;
        assert_eq!(
            inherited.and_then(|found| found.first().cloned()),
            Some(MetadataValue::Text("Inherited".to_string()))
        );

        assert!(store.clear_parent(&child)?);
        assert!(!store.clear_parent(&child)?);
        assert_eq!(store.get_parent(&child)?, None);
        Ok(())
    }

    #[test]
    fn attachments_keep_order_and_require_known_package() -> Result<()> {
        let mut store = migrated_store()?;
        let subject = SubjectRef::new("show", "1");
        let first = store.create_package("first", "")?;
        let second = store.create_package("second", "")?;
        assert!(store.create_package("first", "").is_err());

        for package in [&first, &second] {
            store.attach_package(
                &subject,
                &PackageAttachment {
                    package: package.clone(),
                    effective_from: year(2000)?,
                    effective_to: None,
                    approver: Some("admin".to_string()),
                },
            )?;
        }
        let unknown = PackageAttachment {
            package: SubjectRef::package("ghost"),
            effective_from: year(2000)?,
            effective_to: None,
            approver: None,
        };
        assert!(store.attach_package(&subject, &unknown).is_err());

        let packages = store
            .list_attachments(&subject)?
            .into_iter()
            .map(|attachment| attachment.package)
            .collect::<Vec<_>>();
        assert_eq!(packages, vec![first, second]);
        Ok(())
    }

    #[test]
    fn query_cache_honours_ttl_and_upserts() -> Result<()> {
        let store = migrated_store()?;
        let cache: &dyn QueryCache = &store;

        cache.set("k", &QueryResult::Count(1), Duration::minutes(5)).map_err(|err| anyhow!("{err}"))?;
        cache.set("k", &QueryResult::Count(2), Duration::minutes(5)).map_err(|err| anyhow!("{err}"))?;
        assert_eq!(cache.get("k").map_err(|err| anyhow!("{err}"))?, Some(QueryResult::Count(2)));

        cache.set("zero", &QueryResult::Count(3), Duration::ZERO).map_err(|err| anyhow!("{err}"))?;
        assert_eq!(cache.get("zero").map_err(|err| anyhow!("{err}"))?, None);

        store.store_result("stale", &QueryResult::Exists(true), Duration::seconds(-10))?;
        assert_eq!(cache.get("stale").map_err(|err| anyhow!("{err}"))?, None);
        assert_eq!(store.purge_query_cache()?, 1);
        assert_eq!(store.clear_query_cache()?, 1);
        Ok(())
    }

    #[test]
    fn integrity_check_reports_clean_database() -> Result<()> {
        let store = migrated_store()?;
        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        assert_eq!(report.schema_status.current_version, 2);
        Ok(())
    }

    #[test]
    fn concurrent_writers_and_resolvers_preserve_integrity() -> Result<()> {
        let db_path =
            std::env::temp_dir().join(format!("metadata-overlay-concurrency-{}.sqlite3", Ulid::new()));
        let key = {
            let mut init = SqliteStore::open(&db_path)?;
            init.migrate()?;
            init.declare_strand("show", "text", ValueKind::Text)?;
            init.add_key("tag", "", true, 60)?
        };

        let writer_threads = 4;
        let writes_per_thread = 10;
        let mut handles = Vec::new();

        for writer in 0..writer_threads {
            let path = db_path.clone();
            let key = key.clone();
            handles.push(thread::spawn(move || -> Result<()> {
                let store = SqliteStore::open(&path)?;
                let subject = SubjectRef::new("show", "shared");
                for index in 0..writes_per_thread {
                    let value = format!("tag-{writer}-{index}");
                    store.write_entry(&mk_entry(&subject, &key, &value, year(2000)?, None))?;
                }
                Ok(())
            }));
        }

        for _ in 0..2 {
            let path = db_path.clone();
            handles.push(thread::spawn(move || -> Result<()> {
                let store = SqliteStore::open(&path)?;
                let resolver = Resolver::new(&store, &store, &store);
                for _ in 0..10 {
                    resolver
                        .query(SubjectRef::new("show", "shared"), "text", "tag", QueryType::Count, None)
                        .map_err(|err| anyhow!("{err}"))?;
                }
                Ok(())
            }));
        }

        for handle in handles {
            let Ok(thread_result) = handle.join() else {
                return Err(anyhow!("concurrency thread panicked"));
            };
            thread_result?;
        }

        let store = SqliteStore::open(&db_path)?;
        let subject = SubjectRef::new("show", "shared");
        assert_eq!(store.list_entries(EntryScope::Subject(&subject))?.len(), writer_threads * writes_per_thread);
        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());

        for suffix in ["", "-wal", "-shm"] {
            let path = std::path::PathBuf::from(format!("{}{}", db_path.display(), suffix));
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to cleanup sqlite file {}", path.display()))?;
            }
        }
        Ok(())
    }
}
