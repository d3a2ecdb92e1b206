use time::{Date, Month, OffsetDateTime};

use crate::entry::{MetadataEntry, MetadataValue, PackageAttachment};
use crate::key::{InMemoryKeyRegistry, KeyRef, KeyRegistry, MetadataKey};
use crate::source::InMemorySource;
use crate::{EntryId, SubjectRef};

pub(crate) fn year(year: i32) -> OffsetDateTime {
    match Date::from_calendar_date(year, Month::January, 1) {
        Ok(date) => date.midnight().assume_utc(),
        Err(err) => panic!("invalid fixture year {year}: {err}"),
    }
}

pub(crate) fn text(value: &str) -> MetadataValue {
    MetadataValue::Text(value.to_string())
}

pub(crate) fn entry(
    kind: &str,
    id: Option<&str>,
    strand: &str,
    key_id: i64,
    value: &str,
    effective_from: OffsetDateTime,
    effective_to: Option<OffsetDateTime>,
) -> MetadataEntry {
    let value = if strand == "images" {
        MetadataValue::Image(value.to_string())
    } else {
        text(value)
    };
    MetadataEntry {
        entry_id: EntryId::new(),
        element: id.map(|id| SubjectRef::new(kind, id)),
        subject_kind: kind.to_string(),
        strand: strand.to_string(),
        key_id,
        value,
        effective_from,
        effective_to,
        creator: "editor".to_string(),
        approver: Some("admin".to_string()),
    }
}

/// Keys, subjects and entries shared by resolver and view tests.
pub(crate) struct Fixture {
    pub(crate) keys: InMemoryKeyRegistry,
    pub(crate) source: InMemorySource,
}

impl Fixture {
    pub(crate) fn new() -> Self {
        let mut keys = InMemoryKeyRegistry::new();
        for (name, allow_multiple, cache_seconds) in [
            ("single", false, 300),
            ("multiple", true, 300),
            ("nothere", false, 300),
            ("title", false, 0),
            ("description", false, 0),
            ("title_image", false, 0),
        ] {
            if let Err(err) = keys.define(name, "", allow_multiple, cache_seconds) {
                panic!("fixture key {name} should register: {err}");
            }
        }

        let mut source = InMemorySource::new();
        source.declare_strands("show", &["text", "images"]);
        source.declare_strands(crate::PACKAGE_KIND, &["text", "images"]);

        Self { keys, source }
    }

    pub(crate) fn key(&self, name: &str) -> MetadataKey {
        self.keys
            .get(&KeyRef::from(name))
            .unwrap_or_else(|err| panic!("fixture key {name} should exist: {err}"))
    }

    pub(crate) fn add(
        &mut self,
        subject: &SubjectRef,
        strand: &str,
        key: &str,
        value: &str,
        effective_from: OffsetDateTime,
        effective_to: Option<OffsetDateTime>,
    ) {
        let key_id = self.key(key).id;
        let fixture = entry(
            &subject.kind,
            Some(&subject.id),
            strand,
            key_id,
            value,
            effective_from,
            effective_to,
        );
        if let Err(err) = self.source.add_entry(fixture) {
            panic!("fixture entry should be accepted: {err}");
        }
    }

    pub(crate) fn add_default(&mut self, kind: &str, strand: &str, key: &str, value: &str) {
        let key_id = self.key(key).id;
        if let Err(err) = self.source.add_entry(entry(kind, None, strand, key_id, value, year(1990), None)) {
            panic!("fixture default should be accepted: {err}");
        }
    }

    pub(crate) fn parent(&mut self, child: &SubjectRef, parent: &SubjectRef) {
        if let Err(err) = self.source.set_parent(child.clone(), parent.clone()) {
            panic!("fixture parent should be accepted: {err}");
        }
    }

    pub(crate) fn attach(
        &mut self,
        subject: &SubjectRef,
        package: &SubjectRef,
        effective_from: OffsetDateTime,
        effective_to: Option<OffsetDateTime>,
    ) {
        let attachment = PackageAttachment {
            package: package.clone(),
            effective_from,
            effective_to,
            approver: Some("admin".to_string()),
        };
        if let Err(err) = self.source.attach_package(subject.clone(), attachment) {
            panic!("fixture attachment should be accepted: {err}");
        }
    }
}

pub(crate) fn show(id: &str) -> SubjectRef {
    SubjectRef::new("show", id)
}
