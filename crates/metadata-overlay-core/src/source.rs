use std::collections::{BTreeMap, BTreeSet};

use time::OffsetDateTime;

use crate::entry::{select_active, MetadataEntry, PackageAttachment};
use crate::key::MetadataKey;
use crate::{ResolveError, SubjectRef};

/// Whose entries to fetch.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EntryScope<'a> {
    /// Entries owned by one subject.
    Subject(&'a SubjectRef),
    /// Element-less defaults for every subject of `kind`.
    Defaults { kind: &'a str },
}

impl EntryScope<'_> {
    fn matches(&self, entry: &MetadataEntry) -> bool {
        match self {
            Self::Subject(subject) => {
                entry.subject_kind == subject.kind && entry.element.as_ref() == Some(*subject)
            }
            Self::Defaults { kind } => entry.subject_kind == *kind && entry.element.is_none(),
        }
    }
}

/// Everything the resolver needs to know about subjects and their entries.
pub trait MetadataSource {
    /// Strand names declared for the subject's kind, in lexical order.
    ///
    /// # Errors
    /// Returns an error when the backing store fails.
    fn strands(&self, subject: &SubjectRef) -> Result<Vec<String>, ResolveError>;

    /// Approved entries active at `date`, newest `effective_from` first.
    ///
    /// # Errors
    /// Returns an error when the backing store fails.
    fn active_entries(
        &self,
        scope: EntryScope<'_>,
        strand: &str,
        key: &MetadataKey,
        date: OffsetDateTime,
    ) -> Result<Vec<MetadataEntry>, ResolveError>;

    /// # Errors
    /// Returns an error when the backing store fails.
    fn parent(&self, _subject: &SubjectRef) -> Result<Option<SubjectRef>, ResolveError> {
        Ok(None)
    }

    /// Package attachments in attachment order. Inactive ones are included;
    /// the caller filters by date.
    ///
    /// # Errors
    /// Returns an error when the backing store fails.
    fn package_attachments(
        &self,
        _subject: &SubjectRef,
    ) -> Result<Vec<PackageAttachment>, ResolveError> {
        Ok(Vec::new())
    }

    /// # Errors
    /// Returns an error when the backing store fails.
    fn has_strand(&self, subject: &SubjectRef, strand: &str) -> Result<bool, ResolveError> {
        Ok(self.strands(subject)?.iter().any(|declared| declared == strand))
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    strands: BTreeMap<String, BTreeSet<String>>,
    entries: Vec<MetadataEntry>,
    parents: BTreeMap<SubjectRef, SubjectRef>,
    attachments: BTreeMap<SubjectRef, Vec<PackageAttachment>>,
}

impl InMemorySource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare strands for every subject of `kind`.
    pub fn declare_strands(&mut self, kind: &str, strands: &[&str]) -> &mut Self {
        let declared = self.strands.entry(kind.to_string()).or_default();
        declared.extend(strands.iter().map(|strand| (*strand).to_string()));
        self
    }

    /// # Errors
    /// Returns [`ResolveError::Validation`] when the entry is invalid or its
    /// strand is not declared for its kind.
    pub fn add_entry(&mut self, entry: MetadataEntry) -> Result<&mut Self, ResolveError> {
        entry.validate()?;
        let declared = self
            .strands
            .get(&entry.subject_kind)
            .is_some_and(|strands| strands.contains(&entry.strand));
        if !declared {
            return Err(ResolveError::Validation(format!(
                "strand `{}` is not declared for kind `{}`",
                entry.strand, entry.subject_kind
            )));
        }
        self.entries.push(entry);
        Ok(self)
    }

    /// # Errors
    /// Returns [`ResolveError::Validation`] when the subject is its own parent
    /// or either side is a package.
    pub fn set_parent(
        &mut self,
        child: SubjectRef,
        parent: SubjectRef,
    ) -> Result<&mut Self, ResolveError> {
        if child == parent {
            return Err(ResolveError::Validation(format!("{child} cannot be its own parent")));
        }
        if child.is_package() || parent.is_package() {
            return Err(ResolveError::Validation("packages have no parents".to_string()));
        }
        self.parents.insert(child, parent);
        Ok(self)
    }

    /// # Errors
    /// Returns [`ResolveError::Validation`] for an invalid attachment.
    pub fn attach_package(
        &mut self,
        subject: SubjectRef,
        attachment: PackageAttachment,
    ) -> Result<&mut Self, ResolveError> {
        attachment.validate()?;
        self.attachments.entry(subject).or_default().push(attachment);
        Ok(self)
    }
}

impl MetadataSource for InMemorySource {
    fn strands(&self, subject: &SubjectRef) -> Result<Vec<String>, ResolveError> {
        Ok(self
            .strands
            .get(&subject.kind)
            .map(|strands| strands.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn active_entries(
        &self,
        scope: EntryScope<'_>,
        strand: &str,
        key: &MetadataKey,
        date: OffsetDateTime,
    ) -> Result<Vec<MetadataEntry>, ResolveError> {
        Ok(select_active(
            self.entries.iter().filter(|entry| {
                entry.strand == strand && entry.key_id == key.id && scope.matches(entry)
            }),
            date,
        ))
    }

    fn parent(&self, subject: &SubjectRef) -> Result<Option<SubjectRef>, ResolveError> {
        Ok(self.parents.get(subject).cloned())
    }

    fn package_attachments(
        &self,
        subject: &SubjectRef,
    ) -> Result<Vec<PackageAttachment>, ResolveError> {
        Ok(self.attachments.get(subject).cloned().unwrap_or_default())
    }
}
