use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{EntryId, ResolveError, SubjectRef};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Text,
    Image,
}

impl ValueKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            _ => None,
        }
    }
}

/// Strand payload. Images are stored as a path relative to the image root.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MetadataValue {
    Text(String),
    Image(String),
}

impl MetadataValue {
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Text(_) => ValueKind::Text,
            Self::Image(_) => ValueKind::Image,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Text(value) | Self::Image(value) => value,
        }
    }

    #[must_use]
    pub fn from_parts(kind: ValueKind, value: String) -> Self {
        match kind {
            ValueKind::Text => Self::Text(value),
            ValueKind::Image => Self::Image(value),
        }
    }
}

impl Display for MetadataValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// `[from, to)` membership, with an open end when `to` is absent.
fn covers(from: OffsetDateTime, to: Option<OffsetDateTime>, date: OffsetDateTime) -> bool {
    from <= date && to.map_or(true, |end| date < end)
}

fn validate_range(from: OffsetDateTime, to: Option<OffsetDateTime>) -> Result<(), ResolveError> {
    match to {
        Some(end) if end <= from => Err(ResolveError::Validation(
            "effective_to MUST be after effective_from".to_string(),
        )),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MetadataEntry {
    pub entry_id: EntryId,
    /// Owning subject; `None` marks a kind-wide default entry.
    pub element: Option<SubjectRef>,
    /// Kind whose strand model this entry belongs to.
    pub subject_kind: String,
    pub strand: String,
    pub key_id: i64,
    pub value: MetadataValue,
    #[serde(with = "time::serde::rfc3339")]
    pub effective_from: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub effective_to: Option<OffsetDateTime>,
    pub creator: String,
    pub approver: Option<String>,
}

impl MetadataEntry {
    #[must_use]
    pub fn is_approved(&self) -> bool {
        self.approver.is_some()
    }

    /// Approved and effective at `date`.
    #[must_use]
    pub fn is_active_at(&self, date: OffsetDateTime) -> bool {
        self.is_approved() && covers(self.effective_from, self.effective_to, date)
    }

    #[must_use]
    pub fn is_default(&self) -> bool {
        self.element.is_none()
    }

    /// Validate an entry before it is stored.
    ///
    /// # Errors
    /// Returns [`ResolveError::Validation`] when the range is inverted, the
    /// creator or strand is blank, or the element kind disagrees with
    /// `subject_kind`.
    pub fn validate(&self) -> Result<(), ResolveError> {
        validate_range(self.effective_from, self.effective_to)?;

        if self.creator.trim().is_empty() {
            return Err(ResolveError::Validation(
                "creator MUST be provided for every entry".to_string(),
            ));
        }

        if self.strand.trim().is_empty() {
            return Err(ResolveError::Validation("strand MUST be provided".to_string()));
        }

        if let Some(approver) = &self.approver {
            if approver.trim().is_empty() {
                return Err(ResolveError::Validation(
                    "approver MUST be non-empty when present".to_string(),
                ));
            }
        }

        if let Some(element) = &self.element {
            if element.kind != self.subject_kind {
                return Err(ResolveError::Validation(format!(
                    "element kind `{}` does not match subject_kind `{}`",
                    element.kind, self.subject_kind
                )));
            }
        }

        Ok(())
    }
}

/// A package attached to a subject for a bounded period.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PackageAttachment {
    pub package: SubjectRef,
    #[serde(with = "time::serde::rfc3339")]
    pub effective_from: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub effective_to: Option<OffsetDateTime>,
    pub approver: Option<String>,
}

impl PackageAttachment {
    #[must_use]
    pub fn is_active_at(&self, date: OffsetDateTime) -> bool {
        self.approver.is_some() && covers(self.effective_from, self.effective_to, date)
    }

    /// # Errors
    /// Returns [`ResolveError::Validation`] when the target is not a package or
    /// the range is inverted.
    pub fn validate(&self) -> Result<(), ResolveError> {
        if !self.package.is_package() {
            return Err(ResolveError::Validation(format!(
                "attachment target {} is not a package",
                self.package
            )));
        }
        validate_range(self.effective_from, self.effective_to)
    }
}

fn newest_first_cmp(lhs: &MetadataEntry, rhs: &MetadataEntry) -> Ordering {
    rhs.effective_from.cmp(&lhs.effective_from).then_with(|| rhs.entry_id.cmp(&lhs.entry_id))
}

/// Sort newest `effective_from` first; ties go to the later entry id.
pub fn newest_first(entries: &mut [MetadataEntry]) {
    entries.sort_by(newest_first_cmp);
}

/// Filter to entries active at `date`, newest first.
pub fn select_active<'a, I>(entries: I, date: OffsetDateTime) -> Vec<MetadataEntry>
where
    I: IntoIterator<Item = &'a MetadataEntry>,
{
    let mut active = entries
        .into_iter()
        .filter(|entry| entry.is_active_at(date))
        .cloned()
        .collect::<Vec<_>>();
    newest_first(&mut active);
    active
}
