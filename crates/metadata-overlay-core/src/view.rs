use serde::Serialize;
use time::OffsetDateTime;

use crate::key::KeyRef;
use crate::query::{Metadatum, QueryResult, QueryType};
use crate::resolver::Resolver;
use crate::{ResolveError, SubjectRef};

/// Read-only `view[strand][key]` projection of one subject at one date.
pub struct MetadataView<'r, 'a> {
    resolver: &'r Resolver<'a>,
    subject: SubjectRef,
    date: Option<OffsetDateTime>,
}

impl<'r, 'a> MetadataView<'r, 'a> {
    pub(crate) fn new(
        resolver: &'r Resolver<'a>,
        subject: SubjectRef,
        date: Option<OffsetDateTime>,
    ) -> Self {
        Self { resolver, subject, date }
    }

    #[must_use]
    pub fn subject(&self) -> &SubjectRef {
        &self.subject
    }

    #[must_use]
    pub fn date(&self) -> Option<OffsetDateTime> {
        self.date
    }

    /// # Errors
    /// Returns an error when the source cannot list strands.
    pub fn strands(&self) -> Result<Vec<String>, ResolveError> {
        self.resolver.source().strands(&self.subject)
    }

    /// # Errors
    /// [`ResolveError::UnknownStrand`] when the subject does not declare `name`.
    pub fn strand(&self, name: &str) -> Result<StrandView<'_, 'a>, ResolveError> {
        if !self.resolver.source().has_strand(&self.subject, name)? {
            return Err(ResolveError::UnknownStrand {
                subject: self.subject.clone(),
                strand: name.to_string(),
            });
        }
        Ok(StrandView { view: self, strand: name.to_string() })
    }

    /// Search every strand for `key`: the default strand first, then the rest
    /// in lexical order. Returns the first strand that has a value.
    ///
    /// # Errors
    /// Returns [`ResolveError::KeyNotFound`] for unregistered keys and any hard
    /// resolution error.
    pub fn metadatum(&self, key: impl Into<KeyRef>) -> Result<Option<Metadatum>, ResolveError> {
        let key = key.into();
        let default_strand = self.resolver.config().default_strand.as_str();
        let mut strands = self.strands()?;
        strands.sort_by_key(|strand| strand != default_strand);

        for strand in strands {
            if let Some(found) = self.strand(&strand)?.get(key.clone())? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// # Errors
    /// See [`Self::metadatum`].
    pub fn title(&self) -> Result<Option<Metadatum>, ResolveError> {
        self.default_strand_value("title")
    }

    /// # Errors
    /// See [`Self::metadatum`].
    pub fn description(&self) -> Result<Option<Metadatum>, ResolveError> {
        self.default_strand_value("description")
    }

    /// Image reference usable in place of the title, when one is set.
    ///
    /// # Errors
    /// See [`Self::metadatum`].
    pub fn title_image(&self) -> Result<Option<Metadatum>, ResolveError> {
        self.default_strand_value("title_image")
    }

    /// Look `key` up on both the image and the text strand.
    ///
    /// A subject without an image strand simply has no image.
    ///
    /// # Errors
    /// Returns an error for unknown keys, a missing default strand, or hard
    /// resolution failures.
    pub fn image_or_text(&self, key: impl Into<KeyRef>) -> Result<ImageOrText, ResolveError> {
        let key = key.into();
        let config = self.resolver.config();
        let image = match self.strand(&config.image_strand) {
            Ok(strand) => strand.get(key.clone())?,
            Err(ResolveError::UnknownStrand { .. }) => None,
            Err(err) => return Err(err),
        };
        let text = self.strand(&config.default_strand)?.get(key)?;
        Ok(ImageOrText { image, text })
    }

    fn default_strand_value(&self, key: &str) -> Result<Option<Metadatum>, ResolveError> {
        self.strand(&self.resolver.config().default_strand)?.get(key)
    }
}

/// One strand of a [`MetadataView`].
pub struct StrandView<'v, 'a> {
    view: &'v MetadataView<'v, 'a>,
    strand: String,
}

impl StrandView<'_, '_> {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.strand
    }

    /// Resolve `key`. `None` means no hook had a value; an empty multi-value
    /// answer also reads as `None`.
    ///
    /// # Errors
    /// Returns [`ResolveError::KeyNotFound`] for unregistered keys and any hard
    /// resolution error.
    pub fn get(&self, key: impl Into<KeyRef>) -> Result<Option<Metadatum>, ResolveError> {
        Ok(absent_as_none(self.run(key, QueryType::Value))?
            .and_then(QueryResult::into_metadatum)
            .filter(|found| !found.is_empty()))
    }

    /// # Errors
    /// See [`Self::get`].
    pub fn contains(&self, key: impl Into<KeyRef>) -> Result<bool, ResolveError> {
        Ok(absent_as_none(self.run(key, QueryType::Exists))?
            .and_then(|result| result.as_exists())
            .unwrap_or(false))
    }

    /// # Errors
    /// See [`Self::get`].
    pub fn count(&self, key: impl Into<KeyRef>) -> Result<u64, ResolveError> {
        Ok(absent_as_none(self.run(key, QueryType::Count))?
            .and_then(|result| result.as_count())
            .unwrap_or(0))
    }

    fn run(&self, key: impl Into<KeyRef>, query_type: QueryType) -> Result<QueryResult, ResolveError> {
        let resolver = self.view.resolver;
        let query = resolver.build_query(
            self.view.subject.clone(),
            &self.strand,
            key,
            query_type,
            self.view.date,
        )?;
        resolver.run_query(&query)
    }
}

/// A query nobody could answer reads as an absent key.
fn absent_as_none(
    result: Result<QueryResult, ResolveError>,
) -> Result<Option<QueryResult>, ResolveError> {
    match result {
        Ok(result) => Ok(Some(result)),
        Err(err) if err.is_query_failure() => Ok(None),
        Err(err) => Err(err),
    }
}

/// Both candidates for rendering a key as an image with a text fallback.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct ImageOrText {
    pub image: Option<Metadatum>,
    pub text: Option<Metadatum>,
}

impl ImageOrText {
    /// The image when there is one, else the text.
    #[must_use]
    pub fn preferred(&self) -> Option<&Metadatum> {
        self.image.as_ref().or(self.text.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NoopCache;
    use crate::entry::MetadataValue;
    use crate::test_support::{show, text, year, Fixture};

    fn fixture() -> Fixture {
        let mut fixture = Fixture::new();
        let subject = show("s");
        fixture.add(&subject, "text", "title", "Late Night Jazz", year(2000), None);
        fixture.add(&subject, "text", "multiple", "jazz", year(2001), None);
        fixture.add(&subject, "text", "multiple", "late", year(2002), None);
        fixture.add(&subject, "images", "title", "logos/jazz.png", year(2000), None);
        fixture.add(&subject, "images", "title_image", "logos/banner.png", year(2000), None);
        fixture
    }

    #[test]
    fn strand_lookup_and_membership() {
        let fixture = fixture();
        let resolver = Resolver::new(&fixture.keys, &fixture.source, &NoopCache);
        let view = resolver.metadata_at(show("s"), year(2012));
        let strand = view.strand("text").unwrap_or_else(|err| panic!("text strand should exist: {err}"));

        assert_eq!(strand.get("title"), Ok(Some(Metadatum::One(text("Late Night Jazz")))));
        assert_eq!(strand.get("description"), Ok(None));
        assert_eq!(strand.contains("title"), Ok(true));
        assert_eq!(strand.contains("description"), Ok(false));
        assert_eq!(strand.count("multiple"), Ok(2));
        assert_eq!(
            strand.get("multiple"),
            Ok(Some(Metadatum::Many(vec![text("late"), text("jazz")])))
        );
    }

    #[test]
    fn unknown_strand_is_an_error() {
        let fixture = fixture();
        let resolver = Resolver::new(&fixture.keys, &fixture.source, &NoopCache);
        let view = resolver.metadata(show("s"));

        match view.strand("audio") {
            Err(ResolveError::UnknownStrand { strand, .. }) => assert_eq!(strand, "audio"),
            Err(err) => panic!("unexpected error: {err}"),
            Ok(_) => panic!("audio strand should not exist"),
        }
    }

    #[test]
    fn unknown_key_propagates_from_lookup() {
        let fixture = fixture();
        let resolver = Resolver::new(&fixture.keys, &fixture.source, &NoopCache);
        let view = resolver.metadata(show("s"));
        let strand = view.strand("text").unwrap_or_else(|err| panic!("text strand should exist: {err}"));

        assert_eq!(strand.get("bogus"), Err(ResolveError::KeyNotFound("bogus".to_string())));
        assert_eq!(strand.contains("bogus"), Err(ResolveError::KeyNotFound("bogus".to_string())));
    }

    #[test]
    fn metadatum_prefers_default_strand() {
        let fixture = fixture();
        let resolver = Resolver::new(&fixture.keys, &fixture.source, &NoopCache);
        let view = resolver.metadata_at(show("s"), year(2012));

        assert_eq!(view.metadatum("title"), Ok(Some(Metadatum::One(text("Late Night Jazz")))));
        assert_eq!(
            view.metadatum("title_image"),
            Ok(Some(Metadatum::One(MetadataValue::Image("logos/banner.png".to_string()))))
        );
        assert_eq!(view.metadatum("description"), Ok(None));
    }

    #[test]
    fn common_accessors_read_default_strand() {
        let fixture = fixture();
        let resolver = Resolver::new(&fixture.keys, &fixture.source, &NoopCache);
        let view = resolver.metadata_at(show("s"), year(2012));

        assert_eq!(view.title(), Ok(Some(Metadatum::One(text("Late Night Jazz")))));
        assert_eq!(view.description(), Ok(None));
        assert_eq!(view.title_image(), Ok(None));
    }

    #[test]
    fn image_or_text_prefers_image() {
        let fixture = fixture();
        let resolver = Resolver::new(&fixture.keys, &fixture.source, &NoopCache);
        let view = resolver.metadata_at(show("s"), year(2012));

        let both = view.image_or_text("title").unwrap_or_else(|err| panic!("lookup should work: {err}"));
        assert_eq!(
            both.preferred(),
            Some(&Metadatum::One(MetadataValue::Image("logos/jazz.png".to_string())))
        );
        assert_eq!(both.text, Some(Metadatum::One(text("Late Night Jazz"))));

        let text_only =
            view.image_or_text("multiple").unwrap_or_else(|err| panic!("lookup should work: {err}"));
        assert_eq!(text_only.image, None);
        assert_eq!(
            text_only.preferred(),
            Some(&Metadatum::Many(vec![text("late"), text("jazz")]))
        );
    }

    #[test]
    fn empty_multi_value_strand_is_absent() {
        let mut fixture = Fixture::new();
        let subject = show("s");
        fixture.add(&subject, "images", "multiple", "a.png", year(2000), None);
        let resolver = Resolver::new(&fixture.keys, &fixture.source, &NoopCache);
        let view = resolver.metadata_at(subject, year(2012));
        let text_strand =
            view.strand("text").unwrap_or_else(|err| panic!("text strand should exist: {err}"));

        assert_eq!(text_strand.get("multiple"), Ok(None));
        assert_eq!(text_strand.contains("multiple"), Ok(false));
        assert_eq!(
            view.metadatum("multiple"),
            Ok(Some(Metadatum::Many(vec![MetadataValue::Image("a.png".to_string())])))
        );
    }

    #[test]
    fn view_lists_declared_strands() {
        let fixture = fixture();
        let resolver = Resolver::new(&fixture.keys, &fixture.source, &NoopCache);
        let view = resolver.metadata(show("s"));
        assert_eq!(view.strands(), Ok(vec!["images".to_string(), "text".to_string()]));
        assert_eq!(view.date(), None);
    }
}
