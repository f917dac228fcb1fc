//! Point-in-time view of the site content as seen by the card pipeline.
//!
//! A [`Snapshot`] maps entity ids to [`PageRecord`]s and keeps per-locale tag
//! counts. Only the fields exposed through [`CardFields`] influence the
//! rendered card; everything else on a record (ordering hints, edit
//! timestamps) may change freely without triggering regeneration.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::artifact::{ArtifactKey, is_path_segment};
use super::error::DomainError;

pub type EntityId = String;
pub type Locale = String;

/// Names of the record fields that feed the card template.
pub const TRACKED_FIELDS: [&str; 9] = [
    "title",
    "kind",
    "locale",
    "public",
    "publishedAt",
    "tags",
    "authors",
    "breadcrumb",
    "coverImage",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PageKind {
    Post,
    Home,
    Category,
    #[serde(other)]
    Other,
}

impl PageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PageKind::Post => "Post",
            PageKind::Home => "Home",
            PageKind::Category => "Category",
            PageKind::Other => "Other",
        }
    }

    pub fn is_routable(self) -> bool {
        matches!(self, PageKind::Post | PageKind::Home | PageKind::Category)
    }
}

fn default_public() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRecord {
    pub kind: PageKind,
    pub locale: Locale,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub title: String,
    #[serde(default = "default_public")]
    pub public: bool,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub authors: BTreeSet<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub published_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub cover_image: Option<String>,
    #[serde(default)]
    pub breadcrumb: Vec<String>,
    #[serde(default)]
    pub sort_order: i64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_edited_at: Option<OffsetDateTime>,
}

impl PageRecord {
    pub fn new(kind: PageKind, locale: impl Into<Locale>, slug: impl Into<String>) -> Self {
        Self {
            kind,
            locale: locale.into(),
            slug: slug.into(),
            title: String::new(),
            public: true,
            tags: BTreeSet::new(),
            authors: BTreeSet::new(),
            published_at: None,
            cover_image: None,
            breadcrumb: Vec::new(),
            sort_order: 0,
            last_edited_at: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn is_routable(&self) -> bool {
        self.kind.is_routable() && !self.slug.is_empty()
    }

    /// The subset of this record that the card template consumes.
    pub fn card_fields(&self) -> CardFields<'_> {
        CardFields {
            title: &self.title,
            kind: self.kind,
            locale: &self.locale,
            public: self.public,
            published_at: self.published_at,
            tags: &self.tags,
            authors: &self.authors,
            breadcrumb: &self.breadcrumb,
            cover_image: self.cover_image.as_deref(),
        }
    }
}

/// Borrowed view over the card-affecting fields of a [`PageRecord`].
///
/// Change detection and card composition both go through this type, so a
/// field added here is automatically tracked by the diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardFields<'a> {
    pub title: &'a str,
    pub kind: PageKind,
    pub locale: &'a str,
    pub public: bool,
    pub published_at: Option<OffsetDateTime>,
    pub tags: &'a BTreeSet<String>,
    pub authors: &'a BTreeSet<String>,
    pub breadcrumb: &'a [String],
    pub cover_image: Option<&'a str>,
}

impl CardFields<'_> {
    /// Names of the tracked fields that differ between `self` and `other`.
    pub fn changed_fields(&self, other: &CardFields<'_>) -> Vec<&'static str> {
        let CardFields {
            title,
            kind,
            locale,
            public,
            published_at,
            tags,
            authors,
            breadcrumb,
            cover_image,
        } = self;

        let mut changed = Vec::new();
        if *title != other.title {
            changed.push("title");
        }
        if *kind != other.kind {
            changed.push("kind");
        }
        if *locale != other.locale {
            changed.push("locale");
        }
        if *public != other.public {
            changed.push("public");
        }
        if *published_at != other.published_at {
            changed.push("publishedAt");
        }
        if *tags != other.tags {
            changed.push("tags");
        }
        if *authors != other.authors {
            changed.push("authors");
        }
        if *breadcrumb != other.breadcrumb {
            changed.push("breadcrumb");
        }
        if *cover_image != other.cover_image {
            changed.push("coverImage");
        }
        changed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(default)]
    pub pages: BTreeMap<EntityId, PageRecord>,
    #[serde(default)]
    pub tag_counts: BTreeMap<Locale, BTreeMap<String, u64>>,
    #[serde(with = "time::serde::rfc3339")]
    pub captured_at: OffsetDateTime,
}

impl Snapshot {
    pub fn new(captured_at: OffsetDateTime) -> Self {
        Self {
            pages: BTreeMap::new(),
            tag_counts: BTreeMap::new(),
            captured_at,
        }
    }

    pub fn with_page(mut self, id: impl Into<EntityId>, record: PageRecord) -> Self {
        self.pages.insert(id.into(), record);
        self
    }

    pub fn with_tag(mut self, locale: impl Into<Locale>, tag: impl Into<String>, count: u64) -> Self {
        self.tag_counts
            .entry(locale.into())
            .or_default()
            .insert(tag.into(), count);
        self
    }

    /// Locales referenced by either pages or tag counts.
    pub fn locales(&self) -> BTreeSet<&str> {
        self.pages
            .values()
            .map(|page| page.locale.as_str())
            .chain(self.tag_counts.keys().map(String::as_str))
            .collect()
    }

    /// Tags with a positive count in `locale`.
    pub fn tags(&self, locale: &str) -> impl Iterator<Item = &str> + '_ {
        self.tag_counts
            .get(locale)
            .into_iter()
            .flat_map(|counts| counts.iter())
            .filter(|(tag, count)| **count > 0 && !tag.is_empty())
            .map(|(tag, _)| tag.as_str())
    }

    pub fn has_tag(&self, locale: &str, tag: &str) -> bool {
        self.tag_counts
            .get(locale)
            .and_then(|counts| counts.get(tag))
            .is_some_and(|count| *count > 0)
    }

    /// First page in `locale` with `slug` whose kind is one of `kinds`.
    pub fn find_page(&self, locale: &str, slug: &str, kinds: &[PageKind]) -> Option<&PageRecord> {
        self.pages
            .values()
            .find(|page| page.locale == locale && page.slug == slug && kinds.contains(&page.kind))
    }

    /// Checks that routable pages map onto distinct, path-safe artifacts.
    pub fn validate(&self) -> Result<(), DomainError> {
        let mut owners: HashMap<ArtifactKey, &str> = HashMap::new();

        for (id, page) in &self.pages {
            if !page.is_routable() {
                continue;
            }
            if !is_path_segment(&page.locale) {
                return Err(DomainError::validation(format!(
                    "page `{id}` has an invalid locale `{}`",
                    page.locale
                )));
            }
            if !is_path_segment(&page.slug) {
                return Err(DomainError::validation(format!(
                    "page `{id}` has an invalid slug `{}`",
                    page.slug
                )));
            }

            let Some(key) = ArtifactKey::for_page(page) else {
                continue;
            };
            if let Some(other) = owners.insert(key.clone(), id.as_str()) {
                return Err(DomainError::invariant(format!(
                    "pages `{other}` and `{id}` both map to `{key}`"
                )));
            }
        }

        if let Some(locale) = self.tag_counts.keys().find(|locale| !is_path_segment(locale)) {
            return Err(DomainError::validation(format!(
                "tag counts reference an invalid locale `{locale}`"
            )));
        }

        Ok(())
    }
}
