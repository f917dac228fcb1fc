//! Artifact identities and their on-disk and URL layouts.
//!
//! Every generated card is addressed by an [`ArtifactKey`]. The key alone
//! determines the file path below the artifact root, the public URL of the
//! image and the page URL the card is rendered for.

use std::borrow::Cow;
use std::fmt;
use std::path::PathBuf;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};

use super::snapshot::{Locale, PageKind, PageRecord};

/// Directory below the public dir that holds every artifact.
pub const ARTIFACT_ROOT: &str = "social-images";
pub const ARTIFACT_EXTENSION: &str = "jpg";

/// Escapes everything `encodeURIComponent` escapes.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

pub fn encode_component(value: &str) -> String {
    utf8_percent_encode(value, URI_COMPONENT).to_string()
}

pub fn decode_component(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().into_owned()
}

/// True when `value` can be used verbatim as a single path segment.
pub fn is_path_segment(value: &str) -> bool {
    !value.is_empty()
        && value != "."
        && value != ".."
        && !value.contains(['/', '\\', '\0'])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArtifactCategory {
    Root,
    AllTags,
    Post,
    Category,
    Tag,
}

impl ArtifactCategory {
    /// Per-locale directories that hold one file per entity.
    pub const DIRECTORIES: [ArtifactCategory; 3] = [
        ArtifactCategory::Post,
        ArtifactCategory::Category,
        ArtifactCategory::Tag,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactCategory::Root => "root",
            ArtifactCategory::AllTags => "all-tags",
            ArtifactCategory::Post => "post",
            ArtifactCategory::Category => "category",
            ArtifactCategory::Tag => "tag",
        }
    }

    pub fn directory(self) -> Option<&'static str> {
        match self {
            ArtifactCategory::Post | ArtifactCategory::Category | ArtifactCategory::Tag => {
                Some(self.as_str())
            }
            ArtifactCategory::Root | ArtifactCategory::AllTags => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArtifactKey {
    Root,
    AllTags { locale: Locale },
    Post { locale: Locale, slug: String },
    Category { locale: Locale, slug: String },
    Tag { locale: Locale, tag: String },
}

impl ArtifactKey {
    pub fn all_tags(locale: impl Into<Locale>) -> Self {
        Self::AllTags {
            locale: locale.into(),
        }
    }

    pub fn post(locale: impl Into<Locale>, slug: impl Into<String>) -> Self {
        Self::Post {
            locale: locale.into(),
            slug: slug.into(),
        }
    }

    pub fn category(locale: impl Into<Locale>, slug: impl Into<String>) -> Self {
        Self::Category {
            locale: locale.into(),
            slug: slug.into(),
        }
    }

    pub fn tag(locale: impl Into<Locale>, tag: impl Into<String>) -> Self {
        Self::Tag {
            locale: locale.into(),
            tag: tag.into(),
        }
    }

    /// Artifact generated for a page, if the page is routable and path safe.
    ///
    /// `Home` pages share the `post` directory with regular posts.
    pub fn for_page(page: &PageRecord) -> Option<Self> {
        if !page.is_routable() || !is_path_segment(&page.locale) || !is_path_segment(&page.slug) {
            return None;
        }
        match page.kind {
            PageKind::Post | PageKind::Home => Some(Self::post(&page.locale, &page.slug)),
            PageKind::Category => Some(Self::category(&page.locale, &page.slug)),
            PageKind::Other => None,
        }
    }

    pub fn kind(&self) -> ArtifactCategory {
        match self {
            ArtifactKey::Root => ArtifactCategory::Root,
            ArtifactKey::AllTags { .. } => ArtifactCategory::AllTags,
            ArtifactKey::Post { .. } => ArtifactCategory::Post,
            ArtifactKey::Category { .. } => ArtifactCategory::Category,
            ArtifactKey::Tag { .. } => ArtifactCategory::Tag,
        }
    }

    pub fn locale(&self) -> Option<&str> {
        match self {
            ArtifactKey::Root => None,
            ArtifactKey::AllTags { locale }
            | ArtifactKey::Post { locale, .. }
            | ArtifactKey::Category { locale, .. }
            | ArtifactKey::Tag { locale, .. } => Some(locale),
        }
    }

    /// File stem of the artifact. Slugs and tags are percent-encoded, so
    /// the stem is also a valid URL path segment.
    pub fn identifier(&self) -> Cow<'_, str> {
        match self {
            ArtifactKey::Root => Cow::Borrowed("root"),
            ArtifactKey::AllTags { .. } => Cow::Borrowed("all-tags"),
            ArtifactKey::Post { slug, .. } | ArtifactKey::Category { slug, .. } => {
                utf8_percent_encode(slug, URI_COMPONENT).into()
            }
            ArtifactKey::Tag { tag, .. } => utf8_percent_encode(tag, URI_COMPONENT).into(),
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.{ARTIFACT_EXTENSION}", self.identifier())
    }

    fn segments(&self) -> Vec<String> {
        let mut segments = Vec::with_capacity(3);
        if let Some(locale) = self.locale() {
            segments.push(locale.to_string());
        }
        if let Some(directory) = self.kind().directory() {
            segments.push(directory.to_string());
        }
        segments.push(self.file_name());
        segments
    }

    /// Location relative to the artifact root.
    pub fn relative_path(&self) -> PathBuf {
        self.segments().into_iter().collect()
    }

    pub fn public_url(&self) -> String {
        format!("/{ARTIFACT_ROOT}/{}", self.segments().join("/"))
    }

    /// Page URL the card is rendered for.
    pub fn target_url(&self) -> String {
        match self {
            ArtifactKey::Root => "/".to_string(),
            ArtifactKey::AllTags { locale } => format!("/{locale}/all-tags"),
            ArtifactKey::Post { locale, .. } => format!("/{locale}/post/{}", self.identifier()),
            ArtifactKey::Category { locale, .. } => {
                format!("/{locale}/category/{}", self.identifier())
            }
            ArtifactKey::Tag { locale, .. } => format!("/{locale}/tag/{}", self.identifier()),
        }
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKey::Root => f.write_str("root"),
            ArtifactKey::AllTags { locale } => write!(f, "all-tags/{locale}"),
            other => write!(
                f,
                "{}/{}/{}",
                other.kind().as_str(),
                other.locale().unwrap_or_default(),
                other.identifier()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    #[test]
    fn encodes_like_encode_uri_component() {
        assert_eq!(encode_component("c++"), "c%2B%2B");
        assert_eq!(encode_component("a b/c"), "a%20b%2Fc");
        assert_eq!(encode_component("it's-(ok)!~*._"), "it's-(ok)!~*._");
        assert_eq!(encode_component("日本"), "%E6%97%A5%E6%9C%AC");
        assert_eq!(decode_component("c%2B%2B"), "c++");
    }

    #[test]
    fn layouts_match_artifact_category() {
        let cases = [
            (ArtifactKey::Root, "root.jpg", "/social-images/root.jpg", "/"),
            (
                ArtifactKey::all_tags("en"),
                "en/all-tags.jpg",
                "/social-images/en/all-tags.jpg",
                "/en/all-tags",
            ),
            (
                ArtifactKey::post("en", "hello"),
                "en/post/hello.jpg",
                "/social-images/en/post/hello.jpg",
                "/en/post/hello",
            ),
            (
                ArtifactKey::category("zh", "notes"),
                "zh/category/notes.jpg",
                "/social-images/zh/category/notes.jpg",
                "/zh/category/notes",
            ),
            (
                ArtifactKey::tag("en", "c++"),
                "en/tag/c%2B%2B.jpg",
                "/social-images/en/tag/c%2B%2B.jpg",
                "/en/tag/c%2B%2B",
            ),
            (
                ArtifactKey::post("en", "café"),
                "en/post/caf%C3%A9.jpg",
                "/social-images/en/post/caf%C3%A9.jpg",
                "/en/post/caf%C3%A9",
            ),
            (
                ArtifactKey::category("en", "c#"),
                "en/category/c%23.jpg",
                "/social-images/en/category/c%23.jpg",
                "/en/category/c%23",
            ),
        ];

        for (key, path, public, target) in cases {
            assert_eq!(key.relative_path(), Path::new(path), "{key}");
            assert_eq!(key.public_url(), public, "{key}");
            assert_eq!(key.target_url(), target, "{key}");
        }
    }

    #[test]
    fn home_pages_share_post_directory() {
        let home = PageRecord::new(PageKind::Home, "en", "about");
        assert_eq!(ArtifactKey::for_page(&home), Some(ArtifactKey::post("en", "about")));
    }

    #[test]
    fn unroutable_pages_have_no_artifact() {
        let other = PageRecord::new(PageKind::Other, "en", "x");
        let unslugged = PageRecord::new(PageKind::Post, "en", "");
        let unsafe_slug = PageRecord::new(PageKind::Post, "en", "a/b");

        assert_eq!(ArtifactKey::for_page(&other), None);
        assert_eq!(ArtifactKey::for_page(&unslugged), None);
        assert_eq!(ArtifactKey::for_page(&unsafe_slug), None);
    }

    #[test]
    fn display_is_category_locale_identifier() {
        assert_eq!(ArtifactKey::post("en", "b").to_string(), "post/en/b");
        assert_eq!(ArtifactKey::tag("en", "x").to_string(), "tag/en/x");
        assert_eq!(ArtifactKey::all_tags("en").to_string(), "all-tags/en");
        assert_eq!(ArtifactKey::Root.to_string(), "root");
    }
}
