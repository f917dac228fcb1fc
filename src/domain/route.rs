//! Page URL parsing for card rendering.
//!
//! Site URLs look like `/<locale>/<type>/<slug>[/<subpage>]`, where the locale
//! prefix is optional and `<type>` is one of the route types below. Anything
//! that does not contain a route type renders the site-wide root card.

use url::Url;

use super::artifact::{ArtifactKey, decode_component, encode_component};
use super::snapshot::Locale;

const ROUTE_TYPES: [&str; 4] = ["post", "category", "tag", "all-tags"];

/// Endpoint that renders cards which have no pre-generated artifact.
pub const ON_DEMAND_ENDPOINT: &str = "/api/generate-social-image";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardTarget {
    Root,
    AllTags {
        locale: Option<Locale>,
    },
    Post {
        locale: Option<Locale>,
        slug: String,
        subpage: Option<String>,
    },
    Category {
        locale: Option<Locale>,
        slug: String,
        subpage: Option<String>,
    },
    Tag {
        locale: Option<Locale>,
        tag: String,
    },
}

impl CardTarget {
    /// Parse a page path or absolute URL. Only segments listed in `locales`
    /// are treated as a locale prefix.
    pub fn parse<S: AsRef<str>>(input: &str, locales: &[S]) -> Self {
        let path = extract_path(input);
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        let (locale, rest) = match segments.split_first() {
            Some((first, rest))
                if !rest.is_empty() && locales.iter().any(|l| l.as_ref() == *first) =>
            {
                (Some((*first).to_string()), rest)
            }
            _ => (None, segments.as_slice()),
        };

        let Some(position) = rest.iter().position(|s| ROUTE_TYPES.contains(s)) else {
            return CardTarget::Root;
        };
        let relevant = &rest[position..];
        let slug = decode_component(relevant.get(1).copied().unwrap_or_default());
        let subpage = if relevant.len() > 2 {
            relevant.last().map(|s| decode_component(s))
        } else {
            None
        };

        match relevant[0] {
            "post" => CardTarget::Post {
                locale,
                slug,
                subpage,
            },
            "category" => CardTarget::Category {
                locale,
                slug,
                subpage,
            },
            "tag" => CardTarget::Tag {
                locale,
                tag: slug,
            },
            _ => CardTarget::AllTags { locale },
        }
    }

    pub fn locale(&self) -> Option<&str> {
        match self {
            CardTarget::Root => None,
            CardTarget::AllTags { locale }
            | CardTarget::Post { locale, .. }
            | CardTarget::Category { locale, .. }
            | CardTarget::Tag { locale, .. } => locale.as_deref(),
        }
    }

    pub fn is_subpage(&self) -> bool {
        matches!(
            self,
            CardTarget::Post {
                subpage: Some(_),
                ..
            } | CardTarget::Category {
                subpage: Some(_),
                ..
            }
        )
    }

    /// Pre-generated artifact for this target. Subpages and empty slugs have none.
    pub fn artifact_key(&self, default_locale: &str) -> Option<ArtifactKey> {
        let locale = self.locale().unwrap_or(default_locale);
        match self {
            CardTarget::Root => Some(ArtifactKey::Root),
            CardTarget::AllTags { .. } => Some(ArtifactKey::all_tags(locale)),
            CardTarget::Post {
                slug,
                subpage: None,
                ..
            } if !slug.is_empty() => Some(ArtifactKey::post(locale, slug)),
            CardTarget::Category {
                slug,
                subpage: None,
                ..
            } if !slug.is_empty() => Some(ArtifactKey::category(locale, slug)),
            CardTarget::Tag { tag, .. } if !tag.is_empty() => Some(ArtifactKey::tag(locale, tag)),
            _ => None,
        }
    }
}

fn extract_path(input: &str) -> String {
    if let Ok(url) = Url::parse(input) {
        return url.path().to_string();
    }
    let end = input.find(['?', '#']).unwrap_or(input.len());
    input[..end].to_string()
}

/// Image URL to advertise in the `og:image` tag of `page_url`.
///
/// Pages with a pre-generated artifact point at the static file; everything
/// else falls back to the on-demand endpoint.
pub fn social_image_url<S: AsRef<str>>(page_url: &str, locales: &[S], default_locale: &str) -> String {
    let target = CardTarget::parse(page_url, locales);
    match target.artifact_key(default_locale) {
        Some(key) => key.public_url(),
        None => format!(
            "{ON_DEMAND_ENDPOINT}?path={}",
            encode_component(&extract_path(page_url))
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCALES: [&str; 2] = ["en", "zh"];

    #[test]
    fn parses_localized_post() {
        assert_eq!(
            CardTarget::parse("/en/post/hello", &LOCALES),
            CardTarget::Post {
                locale: Some("en".into()),
                slug: "hello".into(),
                subpage: None,
            }
        );
    }

    #[test]
    fn single_segment_is_never_a_locale() {
        assert_eq!(CardTarget::parse("/en", &LOCALES), CardTarget::Root);
        assert_eq!(CardTarget::parse("/", &LOCALES), CardTarget::Root);
    }

    #[test]
    fn unknown_locale_prefix_is_skipped_until_route_type() {
        assert_eq!(
            CardTarget::parse("/fr/category/news", &LOCALES),
            CardTarget::Category {
                locale: None,
                slug: "news".into(),
                subpage: None,
            }
        );
    }

    #[test]
    fn deep_paths_are_subpages() {
        let target = CardTarget::parse("https://example.com/zh/post/guide/chapter-1?x=1", &LOCALES);
        assert_eq!(
            target,
            CardTarget::Post {
                locale: Some("zh".into()),
                slug: "guide".into(),
                subpage: Some("chapter-1".into()),
            }
        );
        assert!(target.is_subpage());
        assert_eq!(target.artifact_key("en"), None);
    }

    #[test]
    fn slugs_are_decoded() {
        assert_eq!(
            CardTarget::parse("/en/post/c%23/ch%C3%A2pitre", &LOCALES),
            CardTarget::Post {
                locale: Some("en".into()),
                slug: "c#".into(),
                subpage: Some("châpitre".into()),
            }
        );
    }

    #[test]
    fn tags_are_decoded() {
        assert_eq!(
            CardTarget::parse("/en/tag/c%2B%2B", &LOCALES),
            CardTarget::Tag {
                locale: Some("en".into()),
                tag: "c++".into(),
            }
        );
    }

    #[test]
    fn artifact_targets_parse_back_to_their_keys() {
        let keys = [
            ArtifactKey::Root,
            ArtifactKey::all_tags("en"),
            ArtifactKey::post("en", "hello"),
            ArtifactKey::category("zh", "notes"),
            ArtifactKey::tag("en", "c++ & rust"),
            ArtifactKey::post("en", "c#"),
            ArtifactKey::post("en", "a?b"),
            ArtifactKey::category("en", "café"),
        ];
        for key in keys {
            let target = CardTarget::parse(&key.target_url(), &LOCALES);
            assert_eq!(target.artifact_key("en"), Some(key.clone()), "{key}");
        }
    }

    #[test]
    fn resolves_social_image_urls() {
        assert_eq!(
            social_image_url("/", &LOCALES, "en"),
            "/social-images/root.jpg"
        );
        assert_eq!(
            social_image_url("/all-tags", &LOCALES, "en"),
            "/social-images/en/all-tags.jpg"
        );
        assert_eq!(
            social_image_url("/zh/post/hello", &LOCALES, "en"),
            "/social-images/zh/post/hello.jpg"
        );
        assert_eq!(
            social_image_url("/en/post/guide/chapter-1", &LOCALES, "en"),
            "/api/generate-social-image?path=%2Fen%2Fpost%2Fguide%2Fchapter-1"
        );
    }
}
