//! Composition of the social card markup.
//!
//! [`compose`] turns a [`CardTarget`] and the current [`Snapshot`] into a
//! [`CardView`]; [`render_document`] wraps that view in a standalone HTML
//! document ready to be loaded into a browser page.

use askama::Template;

use crate::domain::route::CardTarget;
use crate::domain::snapshot::{PageKind, PageRecord, Snapshot};

const BREADCRUMB_LIMIT: usize = 3;
const BREADCRUMB_ITEM_CHARS: usize = 20;
const BADGE_TITLE_CHARS: usize = 40;

const FOLDER_GLYPH: &str = r#"<svg viewBox="0 0 24 24" aria-hidden="true"><path fill="currentColor" d="M2 4h7l2 2.5h11V20H2z"/></svg>"#;
const TAG_GLYPH: &str = r#"<svg viewBox="0 0 24 24" aria-hidden="true"><path fill="currentColor" fill-rule="evenodd" d="M2 2h9.5L22 12.5 12.5 22 2 11.5zM7 5a2 2 0 1 0 0 4 2 2 0 0 0 0-4z"/></svg>"#;
const TAGS_GLYPH: &str = r#"<svg viewBox="0 0 24 24" aria-hidden="true"><path fill="currentColor" fill-rule="evenodd" d="M1 3h8l9 9-8 8-9-9zM5 6a1.5 1.5 0 1 0 0 3 1.5 1.5 0 0 0 0-3zM11 3h2l9 9-8 8-1-1 7-7z"/></svg>"#;

/// Branding shared by every card of a site.
#[derive(Debug, Clone)]
pub struct SiteBranding {
    pub name: String,
    pub icon: String,
    pub default_background: String,
    pub default_locale: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Brand {
    pub icon_url: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Badge {
    pub glyph: &'static str,
    pub title: String,
    pub font_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorLine {
    pub name: String,
    pub others: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardView {
    pub background_url: String,
    pub brand: Option<Brand>,
    pub breadcrumb: Vec<String>,
    pub heading: Option<String>,
    pub badge: Option<Badge>,
    pub author: Option<AuthorLine>,
}

#[derive(Template)]
#[template(path = "social_card.html")]
struct SocialCardDocument<'a> {
    base_href: &'a str,
    card: &'a CardView,
}

/// Wraps `card` in a document whose relative URLs resolve against `base_url`.
pub fn render_document(card: &CardView, base_url: &str) -> Result<String, askama::Error> {
    let base_href = format!("{}/", base_url.trim_end_matches('/'));
    SocialCardDocument {
        base_href: &base_href,
        card,
    }
    .render()
}

pub fn compose(
    target: &CardTarget,
    snapshot: &Snapshot,
    site: &SiteBranding,
    base_url: &str,
    image_override: Option<&str>,
) -> CardView {
    let locale = target.locale().unwrap_or(&site.default_locale);
    let mut view = CardView {
        background_url: String::new(),
        brand: None,
        breadcrumb: Vec::new(),
        heading: None,
        badge: None,
        author: None,
    };
    let mut cover = None;

    match target {
        CardTarget::Root => {
            view.brand = Some(Brand {
                icon_url: absolute_url(base_url, &site.icon),
                name: site.name.clone(),
            });
        }
        CardTarget::AllTags { .. } => {
            view.badge = Some(badge(TAGS_GLYPH, "All Tags"));
        }
        CardTarget::Tag { tag, .. } => {
            view.badge = Some(badge(TAG_GLYPH, tag));
        }
        CardTarget::Category { slug, subpage, .. } => {
            let page = lookup(snapshot, locale, slug, &[PageKind::Category], site);
            cover = page.and_then(|page| page.cover_image.as_deref());
            let title = page
                .map(|page| page.title.as_str())
                .filter(|title| !title.is_empty())
                .unwrap_or("Category");
            match subpage {
                Some(subpage) => {
                    view.breadcrumb = subpage_trail(page, title);
                    view.heading = Some(subpage_title(snapshot, locale, subpage, site));
                }
                None => {
                    view.breadcrumb = compress_breadcrumb(page.map(|p| p.breadcrumb.as_slice()));
                    view.badge = Some(badge(FOLDER_GLYPH, title));
                }
            }
        }
        CardTarget::Post { slug, subpage, .. } => {
            let page = lookup(snapshot, locale, slug, &[PageKind::Post, PageKind::Home], site);
            cover = page.and_then(|page| page.cover_image.as_deref());
            view.author = page.and_then(author_line);
            let title = page
                .map(|page| page.title.as_str())
                .filter(|title| !title.is_empty())
                .unwrap_or("Post");
            match subpage {
                Some(subpage) => {
                    view.breadcrumb = subpage_trail(page, title);
                    view.heading = Some(subpage_title(snapshot, locale, subpage, site));
                }
                None => {
                    view.breadcrumb = compress_breadcrumb(page.map(|p| p.breadcrumb.as_slice()));
                    view.heading = Some(title.to_string());
                }
            }
        }
    }

    let background = image_override
        .filter(|url| !url.is_empty())
        .or(cover)
        .unwrap_or(&site.default_background);
    view.background_url = absolute_url(base_url, background);
    view
}

/// Looks in `locale` first and falls back to the default locale.
fn lookup<'a>(
    snapshot: &'a Snapshot,
    locale: &str,
    slug: &str,
    kinds: &[PageKind],
    site: &SiteBranding,
) -> Option<&'a PageRecord> {
    if slug.is_empty() {
        return None;
    }
    snapshot
        .find_page(locale, slug, kinds)
        .or_else(|| snapshot.find_page(&site.default_locale, slug, kinds))
}

fn subpage_trail(parent: Option<&PageRecord>, parent_title: &str) -> Vec<String> {
    let mut trail = parent.map(|p| p.breadcrumb.clone()).unwrap_or_default();
    trail.push(parent_title.to_string());
    compress_breadcrumb(Some(trail.as_slice()))
}

fn subpage_title(snapshot: &Snapshot, locale: &str, subpage: &str, site: &SiteBranding) -> String {
    lookup(
        snapshot,
        locale,
        subpage,
        &[PageKind::Post, PageKind::Home, PageKind::Category, PageKind::Other],
        site,
    )
    .map(|page| page.title.clone())
    .filter(|title| !title.is_empty())
    .unwrap_or_else(|| humanize_slug(subpage))
}

fn author_line(page: &PageRecord) -> Option<AuthorLine> {
    let mut authors = page.authors.iter();
    let first = authors.next()?;
    Some(AuthorLine {
        name: first.clone(),
        others: authors.count(),
    })
}

fn badge(glyph: &'static str, title: &str) -> Badge {
    let title = truncate(title, BADGE_TITLE_CHARS);
    Badge {
        glyph,
        font_size: badge_font_size(title.chars().count()),
        title,
    }
}

/// Larger type for shorter titles so badges fill the card evenly.
pub fn badge_font_size(chars: usize) -> u32 {
    match chars {
        0..=10 => 96,
        11..=15 => 80,
        16..=20 => 72,
        21..=25 => 64,
        26..=30 => 56,
        31..=35 => 48,
        _ => 42,
    }
}

/// Keeps the first item and the last two, each shortened.
pub fn compress_breadcrumb(items: Option<&[String]>) -> Vec<String> {
    let items = items.unwrap_or_default();
    let shortened = |item: &String| truncate(item, BREADCRUMB_ITEM_CHARS);
    if items.len() <= BREADCRUMB_LIMIT {
        return items.iter().map(shortened).collect();
    }
    let tail = &items[items.len() - 2..];
    std::iter::once(shortened(&items[0]))
        .chain(std::iter::once("...".to_string()))
        .chain(tail.iter().map(shortened))
        .collect()
}

fn truncate(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let mut shortened: String = value.chars().take(limit).collect();
    shortened.push_str("...");
    shortened
}

/// Turns `chapter-one-<32 hex id>` into `chapter one`.
fn humanize_slug(slug: &str) -> String {
    let stem = match slug.len().checked_sub(33) {
        Some(split)
            if slug.is_char_boundary(split)
                && slug[split..].starts_with('-')
                && slug[split + 1..].chars().all(|c| c.is_ascii_hexdigit()) =>
        {
            &slug[..split]
        }
        _ => slug,
    };
    stem.replace('-', " ")
}

fn absolute_url(base_url: &str, url: &str) -> String {
    if url.starts_with('/') && !url.starts_with("//") {
        format!("{}{url}", base_url.trim_end_matches('/'))
    } else {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::domain::artifact::ArtifactKey;

    fn site() -> SiteBranding {
        SiteBranding {
            name: "Field Notes".into(),
            icon: "/icon.png".into(),
            default_background: "/default_background.png".into(),
            default_locale: "en".into(),
        }
    }

    fn snapshot() -> Snapshot {
        let mut post = PageRecord::new(PageKind::Post, "en", "hello").with_title("Hello World");
        post.authors.extend(["ada".to_string(), "grace".to_string(), "linus".to_string()]);
        post.cover_image = Some("https://cdn.example.com/cover.png".into());
        post.breadcrumb = vec!["Blog".into(), "2024".into()];
        Snapshot::new(datetime!(2024-01-01 0:00 UTC))
            .with_page("p1", post)
            .with_page(
                "c1",
                PageRecord::new(PageKind::Category, "en", "notes").with_title("Notes"),
            )
    }

    #[test]
    fn root_card_shows_brand_on_default_background() {
        let view = compose(&CardTarget::Root, &snapshot(), &site(), "https://example.com/", None);
        assert_eq!(
            view.brand,
            Some(Brand {
                icon_url: "https://example.com/icon.png".into(),
                name: "Field Notes".into(),
            })
        );
        assert_eq!(view.background_url, "https://example.com/default_background.png");
    }

    #[test]
    fn post_card_uses_cover_title_and_authors() {
        let target = CardTarget::parse("/en/post/hello", &["en"]);
        let view = compose(&target, &snapshot(), &site(), "https://example.com", None);

        assert_eq!(view.heading.as_deref(), Some("Hello World"));
        assert_eq!(view.background_url, "https://cdn.example.com/cover.png");
        assert_eq!(view.breadcrumb, vec!["Blog".to_string(), "2024".to_string()]);
        assert_eq!(
            view.author,
            Some(AuthorLine {
                name: "ada".into(),
                others: 2,
            })
        );
    }

    #[test]
    fn reserved_characters_in_slugs_select_the_right_page() {
        let snapshot = Snapshot::new(datetime!(2024-01-01 0:00 UTC))
            .with_page("p1", PageRecord::new(PageKind::Post, "en", "c").with_title("C"))
            .with_page(
                "p2",
                PageRecord::new(PageKind::Post, "en", "c#").with_title("C Sharp"),
            );
        assert!(snapshot.validate().is_ok());

        let url = ArtifactKey::post("en", "c#").target_url();
        let target = CardTarget::parse(&url, &["en"]);
        let view = compose(&target, &snapshot, &site(), "https://example.com", None);

        assert_eq!(view.heading.as_deref(), Some("C Sharp"));
    }

    #[test]
    fn image_override_wins_over_cover() {
        let target = CardTarget::parse("/en/post/hello", &["en"]);
        let view = compose(&target, &snapshot(), &site(), "https://example.com", Some("/x.png"));
        assert_eq!(view.background_url, "https://example.com/x.png");
    }

    #[test]
    fn unknown_post_falls_back_to_generic_title() {
        let target = CardTarget::parse("/en/post/missing", &["en"]);
        let view = compose(&target, &snapshot(), &site(), "https://example.com", None);
        assert_eq!(view.heading.as_deref(), Some("Post"));
        assert!(view.author.is_none());
    }

    #[test]
    fn subpage_title_is_derived_from_slug() {
        let target = CardTarget::parse(
            "/en/post/hello/deep-dive-0123456789abcdef0123456789abcdef",
            &["en"],
        );
        let view = compose(&target, &snapshot(), &site(), "https://example.com", None);
        assert_eq!(view.heading.as_deref(), Some("deep dive"));
        assert_eq!(view.breadcrumb, vec!["Blog", "2024", "Hello World"]);
    }

    #[test]
    fn category_card_uses_badge() {
        let target = CardTarget::parse("/en/category/notes", &["en"]);
        let view = compose(&target, &snapshot(), &site(), "https://example.com", None);
        let badge = view.badge.expect("badge");
        assert_eq!(badge.title, "Notes");
        assert_eq!(badge.font_size, 96);
    }

    #[test]
    fn breadcrumb_keeps_first_and_last_two() {
        let items: Vec<String> = ["Home", "A very long section name here", "B", "C"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            compress_breadcrumb(Some(items.as_slice())),
            vec!["Home", "...", "B", "C"]
        );
        assert_eq!(
            compress_breadcrumb(Some(&items[1..2])),
            vec!["A very long section ..."]
        );
    }

    #[test]
    fn badge_font_size_steps_down() {
        assert_eq!(badge_font_size(10), 96);
        assert_eq!(badge_font_size(11), 80);
        assert_eq!(badge_font_size(33), 48);
        assert_eq!(badge_font_size(43), 42);
    }

    #[test]
    fn document_sets_base_href_and_escapes_text() {
        let target = CardTarget::Tag {
            locale: None,
            tag: "<script>".into(),
        };
        let view = compose(&target, &snapshot(), &site(), "https://example.com/", None);
        let html = render_document(&view, "https://example.com/").expect("render");

        assert!(html.contains(r#"<base href="https://example.com/">"#));
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("<script>"));
    }
}
