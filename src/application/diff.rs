//! Snapshot comparison.
//!
//! [`diff`] is pure: it decides which artifacts to regenerate and which to
//! delete from two snapshots, without touching the filesystem.

use std::collections::BTreeSet;
use std::fmt;

use crate::domain::artifact::{ArtifactKey, is_path_segment};
use crate::domain::snapshot::{PageRecord, Snapshot};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncDelta {
    pub to_generate: BTreeSet<ArtifactKey>,
    pub to_delete_for_removal: BTreeSet<ArtifactKey>,
    pub to_delete_for_change: BTreeSet<ArtifactKey>,
}

impl SyncDelta {
    pub fn is_empty(&self) -> bool {
        self.to_generate.is_empty()
            && self.to_delete_for_removal.is_empty()
            && self.to_delete_for_change.is_empty()
    }

    /// Everything to delete before generation starts.
    ///
    /// Newly appearing tags and locales are included so a stale file left by
    /// an earlier removal can never be mistaken for a fresh render.
    pub fn stale_artifacts(&self) -> BTreeSet<ArtifactKey> {
        self.to_delete_for_removal
            .iter()
            .chain(self.to_delete_for_change.iter())
            .chain(self.to_generate.iter().filter(|key| {
                matches!(key, ArtifactKey::Tag { .. } | ArtifactKey::AllTags { .. })
            }))
            .cloned()
            .collect()
    }
}

impl fmt::Display for SyncDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "generate={} delete_removed={} delete_changed={}",
            self.to_generate.len(),
            self.to_delete_for_removal.len(),
            self.to_delete_for_change.len()
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffOptions {
    /// Treat every current page and tag as changed.
    pub force_regenerate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageChange {
    New,
    Changed(Vec<&'static str>),
    /// Card content is identical but the artifact location moved.
    Moved,
    Unchanged,
}

pub fn classify_page(previous: Option<&PageRecord>, current: &PageRecord) -> PageChange {
    let Some(previous) = previous else {
        return PageChange::New;
    };
    let changed = previous.card_fields().changed_fields(&current.card_fields());
    if !changed.is_empty() {
        return PageChange::Changed(changed);
    }
    if ArtifactKey::for_page(previous) != ArtifactKey::for_page(current) {
        return PageChange::Moved;
    }
    PageChange::Unchanged
}

pub fn diff(previous: Option<&Snapshot>, current: &Snapshot) -> SyncDelta {
    diff_with(previous, current, DiffOptions::default())
}

/// Without a previous snapshot nothing is compared and the delta is empty,
/// unless `force_regenerate` asks for every current artifact.
pub fn diff_with(previous: Option<&Snapshot>, current: &Snapshot, options: DiffOptions) -> SyncDelta {
    let mut delta = SyncDelta::default();
    let Some(previous) = previous else {
        if options.force_regenerate {
            force_all(current, &mut delta);
        }
        return delta;
    };

    for (id, page) in &current.pages {
        let before = previous.pages.get(id);
        let change = if options.force_regenerate {
            PageChange::Changed(Vec::new())
        } else {
            classify_page(before, page)
        };
        let key = ArtifactKey::for_page(page);
        let old_key = before.and_then(ArtifactKey::for_page);

        match change {
            PageChange::Unchanged => {}
            PageChange::New => {
                delta.to_generate.extend(key);
            }
            PageChange::Changed(_) | PageChange::Moved => {
                if old_key.is_some() && old_key != key {
                    delta.to_delete_for_removal.extend(old_key);
                }
                if let Some(key) = key {
                    delta.to_delete_for_change.insert(key.clone());
                    delta.to_generate.insert(key);
                }
            }
        }
    }

    for (id, page) in &previous.pages {
        if !current.pages.contains_key(id) {
            delta.to_delete_for_removal.extend(ArtifactKey::for_page(page));
        }
    }

    let known = previous.locales();
    for locale in current.locales() {
        if !known.contains(locale) && is_path_segment(locale) {
            delta.to_generate.insert(ArtifactKey::all_tags(locale));
        }
    }

    let locales: BTreeSet<&str> = previous
        .tag_counts
        .keys()
        .chain(current.tag_counts.keys())
        .map(String::as_str)
        .collect();
    for locale in locales {
        for tag in current.tags(locale) {
            if options.force_regenerate || !previous.has_tag(locale, tag) {
                delta.to_generate.insert(ArtifactKey::tag(locale, tag));
            }
        }
        for tag in previous.tags(locale) {
            if !current.has_tag(locale, tag) {
                delta.to_delete_for_removal.insert(ArtifactKey::tag(locale, tag));
            }
        }
    }

    delta
}

fn force_all(current: &Snapshot, delta: &mut SyncDelta) {
    for page in current.pages.values() {
        if let Some(key) = ArtifactKey::for_page(page) {
            delta.to_delete_for_change.insert(key.clone());
            delta.to_generate.insert(key);
        }
    }
    for locale in current.tag_counts.keys() {
        for tag in current.tags(locale) {
            delta.to_generate.insert(ArtifactKey::tag(locale, tag));
        }
    }
}
