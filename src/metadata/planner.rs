// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Incremental sync planning.
//!
//! Pure functions over the loaded [`SyncMetadataCache`]: which items
//! changed, which disappeared upstream, and how freshly produced output
//! paths fold back into the cache. No hidden state; everything comes in
//! as arguments so each decision is unit-constructible.
//!
//! Two safety properties live here:
//! - change detection self-heals: a recorded output file missing from
//!   disk marks the item changed regardless of timestamps;
//! - deletion detection fails closed: an empty upstream item set is
//!   treated as a transient failure and never triggers mass deletion.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::debug;

use super::store::{PageMetadata, SyncMetadataCache};

/// Minimal view of an upstream item as seen by the planner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageStub {
    pub id: String,
    /// Upstream staleness marker. `None` means freshness cannot be
    /// proven, which counts as changed.
    pub last_edited: Option<DateTime<Utc>>,
}

impl PageStub {
    pub fn new(id: impl Into<String>, last_edited: Option<DateTime<Utc>>) -> Self {
        Self {
            id: id.into(),
            last_edited,
        }
    }
}

/// Compute the subset of `pages` that needs (re)processing.
///
/// With no cache every page is changed. Otherwise a page is changed if
/// it is new, any recorded output path is missing from disk, its
/// currently resolved output path (when `resolve_path` is supplied) is
/// not among the recorded ones (rename/move detection), or its upstream
/// marker is strictly newer than the cached one. Equal timestamps are
/// never changed, so a no-op re-run reprocesses nothing.
pub fn filter_changed_pages(
    pages: &[PageStub],
    cache: Option<&SyncMetadataCache>,
    resolve_path: Option<&dyn Fn(&PageStub) -> PathBuf>,
) -> Vec<PageStub> {
    let Some(cache) = cache else {
        return pages.to_vec();
    };

    pages
        .iter()
        .filter(|page| {
            let Some(entry) = cache.pages.get(&page.id) else {
                debug!(id = %page.id, "Page changed: not in cache");
                return true;
            };

            if entry.output_paths.is_empty()
                || entry.output_paths.iter().any(|p| !Path::new(p).exists())
            {
                debug!(id = %page.id, "Page changed: recorded output missing");
                return true;
            }

            if let Some(resolve) = resolve_path {
                let current = resolve(page).to_string_lossy().into_owned();
                if !entry.output_paths.contains(&current) {
                    debug!(id = %page.id, path = %current, "Page changed: output path moved");
                    return true;
                }
            }

            match page.last_edited {
                // Freshness unprovable without a marker
                None => true,
                Some(edited) => edited > entry.last_edited,
            }
        })
        .cloned()
        .collect()
}

/// Whether a cached item's outputs are incomplete: an empty recorded
/// path list, or any recorded path missing from disk. Items without a
/// cache entry report `false`; they are handled as "new" elsewhere.
#[must_use]
pub fn has_missing_outputs(cache: &SyncMetadataCache, id: &str) -> bool {
    let Some(entry) = cache.pages.get(id) else {
        return false;
    };
    entry.output_paths.is_empty() || entry.output_paths.iter().any(|p| !Path::new(p).exists())
}

/// Items present in the cache but absent upstream.
///
/// An empty `current_ids` yields no deletions: it usually means the
/// upstream call came back empty transiently, and deleting everything
/// on that evidence would be data loss.
#[must_use]
pub fn find_deleted_pages(current_ids: &[String], cache: &SyncMetadataCache) -> Vec<String> {
    if current_ids.is_empty() {
        debug!("Empty upstream item set, skipping deletion detection");
        return Vec::new();
    }
    let current: BTreeSet<&String> = current_ids.iter().collect();
    cache
        .pages
        .keys()
        .filter(|id| !current.contains(id))
        .cloned()
        .collect()
}

/// Fold a processed item back into the cache.
///
/// Output paths accumulate by set union so paths produced for other
/// variants or languages earlier in the run are never dropped, and
/// `last_edited` keeps the newer of the existing and incoming values so
/// an out-of-order update cannot regress recorded freshness.
pub fn update_page_in_cache(
    cache: &mut SyncMetadataCache,
    id: &str,
    last_edited: DateTime<Utc>,
    output_paths: &[String],
) {
    let now = Utc::now();
    match cache.pages.get_mut(id) {
        Some(entry) => {
            entry.output_paths.extend(output_paths.iter().cloned());
            entry.last_edited = entry.last_edited.max(last_edited);
            entry.processed_at = now;
        }
        None => {
            cache.pages.insert(
                id.to_string(),
                PageMetadata {
                    last_edited,
                    output_paths: output_paths.iter().cloned().collect(),
                    processed_at: now,
                },
            );
        }
    }
}
