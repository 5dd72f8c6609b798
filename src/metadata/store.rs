// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Persisted sync metadata with atomic writes.
//!
//! A single JSON document records, per upstream item, when it was last
//! edited, which output files it produced, and when it was processed.
//! The document is versioned: any file that is absent, unparsable,
//! missing fields, or carries a different schema version is treated as
//! if no cache existed at all. Failing open toward a full rebuild is
//! always safe; trusting partial state is not.
//!
//! Saves go through a sibling temp file and an atomic rename, so no
//! reader ever observes a partially written document.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Current schema version. Bump when the document layout changes; old
/// documents are then discarded wholesale.
pub const CACHE_VERSION: &str = "1.0";

/// Error from persisting the metadata document.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("atomic rename failed: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// Per-item sync record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMetadata {
    /// Upstream last-edited timestamp at the time of processing.
    pub last_edited: DateTime<Utc>,
    /// Every output file this item has produced. Grows by union-merge
    /// only; an empty set means processing never completed.
    pub output_paths: BTreeSet<String>,
    /// When this item was last processed.
    pub processed_at: DateTime<Utc>,
}

/// The whole persisted document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMetadataCache {
    pub version: String,
    /// Hash of the processing scripts that produced this cache.
    pub script_hash: String,
    pub last_sync: DateTime<Utc>,
    pub pages: BTreeMap<String, PageMetadata>,
}

impl SyncMetadataCache {
    /// Fresh, empty cache tagged with the current script hash.
    #[must_use]
    pub fn new(script_hash: impl Into<String>) -> Self {
        Self {
            version: CACHE_VERSION.to_string(),
            script_hash: script_hash.into(),
            last_sync: Utc::now(),
            pages: BTreeMap::new(),
        }
    }

    /// Stamp the document with the current time, typically right before
    /// a save.
    pub fn touch_last_sync(&mut self) {
        self.last_sync = Utc::now();
    }
}

/// Sync-mode decision for one pipeline run.
#[derive(Debug, Clone)]
pub struct SyncMode {
    pub full_rebuild: bool,
    /// Human-readable reason, logged for diagnosability.
    pub reason: String,
    /// The loaded cache when running incrementally, `None` otherwise.
    pub cache: Option<SyncMetadataCache>,
}

/// Load/save surface over the metadata document at a fixed path.
pub struct SyncMetadataStore {
    path: PathBuf,
}

impl SyncMetadataStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document, or `None` if it is absent, unparsable, missing
    /// fields, or carries a different schema version. Callers must treat
    /// `None` identically to "no cache"; there is no partial recovery.
    pub fn load(&self) -> Option<SyncMetadataCache> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) => {
                debug!(path = %self.path.display(), %error, "No readable sync cache");
                return None;
            }
        };

        let cache: SyncMetadataCache = match serde_json::from_str(&raw) {
            Ok(cache) => cache,
            Err(error) => {
                warn!(
                    path = %self.path.display(),
                    %error,
                    "Sync cache unparsable, treating as absent"
                );
                return None;
            }
        };

        if cache.version != CACHE_VERSION {
            warn!(
                found = %cache.version,
                expected = CACHE_VERSION,
                "Sync cache version mismatch, treating as absent"
            );
            return None;
        }

        Some(cache)
    }

    /// Persist the document atomically: pretty JSON into a sibling temp
    /// file, then rename over the real path. A crash mid-write leaves
    /// the previous valid document in place.
    pub fn save(&self, cache: &SyncMetadataCache) -> Result<(), StoreError> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let json = serde_json::to_string_pretty(cache)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)?;

        debug!(
            path = %self.path.display(),
            pages = cache.pages.len(),
            "Sync cache saved"
        );
        Ok(())
    }

    /// Decide between a full rebuild and an incremental pass.
    ///
    /// `force` wins unconditionally; a structurally valid cache is still
    /// discarded when the script hash changed, because outputs produced
    /// by old logic cannot be trusted.
    pub fn determine_sync_mode(&self, current_script_hash: &str, force: bool) -> SyncMode {
        let mode = if force {
            SyncMode {
                full_rebuild: true,
                reason: "--force".to_string(),
                cache: None,
            }
        } else {
            match self.load() {
                None => SyncMode {
                    full_rebuild: true,
                    reason: "no existing cache".to_string(),
                    cache: None,
                },
                Some(cache) if cache.script_hash != current_script_hash => SyncMode {
                    full_rebuild: true,
                    reason: "script files changed".to_string(),
                    cache: None,
                },
                Some(cache) => SyncMode {
                    full_rebuild: false,
                    reason: "incremental sync".to_string(),
                    cache: Some(cache),
                },
            }
        };

        info!(
            full_rebuild = mode.full_rebuild,
            reason = %mode.reason,
            "Sync mode determined"
        );
        mode
    }
}
