// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable incremental-sync metadata.
//!
//! This module decides, across pipeline runs, which items actually need
//! reprocessing and which disappeared upstream.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Metadata Module                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │  store.rs    - Persisted, versioned JSON document            │
//! │  └─ SyncMetadataStore: load / atomic save                    │
//! │  └─ determine_sync_mode: force / no cache / hash mismatch    │
//! ├──────────────────────────────────────────────────────────────┤
//! │  planner.rs  - Pure planning over the loaded cache           │
//! │  └─ filter_changed_pages: new / missing output / renamed /   │
//! │     edited                                                   │
//! │  └─ find_deleted_pages: fail-closed on empty upstream        │
//! │  └─ update_page_in_cache: union-merge outputs, keep newest   │
//! │     last_edited                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The store assumes a single writer per run. The temp-file-then-rename
//! save means a crash mid-write leaves the prior valid document intact,
//! but it is not cross-process mutual exclusion; concurrent runs against
//! one store are the operator's problem to avoid.

pub mod planner;
pub mod store;

pub use planner::{
    filter_changed_pages, find_deleted_pages, has_missing_outputs, update_page_in_cache, PageStub,
};
pub use store::{PageMetadata, SyncMetadataCache, SyncMetadataStore, SyncMode, CACHE_VERSION};
