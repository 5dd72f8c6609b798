// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # docsync
//!
//! The concurrency-and-caching core of an incremental content sync
//! pipeline: it keeps repeated runs cheap by gating outbound calls,
//! deduplicating fetches, and remembering across runs which items
//! actually need reprocessing.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Pipeline (embedder)                     │
//! │  • Owns one TokenBucketScheduler per run                    │
//! │  • Supplies fetch/normalize/validate per resource type      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      MemoizedLoader                         │
//! │  • Primary map + BoundedCache (strict LRU)                  │
//! │  • Single-flight: N identical requests → 1 fetch            │
//! │  • Best-effort freshness validation with bounded retry      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │  (miss path, via the fetcher)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   TokenBucketScheduler                      │
//! │  • Concurrency cap + per-interval token quota               │
//! │  • Strict FIFO admission, circuit-breaker gate              │
//! └─────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │              SyncMetadataStore + planner                    │
//! │  • Versioned JSON document, atomic temp-file rename         │
//! │  • Changed/deleted detection, fail-closed on empty upstream │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docsync::{SyncMetadataStore, SyncTuning, TokenBucketScheduler};
//!
//! #[tokio::main]
//! async fn main() {
//!     let tuning = SyncTuning::from_env();
//!     let scheduler = TokenBucketScheduler::new(tuning.scheduler_config());
//!
//!     let store = SyncMetadataStore::new(".cache/sync-metadata.json");
//!     let mode = store.determine_sync_mode("current-script-hash", false);
//!     if mode.full_rebuild {
//!         println!("full rebuild: {}", mode.reason);
//!     }
//!
//!     // ... fetch via MemoizedLoader, record outputs, store.save(...) ...
//!     scheduler.destroy();
//! }
//! ```
//!
//! ## Scope
//!
//! Scheduler state is in-memory and ephemeral; only the sync metadata is
//! durable. The store assumes one writer per run: atomic rename prevents
//! torn files, not concurrent runs. Transport-level retry belongs to the
//! caller's fetch functions, not this crate.
//!
//! ## Modules
//!
//! - [`scheduler`]: rate-limited, circuit-breakable task admission
//! - [`cache`]: bounded strict-LRU cache
//! - [`loader`]: two-tier memoization with single-flight dedup
//! - [`metadata`]: durable sync metadata and planning
//! - [`config`]: env-sourced tuning with clamping
//! - [`hashing`]: script hashing for cache invalidation

pub mod cache;
pub mod config;
pub mod hashing;
pub mod loader;
pub mod metadata;
pub mod metrics;
pub mod scheduler;

pub use cache::BoundedCache;
pub use config::SyncTuning;
pub use hashing::{hash_script_files, HashError};
pub use loader::{
    cache_key, should_log_progress, FetchError, LoadRecord, LoadSource, Loaded, LoaderStats,
    MemoizedLoader, SourceFetcher,
};
pub use metadata::{
    filter_changed_pages, find_deleted_pages, has_missing_outputs, update_page_in_cache,
    PageMetadata, PageStub, SyncMetadataCache, SyncMetadataStore, SyncMode, CACHE_VERSION,
};
pub use scheduler::{
    CircuitBreakerCheck, ScheduleError, SchedulerConfig, SchedulerStats, TokenBucketScheduler,
};
pub use metadata::store::StoreError;
