//! # Tag Cache
//!
//! Tag-based cache invalidation on top of Redis.
//!
//! Cached values are grouped under one or more tags; flushing a tag
//! invalidates every value written with it, without the caller tracking keys.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 TaggedCache (write/read path)               │
//! │  • put(key, value, tags, ttl): value + bookkeeping together │
//! │  • get(key, tags)                                           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 TagInvalidator (flush path)                 │
//! │  • Any + Lazy  → LazyTagFlusher                             │
//! │  • Any + Eager → EagerConsistencyMaintainer                 │
//! │  • All         → GenerationalFlusher                        │
//! │  • glob        → PatternFlusher (SCAN + UNLINK)             │
//! │  • scheduled   → OrphanPruner                               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                   BatchClient (chosen per call)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       TagStore                              │
//! │  • RedisTagStore: standalone (atomic pipelines) or cluster  │
//! │  • MemoryTagStore: Redis semantics in memory                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Tag modes
//!
//! - **Any**: each tag keeps a hash of its keys and each key a reverse index
//!   of its tags. Flushing a tag deletes its keys in batches of 1000.
//! - **All**: the physical key embeds a SHA-1 of the key's tag ids. Flushing a
//!   tag bumps its generation, so every key written with it becomes unreachable.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tag_cache::{RedisTagStore, TagCacheConfig, TaggedCache};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = TagCacheConfig {
//!         redis_url: Some("redis://localhost:6379".into()),
//!         prefix: "app:".into(),
//!         ..Default::default()
//!     };
//!
//!     let store = RedisTagStore::connect(&config).await.expect("Failed to connect");
//!     let cache = TaggedCache::new(Arc::new(store), &config).expect("Invalid config");
//!
//!     cache.put("user:1", b"alice", &["users", "active"], None).await.unwrap();
//!     let report = cache.flush(&["users"]).await.unwrap();
//!     println!("Invalidated {} keys", report.deleted);
//! }
//! ```
//!
//! ## Modules
//!
//! - [`keyspace`]: key naming and namespace hashing
//! - [`storage`]: store backends (Redis, Memory)
//! - [`tags`]: registry, generations, key enumeration
//! - [`flush`]: flush strategies, pattern flush, pruning
//! - [`cache`]: tagged write/read path
//! - [`doctor`]: live self-check harness
//! - [`resilience`]: connection retry

pub mod config;
pub mod keyspace;
pub mod storage;
pub mod tags;
pub mod flush;
pub mod cache;
pub mod doctor;
pub mod resilience;
pub mod metrics;

pub use config::{CleanupMode, TagCacheConfig};
pub use keyspace::{KeySpace, TagMode};
pub use storage::traits::{Command, TagCacheError, TagStore, Topology};
pub use storage::redis::{RedisTagStore, StoreConnection};
pub use storage::memory::MemoryTagStore;
pub use tags::{TagGenerations, TagRegistry, TaggedKeyEnumerator};
pub use flush::{
    BatchClient, EagerConsistencyMaintainer, FlushReport, FlushSettings, FlushStrategy, GenerationalFlusher,
    LazyTagFlusher, OrphanPruner, PatternFlusher, PruneReport, TagInvalidator,
};
pub use cache::TaggedCache;
pub use doctor::{CheckResult, DoctorCheck, DoctorContext, DoctorHarness, DoctorReport};
pub use resilience::retry::RetryConfig;
pub use metrics::LatencyTimer;
