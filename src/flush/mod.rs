// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tag invalidation.
//!
//! # Strategies
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  TagInvalidator::flush(tags, mode)                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Any + Lazy  → LazyTagFlusher                                │
//! │    └─ DEL reverse indexes, UNLINK values, 1000 keys/batch    │
//! │    └─ other tags keep orphaned fields (pruned later)         │
//! │  Any + Eager → EagerConsistencyMaintainer                    │
//! │    └─ same batches, plus HDEL from every other tag first     │
//! │    └─ other tags emptied that way are unregistered           │
//! │  All         → GenerationalFlusher                           │
//! │    └─ INCR the tag generation, optional stale purge          │
//! ├──────────────────────────────────────────────────────────────┤
//! │  TagInvalidator::flush_by_pattern(glob) → PatternFlusher     │
//! │  TagInvalidator::prune(mode)            → OrphanPruner       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every strategy picks a [`BatchClient`] once per call: cluster
//! connections get one command per round-trip, standalone connections get one
//! atomic pipeline per batch.
//!
//! # Failure semantics
//!
//! Batches already sent stay applied. A failure after at least one completed
//! batch surfaces as [`TagCacheError::PartialFlush`]; a failure before any
//! batch completed propagates the store error unchanged. Nothing is retried.

mod dispatch;
mod eager;
mod generation;
mod lazy;
mod pattern;
mod prune;

pub use dispatch::BatchClient;
pub use eager::EagerConsistencyMaintainer;
pub use generation::GenerationalFlusher;
pub use lazy::LazyTagFlusher;
pub use pattern::PatternFlusher;
pub use prune::{OrphanPruner, PruneReport};

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::config::{CleanupMode, TagCacheConfig};
use crate::keyspace::{KeySpace, TagMode};
use crate::metrics::{self, LatencyTimer};
use crate::storage::traits::{Command, TagCacheError, TagStore};
use crate::tags::{TagRegistry, TaggedKeyEnumerator};

/// Batch sizing shared by every strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushSettings {
    pub batch_size: usize,
    pub scan_count: usize,
}

impl Default for FlushSettings {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            scan_count: 1000,
        }
    }
}

impl From<&TagCacheConfig> for FlushSettings {
    fn from(config: &TagCacheConfig) -> Self {
        Self {
            batch_size: config.flush_batch_size.max(1),
            scan_count: config.scan_count.max(1),
        }
    }
}

/// Outcome of one flush call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub mode: TagMode,
    pub strategy: &'static str,
    /// Distinct tags flushed
    pub tags: usize,
    /// Distinct keys found under the tags (eligible for deletion)
    pub keys: usize,
    /// Values actually removed (sum of UNLINK replies)
    pub deleted: u64,
    /// Delete batches sent
    pub batches: usize,
    /// Fields removed from non-flushed tags (eager only)
    pub orphans_cleared: u64,
}

impl FlushReport {
    pub fn new(mode: TagMode, strategy: &'static str, tags: usize) -> Self {
        Self {
            mode,
            strategy,
            tags,
            keys: 0,
            deleted: 0,
            batches: 0,
            orphans_cleared: 0,
        }
    }
}

/// A flush algorithm with the shared `flush(tags)` contract.
#[async_trait]
pub trait FlushStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Flush already-validated, de-duplicated tags.
    async fn flush(&self, tags: &[String]) -> Result<FlushReport, TagCacheError>;
}

/// Merge the keys of every tag into one de-duplicated list, in enumeration order.
pub(crate) async fn collect_tagged_keys(
    store: &Arc<dyn TagStore>,
    keyspace: &KeySpace,
    tags: &[String],
    scan_count: usize,
) -> Result<Vec<String>, TagCacheError> {
    let mut seen = HashSet::new();
    let mut keys = Vec::new();

    for tag in tags {
        let mut enumerator = TaggedKeyEnumerator::new(store.clone(), keyspace, tag, scan_count);
        while let Some(batch) = enumerator.next_batch().await? {
            for key in batch {
                if seen.insert(key.clone()) {
                    keys.push(key);
                }
            }
        }
    }
    Ok(keys)
}

/// Commands that delete the tags' own structures and unregister them together.
pub(crate) fn retire_tag_structures(keyspace: &KeySpace, registry: &TagRegistry, tags: &[String]) -> Vec<Command> {
    let mut commands: Vec<Command> = tags
        .iter()
        .map(|tag| Command::Del(vec![keyspace.tag_hash_key(tag)]))
        .collect();
    commands.push(registry.unregister(tags));
    commands
}

/// Unregister those of `tags` whose membership hash is gone. Returns them.
///
/// A writer racing this between HLEN and SREM re-registers the tag on its
/// next write.
pub(crate) async fn unregister_emptied(
    client: BatchClient<'_>,
    keyspace: &KeySpace,
    registry: &TagRegistry,
    tags: &[String],
) -> Result<Vec<String>, TagCacheError> {
    if tags.is_empty() {
        return Ok(Vec::new());
    }

    let lengths = client
        .run(tags.iter().map(|tag| Command::HLen(keyspace.tag_hash_key(tag))).collect())
        .await?;
    let emptied: Vec<String> = tags
        .iter()
        .zip(&lengths)
        .filter(|(_, len)| reply_count(Some(*len)) == 0)
        .map(|(tag, _)| tag.clone())
        .collect();

    client.run(vec![registry.unregister(&emptied)]).await?;
    Ok(emptied)
}

pub(crate) fn batch_count(keys: usize, batch_size: usize) -> usize {
    keys.div_ceil(batch_size.max(1))
}

/// Wrap a store error raised after `completed` batches.
pub(crate) fn batch_failure(error: TagCacheError, completed: usize, total: usize) -> TagCacheError {
    if completed == 0 {
        error
    } else {
        TagCacheError::PartialFlush {
            completed,
            total,
            source: Box::new(error),
        }
    }
}

/// Reply of a command slot as a non-negative count.
pub(crate) fn reply_count(reply: Option<&Option<i64>>) -> u64 {
    reply.copied().flatten().unwrap_or(0).max(0) as u64
}

/// Entry point for tag and pattern invalidation.
#[derive(Clone)]
pub struct TagInvalidator {
    store: Arc<dyn TagStore>,
    prefix: String,
    cleanup: CleanupMode,
    settings: FlushSettings,
    purge_stale: bool,
}

impl TagInvalidator {
    pub fn new(store: Arc<dyn TagStore>, config: &TagCacheConfig) -> Self {
        Self {
            store,
            prefix: config.prefix.clone(),
            cleanup: config.cleanup_mode,
            settings: FlushSettings::from(config),
            purge_stale: config.purge_stale_on_flush,
        }
    }

    /// Same store and settings, different Any-mode cleanup policy.
    pub fn with_cleanup(&self, cleanup: CleanupMode) -> Self {
        Self {
            cleanup,
            ..self.clone()
        }
    }

    pub fn with_purge_stale(&self, purge_stale: bool) -> Self {
        Self {
            purge_stale,
            ..self.clone()
        }
    }

    pub fn cleanup(&self) -> CleanupMode {
        self.cleanup
    }

    pub fn settings(&self) -> FlushSettings {
        self.settings
    }

    pub fn keyspace(&self, mode: TagMode) -> KeySpace {
        KeySpace::new(self.prefix.clone(), mode)
    }

    /// The strategy `flush` uses for `mode` under the current configuration.
    pub fn strategy(&self, mode: TagMode) -> Box<dyn FlushStrategy> {
        let keyspace = self.keyspace(mode);
        match (mode, self.cleanup) {
            (TagMode::Any, CleanupMode::Lazy) => {
                Box::new(LazyTagFlusher::new(self.store.clone(), keyspace, self.settings))
            }
            (TagMode::Any, CleanupMode::Eager) => {
                Box::new(EagerConsistencyMaintainer::new(self.store.clone(), keyspace, self.settings))
            }
            (TagMode::All, _) => Box::new(GenerationalFlusher::new(
                self.store.clone(),
                keyspace,
                self.settings,
                self.purge_stale,
            )),
        }
    }

    /// Invalidate every entry tagged with any of `tags`.
    ///
    /// Flushing tags that hold nothing is a no-op that reports zero keys.
    #[instrument(skip(self, tags), fields(mode = mode.as_str(), tags = tags.len()))]
    pub async fn flush<S: AsRef<str> + Sync>(&self, tags: &[S], mode: TagMode) -> Result<FlushReport, TagCacheError> {
        let tags = KeySpace::normalize_tags(tags)?;
        let strategy = self.strategy(mode);
        if tags.is_empty() {
            return Ok(FlushReport::new(mode, strategy.name(), 0));
        }

        let _timer = LatencyTimer::new("flush", mode.as_str());
        match strategy.flush(&tags).await {
            Ok(report) => {
                metrics::record_flush(mode.as_str(), strategy.name(), "success");
                metrics::record_keys_invalidated(mode.as_str(), report.deleted);
                info!(
                    strategy = strategy.name(),
                    keys = report.keys,
                    deleted = report.deleted,
                    batches = report.batches,
                    orphans_cleared = report.orphans_cleared,
                    "Tags flushed"
                );
                Ok(report)
            }
            Err(e) => {
                let status = if matches!(e, TagCacheError::PartialFlush { .. }) { "partial" } else { "error" };
                metrics::record_flush(mode.as_str(), strategy.name(), status);
                warn!(strategy = strategy.name(), error = %e, "Tag flush failed");
                Err(e)
            }
        }
    }

    /// Delete every key matching `pattern` (store glob syntax).
    pub async fn flush_by_pattern(&self, pattern: &str) -> Result<u64, TagCacheError> {
        let _timer = LatencyTimer::new("flush_by_pattern", "pattern");
        PatternFlusher::new(self.store.clone(), self.settings).flush(pattern).await
    }

    /// Remove orphaned membership entries and unregister empty tags.
    pub async fn prune(&self, mode: TagMode) -> Result<PruneReport, TagCacheError> {
        let _timer = LatencyTimer::new("prune", mode.as_str());
        OrphanPruner::new(self.store.clone(), self.keyspace(mode), self.settings)
            .prune()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryTagStore;

    fn config(cleanup: CleanupMode) -> TagCacheConfig {
        TagCacheConfig {
            prefix: "app:".into(),
            cleanup_mode: cleanup,
            ..Default::default()
        }
    }

    #[test]
    fn test_batch_count() {
        assert_eq!(batch_count(0, 1000), 0);
        assert_eq!(batch_count(1000, 1000), 1);
        assert_eq!(batch_count(2500, 1000), 3);
    }

    #[test]
    fn test_batch_failure_wraps_only_after_progress() {
        let raw = batch_failure(TagCacheError::Backend("down".into()), 0, 3);
        assert!(matches!(raw, TagCacheError::Backend(_)));

        let partial = batch_failure(TagCacheError::Backend("down".into()), 2, 3);
        assert!(matches!(partial, TagCacheError::PartialFlush { completed: 2, total: 3, .. }));
        assert!(partial.to_string().contains("after 2 of 3 batches"));
    }

    #[test]
    fn test_strategy_selection() {
        let store: Arc<dyn TagStore> = Arc::new(MemoryTagStore::new());
        let lazy = TagInvalidator::new(store.clone(), &config(CleanupMode::Lazy));
        let eager = lazy.with_cleanup(CleanupMode::Eager);

        assert_eq!(lazy.strategy(TagMode::Any).name(), "lazy");
        assert_eq!(eager.strategy(TagMode::Any).name(), "eager");
        assert_eq!(eager.strategy(TagMode::All).name(), "generational");
    }

    #[tokio::test]
    async fn test_flush_rejects_invalid_tags_before_touching_store() {
        let store = Arc::new(MemoryTagStore::new());
        let invalidator = TagInvalidator::new(store.clone(), &config(CleanupMode::Lazy));

        let result = invalidator.flush(&["users*"], TagMode::Any).await;

        assert!(matches!(result, Err(TagCacheError::InvalidName { .. })));
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_flush_of_no_tags_is_a_no_op() {
        let store = Arc::new(MemoryTagStore::new());
        let invalidator = TagInvalidator::new(store.clone(), &config(CleanupMode::Lazy));

        let report = invalidator.flush::<&str>(&[], TagMode::Any).await.unwrap();

        assert_eq!(report.keys, 0);
        assert!(store.calls().is_empty());
    }
}
