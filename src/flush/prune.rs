// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Scheduled reclamation of orphaned tag bookkeeping.
//!
//! Lazy flushes leave membership fields in tags that were not flushed, and
//! values expire without their tags noticing. The pruner walks the registry
//! and removes both kinds of leftovers:
//!
//! - Any mode: fields whose value key no longer exists, together with the
//!   reverse index of each such key.
//! - All mode: index entries whose expiry score is in the past.
//!
//! A tag whose structure ends up empty is unregistered. A writer racing the
//! pruner re-registers its tags on every write, so a tag unregistered in that
//! window is restored by the next write to it.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{debug, info, instrument};

use super::dispatch::BatchClient;
use super::{reply_count, FlushSettings};
use crate::keyspace::{KeySpace, TagMode};
use crate::metrics;
use crate::storage::traits::{Command, TagCacheError, TagStore};
use crate::tags::{TagRegistry, TaggedKeyEnumerator};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub tags_scanned: usize,
    pub fields_removed: u64,
    pub tags_removed: u64,
}

pub struct OrphanPruner {
    store: Arc<dyn TagStore>,
    keyspace: KeySpace,
    registry: TagRegistry,
    settings: FlushSettings,
}

impl OrphanPruner {
    pub fn new(store: Arc<dyn TagStore>, keyspace: KeySpace, settings: FlushSettings) -> Self {
        let registry = TagRegistry::new(store.clone(), keyspace.clone());
        Self {
            store,
            keyspace,
            registry,
            settings,
        }
    }

    #[instrument(skip(self), fields(mode = self.keyspace.mode().as_str()))]
    pub async fn prune(&self) -> Result<PruneReport, TagCacheError> {
        let client = BatchClient::for_store(self.store.as_ref());
        let mut report = PruneReport::default();

        for tag in self.registry.list().await? {
            report.tags_scanned += 1;
            let remaining = match self.keyspace.mode() {
                TagMode::Any => self.prune_hash(client, &tag, &mut report).await?,
                TagMode::All => self.prune_index(client, &tag, &mut report).await?,
            };

            if remaining == 0 {
                client.run(vec![self.registry.unregister(&[tag.clone()])]).await?;
                report.tags_removed += 1;
                debug!(tag = %tag, "Empty tag unregistered");
            }
        }

        metrics::record_prune(self.keyspace.mode().as_str(), report.fields_removed, report.tags_removed);
        info!(
            tags_scanned = report.tags_scanned,
            fields_removed = report.fields_removed,
            tags_removed = report.tags_removed,
            "Tag registry pruned"
        );
        Ok(report)
    }

    /// Drop fields whose value is gone, and the reverse index of every such
    /// key. Returns the fields left.
    async fn prune_hash(&self, client: BatchClient<'_>, tag: &str, report: &mut PruneReport) -> Result<i64, TagCacheError> {
        let hash = self.keyspace.tag_hash_key(tag);
        let fields = TaggedKeyEnumerator::new(self.store.clone(), &self.keyspace, tag, self.settings.scan_count)
            .collect()
            .await?;

        // read everything before the first write so HDEL never shifts the scan
        let mut missing = Vec::new();
        for chunk in fields.chunks(self.settings.batch_size) {
            let values: Vec<String> = chunk.iter().map(|k| self.keyspace.physical_key(k)).collect();
            let exists = self.store.exists_many(&values).await?;
            missing.extend(chunk.iter().zip(exists).filter(|(_, e)| !e).map(|(k, _)| k.clone()));
        }

        for chunk in missing.chunks(self.settings.batch_size) {
            let reverse: Vec<String> = chunk.iter().map(|k| self.keyspace.reverse_index_key(k)).collect();
            let replies = client
                .run(vec![
                    Command::HDel {
                        key: hash.clone(),
                        fields: chunk.to_vec(),
                    },
                    Command::Del(reverse),
                ])
                .await?;
            report.fields_removed += reply_count(replies.first());
        }

        let replies = client.run(vec![Command::HLen(hash)]).await?;
        Ok(replies.first().copied().flatten().unwrap_or(0))
    }

    /// Drop entries whose expiry has passed. Returns the entries left.
    async fn prune_index(&self, client: BatchClient<'_>, tag: &str, report: &mut PruneReport) -> Result<i64, TagCacheError> {
        let index = self.keyspace.tag_hash_key(tag);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let replies = client
            .run(vec![
                Command::ZRemRangeByScore {
                    key: index.clone(),
                    min: 0,
                    max: now,
                },
                Command::ZCard(index),
            ])
            .await?;

        report.fields_removed += reply_count(replies.first());
        Ok(replies.get(1).copied().flatten().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::cache::TaggedCache;
    use crate::config::TagCacheConfig;
    use crate::flush::{FlushStrategy, LazyTagFlusher};
    use crate::storage::memory::MemoryTagStore;

    fn config(mode: TagMode) -> TagCacheConfig {
        TagCacheConfig {
            prefix: "app:".into(),
            tag_mode: mode,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_reclaims_lazy_orphans() {
        let store = Arc::new(MemoryTagStore::new());
        let cache = TaggedCache::new(store.clone(), &config(TagMode::Any)).unwrap();
        cache.put("user:1", b"alice", &["users", "active"], None).await.unwrap();
        cache.put("user:2", b"bob", &["active"], None).await.unwrap();
        let keyspace = KeySpace::new("app:", TagMode::Any);

        LazyTagFlusher::new(store.clone(), keyspace.clone(), FlushSettings::default())
            .flush(&["users".to_string()])
            .await
            .unwrap();
        assert_eq!(store.hash_fields("app:_any:tag:active:entries"), vec!["user:1", "user:2"]);

        let report = OrphanPruner::new(store.clone(), keyspace, FlushSettings::default())
            .prune()
            .await
            .unwrap();

        assert_eq!(report.tags_scanned, 1);
        assert_eq!(report.fields_removed, 1);
        assert_eq!(report.tags_removed, 0);
        assert_eq!(store.hash_fields("app:_any:tag:active:entries"), vec!["user:2"]);
    }

    #[tokio::test]
    async fn test_unregisters_emptied_tags() {
        let store = Arc::new(MemoryTagStore::new());
        let cache = TaggedCache::new(store.clone(), &config(TagMode::Any)).unwrap();
        cache.put("user:1", b"alice", &["active"], None).await.unwrap();
        store.execute(&[Command::Del(vec!["app:user:1".into()])]).await.unwrap();
        let keyspace = KeySpace::new("app:", TagMode::Any);

        let report = OrphanPruner::new(store.clone(), keyspace.clone(), FlushSettings::default())
            .prune()
            .await
            .unwrap();

        assert_eq!(report.tags_removed, 1);
        assert!(!store.contains("app:_any:tag:active:entries"));
        assert!(TagRegistry::new(store, keyspace).list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_value_leaves_nothing_behind() {
        let store = Arc::new(MemoryTagStore::new());
        let cache = TaggedCache::new(store.clone(), &config(TagMode::Any)).unwrap();
        cache
            .put("user:1", b"alice", &["users", "active"], Some(Duration::from_secs(60)))
            .await
            .unwrap();
        // expiry of the value
        store.execute(&[Command::Del(vec!["app:user:1".into()])]).await.unwrap();

        let report = cache.prune().await.unwrap();

        assert_eq!(report.fields_removed, 2);
        assert_eq!(report.tags_removed, 2);
        assert!(store.is_empty(), "left behind: {:?}", store.raw_keys());
    }

    #[tokio::test]
    async fn test_cluster_prune_leaves_nothing_behind() {
        let store = Arc::new(MemoryTagStore::cluster());
        let cache = TaggedCache::new(store.clone(), &config(TagMode::Any)).unwrap();
        cache.put("user:1", b"alice", &["users"], None).await.unwrap();
        cache.put("user:2", b"bob", &["users"], None).await.unwrap();
        store.execute(&[Command::Del(vec!["app:user:1".into()])]).await.unwrap();

        cache.prune().await.unwrap();

        assert_eq!(
            store.raw_keys(),
            vec![
                "app:_any:tag:registry",
                "app:_any:tag:users:entries",
                "app:user:2",
                "app:user:2:_any:tags",
            ]
        );
    }

    #[tokio::test]
    async fn test_all_mode_drops_expired_entries_only() {
        let store = Arc::new(MemoryTagStore::cluster());
        let keyspace = KeySpace::new("app:", TagMode::All);
        let index = keyspace.tag_hash_key("users");
        store
            .execute(&[
                Command::ZAdd { key: index.clone(), member: "ns:forever".into(), score: -1 },
                Command::ZAdd { key: index.clone(), member: "ns:expired".into(), score: 100 },
                Command::SAdd { key: keyspace.registry_key(), members: vec!["users".into()] },
            ])
            .await
            .unwrap();

        let report = OrphanPruner::new(store.clone(), keyspace, FlushSettings::default())
            .prune()
            .await
            .unwrap();

        assert_eq!(report.fields_removed, 1);
        assert_eq!(report.tags_removed, 0);
        assert_eq!(store.sorted_set_members(&index), vec!["ns:forever"]);
    }

    #[tokio::test]
    async fn test_empty_registry_is_a_no_op() {
        let store = Arc::new(MemoryTagStore::new());
        let report = OrphanPruner::new(store.clone(), KeySpace::new("app:", TagMode::Any), FlushSettings::default())
            .prune()
            .await
            .unwrap();

        assert_eq!(report, PruneReport::default());
        assert!(store.calls().is_empty());
    }
}
