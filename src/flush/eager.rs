// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::dispatch::BatchClient;
use super::{
    batch_count, batch_failure, collect_tagged_keys, reply_count, retire_tag_structures, unregister_emptied, FlushReport,
    FlushSettings, FlushStrategy,
};
use crate::keyspace::KeySpace;
use crate::metrics;
use crate::storage::traits::{Command, TagCacheError, TagStore};
use crate::tags::TagRegistry;

/// Any-mode flush that keeps every membership hash exact.
///
/// Same batches as [`LazyTagFlusher`](super::LazyTagFlusher), but each batch
/// first reads the reverse indexes of its keys and removes the keys from the
/// hashes of every non-flushed tag they belong to. Costs one extra read and
/// one extra write per batch; leaves no orphaned fields. Tags whose hash that
/// empties are unregistered at the end of the flush.
pub struct EagerConsistencyMaintainer {
    store: Arc<dyn TagStore>,
    keyspace: KeySpace,
    registry: TagRegistry,
    settings: FlushSettings,
}

impl EagerConsistencyMaintainer {
    pub fn new(store: Arc<dyn TagStore>, keyspace: KeySpace, settings: FlushSettings) -> Self {
        let registry = TagRegistry::new(store.clone(), keyspace.clone());
        Self {
            store,
            keyspace,
            registry,
            settings,
        }
    }

    /// HDEL commands removing `keys` from the hashes of tags outside `flushed`.
    fn orphan_removals(&self, keys: &[String], memberships: Vec<Vec<String>>, flushed: &[String]) -> Vec<Command> {
        let mut by_tag: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (key, tags) in keys.iter().zip(memberships) {
            for tag in tags.into_iter().filter(|t| !flushed.contains(t)) {
                by_tag.entry(tag).or_default().push(key.clone());
            }
        }

        by_tag
            .into_iter()
            .map(|(tag, fields)| Command::HDel {
                key: self.keyspace.tag_hash_key(&tag),
                fields,
            })
            .collect()
    }

    pub async fn flush_using(&self, client: BatchClient<'_>, tags: &[String]) -> Result<FlushReport, TagCacheError> {
        let keys = collect_tagged_keys(&self.store, &self.keyspace, tags, self.settings.scan_count).await?;
        let total = batch_count(keys.len(), self.settings.batch_size);
        let mut report = FlushReport::new(self.keyspace.mode(), self.name(), tags.len());
        report.keys = keys.len();
        let mut touched = BTreeSet::new();

        for (i, chunk) in keys.chunks(self.settings.batch_size).enumerate() {
            let reverse: Vec<String> = chunk.iter().map(|k| self.keyspace.reverse_index_key(k)).collect();
            let values: Vec<String> = chunk.iter().map(|k| self.keyspace.physical_key(k)).collect();

            let memberships = self
                .store
                .set_members_many(&reverse)
                .await
                .map_err(|e| batch_failure(e, i, total))?;
            touched.extend(memberships.iter().flatten().filter(|t| !tags.contains(t)).cloned());

            let mut commands = self.orphan_removals(chunk, memberships, tags);
            let removals = commands.len();
            commands.push(Command::Del(reverse));
            commands.push(Command::Unlink(values));

            let replies = client.run(commands).await.map_err(|e| batch_failure(e, i, total))?;

            let cleared: u64 = (0..removals).map(|n| reply_count(replies.get(n))).sum();
            report.orphans_cleared += cleared;
            report.deleted += reply_count(replies.last());
            report.batches += 1;
            metrics::record_batch(client.kind(), chunk.len());
            debug!(batch = i + 1, total, keys = chunk.len(), orphans = cleared, "Eager delete batch sent");
        }

        client
            .run(retire_tag_structures(&self.keyspace, &self.registry, tags))
            .await
            .map_err(|e| batch_failure(e, report.batches, total))?;

        let touched: Vec<String> = touched.into_iter().collect();
        let emptied = unregister_emptied(client, &self.keyspace, &self.registry, &touched)
            .await
            .map_err(|e| batch_failure(e, report.batches, total))?;
        if !emptied.is_empty() {
            debug!(tags = ?emptied, "Tags emptied by orphan removal unregistered");
        }

        metrics::record_orphans_cleared(report.orphans_cleared);
        Ok(report)
    }
}

#[async_trait]
impl FlushStrategy for EagerConsistencyMaintainer {
    fn name(&self) -> &'static str {
        "eager"
    }

    #[instrument(skip(self, tags), fields(tags = tags.len()))]
    async fn flush(&self, tags: &[String]) -> Result<FlushReport, TagCacheError> {
        self.flush_using(BatchClient::for_store(self.store.as_ref()), tags).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TaggedCache;
    use crate::config::{CleanupMode, TagCacheConfig};
    use crate::flush::LazyTagFlusher;
    use crate::keyspace::TagMode;
    use crate::storage::memory::MemoryTagStore;

    fn setup(store: Arc<MemoryTagStore>) -> (TaggedCache, EagerConsistencyMaintainer) {
        let config = TagCacheConfig {
            prefix: "app:".into(),
            cleanup_mode: CleanupMode::Eager,
            ..Default::default()
        };
        let cache = TaggedCache::new(store.clone(), &config).unwrap();
        let flusher =
            EagerConsistencyMaintainer::new(store, KeySpace::new("app:", TagMode::Any), FlushSettings::default());
        (cache, flusher)
    }

    #[tokio::test]
    async fn test_user_scenario_removes_key_from_other_tag() {
        let store = Arc::new(MemoryTagStore::new());
        let (cache, flusher) = setup(store.clone());
        cache.put("user:1", b"alice", &["users", "active"], None).await.unwrap();
        cache.put("user:2", b"bob", &["active"], None).await.unwrap();

        let report = flusher.flush(&["users".to_string()]).await.unwrap();

        assert_eq!(report.deleted, 1);
        assert_eq!(report.orphans_cleared, 1);
        assert_eq!(store.get("app:user:1").await.unwrap(), None);
        assert_eq!(store.hash_fields("app:_any:tag:active:entries"), vec!["user:2"]);
        assert!(store.contains("app:user:2"));
    }

    #[tokio::test]
    async fn test_emptied_other_tag_disappears() {
        let store = Arc::new(MemoryTagStore::new());
        let (cache, flusher) = setup(store.clone());
        cache.put("user:1", b"alice", &["users", "active"], None).await.unwrap();

        flusher.flush(&["users".to_string()]).await.unwrap();

        assert!(!store.contains("app:_any:tag:active:entries"));
        assert!(!store.contains("app:_any:tag:registry"));
    }

    #[tokio::test]
    async fn test_registry_matches_surviving_hashes() {
        let store = Arc::new(MemoryTagStore::new());
        let (cache, flusher) = setup(store.clone());
        cache.put("user:1", b"alice", &["users", "active", "admins"], None).await.unwrap();
        cache.put("user:2", b"bob", &["active"], None).await.unwrap();

        flusher.flush(&["users".to_string()]).await.unwrap();

        // admins lost its only field, active keeps user:2
        assert!(!store.contains("app:_any:tag:admins:entries"));
        assert_eq!(store.hash_fields("app:_any:tag:active:entries"), vec!["user:2"]);
        assert_eq!(cache.registered_tags().await.unwrap(), vec!["active"]);
    }

    #[tokio::test]
    async fn test_flushed_tags_end_state_matches_lazy() {
        let lazy_store = Arc::new(MemoryTagStore::new());
        let eager_store = Arc::new(MemoryTagStore::new());

        for store in [lazy_store.clone(), eager_store.clone()] {
            let (cache, _) = setup(store.clone());
            cache.put("user:1", b"alice", &["users", "active"], None).await.unwrap();
            cache.put("user:2", b"bob", &["users"], None).await.unwrap();
        }

        LazyTagFlusher::new(lazy_store.clone(), KeySpace::new("app:", TagMode::Any), FlushSettings::default())
            .flush(&["users".to_string()])
            .await
            .unwrap();
        setup(eager_store.clone()).1.flush(&["users".to_string()]).await.unwrap();

        for store in [&lazy_store, &eager_store] {
            assert!(!store.contains("app:user:1"));
            assert!(!store.contains("app:user:2"));
            assert!(!store.contains("app:_any:tag:users:entries"));
        }
        // only the non-flushed tag differs
        assert!(lazy_store.contains("app:_any:tag:active:entries"));
        assert!(!eager_store.contains("app:_any:tag:active:entries"));
    }

    #[tokio::test]
    async fn test_cluster_path_matches_pipelined() {
        let standalone = Arc::new(MemoryTagStore::new());
        let cluster = Arc::new(MemoryTagStore::cluster());

        for store in [standalone.clone(), cluster.clone()] {
            let (cache, flusher) = setup(store.clone());
            cache.put("user:1", b"alice", &["users", "active", "admins"], None).await.unwrap();
            cache.put("user:2", b"bob", &["users", "active"], None).await.unwrap();
            flusher.flush(&["users".to_string()]).await.unwrap();
        }

        assert_eq!(standalone.raw_keys(), cluster.raw_keys());
        // every value, membership and registry entry is gone
        assert!(cluster.raw_keys().is_empty());
    }

    #[test]
    fn test_orphan_removals_group_by_tag() {
        let store = Arc::new(MemoryTagStore::new());
        let (_, flusher) = setup(store);
        let keys = vec!["user:1".to_string(), "user:2".to_string()];
        let memberships = vec![
            vec!["active".to_string(), "users".to_string()],
            vec!["active".to_string(), "admins".to_string(), "users".to_string()],
        ];

        let commands = flusher.orphan_removals(&keys, memberships, &["users".to_string()]);

        assert_eq!(
            commands,
            vec![
                Command::HDel {
                    key: "app:_any:tag:active:entries".into(),
                    fields: vec!["user:1".into(), "user:2".into()],
                },
                Command::HDel {
                    key: "app:_any:tag:admins:entries".into(),
                    fields: vec!["user:2".into()],
                },
            ]
        );
    }
}
