// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::dispatch::BatchClient;
use super::{batch_count, batch_failure, collect_tagged_keys, reply_count, retire_tag_structures, FlushReport, FlushSettings, FlushStrategy};
use crate::keyspace::KeySpace;
use crate::metrics;
use crate::storage::traits::{Command, TagCacheError, TagStore};
use crate::tags::{TagGenerations, TagRegistry};

/// All-mode flush: retire the tag's generation.
///
/// Incrementing the generation changes the tag id, so every namespace that
/// includes the tag is recomputed differently and old values are unreachable.
/// No value has to be deleted for correctness; with `purge_stale` the values
/// recorded in the entry index are unlinked as well instead of waiting for
/// their TTL.
///
/// The generation is retired before the purge reads the index. A value
/// written under the new generation in that window may be purged too, which
/// costs a cache miss but never serves stale data.
pub struct GenerationalFlusher {
    store: Arc<dyn TagStore>,
    keyspace: KeySpace,
    registry: TagRegistry,
    generations: TagGenerations,
    settings: FlushSettings,
    purge_stale: bool,
}

impl GenerationalFlusher {
    pub fn new(store: Arc<dyn TagStore>, keyspace: KeySpace, settings: FlushSettings, purge_stale: bool) -> Self {
        let registry = TagRegistry::new(store.clone(), keyspace.clone());
        let generations = TagGenerations::new(store.clone(), keyspace.clone());
        Self {
            store,
            keyspace,
            registry,
            generations,
            settings,
            purge_stale,
        }
    }

    pub async fn flush_using(&self, client: BatchClient<'_>, tags: &[String]) -> Result<FlushReport, TagCacheError> {
        let mut report = FlushReport::new(self.keyspace.mode(), self.name(), tags.len());
        let retire: Vec<Command> = tags.iter().map(|t| self.generations.retire(t)).collect();

        if !self.purge_stale {
            let mut commands = retire;
            commands.extend(retire_tag_structures(&self.keyspace, &self.registry, tags));
            client.run(commands).await?;
            return Ok(report);
        }

        client.run(retire).await?;

        let members = collect_tagged_keys(&self.store, &self.keyspace, tags, self.settings.scan_count).await?;
        let total = batch_count(members.len(), self.settings.batch_size);
        report.keys = members.len();

        for (i, chunk) in members.chunks(self.settings.batch_size).enumerate() {
            let values: Vec<String> = chunk.iter().map(|m| self.keyspace.physical_key(m)).collect();
            let replies = client
                .run(vec![Command::Unlink(values)])
                .await
                .map_err(|e| batch_failure(e, i, total))?;

            report.deleted += reply_count(replies.first());
            report.batches += 1;
            metrics::record_batch(client.kind(), chunk.len());
            debug!(batch = i + 1, total, keys = chunk.len(), "Stale generation batch unlinked");
        }

        client
            .run(retire_tag_structures(&self.keyspace, &self.registry, tags))
            .await
            .map_err(|e| batch_failure(e, report.batches, total))?;

        Ok(report)
    }
}

#[async_trait]
impl FlushStrategy for GenerationalFlusher {
    fn name(&self) -> &'static str {
        "generational"
    }

    #[instrument(skip(self, tags), fields(tags = tags.len(), purge = self.purge_stale))]
    async fn flush(&self, tags: &[String]) -> Result<FlushReport, TagCacheError> {
        self.flush_using(BatchClient::for_store(self.store.as_ref()), tags).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TaggedCache;
    use crate::config::TagCacheConfig;
    use crate::keyspace::TagMode;
    use crate::storage::memory::MemoryTagStore;

    fn setup(store: Arc<MemoryTagStore>, purge: bool) -> (TaggedCache, GenerationalFlusher) {
        let config = TagCacheConfig {
            prefix: "app:".into(),
            tag_mode: TagMode::All,
            ..Default::default()
        };
        let cache = TaggedCache::new(store.clone(), &config).unwrap();
        let flusher = GenerationalFlusher::new(store, KeySpace::new("app:", TagMode::All), FlushSettings::default(), purge);
        (cache, flusher)
    }

    #[tokio::test]
    async fn test_flush_makes_entries_unreachable() {
        let store = Arc::new(MemoryTagStore::new());
        let (cache, flusher) = setup(store.clone(), false);
        let physical = cache.put("user:1", b"alice", &["users", "active"], None).await.unwrap();
        assert_eq!(cache.get("user:1", &["active", "users"]).await.unwrap(), Some(b"alice".to_vec()));

        let report = flusher.flush(&["users".to_string()]).await.unwrap();

        assert_eq!(report.keys, 0);
        assert_eq!(cache.get("user:1", &["users", "active"]).await.unwrap(), None);
        // the old value is left for its TTL
        assert!(store.contains(&physical));
        assert_eq!(store.get("app:_all:tag:users:version").await.unwrap(), Some(b"1".to_vec()));
        assert!(!store.contains("app:_all:tag:users:entries"));
    }

    #[tokio::test]
    async fn test_unrelated_tag_combinations_stay_reachable() {
        let store = Arc::new(MemoryTagStore::new());
        let (cache, flusher) = setup(store.clone(), false);
        cache.put("user:1", b"alice", &["users"], None).await.unwrap();
        cache.put("post:1", b"hello", &["posts"], None).await.unwrap();

        flusher.flush(&["users".to_string()]).await.unwrap();

        assert_eq!(cache.get("post:1", &["posts"]).await.unwrap(), Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn test_rewrite_after_flush_uses_new_namespace() {
        let store = Arc::new(MemoryTagStore::new());
        let (cache, flusher) = setup(store.clone(), false);
        let before = cache.put("user:1", b"alice", &["users"], None).await.unwrap();

        flusher.flush(&["users".to_string()]).await.unwrap();
        let after = cache.put("user:1", b"alice2", &["users"], None).await.unwrap();

        assert_ne!(before, after);
        assert_eq!(cache.get("user:1", &["users"]).await.unwrap(), Some(b"alice2".to_vec()));
    }

    #[tokio::test]
    async fn test_purge_unlinks_stale_values() {
        let store = Arc::new(MemoryTagStore::new());
        let (cache, flusher) = setup(store.clone(), true);
        let first = cache.put("user:1", b"alice", &["users", "active"], None).await.unwrap();
        let second = cache.put("user:2", b"bob", &["users"], None).await.unwrap();

        let report = flusher.flush(&["users".to_string()]).await.unwrap();

        assert_eq!(report.keys, 2);
        assert_eq!(report.deleted, 2);
        assert!(!store.contains(&first));
        assert!(!store.contains(&second));
        assert!(!store.contains("app:_all:tag:users:entries"));
    }

    #[tokio::test]
    async fn test_purge_cluster_matches_pipelined() {
        let standalone = Arc::new(MemoryTagStore::new());
        let cluster = Arc::new(MemoryTagStore::cluster());

        for store in [standalone.clone(), cluster.clone()] {
            let (cache, flusher) = setup(store.clone(), true);
            cache.put("user:1", b"alice", &["users", "active"], None).await.unwrap();
            flusher.flush(&["users".to_string()]).await.unwrap();
        }

        assert_eq!(standalone.raw_keys(), cluster.raw_keys());
    }

    #[tokio::test]
    async fn test_second_flush_only_advances_generation() {
        let store = Arc::new(MemoryTagStore::new());
        let (cache, flusher) = setup(store.clone(), true);
        cache.put("user:1", b"alice", &["users"], None).await.unwrap();

        flusher.flush(&["users".to_string()]).await.unwrap();
        let again = flusher.flush(&["users".to_string()]).await.unwrap();

        assert_eq!(again.keys, 0);
        assert_eq!(again.deleted, 0);
        assert_eq!(store.get("app:_all:tag:users:version").await.unwrap(), Some(b"2".to_vec()));
    }
}
