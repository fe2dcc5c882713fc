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
use crate::tags::TagRegistry;

/// Any-mode flush that deletes values and reverse indexes only.
///
/// Other tags a deleted key belonged to keep their membership field; those
/// orphans are reclaimed by [`OrphanPruner`](super::OrphanPruner).
pub struct LazyTagFlusher {
    store: Arc<dyn TagStore>,
    keyspace: KeySpace,
    registry: TagRegistry,
    settings: FlushSettings,
}

impl LazyTagFlusher {
    pub fn new(store: Arc<dyn TagStore>, keyspace: KeySpace, settings: FlushSettings) -> Self {
        let registry = TagRegistry::new(store.clone(), keyspace.clone());
        Self {
            store,
            keyspace,
            registry,
            settings,
        }
    }

    /// Flush through an explicit dispatch path.
    pub async fn flush_using(&self, client: BatchClient<'_>, tags: &[String]) -> Result<FlushReport, TagCacheError> {
        let keys = collect_tagged_keys(&self.store, &self.keyspace, tags, self.settings.scan_count).await?;
        let total = batch_count(keys.len(), self.settings.batch_size);
        let mut report = FlushReport::new(self.keyspace.mode(), self.name(), tags.len());
        report.keys = keys.len();

        for (i, chunk) in keys.chunks(self.settings.batch_size).enumerate() {
            let reverse: Vec<String> = chunk.iter().map(|k| self.keyspace.reverse_index_key(k)).collect();
            let values: Vec<String> = chunk.iter().map(|k| self.keyspace.physical_key(k)).collect();

            let replies = client
                .run(vec![Command::Del(reverse), Command::Unlink(values)])
                .await
                .map_err(|e| batch_failure(e, i, total))?;

            report.deleted += reply_count(replies.get(1));
            report.batches += 1;
            metrics::record_batch(client.kind(), chunk.len());
            debug!(batch = i + 1, total, keys = chunk.len(), client = client.kind(), "Delete batch sent");
        }

        client
            .run(retire_tag_structures(&self.keyspace, &self.registry, tags))
            .await
            .map_err(|e| batch_failure(e, report.batches, total))?;

        Ok(report)
    }
}

#[async_trait]
impl FlushStrategy for LazyTagFlusher {
    fn name(&self) -> &'static str {
        "lazy"
    }

    #[instrument(skip(self, tags), fields(tags = tags.len()))]
    async fn flush(&self, tags: &[String]) -> Result<FlushReport, TagCacheError> {
        self.flush_using(BatchClient::for_store(self.store.as_ref()), tags).await
    }
}
