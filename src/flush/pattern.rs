// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use super::FlushSettings;
use crate::metrics;
use crate::storage::traits::{Command, TagCacheError, TagStore};

/// Deletes every key matching a glob, walking the key-space with SCAN.
///
/// Keys come back from SCAN with the connection prefix attached; the prefix
/// is stripped before UNLINK because the store applies it again. A failed
/// UNLINK batch is logged and counted as zero deletions, and the walk goes on.
/// On a cluster each primary is walked to completion with its own cursor.
pub struct PatternFlusher {
    store: Arc<dyn TagStore>,
    settings: FlushSettings,
}

#[derive(Default)]
struct Progress {
    pending: Vec<String>,
    deleted: u64,
    batches: usize,
}

impl PatternFlusher {
    pub fn new(store: Arc<dyn TagStore>, settings: FlushSettings) -> Self {
        Self { store, settings }
    }

    /// Key as the store expects it back, i.e. without the connection prefix.
    fn strip_connection_prefix(&self, raw: String) -> String {
        let prefix = self.store.key_prefix();
        match raw.strip_prefix(prefix) {
            Some(stripped) if !prefix.is_empty() => stripped.to_string(),
            _ => raw,
        }
    }

    /// Returns the number of keys actually removed.
    #[instrument(skip(self))]
    pub async fn flush(&self, pattern: &str) -> Result<u64, TagCacheError> {
        let nodes = self.store.scan_nodes().await?;
        let mut progress = Progress::default();

        if nodes.is_empty() {
            self.walk(None, pattern, &mut progress).await?;
        }
        for node in &nodes {
            self.walk(Some(node.as_str()), pattern, &mut progress).await?;
        }

        if !progress.pending.is_empty() {
            progress.deleted += self.unlink(std::mem::take(&mut progress.pending)).await;
            progress.batches += 1;
        }

        info!(
            pattern,
            deleted = progress.deleted,
            batches = progress.batches,
            nodes = nodes.len(),
            "Pattern flushed"
        );
        Ok(progress.deleted)
    }

    /// Full SCAN of one node (or of the whole store when `node` is `None`).
    async fn walk(&self, node: Option<&str>, pattern: &str, progress: &mut Progress) -> Result<(), TagCacheError> {
        let count = self.settings.scan_count;
        let mut cursor = 0;

        loop {
            let (next, keys) = match node {
                Some(address) => self.store.scan_node(address, cursor, pattern, count).await?,
                None => self.store.scan(cursor, pattern, count).await?,
            };
            for raw in keys {
                progress.pending.push(self.strip_connection_prefix(raw));
                if progress.pending.len() >= self.settings.batch_size {
                    progress.deleted += self.unlink(std::mem::take(&mut progress.pending)).await;
                    progress.batches += 1;
                }
            }

            cursor = next;
            if cursor == 0 {
                return Ok(());
            }
        }
    }

    async fn unlink(&self, keys: Vec<String>) -> u64 {
        let count = keys.len();
        match self.store.execute(&[Command::Unlink(keys)]).await {
            Ok(replies) => {
                metrics::record_batch("pattern", count);
                debug!(keys = count, "Pattern batch unlinked");
                replies.first().copied().unwrap_or(0).max(0) as u64
            }
            Err(e) => {
                metrics::record_unlink_failure("flush_by_pattern");
                warn!(keys = count, error = %e, "Pattern UNLINK batch failed, continuing");
                0
            }
        }
    }
}
