// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::sync::Arc;

use crate::keyspace::{KeySpace, TagMode};
use crate::storage::traits::{TagCacheError, TagStore};

/// Restartable cursor over the keys recorded against one tag.
///
/// Any mode walks the membership hash (field names are logical keys). All
/// mode walks the entry index (members are namespaced logical keys). Each
/// step holds at most one scan page in memory. A missing tag yields nothing.
///
/// This is a snapshot-style read, not a live view: call [`restart`](Self::restart)
/// to read again after the tag was mutated.
pub struct TaggedKeyEnumerator {
    store: Arc<dyn TagStore>,
    structure_key: String,
    mode: TagMode,
    count: usize,
    cursor: u64,
    finished: bool,
}

impl TaggedKeyEnumerator {
    pub fn new(store: Arc<dyn TagStore>, keyspace: &KeySpace, tag: &str, count: usize) -> Self {
        Self {
            store,
            structure_key: keyspace.tag_hash_key(tag),
            mode: keyspace.mode(),
            count: count.max(1),
            cursor: 0,
            finished: false,
        }
    }

    /// Next page of keys, `None` once the cursor has wrapped.
    /// A page may be empty while the cursor is still running.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<String>>, TagCacheError> {
        if self.finished {
            return Ok(None);
        }

        let (next, keys) = match self.mode {
            TagMode::Any => self.store.hash_scan(&self.structure_key, self.cursor, self.count).await?,
            TagMode::All => self.store.sorted_set_scan(&self.structure_key, self.cursor, self.count).await?,
        };

        self.cursor = next;
        if next == 0 {
            self.finished = true;
        }
        Ok(Some(keys))
    }

    pub fn restart(&mut self) {
        self.cursor = 0;
        self.finished = false;
    }

    /// Drain the remaining pages into one list.
    pub async fn collect(&mut self) -> Result<Vec<String>, TagCacheError> {
        let mut keys = Vec::new();
        while let Some(batch) = self.next_batch().await? {
            keys.extend(batch);
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryTagStore;
    use crate::storage::traits::Command;

    fn tag_field(key: &str, field: &str) -> Command {
        Command::HSet {
            key: key.into(),
            field: field.into(),
            value: "0".into(),
        }
    }

    #[tokio::test]
    async fn test_missing_tag_is_empty() {
        let store = Arc::new(MemoryTagStore::new());
        let ks = KeySpace::new("app:", TagMode::Any);
        let mut keys = TaggedKeyEnumerator::new(store, &ks, "nothing", 10);

        assert!(keys.collect().await.unwrap().is_empty());
        assert!(keys.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pages_through_hash_and_restarts() {
        let store = Arc::new(MemoryTagStore::new());
        let ks = KeySpace::new("app:", TagMode::Any);
        let hash = ks.tag_hash_key("users");
        let commands: Vec<Command> = (0..25).map(|i| tag_field(&hash, &format!("user:{:02}", i))).collect();
        store.execute(&commands).await.unwrap();

        let mut keys = TaggedKeyEnumerator::new(store.clone(), &ks, "users", 10);
        let mut pages = 0;
        let mut seen = Vec::new();
        while let Some(batch) = keys.next_batch().await.unwrap() {
            pages += 1;
            seen.extend(batch);
        }
        assert_eq!(pages, 3);
        assert_eq!(seen.len(), 25);
        assert_eq!(seen[0], "user:00");

        keys.restart();
        assert_eq!(keys.collect().await.unwrap(), seen);
    }

    #[tokio::test]
    async fn test_all_mode_reads_entry_index() {
        let store = Arc::new(MemoryTagStore::new());
        let ks = KeySpace::new("app:", TagMode::All);
        store
            .execute(&[Command::ZAdd {
                key: ks.tag_hash_key("users"),
                member: "abc:user:1".into(),
                score: -1,
            }])
            .await
            .unwrap();

        let mut keys = TaggedKeyEnumerator::new(store, &ks, "users", 10);
        assert_eq!(keys.collect().await.unwrap(), vec!["abc:user:1"]);
    }

    #[tokio::test]
    async fn test_store_errors_propagate() {
        let store = Arc::new(MemoryTagStore::new());
        let ks = KeySpace::new("app:", TagMode::Any);
        store
            .execute(&[Command::Set {
                key: ks.tag_hash_key("users"),
                value: b"not a hash".to_vec(),
                ttl_secs: None,
            }])
            .await
            .unwrap();

        let mut keys = TaggedKeyEnumerator::new(store, &ks, "users", 10);
        assert!(keys.collect().await.is_err());
    }
}
