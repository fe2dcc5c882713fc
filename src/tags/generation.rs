// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::sync::Arc;

use crate::keyspace::KeySpace;
use crate::storage::traits::{Command, TagCacheError, TagStore};

/// All-mode generation counters.
///
/// Each tag has an integer counter in the store; a missing counter is
/// generation 0. Flushing a tag increments it, which changes the tag id and
/// therefore every namespace computed from then on.
#[derive(Clone)]
pub struct TagGenerations {
    store: Arc<dyn TagStore>,
    keyspace: KeySpace,
}

impl TagGenerations {
    pub fn new(store: Arc<dyn TagStore>, keyspace: KeySpace) -> Self {
        Self { store, keyspace }
    }

    /// Current generation of each tag, in input order.
    pub async fn current(&self, tags: &[String]) -> Result<Vec<u64>, TagCacheError> {
        let keys: Vec<String> = tags.iter().map(|t| self.keyspace.tag_version_key(t)).collect();
        let values = self.store.get_many(&keys).await?;

        values
            .into_iter()
            .zip(tags)
            .map(|(value, tag)| match value {
                None => Ok(0),
                Some(raw) => raw.parse::<u64>().map_err(|_| {
                    TagCacheError::Backend(format!("Corrupt generation for tag '{}': {}", tag, raw))
                }),
            })
            .collect()
    }

    /// Current tag ids, in input order.
    pub async fn tag_ids(&self, tags: &[String]) -> Result<Vec<String>, TagCacheError> {
        let generations = self.current(tags).await?;
        Ok(tags
            .iter()
            .zip(generations)
            .map(|(tag, generation)| self.keyspace.tag_id(tag, generation))
            .collect())
    }

    pub fn retire(&self, tag: &str) -> Command {
        Command::Incr(self.keyspace.tag_version_key(tag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyspace::TagMode;
    use crate::storage::memory::MemoryTagStore;

    fn setup() -> (Arc<MemoryTagStore>, TagGenerations) {
        let store = Arc::new(MemoryTagStore::new());
        let generations = TagGenerations::new(store.clone(), KeySpace::new("app:", TagMode::All));
        (store, generations)
    }

    #[tokio::test]
    async fn test_missing_counter_is_generation_zero() {
        let (_, generations) = setup();
        assert_eq!(generations.current(&["users".into()]).await.unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn test_retire_advances_generation_and_tag_id() {
        let (store, generations) = setup();
        let tags = vec!["users".to_string(), "active".to_string()];
        let before = generations.tag_ids(&tags).await.unwrap();

        store.execute(&[generations.retire("users")]).await.unwrap();

        assert_eq!(generations.current(&tags).await.unwrap(), vec![1, 0]);
        let after = generations.tag_ids(&tags).await.unwrap();
        assert_ne!(before[0], after[0]);
        assert_eq!(before[1], after[1]);
    }

    #[tokio::test]
    async fn test_corrupt_counter_is_an_error() {
        let (store, generations) = setup();
        store
            .execute(&[Command::Set {
                key: "app:_all:tag:users:version".into(),
                value: b"not-a-number".to_vec(),
                ttl_secs: None,
            }])
            .await
            .unwrap();

        assert!(generations.current(&["users".into()]).await.is_err());
    }
}
