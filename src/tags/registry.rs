// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::sync::Arc;

use crate::keyspace::KeySpace;
use crate::storage::traits::{Command, TagCacheError, TagStore};

/// The set of tag names known in one mode, kept in the store so every
/// process sees the same registry.
///
/// Mutations are returned as [`Command`]s so callers can put them in the same
/// batch as the structures they describe.
#[derive(Clone)]
pub struct TagRegistry {
    store: Arc<dyn TagStore>,
    keyspace: KeySpace,
}

impl TagRegistry {
    pub fn new(store: Arc<dyn TagStore>, keyspace: KeySpace) -> Self {
        Self { store, keyspace }
    }

    pub fn register(&self, tags: &[String]) -> Command {
        Command::SAdd {
            key: self.keyspace.registry_key(),
            members: tags.to_vec(),
        }
    }

    pub fn unregister(&self, tags: &[String]) -> Command {
        Command::SRem {
            key: self.keyspace.registry_key(),
            members: tags.to_vec(),
        }
    }

    /// All registered tags, sorted.
    pub async fn list(&self) -> Result<Vec<String>, TagCacheError> {
        let mut tags = self.store.set_members(&self.keyspace.registry_key()).await?;
        tags.sort();
        Ok(tags)
    }

    pub async fn contains(&self, tag: &str) -> Result<bool, TagCacheError> {
        Ok(self.list().await?.iter().any(|t| t == tag))
    }
}
