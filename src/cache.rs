// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tag-aware write and read path.
//!
//! A write stores the value and all of its tag bookkeeping in one dispatch,
//! so a key is never half-tagged:
//!
//! - Any mode: `SET {prefix}{key}`, `HSET` the key into each tag hash (value =
//!   expiry seconds or `0`), `SADD` the tags to the key's reverse index and to
//!   the registry. The reverse index expires with the value. Rewriting a key
//!   replaces its tag set: tags it no longer carries drop the key in the same
//!   batch, and any of them left empty are unregistered afterwards.
//! - All mode: the value lives at `{prefix}{namespace}:{key}`, where the
//!   namespace hashes the current tag ids. Each tag's entry index records the
//!   namespaced key with its expiry score (`-1` = none).
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use tag_cache::{MemoryTagStore, TagCacheConfig, TagMode, TaggedCache};
//!
//! # tokio_test_block(async {
//! let store = Arc::new(MemoryTagStore::new());
//! let config = TagCacheConfig { prefix: "app:".into(), ..Default::default() };
//! let cache = TaggedCache::new(store, &config).unwrap();
//!
//! cache.put("user:1", b"alice", &["users", "active"], None).await.unwrap();
//! cache.flush(&["users"]).await.unwrap();
//! assert_eq!(cache.get("user:1", &["users", "active"]).await.unwrap(), None);
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, instrument};

use crate::config::TagCacheConfig;
use crate::flush::{unregister_emptied, BatchClient, FlushReport, PruneReport, TagInvalidator};
use crate::keyspace::{KeySpace, TagMode};
use crate::metrics;
use crate::storage::traits::{Command, TagCacheError, TagStore};
use crate::tags::{TagGenerations, TagRegistry};

#[derive(Clone)]
pub struct TaggedCache {
    store: Arc<dyn TagStore>,
    keyspace: KeySpace,
    invalidator: TagInvalidator,
}

impl TaggedCache {
    pub fn new(store: Arc<dyn TagStore>, config: &TagCacheConfig) -> Result<Self, TagCacheError> {
        config.validate()?;
        Ok(Self {
            keyspace: KeySpace::new(config.prefix.clone(), config.tag_mode),
            invalidator: TagInvalidator::new(store.clone(), config),
            store,
        })
    }

    /// Same store and settings, other tag mode.
    pub fn with_mode(&self, mode: TagMode) -> Self {
        Self {
            keyspace: self.keyspace.with_mode(mode),
            ..self.clone()
        }
    }

    /// Same store, different invalidation settings.
    pub fn with_invalidator(&self, invalidator: TagInvalidator) -> Self {
        Self {
            invalidator,
            ..self.clone()
        }
    }

    pub fn mode(&self) -> TagMode {
        self.keyspace.mode()
    }

    pub fn keyspace(&self) -> &KeySpace {
        &self.keyspace
    }

    pub fn invalidator(&self) -> &TagInvalidator {
        &self.invalidator
    }

    pub fn store(&self) -> &Arc<dyn TagStore> {
        &self.store
    }

    /// Store key (cache prefix included) the value of `key` lives at under `tags`.
    pub async fn physical_key<S: AsRef<str> + Sync>(&self, key: &str, tags: &[S]) -> Result<String, TagCacheError> {
        KeySpace::validate_key(key)?;
        match self.keyspace.mode() {
            TagMode::Any => Ok(self.keyspace.physical_key(key)),
            TagMode::All => {
                let tags = KeySpace::normalize_tags(tags)?;
                let member = self.namespaced_member(&tags, key).await?;
                Ok(self.keyspace.physical_key(&member))
            }
        }
    }

    /// Write `value` under `key` and record it against every tag.
    /// Returns the store key the value was written to.
    #[instrument(skip(self, value, tags), fields(mode = self.keyspace.mode().as_str(), tags = tags.len()))]
    pub async fn put<S: AsRef<str> + Sync>(
        &self,
        key: &str,
        value: &[u8],
        tags: &[S],
        ttl: Option<Duration>,
    ) -> Result<String, TagCacheError> {
        KeySpace::validate_key(key)?;
        let tags = KeySpace::normalize_tags(tags)?;
        let ttl_secs = ttl.map(|d| d.as_secs().max(1));
        let expiry = ttl_secs.map(|secs| expiry_at(unix_now(), secs));

        let (physical, commands, dropped) = match self.keyspace.mode() {
            TagMode::Any => self.any_write(key, value, &tags, ttl_secs, expiry).await?,
            TagMode::All => {
                let (physical, commands) = self.all_write(key, value, &tags, ttl_secs, expiry).await?;
                (physical, commands, Vec::new())
            }
        };

        let client = BatchClient::for_store(self.store.as_ref());
        let written = match client.run(commands).await {
            Ok(_) => unregister_emptied(client, &self.keyspace, &self.registry(), &dropped).await,
            Err(e) => Err(e),
        };
        match written {
            Ok(emptied) => {
                metrics::record_write(self.keyspace.mode().as_str(), "success");
                debug!(
                    key = %physical,
                    client = client.kind(),
                    dropped_tags = dropped.len(),
                    unregistered = emptied.len(),
                    "Tagged value written"
                );
                Ok(physical)
            }
            Err(e) => {
                metrics::record_write(self.keyspace.mode().as_str(), "error");
                Err(e)
            }
        }
    }

    /// Write batch for Any mode, plus the tags the key no longer carries.
    async fn any_write(
        &self,
        key: &str,
        value: &[u8],
        tags: &[String],
        ttl_secs: Option<u64>,
        expiry: Option<i64>,
    ) -> Result<(String, Vec<Command>, Vec<String>), TagCacheError> {
        let physical = self.keyspace.physical_key(key);
        let reverse = self.keyspace.reverse_index_key(key);
        let previous = self.store.set_members(&reverse).await?;
        let dropped: Vec<String> = previous.iter().filter(|t| !tags.contains(t)).cloned().collect();
        let expiry = expiry.unwrap_or(0).to_string();

        let mut commands = vec![Command::Set {
            key: physical.clone(),
            value: value.to_vec(),
            ttl_secs,
        }];
        commands.extend(dropped.iter().map(|tag| Command::HDel {
            key: self.keyspace.tag_hash_key(tag),
            fields: vec![key.to_string()],
        }));
        commands.extend(tags.iter().map(|tag| Command::HSet {
            key: self.keyspace.tag_hash_key(tag),
            field: key.to_string(),
            value: expiry.clone(),
        }));
        if !previous.is_empty() {
            commands.push(Command::Del(vec![reverse.clone()]));
        }
        if !tags.is_empty() {
            commands.push(Command::SAdd {
                key: reverse.clone(),
                members: tags.to_vec(),
            });
            if let Some(secs) = ttl_secs {
                commands.push(Command::Expire { key: reverse, secs });
            }
            commands.push(self.registry().register(tags));
        }
        Ok((physical, commands, dropped))
    }

    async fn all_write(
        &self,
        key: &str,
        value: &[u8],
        tags: &[String],
        ttl_secs: Option<u64>,
        expiry: Option<i64>,
    ) -> Result<(String, Vec<Command>), TagCacheError> {
        let member = self.namespaced_member(tags, key).await?;
        let physical = self.keyspace.physical_key(&member);
        let score = expiry.unwrap_or(-1);

        let mut commands = vec![Command::Set {
            key: physical.clone(),
            value: value.to_vec(),
            ttl_secs,
        }];
        commands.extend(tags.iter().map(|tag| Command::ZAdd {
            key: self.keyspace.tag_hash_key(tag),
            member: member.clone(),
            score,
        }));
        if !tags.is_empty() {
            commands.push(self.registry().register(tags));
        }
        Ok((physical, commands))
    }

    /// Read the value written under `key` with `tags`; `None` once any of the
    /// tags was flushed (or the value expired).
    pub async fn get<S: AsRef<str> + Sync>(&self, key: &str, tags: &[S]) -> Result<Option<Vec<u8>>, TagCacheError> {
        let physical = self.physical_key(key, tags).await?;
        let value = self.store.get(&physical).await?;
        metrics::record_lookup(self.keyspace.mode().as_str(), value.is_some());
        Ok(value)
    }

    /// Flush `tags` in this cache's mode.
    pub async fn flush<S: AsRef<str> + Sync>(&self, tags: &[S]) -> Result<FlushReport, TagCacheError> {
        self.invalidator.flush(tags, self.keyspace.mode()).await
    }

    pub async fn flush_by_pattern(&self, pattern: &str) -> Result<u64, TagCacheError> {
        self.invalidator.flush_by_pattern(pattern).await
    }

    pub async fn prune(&self) -> Result<PruneReport, TagCacheError> {
        self.invalidator.prune(self.keyspace.mode()).await
    }

    pub async fn registered_tags(&self) -> Result<Vec<String>, TagCacheError> {
        self.registry().list().await
    }

    fn registry(&self) -> TagRegistry {
        TagRegistry::new(self.store.clone(), self.keyspace.clone())
    }

    async fn namespaced_member(&self, tags: &[String], key: &str) -> Result<String, TagCacheError> {
        let tag_ids = TagGenerations::new(self.store.clone(), self.keyspace.clone())
            .tag_ids(tags)
            .await?;
        Ok(self.keyspace.namespaced_key(&tag_ids, key))
    }
}

/// Absolute expiry in unix seconds, saturating instead of overflowing.
fn expiry_at(now: i64, ttl_secs: u64) -> i64 {
    i64::try_from(ttl_secs)
        .ok()
        .and_then(|secs| now.checked_add(secs))
        .unwrap_or(i64::MAX)
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
