// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TagCacheError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Pipelined command rejected by cluster topology: {0}")]
    TopologyMismatch(String),
    #[error("Flush aborted after {completed} of {total} batches: {source}")]
    PartialFlush {
        completed: usize,
        total: usize,
        #[source]
        source: Box<TagCacheError>,
    },
    #[error("Invalid {kind} '{name}': {reason}")]
    InvalidName {
        kind: &'static str,
        name: String,
        reason: &'static str,
    },
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl From<redis::RedisError> for TagCacheError {
    fn from(e: redis::RedisError) -> Self {
        TagCacheError::Backend(e.to_string())
    }
}

/// Connection topology, fixed for the lifetime of a store handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// Single node (or proxy): multi-key pipelines are allowed.
    Standalone,
    /// Sharded cluster: no atomic pipelines across slots.
    Cluster,
}

/// A store mutation. Every command replies with an integer:
/// affected count for DEL/UNLINK/HDEL/SADD/SREM/ZADD/ZREMRANGEBYSCORE,
/// cardinality for HLEN/ZCARD, the new value for INCR, `1` for SET and
/// `1`/`0` for EXPIRE (key existed or not).
///
/// Keys are logical to the store: the store adds its connection prefix.
/// Hash fields and set members are never prefixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Set { key: String, value: Vec<u8>, ttl_secs: Option<u64> },
    Expire { key: String, secs: u64 },
    Del(Vec<String>),
    Unlink(Vec<String>),
    HSet { key: String, field: String, value: String },
    HDel { key: String, fields: Vec<String> },
    HLen(String),
    SAdd { key: String, members: Vec<String> },
    SRem { key: String, members: Vec<String> },
    ZAdd { key: String, member: String, score: i64 },
    ZRemRangeByScore { key: String, min: i64, max: i64 },
    ZCard(String),
    Incr(String),
}

impl Command {
    /// True when the command carries no keys/fields/members and must not be sent.
    pub fn is_empty(&self) -> bool {
        match self {
            Command::Del(keys) | Command::Unlink(keys) => keys.is_empty(),
            Command::HDel { fields, .. } => fields.is_empty(),
            Command::SAdd { members, .. } | Command::SRem { members, .. } => members.is_empty(),
            _ => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Set { .. } => "SET",
            Command::Expire { .. } => "EXPIRE",
            Command::Del(_) => "DEL",
            Command::Unlink(_) => "UNLINK",
            Command::HSet { .. } => "HSET",
            Command::HDel { .. } => "HDEL",
            Command::HLen(_) => "HLEN",
            Command::SAdd { .. } => "SADD",
            Command::SRem { .. } => "SREM",
            Command::ZAdd { .. } => "ZADD",
            Command::ZRemRangeByScore { .. } => "ZREMRANGEBYSCORE",
            Command::ZCard(_) => "ZCARD",
            Command::Incr(_) => "INCR",
        }
    }
}

/// The store operations the tag layer needs.
///
/// Implementations apply their connection prefix to every key they send.
/// Keys returned by [`TagStore::scan`] are raw, i.e. they still carry that prefix.
#[async_trait]
pub trait TagStore: Send + Sync {
    fn topology(&self) -> Topology;

    /// Client-level prefix applied to every key on the wire ("" when unset).
    fn key_prefix(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TagCacheError>;

    /// String values for many keys, `None` where missing.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, TagCacheError>;

    async fn exists_many(&self, keys: &[String]) -> Result<Vec<bool>, TagCacheError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, TagCacheError>;

    /// SMEMBERS for many keys. Default implementation issues one read per key.
    async fn set_members_many(&self, keys: &[String]) -> Result<Vec<Vec<String>>, TagCacheError> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.set_members(key).await?);
        }
        Ok(out)
    }

    /// One HSCAN step: field names only. Cursor 0 starts and ends the iteration.
    async fn hash_scan(&self, key: &str, cursor: u64, count: usize) -> Result<(u64, Vec<String>), TagCacheError>;

    /// One ZSCAN step: member names only.
    async fn sorted_set_scan(&self, key: &str, cursor: u64, count: usize) -> Result<(u64, Vec<String>), TagCacheError>;

    /// One SCAN step over the key-space. The pattern is prefixed by the store;
    /// returned keys include the connection prefix.
    ///
    /// A cursor is only meaningful on the node that issued it, so cluster
    /// stores reject this with [`TagCacheError::TopologyMismatch`] and walk
    /// each node through [`TagStore::scan_node`] instead.
    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>), TagCacheError>;

    /// Addresses of the primaries a full key-space walk must visit.
    /// Empty for a standalone store, where [`TagStore::scan`] sees every key.
    async fn scan_nodes(&self) -> Result<Vec<String>, TagCacheError>;

    /// One SCAN step pinned to the node at `address` (from [`TagStore::scan_nodes`]).
    async fn scan_node(
        &self,
        address: &str,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), TagCacheError>;

    /// Run commands one by one, one round-trip each.
    async fn execute(&self, commands: &[Command]) -> Result<Vec<i64>, TagCacheError>;

    /// Run commands as a single atomic pipeline (one round-trip).
    /// Cluster stores reject this with [`TagCacheError::TopologyMismatch`].
    async fn execute_pipeline(&self, commands: &[Command]) -> Result<Vec<i64>, TagCacheError>;
}
