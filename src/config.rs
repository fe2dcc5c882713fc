// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the tag layer.
//!
//! # Example
//!
//! ```
//! use tag_cache::{CleanupMode, TagCacheConfig, TagMode};
//!
//! // Minimal config (uses defaults)
//! let config = TagCacheConfig::default();
//! assert_eq!(config.flush_batch_size, 1000);
//! assert_eq!(config.tag_mode, TagMode::Any);
//! assert_eq!(config.cleanup_mode, CleanupMode::Lazy);
//!
//! // Deserialized from the host's config source
//! let config: TagCacheConfig = serde_json::from_str(r#"{
//!     "redis_url": "redis://localhost:6379",
//!     "prefix": "app:",
//!     "tag_mode": "all",
//!     "purge_stale_on_flush": true
//! }"#).unwrap();
//! assert_eq!(config.tag_mode, TagMode::All);
//! ```

use serde::{Deserialize, Serialize};

use crate::keyspace::TagMode;
use crate::storage::traits::TagCacheError;

/// How an Any-mode flush treats the other tags of a deleted key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupMode {
    /// Leave orphaned fields in non-flushed tags for the pruner.
    #[default]
    Lazy,
    /// Remove the key from every other tag's membership hash during the flush.
    Eager,
}

impl CleanupMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupMode::Lazy => "lazy",
            CleanupMode::Eager => "eager",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TagCacheConfig {
    /// Redis connection string (e.g., "redis://localhost:6379")
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Cluster seed nodes. When non-empty a cluster connection is used.
    #[serde(default)]
    pub cluster_nodes: Vec<String>,

    /// Client-level prefix applied to every key on the wire.
    #[serde(default)]
    pub connection_prefix: String,

    /// Cache prefix, the start of every physical key this layer writes.
    #[serde(default)]
    pub prefix: String,

    #[serde(default)]
    pub tag_mode: TagMode,

    #[serde(default)]
    pub cleanup_mode: CleanupMode,

    /// Keys per delete batch
    #[serde(default = "default_flush_batch_size")]
    pub flush_batch_size: usize,

    /// SCAN/HSCAN/ZSCAN COUNT hint
    #[serde(default = "default_scan_count")]
    pub scan_count: usize,

    /// All mode: also delete entries written under a retired generation.
    #[serde(default)]
    pub purge_stale_on_flush: bool,

    /// Name prefix for doctor test data
    #[serde(default = "default_doctor_prefix")]
    pub doctor_prefix: String,
}

fn default_flush_batch_size() -> usize { 1000 }
fn default_scan_count() -> usize { 1000 }
fn default_doctor_prefix() -> String { "_doctor:test:".to_string() }

impl Default for TagCacheConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            cluster_nodes: Vec::new(),
            connection_prefix: String::new(),
            prefix: String::new(),
            tag_mode: TagMode::default(),
            cleanup_mode: CleanupMode::default(),
            flush_batch_size: default_flush_batch_size(),
            scan_count: default_scan_count(),
            purge_stale_on_flush: false,
            doctor_prefix: default_doctor_prefix(),
        }
    }
}

impl TagCacheConfig {
    pub fn validate(&self) -> Result<(), TagCacheError> {
        if self.flush_batch_size == 0 {
            return Err(TagCacheError::Config("flush_batch_size must be greater than 0".into()));
        }
        if self.scan_count == 0 {
            return Err(TagCacheError::Config("scan_count must be greater than 0".into()));
        }
        if self.doctor_prefix.is_empty() {
            return Err(TagCacheError::Config("doctor_prefix must not be empty".into()));
        }
        Ok(())
    }
}
