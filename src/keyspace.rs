// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Physical key naming for tags and tagged entries.
//!
//! Every key string the tag layer touches is produced here.
//!
//! ```text
//! Any mode (prefix "app:")
//!   app:user:1                      → cached value
//!   app:user:1:_any:tags            → reverse index (SET of tag names)
//!   app:_any:tag:users:entries      → membership (HASH field=key, value=expiry)
//!   app:_any:tag:registry           → known tags (SET)
//!
//! All mode (prefix "app:")
//!   app:{sha1}:user:1               → cached value, sha1 over sorted tag ids
//!   app:_all:tag:users:version      → generation counter (INCR on flush)
//!   app:_all:tag:users:entries      → entry index (ZSET member={sha1}:key, score=expiry)
//!   app:_all:tag:registry           → known tags (SET)
//! ```
//!
//! The `_any:` / `_all:` segments keep the two modes apart even when both are
//! configured against the same prefix.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::storage::traits::TagCacheError;

const ANY_SEGMENT: &str = "_any:";
const ALL_SEGMENT: &str = "_all:";
const REVERSE_INDEX_SUFFIX: &str = ":_any:tags";
const GLOB_CHARS: &[char] = &['*', '?', '[', ']', '\\'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagMode {
    /// Flushing any one of a key's tags removes the key.
    #[default]
    Any,
    /// A key is reachable only while every one of its tags keeps its generation.
    All,
}

impl TagMode {
    pub fn segment(&self) -> &'static str {
        match self {
            TagMode::Any => ANY_SEGMENT,
            TagMode::All => ALL_SEGMENT,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TagMode::Any => "any",
            TagMode::All => "all",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
    mode: TagMode,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>, mode: TagMode) -> Self {
        Self {
            prefix: prefix.into(),
            mode,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn mode(&self) -> TagMode {
        self.mode
    }

    /// Same prefix, other mode.
    pub fn with_mode(&self, mode: TagMode) -> Self {
        Self::new(self.prefix.clone(), mode)
    }

    /// `{prefix}_any:tag:{tag}:entries` / `{prefix}_all:tag:{tag}:entries`
    pub fn tag_hash_key(&self, tag: &str) -> String {
        format!("{}{}tag:{}:entries", self.prefix, self.mode.segment(), tag)
    }

    /// All-mode generation counter for a tag.
    pub fn tag_version_key(&self, tag: &str) -> String {
        format!("{}{}tag:{}:version", self.prefix, ALL_SEGMENT, tag)
    }

    /// Identifier mixed into the namespace hash.
    ///
    /// Any mode has no generations, so the id is the tag's storage key and
    /// `generation` is ignored. All mode appends the generation, so retiring a
    /// generation changes every namespace the tag takes part in.
    pub fn tag_id(&self, tag: &str, generation: u64) -> String {
        match self.mode {
            TagMode::Any => self.tag_hash_key(tag),
            TagMode::All => format!("{}:{}", self.tag_hash_key(tag), generation),
        }
    }

    /// SHA-1 (lower-case hex) of the sorted tag ids joined by `|`.
    pub fn namespace<S: AsRef<str>>(&self, tag_ids: &[S]) -> String {
        let mut ids: Vec<&str> = tag_ids.iter().map(AsRef::as_ref).collect();
        ids.sort_unstable();
        let digest = Sha1::digest(ids.join("|").as_bytes());
        hex::encode(digest)
    }

    /// `{namespace}:{key}`. Order of `tag_ids` does not matter.
    pub fn namespaced_key<S: AsRef<str>>(&self, tag_ids: &[S], key: &str) -> String {
        format!("{}:{}", self.namespace(tag_ids), key)
    }

    /// Physical key for a logical (possibly namespaced) key.
    pub fn physical_key(&self, logical: &str) -> String {
        format!("{}{}", self.prefix, logical)
    }

    /// Set of tag names a cache key belongs to (Any mode).
    pub fn reverse_index_key(&self, key: &str) -> String {
        format!("{}{}{}", self.prefix, key, REVERSE_INDEX_SUFFIX)
    }

    pub fn registry_key(&self) -> String {
        format!("{}{}tag:registry", self.prefix, self.mode.segment())
    }

    /// Glob patterns matching exactly the data written under names starting
    /// with `test_prefix` in this mode.
    ///
    /// The registry is not covered: its members are removed explicitly.
    pub fn doctor_patterns(&self, test_prefix: &str) -> Vec<String> {
        let structures = format!("{}{}tag:{}*", self.prefix, self.mode.segment(), test_prefix);
        match self.mode {
            // values and their reverse indexes share the key prefix
            TagMode::Any => vec![format!("{}{}*", self.prefix, test_prefix), structures],
            // values sit behind a 40-char hex namespace
            TagMode::All => vec![
                format!("{}{}:{}*", self.prefix, "[0-9a-f]".repeat(40), test_prefix),
                structures,
            ],
        }
    }

    /// Reject tag names that would corrupt the key scheme.
    pub fn validate_tag(tag: &str) -> Result<(), TagCacheError> {
        Self::validate("tag", tag)?;
        if tag.contains(GLOB_CHARS) {
            return Err(invalid("tag", tag, "contains a glob metacharacter"));
        }
        Ok(())
    }

    /// Validate and de-duplicate tag names, keeping first-seen order.
    pub fn normalize_tags<S: AsRef<str>>(tags: &[S]) -> Result<Vec<String>, TagCacheError> {
        let mut out: Vec<String> = Vec::with_capacity(tags.len());
        for tag in tags {
            let tag = tag.as_ref();
            Self::validate_tag(tag)?;
            if !out.iter().any(|t| t == tag) {
                out.push(tag.to_string());
            }
        }
        Ok(out)
    }

    /// Reject cache keys that would collide with tag bookkeeping.
    pub fn validate_key(key: &str) -> Result<(), TagCacheError> {
        Self::validate("key", key)
    }

    fn validate(kind: &'static str, name: &str) -> Result<(), TagCacheError> {
        if name.is_empty() {
            return Err(invalid(kind, name, "must not be empty"));
        }
        if name.chars().any(char::is_whitespace) {
            return Err(invalid(kind, name, "contains whitespace"));
        }
        if name.contains(ANY_SEGMENT) || name.contains(ALL_SEGMENT) {
            return Err(invalid(kind, name, "contains a reserved segment (_any: or _all:)"));
        }
        Ok(())
    }
}

fn invalid(kind: &'static str, name: &str, reason: &'static str) -> TagCacheError {
    TagCacheError::InvalidName {
        kind,
        name: name.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::glob_match;

    fn any() -> KeySpace {
        KeySpace::new("app:", TagMode::Any)
    }

    fn all() -> KeySpace {
        KeySpace::new("app:", TagMode::All)
    }

    #[test]
    fn test_layout_matches_deployed_format() {
        assert_eq!(any().tag_hash_key("users"), "app:_any:tag:users:entries");
        assert_eq!(all().tag_hash_key("users"), "app:_all:tag:users:entries");
        assert_eq!(any().reverse_index_key("user:1"), "app:user:1:_any:tags");
        assert_eq!(any().registry_key(), "app:_any:tag:registry");
        assert_eq!(all().registry_key(), "app:_all:tag:registry");
        assert_eq!(all().tag_version_key("users"), "app:_all:tag:users:version");
        assert_eq!(any().physical_key("user:1"), "app:user:1");
    }

    #[test]
    fn test_modes_never_share_tag_keys() {
        assert_ne!(any().tag_hash_key("users"), all().tag_hash_key("users"));
        assert_ne!(any().registry_key(), all().registry_key());
    }

    #[test]
    fn test_tag_id_per_mode() {
        assert_eq!(any().tag_id("users", 7), any().tag_hash_key("users"));
        assert_eq!(all().tag_id("users", 7), "app:_all:tag:users:entries:7");
        assert_ne!(all().tag_id("users", 7), all().tag_id("users", 8));
    }

    #[test]
    fn test_namespace_is_order_independent() {
        let ks = all();
        let a = ks.namespaced_key(&[ks.tag_id("users", 0), ks.tag_id("active", 3)], "user:1");
        let b = ks.namespaced_key(&[ks.tag_id("active", 3), ks.tag_id("users", 0)], "user:1");
        assert_eq!(a, b);
        assert!(a.ends_with(":user:1"));
        assert_eq!(a.len(), 40 + 1 + "user:1".len());
    }

    #[test]
    fn test_namespace_known_digest() {
        // sha1("a|b")
        let ks = all();
        assert_eq!(ks.namespace(&["b", "a"]), "9abe6de24a871364bf412a1c301698b5ed30dbb7");
    }

    #[test]
    fn test_namespace_changes_with_tags_and_generation() {
        let ks = all();
        let base = ks.namespace(&[ks.tag_id("users", 0)]);
        assert_ne!(base, ks.namespace(&[ks.tag_id("users", 1)]));
        assert_ne!(base, ks.namespace(&[ks.tag_id("users", 0), ks.tag_id("active", 0)]));
    }

    #[test]
    fn test_validate_tag() {
        assert!(KeySpace::validate_tag("users").is_ok());
        assert!(KeySpace::validate_tag("tenant:42").is_ok());
        assert!(KeySpace::validate_tag("").is_err());
        assert!(KeySpace::validate_tag("bad tag").is_err());
        assert!(KeySpace::validate_tag("users*").is_err());
        assert!(KeySpace::validate_tag("x_any:y").is_err());
    }

    #[test]
    fn test_normalize_tags_dedupes_in_order() {
        let tags = KeySpace::normalize_tags(&["users", "active", "users"]).unwrap();
        assert_eq!(tags, vec!["users", "active"]);
        assert!(KeySpace::normalize_tags(&["users", "bad*"]).is_err());
    }

    #[test]
    fn test_validate_key() {
        assert!(KeySpace::validate_key("user:1").is_ok());
        assert!(KeySpace::validate_key("user:1*").is_ok());
        assert!(KeySpace::validate_key("user:1:_any:tags").is_err());
        assert!(KeySpace::validate_key("_all:x").is_err());
        assert!(matches!(
            KeySpace::validate_key(""),
            Err(TagCacheError::InvalidName { kind: "key", .. })
        ));
    }

    #[test]
    fn test_doctor_patterns_any_mode() {
        let ks = any();
        let patterns = ks.doctor_patterns("_doctor:test:");
        let matches = |k: &str| patterns.iter().any(|p| glob_match(p, k));

        assert!(matches("app:_doctor:test:k1"));
        assert!(matches("app:_doctor:test:k1:_any:tags"));
        assert!(matches("app:_any:tag:_doctor:test:users:entries"));
        assert!(!matches("app:user:1"));
        assert!(!matches("app:_any:tag:users:entries"));
        assert!(!matches("app:_any:tag:registry"));
    }

    #[test]
    fn test_doctor_patterns_all_mode() {
        let ks = all();
        let patterns = ks.doctor_patterns("_doctor:test:");
        let matches = |k: &str| patterns.iter().any(|p| glob_match(p, k));
        let ns = ks.namespace(&[ks.tag_id("_doctor:test:users", 0)]);

        assert!(matches(&format!("app:{}:_doctor:test:k1", ns)));
        assert!(matches("app:_all:tag:_doctor:test:users:entries"));
        assert!(matches("app:_all:tag:_doctor:test:users:version"));
        assert!(!matches(&format!("app:{}:user:1", ns)));
        assert!(!matches("app:_doctor:test:k1"));
        assert!(!matches("app:_all:tag:registry"));
    }
}
