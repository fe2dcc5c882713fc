// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory [`TagStore`] with Redis semantics.
//!
//! Used by unit tests and local runs of the doctor harness. Keys are kept in
//! an ordered map; a SCAN cursor resumes after the last key it examined, so
//! keys deleted mid-iteration never cause others to be skipped. Every executed call is
//! recorded so tests can assert how many round-trips and batches were issued.
//! Expiry is accepted but never enforced.
//!
//! A cluster store spreads keys over [`CLUSTER_NODES`] simulated primaries.
//! Like a real cluster connection it refuses an unpinned SCAN; a key-space
//! walk has to go node by node through [`TagStore::scan_node`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use super::traits::{Command, TagCacheError, TagStore, Topology};

/// Simulated primaries behind [`MemoryTagStore::cluster`].
pub const CLUSTER_NODES: usize = 3;

const NODE_ADDRESS_PREFIX: &str = "memory-node-";

#[derive(Debug, Clone)]
enum Entry {
    String(Vec<u8>),
    Hash(BTreeMap<String, String>),
    Set(BTreeSet<String>),
    SortedSet(BTreeMap<String, i64>),
}

/// One `execute`/`execute_pipeline` call as observed by the store.
#[derive(Debug, Clone)]
pub struct ExecutedCall {
    pub pipelined: bool,
    pub commands: Vec<Command>,
}

pub struct MemoryTagStore {
    data: RwLock<BTreeMap<String, Entry>>,
    topology: Topology,
    prefix: String,
    calls: Mutex<Vec<ExecutedCall>>,
    /// Remaining successful executions before injected failures start.
    fail_after: Mutex<Option<usize>>,
    /// Open SCAN cursors: id -> last key examined.
    scan_cursors: Mutex<HashMap<u64, String>>,
}

impl MemoryTagStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_topology(Topology::Standalone, "")
    }

    /// A store that behaves like a cluster connection (no atomic pipelines).
    #[must_use]
    pub fn cluster() -> Self {
        Self::with_topology(Topology::Cluster, "")
    }

    #[must_use]
    pub fn with_topology(topology: Topology, prefix: &str) -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            topology,
            prefix: prefix.to_string(),
            calls: Mutex::new(Vec::new()),
            fail_after: Mutex::new(None),
            scan_cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Make every `execute`/`execute_pipeline` call after the next `n` fail.
    pub fn fail_after(&self, n: usize) {
        *self.fail_after.lock() = Some(n);
    }

    pub fn clear_failures(&self) {
        *self.fail_after.lock() = None;
    }

    /// All recorded calls, oldest first.
    pub fn calls(&self) -> Vec<ExecutedCall> {
        self.calls.lock().clone()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().clear();
    }

    /// Key counts of every UNLINK issued so far, in order.
    pub fn unlink_batches(&self) -> Vec<usize> {
        self.calls
            .lock()
            .iter()
            .flat_map(|call| call.commands.iter())
            .filter_map(|c| match c {
                Command::Unlink(keys) => Some(keys.len()),
                _ => None,
            })
            .collect()
    }

    pub fn round_trips(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .map(|call| if call.pipelined { 1 } else { call.commands.len() })
            .sum()
    }

    /// Raw keys (connection prefix included), sorted.
    pub fn raw_keys(&self) -> Vec<String> {
        self.data.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.read().contains_key(&self.prefixed_key(key))
    }

    /// Hash field names (test helper).
    pub fn hash_fields(&self, key: &str) -> Vec<String> {
        match self.data.read().get(&self.prefixed_key(key)) {
            Some(Entry::Hash(h)) => h.keys().cloned().collect(),
            _ => vec![],
        }
    }

    /// Sorted-set member names (test helper).
    pub fn sorted_set_members(&self, key: &str) -> Vec<String> {
        match self.data.read().get(&self.prefixed_key(key)) {
            Some(Entry::SortedSet(z)) => z.keys().cloned().collect(),
            _ => vec![],
        }
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Simulated primary owning a raw key (FNV-1a over the key bytes).
    fn node_of(raw: &str) -> usize {
        let hash = raw
            .bytes()
            .fold(0xcbf2_9ce4_8422_2325_u64, |h, b| (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3));
        (hash % CLUSTER_NODES as u64) as usize
    }

    fn parse_node(address: &str) -> Result<usize, TagCacheError> {
        address
            .strip_prefix(NODE_ADDRESS_PREFIX)
            .and_then(|n| n.parse::<usize>().ok())
            .filter(|n| *n < CLUSTER_NODES)
            .ok_or_else(|| TagCacheError::Backend(format!("Unknown node address: {}", address)))
    }

    /// One SCAN step, restricted to the keys of `node` when given.
    fn scan_step(&self, node: Option<usize>, cursor: u64, pattern: &str, count: usize) -> (u64, Vec<String>) {
        let start = if cursor == 0 {
            Bound::Unbounded
        } else {
            match self.scan_cursors.lock().remove(&cursor) {
                Some(last) => Bound::Excluded(last),
                None => return (0, vec![]),
            }
        };

        // COUNT bounds the keys examined per step, not the matches returned.
        let count = count.max(1);
        let examined: Vec<String> = self
            .data
            .read()
            .range::<String, _>((start, Bound::Unbounded))
            .map(|(k, _)| k)
            .filter(|k| node.map_or(true, |n| Self::node_of(k) == n))
            .take(count + 1)
            .cloned()
            .collect();

        let more = examined.len() > count;
        let examined = &examined[..examined.len().min(count)];
        let next = match examined.last() {
            Some(last) if more => {
                let mut cursors = self.scan_cursors.lock();
                let id = cursors.keys().max().copied().unwrap_or(0) + 1;
                cursors.insert(id, last.clone());
                id
            }
            _ => 0,
        };

        let pattern = self.prefixed_key(pattern);
        let matched = examined.iter().filter(|k| glob_match(&pattern, k)).cloned().collect();
        (next, matched)
    }

    fn check_failure(&self) -> Result<(), TagCacheError> {
        let mut guard = self.fail_after.lock();
        if let Some(remaining) = guard.as_mut() {
            if *remaining == 0 {
                return Err(TagCacheError::Backend("injected failure".into()));
            }
            *remaining -= 1;
        }
        Ok(())
    }

    fn record(&self, pipelined: bool, commands: &[Command]) {
        self.calls.lock().push(ExecutedCall {
            pipelined,
            commands: commands.to_vec(),
        });
    }

    fn wrong_type(key: &str) -> TagCacheError {
        TagCacheError::Backend(format!(
            "WRONGTYPE Operation against a key holding the wrong kind of value: {}",
            key
        ))
    }

    fn apply(&self, data: &mut BTreeMap<String, Entry>, command: &Command) -> Result<i64, TagCacheError> {
        match command {
            Command::Set { key, value, .. } => {
                data.insert(self.prefixed_key(key), Entry::String(value.clone()));
                Ok(1)
            }
            Command::Expire { key, .. } => Ok(i64::from(data.contains_key(&self.prefixed_key(key)))),
            Command::Del(keys) | Command::Unlink(keys) => {
                let mut removed = 0;
                for key in keys {
                    if data.remove(&self.prefixed_key(key)).is_some() {
                        removed += 1;
                    }
                }
                Ok(removed)
            }
            Command::HSet { key, field, value } => {
                let raw = self.prefixed_key(key);
                match data.entry(raw.clone()).or_insert_with(|| Entry::Hash(BTreeMap::new())) {
                    Entry::Hash(h) => Ok(i64::from(h.insert(field.clone(), value.clone()).is_none())),
                    _ => Err(Self::wrong_type(&raw)),
                }
            }
            Command::HDel { key, fields } => {
                let raw = self.prefixed_key(key);
                let (removed, now_empty) = match data.get_mut(&raw) {
                    None => return Ok(0),
                    Some(Entry::Hash(h)) => {
                        let removed = fields.iter().filter(|f| h.remove(f.as_str()).is_some()).count();
                        (removed as i64, h.is_empty())
                    }
                    Some(_) => return Err(Self::wrong_type(&raw)),
                };
                if now_empty {
                    data.remove(&raw);
                }
                Ok(removed)
            }
            Command::HLen(key) => match data.get(&self.prefixed_key(key)) {
                None => Ok(0),
                Some(Entry::Hash(h)) => Ok(h.len() as i64),
                Some(_) => Err(Self::wrong_type(key)),
            },
            Command::SAdd { key, members } => {
                let raw = self.prefixed_key(key);
                match data.entry(raw.clone()).or_insert_with(|| Entry::Set(BTreeSet::new())) {
                    Entry::Set(s) => Ok(members.iter().filter(|m| s.insert((*m).clone())).count() as i64),
                    _ => Err(Self::wrong_type(&raw)),
                }
            }
            Command::SRem { key, members } => {
                let raw = self.prefixed_key(key);
                let (removed, now_empty) = match data.get_mut(&raw) {
                    None => return Ok(0),
                    Some(Entry::Set(s)) => {
                        let removed = members.iter().filter(|m| s.remove(m.as_str())).count();
                        (removed as i64, s.is_empty())
                    }
                    Some(_) => return Err(Self::wrong_type(&raw)),
                };
                if now_empty {
                    data.remove(&raw);
                }
                Ok(removed)
            }
            Command::ZAdd { key, member, score } => {
                let raw = self.prefixed_key(key);
                match data.entry(raw.clone()).or_insert_with(|| Entry::SortedSet(BTreeMap::new())) {
                    Entry::SortedSet(z) => Ok(i64::from(z.insert(member.clone(), *score).is_none())),
                    _ => Err(Self::wrong_type(&raw)),
                }
            }
            Command::ZRemRangeByScore { key, min, max } => {
                let raw = self.prefixed_key(key);
                let (removed, now_empty) = match data.get_mut(&raw) {
                    None => return Ok(0),
                    Some(Entry::SortedSet(z)) => {
                        let before = z.len();
                        z.retain(|_, score| *score < *min || *score > *max);
                        ((before - z.len()) as i64, z.is_empty())
                    }
                    Some(_) => return Err(Self::wrong_type(&raw)),
                };
                if now_empty {
                    data.remove(&raw);
                }
                Ok(removed)
            }
            Command::ZCard(key) => match data.get(&self.prefixed_key(key)) {
                None => Ok(0),
                Some(Entry::SortedSet(z)) => Ok(z.len() as i64),
                Some(_) => Err(Self::wrong_type(key)),
            },
            Command::Incr(key) => {
                let raw = self.prefixed_key(key);
                let current = match data.get(&raw) {
                    None => 0,
                    Some(Entry::String(bytes)) => std::str::from_utf8(bytes)
                        .ok()
                        .and_then(|s| s.parse::<i64>().ok())
                        .ok_or_else(|| TagCacheError::Backend("ERR value is not an integer".into()))?,
                    Some(_) => return Err(Self::wrong_type(&raw)),
                };
                let next = current + 1;
                data.insert(raw, Entry::String(next.to_string().into_bytes()));
                Ok(next)
            }
        }
    }

    /// Position-based cursor over a sorted list of names.
    fn page(names: Vec<String>, cursor: u64, count: usize) -> (u64, Vec<String>) {
        let start = cursor as usize;
        let count = count.max(1);
        if start >= names.len() {
            return (0, vec![]);
        }
        let end = (start + count).min(names.len());
        let next = if end >= names.len() { 0 } else { end as u64 };
        (next, names[start..end].to_vec())
    }
}

impl Default for MemoryTagStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TagStore for MemoryTagStore {
    fn topology(&self) -> Topology {
        self.topology
    }

    fn key_prefix(&self) -> &str {
        &self.prefix
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TagCacheError> {
        match self.data.read().get(&self.prefixed_key(key)) {
            None => Ok(None),
            Some(Entry::String(bytes)) => Ok(Some(bytes.clone())),
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, TagCacheError> {
        let data = self.data.read();
        Ok(keys
            .iter()
            .map(|key| match data.get(&self.prefixed_key(key)) {
                Some(Entry::String(bytes)) => Some(String::from_utf8_lossy(bytes).into_owned()),
                _ => None,
            })
            .collect())
    }

    async fn exists_many(&self, keys: &[String]) -> Result<Vec<bool>, TagCacheError> {
        let data = self.data.read();
        Ok(keys.iter().map(|key| data.contains_key(&self.prefixed_key(key))).collect())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, TagCacheError> {
        match self.data.read().get(&self.prefixed_key(key)) {
            None => Ok(vec![]),
            Some(Entry::Set(s)) => Ok(s.iter().cloned().collect()),
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn hash_scan(&self, key: &str, cursor: u64, count: usize) -> Result<(u64, Vec<String>), TagCacheError> {
        let fields: Vec<String> = match self.data.read().get(&self.prefixed_key(key)) {
            None => return Ok((0, vec![])),
            Some(Entry::Hash(h)) => h.keys().cloned().collect(),
            Some(_) => return Err(Self::wrong_type(key)),
        };
        Ok(Self::page(fields, cursor, count))
    }

    async fn sorted_set_scan(&self, key: &str, cursor: u64, count: usize) -> Result<(u64, Vec<String>), TagCacheError> {
        let members: Vec<String> = match self.data.read().get(&self.prefixed_key(key)) {
            None => return Ok((0, vec![])),
            Some(Entry::SortedSet(z)) => z.keys().cloned().collect(),
            Some(_) => return Err(Self::wrong_type(key)),
        };
        Ok(Self::page(members, cursor, count))
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>), TagCacheError> {
        if self.topology == Topology::Cluster {
            return Err(TagCacheError::TopologyMismatch(
                "SCAN on a cluster connection must be pinned to a node".into(),
            ));
        }
        Ok(self.scan_step(None, cursor, pattern, count))
    }

    async fn scan_nodes(&self) -> Result<Vec<String>, TagCacheError> {
        Ok(match self.topology {
            Topology::Standalone => Vec::new(),
            Topology::Cluster => (0..CLUSTER_NODES).map(|n| format!("{}{}", NODE_ADDRESS_PREFIX, n)).collect(),
        })
    }

    async fn scan_node(
        &self,
        address: &str,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), TagCacheError> {
        let node = match self.topology {
            Topology::Standalone => None,
            Topology::Cluster => Some(Self::parse_node(address)?),
        };
        Ok(self.scan_step(node, cursor, pattern, count))
    }

    async fn execute(&self, commands: &[Command]) -> Result<Vec<i64>, TagCacheError> {
        self.check_failure()?;
        self.record(false, commands);
        let mut data = self.data.write();
        commands.iter().map(|c| self.apply(&mut data, c)).collect()
    }

    async fn execute_pipeline(&self, commands: &[Command]) -> Result<Vec<i64>, TagCacheError> {
        if self.topology == Topology::Cluster {
            return Err(TagCacheError::TopologyMismatch(
                "atomic pipeline issued on a cluster connection".into(),
            ));
        }
        self.check_failure()?;
        self.record(true, commands);

        // MULTI/EXEC: apply against a copy, commit only if every command succeeds.
        let mut data = self.data.write();
        let mut staged = data.clone();
        let replies = commands
            .iter()
            .map(|c| self.apply(&mut staged, c))
            .collect::<Result<Vec<_>, _>>()?;
        *data = staged;
        Ok(replies)
    }
}

/// Redis `MATCH` glob semantics: `*`, `?`, `[abc]`, `[a-z]`, `[^a]` and `\` escapes.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    glob_match_at(&p, &t)
}

fn glob_match_at(p: &[char], t: &[char]) -> bool {
    let (mut pi, mut ti) = (0, 0);
    // Backtrack point for the most recent '*'
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() {
            match p[pi] {
                '*' => {
                    star = Some((pi, ti));
                    pi += 1;
                    continue;
                }
                '?' => {
                    pi += 1;
                    ti += 1;
                    continue;
                }
                '[' => {
                    if let Some((matched, next)) = match_class(p, pi, t[ti]) {
                        if matched {
                            pi = next;
                            ti += 1;
                            continue;
                        }
                    }
                }
                '\\' if pi + 1 < p.len() => {
                    if p[pi + 1] == t[ti] {
                        pi += 2;
                        ti += 1;
                        continue;
                    }
                }
                c => {
                    if c == t[ti] {
                        pi += 1;
                        ti += 1;
                        continue;
                    }
                }
            }
        }
        match star {
            Some((sp, st)) => {
                pi = sp + 1;
                ti = st + 1;
                star = Some((sp, st + 1));
            }
            None => return false,
        }
    }

    p[pi..].iter().all(|c| *c == '*')
}

/// Returns `(matched, index after ']')`, or `None` for an unterminated class.
fn match_class(p: &[char], start: usize, c: char) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negate = i < p.len() && p[i] == '^';
    if negate {
        i += 1;
    }
    let mut matched = false;
    while i < p.len() && p[i] != ']' {
        if p[i] == '\\' && i + 1 < p.len() {
            matched |= p[i + 1] == c;
            i += 2;
        } else if i + 2 < p.len() && p[i + 1] == '-' && p[i + 2] != ']' {
            let (lo, hi) = if p[i] <= p[i + 2] { (p[i], p[i + 2]) } else { (p[i + 2], p[i]) };
            matched |= lo <= c && c <= hi;
            i += 3;
        } else {
            matched |= p[i] == c;
            i += 1;
        }
    }
    if i >= p.len() {
        return None;
    }
    Some((matched != negate, i + 1))
}
