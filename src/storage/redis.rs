// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis backend for the tag layer.
//!
//! Two connection variants share one store type:
//!
//! ```text
//! StoreConnection::Standalone(ConnectionManager)  → atomic pipelines allowed
//! StoreConnection::Cluster(ClusterConnection)     → one command per round-trip
//! ```
//!
//! An optional connection prefix is applied to every key sent to Redis, the
//! same way client libraries with an automatic key prefix behave. `SCAN`
//! results are returned raw (still prefixed), so callers that feed them back
//! into a delete must strip the prefix first.
//!
//! The cluster client gives `SCAN` no routing, so consecutive cursor steps can
//! land on different primaries. Cluster walks therefore list the primaries
//! with `CLUSTER NODES` and pin every step to one of them by address.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::cluster_routing::{RoutingInfo, SingleNodeRoutingInfo};
use redis::{cmd, pipe, Client, Cmd, FromRedisValue, Pipeline, RedisResult, Value};
use tracing::{debug, instrument};

use super::traits::{Command, TagCacheError, TagStore, Topology};
use crate::config::TagCacheConfig;
use crate::metrics;
use crate::resilience::retry::{retry, RetryConfig};

/// A multiplexed Redis handle. Cloning is cheap; every store call takes its
/// own clone and drops it when the call returns.
#[derive(Clone)]
pub enum StoreConnection {
    Standalone(ConnectionManager),
    Cluster(ClusterConnection),
}

impl StoreConnection {
    pub fn topology(&self) -> Topology {
        match self {
            StoreConnection::Standalone(_) => Topology::Standalone,
            StoreConnection::Cluster(_) => Topology::Cluster,
        }
    }

    async fn query<T: FromRedisValue>(&self, command: &Cmd) -> RedisResult<T> {
        match self {
            StoreConnection::Standalone(conn) => {
                let mut conn = conn.clone();
                command.query_async(&mut conn).await
            }
            StoreConnection::Cluster(conn) => {
                let mut conn = conn.clone();
                command.query_async(&mut conn).await
            }
        }
    }

    /// Run `command` on the node at `address` ("host:port").
    async fn query_on_node<T: FromRedisValue>(&self, address: &str, command: &Cmd) -> Result<T, TagCacheError> {
        match self {
            StoreConnection::Standalone(_) => Ok(self.query(command).await?),
            StoreConnection::Cluster(conn) => {
                let (host, port) = split_address(address)?;
                let routing = RoutingInfo::SingleNode(SingleNodeRoutingInfo::ByAddress { host, port });
                let mut conn = conn.clone();
                let value = conn.route_command(command, routing).await?;
                Ok(redis::from_redis_value(&value)?)
            }
        }
    }

    async fn query_pipeline<T: FromRedisValue>(&self, pipeline: &Pipeline) -> Result<T, TagCacheError> {
        match self {
            StoreConnection::Standalone(conn) => {
                let mut conn = conn.clone();
                Ok(pipeline.query_async(&mut conn).await?)
            }
            StoreConnection::Cluster(_) => Err(TagCacheError::TopologyMismatch(
                "atomic pipeline issued on a cluster connection".into(),
            )),
        }
    }
}

pub struct RedisTagStore {
    connection: StoreConnection,
    /// Client-level key prefix (e.g. "tenant1:" → "tenant1:app:user:1")
    prefix: String,
}

impl RedisTagStore {
    pub fn new(connection: StoreConnection, prefix: impl Into<String>) -> Self {
        Self {
            connection,
            prefix: prefix.into(),
        }
    }

    /// Connect using the configuration: a cluster connection when
    /// `cluster_nodes` is set, otherwise a standalone connection to `redis_url`.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use tag_cache::{RedisTagStore, TagCacheConfig};
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let config = TagCacheConfig {
    ///     redis_url: Some("redis://localhost:6379".into()),
    ///     prefix: "app:".into(),
    ///     ..Default::default()
    /// };
    /// let store = RedisTagStore::connect(&config).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect(config: &TagCacheConfig) -> Result<Self, TagCacheError> {
        config.validate()?;

        let connection = if !config.cluster_nodes.is_empty() {
            let client = ClusterClient::new(config.cluster_nodes.clone())?;
            let conn = retry("redis_cluster_connect", &RetryConfig::startup(), || {
                let client = client.clone();
                async move { client.get_async_connection().await }
            })
            .await
            .inspect_err(|_| metrics::record_connection_error("redis_cluster"))?;
            StoreConnection::Cluster(conn)
        } else {
            let url = config
                .redis_url
                .as_deref()
                .ok_or_else(|| TagCacheError::Config("redis_url or cluster_nodes is required".into()))?;
            let client = Client::open(url)?;

            // Use startup config: fast-fail on bad URLs, don't hang forever
            let conn = retry("redis_connect", &RetryConfig::startup(), || async {
                ConnectionManager::new(client.clone()).await
            })
            .await
            .inspect_err(|_| metrics::record_connection_error("redis"))?;
            StoreConnection::Standalone(conn)
        };

        Ok(Self::new(connection, config.connection_prefix.clone()))
    }

    pub fn connection(&self) -> StoreConnection {
        self.connection.clone()
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    fn to_cmd(&self, command: &Command) -> Cmd {
        match command {
            Command::Set { key, value, ttl_secs } => {
                let mut c = cmd("SET");
                c.arg(self.prefixed_key(key)).arg(value.as_slice());
                if let Some(ttl) = ttl_secs {
                    c.arg("EX").arg(*ttl);
                }
                c
            }
            Command::Expire { key, secs } => {
                let mut c = cmd("EXPIRE");
                c.arg(self.prefixed_key(key)).arg(*secs);
                c
            }
            Command::Del(keys) => self.multi_key_cmd("DEL", keys),
            Command::Unlink(keys) => self.multi_key_cmd("UNLINK", keys),
            Command::HSet { key, field, value } => {
                let mut c = cmd("HSET");
                c.arg(self.prefixed_key(key)).arg(field).arg(value);
                c
            }
            Command::HDel { key, fields } => {
                let mut c = cmd("HDEL");
                c.arg(self.prefixed_key(key)).arg(fields);
                c
            }
            Command::HLen(key) => {
                let mut c = cmd("HLEN");
                c.arg(self.prefixed_key(key));
                c
            }
            Command::SAdd { key, members } => {
                let mut c = cmd("SADD");
                c.arg(self.prefixed_key(key)).arg(members);
                c
            }
            Command::SRem { key, members } => {
                let mut c = cmd("SREM");
                c.arg(self.prefixed_key(key)).arg(members);
                c
            }
            Command::ZAdd { key, member, score } => {
                let mut c = cmd("ZADD");
                c.arg(self.prefixed_key(key)).arg(*score).arg(member);
                c
            }
            Command::ZRemRangeByScore { key, min, max } => {
                let mut c = cmd("ZREMRANGEBYSCORE");
                c.arg(self.prefixed_key(key)).arg(*min).arg(*max);
                c
            }
            Command::ZCard(key) => {
                let mut c = cmd("ZCARD");
                c.arg(self.prefixed_key(key));
                c
            }
            Command::Incr(key) => {
                let mut c = cmd("INCR");
                c.arg(self.prefixed_key(key));
                c
            }
        }
    }

    fn multi_key_cmd(&self, name: &str, keys: &[String]) -> Cmd {
        let mut c = cmd(name);
        for key in keys {
            c.arg(self.prefixed_key(key));
        }
        c
    }

    fn scan_cmd(&self, cursor: u64, pattern: &str, count: usize) -> Cmd {
        // Use SCAN instead of KEYS to avoid blocking Redis
        let mut c = cmd("SCAN");
        c.arg(cursor)
            .arg("MATCH")
            .arg(self.prefixed_key(pattern))
            .arg("COUNT")
            .arg(count);
        c
    }

    /// Field/member names from a `[name, value, name, value, ...]` scan reply.
    fn even_entries(flat: Vec<String>) -> Vec<String> {
        flat.into_iter().step_by(2).collect()
    }
}

fn split_address(address: &str) -> Result<(String, u16), TagCacheError> {
    address
        .rsplit_once(':')
        .and_then(|(host, port)| Some((host.to_string(), port.parse().ok()?)))
        .filter(|(host, _)| !host.is_empty())
        .ok_or_else(|| TagCacheError::Backend(format!("Invalid node address: {}", address)))
}

/// Reachable primaries from a `CLUSTER NODES` reply, as "host:port".
fn primary_addresses(nodes: &str) -> Vec<String> {
    let mut addresses: Vec<String> = nodes
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _id = fields.next()?;
            let address = fields.next()?;
            let flags: Vec<&str> = fields.next()?.split(',').collect();
            let usable = flags.contains(&"master")
                && !flags.iter().any(|f| matches!(*f, "fail" | "fail?" | "noaddr" | "handshake"));
            if !usable {
                return None;
            }
            // ip:port@cport[,hostname]
            let address = address.split('@').next()?;
            split_address(address).ok()?;
            Some(address.to_string())
        })
        .collect();
    addresses.sort();
    addresses.dedup();
    addresses
}

/// Collapse a Redis reply into the integer contract of [`Command`].
fn reply_count(value: &Value) -> i64 {
    match value {
        Value::Int(n) => *n,
        Value::Okay | Value::SimpleString(_) => 1,
        Value::BulkString(bytes) => std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
        _ => 0,
    }
}

#[async_trait]
impl TagStore for RedisTagStore {
    fn topology(&self) -> Topology {
        self.connection.topology()
    }

    fn key_prefix(&self) -> &str {
        &self.prefix
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TagCacheError> {
        let mut c = cmd("GET");
        c.arg(self.prefixed_key(key));
        Ok(self.connection.query(&c).await?)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, TagCacheError> {
        if keys.is_empty() {
            return Ok(vec![]);
        }
        let c = self.multi_key_cmd("MGET", keys);
        Ok(self.connection.query(&c).await?)
    }

    async fn exists_many(&self, keys: &[String]) -> Result<Vec<bool>, TagCacheError> {
        if keys.is_empty() {
            return Ok(vec![]);
        }

        match self.connection.topology() {
            Topology::Standalone => {
                let mut pipeline = pipe();
                for key in keys {
                    pipeline.exists(self.prefixed_key(key));
                }
                self.connection.query_pipeline(&pipeline).await
            }
            Topology::Cluster => {
                let mut out = Vec::with_capacity(keys.len());
                for key in keys {
                    let mut c = cmd("EXISTS");
                    c.arg(self.prefixed_key(key));
                    out.push(self.connection.query::<bool>(&c).await?);
                }
                Ok(out)
            }
        }
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, TagCacheError> {
        let mut c = cmd("SMEMBERS");
        c.arg(self.prefixed_key(key));
        Ok(self.connection.query(&c).await?)
    }

    async fn set_members_many(&self, keys: &[String]) -> Result<Vec<Vec<String>>, TagCacheError> {
        if keys.is_empty() {
            return Ok(vec![]);
        }

        match self.connection.topology() {
            Topology::Standalone => {
                let mut pipeline = pipe();
                for key in keys {
                    pipeline.smembers(self.prefixed_key(key));
                }
                self.connection.query_pipeline(&pipeline).await
            }
            Topology::Cluster => {
                let mut out = Vec::with_capacity(keys.len());
                for key in keys {
                    out.push(self.set_members(key).await?);
                }
                Ok(out)
            }
        }
    }

    async fn hash_scan(&self, key: &str, cursor: u64, count: usize) -> Result<(u64, Vec<String>), TagCacheError> {
        let mut c = cmd("HSCAN");
        c.arg(self.prefixed_key(key)).arg(cursor).arg("COUNT").arg(count);
        let (next, flat): (u64, Vec<String>) = self.connection.query(&c).await?;
        Ok((next, Self::even_entries(flat)))
    }

    async fn sorted_set_scan(&self, key: &str, cursor: u64, count: usize) -> Result<(u64, Vec<String>), TagCacheError> {
        let mut c = cmd("ZSCAN");
        c.arg(self.prefixed_key(key)).arg(cursor).arg("COUNT").arg(count);
        let (next, flat): (u64, Vec<String>) = self.connection.query(&c).await?;
        Ok((next, Self::even_entries(flat)))
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>), TagCacheError> {
        if let StoreConnection::Cluster(_) = self.connection {
            return Err(TagCacheError::TopologyMismatch(
                "SCAN on a cluster connection must be pinned to a node".into(),
            ));
        }
        Ok(self.connection.query(&self.scan_cmd(cursor, pattern, count)).await?)
    }

    async fn scan_nodes(&self) -> Result<Vec<String>, TagCacheError> {
        match self.connection {
            StoreConnection::Standalone(_) => Ok(Vec::new()),
            StoreConnection::Cluster(_) => {
                let mut c = cmd("CLUSTER");
                c.arg("NODES");
                let reply: String = self.connection.query(&c).await?;
                let nodes = primary_addresses(&reply);
                if nodes.is_empty() {
                    return Err(TagCacheError::Backend("CLUSTER NODES listed no reachable primary".into()));
                }
                debug!(primaries = nodes.len(), "Cluster primaries resolved for SCAN");
                Ok(nodes)
            }
        }
    }

    async fn scan_node(
        &self,
        address: &str,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), TagCacheError> {
        self.connection
            .query_on_node(address, &self.scan_cmd(cursor, pattern, count))
            .await
    }

    #[instrument(skip(self, commands), fields(commands = commands.len()))]
    async fn execute(&self, commands: &[Command]) -> Result<Vec<i64>, TagCacheError> {
        let mut replies = Vec::with_capacity(commands.len());
        for command in commands {
            let value: Value = self.connection.query(&self.to_cmd(command)).await?;
            replies.push(reply_count(&value));
        }
        Ok(replies)
    }

    #[instrument(skip(self, commands), fields(commands = commands.len()))]
    async fn execute_pipeline(&self, commands: &[Command]) -> Result<Vec<i64>, TagCacheError> {
        if commands.is_empty() {
            return Ok(vec![]);
        }

        let mut pipeline = pipe();
        pipeline.atomic();
        for command in commands {
            pipeline.add_command(self.to_cmd(command));
        }

        let values: Vec<Value> = self.connection.query_pipeline(&pipeline).await?;
        debug!(replies = values.len(), "Pipeline executed");
        Ok(values.iter().map(reply_count).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_count_maps_redis_values() {
        assert_eq!(reply_count(&Value::Int(42)), 42);
        assert_eq!(reply_count(&Value::Okay), 1);
        assert_eq!(reply_count(&Value::SimpleString("OK".into())), 1);
        assert_eq!(reply_count(&Value::Nil), 0);
        assert_eq!(reply_count(&Value::BulkString(b"7".to_vec())), 7);
        assert_eq!(reply_count(&Value::BulkString(b"nope".to_vec())), 0);
    }

    #[test]
    fn test_primary_addresses_from_cluster_nodes() {
        let reply = "\
07c37dfeb235213a872192d90877d0cd55635b91 127.0.0.1:30004@31004 slave e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 0 1426238317239 4 connected
67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1 127.0.0.1:30002@31002 master - 0 1426238316232 2 connected 5461-10922
292f8b365bb7edb5e285caf0b7e6ddc7265d2f4f 127.0.0.1:30003@31003 master - 0 1426238318243 3 connected 10923-16383
e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 127.0.0.1:30001@31001,redis-1 myself,master - 0 0 1 connected 0-5460
824fe116063bc5fcf9f4ffd895bc17aee7731ac3 127.0.0.1:30006@31006 master,fail - 1426238316232 0 6 disconnected
6ec23923021cf3ffec47632106199cb7f496ce01 :0@0 master,noaddr - 0 0 0 disconnected
";

        assert_eq!(
            primary_addresses(reply),
            vec!["127.0.0.1:30001", "127.0.0.1:30002", "127.0.0.1:30003"]
        );
    }

    #[test]
    fn test_split_address() {
        assert_eq!(split_address("10.0.0.7:6379").unwrap(), ("10.0.0.7".to_string(), 6379));
        assert!(split_address("no-port").is_err());
        assert!(split_address(":6379").is_err());
        assert!(split_address("host:notaport").is_err());
    }

    #[test]
    fn test_even_entries_keeps_names() {
        let flat = vec!["a".to_string(), "1".into(), "b".into(), "2".into()];
        assert_eq!(RedisTagStore::even_entries(flat), vec!["a", "b"]);
    }
}
