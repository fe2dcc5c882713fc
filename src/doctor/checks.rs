// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;

use super::{CheckResult, DoctorCheck, DoctorContext};
use crate::config::CleanupMode;
use crate::flush::{BatchClient, FlushSettings, LazyTagFlusher};
use crate::keyspace::TagMode;
use crate::storage::traits::{Command, TagCacheError, Topology};
use crate::tags::{TagGenerations, TagRegistry, TaggedKeyEnumerator};

async fn exists(ctx: &DoctorContext, key: &str) -> Result<bool, TagCacheError> {
    let found = ctx.store().exists_many(&[key.to_string()]).await?;
    Ok(found.first().copied().unwrap_or(false))
}

async fn tag_members(ctx: &DoctorContext, mode: TagMode, tag: &str) -> Result<Vec<String>, TagCacheError> {
    let scan_count = ctx.invalidator().settings().scan_count;
    TaggedKeyEnumerator::new(ctx.store().clone(), &ctx.keyspace(mode), tag, scan_count)
        .collect()
        .await
}

async fn registered(ctx: &DoctorContext, mode: TagMode, tag: &str) -> Result<bool, TagCacheError> {
    TagRegistry::new(ctx.store().clone(), ctx.keyspace(mode)).contains(tag).await
}

/// Namespaced keys are deterministic, order independent and distinct per tag set.
pub struct NamespaceCheck;

#[async_trait]
impl DoctorCheck for NamespaceCheck {
    fn name(&self) -> &'static str {
        "namespace"
    }

    async fn run(&self, ctx: &DoctorContext, result: &mut CheckResult) -> Result<(), TagCacheError> {
        let keyspace = ctx.keyspace(TagMode::All);
        let (a, b, c) = (ctx.prefixed("ns:a"), ctx.prefixed("ns:b"), ctx.prefixed("ns:c"));
        let (id_a, id_b, id_c) = (keyspace.tag_id(&a, 0), keyspace.tag_id(&b, 0), keyspace.tag_id(&c, 0));
        let key = ctx.prefixed("ns:key");

        let ab = keyspace.namespaced_key(&[&id_a, &id_b], &key);
        result.record(ab == keyspace.namespaced_key(&[&id_b, &id_a], &key), "tag order does not change the key");
        result.record(ab == keyspace.namespaced_key(&[&id_a, &id_b], &key), "same tag set gives the same key");
        result.record(ab != keyspace.namespaced_key(&[&id_a, &id_c], &key), "different tag sets give different keys");
        result.record(ab != keyspace.namespaced_key(&[&id_a], &key), "a subset of the tags gives a different key");

        let cache = ctx.cache(TagMode::All);
        let written = cache.put(&key, b"namespace", &[&a, &b], None).await?;
        result.record(
            cache.physical_key(&key, &[&b, &a]).await? == written,
            "live key derivation matches the written key in either order",
        );
        result.record(
            cache.get(&key, &[&b, &a]).await?.as_deref() == Some(b"namespace".as_slice()),
            "value readable with reordered tags",
        );
        Ok(())
    }
}

/// A lazy flush removes every directly tagged key and the tag itself.
pub struct LazyFlushCheck;

#[async_trait]
impl DoctorCheck for LazyFlushCheck {
    fn name(&self) -> &'static str {
        "lazy_flush"
    }

    async fn run(&self, ctx: &DoctorContext, result: &mut CheckResult) -> Result<(), TagCacheError> {
        let keyspace = ctx.keyspace(TagMode::Any);
        let cache = ctx
            .cache(TagMode::Any)
            .with_invalidator(ctx.invalidator().with_cleanup(CleanupMode::Lazy));
        let (flushed, other) = (ctx.prefixed("lazy:flushed"), ctx.prefixed("lazy:other"));
        let (k1, k2, k3) = (ctx.prefixed("lazy:k1"), ctx.prefixed("lazy:k2"), ctx.prefixed("lazy:k3"));

        cache.put(&k1, b"1", &[&flushed, &other], None).await?;
        cache.put(&k2, b"2", &[&flushed], None).await?;
        cache.put(&k3, b"3", &[&other], None).await?;

        let report = cache.flush(&[&flushed]).await?;
        result.record(report.strategy == "lazy", format!("lazy strategy used, got {}", report.strategy));
        result.record(report.keys == 2, format!("2 tagged keys enumerated, got {}", report.keys));
        result.record(report.deleted == 2, format!("2 values deleted, got {}", report.deleted));

        for key in [&k1, &k2] {
            result.record(!exists(ctx, &keyspace.physical_key(key)).await?, format!("value of {} deleted", key));
            result.record(
                !exists(ctx, &keyspace.reverse_index_key(key)).await?,
                format!("reverse index of {} deleted", key),
            );
        }
        result.record(!exists(ctx, &keyspace.tag_hash_key(&flushed)).await?, "flushed tag hash deleted");
        result.record(tag_members(ctx, TagMode::Any, &flushed).await?.is_empty(), "flushed tag enumerates nothing");
        result.record(!registered(ctx, TagMode::Any, &flushed).await?, "flushed tag unregistered");
        result.record(exists(ctx, &keyspace.physical_key(&k3)).await?, "key outside the flushed tag kept");
        Ok(())
    }
}

/// An eager flush leaves no orphaned fields in other tags.
pub struct EagerFlushCheck;

#[async_trait]
impl DoctorCheck for EagerFlushCheck {
    fn name(&self) -> &'static str {
        "eager_flush"
    }

    async fn run(&self, ctx: &DoctorContext, result: &mut CheckResult) -> Result<(), TagCacheError> {
        let keyspace = ctx.keyspace(TagMode::Any);
        let cache = ctx
            .cache(TagMode::Any)
            .with_invalidator(ctx.invalidator().with_cleanup(CleanupMode::Eager));
        let (flushed, other) = (ctx.prefixed("eager:flushed"), ctx.prefixed("eager:other"));
        let (k1, k2) = (ctx.prefixed("eager:k1"), ctx.prefixed("eager:k2"));

        cache.put(&k1, b"1", &[&flushed, &other], None).await?;
        cache.put(&k2, b"2", &[&other], None).await?;

        let report = cache.flush(&[&flushed]).await?;
        result.record(report.strategy == "eager", format!("eager strategy used, got {}", report.strategy));
        result.record(
            report.orphans_cleared == 1,
            format!("1 orphaned field cleared, got {}", report.orphans_cleared),
        );
        result.record(!exists(ctx, &keyspace.physical_key(&k1)).await?, "flushed value deleted");

        let remaining = tag_members(ctx, TagMode::Any, &other).await?;
        result.record(
            remaining == vec![k2.clone()],
            format!("other tag lists only live keys, got {:?}", remaining),
        );
        result.record(registered(ctx, TagMode::Any, &other).await?, "other tag still registered");
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
struct ParityState {
    values: Vec<bool>,
    reverse_indexes: Vec<bool>,
    other_members: Vec<String>,
    flushed_registered: bool,
    other_registered: bool,
}

/// Cluster and pipelined dispatch reach the same end state.
pub struct TopologyParityCheck;

impl TopologyParityCheck {
    async fn scenario(ctx: &DoctorContext, label: &str, pipelined: bool) -> Result<ParityState, TagCacheError> {
        let scope = ctx.prefixed(&format!("parity:{}:", label));
        let name = |n: &str| format!("{}{}", scope, n);
        let keyspace = ctx.keyspace(TagMode::Any);
        let cache = ctx.cache(TagMode::Any);
        let (flushed, other) = (name("flushed"), name("other"));
        let keys = [name("k1"), name("k2"), name("k3")];

        cache.put(&keys[0], b"1", &[&flushed, &other], None).await?;
        cache.put(&keys[1], b"2", &[&flushed], None).await?;
        cache.put(&keys[2], b"3", &[&other], None).await?;

        let store = ctx.store().as_ref();
        let client = if pipelined {
            BatchClient::Pipelined(store)
        } else {
            BatchClient::Cluster(store)
        };
        let settings = FlushSettings {
            batch_size: 2,
            ..ctx.invalidator().settings()
        };
        LazyTagFlusher::new(ctx.store().clone(), keyspace.clone(), settings)
            .flush_using(client, &[flushed.clone()])
            .await?;

        let mut values = Vec::new();
        let mut reverse_indexes = Vec::new();
        for key in &keys {
            values.push(exists(ctx, &keyspace.physical_key(key)).await?);
            reverse_indexes.push(exists(ctx, &keyspace.reverse_index_key(key)).await?);
        }
        let mut other_members: Vec<String> = tag_members(ctx, TagMode::Any, &other)
            .await?
            .into_iter()
            .map(|m| match m.strip_prefix(scope.as_str()) {
                Some(local) => local.to_string(),
                None => m.clone(),
            })
            .collect();
        other_members.sort();

        Ok(ParityState {
            values,
            reverse_indexes,
            other_members,
            flushed_registered: registered(ctx, TagMode::Any, &flushed).await?,
            other_registered: registered(ctx, TagMode::Any, &other).await?,
        })
    }
}

#[async_trait]
impl DoctorCheck for TopologyParityCheck {
    fn name(&self) -> &'static str {
        "topology_parity"
    }

    async fn run(&self, ctx: &DoctorContext, result: &mut CheckResult) -> Result<(), TagCacheError> {
        let expected = ParityState {
            values: vec![false, false, true],
            reverse_indexes: vec![false, false, true],
            other_members: vec!["k1".to_string(), "k3".to_string()],
            flushed_registered: false,
            other_registered: true,
        };

        let sequential = Self::scenario(ctx, "cluster", false).await?;
        result.record(
            sequential == expected,
            format!("sequential path end state {:?}", sequential),
        );

        if ctx.store().topology() == Topology::Standalone {
            let pipelined = Self::scenario(ctx, "pipelined", true).await?;
            result.record(
                pipelined == sequential,
                format!("pipelined end state {:?} differs from sequential", pipelined),
            );
        }
        Ok(())
    }
}

/// Pattern cleanup removes exactly the doctor data of each mode.
pub struct PatternCleanupCheck;

#[async_trait]
impl DoctorCheck for PatternCleanupCheck {
    fn name(&self) -> &'static str {
        "pattern_cleanup"
    }

    async fn run(&self, ctx: &DoctorContext, result: &mut CheckResult) -> Result<(), TagCacheError> {
        ctx.cleanup().await?;

        let any_space = ctx.keyspace(TagMode::Any);
        let all_space = ctx.keyspace(TagMode::All);
        let (any_tag, all_tag) = (ctx.prefixed("pattern:any"), ctx.prefixed("pattern:all"));
        let control = any_space.physical_key(&ctx.control_key());

        let mut any_keys = Vec::new();
        let mut all_keys = Vec::new();
        for i in 0..3 {
            let key = ctx.prefixed(&format!("pattern:k{}", i));
            any_keys.push(ctx.cache(TagMode::Any).put(&key, b"any", &[&any_tag], None).await?);
            all_keys.push(ctx.cache(TagMode::All).put(&key, b"all", &[&all_tag], None).await?);
        }
        ctx.store()
            .execute(&[Command::Set {
                key: control.clone(),
                value: b"control".to_vec(),
                ttl_secs: None,
            }])
            .await?;

        let mut deleted = 0;
        for pattern in any_space.doctor_patterns(ctx.test_prefix()) {
            deleted += ctx.invalidator().flush_by_pattern(&pattern).await?;
        }
        // 3 values, 3 reverse indexes, 1 tag hash
        result.record(deleted == 7, format!("Any patterns deleted 7 keys, got {}", deleted));
        for key in &any_keys {
            result.record(!exists(ctx, key).await?, format!("Any value {} deleted", key));
        }
        for key in &all_keys {
            result.record(exists(ctx, key).await?, format!("All value {} untouched by Any patterns", key));
        }

        let mut deleted = 0;
        for pattern in all_space.doctor_patterns(ctx.test_prefix()) {
            deleted += ctx.invalidator().flush_by_pattern(&pattern).await?;
        }
        // 3 namespaced values, 1 entry index
        result.record(deleted == 4, format!("All patterns deleted 4 keys, got {}", deleted));
        for key in &all_keys {
            result.record(!exists(ctx, key).await?, format!("All value {} deleted", key));
        }
        result.record(!exists(ctx, &all_space.tag_hash_key(&all_tag)).await?, "All entry index deleted");
        result.record(exists(ctx, &control).await?, "control key outside the test prefix kept");

        ctx.store().execute(&[Command::Del(vec![control])]).await?;
        Ok(())
    }
}

/// An All-mode flush makes every entry written with the tag unreachable.
pub struct GenerationCheck;

#[async_trait]
impl DoctorCheck for GenerationCheck {
    fn name(&self) -> &'static str {
        "generation"
    }

    async fn run(&self, ctx: &DoctorContext, result: &mut CheckResult) -> Result<(), TagCacheError> {
        let cache = ctx.cache(TagMode::All);
        let generations = TagGenerations::new(ctx.store().clone(), ctx.keyspace(TagMode::All));
        let (t1, t2, t3) = (ctx.prefixed("gen:t1"), ctx.prefixed("gen:t2"), ctx.prefixed("gen:t3"));
        let (k1, k2) = (ctx.prefixed("gen:k1"), ctx.prefixed("gen:k2"));

        cache.put(&k1, b"old", &[&t1, &t2], None).await?;
        cache.put(&k2, b"kept", &[&t3], None).await?;
        let before = generations.current(&[t1.clone()]).await?;

        cache.flush(&[&t1]).await?;

        let after = generations.current(&[t1.clone()]).await?;
        result.record(after[0] == before[0] + 1, format!("generation advanced {} -> {}", before[0], after[0]));
        result.record(cache.get(&k1, &[&t1, &t2]).await?.is_none(), "entry tagged with the flushed tag unreachable");
        result.record(cache.get(&k2, &[&t3]).await?.is_some(), "entry with unrelated tags still reachable");

        cache.put(&k1, b"new", &[&t1, &t2], None).await?;
        result.record(
            cache.get(&k1, &[&t2, &t1]).await?.as_deref() == Some(b"new".as_slice()),
            "rewrite after flush readable",
        );

        let purging = cache.with_invalidator(ctx.invalidator().with_purge_stale(true));
        let stale = purging.put(&k1, b"stale", &[&t3], None).await?;
        purging.flush(&[&t3]).await?;
        result.record(!exists(ctx, &stale).await?, "purge removes stale values");
        Ok(())
    }
}

/// Flushing an already emptied tag is a no-op.
pub struct IdempotentFlushCheck;

#[async_trait]
impl DoctorCheck for IdempotentFlushCheck {
    fn name(&self) -> &'static str {
        "idempotent_flush"
    }

    async fn run(&self, ctx: &DoctorContext, result: &mut CheckResult) -> Result<(), TagCacheError> {
        for mode in [TagMode::Any, TagMode::All] {
            let cache = ctx.cache(mode);
            let tag = ctx.prefixed(&format!("idem:{}", mode.as_str()));
            cache.put(&ctx.prefixed("idem:key"), b"v", &[&tag], None).await?;

            cache.flush(&[&tag]).await?;
            let second = cache.flush(&[&tag]).await?;
            result.record(
                second.keys == 0 && second.deleted == 0,
                format!(
                    "second {} flush is a no-op, got {} keys / {} deleted",
                    mode.as_str(),
                    second.keys,
                    second.deleted
                ),
            );
        }
        Ok(())
    }
}
