//! # Doctor Example
//!
//! Runs the tag-cache self-check against Redis when `REDIS_URL` is set,
//! otherwise against the in-memory store, then prints the report and the
//! metrics the run emitted.
//!
//! ```bash
//! cargo run --example doctor
//! REDIS_URL=redis://localhost:6379 cargo run --example doctor
//! ```

use std::sync::Arc;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use tag_cache::{
    DoctorContext, DoctorHarness, MemoryTagStore, RedisTagStore, TagCacheConfig, TagMode, TagStore, TaggedCache,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    let config = TagCacheConfig {
        redis_url: std::env::var("REDIS_URL").ok(),
        prefix: "app:".into(),
        ..Default::default()
    };

    let store: Arc<dyn TagStore> = match &config.redis_url {
        Some(url) => {
            println!("🔌 Connecting to {}", url);
            Arc::new(RedisTagStore::connect(&config).await?)
        }
        None => {
            println!("🧪 REDIS_URL not set, using the in-memory store");
            Arc::new(MemoryTagStore::new())
        }
    };

    // Some application data the doctor must not touch
    let cache = TaggedCache::new(store, &config)?;
    cache.put("user:1", b"alice", &["users", "active"], None).await?;
    cache.with_mode(TagMode::All).put("post:1", b"hello", &["posts"], None).await?;

    let ctx = DoctorContext::new(cache.clone(), config.doctor_prefix.clone());
    let report = DoctorHarness::default().run(&ctx).await;

    println!("\n{}", report.render());
    if !report.passed() {
        println!("{}", report.to_json()?);
    }

    let survived = cache.get("user:1", &["users", "active"]).await?.is_some();
    println!("Application key survived the run: {}", survived);

    println!("\n📊 Metrics");
    dump_metrics(&snapshotter);

    std::process::exit(if report.passed() { 0 } else { 1 });
}

fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, value)| {
            let (_, key) = composite_key.into_parts();
            let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
            let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
            match value {
                DebugValue::Counter(v) => format!("   {}{} = {}", key.name(), label_str, v),
                DebugValue::Gauge(v) => format!("   {}{} = {:.2}", key.name(), label_str, v.into_inner()),
                DebugValue::Histogram(samples) => {
                    let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                    format!("   {}{} count={} sum={:.4}", key.name(), label_str, samples.len(), sum)
                }
            }
        })
        .collect();
    lines.sort();

    if lines.is_empty() {
        println!("   (no metrics recorded)");
    }
    for line in lines {
        println!("{}", line);
    }
}
