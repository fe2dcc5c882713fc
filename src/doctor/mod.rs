// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Live self-check of the key-space invariants.
//!
//! The harness runs a fixed battery of checks against a real store using
//! synthetic data whose names all start with the doctor prefix
//! (`_doctor:test:` by default). Nothing outside that prefix is read or
//! written, except one control key per run that is removed explicitly.
//!
//! ```text
//! DoctorHarness::run(ctx)
//!   ├─ cleanup(test prefix)          ← leftovers of an aborted run
//!   ├─ check 1..n → CheckResult      ← errors become failed assertions
//!   ├─ cleanup(test prefix)
//!   └─ DoctorReport { results }      ← passed() drives the CLI exit code
//! ```

mod checks;

pub use checks::{
    EagerFlushCheck, GenerationCheck, IdempotentFlushCheck, LazyFlushCheck, NamespaceCheck, PatternCleanupCheck,
    TopologyParityCheck,
};

use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::cache::TaggedCache;
use crate::flush::TagInvalidator;
use crate::keyspace::{KeySpace, TagMode};
use crate::metrics;
use crate::storage::traits::{TagCacheError, TagStore};
use crate::tags::TagRegistry;

/// Everything a check needs, scoped to one doctor run.
#[derive(Clone)]
pub struct DoctorContext {
    cache: TaggedCache,
    test_prefix: String,
}

impl DoctorContext {
    pub fn new(cache: TaggedCache, test_prefix: impl Into<String>) -> Self {
        Self {
            cache,
            test_prefix: test_prefix.into(),
        }
    }

    pub fn store(&self) -> &Arc<dyn TagStore> {
        self.cache.store()
    }

    pub fn invalidator(&self) -> &TagInvalidator {
        self.cache.invalidator()
    }

    /// Cache prefix of the deployment under test.
    pub fn prefix(&self) -> &str {
        self.cache.keyspace().prefix()
    }

    pub fn test_prefix(&self) -> &str {
        &self.test_prefix
    }

    /// A key outside every doctor pattern, used to prove cleanup stays in scope.
    pub fn control_key(&self) -> String {
        format!("_control:{}sentinel", self.test_prefix)
    }

    /// Doctor-owned name for a key or tag.
    pub fn prefixed(&self, name: &str) -> String {
        format!("{}{}", self.test_prefix, name)
    }

    pub fn keyspace(&self, mode: TagMode) -> KeySpace {
        self.cache.keyspace().with_mode(mode)
    }

    pub fn cache(&self, mode: TagMode) -> TaggedCache {
        self.cache.with_mode(mode)
    }

    /// Delete all doctor data in both modes and drop doctor tags from both
    /// registries. Returns the number of keys removed.
    #[instrument(skip(self), fields(test_prefix = %self.test_prefix))]
    pub async fn cleanup(&self) -> Result<u64, TagCacheError> {
        let mut removed = 0;
        for mode in [TagMode::Any, TagMode::All] {
            let keyspace = self.keyspace(mode);
            for pattern in keyspace.doctor_patterns(&self.test_prefix) {
                removed += self.invalidator().flush_by_pattern(&pattern).await?;
            }

            let registry = TagRegistry::new(self.store().clone(), keyspace);
            let doctor_tags: Vec<String> = registry
                .list()
                .await?
                .into_iter()
                .filter(|t| t.starts_with(&self.test_prefix))
                .collect();
            if !doctor_tags.is_empty() {
                self.store().execute(&[registry.unregister(&doctor_tags)]).await?;
            }
        }
        Ok(removed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assertion {
    pub passed: bool,
    pub description: String,
}

/// Assertions made by one check, in the order they were made.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub name: &'static str,
    pub assertions: Vec<Assertion>,
}

impl CheckResult {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            assertions: Vec::new(),
        }
    }

    pub fn record(&mut self, passed: bool, description: impl Into<String>) {
        self.assertions.push(Assertion {
            passed,
            description: description.into(),
        });
    }

    /// True when every assertion passed. A check with no assertions passes.
    pub fn passed(&self) -> bool {
        self.assertions.iter().all(|a| a.passed)
    }

    pub fn failures(&self) -> Vec<String> {
        self.assertions
            .iter()
            .filter(|a| !a.passed)
            .map(|a| format!("{}: {}", self.name, a.description))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DoctorReport {
    pub results: Vec<CheckResult>,
}

impl DoctorReport {
    pub fn passed(&self) -> bool {
        self.results.iter().all(CheckResult::passed)
    }

    pub fn assertion_count(&self) -> usize {
        self.results.iter().map(|r| r.assertions.len()).sum()
    }

    pub fn failure_count(&self) -> usize {
        self.results.iter().map(|r| r.assertions.iter().filter(|a| !a.passed).count()).sum()
    }

    pub fn failures(&self) -> Vec<String> {
        self.results.iter().flat_map(CheckResult::failures).collect()
    }

    pub fn result(&self, name: &str) -> Option<&CheckResult> {
        self.results.iter().find(|r| r.name == name)
    }

    /// Human-readable summary, one line per check plus one per failure.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "tag-cache doctor: {} checks, {} assertions, {} failed",
            self.results.len(),
            self.assertion_count(),
            self.failure_count()
        );
        for result in &self.results {
            let ok = result.assertions.iter().filter(|a| a.passed).count();
            let status = if result.passed() { "PASS" } else { "FAIL" };
            let _ = writeln!(out, "  [{}] {} ({}/{})", status, result.name, ok, result.assertions.len());
            for assertion in result.assertions.iter().filter(|a| !a.passed) {
                let _ = writeln!(out, "      - {}", assertion.description);
            }
        }
        out
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// One doctor check. Record assertions on `result`; an `Err` is turned into
/// a failed assertion by the harness.
#[async_trait]
pub trait DoctorCheck: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &DoctorContext, result: &mut CheckResult) -> Result<(), TagCacheError>;
}

pub struct DoctorHarness {
    checks: Vec<Box<dyn DoctorCheck>>,
}

impl Default for DoctorHarness {
    fn default() -> Self {
        Self::with_checks(vec![
            Box::new(NamespaceCheck),
            Box::new(LazyFlushCheck),
            Box::new(EagerFlushCheck),
            Box::new(TopologyParityCheck),
            Box::new(PatternCleanupCheck),
            Box::new(GenerationCheck),
            Box::new(IdempotentFlushCheck),
        ])
    }
}

impl DoctorHarness {
    pub fn with_checks(checks: Vec<Box<dyn DoctorCheck>>) -> Self {
        Self { checks }
    }

    pub fn check_names(&self) -> Vec<&'static str> {
        self.checks.iter().map(|c| c.name()).collect()
    }

    #[instrument(skip(self, ctx), fields(checks = self.checks.len()))]
    pub async fn run(&self, ctx: &DoctorContext) -> DoctorReport {
        let mut report = DoctorReport::default();

        if let Err(e) = ctx.cleanup().await {
            warn!(error = %e, "Doctor pre-run cleanup failed");
        }

        for check in &self.checks {
            let mut result = CheckResult::new(check.name());
            if let Err(e) = check.run(ctx, &mut result).await {
                result.record(false, format!("check errored: {}", e));
            }

            metrics::record_doctor_check(result.name, result.passed());
            if result.passed() {
                info!(check = result.name, assertions = result.assertions.len(), "Doctor check passed");
            } else {
                warn!(check = result.name, failures = ?result.failures(), "Doctor check failed");
            }
            report.results.push(result);
        }

        if let Err(e) = ctx.cleanup().await {
            warn!(error = %e, "Doctor post-run cleanup failed");
        }

        metrics::set_doctor_failures(report.failure_count());
        report
    }
}
