//! Frame admission policy: include/exclude lists, built-in suppression,
//! path-coverage dedup and sampling.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Module prefixes that are never traced regardless of configuration:
/// interpreter standard-library roots, this engine's own namespace, test
/// runners and framework internals. Tracing any of these would either spam
/// the stream or re-enter the tracer.
const BUILTIN_EXCLUDES: &[&str] = &[
    "flowtrace",
    "builtins",
    "importlib",
    "encodings",
    "codecs",
    "abc",
    "typing",
    "collections",
    "functools",
    "itertools",
    "contextlib",
    "threading",
    "queue",
    "weakref",
    "traceback",
    "linecache",
    "logging",
    "unittest",
    "pytest",
    "_pytest",
    "doctest",
    "pip",
    "setuptools",
    "pkg_resources",
];

/// File-path fragments that mark third-party or frozen code.
const EXCLUDED_FILE_MARKERS: &[&str] = &["site-packages", "<frozen", "<string>"];

/// Decides, per frame, whether the frame is instrumentable and whether a
/// qualifying frame should be streamed.
///
/// Precedence is strict: configured excludes, then the built-in excludes,
/// then the include allow-list (when non-empty), then path-coverage dedup,
/// then sampling.
#[derive(Debug)]
pub struct FilterPolicy {
    includes: Vec<String>,
    excludes: Vec<String>,
    coverage_limit: Option<u32>,
    coverage: DashMap<(String, u32), u32>,
    sample_rate: u64,
    sample_counter: AtomicU64,
}

impl FilterPolicy {
    /// Creates the policy from the configured lists.
    pub fn new(
        includes: Vec<String>,
        excludes: Vec<String>,
        coverage_limit: Option<u32>,
        sample_rate: u64,
    ) -> Self {
        Self {
            includes,
            excludes,
            coverage_limit,
            coverage: DashMap::new(),
            sample_rate: sample_rate.max(1),
            sample_counter: AtomicU64::new(0),
        }
    }

    /// Returns whether a frame at (module, file) is instrumentable at all.
    pub fn should_trace(&self, module: &str, file: &str) -> bool {
        if self.excludes.iter().any(|prefix| module.starts_with(prefix)) {
            return false;
        }
        if BUILTIN_EXCLUDES.iter().any(|prefix| matches_module_root(module, prefix)) {
            return false;
        }
        if EXCLUDED_FILE_MARKERS.iter().any(|marker| file.contains(marker)) {
            return false;
        }
        if !self.includes.is_empty() {
            return self.includes.iter().any(|prefix| module.starts_with(prefix));
        }
        true
    }

    /// Records one encounter of the definition site and returns whether the
    /// call is still within the site's streaming budget.
    ///
    /// With dedup off this always returns true. Counters advance either way,
    /// so hot-site statistics stay accurate once the budget is spent.
    pub fn coverage_admits(&self, file: &str, line: u32) -> bool {
        let Some(limit) = self.coverage_limit else { return true };
        let mut count = self.coverage.entry((file.to_string(), line)).or_insert(0);
        *count += 1;
        *count <= limit
    }

    /// Returns the number of encounters recorded for a definition site.
    pub fn coverage_count(&self, file: &str, line: u32) -> u32 {
        self.coverage.get(&(file.to_string(), line)).map(|c| *c).unwrap_or(0)
    }

    /// Advances the sampling counter and returns whether this qualifying
    /// frame is the 1-in-N winner.
    pub fn sample_admits(&self) -> bool {
        if self.sample_rate <= 1 {
            return true;
        }
        self.sample_counter.fetch_add(1, Ordering::Relaxed) % self.sample_rate == 0
    }
}

/// A built-in prefix matches whole dotted segments only, so "abc" suppresses
/// "abc" and "abc.meta" but not "abcdef".
fn matches_module_root(module: &str, root: &str) -> bool {
    module == root || (module.starts_with(root) && module.as_bytes().get(root.len()) == Some(&b'.'))
}
