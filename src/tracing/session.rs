//! Per-process session state and the shutdown artifact writer.

use super::types::{CallRecord, MethodRef, Protocol};
use super::Error;
use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Lightweight summary of a call that is still on some thread's stack.
///
/// The full [`CallRecord`] is owned by the opening thread; this map entry
/// exists for id lookup and telemetry only, so no record is ever mutated
/// from a foreign thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActiveCall {
    /// Dotted module path.
    pub module: String,
    /// Function name.
    pub function: String,
    /// Thread the call is running on.
    pub thread_id: u64,
    /// Call depth at entry.
    pub depth: usize,
    /// Monotonic nanoseconds at entry.
    pub start_ns: u64,
}

/// All recorded calls between `enable()` and `disable()` in one process.
///
/// Mutated only by the instrumentor; frozen by the finalizer on first
/// invocation.
#[derive(Debug)]
pub struct Session {
    session_id: String,
    language: String,
    process_id: u32,
    started_at: DateTime<Utc>,
    completed: Mutex<Vec<CallRecord>>,
    registered: Mutex<BTreeSet<MethodRef>>,
    active: DashMap<String, ActiveCall>,
    total_calls: AtomicU64,
    frozen: AtomicBool,
    finalized: Mutex<Option<FinalizeOutcome>>,
}

#[derive(Clone, Debug)]
struct FinalizeOutcome {
    session_path: PathBuf,
}

impl Session {
    /// Creates an empty session with a fresh timestamped id.
    pub fn new(language: impl Into<String>) -> Self {
        let started_at = Utc::now();
        let process_id = std::process::id();
        let session_id = format!("{}_{}", started_at.format("%Y%m%d_%H%M%S"), process_id);
        Self {
            session_id,
            language: language.into(),
            process_id,
            started_at,
            completed: Mutex::new(Vec::new()),
            registered: Mutex::new(BTreeSet::new()),
            active: DashMap::new(),
            total_calls: AtomicU64::new(0),
            frozen: AtomicBool::new(false),
            finalized: Mutex::new(None),
        }
    }

    /// Returns the timestamped session tag.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Returns the language tag of the traced runtime.
    pub fn language(&self) -> &str {
        &self.language
    }

    /// Returns the traced process id.
    pub const fn process_id(&self) -> u32 {
        self.process_id
    }

    /// Returns the number of calls recorded so far.
    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::Relaxed)
    }

    /// Returns the number of calls currently on some thread's stack.
    pub fn active_calls(&self) -> usize {
        self.active.len()
    }

    /// Returns true once the finalizer has run.
    pub fn is_finalized(&self) -> bool {
        self.frozen.load(Ordering::Relaxed)
    }

    /// Counts a newly recorded call and returns the running total.
    pub(crate) fn note_call(&self) -> u64 {
        self.total_calls.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Adds a (module, function) pair to the registry.
    pub(crate) fn register_method(&self, method: MethodRef) {
        if self.is_finalized() {
            return;
        }
        self.registered.lock().insert(method);
    }

    /// Publishes an open call for id lookup.
    pub(crate) fn activate(&self, call_id: &str, active: ActiveCall) {
        self.active.insert(call_id.to_string(), active);
    }

    /// Withdraws an open call, returning its summary if it was known.
    pub(crate) fn deactivate(&self, call_id: &str) -> Option<ActiveCall> {
        self.active.remove(call_id).map(|(_, active)| active)
    }

    /// Appends a closed record to the session.
    pub(crate) fn push_completed(&self, record: CallRecord) {
        if self.is_finalized() {
            return;
        }
        self.completed.lock().push(record);
    }

    /// Returns the sorted registered-method snapshot.
    pub fn registry_snapshot(&self) -> Vec<MethodRef> {
        self.registered.lock().iter().cloned().collect()
    }

    /// Clones the ordered sequence of closed records.
    pub fn completed_records(&self) -> Vec<CallRecord> {
        self.completed.lock().clone()
    }

    /// Writes the session artifact (and optionally the performance summary)
    /// under `output_dir`.
    ///
    /// Idempotent: the first invocation freezes the session and writes the
    /// files, every later invocation is a no-op returning the original path,
    /// so repeated finalization leaves byte-identical artifacts on disk.
    pub fn finalize(&self, output_dir: &Path, write_summary: bool) -> Result<PathBuf, Error> {
        let mut finalized = self.finalized.lock();
        if let Some(outcome) = finalized.as_ref() {
            return Ok(outcome.session_path.clone());
        }

        // freeze first so in-flight callbacks stop appending, then snapshot
        self.frozen.store(true, Ordering::Relaxed);

        fs::create_dir_all(output_dir)?;

        let ended_at = Utc::now();
        let calls = self.completed.lock().clone();
        let artifact = SessionArtifact {
            session_id: self.session_id.clone(),
            language: self.language.clone(),
            process_id: self.process_id,
            started_at: rfc3339(self.started_at),
            ended_at: rfc3339(ended_at),
            total_calls: self.total_calls(),
            registered_methods: self.registry_snapshot(),
            calls,
        };

        let session_path = output_dir.join(format!("session_{}.json", self.session_id));
        write_atomic(&session_path, &serde_json::to_vec_pretty(&artifact)?)?;

        if write_summary {
            let summary = SessionSummary::from_artifact(&artifact);
            let summary_path = output_dir.join(format!("summary_{}.json", self.session_id));
            write_atomic(&summary_path, &serde_json::to_vec_pretty(&summary)?)?;
        }

        *finalized = Some(FinalizeOutcome { session_path: session_path.clone() });
        Ok(session_path)
    }
}

/// The durable session file layout.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionArtifact {
    /// Timestamped session tag.
    pub session_id: String,
    /// Language tag of the traced runtime.
    pub language: String,
    /// Operating-system id of the traced process.
    pub process_id: u32,
    /// Wall-clock session start, RFC 3339.
    pub started_at: String,
    /// Wall-clock session end, RFC 3339.
    pub ended_at: String,
    /// Calls recorded over the session lifetime.
    pub total_calls: u64,
    /// Sorted registered-method snapshot.
    pub registered_methods: Vec<MethodRef>,
    /// Ordered sequence of closed call records.
    pub calls: Vec<CallRecord>,
}

/// Companion artifact: per-function aggregates derived from the in-memory
/// session. A summary, not an alternate source of truth.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Session the summary was derived from.
    pub session_id: String,
    /// Calls recorded over the session lifetime.
    pub total_calls: u64,
    /// Aggregates sorted by total time, descending.
    pub functions: Vec<FunctionStats>,
}

/// Aggregate timing for one (module, function) pair.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionStats {
    /// Dotted module path.
    pub module: String,
    /// Function name.
    pub function: String,
    /// Closed calls observed.
    pub calls: u64,
    /// Calls that exited by raising.
    pub errors: u64,
    /// Sum of durations in milliseconds.
    pub total_ms: f64,
    /// Mean duration in milliseconds.
    pub mean_ms: f64,
    /// Longest duration in milliseconds.
    pub max_ms: f64,
    /// Advisory protocol label, when any call carried one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
}

impl SessionSummary {
    fn from_artifact(artifact: &SessionArtifact) -> Self {
        use std::collections::BTreeMap;

        let mut stats: BTreeMap<MethodRef, FunctionStats> = BTreeMap::new();
        for record in &artifact.calls {
            let entry = stats.entry(record.method()).or_insert_with(|| FunctionStats {
                module: record.module.clone(),
                function: record.function.clone(),
                calls: 0,
                errors: 0,
                total_ms: 0.0,
                mean_ms: 0.0,
                max_ms: 0.0,
                protocol: None,
            });
            let duration = record.duration_ms.unwrap_or(0.0);
            entry.calls += 1;
            entry.errors += u64::from(record.is_error());
            entry.total_ms += duration;
            entry.max_ms = entry.max_ms.max(duration);
            entry.protocol = entry.protocol.or(record.protocol);
        }

        let mut functions: Vec<FunctionStats> = stats
            .into_values()
            .map(|mut s| {
                s.mean_ms = if s.calls == 0 { 0.0 } else { s.total_ms / s.calls as f64 };
                s
            })
            .collect();
        functions.sort_by(|a, b| b.total_ms.total_cmp(&a.total_ms));

        Self {
            session_id: artifact.session_id.clone(),
            total_calls: artifact.total_calls,
            functions,
        }
    }
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Writes `bytes` to `path` via a temporary sibling and an atomic rename.
fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}
