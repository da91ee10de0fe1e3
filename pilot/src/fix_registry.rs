//! Persistent error/fix learning registry.
//!
//! Failures are reduced to a normalized signature (see
//! [`crate::core::signature`]) and counted per context. A fix attached to a
//! signature is returned the next time the same failure is recorded, which is
//! what lets the planner self-heal across runs.
//!
//! The registry is bounded; the least-recently-touched record is evicted.
//! Persistence failures never surface to callers: the registry logs once,
//! emits `registry_degraded` and carries on in memory.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::core::signature::{normalize, registry_key};
use crate::core::types::truncate_chars;
use crate::events::EventSink;
use crate::io::fix_store::FixLog;

const MAX_RAW_ERROR_CHARS: usize = 500;
const MAX_FIX_CHARS: usize = 500;

/// One normalized failure kind in one context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub signature: String,
    pub context: String,
    pub occurrences: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_fix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_source: Option<String>,
    /// Times the known fix was handed back to a caller.
    #[serde(default)]
    pub fixes_surfaced: u64,
    /// Times a surfaced fix did not prevent a recurrence.
    #[serde(default)]
    pub fix_failures: u64,
    pub raw_error: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(signature: &str, context: &str, raw_error: &str) -> Self {
        let now = Utc::now();
        Self {
            signature: signature.to_string(),
            context: context.to_string(),
            occurrences: 0,
            known_fix: None,
            fix_source: None,
            fixes_surfaced: 0,
            fix_failures: 0,
            raw_error: truncate_chars(raw_error, MAX_RAW_ERROR_CHARS).to_string(),
            first_seen: now,
            last_seen: now,
        }
    }

    pub fn key(&self) -> String {
        registry_key(&self.context, &self.signature)
    }
}

/// Aggregate view for reports and the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryStats {
    pub unique_errors: usize,
    pub total_occurrences: u64,
    pub with_fix: usize,
    pub unfixed_recurring: usize,
    pub fixes_surfaced: u64,
    /// Share of unique errors with a known fix, 0.0 to 1.0.
    pub fix_rate: f64,
    pub persistent: bool,
}

struct Entry {
    record: ErrorRecord,
    touched: u64,
}

struct RegistryState {
    entries: HashMap<String, Entry>,
    clock: u64,
    store: Option<FixLog>,
    degraded: bool,
}

pub struct FixRegistry {
    state: Mutex<RegistryState>,
    max_entries: usize,
    events: Arc<EventSink>,
}

impl FixRegistry {
    /// Registry that never touches disk.
    pub fn in_memory(max_entries: usize, events: Arc<EventSink>) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                entries: HashMap::new(),
                clock: 0,
                store: None,
                degraded: false,
            }),
            max_entries: max_entries.max(1),
            events,
        }
    }

    /// Registry backed by the JSON-lines log at `path`.
    ///
    /// An unreadable log degrades the registry to memory instead of failing.
    pub fn open(path: &Path, max_entries: usize, events: Arc<EventSink>) -> Self {
        let registry = Self::in_memory(max_entries, events);
        match FixLog::open(path) {
            Ok((log, records)) => {
                let mut state = registry.lock();
                for record in records {
                    state.clock += 1;
                    let touched = state.clock;
                    state.entries.insert(record.key(), Entry { record, touched });
                }
                state.store = Some(log);
                registry.enforce_cap(&mut state);
                info!(path = %path.display(), entries = state.entries.len(), "fix registry loaded");
            }
            Err(err) => {
                let mut state = registry.lock();
                registry.degrade(&mut state, &err);
            }
        }
        registry
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count one occurrence of `error` in `context`; returns the known fix, if any.
    pub fn record_error(&self, error: &str, context: &str) -> Option<String> {
        let signature = normalize(error);
        let key = registry_key(context, &signature);
        let mut state = self.lock();
        state.clock += 1;
        let touched = state.clock;
        let entry = state.entries.entry(key).or_insert_with(|| Entry {
            record: ErrorRecord::new(&signature, context, error),
            touched,
        });
        entry.touched = touched;
        let record = &mut entry.record;
        record.occurrences += 1;
        record.last_seen = Utc::now();
        record.raw_error = truncate_chars(error, MAX_RAW_ERROR_CHARS).to_string();
        if record.known_fix.is_some() {
            record.fixes_surfaced += 1;
        }
        let snapshot = record.clone();
        self.persist(&mut state, &snapshot);
        drop(state);

        debug!(context, signature = %snapshot.signature, occurrences = snapshot.occurrences, "error recorded");
        self.events.emit(
            "error_tracked",
            json!({
                "signature": snapshot.signature,
                "context": snapshot.context,
                "occurrences": snapshot.occurrences,
                "has_fix": snapshot.known_fix.is_some(),
            }),
        );
        snapshot.known_fix
    }

    /// Attach a fix to a failure kind. Re-recording the same fix only touches the entry.
    pub fn record_fix(&self, error: &str, context: &str, fix: &str, source: &str) {
        let signature = normalize(error);
        let key = registry_key(context, &signature);
        let fix = truncate_chars(fix.trim(), MAX_FIX_CHARS).to_string();
        let mut state = self.lock();
        state.clock += 1;
        let touched = state.clock;
        let entry = state.entries.entry(key).or_insert_with(|| Entry {
            record: ErrorRecord::new(&signature, context, error),
            touched,
        });
        entry.touched = touched;
        if entry.record.known_fix.as_deref() == Some(fix.as_str()) {
            // Re-append so the touch order survives a reload.
            let snapshot = entry.record.clone();
            self.persist(&mut state, &snapshot);
            return;
        }
        entry.record.known_fix = Some(fix.clone());
        entry.record.fix_source = Some(source.to_string());
        let snapshot = entry.record.clone();
        self.persist(&mut state, &snapshot);
        drop(state);

        info!(context, signature = %signature, source, "fix recorded");
        self.events.emit(
            "fix_recorded",
            json!({
                "signature": signature,
                "context": context,
                "fix": truncate_chars(&fix, 200),
                "source": source,
            }),
        );
    }

    pub fn get_known_fix(&self, error: &str, context: &str) -> Option<String> {
        let key = registry_key(context, &normalize(error));
        self.lock()
            .entries
            .get(&key)
            .and_then(|entry| entry.record.known_fix.clone())
    }

    /// The surfaced fix did not help: forget it so the error counts as unfixed again.
    pub fn mark_fix_failed(&self, error: &str, context: &str) {
        let key = registry_key(context, &normalize(error));
        let mut state = self.lock();
        state.clock += 1;
        let touched = state.clock;
        let Some(entry) = state.entries.get_mut(&key) else {
            return;
        };
        let Some(fix) = entry.record.known_fix.take() else {
            return;
        };
        entry.touched = touched;
        entry.record.fix_source = None;
        entry.record.fix_failures += 1;
        let snapshot = entry.record.clone();
        self.persist(&mut state, &snapshot);
        drop(state);

        warn!(context, signature = %snapshot.signature, "known fix did not help");
        self.events.emit(
            "fix_failed",
            json!({
                "signature": snapshot.signature,
                "context": context,
                "fix": truncate_chars(&fix, 200),
            }),
        );
    }

    pub fn get(&self, error: &str, context: &str) -> Option<ErrorRecord> {
        let key = registry_key(context, &normalize(error));
        self.lock().entries.get(&key).map(|e| e.record.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_degraded(&self) -> bool {
        self.lock().degraded
    }

    /// Most frequent errors first.
    pub fn top_errors(&self, n: usize) -> Vec<ErrorRecord> {
        let mut records = self.records();
        records.sort_by(|a, b| {
            b.occurrences
                .cmp(&a.occurrences)
                .then_with(|| a.signature.cmp(&b.signature))
        });
        records.truncate(n);
        records
    }

    /// Recurring errors with no known fix, most frequent first.
    pub fn unfixed(&self, min_occurrences: u64) -> Vec<ErrorRecord> {
        let mut records: Vec<ErrorRecord> = self
            .records()
            .into_iter()
            .filter(|r| r.known_fix.is_none() && r.occurrences >= min_occurrences)
            .collect();
        records.sort_by(|a, b| b.occurrences.cmp(&a.occurrences));
        records
    }

    /// Recent failure patterns in `context`, as a warning block for prompts.
    pub fn warning_for(&self, context: &str, min_occurrences: u64) -> Option<String> {
        let mut lines: Vec<String> = self
            .records()
            .into_iter()
            .filter(|r| r.context == context && r.occurrences >= min_occurrences)
            .map(|r| match &r.known_fix {
                Some(fix) => format!("- {} (x{}): known fix: {fix}", r.signature, r.occurrences),
                None => format!("- {} (x{})", r.signature, r.occurrences),
            })
            .collect();
        if lines.is_empty() {
            return None;
        }
        lines.sort();
        Some(lines.join("\n"))
    }

    pub fn stats(&self) -> RegistryStats {
        let state = self.lock();
        let records = state.entries.values().map(|e| &e.record);
        let unique_errors = state.entries.len();
        let with_fix = records.clone().filter(|r| r.known_fix.is_some()).count();
        RegistryStats {
            unique_errors,
            total_occurrences: records.clone().map(|r| r.occurrences).sum(),
            with_fix,
            unfixed_recurring: records
                .clone()
                .filter(|r| r.known_fix.is_none() && r.occurrences >= 2)
                .count(),
            fixes_surfaced: records.map(|r| r.fixes_surfaced).sum(),
            fix_rate: with_fix as f64 / unique_errors.max(1) as f64,
            persistent: state.store.is_some(),
        }
    }

    /// Human-readable summary for the CLI.
    pub fn report(&self) -> String {
        let stats = self.stats();
        let mut out = format!(
            "{} unique errors, {} occurrences, {} with fixes ({:.0}%), {} recurring unfixed\n",
            stats.unique_errors,
            stats.total_occurrences,
            stats.with_fix,
            stats.fix_rate * 100.0,
            stats.unfixed_recurring,
        );
        for record in self.top_errors(10) {
            out.push_str(&format!(
                "  [{}] x{} {}",
                record.context, record.occurrences, record.signature
            ));
            if let Some(fix) = &record.known_fix {
                out.push_str(&format!("\n      fix: {fix}"));
            }
            out.push('\n');
        }
        out
    }

    fn records(&self) -> Vec<ErrorRecord> {
        self.lock()
            .entries
            .values()
            .map(|e| e.record.clone())
            .collect()
    }

    fn persist(&self, state: &mut RegistryState, record: &ErrorRecord) {
        let evicted = self.enforce_cap(state);
        let Some(store) = state.store.as_mut() else {
            return;
        };
        let mut result = store.append(record);
        if result.is_ok() && (evicted > 0 || store.lines() > self.max_entries * 2) {
            let mut live: Vec<&Entry> = state.entries.values().collect();
            live.sort_by_key(|e| e.touched);
            result = store.rewrite(live.into_iter().map(|e| &e.record));
        }
        if let Err(err) = result {
            self.degrade(state, &err);
        }
    }

    /// Evict least-recently-touched entries above the cap.
    fn enforce_cap(&self, state: &mut RegistryState) -> usize {
        let excess = state.entries.len().saturating_sub(self.max_entries);
        if excess == 0 {
            return 0;
        }
        let mut by_age: Vec<(u64, String)> = state
            .entries
            .iter()
            .map(|(key, entry)| (entry.touched, key.clone()))
            .collect();
        by_age.sort();
        for (_, key) in by_age.into_iter().take(excess) {
            state.entries.remove(&key);
        }
        debug!(evicted = excess, "fix registry pruned");
        excess
    }

    fn degrade(&self, state: &mut RegistryState, err: &anyhow::Error) {
        state.store = None;
        if state.degraded {
            return;
        }
        state.degraded = true;
        warn!(err = %format!("{err:#}"), "fix registry persistence failed, continuing in memory");
        self.events
            .emit("registry_degraded", json!({ "error": format!("{err:#}") }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> Arc<EventSink> {
        Arc::new(EventSink::new(50))
    }

    #[test]
    fn fix_is_returned_for_matching_signature() {
        let registry = FixRegistry::in_memory(10, sink());
        assert_eq!(
            registry.record_error("open /tmp/a.txt: permission denied", "read_file"),
            None
        );
        registry.record_fix(
            "open /var/b.txt: permission denied",
            "read_file",
            "check file permissions with ls -l first",
            "manual",
        );
        let fix = registry.record_error("open /home/c.txt: permission denied", "read_file");
        assert_eq!(fix.as_deref(), Some("check file permissions with ls -l first"));
        let record = registry
            .get("open /x: permission denied", "read_file")
            .expect("record");
        assert_eq!(record.occurrences, 2);
        assert_eq!(record.fixes_surfaced, 1);
    }

    #[test]
    fn contexts_are_separate() {
        let registry = FixRegistry::in_memory(10, sink());
        registry.record_fix("boom", "run_command", "retry later", "manual");
        assert_eq!(registry.get_known_fix("boom", "read_file"), None);
        assert!(registry.get_known_fix("boom", "run_command").is_some());
    }

    #[test]
    fn identical_fix_is_idempotent() {
        let events = sink();
        let registry = FixRegistry::in_memory(10, events.clone());
        registry.record_fix("boom", "ctx", "do x", "manual");
        registry.record_fix("boom", "ctx", "do x", "manual");
        let recorded = events
            .history()
            .iter()
            .filter(|e| e.kind == "fix_recorded")
            .count();
        assert_eq!(recorded, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn failed_fix_is_forgotten() {
        let registry = FixRegistry::in_memory(10, sink());
        registry.record_fix("boom", "ctx", "do x", "manual");
        registry.mark_fix_failed("boom", "ctx");
        assert_eq!(registry.get_known_fix("boom", "ctx"), None);
        let record = registry.get("boom", "ctx").expect("record");
        assert_eq!(record.fix_failures, 1);
    }

    #[test]
    fn least_recently_touched_is_evicted() {
        let registry = FixRegistry::in_memory(2, sink());
        registry.record_error("first", "c");
        registry.record_error("second", "c");
        registry.record_error("first", "c");
        registry.record_error("third", "c");
        assert_eq!(registry.len(), 2);
        assert!(registry.get("first", "c").is_some());
        assert!(registry.get("second", "c").is_none());
        assert!(registry.get("third", "c").is_some());
    }

    #[test]
    fn persists_across_reopen() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("fixes.jsonl");
        {
            let registry = FixRegistry::open(&path, 10, sink());
            registry.record_error("disk full at /mnt/x", "write_file");
            registry.record_fix("disk full at /mnt/y", "write_file", "free space", "manual");
        }
        let registry = FixRegistry::open(&path, 10, sink());
        assert!(!registry.is_degraded());
        assert_eq!(
            registry.get_known_fix("disk full at /mnt/z", "write_file").as_deref(),
            Some("free space")
        );
        assert_eq!(registry.stats().total_occurrences, 1);
    }

    #[test]
    fn log_is_compacted_when_it_grows() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("fixes.jsonl");
        let registry = FixRegistry::open(&path, 2, sink());
        for _ in 0..10 {
            registry.record_error("same", "c");
        }
        let lines = std::fs::read_to_string(&path).expect("read").lines().count();
        assert!(lines <= 4, "log has {lines} lines");
        drop(registry);
        let reopened = FixRegistry::open(&path, 2, sink());
        assert_eq!(reopened.get("same", "c").expect("record").occurrences, 10);
    }

    #[test]
    fn refreshed_fix_keeps_its_place_after_reopen() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("fixes.jsonl");
        {
            let registry = FixRegistry::open(&path, 2, sink());
            registry.record_fix("quota exceeded", "fetch_url", "wait a minute", "manual");
            registry.record_error("connection reset", "fetch_url");
            registry.record_fix("quota exceeded", "fetch_url", "wait a minute", "manual");
        }
        let registry = FixRegistry::open(&path, 2, sink());
        registry.record_error("host not found", "fetch_url");
        assert!(registry.get("quota exceeded", "fetch_url").is_some());
        assert!(registry.get("connection reset", "fetch_url").is_none());
        assert!(registry.get("host not found", "fetch_url").is_some());
    }

    #[test]
    fn unusable_path_degrades_to_memory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let blocker = temp.path().join("file");
        std::fs::write(&blocker, "x").expect("write");
        let events = sink();
        let registry = FixRegistry::open(&blocker.join("fixes.jsonl"), 10, events.clone());
        assert!(registry.is_degraded());
        assert_eq!(registry.record_error("boom", "c"), None);
        assert_eq!(registry.len(), 1);
        assert_eq!(
            events
                .history()
                .iter()
                .filter(|e| e.kind == "registry_degraded")
                .count(),
            1
        );
    }

    #[test]
    fn stats_and_report() {
        let registry = FixRegistry::in_memory(10, sink());
        registry.record_error("a", "x");
        registry.record_error("a", "x");
        registry.record_error("b", "x");
        registry.record_fix("b", "x", "fix b", "manual");
        let stats = registry.stats();
        assert_eq!(stats.unique_errors, 2);
        assert_eq!(stats.total_occurrences, 3);
        assert_eq!(stats.with_fix, 1);
        assert_eq!(stats.unfixed_recurring, 1);
        assert!((stats.fix_rate - 0.5).abs() < f64::EPSILON);
        assert!(registry.report().contains("fix: fix b"));
        assert_eq!(registry.unfixed(2).len(), 1);
        assert_eq!(registry.top_errors(1)[0].signature, "a");
        assert!(registry.warning_for("x", 2).expect("warning").contains("a (x2)"));
    }
}
