//! Memory & learning (C7): durable goal -> selector associations, per-action
//! latency learning ("ghost"), and time-bucketed instability learning
//! ("aura").
//!
//! Both maps persist as plain JSON files, written atomically (temp file +
//! rename) so a crash mid-write never corrupts the on-disk state. On
//! shutdown, the current session's observations win over whatever was
//! loaded at startup for any key both sides touched.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;

/// Bucket width for aura instability tracking, in milliseconds.
const AURA_BUCKET_MS: u64 = 500;

fn bucket_of(ms: u64) -> i64 {
    (ms / AURA_BUCKET_MS) as i64
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SelectorMemoryFile {
    #[serde(default)]
    goals: HashMap<String, String>,
}

/// One observed settle latency, as persisted in `temporal_ghosting.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GhostObservation {
    command: String,
    selector: String,
    latency_ms: u64,
}

/// `temporal_ghosting.json` is a flat list of observations (§4.7/§6), not a
/// map — `command`/`selector` are split back out of the in-memory
/// `"{command}:{selector}"` key on every load/flush.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
struct GhostMemoryFile(Vec<GhostObservation>);

fn ghost_key(command: &str, selector: &str) -> String {
    format!("{command}:{selector}")
}

fn split_ghost_key(key: &str) -> (String, String) {
    match key.split_once(':') {
        Some((command, selector)) => (command.to_string(), selector.to_string()),
        None => (key.to_string(), String::new()),
    }
}

fn write_atomic<T: Serialize>(path: &Path, payload: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(payload)?;
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, path).map_err(|e| {
        warn!(?path, "failed to finalize memory write");
        e
    })?;
    Ok(())
}

/// Learned goal->selector map, action latency estimates, and the set of
/// observed-unstable time buckets.
pub struct MemoryStore {
    memory_file: Option<PathBuf>,
    ghost_file: Option<PathBuf>,
    goals: HashMap<String, String>,
    ghost_latencies_ms: HashMap<String, u64>,
    aura_buckets: HashSet<i64>,
    dirty_goals: HashSet<String>,
    dirty_ghosts: HashSet<String>,
}

impl MemoryStore {
    pub fn new(memory_file: Option<PathBuf>, ghost_file: Option<PathBuf>) -> Self {
        Self {
            memory_file,
            ghost_file,
            goals: HashMap::new(),
            ghost_latencies_ms: HashMap::new(),
            aura_buckets: HashSet::new(),
            dirty_goals: HashSet::new(),
            dirty_ghosts: HashSet::new(),
        }
    }

    /// Load persisted state from disk, if configured paths exist. Missing
    /// files are not an error — a fresh Hub starts with empty memory.
    pub fn load(&mut self) -> Result<()> {
        if let Some(path) = &self.memory_file {
            if path.exists() {
                let raw = std::fs::read_to_string(path)?;
                let file: SelectorMemoryFile = serde_json::from_str(&raw)?;
                info!(goals = file.goals.len(), "loaded selector memory");
                self.goals = file.goals;
            }
        }
        if let Some(path) = &self.ghost_file {
            if path.exists() {
                let raw = std::fs::read_to_string(path)?;
                let file: GhostMemoryFile = serde_json::from_str(&raw)?;
                info!(actions = file.0.len(), "loaded ghost latencies");
                self.ghost_latencies_ms = file
                    .0
                    .into_iter()
                    .map(|obs| (ghost_key(&obs.command, &obs.selector), obs.latency_ms))
                    .collect();
            }
        }
        Ok(())
    }

    /// Scan a prior mission_trace.json for aura instability buckets — the
    /// time windows in which a previous run observed DOM churn.
    pub fn learn_aura_from_trace(&mut self, trace_path: &Path) -> Result<()> {
        if !trace_path.exists() {
            return Ok(());
        }
        let raw = std::fs::read_to_string(trace_path)?;
        let trace: serde_json::Value = serde_json::from_str(&raw)?;
        if let Some(entries) = trace.get("entries").and_then(|v| v.as_array()) {
            for entry in entries {
                if entry.get("unstable").and_then(|v| v.as_bool()) == Some(true) {
                    if let Some(ms) = entry.get("timestamp_ms").and_then(|v| v.as_u64()) {
                        self.aura_buckets.insert(bucket_of(ms));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn recall_selector(&self, goal: &str) -> Option<&str> {
        self.goals.get(goal).map(String::as_str)
    }

    pub fn remember_selector(&mut self, goal: String, selector: String) {
        self.dirty_goals.insert(goal.clone());
        self.goals.insert(goal, selector);
    }

    pub fn ghost_latency_ms(&self, action_key: &str) -> Option<u64> {
        self.ghost_latencies_ms.get(action_key).copied()
    }

    /// Track the worst settle latency ever observed for this (verb,
    /// selector) pair, per §3's `ghost:cmd:selector -> maxObservedLatencyMs`.
    /// Monotonic on purpose: a future `stabilityHint` should never be weaker
    /// than the slowest settle this action has actually needed.
    pub fn observe_ghost_latency(&mut self, action_key: String, observed_ms: u64) {
        let updated = match self.ghost_latencies_ms.get(&action_key) {
            Some(prior) => (*prior).max(observed_ms),
            None => observed_ms,
        };
        self.dirty_ghosts.insert(action_key.clone());
        self.ghost_latencies_ms.insert(action_key, updated);
    }

    /// Record that DOM churn was observed at this point in mission time.
    pub fn mark_unstable(&mut self, elapsed_ms: u64) {
        self.aura_buckets.insert(bucket_of(elapsed_ms));
    }

    /// True when `elapsed_ms` falls in, or is adjacent to (+/- one bucket),
    /// a window previously observed as unstable.
    pub fn is_historically_unstable(&self, elapsed_ms: u64) -> bool {
        let bucket = bucket_of(elapsed_ms);
        (bucket - 1..=bucket + 1).any(|b| self.aura_buckets.contains(&b))
    }

    /// Flush both maps to disk atomically. Re-reads whatever is currently on
    /// disk first and overlays only this session's dirty keys on top of it,
    /// so a concurrently-running second Hub's writes to untouched keys
    /// survive and this session's writes win on conflict (§4.7/§8 law 7).
    pub fn flush(&mut self) -> Result<()> {
        if let Some(path) = self.memory_file.clone() {
            let mut on_disk = if path.exists() {
                let raw = std::fs::read_to_string(&path)?;
                serde_json::from_str::<SelectorMemoryFile>(&raw).unwrap_or_default().goals
            } else {
                HashMap::new()
            };
            for key in &self.dirty_goals {
                if let Some(value) = self.goals.get(key) {
                    on_disk.insert(key.clone(), value.clone());
                }
            }
            self.goals = on_disk.clone();
            write_atomic(&path, &SelectorMemoryFile { goals: on_disk })?;
        }
        if let Some(path) = self.ghost_file.clone() {
            let mut on_disk: HashMap<String, u64> = if path.exists() {
                let raw = std::fs::read_to_string(&path)?;
                serde_json::from_str::<GhostMemoryFile>(&raw)
                    .unwrap_or_default()
                    .0
                    .into_iter()
                    .map(|obs| (ghost_key(&obs.command, &obs.selector), obs.latency_ms))
                    .collect()
            } else {
                HashMap::new()
            };
            for key in &self.dirty_ghosts {
                if let Some(value) = self.ghost_latencies_ms.get(key) {
                    let merged = on_disk.get(key).copied().map_or(*value, |prior| prior.max(*value));
                    on_disk.insert(key.clone(), merged);
                }
            }
            self.ghost_latencies_ms = on_disk.clone();
            let observations: Vec<GhostObservation> = on_disk
                .into_iter()
                .map(|(key, latency_ms)| {
                    let (command, selector) = split_ghost_key(&key);
                    GhostObservation { command, selector, latency_ms }
                })
                .collect();
            write_atomic(&path, &GhostMemoryFile(observations))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn aura_bucket_neighbor_check_catches_adjacent_windows() {
        let mut store = MemoryStore::new(None, None);
        store.mark_unstable(2000); // bucket 4
        assert!(store.is_historically_unstable(2000));
        assert!(store.is_historically_unstable(2400)); // still bucket 4
        assert!(store.is_historically_unstable(1600)); // bucket 3, neighbor
        assert!(store.is_historically_unstable(2500)); // bucket 5, neighbor
        assert!(!store.is_historically_unstable(4000)); // bucket 8, far away
    }

    #[test]
    fn ghost_latency_tracks_the_observed_maximum() {
        let mut store = MemoryStore::new(None, None);
        store.observe_ghost_latency("click#submit".into(), 500);
        assert_eq!(store.ghost_latency_ms("click#submit"), Some(500));
        store.observe_ghost_latency("click#submit".into(), 100);
        assert_eq!(store.ghost_latency_ms("click#submit"), Some(500));
        store.observe_ghost_latency("click#submit".into(), 900);
        assert_eq!(store.ghost_latency_ms("click#submit"), Some(900));
    }

    #[test]
    fn flush_then_load_round_trips_selector_memory() {
        let dir = tempdir().unwrap();
        let memory_path = dir.path().join("memory.json");

        let mut writer = MemoryStore::new(Some(memory_path.clone()), None);
        writer.remember_selector("Accept Cookies".into(), "#accept".into());
        writer.flush().unwrap();

        let mut reader = MemoryStore::new(Some(memory_path), None);
        reader.load().unwrap();
        assert_eq!(reader.recall_selector("Accept Cookies"), Some("#accept"));
    }

    #[test]
    fn ghost_file_persists_as_a_flat_list_of_observations() {
        let dir = tempdir().unwrap();
        let ghost_path = dir.path().join("temporal_ghosting.json");

        let mut writer = MemoryStore::new(None, Some(ghost_path.clone()));
        writer.observe_ghost_latency("click:#slow-button".into(), 1200);
        writer.flush().unwrap();

        let raw = std::fs::read_to_string(&ghost_path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let entries = parsed.as_array().expect("ghost file is a JSON array");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["command"], "click");
        assert_eq!(entries[0]["selector"], "#slow-button");
        assert_eq!(entries[0]["latency_ms"], 1200);

        let mut reader = MemoryStore::new(None, Some(ghost_path));
        reader.load().unwrap();
        assert_eq!(reader.ghost_latency_ms("click:#slow-button"), Some(1200));
    }

    #[test]
    fn missing_files_load_as_empty_without_error() {
        let dir = tempdir().unwrap();
        let mut store = MemoryStore::new(
            Some(dir.path().join("absent_memory.json")),
            Some(dir.path().join("absent_ghost.json")),
        );
        assert!(store.load().is_ok());
        assert!(store.recall_selector("anything").is_none());
    }

    #[test]
    fn reload_with_no_new_commands_reproduces_the_same_file() {
        let dir = tempdir().unwrap();
        let memory_path = dir.path().join("memory.json");

        let mut writer = MemoryStore::new(Some(memory_path.clone()), None);
        writer.remember_selector("fill:Username".into(), "#user".into());
        writer.remember_selector("Username".into(), "#user".into());
        writer.flush().unwrap();
        let first = std::fs::read_to_string(&memory_path).unwrap();

        let mut reloaded = MemoryStore::new(Some(memory_path.clone()), None);
        reloaded.load().unwrap();
        reloaded.flush().unwrap();
        let second = std::fs::read_to_string(&memory_path).unwrap();

        assert_eq!(first, second);
    }
}
