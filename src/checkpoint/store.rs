//! Durable resume anchors, one JSON file per run key.
//!
//! All mutation goes through `CheckpointStore`, which serialises updates
//! behind one lock and replaces files atomically (temp file + rename), so a
//! crash mid-save leaves either the previous or the new checkpoint on disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tempfile::NamedTempFile;
use tracing::{debug, error, warn};

use crate::checkpoint::history::{HistoryEvent, HistoryLog};
use crate::error::{ProcessingError, Result};
use crate::utils::constants::{CHECKPOINT_FILE_PREFIX, HISTORY_FILE};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_key: String,
    pub output_file: PathBuf,
    pub completed_locations: BTreeSet<u64>,
    /// Locations with at least one failed unit in the latest attempt
    #[serde(default)]
    pub failed_locations: BTreeSet<u64>,
    #[serde(default)]
    pub total_locations: usize,
    pub created_at: DateTime<Utc>,
    pub last_saved_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(run_key: &str, output_file: &Path, total_locations: usize) -> Self {
        let now = Utc::now();
        Self {
            run_key: run_key.to_string(),
            output_file: output_file.to_path_buf(),
            completed_locations: BTreeSet::new(),
            failed_locations: BTreeSet::new(),
            total_locations,
            created_at: now,
            last_saved_at: now,
        }
    }

    pub fn is_completed(&self, location_id: u64) -> bool {
        self.completed_locations.contains(&location_id)
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total_locations == 0 {
            return 0.0;
        }
        100.0 * self.completed_locations.len() as f64 / self.total_locations as f64
    }
}

pub struct CheckpointStore {
    dir: PathBuf,
    history: HistoryLog,
    cache: Mutex<HashMap<String, Checkpoint>>,
}

impl CheckpointStore {
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            history: HistoryLog::new(&dir.join(HISTORY_FILE)),
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn history(&self) -> &HistoryLog {
        &self.history
    }

    pub fn path_for(&self, run_key: &str) -> PathBuf {
        self.dir
            .join(format!("{}{}.json", CHECKPOINT_FILE_PREFIX, run_key))
    }

    /// Resume point for `run_key`, or None for a fresh run.
    ///
    /// An unreadable file is moved aside and the run starts fresh; a
    /// checkpoint whose output file is gone is ignored for the same reason.
    pub fn load(&self, run_key: &str) -> Result<Option<Checkpoint>> {
        let path = self.path_for(run_key);
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read(&path)?;
        let checkpoint = match serde_json::from_slice::<Checkpoint>(&content) {
            Ok(c) if c.run_key == run_key => c,
            Ok(c) => {
                error!(
                    path = %path.display(),
                    expected = run_key,
                    found = %c.run_key,
                    "Checkpoint belongs to a different run; starting fresh"
                );
                self.quarantine(&path)?;
                return Ok(None);
            }
            Err(e) => {
                error!(
                    path = %path.display(),
                    error = %e,
                    "Checkpoint is corrupt; starting fresh"
                );
                self.quarantine(&path)?;
                return Ok(None);
            }
        };

        if !checkpoint.output_file.exists() {
            error!(
                run_key,
                output = %checkpoint.output_file.display(),
                completed = checkpoint.completed_locations.len(),
                "Checkpoint output file is missing; discarding checkpoint"
            );
            return Ok(None);
        }

        debug!(
            run_key,
            completed = checkpoint.completed_locations.len(),
            "Loaded checkpoint"
        );
        self.lock().insert(run_key.to_string(), checkpoint.clone());
        Ok(Some(checkpoint))
    }

    /// Start tracking a fresh run and persist it immediately
    pub fn create(&self, run_key: &str, output_file: &Path, total_locations: usize) -> Result<Checkpoint> {
        let checkpoint = Checkpoint::new(run_key, output_file, total_locations);
        let mut cache = self.lock();
        self.persist(&checkpoint)?;
        cache.insert(run_key.to_string(), checkpoint.clone());
        Ok(checkpoint)
    }

    /// Mark a location done. Only call once its rows are flushed.
    pub fn record_completed(&self, run_key: &str, location_id: u64) -> Result<()> {
        self.update(run_key, |c| {
            c.failed_locations.remove(&location_id);
            c.completed_locations.insert(location_id)
        })
    }

    pub fn record_failed(&self, run_key: &str, location_id: u64) -> Result<()> {
        self.update(run_key, |c| {
            !c.completed_locations.contains(&location_id) && c.failed_locations.insert(location_id)
        })
    }

    pub fn set_total(&self, run_key: &str, total_locations: usize) -> Result<()> {
        self.update(run_key, |c| {
            let changed = c.total_locations != total_locations;
            c.total_locations = total_locations;
            changed
        })
    }

    /// Write `checkpoint` to disk; repeated saves of the same state are harmless
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut cache = self.lock();
        let mut saved = checkpoint.clone();
        saved.last_saved_at = Utc::now();
        self.persist(&saved)?;
        cache.insert(saved.run_key.clone(), saved);
        Ok(())
    }

    pub fn get(&self, run_key: &str) -> Option<Checkpoint> {
        self.lock().get(run_key).cloned()
    }

    /// All readable checkpoints in the directory, sorted by run key
    pub fn list_runs(&self) -> Result<Vec<Checkpoint>> {
        let mut runs = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_checkpoint = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(CHECKPOINT_FILE_PREFIX) && n.ends_with(".json"));
            if !is_checkpoint {
                continue;
            }

            match fs::read(&path).map(|bytes| serde_json::from_slice::<Checkpoint>(&bytes)) {
                Ok(Ok(checkpoint)) => runs.push(checkpoint),
                Ok(Err(e)) => warn!(path = %path.display(), error = %e, "Unreadable checkpoint"),
                Err(e) => warn!(path = %path.display(), error = %e, "Cannot read checkpoint"),
            }
        }
        runs.sort_by(|a, b| a.run_key.cmp(&b.run_key));
        Ok(runs)
    }

    /// Apply `change` to the cached checkpoint and persist when it reports a change
    fn update<F>(&self, run_key: &str, change: F) -> Result<()>
    where
        F: FnOnce(&mut Checkpoint) -> bool,
    {
        let mut cache = self.lock();
        let checkpoint = cache.get_mut(run_key).ok_or_else(|| {
            ProcessingError::CheckpointInvariant(format!(
                "No open checkpoint for run '{}'",
                run_key
            ))
        })?;

        if change(checkpoint) {
            checkpoint.last_saved_at = Utc::now();
            self.persist(checkpoint)?;
        }
        Ok(())
    }

    fn persist(&self, checkpoint: &Checkpoint) -> Result<()> {
        let path = self.path_for(&checkpoint.run_key);
        let bytes = serde_json::to_vec_pretty(checkpoint)?;

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;

        self.history.append(&HistoryEvent {
            run_key: checkpoint.run_key.clone(),
            output_file: checkpoint.output_file.clone(),
            completed: checkpoint.completed_locations.len(),
            total: checkpoint.total_locations,
            timestamp: checkpoint.last_saved_at,
        })?;
        Ok(())
    }

    fn quarantine(&self, path: &Path) -> Result<()> {
        let target = path.with_extension(format!(
            "json.corrupt-{}",
            Utc::now().format("%Y%m%d%H%M%S")
        ));
        fs::rename(path, &target)?;
        warn!(moved_to = %target.display(), "Kept unreadable checkpoint for inspection");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Checkpoint>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn setup() -> Result<(TempDir, CheckpointStore, PathBuf)> {
        let dir = TempDir::new()?;
        let store = CheckpointStore::new(&dir.path().join("checkpoints"))?;
        let output = dir.path().join("out.csv");
        fs::write(&output, "header\n")?;
        Ok((dir, store, output))
    }

    #[test]
    fn test_record_and_reload() -> Result<()> {
        let (_dir, store, output) = setup()?;
        store.create("run", &output, 3)?;
        store.record_completed("run", 20)?;
        store.record_completed("run", 10)?;

        let fresh = CheckpointStore::new(store.dir())?;
        let loaded = fresh.load("run")?.unwrap();
        assert_eq!(loaded.completed_locations.into_iter().collect::<Vec<_>>(), vec![10, 20]);
        assert_eq!(loaded.total_locations, 3);
        assert_eq!(loaded.output_file, output);
        Ok(())
    }

    #[test]
    fn test_save_is_idempotent() -> Result<()> {
        let (_dir, store, output) = setup()?;
        let mut checkpoint = store.create("run", &output, 1)?;
        checkpoint.completed_locations.insert(5);

        store.save(&checkpoint)?;
        store.save(&checkpoint)?;

        let loaded = CheckpointStore::new(store.dir())?.load("run")?.unwrap();
        assert_eq!(loaded.completed_locations.len(), 1);
        Ok(())
    }

    #[test]
    fn test_missing_checkpoint_is_fresh_run() -> Result<()> {
        let (_dir, store, _output) = setup()?;
        assert!(store.load("never-ran")?.is_none());
        Ok(())
    }

    #[test]
    fn test_corrupt_checkpoint_is_moved_aside() -> Result<()> {
        let (_dir, store, _output) = setup()?;
        let path = store.path_for("run");
        fs::write(&path, b"{\"run_key\": \"run\", \"completed_loc")?;

        assert!(store.load("run")?.is_none());
        assert!(!path.exists());

        let quarantined = fs::read_dir(store.dir())?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("corrupt"))
            .count();
        assert_eq!(quarantined, 1);
        Ok(())
    }

    #[test]
    fn test_checkpoint_without_output_discarded() -> Result<()> {
        let (_dir, store, output) = setup()?;
        store.create("run", &output, 1)?;
        store.record_completed("run", 1)?;
        fs::remove_file(&output)?;

        assert!(CheckpointStore::new(store.dir())?.load("run")?.is_none());
        Ok(())
    }

    #[test]
    fn test_record_without_open_checkpoint_fails() -> Result<()> {
        let (_dir, store, _output) = setup()?;
        assert!(matches!(
            store.record_completed("run", 1),
            Err(ProcessingError::CheckpointInvariant(_))
        ));
        Ok(())
    }

    #[test]
    fn test_failed_location_cleared_on_completion() -> Result<()> {
        let (_dir, store, output) = setup()?;
        store.create("run", &output, 2)?;
        store.record_failed("run", 7)?;
        assert!(store.get("run").unwrap().failed_locations.contains(&7));

        store.record_completed("run", 7)?;
        let checkpoint = store.get("run").unwrap();
        assert!(checkpoint.failed_locations.is_empty());
        assert!(checkpoint.is_completed(7));
        assert_eq!(checkpoint.progress_percent(), 50.0);
        Ok(())
    }

    #[test]
    fn test_history_and_listing() -> Result<()> {
        let (_dir, store, output) = setup()?;
        store.create("b-run", &output, 2)?;
        store.create("a-run", &output, 2)?;
        store.record_completed("a-run", 1)?;
        store.record_completed("a-run", 1)?;

        // create + one effective completion; the duplicate is a no-op
        assert_eq!(store.history().count_for("a-run")?, 2);

        let keys: Vec<String> = store.list_runs()?.into_iter().map(|c| c.run_key).collect();
        assert_eq!(keys, vec!["a-run", "b-run"]);
        Ok(())
    }
}
