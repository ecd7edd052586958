use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::Result;

/// One checkpoint save, as recorded in the audit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub run_key: String,
    pub output_file: PathBuf,
    pub completed: usize,
    pub total: usize,
    pub timestamp: DateTime<Utc>,
}

/// Append-only JSON-lines log of checkpoint saves
#[derive(Debug, Clone)]
pub struct HistoryLog {
    path: PathBuf,
}

impl HistoryLog {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    /// A torn final line is terminated first so the new event gets its own line
    pub fn append(&self, event: &HistoryEvent) -> Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;

        if file.metadata()?.len() > 0 {
            file.seek(SeekFrom::End(-1))?;
            let mut last = [0u8; 1];
            file.read_exact(&mut last)?;
            if last[0] != b'\n' {
                warn!(path = %self.path.display(), "History log ends mid-line; terminating it");
                line.insert(0, '\n');
            }
        }

        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Every readable event; torn or foreign lines are skipped
    pub fn read_all(&self) -> Result<Vec<HistoryEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(&self.path)?);
        let mut events = Vec::new();
        let mut skipped = 0usize;

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryEvent>(&line) {
                Ok(event) => events.push(event),
                Err(_) => skipped += 1,
            }
        }

        if skipped > 0 {
            warn!(path = %self.path.display(), skipped, "Skipped unreadable history lines");
        }
        Ok(events)
    }

    pub fn count_for(&self, run_key: &str) -> Result<usize> {
        Ok(self
            .read_all()?
            .iter()
            .filter(|e| e.run_key == run_key)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn event(run_key: &str, completed: usize) -> HistoryEvent {
        HistoryEvent {
            run_key: run_key.to_string(),
            output_file: PathBuf::from("data/raw/out.csv"),
            completed,
            total: 10,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_append_and_count() -> Result<()> {
        let dir = TempDir::new()?;
        let log = HistoryLog::new(&dir.path().join("history.jsonl"));

        log.append(&event("a", 1))?;
        log.append(&event("b", 1))?;
        log.append(&event("a", 2))?;

        assert_eq!(log.read_all()?.len(), 3);
        assert_eq!(log.count_for("a")?, 2);
        assert_eq!(log.count_for("missing")?, 0);
        Ok(())
    }

    #[test]
    fn test_torn_line_skipped() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("history.jsonl");
        let log = HistoryLog::new(&path);

        log.append(&event("a", 1))?;
        let mut file = OpenOptions::new().append(true).open(&path)?;
        file.write_all(b"{\"run_key\": \"a\", \"compl")?;
        drop(file);

        let events = log.read_all()?;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].completed, 1);
        Ok(())
    }

    #[test]
    fn test_append_after_torn_line_keeps_new_event() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("history.jsonl");
        let log = HistoryLog::new(&path);

        log.append(&event("a", 1))?;
        let mut file = OpenOptions::new().append(true).open(&path)?;
        file.write_all(b"{\"run_key\": \"a\", \"compl")?;
        drop(file);

        log.append(&event("a", 2))?;
        log.append(&event("b", 1))?;

        let completed: Vec<usize> = log.read_all()?.iter().map(|e| e.completed).collect();
        assert_eq!(completed, vec![1, 2, 1]);
        assert_eq!(log.count_for("a")?, 2);
        Ok(())
    }
}
