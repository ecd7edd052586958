use std::path::PathBuf;
use std::time::Duration;

use crate::models::{UnitOutcome, UnitState};
use crate::processors::DedupReport;

/// End-of-run report of a download
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub run_key: String,
    pub output_file: PathBuf,
    pub strategy: String,
    pub locations_total: usize,
    /// Already complete in the checkpoint before this run
    pub locations_skipped: usize,
    pub locations_completed: usize,
    pub locations_failed: usize,
    /// Locations whose sensor listing failed, with the reason
    pub sensor_errors: Vec<(u64, String)>,
    pub outcomes: Vec<UnitOutcome>,
    pub interrupted: bool,
    pub key_usage: Vec<(String, u64)>,
    pub dedup: Option<DedupReport>,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn completed_units(&self) -> usize {
        self.count(|s| matches!(s, UnitState::Complete))
    }

    pub fn truncated_units(&self) -> usize {
        self.count(|s| matches!(s, UnitState::Truncated { .. }))
    }

    pub fn failed_units(&self) -> usize {
        self.count(|s| matches!(s, UnitState::Failed { .. }))
    }

    pub fn measurements_written(&self) -> u64 {
        self.outcomes.iter().map(|o| o.measurements_written).sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = &UnitOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.state, UnitState::Failed { .. }))
    }

    /// 0 when everything finished, 1 when any location was left pending,
    /// 2 when interrupted
    pub fn exit_code(&self) -> u8 {
        if self.interrupted {
            2
        } else if self.failed_units() > 0 || self.locations_failed > 0 {
            1
        } else {
            0
        }
    }

    pub fn summary(&self) -> String {
        let mut out = format!(
            "Download Summary ({}):\n\
            - Output: {}\n\
            - Strategy: {}\n\
            - Locations: {} total, {} resumed from checkpoint, {} completed, {} left pending\n\
            - Units: {} complete, {} truncated, {} failed\n\
            - Measurements written: {}\n\
            - Elapsed: {:.1}s",
            self.run_key,
            self.output_file.display(),
            self.strategy,
            self.locations_total,
            self.locations_skipped,
            self.locations_completed,
            self.locations_failed,
            self.completed_units(),
            self.truncated_units(),
            self.failed_units(),
            self.measurements_written(),
            self.elapsed.as_secs_f64(),
        );

        if !self.key_usage.is_empty() {
            let usage: Vec<String> = self
                .key_usage
                .iter()
                .map(|(key, n)| format!("{}={}", key, n))
                .collect();
            out.push_str(&format!("\n- Requests per key: {}", usage.join(", ")));
        }

        if let Some(dedup) = &self.dedup {
            out.push_str(&format!(
                "\n- De-duplication: {} rows kept, {} duplicates removed",
                dedup.rows_kept, dedup.duplicates_removed
            ));
        }

        for outcome in self.failures() {
            if let UnitState::Failed { error } = &outcome.state {
                out.push_str(&format!("\n  ✗ {}: {}", outcome.unit, error));
            }
        }

        for (location_id, error) in &self.sensor_errors {
            out.push_str(&format!("\n  ✗ location {} sensor listing: {}", location_id, error));
        }

        if self.interrupted {
            out.push_str("\n  Interrupted: re-run the same command to resume");
        } else if self.exit_code() == 1 {
            out.push_str("\n  Some locations failed: re-run the same command to retry them");
        }

        out
    }

    fn count(&self, predicate: impl Fn(&UnitState) -> bool) -> usize {
        self.outcomes.iter().filter(|o| predicate(&o.state)).count()
    }
}
