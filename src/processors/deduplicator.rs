use crate::error::{ProcessingError, Result};
use crate::models::Measurement;
use crate::utils::constants::DEFAULT_BUFFER_SIZE;
use csv::{StringRecord, WriterBuilder};
use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupReport {
    pub rows_kept: u64,
    pub duplicates_removed: u64,
    pub rows_malformed: u64,
}

/// Drops raw measurement rows repeating an earlier (sensor, timestamp, parameter)
pub struct Deduplicator;

impl Deduplicator {
    pub fn new() -> Self {
        Self
    }

    /// Rewrite `path` without duplicates. The file is replaced atomically,
    /// so an interrupted pass leaves the original untouched.
    pub fn deduplicate_in_place(&self, path: &Path) -> Result<DedupReport> {
        self.deduplicate(path, path)
    }

    /// First occurrence wins; row order is kept
    pub fn deduplicate(&self, input: &Path, output: &Path) -> Result<DedupReport> {
        let file = File::open(input)?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(BufReader::with_capacity(DEFAULT_BUFFER_SIZE, file));
        let headers = reader.headers()?.clone();

        let dir = output
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir)?;

        let mut report = DedupReport::default();
        {
            let mut writer = WriterBuilder::new()
                .has_headers(false)
                .from_writer(tmp.as_file_mut());
            writer.write_record(&headers)?;

            let mut seen = HashSet::new();
            let mut record = StringRecord::new();
            while reader.read_record(&mut record)? {
                let measurement: Measurement = match record.deserialize(Some(&headers)) {
                    Ok(m) => m,
                    Err(e) => {
                        report.rows_malformed += 1;
                        warn!(
                            path = %input.display(),
                            line = record.position().map(|p| p.line()).unwrap_or_default(),
                            error = %e,
                            "Dropping malformed row"
                        );
                        continue;
                    }
                };

                if seen.insert(measurement.dedup_key()) {
                    writer.write_record(&record)?;
                    report.rows_kept += 1;
                } else {
                    report.duplicates_removed += 1;
                }
            }
            writer.flush()?;
        }

        tmp.as_file().sync_all()?;
        tmp.persist(output)
            .map_err(|e| ProcessingError::Io(e.error))?;

        info!(
            path = %output.display(),
            kept = report.rows_kept,
            removed = report.duplicates_removed,
            "De-duplicated measurements"
        );
        Ok(report)
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MEASUREMENT_HEADER;
    use std::fs;
    use tempfile::TempDir;

    fn raw_file(dir: &TempDir, rows: &[&str]) -> std::path::PathBuf {
        let path = dir.path().join("raw.csv");
        let mut content = MEASUREMENT_HEADER.join(",");
        content.push('\n');
        for row in rows {
            content.push_str(row);
            content.push('\n');
        }
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_duplicates_removed_in_place() {
        let dir = TempDir::new().unwrap();
        let path = raw_file(
            &dir,
            &[
                "1,10,35.0,139.0,2024-01-01T00:00:00Z,pm25,12.5,µg/m³,valid",
                "1,10,35.0,139.0,2024-01-01T01:00:00Z,pm25,13.0,µg/m³,valid",
                "1,10,35.0,139.0,2024-01-01T00:00:00Z,pm25,12.5,µg/m³,valid",
                "2,10,35.0,139.0,2024-01-01T00:00:00Z,pm25,9.0,µg/m³,valid",
            ],
        );

        let report = Deduplicator::new().deduplicate_in_place(&path).unwrap();
        assert_eq!(report.rows_kept, 3);
        assert_eq!(report.duplicates_removed, 1);

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], MEASUREMENT_HEADER.join(","));
        assert!(lines[3].starts_with("2,"));
    }

    #[test]
    fn test_second_pass_is_noop() {
        let dir = TempDir::new().unwrap();
        let path = raw_file(
            &dir,
            &[
                "1,10,35.0,139.0,2024-01-01T00:00:00Z,pm25,12.5,µg/m³,valid",
                "1,10,35.0,139.0,2024-01-01T00:00:00Z,pm25,12.5,µg/m³,valid",
            ],
        );

        let dedup = Deduplicator::new();
        dedup.deduplicate_in_place(&path).unwrap();
        let before = fs::read_to_string(&path).unwrap();
        let report = dedup.deduplicate_in_place(&path).unwrap();
        assert_eq!(report.duplicates_removed, 0);
        assert_eq!(fs::read_to_string(&path).unwrap(), before);
    }
}
