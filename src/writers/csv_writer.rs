use csv::{Writer, WriterBuilder};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{ProcessingError, Result};

/// Append-only CSV file with a header written exactly once.
///
/// Each call stages its whole batch in memory and writes it to the file only
/// once every row has serialized, then syncs. A caller that has seen `Ok` may
/// treat the rows as durable; a failed batch leaves nothing behind.
pub struct IncrementalCsvWriter {
    path: PathBuf,
    file: File,
    rows_written: u64,
}

impl IncrementalCsvWriter {
    /// Open for appending; a new or empty file gets `header`, an existing one
    /// must already start with it.
    pub fn open(path: &Path, header: &[&str]) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let existing_len = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        if existing_len > 0 {
            verify_header(path, header)?;
            repair_trailing_newline(path)?;
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;

        if existing_len == 0 {
            let mut staged = stage();
            staged.write_record(header)?;
            file.write_all(&into_bytes(staged)?)?;
            file.sync_data()?;
            debug!(path = %path.display(), "Created output file with header");
        } else {
            debug!(path = %path.display(), bytes = existing_len, "Reopened output file for append");
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
            rows_written: 0,
        })
    }

    /// Truncate and start over with `header`
    pub fn create(path: &Path, header: &[&str]) -> Result<Self> {
        if path.exists() {
            fs::remove_file(path)?;
        }
        Self::open(path, header)
    }

    pub fn append<S: Serialize>(&mut self, rows: &[S]) -> Result<usize> {
        let mut staged = stage();
        for row in rows {
            staged.serialize(row)?;
        }
        self.commit(staged, rows.len())
    }

    pub fn append_records<I, F>(&mut self, rows: &[I]) -> Result<usize>
    where
        I: AsRef<[F]>,
        F: AsRef<[u8]>,
    {
        let mut staged = stage();
        for row in rows {
            staged.write_record(row.as_ref())?;
        }
        self.commit(staged, rows.len())
    }

    /// Rows appended through this handle
    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    fn commit(&mut self, staged: Writer<Vec<u8>>, count: usize) -> Result<usize> {
        self.file.write_all(&into_bytes(staged)?)?;
        self.file.sync_data()?;
        self.rows_written += count as u64;
        debug!(path = %self.path.display(), rows = count, total = self.rows_written, "Appended rows");
        Ok(count)
    }
}

fn stage() -> Writer<Vec<u8>> {
    WriterBuilder::new().has_headers(false).from_writer(Vec::new())
}

fn into_bytes(staged: Writer<Vec<u8>>) -> Result<Vec<u8>> {
    staged
        .into_inner()
        .map_err(|e| ProcessingError::Io(e.into_error()))
}

/// First record of `path` as owned strings
pub fn read_header(path: &Path) -> Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;

    match reader.records().next() {
        Some(record) => Ok(record?.iter().map(|f| f.to_string()).collect()),
        None => Ok(Vec::new()),
    }
}

fn verify_header(path: &Path, expected: &[&str]) -> Result<()> {
    let found = read_header(path)?;
    if found.iter().map(String::as_str).eq(expected.iter().copied()) {
        return Ok(());
    }

    Err(ProcessingError::HeaderMismatch {
        path: path.to_path_buf(),
        expected: expected.iter().map(|s| s.to_string()).collect(),
        found,
    })
}

/// A crash mid-line leaves the file without a final newline; terminate the
/// torn row so the next append starts on its own line
fn repair_trailing_newline(path: &Path) -> Result<()> {
    let mut file = OpenOptions::new().read(true).append(true).open(path)?;
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;

    if last[0] != b'\n' {
        warn!(path = %path.display(), "Output file ends mid-line; terminating partial row");
        file.write_all(b"\n")?;
        file.sync_data()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde::Serialize;
    use tempfile::TempDir;

    #[derive(Serialize)]
    struct Row {
        id: u32,
        value: f64,
    }

    const HEADER: [&str; 2] = ["id", "value"];

    #[test]
    fn test_header_written_once_across_reopen() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("nested").join("out.csv");

        let mut writer = IncrementalCsvWriter::open(&path, &HEADER)?;
        writer.append(&[Row { id: 1, value: 1.5 }])?;
        drop(writer);

        let mut writer = IncrementalCsvWriter::open(&path, &HEADER)?;
        writer.append(&[Row { id: 2, value: 2.5 }, Row { id: 3, value: 3.5 }])?;
        assert_eq!(writer.rows_written(), 2);
        drop(writer);

        let content = fs::read_to_string(&path)?;
        assert_eq!(content, "id,value\n1,1.5\n2,2.5\n3,3.5\n");
        Ok(())
    }

    #[test]
    fn test_mismatched_header_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("out.csv");
        fs::write(&path, "station,temp\n1,2\n")?;

        match IncrementalCsvWriter::open(&path, &HEADER) {
            Err(ProcessingError::HeaderMismatch { found, .. }) => {
                assert_eq!(found, vec!["station", "temp"]);
            }
            other => panic!("expected header mismatch, got {:?}", other.err()),
        }
        Ok(())
    }

    #[test]
    fn test_torn_last_line_is_terminated() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("out.csv");
        fs::write(&path, "id,value\n1,1.5\n2,2.")?;

        let mut writer = IncrementalCsvWriter::open(&path, &HEADER)?;
        writer.append(&[Row { id: 3, value: 3.5 }])?;
        drop(writer);

        let content = fs::read_to_string(&path)?;
        assert_eq!(content, "id,value\n1,1.5\n2,2.\n3,3.5\n");
        Ok(())
    }

    #[test]
    fn test_empty_existing_file_gets_header() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("out.csv");
        File::create(&path)?;

        let mut writer = IncrementalCsvWriter::open(&path, &HEADER)?;
        writer.append_records(&[vec!["7", "0.1"]])?;
        drop(writer);

        assert_eq!(fs::read_to_string(&path)?, "id,value\n7,0.1\n");
        Ok(())
    }

    /// Serializes like `Row` unless `broken` is set
    struct MaybeBroken {
        id: u32,
        broken: bool,
    }

    impl Serialize for MaybeBroken {
        fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
            if self.broken {
                return Err(serde::ser::Error::custom("row cannot be serialized"));
            }
            Row {
                id: self.id,
                value: 0.5,
            }
            .serialize(serializer)
        }
    }

    #[test]
    fn test_failed_batch_leaves_no_rows_behind() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("out.csv");
        let mut writer = IncrementalCsvWriter::open(&path, &HEADER)?;

        let batch = [
            MaybeBroken { id: 1, broken: false },
            MaybeBroken { id: 2, broken: true },
        ];
        assert!(writer.append(&batch).is_err());
        assert_eq!(writer.rows_written(), 0);

        writer.append(&[Row { id: 3, value: 3.5 }])?;
        drop(writer);

        assert_eq!(fs::read_to_string(&path)?, "id,value\n3,3.5\n");
        Ok(())
    }
}
