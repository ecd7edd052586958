use crate::error::Result;
use crate::models::Measurement;
use crate::utils::constants::{DEFAULT_BUFFER_SIZE, DEFAULT_CHUNK_SIZE};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadStats {
    pub rows_read: u64,
    pub rows_malformed: u64,
}

/// Streaming reader for raw measurement CSV files
pub struct MeasurementReader {
    chunk_size: usize,
}

impl MeasurementReader {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    /// Hand the file to `visit` in chunks of at most `chunk_size` rows.
    /// Rows that fail to parse are counted and skipped.
    pub fn for_each_chunk<F>(&self, path: &Path, mut visit: F) -> Result<ReadStats>
    where
        F: FnMut(&[Measurement]) -> Result<()>,
    {
        let file = File::open(path)?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(BufReader::with_capacity(DEFAULT_BUFFER_SIZE, file));

        let mut stats = ReadStats::default();
        let mut chunk = Vec::with_capacity(self.chunk_size);

        for (index, row) in reader.deserialize::<Measurement>().enumerate() {
            match row {
                Ok(measurement) => {
                    stats.rows_read += 1;
                    chunk.push(measurement);
                    if chunk.len() >= self.chunk_size {
                        visit(&chunk)?;
                        chunk.clear();
                    }
                }
                Err(e) => {
                    stats.rows_malformed += 1;
                    debug!(path = %path.display(), row = index + 2, error = %e, "Skipping malformed row");
                }
            }
        }

        if !chunk.is_empty() {
            visit(&chunk)?;
        }

        if stats.rows_malformed > 0 {
            warn!(
                path = %path.display(),
                malformed = stats.rows_malformed,
                "Skipped malformed measurement rows"
            );
        }
        Ok(stats)
    }

    pub fn read_all(&self, path: &Path) -> Result<Vec<Measurement>> {
        let mut all = Vec::new();
        self.for_each_chunk(path, |chunk| {
            all.extend_from_slice(chunk);
            Ok(())
        })?;
        Ok(all)
    }
}

impl Default for MeasurementReader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HEADER: &str = "sensor_id,location_id,latitude,longitude,timestamp,parameter,value,unit,quality_flag";

    #[test]
    fn test_chunked_read_skips_malformed() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "{}", HEADER)?;
        for i in 0..5 {
            writeln!(
                file,
                "1,10,35.0,139.0,2024-01-01T0{}:00:00Z,pm25,{}.0,µg/m³,valid",
                i, i
            )?;
        }
        writeln!(file, "1,10,35.0,139.0,not-a-time,pm25,1.0,µg/m³,valid")?;
        writeln!(file, "2,10,35.0,139.0,2024-01-01T00:00:00Z,no2,3.5,ppm,suspect")?;
        file.flush()?;

        let reader = MeasurementReader::with_chunk_size(2);
        let mut chunk_sizes = Vec::new();
        let stats = reader.for_each_chunk(file.path(), |chunk| {
            chunk_sizes.push(chunk.len());
            Ok(())
        })?;

        assert_eq!(stats.rows_read, 6);
        assert_eq!(stats.rows_malformed, 1);
        assert_eq!(chunk_sizes, vec![2, 2, 2]);
        Ok(())
    }
}
