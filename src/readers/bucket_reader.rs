use crate::error::{ProcessingError, Result};
use crate::models::{AggregationBucket, BucketRecord};
use std::path::Path;

/// Reads aggregated bucket files written by the `aggregate` command
pub struct BucketReader;

impl BucketReader {
    pub fn read(path: &Path) -> Result<Vec<AggregationBucket>> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(path)?;

        let mut buckets = Vec::new();
        for (index, row) in reader.deserialize::<BucketRecord>().enumerate() {
            let record = row?;
            let bucket = AggregationBucket::try_from(record).map_err(|e| {
                ProcessingError::InvalidFormat(format!(
                    "{} row {}: {}",
                    path.display(),
                    index + 2,
                    e
                ))
            })?;
            buckets.push(bucket);
        }
        Ok(buckets)
    }
}
