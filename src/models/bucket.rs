use chrono::{DateTime, Utc};
use h3o::{CellIndex, LatLng};
use serde::{Deserialize, Serialize};

use crate::error::{ProcessingError, Result};

/// Summary statistics of one (cell, hour, parameter) group
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketStats {
    pub mean: f64,
    /// Sample standard deviation; 0.0 for a single contributor
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub count: u64,
}

/// Running count/sum/sum-of-squares/min/max
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsAccumulator {
    count: u64,
    sum: f64,
    sum_sq: f64,
    min: f64,
    max: f64,
}

impl Default for StatsAccumulator {
    fn default() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            sum_sq: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl StatsAccumulator {
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.sum_sq += value * value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn merge(&mut self, other: &StatsAccumulator) {
        self.count += other.count;
        self.sum += other.sum;
        self.sum_sq += other.sum_sq;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// None when nothing was pushed: empty groups never become buckets
    pub fn finish(&self) -> Option<BucketStats> {
        if self.count == 0 {
            return None;
        }

        let n = self.count as f64;
        let mean = self.sum / n;
        let std = if self.count == 1 {
            0.0
        } else {
            let variance = (self.sum_sq - n * mean * mean) / (n - 1.0);
            variance.max(0.0).sqrt()
        };

        Some(BucketStats {
            mean,
            std,
            min: self.min,
            max: self.max,
            count: self.count,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregationBucket {
    pub cell: CellIndex,
    pub hour: DateTime<Utc>,
    pub parameter: String,
    pub stats: BucketStats,
}

impl AggregationBucket {
    pub fn resolution(&self) -> u8 {
        u8::from(self.cell.resolution())
    }
}

/// Flat CSV row of an aggregated bucket file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketRecord {
    pub h3_cell: String,
    pub resolution: u8,
    pub h3_lat: f64,
    pub h3_lon: f64,
    pub hour: DateTime<Utc>,
    pub parameter: String,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub count: u64,
}

pub const BUCKET_HEADER: [&str; 11] = [
    "h3_cell",
    "resolution",
    "h3_lat",
    "h3_lon",
    "hour",
    "parameter",
    "mean",
    "std",
    "min",
    "max",
    "count",
];

impl From<&AggregationBucket> for BucketRecord {
    fn from(bucket: &AggregationBucket) -> Self {
        let center = LatLng::from(bucket.cell);
        Self {
            h3_cell: bucket.cell.to_string(),
            resolution: bucket.resolution(),
            h3_lat: center.lat(),
            h3_lon: center.lng(),
            hour: bucket.hour,
            parameter: bucket.parameter.clone(),
            mean: bucket.stats.mean,
            std: bucket.stats.std,
            min: bucket.stats.min,
            max: bucket.stats.max,
            count: bucket.stats.count,
        }
    }
}

impl TryFrom<BucketRecord> for AggregationBucket {
    type Error = ProcessingError;

    fn try_from(record: BucketRecord) -> Result<Self> {
        let cell: CellIndex = record.h3_cell.parse()?;
        let actual = u8::from(cell.resolution());
        if actual != record.resolution {
            return Err(ProcessingError::InvalidFormat(format!(
                "Cell {} is resolution {}, row claims {}",
                record.h3_cell, actual, record.resolution
            )));
        }
        if record.count == 0 {
            return Err(ProcessingError::InvalidFormat(format!(
                "Bucket {} @ {} has zero count",
                record.h3_cell, record.hour
            )));
        }

        Ok(Self {
            cell,
            hour: record.hour,
            parameter: record.parameter,
            stats: BucketStats {
                mean: record.mean,
                std: record.std,
                min: record.min,
                max: record.max,
                count: record.count,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_value_has_zero_std() {
        let mut acc = StatsAccumulator::default();
        acc.push(5.0);
        let stats = acc.finish().unwrap();
        assert_eq!(stats.mean, 5.0);
        assert_eq!(stats.std, 0.0);
        assert_eq!(stats.count, 1);
    }

    #[test]
    fn test_sample_std() {
        let mut acc = StatsAccumulator::default();
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            acc.push(v);
        }
        let stats = acc.finish().unwrap();
        assert!((stats.mean - 5.0).abs() < 1e-12);
        // sample variance = 32 / 7
        assert!((stats.std - (32.0f64 / 7.0).sqrt()).abs() < 1e-9);
        assert_eq!(stats.min, 2.0);
        assert_eq!(stats.max, 9.0);
    }

    #[test]
    fn test_empty_accumulator_yields_nothing() {
        assert!(StatsAccumulator::default().finish().is_none());
    }

    #[test]
    fn test_merge_matches_single_pass() {
        let mut left = StatsAccumulator::default();
        let mut right = StatsAccumulator::default();
        let mut all = StatsAccumulator::default();
        for (i, v) in [1.5, 3.0, 8.25, -2.0, 0.5].iter().enumerate() {
            if i % 2 == 0 {
                left.push(*v);
            } else {
                right.push(*v);
            }
            all.push(*v);
        }
        left.merge(&right);
        assert_eq!(left.finish(), all.finish());
    }

    #[test]
    fn test_identical_values_do_not_go_negative() {
        let mut acc = StatsAccumulator::default();
        for _ in 0..1000 {
            acc.push(0.1);
        }
        let stats = acc.finish().unwrap();
        assert!(stats.std >= 0.0);
        assert!(stats.std < 1e-6);
    }
}
