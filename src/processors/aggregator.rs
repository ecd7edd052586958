use crate::error::{ProcessingError, Result};
use crate::models::{AggregationBucket, Measurement, StatsAccumulator};
use crate::readers::MeasurementReader;
use crate::spatial::HexIndexer;
use crate::utils::progress::ProgressReporter;
use crate::utils::time::floor_to_hour;
use chrono::{DateTime, Utc};
use h3o::CellIndex;
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info};

type BucketKey = (CellIndex, DateTime<Utc>, String);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregationReport {
    pub measurements_seen: u64,
    pub measurements_used: u64,
    /// Invalid flag, non-finite value or out-of-range coordinates
    pub measurements_skipped: u64,
    pub rows_malformed: u64,
    pub buckets: usize,
}

impl AggregationReport {
    fn merge(&mut self, other: &AggregationReport) {
        self.measurements_seen += other.measurements_seen;
        self.measurements_used += other.measurements_used;
        self.measurements_skipped += other.measurements_skipped;
        self.rows_malformed += other.rows_malformed;
    }

    pub fn summary(&self) -> String {
        format!(
            "Aggregation Summary:\n\
            - Measurements read: {}\n\
            - Used: {}\n\
            - Skipped (unusable): {}\n\
            - Malformed rows: {}\n\
            - Buckets: {}",
            self.measurements_seen,
            self.measurements_used,
            self.measurements_skipped,
            self.rows_malformed,
            self.buckets,
        )
    }
}

/// Streams measurements into (cell, hour, parameter) accumulators
pub struct HexHourAggregator {
    indexer: HexIndexer,
    groups: HashMap<BucketKey, StatsAccumulator>,
    report: AggregationReport,
}

impl HexHourAggregator {
    pub fn new(indexer: HexIndexer) -> Self {
        Self {
            indexer,
            groups: HashMap::new(),
            report: AggregationReport::default(),
        }
    }

    pub fn resolution(&self) -> u8 {
        self.indexer.resolution()
    }

    pub fn push(&mut self, measurement: &Measurement) {
        self.report.measurements_seen += 1;
        if !measurement.is_usable() {
            self.report.measurements_skipped += 1;
            return;
        }

        let cell = match self
            .indexer
            .cell_of(measurement.latitude, measurement.longitude)
        {
            Ok(cell) => cell,
            Err(e) => {
                debug!(sensor_id = measurement.sensor_id, error = %e, "No cell for measurement");
                self.report.measurements_skipped += 1;
                return;
            }
        };

        let key = (
            cell,
            floor_to_hour(measurement.timestamp),
            measurement.parameter.clone(),
        );
        self.groups.entry(key).or_default().push(measurement.value);
        self.report.measurements_used += 1;
    }

    pub fn push_all(&mut self, measurements: &[Measurement]) {
        for measurement in measurements {
            self.push(measurement);
        }
    }

    /// Fold another aggregator's partial groups into this one
    pub fn merge(&mut self, other: HexHourAggregator) -> Result<()> {
        if other.resolution() != self.resolution() {
            return Err(ProcessingError::Config(format!(
                "Cannot merge resolution {} aggregator into resolution {}",
                other.resolution(),
                self.resolution()
            )));
        }
        for (key, acc) in other.groups {
            self.groups.entry(key).or_default().merge(&acc);
        }
        self.report.merge(&other.report);
        Ok(())
    }

    /// Buckets sorted by cell, hour and parameter
    pub fn finish(self) -> (Vec<AggregationBucket>, AggregationReport) {
        let mut buckets: Vec<AggregationBucket> = self
            .groups
            .into_iter()
            .filter_map(|((cell, hour, parameter), acc)| {
                acc.finish().map(|stats| AggregationBucket {
                    cell,
                    hour,
                    parameter,
                    stats,
                })
            })
            .collect();

        buckets.sort_by(|a, b| {
            a.cell
                .cmp(&b.cell)
                .then_with(|| a.hour.cmp(&b.hour))
                .then_with(|| a.parameter.cmp(&b.parameter))
        });

        let mut report = self.report;
        report.buckets = buckets.len();
        (buckets, report)
    }
}

/// Aggregates several raw measurement files with one rayon task per file
pub struct FileAggregator {
    indexer: HexIndexer,
    max_workers: usize,
    chunk_size: usize,
}

impl FileAggregator {
    pub fn new(indexer: HexIndexer, max_workers: usize) -> Self {
        Self {
            indexer,
            max_workers: max_workers.max(1),
            chunk_size: crate::utils::constants::DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn aggregate_files(
        &self,
        paths: &[PathBuf],
        progress: Option<&ProgressReporter>,
    ) -> Result<(Vec<AggregationBucket>, AggregationReport)> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.max_workers)
            .build()
            .map_err(|e| ProcessingError::Config(e.to_string()))?;

        let partials: Result<Vec<HexHourAggregator>> = pool.install(|| {
            paths
                .par_iter()
                .map(|path| {
                    let mut aggregator = HexHourAggregator::new(self.indexer);
                    let reader = MeasurementReader::with_chunk_size(self.chunk_size);
                    let stats = reader.for_each_chunk(path, |chunk| {
                        aggregator.push_all(chunk);
                        Ok(())
                    })?;
                    aggregator.report.rows_malformed += stats.rows_malformed;

                    if let Some(p) = progress {
                        p.increment(1);
                    }
                    info!(
                        path = %path.display(),
                        rows = stats.rows_read,
                        groups = aggregator.groups.len(),
                        "Aggregated file"
                    );
                    Ok(aggregator)
                })
                .collect()
        });

        let mut combined = HexHourAggregator::new(self.indexer);
        for partial in partials? {
            combined.merge(partial)?;
        }
        Ok(combined.finish())
    }
}
