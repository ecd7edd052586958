use crate::error::{ProcessingError, Result};
use crate::models::{
    AggregationBucket, BucketStats, ColumnGroup, FillSource, GapFill, GroupValue, UnifiedRow,
    UnifiedTable,
};
use crate::processors::gap_fill::{forward_fill, neighbor_mean, CellHour, GapFillPlan};
use crate::spatial::HexIndexer;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::info;

/// Outer-joins aggregated buckets of several sources on (cell, hour)
pub struct UnifiedBuilder {
    plan: GapFillPlan,
    resolution: Option<u8>,
}

impl UnifiedBuilder {
    pub fn new(plan: GapFillPlan) -> Self {
        Self {
            plan,
            resolution: None,
        }
    }

    /// Require every bucket to be at `resolution` instead of inferring it
    pub fn with_resolution(mut self, resolution: u8) -> Self {
        self.resolution = Some(resolution);
        self
    }

    pub fn build(&self, sources: &BTreeMap<String, Vec<AggregationBucket>>) -> Result<UnifiedTable> {
        let resolution = self.check_resolution(sources)?;
        let indexer = HexIndexer::new(resolution)?;

        // One column group per (source, parameter)
        let mut observed: BTreeMap<ColumnGroup, HashMap<CellHour, BucketStats>> = BTreeMap::new();
        for (source, buckets) in sources {
            for bucket in buckets {
                observed
                    .entry(ColumnGroup::new(source, &bucket.parameter))
                    .or_default()
                    .insert((bucket.cell, bucket.hour), bucket.stats);
            }
        }

        let groups: Vec<ColumnGroup> = observed.keys().cloned().collect();
        self.plan.check_overrides(&groups)?;
        let policies: Vec<GapFill> = groups.iter().map(|g| self.plan.policy_for(g)).collect();

        let mut filled: Vec<HashMap<CellHour, (BucketStats, FillSource)>> = Vec::new();
        for (group, policy) in groups.iter().zip(&policies) {
            info!(group = %group.prefix(), policy = %policy, "Gap-fill policy");
            let values = &observed[group];
            let fills = match policy {
                GapFill::LeaveMissing => HashMap::new(),
                GapFill::ForwardFill { max_hours } => {
                    tag(forward_fill(values, *max_hours), FillSource::ForwardFill)
                }
                GapFill::NeighborMean { k } => {
                    tag(neighbor_mean(values, &indexer, *k), FillSource::NeighborMean)
                }
            };
            filled.push(fills);
        }

        let mut keys: BTreeSet<CellHour> = BTreeSet::new();
        for values in observed.values() {
            keys.extend(values.keys().copied());
        }
        for fills in &filled {
            keys.extend(fills.keys().copied());
        }

        let rows = keys
            .into_iter()
            .map(|key| {
                let values = groups
                    .iter()
                    .zip(&filled)
                    .map(|(group, fills)| {
                        if let Some(stats) = observed[group].get(&key) {
                            return Some(GroupValue {
                                stats: *stats,
                                fill: FillSource::Observed,
                            });
                        }
                        fills.get(&key).map(|(stats, fill)| GroupValue {
                            stats: *stats,
                            fill: *fill,
                        })
                    })
                    .collect();
                UnifiedRow {
                    cell: key.0,
                    hour: key.1,
                    values,
                }
            })
            .collect();

        Ok(UnifiedTable {
            resolution,
            groups,
            policies,
            rows,
        })
    }

    fn check_resolution(&self, sources: &BTreeMap<String, Vec<AggregationBucket>>) -> Result<u8> {
        let mut expected = self.resolution;
        for (source, buckets) in sources {
            for bucket in buckets {
                let found = bucket.resolution();
                match expected {
                    None => expected = Some(found),
                    Some(r) if r != found => {
                        return Err(ProcessingError::ResolutionMismatch {
                            source_name: source.clone(),
                            expected: r,
                            found,
                        })
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(expected.unwrap_or(crate::utils::constants::DEFAULT_H3_RESOLUTION))
    }
}

fn tag(
    values: HashMap<CellHour, BucketStats>,
    fill: FillSource,
) -> HashMap<CellHour, (BucketStats, FillSource)> {
    values.into_iter().map(|(k, v)| (k, (v, fill))).collect()
}
