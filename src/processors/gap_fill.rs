use crate::error::{ProcessingError, Result};
use crate::models::{BucketStats, ColumnGroup, GapFill};
use crate::spatial::HexIndexer;
use chrono::{DateTime, Duration, Utc};
use h3o::CellIndex;
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub type CellHour = (CellIndex, DateTime<Utc>);

/// Gap-fill policy per column group: a default plus explicit overrides.
///
/// Override keys are either a source name (`openaq`) or a
/// `source:parameter` pair (`openaq:pm25`); the pair wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GapFillPlan {
    pub default: GapFill,
    pub overrides: BTreeMap<String, GapFill>,
}

impl GapFillPlan {
    pub fn new(default: GapFill) -> Self {
        Self {
            default,
            overrides: BTreeMap::new(),
        }
    }

    pub fn with_override(mut self, key: &str, policy: GapFill) -> Self {
        self.overrides.insert(key.trim().to_string(), policy);
        self
    }

    /// Parse a `key=policy` command-line pair
    pub fn parse_override(raw: &str) -> Result<(String, GapFill)> {
        let (key, policy) = raw.split_once('=').ok_or_else(|| {
            ProcessingError::Config(format!(
                "Expected SOURCE[:PARAMETER]=POLICY, got '{}'",
                raw
            ))
        })?;
        Ok((key.trim().to_string(), policy.parse()?))
    }

    pub fn policy_for(&self, group: &ColumnGroup) -> GapFill {
        let pair = format!("{}:{}", group.source, group.parameter);
        self.overrides
            .get(&pair)
            .or_else(|| self.overrides.get(&group.source))
            .copied()
            .unwrap_or(self.default)
    }

    /// Reject overrides that name no column group
    pub fn check_overrides(&self, groups: &[ColumnGroup]) -> Result<()> {
        for key in self.overrides.keys() {
            let matched = groups.iter().any(|g| {
                *key == g.source || *key == format!("{}:{}", g.source, g.parameter)
            });
            if !matched {
                return Err(ProcessingError::Config(format!(
                    "Gap-fill override '{}' matches no source or parameter",
                    key
                )));
            }
        }
        Ok(())
    }
}

/// Carry each observation forward into the following `max_hours` hours of
/// the same cell, stopping at the next observation.
pub fn forward_fill(
    observed: &HashMap<CellHour, BucketStats>,
    max_hours: u32,
) -> HashMap<CellHour, BucketStats> {
    let mut by_cell: BTreeMap<CellIndex, BTreeSet<DateTime<Utc>>> = BTreeMap::new();
    for (cell, hour) in observed.keys() {
        by_cell.entry(*cell).or_default().insert(*hour);
    }

    let mut filled = HashMap::new();
    for (cell, hours) in by_cell {
        let hours: Vec<DateTime<Utc>> = hours.into_iter().collect();
        for (i, hour) in hours.iter().enumerate() {
            let next = hours.get(i + 1);
            let Some(stats) = observed.get(&(cell, *hour)) else {
                continue;
            };
            for step in 1..=i64::from(max_hours) {
                let target = *hour + Duration::hours(step);
                if next.is_some_and(|n| *n <= target) {
                    break;
                }
                filled.insert((cell, target), *stats);
            }
        }
    }
    filled
}

/// Fill unobserved cells from observed cells within `k` rings at the same hour
pub fn neighbor_mean(
    observed: &HashMap<CellHour, BucketStats>,
    indexer: &HexIndexer,
    k: u32,
) -> HashMap<CellHour, BucketStats> {
    let mut by_hour: BTreeMap<DateTime<Utc>, BTreeSet<CellIndex>> = BTreeMap::new();
    for (cell, hour) in observed.keys() {
        by_hour.entry(*hour).or_default().insert(*cell);
    }

    let mut filled = HashMap::new();
    for (hour, cells) in by_hour {
        let mut candidates = BTreeSet::new();
        for cell in &cells {
            candidates.extend(
                indexer
                    .neighbors(*cell, k)
                    .into_iter()
                    .filter(|c| !cells.contains(c)),
            );
        }

        for candidate in candidates {
            let sources: Vec<BucketStats> = indexer
                .neighbors(candidate, k)
                .into_iter()
                .filter_map(|c| observed.get(&(c, hour)).copied())
                .collect();
            if let Some(stats) = combine(&sources) {
                filled.insert((candidate, hour), stats);
            }
        }
    }
    filled
}

/// Mean of means and stds, extremes of min/max, summed counts
fn combine(parts: &[BucketStats]) -> Option<BucketStats> {
    if parts.is_empty() {
        return None;
    }
    let n = parts.len() as f64;
    Some(BucketStats {
        mean: parts.iter().map(|s| s.mean).sum::<f64>() / n,
        std: parts.iter().map(|s| s.std).sum::<f64>() / n,
        min: parts.iter().map(|s| s.min).fold(f64::INFINITY, f64::min),
        max: parts.iter().map(|s| s.max).fold(f64::NEG_INFINITY, f64::max),
        count: parts.iter().map(|s| s.count).sum(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn stats(mean: f64) -> BucketStats {
        BucketStats {
            mean,
            std: 1.0,
            min: mean - 1.0,
            max: mean + 1.0,
            count: 2,
        }
    }

    fn hour(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, 0, 0).unwrap()
    }

    #[test]
    fn test_policy_lookup_prefers_pair() {
        let plan = GapFillPlan::new(GapFill::LeaveMissing)
            .with_override("openaq", GapFill::ForwardFill { max_hours: 3 })
            .with_override("openaq:no2", GapFill::NeighborMean { k: 1 });

        assert_eq!(
            plan.policy_for(&ColumnGroup::new("openaq", "pm25")),
            GapFill::ForwardFill { max_hours: 3 }
        );
        assert_eq!(
            plan.policy_for(&ColumnGroup::new("openaq", "no2")),
            GapFill::NeighborMean { k: 1 }
        );
        assert_eq!(
            plan.policy_for(&ColumnGroup::new("weather", "temperature")),
            GapFill::LeaveMissing
        );
    }

    #[test]
    fn test_unknown_override_rejected() {
        let plan = GapFillPlan::new(GapFill::LeaveMissing)
            .with_override("opneaq", GapFill::ForwardFill { max_hours: 3 });
        assert!(plan
            .check_overrides(&[ColumnGroup::new("openaq", "pm25")])
            .is_err());
    }

    #[test]
    fn test_parse_override() {
        let (key, policy) = GapFillPlan::parse_override("openaq:pm25=ffill:2").unwrap();
        assert_eq!(key, "openaq:pm25");
        assert_eq!(policy, GapFill::ForwardFill { max_hours: 2 });
        assert!(GapFillPlan::parse_override("openaq").is_err());
    }

    #[test]
    fn test_forward_fill_is_bounded() {
        let cell = HexIndexer::new(8).unwrap().cell_of(35.0, 139.0).unwrap();
        let mut observed = HashMap::new();
        observed.insert((cell, hour(0)), stats(10.0));
        observed.insert((cell, hour(2)), stats(20.0));

        let filled = forward_fill(&observed, 3);
        // hour 1 from hour 0, hours 3..=5 from hour 2
        assert_eq!(filled.len(), 4);
        assert_eq!(filled[&(cell, hour(1))].mean, 10.0);
        assert_eq!(filled[&(cell, hour(5))].mean, 20.0);
        assert!(!filled.contains_key(&(cell, hour(6))));
        assert!(!filled.contains_key(&(cell, hour(2))));
    }

    #[test]
    fn test_neighbor_mean_fills_ring() {
        let indexer = HexIndexer::new(8).unwrap();
        let center = indexer.cell_of(35.0, 139.0).unwrap();
        let ring: Vec<CellIndex> = indexer.neighbors(center, 1).into_iter().collect();

        let mut observed = HashMap::new();
        observed.insert((ring[0], hour(10)), stats(10.0));
        observed.insert((ring[3], hour(10)), stats(30.0));

        let filled = neighbor_mean(&observed, &indexer, 1);
        let value = filled[&(center, hour(10))];
        assert_eq!(value.mean, 20.0);
        assert_eq!(value.min, 9.0);
        assert_eq!(value.max, 31.0);
        assert_eq!(value.count, 4);

        // observed cells are never overwritten
        assert!(!filled.contains_key(&(ring[0], hour(10))));
        // other hours stay empty
        assert!(filled.keys().all(|(_, h)| *h == hour(10)));
    }
}
