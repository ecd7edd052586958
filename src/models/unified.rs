use chrono::{DateTime, Utc};
use h3o::{CellIndex, LatLng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ProcessingError, Result};
use crate::models::BucketStats;
use crate::utils::time::TimeFeatures;

/// Gap-filling rule declared for one column group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum GapFill {
    #[default]
    LeaveMissing,
    /// Carry the last observed value forward for at most `max_hours`
    ForwardFill { max_hours: u32 },
    /// Mean of observed neighbours within `k` rings at the same hour
    NeighborMean { k: u32 },
}

impl fmt::Display for GapFill {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GapFill::LeaveMissing => write!(f, "none"),
            GapFill::ForwardFill { max_hours } => write!(f, "ffill:{}", max_hours),
            GapFill::NeighborMean { k } => write!(f, "neighbor:{}", k),
        }
    }
}

impl FromStr for GapFill {
    type Err = ProcessingError;

    /// Accepts `none`, `ffill[:hours]`, `neighbor[:k]`
    fn from_str(raw: &str) -> Result<Self> {
        let raw = raw.trim().to_lowercase();
        let (name, arg) = match raw.split_once(':') {
            Some((name, arg)) => (name.to_string(), Some(arg.to_string())),
            None => (raw.clone(), None),
        };

        let parse_arg = |default: u32| -> Result<u32> {
            match &arg {
                Some(a) => a.parse::<u32>().map_err(|_| {
                    ProcessingError::Config(format!("Invalid gap-fill argument in '{}'", raw))
                }),
                None => Ok(default),
            }
        };

        match name.as_str() {
            "none" | "missing" | "leave" => Ok(GapFill::LeaveMissing),
            "ffill" | "forward" => Ok(GapFill::ForwardFill {
                max_hours: parse_arg(crate::utils::constants::DEFAULT_FORWARD_FILL_HOURS)?,
            }),
            "neighbor" | "neighbour" => {
                let k = parse_arg(1)?;
                if k == 0 {
                    return Err(ProcessingError::Config(
                        "Neighbour fill needs k >= 1".to_string(),
                    ));
                }
                Ok(GapFill::NeighborMean { k })
            }
            _ => Err(ProcessingError::Config(format!(
                "Unknown gap-fill policy '{}'",
                raw
            ))),
        }
    }
}

/// Where a value in the unified table came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillSource {
    Observed,
    ForwardFill,
    NeighborMean,
}

impl FillSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            FillSource::Observed => "observed",
            FillSource::ForwardFill => "forward_fill",
            FillSource::NeighborMean => "neighbor_mean",
        }
    }
}

/// One (source, parameter) column group of the unified table
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ColumnGroup {
    pub source: String,
    pub parameter: String,
}

impl ColumnGroup {
    pub fn new(source: &str, parameter: &str) -> Self {
        Self {
            source: source.to_string(),
            parameter: parameter.to_string(),
        }
    }

    pub fn prefix(&self) -> String {
        crate::utils::sanitize(&format!("{}_{}", self.source, self.parameter))
    }

    pub fn column_names(&self) -> Vec<String> {
        let prefix = self.prefix();
        ["mean", "std", "min", "max", "count", "fill"]
            .iter()
            .map(|suffix| format!("{}_{}", prefix, suffix))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupValue {
    pub stats: BucketStats,
    pub fill: FillSource,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedRow {
    pub cell: CellIndex,
    pub hour: DateTime<Utc>,
    /// Aligned with `UnifiedTable::groups`
    pub values: Vec<Option<GroupValue>>,
}

#[derive(Debug, Clone)]
pub struct UnifiedTable {
    pub resolution: u8,
    pub groups: Vec<ColumnGroup>,
    /// Aligned with `groups`
    pub policies: Vec<GapFill>,
    pub rows: Vec<UnifiedRow>,
}

const KEY_COLUMNS: [&str; 4] = ["h3_cell", "h3_lat", "h3_lon", "hour"];
const TIME_COLUMNS: [&str; 5] = [
    "hour_of_day",
    "day_of_week",
    "month",
    "is_weekend",
    "is_daytime",
];

impl UnifiedTable {
    pub fn header(&self) -> Vec<String> {
        let mut header: Vec<String> = KEY_COLUMNS.iter().map(|c| c.to_string()).collect();
        header.extend(TIME_COLUMNS.iter().map(|c| c.to_string()));
        for group in &self.groups {
            header.extend(group.column_names());
        }
        header
    }

    /// Render one row as CSV fields; missing values are empty strings
    pub fn row_fields(&self, row: &UnifiedRow) -> Vec<String> {
        let center = LatLng::from(row.cell);
        let features = TimeFeatures::from_hour(row.hour);

        let mut fields = vec![
            row.cell.to_string(),
            format!("{:.6}", center.lat()),
            format!("{:.6}", center.lng()),
            row.hour.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            features.hour_of_day.to_string(),
            features.day_of_week.to_string(),
            features.month.to_string(),
            u8::from(features.is_weekend).to_string(),
            u8::from(features.is_daytime).to_string(),
        ];

        for value in &row.values {
            match value {
                Some(v) => {
                    fields.push(v.stats.mean.to_string());
                    fields.push(v.stats.std.to_string());
                    fields.push(v.stats.min.to_string());
                    fields.push(v.stats.max.to_string());
                    fields.push(v.stats.count.to_string());
                    fields.push(v.fill.as_str().to_string());
                }
                None => fields.extend(std::iter::repeat(String::new()).take(6)),
            }
        }

        fields
    }

    /// Count of observed and filled values per group
    pub fn coverage(&self) -> Vec<(ColumnGroup, usize, usize)> {
        self.groups
            .iter()
            .enumerate()
            .map(|(i, group)| {
                let mut observed = 0;
                let mut filled = 0;
                for row in &self.rows {
                    match row.values.get(i).copied().flatten() {
                        Some(GroupValue {
                            fill: FillSource::Observed,
                            ..
                        }) => observed += 1,
                        Some(_) => filled += 1,
                        None => {}
                    }
                }
                (group.clone(), observed, filled)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gap_fill() {
        assert_eq!("none".parse::<GapFill>().unwrap(), GapFill::LeaveMissing);
        assert_eq!(
            "ffill".parse::<GapFill>().unwrap(),
            GapFill::ForwardFill { max_hours: 3 }
        );
        assert_eq!(
            "ffill:6".parse::<GapFill>().unwrap(),
            GapFill::ForwardFill { max_hours: 6 }
        );
        assert_eq!(
            "Neighbor:2".parse::<GapFill>().unwrap(),
            GapFill::NeighborMean { k: 2 }
        );
        assert!("neighbor:0".parse::<GapFill>().is_err());
        assert!("interpolate".parse::<GapFill>().is_err());
        assert!("ffill:x".parse::<GapFill>().is_err());
    }

    #[test]
    fn test_gap_fill_display_round_trips() {
        for policy in [
            GapFill::LeaveMissing,
            GapFill::ForwardFill { max_hours: 3 },
            GapFill::NeighborMean { k: 1 },
        ] {
            assert_eq!(policy.to_string().parse::<GapFill>().unwrap(), policy);
        }
    }

    #[test]
    fn test_column_names() {
        let group = ColumnGroup::new("openaq", "pm2.5");
        let names = group.column_names();
        assert_eq!(names[0], "openaq_pm2_5_mean");
        assert_eq!(names[5], "openaq_pm2_5_fill");
    }
}
