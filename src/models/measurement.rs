use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Column order of raw measurement files
pub const MEASUREMENT_HEADER: [&str; 9] = [
    "sensor_id",
    "location_id",
    "latitude",
    "longitude",
    "timestamp",
    "parameter",
    "value",
    "unit",
    "quality_flag",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityFlag {
    #[default]
    Valid,
    /// Flagged by the provider but kept
    Suspect,
    Invalid,
}

impl QualityFlag {
    pub fn is_usable(&self) -> bool {
        matches!(self, QualityFlag::Valid | QualityFlag::Suspect)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Measurement {
    pub sensor_id: u64,
    pub location_id: u64,

    #[validate(range(min = -90.0, max = 90.0))]
    pub latitude: f64,

    #[validate(range(min = -180.0, max = 180.0))]
    pub longitude: f64,

    pub timestamp: DateTime<Utc>,

    #[validate(length(min = 1))]
    pub parameter: String,

    pub value: f64,
    pub unit: String,

    #[serde(default)]
    pub quality_flag: QualityFlag,
}

impl Measurement {
    /// Whether this row may contribute to an aggregation bucket
    pub fn is_usable(&self) -> bool {
        self.value.is_finite()
            && self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.quality_flag.is_usable()
            && self.validate().is_ok()
    }

    /// Identity used by the de-duplication pass
    pub fn dedup_key(&self) -> (u64, i64, String) {
        (
            self.sensor_id,
            self.timestamp.timestamp(),
            self.parameter.clone(),
        )
    }
}
