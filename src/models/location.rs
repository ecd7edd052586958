use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    pub id: u64,
    pub parameter: String,
    #[serde(default)]
    pub unit: String,
}

impl Sensor {
    /// No filter keeps every sensor
    pub fn matches(&self, parameters: &[String]) -> bool {
        parameters.is_empty() || parameters.iter().any(|p| p.eq_ignore_ascii_case(&self.parameter))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Location {
    pub id: u64,

    #[validate(length(min = 1))]
    pub name: String,

    #[serde(default)]
    pub locality: Option<String>,

    #[serde(default)]
    pub country: Option<String>,

    #[validate(range(min = -90.0, max = 90.0))]
    pub latitude: f64,

    #[validate(range(min = -180.0, max = 180.0))]
    pub longitude: f64,

    #[serde(default)]
    pub sensors: Vec<Sensor>,
}

impl Location {
    pub fn new(id: u64, name: String, latitude: f64, longitude: f64) -> Self {
        Self {
            id,
            name,
            locality: None,
            country: None,
            latitude,
            longitude,
            sensors: Vec::new(),
        }
    }

    pub fn with_sensor(mut self, id: u64, parameter: &str, unit: &str) -> Self {
        self.sensors.push(Sensor {
            id,
            parameter: parameter.to_string(),
            unit: unit.to_string(),
        });
        self
    }

    /// Sensors whose parameter passes the filter (no filter keeps all)
    pub fn sensors_matching(&self, parameters: &[String]) -> Vec<Sensor> {
        self.sensors
            .iter()
            .filter(|s| s.matches(parameters))
            .cloned()
            .collect()
    }
}
