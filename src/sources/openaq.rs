//! OpenAQ v3 REST adapter.
//!
//! Only the three endpoints the pipeline needs are wrapped. Each call is one
//! HTTP request under a `Permit` from the rate gate; retries and backoff
//! belong to the caller, which gets a classified `SourceError`.

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::download::rate_gate::Permit;
use crate::error::{ProcessingError, Result, SourceError};
use crate::models::{Location, Measurement, QualityFlag, Sensor};
use crate::sources::{LocationQuery, PageBatch, PageRequest};
use crate::utils::time::parse_utc;

const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Debug, Clone)]
pub struct OpenAqClient {
    http: Client,
    base_url: String,
}

impl OpenAqClient {
    /// The client has no overall request timeout; the fetch loop bounds each page.
    pub fn new(base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .gzip(true)
            .user_agent(concat!("envdata-collector/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(ProcessingError::Http)?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn list_locations(
        &self,
        permit: &Permit,
        query: &LocationQuery,
        page: u32,
    ) -> std::result::Result<Vec<Location>, SourceError> {
        let mut params: Vec<(&str, String)> = vec![
            ("limit", query.limit.to_string()),
            ("page", page.to_string()),
        ];
        if let Some(id) = query.country_id {
            params.push(("countries_id", id.to_string()));
        }
        if let Some(code) = &query.country_code {
            params.push(("iso", code.to_uppercase()));
        }

        let envelope: Envelope<ApiLocation> = self.get(permit, "/locations", &params).await?;
        let total = envelope.results.len();
        let locations: Vec<Location> = envelope
            .results
            .into_iter()
            .filter_map(ApiLocation::into_location)
            .collect();

        if locations.len() < total {
            debug!(
                page,
                skipped = total - locations.len(),
                "Skipped locations without coordinates"
            );
        }
        Ok(locations)
    }

    pub async fn list_sensors(
        &self,
        permit: &Permit,
        location_id: u64,
    ) -> std::result::Result<Vec<Sensor>, SourceError> {
        let path = format!("/locations/{}/sensors", location_id);
        let envelope: Envelope<ApiSensor> = self.get(permit, &path, &[]).await?;
        Ok(envelope
            .results
            .into_iter()
            .map(ApiSensor::into_sensor)
            .collect())
    }

    pub async fn fetch_page(
        &self,
        permit: &Permit,
        request: &PageRequest<'_>,
    ) -> std::result::Result<PageBatch, SourceError> {
        let mut params: Vec<(&str, String)> = vec![
            ("limit", request.limit.to_string()),
            ("page", request.page.to_string()),
        ];
        if let Some(from) = request.window.from {
            params.push(("datetime_from", from.to_rfc3339()));
        }
        if let Some(to) = request.window.to {
            params.push(("datetime_to", to.to_rfc3339()));
        }

        let path = format!("/sensors/{}/measurements", request.unit.sensor_id);
        let envelope: Envelope<ApiMeasurement> = self.get(permit, &path, &params).await?;
        Ok(page_batch(envelope, request))
    }

    async fn get<T: DeserializeOwned>(
        &self,
        permit: &Permit,
        path: &str,
        params: &[(&str, String)],
    ) -> std::result::Result<T, SourceError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .header(API_KEY_HEADER, &permit.credential.api_key)
            .query(params)
            .send()
            .await?;

        let response = check_status(response, &url)?;
        let body = response.bytes().await?;
        serde_json::from_slice(&body)
            .map_err(|e| SourceError::Fatal(format!("Unparseable response from {}: {}", url, e)))
    }
}

fn check_status(response: Response, url: &str) -> std::result::Result<Response, SourceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    match SourceError::from_status(status, url) {
        SourceError::RateLimited { .. } => {
            let retry_after = retry_after(response.headers());
            warn!(url, ?retry_after, "Provider answered 429");
            Err(SourceError::RateLimited { retry_after })
        }
        other => Err(other),
    }
}

/// Retry-After in delta-seconds form; HTTP-date values fall back to the gate cooldown
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn page_batch(envelope: Envelope<ApiMeasurement>, request: &PageRequest<'_>) -> PageBatch {
    let raw_len = envelope.results.len();
    let measurements = envelope
        .results
        .into_iter()
        .filter_map(|m| m.into_measurement(request))
        .collect();
    PageBatch {
        raw_len,
        measurements,
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ApiCoordinates {
    latitude: Option<f64>,
    longitude: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ApiCountry {
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiParameter {
    name: Option<String>,
    units: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiSensor {
    id: u64,
    parameter: Option<ApiParameter>,
}

impl ApiSensor {
    fn into_sensor(self) -> Sensor {
        let (parameter, unit) = match self.parameter {
            Some(p) => (p.name.unwrap_or_default(), p.units.unwrap_or_default()),
            None => (String::new(), String::new()),
        };
        Sensor {
            id: self.id,
            parameter,
            unit,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiLocation {
    id: u64,
    name: Option<String>,
    locality: Option<String>,
    country: Option<ApiCountry>,
    coordinates: Option<ApiCoordinates>,
    #[serde(default)]
    sensors: Vec<ApiSensor>,
}

impl ApiLocation {
    fn into_location(self) -> Option<Location> {
        let coordinates = self.coordinates?;
        let latitude = coordinates.latitude?;
        let longitude = coordinates.longitude?;

        let name = self
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("location-{}", self.id));

        let mut location = Location::new(self.id, name, latitude, longitude);
        location.locality = self.locality;
        location.country = self.country.and_then(|c| c.code);
        location.sensors = self.sensors.into_iter().map(ApiSensor::into_sensor).collect();
        Some(location)
    }
}

#[derive(Debug, Deserialize)]
struct ApiInstant {
    utc: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiPeriod {
    datetime_from: Option<ApiInstant>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiFlagInfo {
    #[serde(default)]
    has_flags: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiMeasurement {
    value: Option<f64>,
    period: Option<ApiPeriod>,
    parameter: Option<ApiParameter>,
    flag_info: Option<ApiFlagInfo>,
}

impl ApiMeasurement {
    fn into_measurement(self, request: &PageRequest<'_>) -> Option<Measurement> {
        let value = self.value?;
        let raw_ts = self.period?.datetime_from?.utc?;
        let timestamp = parse_utc(&raw_ts).ok()?;

        let (parameter, unit) = match self.parameter {
            Some(p) => (
                p.name.unwrap_or_else(|| request.unit.parameter.clone()),
                p.units.unwrap_or_else(|| request.unit_of_measure.to_string()),
            ),
            None => (
                request.unit.parameter.clone(),
                request.unit_of_measure.to_string(),
            ),
        };

        let quality_flag = match self.flag_info {
            Some(info) if info.has_flags => QualityFlag::Suspect,
            _ => QualityFlag::Valid,
        };

        Some(Measurement {
            sensor_id: request.unit.sensor_id,
            location_id: request.unit.location_id,
            latitude: request.latitude,
            longitude: request.longitude,
            timestamp,
            parameter,
            value,
            unit,
            quality_flag,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WorkUnit;
    use crate::sources::DateWindow;

    const LOCATIONS_JSON: &str = r#"{
        "meta": {"found": 2},
        "results": [
            {
                "id": 2161,
                "name": "Hanoi US Embassy",
                "locality": "Hanoi",
                "country": {"id": 56, "code": "VN", "name": "Vietnam"},
                "coordinates": {"latitude": 21.0219, "longitude": 105.8189},
                "sensors": [
                    {"id": 3917, "name": "pm25 µg/m³", "parameter": {"id": 2, "name": "pm25", "units": "µg/m³"}},
                    {"id": 3918, "name": "o3 ppm", "parameter": {"id": 10, "name": "o3", "units": "ppm"}}
                ]
            },
            {"id": 9999, "name": "Broken", "coordinates": null, "sensors": []}
        ]
    }"#;

    const MEASUREMENTS_JSON: &str = r#"{
        "results": [
            {
                "value": 41.5,
                "parameter": {"id": 2, "name": "pm25", "units": "µg/m³"},
                "period": {"datetimeFrom": {"utc": "2024-01-01T10:00:00Z", "local": "2024-01-01T17:00:00+07:00"}},
                "flagInfo": {"hasFlags": false}
            },
            {
                "value": null,
                "parameter": {"id": 2, "name": "pm25", "units": "µg/m³"},
                "period": {"datetimeFrom": {"utc": "2024-01-01T11:00:00Z"}}
            },
            {
                "value": 39.0,
                "parameter": {"id": 2, "name": "pm25", "units": "µg/m³"},
                "period": {"datetimeFrom": {"utc": "2024-01-01T12:00:00Z"}},
                "flagInfo": {"hasFlags": true}
            },
            {
                "value": 12.0,
                "period": {}
            }
        ]
    }"#;

    #[test]
    fn test_parse_locations() {
        let envelope: Envelope<ApiLocation> = serde_json::from_str(LOCATIONS_JSON).unwrap();
        let locations: Vec<Location> = envelope
            .results
            .into_iter()
            .filter_map(ApiLocation::into_location)
            .collect();

        assert_eq!(locations.len(), 1);
        let hanoi = &locations[0];
        assert_eq!(hanoi.id, 2161);
        assert_eq!(hanoi.country.as_deref(), Some("VN"));
        assert_eq!(hanoi.sensors.len(), 2);
        assert_eq!(hanoi.sensors[1].parameter, "o3");
        assert_eq!(hanoi.sensors[0].unit, "µg/m³");
    }

    #[test]
    fn test_parse_measurements_drops_incomplete_rows() {
        let unit = WorkUnit::new("openaq", 2161, 3917, "pm25");
        let window = DateWindow::default();
        let request = PageRequest {
            unit: &unit,
            latitude: 21.0219,
            longitude: 105.8189,
            unit_of_measure: "µg/m³",
            page: 1,
            limit: 1000,
            window: &window,
        };

        let envelope: Envelope<ApiMeasurement> = serde_json::from_str(MEASUREMENTS_JSON).unwrap();
        let batch = page_batch(envelope, &request);
        assert_eq!(batch.raw_len, 4);
        assert_eq!(batch.dropped(), 2);

        let rows = batch.measurements;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].value, 41.5);
        assert_eq!(rows[0].location_id, 2161);
        assert_eq!(rows[0].quality_flag, QualityFlag::Valid);
        assert_eq!(rows[1].quality_flag, QualityFlag::Suspect);
        assert_eq!(rows[1].timestamp.to_rfc3339(), "2024-01-01T12:00:00+00:00");
    }

    #[test]
    fn test_all_null_page_keeps_raw_count() {
        let unit = WorkUnit::new("openaq", 2161, 3917, "pm25");
        let window = DateWindow::default();
        let request = PageRequest {
            unit: &unit,
            latitude: 21.0219,
            longitude: 105.8189,
            unit_of_measure: "µg/m³",
            page: 1,
            limit: 2,
            window: &window,
        };

        let envelope: Envelope<ApiMeasurement> = serde_json::from_str(
            r#"{"results": [
                {"value": null, "period": {"datetimeFrom": {"utc": "2024-01-01T10:00:00Z"}}},
                {"value": null, "period": {"datetimeFrom": {"utc": "2024-01-01T11:00:00Z"}}}
            ]}"#,
        )
        .unwrap();
        let batch = page_batch(envelope, &request);

        assert_eq!(batch.raw_len, 2);
        assert!(batch.measurements.is_empty());
    }

    #[test]
    fn test_missing_results_is_empty_page() {
        let envelope: Envelope<ApiMeasurement> = serde_json::from_str(r#"{"meta": {}}"#).unwrap();
        assert!(envelope.results.is_empty());
    }

    #[test]
    fn test_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, "12".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(12)));

        headers.insert(RETRY_AFTER, "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap());
        assert_eq!(retry_after(&headers), None);
    }
}
