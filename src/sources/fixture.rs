//! Scripted provider served from memory or a JSON file.
//!
//! Each sensor has a script of pages, a tail behaviour for pages past the
//! script, and optional faults injected per page. Faults are consumed one per
//! request, so a page with two faults succeeds on the third attempt.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

use crate::download::rate_gate::Permit;
use crate::error::{Result, SourceError};
use crate::models::{Location, Measurement, QualityFlag, Sensor};
use crate::sources::{LocationQuery, PageBatch, PageRequest};

/// What a sensor returns once its scripted pages run out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixtureTail {
    #[default]
    Empty,
    /// Re-serve the last scripted page forever
    RepeatLast,
    /// Never answer
    Hang,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixtureFault {
    Transient,
    RateLimited,
    Fatal,
}

impl FixtureFault {
    fn to_error(self, context: &str) -> SourceError {
        match self {
            FixtureFault::Transient => SourceError::Transient(format!("injected failure on {}", context)),
            FixtureFault::RateLimited => SourceError::RateLimited { retry_after: None },
            FixtureFault::Fatal => SourceError::Fatal(format!("injected rejection on {}", context)),
        }
    }
}

/// A provider row; a null value is sent but never parsed into a measurement
#[derive(Debug, Clone, Deserialize)]
pub struct FixtureReading {
    pub timestamp: DateTime<Utc>,
    pub value: Option<f64>,
    #[serde(default)]
    pub quality_flag: QualityFlag,
}

impl FixtureReading {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            timestamp,
            value: Some(value),
            quality_flag: QualityFlag::Valid,
        }
    }

    pub fn null(timestamp: DateTime<Utc>) -> Self {
        Self {
            value: None,
            ..Self::new(timestamp, 0.0)
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SensorScript {
    #[serde(default)]
    pub pages: Vec<Vec<FixtureReading>>,
    #[serde(default)]
    pub then: FixtureTail,
    /// Page number (1-based) to the faults served before that page succeeds
    #[serde(default)]
    pub faults: HashMap<u32, Vec<FixtureFault>>,
}

impl SensorScript {
    pub fn new(pages: Vec<Vec<FixtureReading>>) -> Self {
        Self {
            pages,
            ..Default::default()
        }
    }

    /// `pages` pages of `per_page` hourly readings starting at `start`
    pub fn hourly(pages: usize, per_page: usize, start: DateTime<Utc>) -> Self {
        let pages = (0..pages)
            .map(|p| {
                (0..per_page)
                    .map(|i| {
                        let n = (p * per_page + i) as i64;
                        FixtureReading::new(start + ChronoDuration::hours(n), n as f64)
                    })
                    .collect()
            })
            .collect();
        Self::new(pages)
    }

    pub fn then(mut self, tail: FixtureTail) -> Self {
        self.then = tail;
        self
    }

    pub fn fault(mut self, page: u32, fault: FixtureFault) -> Self {
        self.faults.entry(page).or_default().push(fault);
        self
    }
}

#[derive(Debug, Deserialize)]
struct FixtureFile {
    #[serde(default = "default_name")]
    name: String,
    locations: Vec<Location>,
    #[serde(default)]
    scripts: HashMap<u64, SensorScript>,
    /// Location id to the faults its sensor listing serves first
    #[serde(default)]
    sensor_faults: HashMap<u64, Vec<FixtureFault>>,
    #[serde(default)]
    latency_ms: u64,
}

fn default_name() -> String {
    "fixture".to_string()
}

#[derive(Debug)]
pub struct FixtureSource {
    name: String,
    locations: Vec<Location>,
    scripts: HashMap<u64, SensorScript>,
    pending_faults: Mutex<HashMap<(u64, u32), VecDeque<FixtureFault>>>,
    sensor_faults: Mutex<HashMap<u64, VecDeque<FixtureFault>>>,
    latency: Duration,
    total_requests: AtomicU64,
    per_sensor: Mutex<HashMap<u64, u64>>,
    sensor_listings: Mutex<HashMap<u64, u64>>,
    permits: Mutex<Vec<(String, Instant)>>,
}

impl FixtureSource {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            locations: Vec::new(),
            scripts: HashMap::new(),
            pending_faults: Mutex::new(HashMap::new()),
            sensor_faults: Mutex::new(HashMap::new()),
            latency: Duration::ZERO,
            total_requests: AtomicU64::new(0),
            per_sensor: Mutex::new(HashMap::new()),
            sensor_listings: Mutex::new(HashMap::new()),
            permits: Mutex::new(Vec::new()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let file: FixtureFile = serde_json::from_str(&content)?;

        let mut source = Self::new(&file.name).with_latency(Duration::from_millis(file.latency_ms));
        for location in file.locations {
            source = source.with_location(location);
        }
        for (sensor_id, script) in file.scripts {
            source = source.with_script(sensor_id, script);
        }
        for (location_id, faults) in file.sensor_faults {
            for fault in faults {
                source = source.with_sensor_fault(location_id, fault);
            }
        }

        info!(
            path = %path.display(),
            locations = source.locations.len(),
            scripted_sensors = source.scripts.len(),
            "Loaded fixture source"
        );
        Ok(source)
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.locations.push(location);
        self
    }

    pub fn with_script(mut self, sensor_id: u64, script: SensorScript) -> Self {
        {
            let faults = self
                .pending_faults
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner);
            faults.retain(|(sensor, _), _| *sensor != sensor_id);
            for (page, list) in &script.faults {
                faults.insert((sensor_id, *page), list.iter().copied().collect());
            }
        }
        self.scripts.insert(sensor_id, script);
        self
    }

    /// Queue a fault for the next sensor listing of `location_id`
    pub fn with_sensor_fault(mut self, location_id: u64, fault: FixtureFault) -> Self {
        self.sensor_faults
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(location_id)
            .or_default()
            .push_back(fault);
        self
    }

    /// Simulated round-trip time added to every request
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::SeqCst)
    }

    pub fn requests_for(&self, sensor_id: u64) -> u64 {
        self.per_sensor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&sensor_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn sensor_listings_for(&self, location_id: u64) -> u64 {
        self.sensor_listings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&location_id)
            .copied()
            .unwrap_or(0)
    }

    /// Note which credential a request went out under, and when
    pub fn record_permit(&self, permit: &Permit) {
        self.permits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((permit.credential.key_id.clone(), Instant::now()));
    }

    /// Every recorded request as (credential, start instant), in arrival order
    pub fn permit_log(&self) -> Vec<(String, Instant)> {
        self.permits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn list_locations(
        &self,
        query: &LocationQuery,
        page: u32,
    ) -> std::result::Result<Vec<Location>, SourceError> {
        let matching: Vec<&Location> = self
            .locations
            .iter()
            .filter(|l| match &query.country_code {
                Some(code) => l
                    .country
                    .as_deref()
                    .is_some_and(|c| c.eq_ignore_ascii_case(code)),
                None => true,
            })
            .collect();

        let limit = if query.limit == 0 {
            matching.len().max(1)
        } else {
            query.limit as usize
        };
        let start = (page.saturating_sub(1) as usize).saturating_mul(limit);

        Ok(matching
            .into_iter()
            .skip(start)
            .take(limit)
            .cloned()
            .collect())
    }

    pub async fn list_sensors(
        &self,
        location: &Location,
    ) -> std::result::Result<Vec<Sensor>, SourceError> {
        self.total_requests.fetch_add(1, Ordering::SeqCst);
        *self
            .sensor_listings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(location.id)
            .or_insert(0) += 1;

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let fault = self
            .sensor_faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&location.id)
            .and_then(VecDeque::pop_front);
        if let Some(fault) = fault {
            return Err(fault.to_error(&format!("sensors of location {}", location.id)));
        }

        self.locations
            .iter()
            .find(|l| l.id == location.id)
            .map(|l| l.sensors.clone())
            .ok_or_else(|| SourceError::NotFound(format!("location {}", location.id)))
    }

    pub async fn fetch_page(
        &self,
        request: &PageRequest<'_>,
    ) -> std::result::Result<PageBatch, SourceError> {
        let sensor_id = request.unit.sensor_id;
        self.total_requests.fetch_add(1, Ordering::SeqCst);
        *self
            .per_sensor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(sensor_id)
            .or_insert(0) += 1;

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let script = self
            .scripts
            .get(&sensor_id)
            .ok_or_else(|| SourceError::NotFound(format!("sensor {}", sensor_id)))?;

        if let Some(fault) = self.next_fault(sensor_id, request.page) {
            return Err(fault.to_error(&format!("page {}", request.page)));
        }

        let index = request.page.saturating_sub(1) as usize;
        let readings: &[FixtureReading] = match script.pages.get(index) {
            Some(page) => page.as_slice(),
            None => match script.then {
                FixtureTail::Empty => &[],
                FixtureTail::RepeatLast => script.pages.last().map(Vec::as_slice).unwrap_or(&[]),
                FixtureTail::Hang => std::future::pending().await,
            },
        };

        let measurements = readings
            .iter()
            .filter_map(|r| {
                Some(Measurement {
                    sensor_id,
                    location_id: request.unit.location_id,
                    latitude: request.latitude,
                    longitude: request.longitude,
                    timestamp: r.timestamp,
                    parameter: request.unit.parameter.clone(),
                    value: r.value?,
                    unit: request.unit_of_measure.to_string(),
                    quality_flag: r.quality_flag,
                })
            })
            .collect();

        Ok(PageBatch {
            raw_len: readings.len(),
            measurements,
        })
    }

    fn next_fault(&self, sensor_id: u64, page: u32) -> Option<FixtureFault> {
        self.pending_faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&(sensor_id, page))
            .and_then(VecDeque::pop_front)
    }
}
