//! Data providers the download pipeline can drive.
//!
//! Each provider exposes the same three capabilities: discover locations,
//! list a location's sensors, and fetch one page of a sensor's measurements.
//! `Source` is the closed set of providers the orchestrator dispatches over.

pub mod fixture;
pub mod openaq;

pub use fixture::{FixtureFault, FixtureReading, FixtureSource, FixtureTail, SensorScript};
pub use openaq::OpenAqClient;

use chrono::{DateTime, Utc};

use crate::download::rate_gate::Permit;
use crate::error::SourceError;
use crate::models::{Location, Measurement, Sensor, WorkUnit};

/// Best-effort time bounds; providers are free to ignore them
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DateWindow {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct LocationQuery {
    pub country_id: Option<u32>,
    pub country_code: Option<String>,
    pub limit: u32,
}

/// One page of one work unit
#[derive(Debug, Clone)]
pub struct PageRequest<'a> {
    pub unit: &'a WorkUnit,
    pub latitude: f64,
    pub longitude: f64,
    pub unit_of_measure: &'a str,
    /// 1-based
    pub page: u32,
    pub limit: u32,
    pub window: &'a DateWindow,
}

/// One provider page. `raw_len` counts every row the provider sent, parsed
/// or not; empty and short pages are judged on it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageBatch {
    pub raw_len: usize,
    pub measurements: Vec<Measurement>,
}

impl PageBatch {
    /// Rows without a timestamp or value
    pub fn dropped(&self) -> usize {
        self.raw_len.saturating_sub(self.measurements.len())
    }
}

pub enum Source {
    OpenAq(OpenAqClient),
    Fixture(FixtureSource),
}

impl Source {
    pub fn name(&self) -> &str {
        match self {
            Source::OpenAq(_) => "openaq",
            Source::Fixture(f) => f.name(),
        }
    }

    /// One page of location discovery; an empty page ends discovery
    pub async fn list_locations(
        &self,
        permit: &Permit,
        query: &LocationQuery,
        page: u32,
    ) -> Result<Vec<Location>, SourceError> {
        match self {
            Source::OpenAq(client) => client.list_locations(permit, query, page).await,
            Source::Fixture(fixture) => {
                fixture.record_permit(permit);
                fixture.list_locations(query, page)
            }
        }
    }

    /// Sensors the discovery listing already carried, when no request is needed
    pub fn embedded_sensors(&self, location: &Location) -> Option<Vec<Sensor>> {
        match self {
            Source::OpenAq(_) if !location.sensors.is_empty() => Some(location.sensors.clone()),
            Source::OpenAq(_) | Source::Fixture(_) => None,
        }
    }

    /// One sensor-listing request for `location`
    pub async fn list_sensors(
        &self,
        permit: &Permit,
        location: &Location,
    ) -> Result<Vec<Sensor>, SourceError> {
        match self {
            Source::OpenAq(client) => client.list_sensors(permit, location.id).await,
            Source::Fixture(fixture) => {
                fixture.record_permit(permit);
                fixture.list_sensors(location).await
            }
        }
    }

    pub async fn fetch_page(
        &self,
        permit: &Permit,
        request: &PageRequest<'_>,
    ) -> Result<PageBatch, SourceError> {
        match self {
            Source::OpenAq(client) => client.fetch_page(permit, request).await,
            Source::Fixture(fixture) => {
                fixture.record_permit(permit);
                fixture.fetch_page(request).await
            }
        }
    }
}
