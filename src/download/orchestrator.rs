//! Resumable batch download over many locations.
//!
//! The orchestrator discovers locations, skips the ones the checkpoint
//! already holds, and drives every remaining work unit through a
//! `PageFetcher`. Batches are appended to the output file as they arrive;
//! a location is recorded in the checkpoint only after all of its units have
//! finished and their rows have been flushed.

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::download::fetch_loop::{FetchConfig, PageFetcher, PageStep, UnitTarget};
use crate::download::rate_gate::{Permit, RateGate};
use crate::download::retry::RetryPolicy;
use crate::download::strategy::{choose_strategy, Batching, ExecutionMode, Strategy, WorkloadStats};
use crate::download::summary::RunSummary;
use crate::error::{ProcessingError, Result, SourceError};
use crate::models::{Location, Sensor, UnitOutcome, WorkUnit, MEASUREMENT_HEADER};
use crate::processors::Deduplicator;
use crate::settings::Settings;
use crate::sources::{DateWindow, LocationQuery, Source};
use crate::utils::{generate_raw_output_filename, sanitize, ProgressReporter};
use crate::writers::IncrementalCsvWriter;

/// What to download; everything except the window and the caps feeds the run key
#[derive(Debug, Clone, Default)]
pub struct DownloadRequest {
    pub country_id: Option<u32>,
    pub country_code: Option<String>,
    pub parameters: Vec<String>,
    pub mode: ExecutionMode,
    pub window: DateWindow,
    pub max_locations: Option<usize>,
    pub dedup: bool,
}

impl DownloadRequest {
    /// Stable identity of the invocation: the same command finds the same checkpoint
    pub fn run_key(&self, source_name: &str) -> String {
        let country = match (&self.country_code, self.country_id) {
            (Some(code), _) => code.to_lowercase(),
            (None, Some(id)) => format!("c{}", id),
            (None, None) => "all".to_string(),
        };

        let parameters = if self.parameters.is_empty() {
            "all".to_string()
        } else {
            let mut sorted: Vec<String> = self.parameters.iter().map(|p| p.to_lowercase()).collect();
            sorted.sort();
            sorted.dedup();
            sorted.join("-")
        };

        sanitize(&format!("{}_{}_{}_{}", source_name, country, parameters, self.mode))
    }
}

struct LocationResult {
    location_id: u64,
    outcomes: Vec<UnitOutcome>,
    sensor_error: Option<String>,
}

impl LocationResult {
    fn is_done(&self) -> bool {
        self.sensor_error.is_none() && self.outcomes.iter().all(|o| o.state.is_done())
    }
}

pub struct Orchestrator {
    source: Source,
    gate: RateGate,
    retry: RetryPolicy,
    fetch: FetchConfig,
    store: CheckpointStore,
    output_dir: PathBuf,
    max_concurrency: usize,
    sensors_per_location_threshold: f64,
    discovery_page_size: u32,
    cancel: CancellationToken,
    quiet: bool,
}

impl Orchestrator {
    pub fn new(source: Source, gate: RateGate, settings: &Settings) -> Result<Self> {
        Ok(Self {
            source,
            gate,
            retry: RetryPolicy::from(&settings.retry),
            fetch: FetchConfig::from(settings),
            store: CheckpointStore::new(&settings.paths.checkpoint_dir)?,
            output_dir: settings.paths.output_dir.clone(),
            max_concurrency: settings.download.max_concurrency,
            sensors_per_location_threshold: settings.download.sensors_per_location_threshold,
            discovery_page_size: settings.download.page_size,
            cancel: CancellationToken::new(),
            quiet: false,
        })
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub async fn run(&self, request: &DownloadRequest) -> Result<RunSummary> {
        let started = Instant::now();
        let run_key = request.run_key(self.source.name());

        let resumed = self.store.load(&run_key)?;
        let output_file = match &resumed {
            Some(checkpoint) => checkpoint.output_file.clone(),
            None => generate_raw_output_filename(&self.output_dir, &run_key, Utc::now()),
        };

        let locations = self.discover(request).await?;
        match &resumed {
            Some(checkpoint) => {
                info!(
                    run_key = %run_key,
                    completed = checkpoint.completed_locations.len(),
                    output = %output_file.display(),
                    "Resuming from checkpoint"
                );
                self.store.set_total(&run_key, locations.len())?;
            }
            None => {
                info!(run_key = %run_key, output = %output_file.display(), "Starting fresh run");
                self.store.create(&run_key, &output_file, locations.len())?;
            }
        }

        let pending: Vec<Location> = locations
            .iter()
            .filter(|l| !resumed.as_ref().is_some_and(|c| c.is_completed(l.id)))
            .cloned()
            .collect();

        let stats = WorkloadStats {
            locations: pending.len(),
            sensors: pending
                .iter()
                .map(|l| l.sensors_matching(&request.parameters).len())
                .sum(),
            credentials: self.gate.credential_count(),
            max_concurrency: self.max_concurrency,
            sensors_per_location_threshold: self.sensors_per_location_threshold,
            mode: request.mode,
        };
        let strategy = choose_strategy(&stats);
        let (location_workers, unit_workers) = match strategy {
            Strategy::Sequential => (1, 1),
            Strategy::Parallel {
                batching: Batching::ByLocation,
                workers,
            } => (workers, 1),
            Strategy::Parallel {
                batching: Batching::BySensor,
                workers,
            } => (1, workers),
        };

        info!(
            run_key = %run_key,
            total = locations.len(),
            pending = pending.len(),
            skipped = locations.len() - pending.len(),
            strategy = %strategy,
            avg_sensors = stats.avg_sensors_per_location(),
            "Download plan"
        );

        let mut summary = RunSummary {
            run_key: run_key.clone(),
            output_file: output_file.clone(),
            strategy: strategy.to_string(),
            locations_total: locations.len(),
            locations_skipped: locations.len() - pending.len(),
            ..Default::default()
        };

        let writer = Mutex::new(IncrementalCsvWriter::open(&output_file, &MEASUREMENT_HEADER)?);
        let progress = ProgressReporter::new(pending.len() as u64, "Downloading locations", self.quiet);

        let mut results = stream::iter(pending.iter())
            .map(|location| self.process_location(location, request, &writer, unit_workers))
            .buffer_unordered(location_workers.max(1));

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    warn!(run_key = %run_key, "Interrupted; unrecorded locations will be retried on the next run");
                    summary.interrupted = true;
                    break;
                }
                next = results.next() => {
                    let Some(result) = next else { break };
                    let result = result?;

                    if result.is_done() {
                        self.store.record_completed(&run_key, result.location_id)?;
                        summary.locations_completed += 1;
                    } else {
                        self.store.record_failed(&run_key, result.location_id)?;
                        summary.locations_failed += 1;
                        if let Some(reason) = result.sensor_error {
                            warn!(location_id = result.location_id, error = %reason, "Sensor listing failed");
                            summary.sensor_errors.push((result.location_id, reason));
                        }
                    }

                    summary.outcomes.extend(result.outcomes);
                    progress.increment(1);
                }
            }
        }
        drop(results);
        drop(writer);

        progress.finish_with_message(if summary.interrupted {
            "Download interrupted"
        } else {
            "Download complete"
        });

        if request.dedup && !summary.interrupted {
            summary.dedup = Some(Deduplicator::new().deduplicate_in_place(&output_file)?);
        }

        summary.key_usage = self.gate.usage();
        summary.elapsed = started.elapsed();
        info!(
            run_key = %run_key,
            completed = summary.completed_units(),
            truncated = summary.truncated_units(),
            failed = summary.failed_units(),
            locations_failed = summary.locations_failed,
            "Run finished"
        );
        Ok(summary)
    }

    async fn discover(&self, request: &DownloadRequest) -> Result<Vec<Location>> {
        let query = LocationQuery {
            country_id: request.country_id,
            country_code: request.country_code.clone(),
            limit: self.discovery_page_size,
        };
        let cap = request.max_locations.unwrap_or(usize::MAX);

        let spinner = ProgressReporter::new_spinner("Discovering locations", self.quiet);
        let mut locations: Vec<Location> = Vec::new();
        let mut page = 1u32;
        while locations.len() < cap {
            let batch = self.discover_page(&query, page).await?;
            let short = (batch.len() as u32) < query.limit;
            if batch.is_empty() {
                break;
            }
            debug!(page, found = batch.len(), "Discovered locations");
            locations.extend(batch);
            spinner.set_message(&format!("Discovering locations: {} found", locations.len()));
            if short {
                break;
            }
            page += 1;
        }

        locations.truncate(cap);
        spinner.finish_with_message(&format!("Discovered {} locations", locations.len()));
        if request.max_locations.is_some() {
            info!(cap, kept = locations.len(), "Location discovery capped");
        }
        Ok(locations)
    }

    async fn discover_page(&self, query: &LocationQuery, page: u32) -> Result<Vec<Location>> {
        let what = format!("locations page {}", page);
        self.call_with_retry(&what, move |permit| async move {
            self.source.list_locations(&permit, query, page).await
        })
        .await
        .map_err(|e| {
            error!(page, error = %e, "Location discovery failed");
            ProcessingError::Source(e)
        })
    }

    /// Sensors of `location` passing the parameter filter; listed through the
    /// gate unless discovery already carried them
    async fn list_sensors(
        &self,
        location: &Location,
        parameters: &[String],
    ) -> std::result::Result<Vec<Sensor>, SourceError> {
        let sensors = match self.source.embedded_sensors(location) {
            Some(sensors) => sensors,
            None => {
                let what = format!("sensors of location {}", location.id);
                self.call_with_retry(&what, move |permit| async move {
                    self.source.list_sensors(&permit, location).await
                })
                .await?
            }
        };
        Ok(sensors.into_iter().filter(|s| s.matches(parameters)).collect())
    }

    /// One provider call under a gate permit. Rate limits back the credential
    /// off and never count as attempts; transient failures are retried within
    /// the retry budget; anything else is returned at once.
    async fn call_with_retry<T, F, Fut>(
        &self,
        what: &str,
        mut call: F,
    ) -> std::result::Result<T, SourceError>
    where
        F: FnMut(Permit) -> Fut,
        Fut: Future<Output = std::result::Result<T, SourceError>>,
    {
        let mut failures = 0u32;
        loop {
            let permit = self.gate.acquire().await;
            let index = permit.index;
            match call(permit).await {
                Ok(value) => {
                    self.gate.report_success(index);
                    return Ok(value);
                }
                Err(SourceError::RateLimited { retry_after }) => {
                    self.gate.report_rate_limited(index, retry_after);
                }
                Err(e @ SourceError::Transient(_)) => {
                    failures += 1;
                    if !self.retry.should_retry(failures) {
                        warn!(request = what, attempts = failures, error = %e, "Retries exhausted");
                        return Err(e);
                    }
                    let delay = self.retry.delay_for(failures);
                    warn!(
                        request = what,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn process_location(
        &self,
        location: &Location,
        request: &DownloadRequest,
        writer: &Mutex<IncrementalCsvWriter>,
        unit_workers: usize,
    ) -> Result<LocationResult> {
        let sensors = match self.list_sensors(location, &request.parameters).await {
            Ok(sensors) => sensors,
            Err(e) => {
                return Ok(LocationResult {
                    location_id: location.id,
                    outcomes: Vec::new(),
                    sensor_error: Some(e.to_string()),
                })
            }
        };

        let targets: Vec<UnitTarget> = sensors
            .iter()
            .map(|sensor| UnitTarget {
                unit: WorkUnit::new(self.source.name(), location.id, sensor.id, &sensor.parameter),
                latitude: location.latitude,
                longitude: location.longitude,
                unit_of_measure: sensor.unit.clone(),
            })
            .collect();

        debug!(
            location_id = location.id,
            name = %location.name,
            units = targets.len(),
            "Processing location"
        );

        let outcomes: Vec<Result<UnitOutcome>> = stream::iter(targets.iter())
            .map(|target| self.run_unit(target, &request.window, writer))
            .buffer_unordered(unit_workers.max(1))
            .collect()
            .await;

        Ok(LocationResult {
            location_id: location.id,
            outcomes: outcomes.into_iter().collect::<Result<Vec<_>>>()?,
            sensor_error: None,
        })
    }

    async fn run_unit(
        &self,
        target: &UnitTarget,
        window: &DateWindow,
        writer: &Mutex<IncrementalCsvWriter>,
    ) -> Result<UnitOutcome> {
        let mut fetcher = PageFetcher::new(
            &self.source,
            &self.gate,
            &self.retry,
            &self.fetch,
            target,
            window,
        );
        let mut written = 0u64;

        loop {
            match fetcher.next().await? {
                PageStep::Batch { measurements, .. } if measurements.is_empty() => {}
                PageStep::Batch { measurements, .. } => {
                    let appended = writer
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .append(&measurements)?;
                    written += appended as u64;
                }
                PageStep::Done(state) => {
                    debug!(
                        unit = %target.unit,
                        state = state.label(),
                        pages = fetcher.pages_fetched(),
                        rows = written,
                        "Unit finished"
                    );
                    return Ok(fetcher.outcome(written));
                }
            }
        }
    }
}
