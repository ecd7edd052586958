//! Drives one work unit through its pages.
//!
//! `PageFetcher` is a cursor: each `next` call yields either a batch for the
//! caller to write or the unit's terminal state. Termination is checked in
//! this order: a page with no provider rows completes the unit, a page past
//! the ceiling is never requested and truncates it, and a page request
//! outliving the page timeout truncates it as well. A page whose rows were all
//! dropped at parse time is not empty; it yields an empty batch and paging
//! continues.

use std::time::Duration;
use tracing::{debug, info, warn};

use crate::download::rate_gate::RateGate;
use crate::download::retry::RetryPolicy;
use crate::error::{Result, SourceError};
use crate::models::{Measurement, TruncationReason, UnitOutcome, UnitState, WorkUnit};
use crate::settings::Settings;
use crate::sources::{DateWindow, PageRequest, Source};

#[derive(Debug, Clone, PartialEq)]
pub struct FetchConfig {
    pub page_size: u32,
    pub page_ceiling: u32,
    pub page_timeout: Duration,
    pub stop_on_short_page: bool,
}

impl From<&Settings> for FetchConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            page_size: settings.download.page_size,
            page_ceiling: settings.download.page_ceiling,
            page_timeout: settings.page_timeout(),
            stop_on_short_page: settings.download.stop_on_short_page,
        }
    }
}

/// A work unit plus the location context copied onto every measurement
#[derive(Debug, Clone)]
pub struct UnitTarget {
    pub unit: WorkUnit,
    pub latitude: f64,
    pub longitude: f64,
    pub unit_of_measure: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PageStep {
    Batch { page: u32, measurements: Vec<Measurement> },
    Done(UnitState),
}

pub struct PageFetcher<'a> {
    source: &'a Source,
    gate: &'a RateGate,
    retry: &'a RetryPolicy,
    config: &'a FetchConfig,
    target: &'a UnitTarget,
    window: &'a DateWindow,
    next_page: u32,
    state: UnitState,
    pages_fetched: u32,
    saw_short_page: bool,
}

impl<'a> PageFetcher<'a> {
    pub fn new(
        source: &'a Source,
        gate: &'a RateGate,
        retry: &'a RetryPolicy,
        config: &'a FetchConfig,
        target: &'a UnitTarget,
        window: &'a DateWindow,
    ) -> Self {
        Self {
            source,
            gate,
            retry,
            config,
            target,
            window,
            next_page: 1,
            state: UnitState::Pending,
            pages_fetched: 0,
            saw_short_page: false,
        }
    }

    pub fn state(&self) -> &UnitState {
        &self.state
    }

    pub fn pages_fetched(&self) -> u32 {
        self.pages_fetched
    }

    pub async fn next(&mut self) -> Result<PageStep> {
        if self.state.is_terminal() {
            return Ok(PageStep::Done(self.state.clone()));
        }
        if self.state == UnitState::Pending {
            self.state.transition(UnitState::InProgress)?;
        }

        if self.saw_short_page {
            return self.finish(UnitState::Complete);
        }

        let (source, gate, retry, config, target) =
            (self.source, self.gate, self.retry, self.config, self.target);
        let unit = &target.unit;
        if self.next_page > config.page_ceiling {
            info!(
                unit = %unit,
                ceiling = config.page_ceiling,
                "Page ceiling reached; unit truncated"
            );
            return self.finish(UnitState::Truncated {
                reason: TruncationReason::PageCeiling,
            });
        }

        let page = self.next_page;
        let request = PageRequest {
            unit,
            latitude: target.latitude,
            longitude: target.longitude,
            unit_of_measure: &target.unit_of_measure,
            page,
            limit: config.page_size,
            window: self.window,
        };

        let mut failures = 0u32;
        loop {
            let permit = gate.acquire().await;
            let outcome =
                tokio::time::timeout(config.page_timeout, source.fetch_page(&permit, &request)).await;

            let result = match outcome {
                Ok(result) => result,
                Err(_) => {
                    info!(
                        unit = %unit,
                        page,
                        timeout_secs = config.page_timeout.as_secs(),
                        "Page request timed out; treating as provider limit"
                    );
                    return self.finish(UnitState::Truncated {
                        reason: TruncationReason::PageTimeout,
                    });
                }
            };

            match result {
                Ok(batch) => {
                    gate.report_success(permit.index);
                    self.pages_fetched += 1;

                    if batch.raw_len == 0 {
                        debug!(unit = %unit, page, "Empty page; unit exhausted");
                        return self.finish(UnitState::Complete);
                    }

                    if config.stop_on_short_page && (batch.raw_len as u32) < config.page_size {
                        self.saw_short_page = true;
                    }
                    if batch.dropped() > 0 {
                        debug!(
                            unit = %unit,
                            page,
                            dropped = batch.dropped(),
                            "Dropped rows without timestamp or value"
                        );
                    }

                    self.next_page += 1;
                    debug!(
                        unit = %unit,
                        page,
                        rows = batch.measurements.len(),
                        credential = %permit.credential.key_id,
                        "Fetched page"
                    );
                    return Ok(PageStep::Batch {
                        page,
                        measurements: batch.measurements,
                    });
                }
                Err(SourceError::RateLimited { retry_after }) => {
                    gate.report_rate_limited(permit.index, retry_after);
                }
                Err(e @ SourceError::Transient(_)) => {
                    failures += 1;
                    if !retry.should_retry(failures) {
                        warn!(unit = %unit, page, attempts = failures, error = %e, "Retries exhausted");
                        return self.finish(UnitState::Failed {
                            error: format!("page {}: {}", page, e),
                        });
                    }
                    let delay = retry.delay_for(failures);
                    warn!(
                        unit = %unit,
                        page,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(unit = %unit, page, error = %e, "Page request rejected");
                    return self.finish(UnitState::Failed {
                        error: format!("page {}: {}", page, e),
                    });
                }
            }
        }
    }

    pub fn outcome(&self, measurements_written: u64) -> UnitOutcome {
        UnitOutcome {
            unit: self.target.unit.clone(),
            state: self.state.clone(),
            pages_fetched: self.pages_fetched,
            measurements_written,
        }
    }

    fn finish(&mut self, state: UnitState) -> Result<PageStep> {
        self.state.transition(state.clone())?;
        Ok(PageStep::Done(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::rate_gate::Credential;
    use crate::sources::{FixtureFault, FixtureReading, FixtureSource, FixtureTail, SensorScript};
    use chrono::{TimeZone, Utc};
    use tokio::time::Instant;

    fn gate() -> RateGate {
        RateGate::new(vec![Credential::new("key1", "secret", 6000)])
            .unwrap()
            .with_cooldown(Duration::from_millis(100))
    }

    fn config(ceiling: u32) -> FetchConfig {
        FetchConfig {
            page_size: 3,
            page_ceiling: ceiling,
            page_timeout: Duration::from_secs(30),
            stop_on_short_page: false,
        }
    }

    fn target() -> UnitTarget {
        UnitTarget {
            unit: WorkUnit::new("fixture", 1, 11, "pm25"),
            latitude: 35.0,
            longitude: 139.0,
            unit_of_measure: "µg/m³".to_string(),
        }
    }

    fn source(script: SensorScript) -> Source {
        Source::Fixture(FixtureSource::new("fixture").with_script(11, script))
    }

    fn start() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn requests(source: &Source) -> u64 {
        match source {
            Source::Fixture(f) => f.requests_for(11),
            Source::OpenAq(_) => 0,
        }
    }

    async fn drain(fetcher: &mut PageFetcher<'_>) -> (Vec<u32>, UnitState) {
        let (batches, state) = drain_rows(fetcher).await;
        (batches.into_iter().map(|(page, _)| page).collect(), state)
    }

    /// (page, parsed rows) per batch, then the terminal state
    async fn drain_rows(fetcher: &mut PageFetcher<'_>) -> (Vec<(u32, usize)>, UnitState) {
        let mut batches = Vec::new();
        loop {
            match fetcher.next().await.unwrap() {
                PageStep::Batch { page, measurements } => batches.push((page, measurements.len())),
                PageStep::Done(state) => return (batches, state),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_pages_then_empty() {
        let source = source(SensorScript::hourly(3, 3, start()));
        let (gate, retry, config, target, window) =
            (gate(), RetryPolicy::default(), config(16), target(), DateWindow::default());
        let mut fetcher = PageFetcher::new(&source, &gate, &retry, &config, &target, &window);

        let (pages, state) = drain(&mut fetcher).await;
        assert_eq!(pages, vec![1, 2, 3]);
        assert_eq!(state, UnitState::Complete);
        assert_eq!(requests(&source), 4);
        assert_eq!(fetcher.pages_fetched(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_endless_provider_truncated_at_ceiling() {
        let source = source(SensorScript::hourly(1, 3, start()).then(FixtureTail::RepeatLast));
        let (gate, retry, config, target, window) =
            (gate(), RetryPolicy::default(), config(16), target(), DateWindow::default());
        let mut fetcher = PageFetcher::new(&source, &gate, &retry, &config, &target, &window);

        let (pages, state) = drain(&mut fetcher).await;
        assert_eq!(pages.len(), 16);
        assert_eq!(
            state,
            UnitState::Truncated {
                reason: TruncationReason::PageCeiling
            }
        );
        assert_eq!(requests(&source), 16);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_page_truncates() {
        let source = source(SensorScript::hourly(2, 3, start()).then(FixtureTail::Hang));
        let (gate, retry, config, target, window) =
            (gate(), RetryPolicy::default(), config(16), target(), DateWindow::default());
        let mut fetcher = PageFetcher::new(&source, &gate, &retry, &config, &target, &window);

        let begin = Instant::now();
        let (pages, state) = drain(&mut fetcher).await;
        assert_eq!(pages, vec![1, 2]);
        assert_eq!(
            state,
            UnitState::Truncated {
                reason: TruncationReason::PageTimeout
            }
        );
        assert!(begin.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_retried() {
        let script = SensorScript::hourly(1, 3, start())
            .fault(1, FixtureFault::Transient)
            .fault(1, FixtureFault::Transient);
        let source = source(script);
        let (gate, retry, config, target, window) =
            (gate(), RetryPolicy::default(), config(16), target(), DateWindow::default());
        let mut fetcher = PageFetcher::new(&source, &gate, &retry, &config, &target, &window);

        let (pages, state) = drain(&mut fetcher).await;
        assert_eq!(pages, vec![1]);
        assert_eq!(state, UnitState::Complete);
        assert_eq!(requests(&source), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail_unit() {
        let script = SensorScript::hourly(2, 3, start())
            .fault(2, FixtureFault::Transient)
            .fault(2, FixtureFault::Transient)
            .fault(2, FixtureFault::Transient);
        let source = source(script);
        let (gate, retry, config, target, window) =
            (gate(), RetryPolicy::default(), config(16), target(), DateWindow::default());
        let mut fetcher = PageFetcher::new(&source, &gate, &retry, &config, &target, &window);

        let (pages, state) = drain(&mut fetcher).await;
        assert_eq!(pages, vec![1]);
        assert!(matches!(state, UnitState::Failed { .. }));
        // later calls keep reporting the terminal state
        assert!(matches!(fetcher.next().await.unwrap(), PageStep::Done(UnitState::Failed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_does_not_consume_attempts() {
        let mut script = SensorScript::hourly(1, 3, start());
        for _ in 0..5 {
            script = script.fault(1, FixtureFault::RateLimited);
        }
        let source = source(script);
        let (gate, retry, config, target, window) =
            (gate(), RetryPolicy::default(), config(16), target(), DateWindow::default());
        let mut fetcher = PageFetcher::new(&source, &gate, &retry, &config, &target, &window);

        let (pages, state) = drain(&mut fetcher).await;
        assert_eq!(pages, vec![1]);
        assert_eq!(state, UnitState::Complete);
        assert_eq!(requests(&source), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_page_stops_early() {
        let script = SensorScript::new(vec![
            SensorScript::hourly(1, 3, start()).pages.remove(0),
            SensorScript::hourly(1, 2, start()).pages.remove(0),
        ]);
        let source = source(script);
        let (gate, retry, target, window) =
            (gate(), RetryPolicy::default(), target(), DateWindow::default());
        let config = FetchConfig {
            stop_on_short_page: true,
            ..config(16)
        };
        let mut fetcher = PageFetcher::new(&source, &gate, &retry, &config, &target, &window);

        let (pages, state) = drain(&mut fetcher).await;
        assert_eq!(pages, vec![1, 2]);
        assert_eq!(state, UnitState::Complete);
        assert_eq!(requests(&source), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_page_of_null_readings_does_not_end_unit() {
        let script = SensorScript::new(vec![
            vec![
                FixtureReading::null(start()),
                FixtureReading::null(start() + chrono::Duration::hours(1)),
            ],
            SensorScript::hourly(1, 2, start() + chrono::Duration::hours(2)).pages.remove(0),
        ]);
        let source = source(script);
        let (gate, retry, target, window) =
            (gate(), RetryPolicy::default(), target(), DateWindow::default());
        let config = FetchConfig {
            page_size: 2,
            ..config(16)
        };
        let mut fetcher = PageFetcher::new(&source, &gate, &retry, &config, &target, &window);

        let (batches, state) = drain_rows(&mut fetcher).await;
        assert_eq!(batches, vec![(1, 0), (2, 2)]);
        assert_eq!(state, UnitState::Complete);
        assert_eq!(requests(&source), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_page_judged_on_provider_rows() {
        let full_page_with_null = vec![
            FixtureReading::new(start(), 1.0),
            FixtureReading::null(start() + chrono::Duration::hours(1)),
            FixtureReading::new(start() + chrono::Duration::hours(2), 3.0),
        ];
        let script = SensorScript::new(vec![
            full_page_with_null,
            SensorScript::hourly(1, 1, start() + chrono::Duration::hours(3)).pages.remove(0),
        ]);
        let source = source(script);
        let (gate, retry, target, window) =
            (gate(), RetryPolicy::default(), target(), DateWindow::default());
        let config = FetchConfig {
            stop_on_short_page: true,
            ..config(16)
        };
        let mut fetcher = PageFetcher::new(&source, &gate, &retry, &config, &target, &window);

        let (batches, state) = drain_rows(&mut fetcher).await;
        assert_eq!(batches, vec![(1, 2), (2, 1)]);
        assert_eq!(state, UnitState::Complete);
        assert_eq!(requests(&source), 2);
    }
}
