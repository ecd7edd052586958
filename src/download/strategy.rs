use std::fmt;
use std::str::FromStr;

use crate::error::{ProcessingError, Result};

/// Execution mode requested on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    #[default]
    Auto,
    Sequential,
    Parallel,
}

impl FromStr for ExecutionMode {
    type Err = ProcessingError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "auto" => Ok(ExecutionMode::Auto),
            "sequential" | "seq" => Ok(ExecutionMode::Sequential),
            "parallel" | "par" => Ok(ExecutionMode::Parallel),
            other => Err(ProcessingError::Config(format!(
                "Unknown mode '{}' (expected auto, sequential or parallel)",
                other
            ))),
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Auto => write!(f, "auto"),
            ExecutionMode::Sequential => write!(f, "sequential"),
            ExecutionMode::Parallel => write!(f, "parallel"),
        }
    }
}

/// Inputs to the strategy decision
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadStats {
    pub locations: usize,
    pub sensors: usize,
    pub credentials: usize,
    pub max_concurrency: usize,
    pub sensors_per_location_threshold: f64,
    pub mode: ExecutionMode,
}

impl WorkloadStats {
    pub fn avg_sensors_per_location(&self) -> f64 {
        if self.locations == 0 {
            return 0.0;
        }
        self.sensors as f64 / self.locations as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Batching {
    /// Many locations with few sensors: locations run concurrently
    ByLocation,
    /// Few locations with many sensors: one location at a time, its sensors concurrently
    BySensor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Sequential,
    Parallel { batching: Batching, workers: usize },
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Sequential => write!(f, "sequential"),
            Strategy::Parallel { batching, workers } => {
                let by = match batching {
                    Batching::ByLocation => "location",
                    Batching::BySensor => "sensor",
                };
                write!(f, "parallel by {} ({} workers)", by, workers)
            }
        }
    }
}

/// Pick how to run a download.
///
/// Workers never exceed the credential count, so in-flight requests stay
/// within what the pool may issue at once. Parallelism with one worker is
/// reported as sequential.
pub fn choose_strategy(stats: &WorkloadStats) -> Strategy {
    let workers = stats.credentials.min(stats.max_concurrency);

    if stats.mode == ExecutionMode::Sequential || workers <= 1 || stats.locations == 0 {
        return Strategy::Sequential;
    }

    let batching = if stats.avg_sensors_per_location() > stats.sensors_per_location_threshold {
        Batching::BySensor
    } else {
        Batching::ByLocation
    };

    Strategy::Parallel { batching, workers }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(locations: usize, sensors: usize, credentials: usize) -> WorkloadStats {
        WorkloadStats {
            locations,
            sensors,
            credentials,
            max_concurrency: 8,
            sensors_per_location_threshold: 3.0,
            mode: ExecutionMode::Auto,
        }
    }

    #[test]
    fn test_single_credential_is_sequential() {
        assert_eq!(choose_strategy(&stats(100, 200, 1)), Strategy::Sequential);
    }

    #[test]
    fn test_many_small_locations_batch_by_location() {
        assert_eq!(
            choose_strategy(&stats(100, 200, 4)),
            Strategy::Parallel {
                batching: Batching::ByLocation,
                workers: 4
            }
        );
    }

    #[test]
    fn test_dense_locations_batch_by_sensor() {
        assert_eq!(
            choose_strategy(&stats(2, 20, 4)),
            Strategy::Parallel {
                batching: Batching::BySensor,
                workers: 4
            }
        );
        // exactly at the threshold stays by location
        assert_eq!(
            choose_strategy(&stats(10, 30, 4)),
            Strategy::Parallel {
                batching: Batching::ByLocation,
                workers: 4
            }
        );
    }

    #[test]
    fn test_workers_capped_by_concurrency() {
        let mut s = stats(100, 100, 20);
        s.max_concurrency = 6;
        assert_eq!(
            choose_strategy(&s),
            Strategy::Parallel {
                batching: Batching::ByLocation,
                workers: 6
            }
        );
    }

    #[test]
    fn test_forced_sequential_and_empty_workload() {
        let mut s = stats(100, 100, 4);
        s.mode = ExecutionMode::Sequential;
        assert_eq!(choose_strategy(&s), Strategy::Sequential);
        assert_eq!(choose_strategy(&stats(0, 0, 4)), Strategy::Sequential);
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("Parallel".parse::<ExecutionMode>().unwrap(), ExecutionMode::Parallel);
        assert_eq!("auto".parse::<ExecutionMode>().unwrap(), ExecutionMode::Auto);
        assert!("turbo".parse::<ExecutionMode>().is_err());
    }
}
