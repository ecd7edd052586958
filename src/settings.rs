use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use validator::Validate;

use crate::error::Result;
use crate::utils::constants::*;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct DownloadSettings {
    #[validate(range(min = 1))]
    pub requests_per_minute: u32,
    #[validate(range(min = 1))]
    pub max_concurrency: usize,
    #[validate(range(min = 1))]
    pub page_size: u32,
    #[validate(range(min = 1))]
    pub page_ceiling: u32,
    #[validate(range(min = 1))]
    pub page_timeout_secs: u64,
    pub sensors_per_location_threshold: f64,
    pub stop_on_short_page: bool,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RetrySettings {
    #[validate(range(min = 1))]
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub jitter: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathSettings {
    pub checkpoint_dir: PathBuf,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SpatialSettings {
    #[validate(range(max = 15))]
    pub resolution: u8,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Settings {
    pub api_base_url: String,
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[validate(nested)]
    pub download: DownloadSettings,
    #[validate(nested)]
    pub retry: RetrySettings,
    pub paths: PathSettings,
    #[validate(nested)]
    pub spatial: SpatialSettings,
}

impl Settings {
    /// Defaults, then the optional TOML file, then `ENVDATA__*` variables
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("api_base_url", DEFAULT_API_BASE_URL)?
            .set_default("api_keys", Vec::<String>::new())?
            .set_default("download.requests_per_minute", DEFAULT_REQUESTS_PER_MINUTE as u64)?
            .set_default("download.max_concurrency", DEFAULT_MAX_CONCURRENCY as u64)?
            .set_default("download.page_size", DEFAULT_PAGE_SIZE as u64)?
            .set_default("download.page_ceiling", DEFAULT_PAGE_CEILING as u64)?
            .set_default("download.page_timeout_secs", DEFAULT_PAGE_TIMEOUT_SECS)?
            .set_default(
                "download.sensors_per_location_threshold",
                DEFAULT_SENSORS_PER_LOCATION_THRESHOLD,
            )?
            .set_default("download.stop_on_short_page", false)?
            .set_default("retry.max_attempts", DEFAULT_RETRY_ATTEMPTS as u64)?
            .set_default("retry.base_delay_ms", DEFAULT_RETRY_BASE_DELAY_MS)?
            .set_default("retry.max_delay_ms", DEFAULT_RETRY_MAX_DELAY_MS)?
            .set_default("retry.jitter", DEFAULT_RETRY_JITTER)?
            .set_default("paths.checkpoint_dir", DEFAULT_CHECKPOINT_DIR)?
            .set_default("paths.output_dir", DEFAULT_OUTPUT_DIR)?
            .set_default("spatial.resolution", DEFAULT_H3_RESOLUTION as u64)?;

        builder = match config_file {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name(SETTINGS_FILE).required(false)),
        };

        let settings: Settings = builder
            .add_source(
                Environment::with_prefix("ENVDATA")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("api_keys")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.download.page_timeout_secs)
    }
}
