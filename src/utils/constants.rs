/// Provider defaults
pub const DEFAULT_API_BASE_URL: &str = "https://api.openaq.org/v3";
pub const DEFAULT_REQUESTS_PER_MINUTE: u32 = 60;
pub const DEFAULT_PAGE_SIZE: u32 = 1000;

/// The measurements endpoint stops answering past page 16
pub const DEFAULT_PAGE_CEILING: u32 = 16;
pub const DEFAULT_PAGE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// Average sensors per location above which sensors of one location run in parallel
pub const DEFAULT_SENSORS_PER_LOCATION_THRESHOLD: f64 = 3.0;

/// Retry defaults
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1000;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 60_000;
pub const DEFAULT_RETRY_JITTER: f64 = 0.1;

/// Rate limit backoff
pub const RATE_LIMIT_COOLDOWN_SECS: u64 = 5;
pub const MAX_BACKOFF_FACTOR: u32 = 8;

/// Spatial defaults
pub const DEFAULT_H3_RESOLUTION: u8 = 8;
pub const DEFAULT_FORWARD_FILL_HOURS: u32 = 3;

/// Directory and file names
pub const DEFAULT_CHECKPOINT_DIR: &str = "data/checkpoints";
pub const DEFAULT_OUTPUT_DIR: &str = "data/raw";
pub const CHECKPOINT_FILE_PREFIX: &str = "checkpoint_";
pub const HISTORY_FILE: &str = "checkpoint_history.jsonl";
pub const SETTINGS_FILE: &str = "envdata.toml";

/// Processing defaults
pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_ROW_GROUP_SIZE: usize = 10000;
pub const DEFAULT_BUFFER_SIZE: usize = 8192 * 16; // 128KB

/// Daytime window (inclusive hours, UTC)
pub const DAYTIME_START_HOUR: u32 = 6;
pub const DAYTIME_END_HOUR: u32 = 18;

/// Parquet compression options
pub const COMPRESSION_SNAPPY: &str = "snappy";
pub const COMPRESSION_GZIP: &str = "gzip";
pub const COMPRESSION_LZ4: &str = "lz4";
pub const COMPRESSION_ZSTD: &str = "zstd";
pub const COMPRESSION_NONE: &str = "none";
