use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

/// Generate a fresh raw output filename: {run_key}_{YYYYMMDD_HHMMSS}.csv
pub fn generate_raw_output_filename(output_dir: &Path, run_key: &str, now: DateTime<Utc>) -> PathBuf {
    let filename = format!("{}_{}.csv", run_key, now.format("%Y%m%d_%H%M%S"));
    output_dir.join(filename)
}

/// Generate default bucket filename with format: {source}_hex_hourly_res{R}.csv
pub fn generate_default_bucket_filename(source_name: &str, resolution: u8) -> PathBuf {
    let filename = format!("{}_hex_hourly_res{}.csv", sanitize(source_name), resolution);
    PathBuf::from("data").join("processed").join(filename)
}

/// Generate default unified filename with format: unified_res{R}_{YYMMDD}.csv
pub fn generate_default_unified_filename(resolution: u8, now: DateTime<Utc>) -> PathBuf {
    let filename = format!("unified_res{}_{}.csv", resolution, now.format("%y%m%d"));
    PathBuf::from("data").join("unified").join(filename)
}

/// Lowercase, keep [a-z0-9-], collapse everything else into '_'
pub fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_underscore = false;
    for c in raw.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() || c == '-' {
            out.push(c);
            last_underscore = false;
        } else if !last_underscore && !out.is_empty() {
            out.push('_');
            last_underscore = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}
