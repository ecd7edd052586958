use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "envdata-collector")]
#[command(about = "Resumable environmental data collector with hexagon-hour aggregation")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Log file path")]
    pub log_file: Option<PathBuf>,

    #[arg(long, global = true, help = "Settings file [default: envdata.toml if present]")]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Hide progress bars")]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Download raw measurements; re-running the same command resumes
    Download {
        #[arg(long, default_value = "openaq", help = "Data source: openaq or fixture")]
        source: String,

        #[arg(long, help = "Fixture JSON file (with --source fixture)")]
        fixture: Option<PathBuf>,

        #[arg(long, help = "ISO country code, e.g. VN")]
        country: Option<String>,

        #[arg(long, help = "Provider country identifier")]
        country_id: Option<u32>,

        #[arg(short, long = "parameter", help = "Parameter to download (repeatable)")]
        parameters: Vec<String>,

        #[arg(long, default_value = "auto", help = "auto, sequential or parallel")]
        mode: String,

        #[arg(long, help = "Start date YYYY-MM-DD (best effort)")]
        date_from: Option<String>,

        #[arg(long, help = "End date YYYY-MM-DD (best effort)")]
        date_to: Option<String>,

        #[arg(long)]
        max_locations: Option<usize>,

        #[arg(long, help = "Use at most this many credentials")]
        credentials: Option<usize>,

        #[arg(long)]
        requests_per_minute: Option<u32>,

        #[arg(long)]
        max_concurrency: Option<usize>,

        #[arg(long, help = "Remove duplicate rows when the run finishes")]
        dedup: bool,
    },

    /// Aggregate raw measurement files into hexagon-hour buckets
    Aggregate {
        #[arg(short, long = "input", required = true, help = "Raw measurement CSV (repeatable)")]
        inputs: Vec<PathBuf>,

        #[arg(
            short,
            long,
            help = "Output bucket CSV [default: data/processed/{source}_hex_hourly_res{R}.csv]"
        )]
        output_file: Option<PathBuf>,

        #[arg(short, long, default_value = "openaq")]
        source_name: String,

        #[arg(short, long, help = "H3 resolution [default: from settings]")]
        resolution: Option<u8>,

        #[arg(long, default_value_t = num_cpus::get())]
        max_workers: usize,

        #[arg(long, default_value = "1000")]
        chunk_size: usize,
    },

    /// Outer-join bucket files of several sources into one feature table
    Unify {
        #[arg(
            short,
            long = "input",
            required = true,
            help = "SOURCE=BUCKET_CSV (repeatable)"
        )]
        inputs: Vec<String>,

        #[arg(
            short,
            long,
            help = "Output .csv or .parquet [default: data/unified/unified_res{R}_{YYMMDD}.csv]"
        )]
        output_file: Option<PathBuf>,

        #[arg(long, default_value = "none", help = "Gap-fill policy: none, ffill[:H], neighbor[:K]")]
        default_fill: String,

        #[arg(long = "fill", help = "SOURCE[:PARAMETER]=POLICY override (repeatable)")]
        fills: Vec<String>,

        #[arg(short, long, help = "Required H3 resolution [default: inferred]")]
        resolution: Option<u8>,

        #[arg(short, long, default_value = "snappy")]
        compression: String,

        #[arg(long, default_value = "1000")]
        chunk_size: usize,
    },

    /// Remove rows repeating (sensor, timestamp, parameter) from a raw file
    Dedup {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long, help = "Write here instead of replacing the input")]
        output_file: Option<PathBuf>,
    },

    /// List download checkpoints and their progress
    Checkpoints,

    /// Display information about a Parquet file
    Info {
        #[arg(short, long)]
        file: PathBuf,
    },
}
