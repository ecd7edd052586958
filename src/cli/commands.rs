use crate::checkpoint::CheckpointStore;
use crate::cli::args::{Cli, Commands};
use crate::download::{Credential, DownloadRequest, ExecutionMode, Orchestrator, RateGate};
use crate::error::{ProcessingError, Result};
use crate::models::{AggregationBucket, BucketRecord, BUCKET_HEADER};
use crate::processors::{FileAggregator, GapFillPlan, UnifiedBuilder};
use crate::readers::BucketReader;
use crate::settings::Settings;
use crate::sources::{DateWindow, FixtureSource, OpenAqClient, Source};
use crate::spatial::HexIndexer;
use crate::utils::progress::ProgressReporter;
use crate::utils::time::parse_date_bound;
use crate::utils::{generate_default_bucket_filename, generate_default_unified_filename};
use crate::writers::{IncrementalCsvWriter, ParquetWriter};
use chrono::Utc;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub async fn run(cli: Cli) -> Result<ExitCode> {
    init_logging(cli.verbose, cli.log_file.as_deref())?;
    let mut settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Download {
            source,
            fixture,
            country,
            country_id,
            parameters,
            mode,
            date_from,
            date_to,
            max_locations,
            credentials,
            requests_per_minute,
            max_concurrency,
            dedup,
        } => {
            if let Some(rpm) = requests_per_minute {
                settings.download.requests_per_minute = rpm;
            }
            if let Some(n) = max_concurrency {
                settings.download.max_concurrency = n;
            }

            let request = DownloadRequest {
                country_id,
                country_code: country,
                parameters,
                mode: mode.parse::<ExecutionMode>()?,
                window: DateWindow {
                    from: date_from.as_deref().map(parse_date_bound).transpose()?,
                    to: date_to.as_deref().map(parse_date_bound).transpose()?,
                },
                max_locations,
                dedup,
            };

            let (source, pool) = build_source(&source, fixture.as_deref(), &settings)?;
            let pool = match credentials {
                Some(0) => {
                    return Err(ProcessingError::Config(
                        "--credentials must be at least 1".to_string(),
                    ))
                }
                Some(n) => pool.into_iter().take(n).collect(),
                None => pool,
            };
            let gate = RateGate::new(pool)?;

            println!("Downloading from {}...", source.name());
            println!(
                "Credentials: {} ({} requests/min aggregate)",
                gate.credential_count(),
                gate.aggregate_budget()
            );

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_interrupt.cancel();
                }
            });

            let orchestrator = Orchestrator::new(source, gate, &settings)?
                .with_cancellation(cancel)
                .quiet(cli.quiet);
            let summary = orchestrator.run(&request).await?;

            println!("\n{}", summary.summary());
            Ok(ExitCode::from(summary.exit_code()))
        }

        Commands::Aggregate {
            inputs,
            output_file,
            source_name,
            resolution,
            max_workers,
            chunk_size,
        } => {
            let resolution = resolution.unwrap_or(settings.spatial.resolution);
            let indexer = HexIndexer::new(resolution)?;
            let output_file = output_file
                .unwrap_or_else(|| generate_default_bucket_filename(&source_name, resolution));

            println!("Aggregating {} file(s) at H3 resolution {}...", inputs.len(), resolution);
            println!("Workers: {}, Chunk size: {}", max_workers, chunk_size);

            let progress = ProgressReporter::new(inputs.len() as u64, "Aggregating files", cli.quiet);
            let (buckets, report) = FileAggregator::new(indexer, max_workers)
                .with_chunk_size(chunk_size)
                .aggregate_files(&inputs, Some(&progress))?;
            progress.finish_with_message(&format!("Built {} buckets", buckets.len()));

            println!("\n{}", report.summary());
            write_buckets(&buckets, &output_file)?;
            println!("Buckets written to {}", output_file.display());
            Ok(ExitCode::SUCCESS)
        }

        Commands::Unify {
            inputs,
            output_file,
            default_fill,
            fills,
            resolution,
            compression,
            chunk_size,
        } => {
            let mut plan = GapFillPlan::new(default_fill.parse()?);
            for raw in &fills {
                let (key, policy) = GapFillPlan::parse_override(raw)?;
                plan = plan.with_override(&key, policy);
            }

            let mut sources: BTreeMap<String, Vec<AggregationBucket>> = BTreeMap::new();
            for raw in &inputs {
                let (name, path) = parse_source_input(raw)?;
                let buckets = BucketReader::read(&path)?;
                info!(source = %name, path = %path.display(), buckets = buckets.len(), "Loaded buckets");
                sources.entry(name).or_default().extend(buckets);
            }

            let mut builder = UnifiedBuilder::new(plan);
            if let Some(r) = resolution {
                builder = builder.with_resolution(r);
            }
            let table = builder.build(&sources)?;

            println!("Unified table: {} rows, {} column groups", table.rows.len(), table.groups.len());
            for ((group, observed, filled), policy) in table.coverage().iter().zip(&table.policies) {
                println!(
                    "  {:<32} policy={:<12} observed={:<8} filled={}",
                    group.prefix(),
                    policy.to_string(),
                    observed,
                    filled
                );
            }

            let output_file = output_file
                .unwrap_or_else(|| generate_default_unified_filename(table.resolution, Utc::now()));
            if let Some(parent) = output_file.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }

            let is_parquet = output_file
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("parquet"));
            if is_parquet {
                let writer = ParquetWriter::new().with_compression(&compression)?;
                writer.write_unified(&table, &output_file, chunk_size)?;
                let file_info = writer.get_file_info(&output_file)?;
                println!("\n{}", file_info.summary());
            } else {
                let header = table.header();
                let header_refs: Vec<&str> = header.iter().map(String::as_str).collect();
                let mut writer = IncrementalCsvWriter::create(&output_file, &header_refs)?;
                for rows in table.rows.chunks(chunk_size.max(1)) {
                    let records: Vec<Vec<String>> = rows.iter().map(|r| table.row_fields(r)).collect();
                    writer.append_records(&records)?;
                }
            }
            println!("Unified table written to {}", output_file.display());
            Ok(ExitCode::SUCCESS)
        }

        Commands::Dedup { input, output_file } => {
            let dedup = crate::processors::Deduplicator::new();
            let report = match &output_file {
                Some(output) => dedup.deduplicate(&input, output)?,
                None => dedup.deduplicate_in_place(&input)?,
            };
            println!(
                "De-duplication: {} rows kept, {} duplicates removed, {} malformed rows dropped",
                report.rows_kept, report.duplicates_removed, report.rows_malformed
            );
            Ok(ExitCode::SUCCESS)
        }

        Commands::Checkpoints => {
            let store = CheckpointStore::new(&settings.paths.checkpoint_dir)?;
            let runs = store.list_runs()?;
            if runs.is_empty() {
                println!("No checkpoints in {}", store.dir().display());
                return Ok(ExitCode::SUCCESS);
            }

            println!("Checkpoints in {}:", store.dir().display());
            for checkpoint in runs {
                let size = std::fs::metadata(&checkpoint.output_file).map(|m| m.len()).ok();
                let saves = store.history().count_for(&checkpoint.run_key)?;
                println!("\n{}", checkpoint.run_key);
                println!(
                    "  Output: {} ({})",
                    checkpoint.output_file.display(),
                    match size {
                        Some(bytes) => format!("{:.1} MB", bytes as f64 / 1024.0 / 1024.0),
                        None => "missing".to_string(),
                    }
                );
                println!(
                    "  Progress: {}/{} locations ({:.1}%), {} pending after failures",
                    checkpoint.completed_locations.len(),
                    checkpoint.total_locations,
                    checkpoint.progress_percent(),
                    checkpoint.failed_locations.len()
                );
                println!(
                    "  Last saved: {} ({} save events)",
                    checkpoint.last_saved_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    saves
                );
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Info { file } => {
            println!("Analyzing Parquet file: {}", file.display());
            let writer = ParquetWriter::new();
            let file_info = writer.get_file_info(&file)?;
            println!("\n{}", file_info.summary());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    let installed = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).try_init()
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    installed.map_err(|e| ProcessingError::Config(format!("Logging setup failed: {}", e)))
}

fn build_source(
    name: &str,
    fixture: Option<&Path>,
    settings: &Settings,
) -> Result<(Source, Vec<Credential>)> {
    let rpm = settings.download.requests_per_minute;
    match name.to_lowercase().as_str() {
        "openaq" => {
            if settings.api_keys.is_empty() {
                return Err(ProcessingError::Config(
                    "No API keys configured (set ENVDATA__API_KEYS or api_keys in the settings file)"
                        .to_string(),
                ));
            }
            let client = OpenAqClient::new(&settings.api_base_url)?;
            Ok((
                Source::OpenAq(client),
                Credential::pool_from_keys(&settings.api_keys, rpm),
            ))
        }
        "fixture" => {
            let path = fixture.ok_or_else(|| {
                ProcessingError::Config("--source fixture needs --fixture <FILE>".to_string())
            })?;
            let source = FixtureSource::from_file(path)?;
            let pool = if settings.api_keys.is_empty() {
                warn!("No API keys configured; using one local credential for the fixture");
                vec![Credential::new("local", "", rpm)]
            } else {
                Credential::pool_from_keys(&settings.api_keys, rpm)
            };
            Ok((Source::Fixture(source), pool))
        }
        other => Err(ProcessingError::Config(format!(
            "Unknown source '{}' (expected openaq or fixture)",
            other
        ))),
    }
}

fn parse_source_input(raw: &str) -> Result<(String, PathBuf)> {
    match raw.split_once('=') {
        Some((name, path)) if !name.trim().is_empty() && !path.trim().is_empty() => {
            Ok((name.trim().to_string(), PathBuf::from(path.trim())))
        }
        _ => Err(ProcessingError::Config(format!(
            "Expected SOURCE=BUCKET_CSV, got '{}'",
            raw
        ))),
    }
}

fn write_buckets(buckets: &[AggregationBucket], path: &Path) -> Result<()> {
    let records: Vec<BucketRecord> = buckets.iter().map(BucketRecord::from).collect();
    let mut writer = IncrementalCsvWriter::create(path, &BUCKET_HEADER)?;
    writer.append(&records)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_source_input() {
        let (name, path) = parse_source_input("openaq=data/processed/a.csv").unwrap();
        assert_eq!(name, "openaq");
        assert_eq!(path, PathBuf::from("data/processed/a.csv"));
        assert!(parse_source_input("data.csv").is_err());
        assert!(parse_source_input("=data.csv").is_err());
    }
}
