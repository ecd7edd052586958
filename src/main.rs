use clap::Parser;
use envdata_collector::cli::{run, Cli};
use envdata_collector::error::Result;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    run(cli).await
}
