use clap::Parser;
use std::process;

use dexport::{cli, crawl::WalkOutcome, services};

#[tokio::main]
async fn main() {
    let args = cli::Args::parse();

    env_logger::Builder::from_default_env()
        .filter_level(args.log_level.into())
        .format_timestamp_secs()
        .init();

    match services::run(args).await {
        Ok(summary) if summary.outcome == WalkOutcome::Completed => {}
        Ok(_) => process::exit(130),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    }
}
