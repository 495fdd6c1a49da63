//! Streaming ingestion: forecast cycles repeated on an interval until
//! interrupted. Without an interval, exactly one cycle runs.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use weather_etl::config::Config;
use weather_etl::logging::{self, Component, LogLevel};
use weather_etl::model::{IngestMode, SetupError};
use weather_etl::pipeline::{CancelToken, EXIT_SETUP_FAILURE, Pipeline};
use weather_etl::sites::SiteRegistry;

#[derive(Parser)]
#[command(name = "etl_streaming")]
#[command(about = "Ingest short-horizon forecasts for every registered site", long_about = None)]
struct Args {
    /// Fetch and normalize, but write nothing to the store
    #[arg(long)]
    dry_run: bool,

    /// Seconds between cycle starts (overrides STREAMING_INTERVAL)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    interval: Option<u64>,

    /// Site registry document (overrides SITES_FILE)
    #[arg(long)]
    sites: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    logging::init_logger(LogLevel::Info, None);

    match run(args) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            logging::error(Component::System, None, &format!("Setup failed: {}", e));
            ExitCode::from(EXIT_SETUP_FAILURE)
        }
    }
}

fn run(args: Args) -> Result<u8, SetupError> {
    let mut config = Config::from_env()?;
    config.dry_run |= args.dry_run;
    if let Some(secs) = args.interval {
        config.streaming_interval = Some(Duration::from_secs(secs));
    }
    if let Some(path) = args.sites {
        config.sites_file = path;
    }
    logging::init_logger(config.log_level, config.log_file.as_deref());

    let registry = SiteRegistry::load(&config.sites_file)?;
    let pipeline = Pipeline::from_config(&config, IngestMode::Streaming)?;

    let cancel = CancelToken::new();
    ctrlc::set_handler({
        let cancel = cancel.clone();
        move || {
            logging::info(Component::System, None, "Received Ctrl+C, finishing current cycle");
            cancel.cancel();
        }
    })
    .map_err(|e| SetupError::Signal(e.to_string()))?;

    match config.streaming_interval {
        Some(interval) => logging::info(
            Component::System,
            None,
            &format!("Streaming {} site(s) every {}s", registry.len(), interval.as_secs()),
        ),
        None => logging::info(
            Component::System,
            None,
            &format!("Streaming {} site(s), single cycle", registry.len()),
        ),
    }

    let last = pipeline.run_streaming(
        registry.sites(),
        config.streaming_interval,
        &cancel,
        |summary| summary.log(),
    );

    Ok(last.exit_code())
}
