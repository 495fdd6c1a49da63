//! Batch ingestion: one pass over the archive window for every site.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use weather_etl::config::Config;
use weather_etl::logging::{self, Component, LogLevel};
use weather_etl::model::{IngestMode, SetupError};
use weather_etl::pipeline::{EXIT_SETUP_FAILURE, Pipeline};
use weather_etl::sites::SiteRegistry;

#[derive(Parser)]
#[command(name = "etl_batch")]
#[command(about = "Ingest the archive window for every registered site", long_about = None)]
struct Args {
    /// Fetch and normalize, but write nothing to the store
    #[arg(long)]
    dry_run: bool,

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
    if let Some(path) = args.sites {
        config.sites_file = path;
    }
    logging::init_logger(config.log_level, config.log_file.as_deref());

    let registry = SiteRegistry::load(&config.sites_file)?;
    logging::info(
        Component::System,
        None,
        &format!(
            "Loaded {} site(s) from {}, archive window {} to {}",
            registry.len(),
            config.sites_file.display(),
            config.archive_window.start,
            config.archive_window.end
        ),
    );

    let pipeline = Pipeline::from_config(&config, IngestMode::Batch)?;
    let summary = pipeline.run_cycle(registry.sites());
    summary.log();

    Ok(summary.exit_code())
}
