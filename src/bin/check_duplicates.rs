//! Duplicate auditor: exits 0 when every natural key is unique, 2 when
//! duplicates exist, 1 when the store cannot be reached or queried.

use std::process::ExitCode;

use clap::Parser;

use weather_etl::audit::{self, EXIT_SETUP_FAILURE};
use weather_etl::config::Config;
use weather_etl::logging::{self, Component, LogLevel};
use weather_etl::model::SetupError;
use weather_etl::store::postgres::PgStore;

#[derive(Parser)]
#[command(name = "check_duplicates")]
#[command(
    about = "Verify no (site_id, source, observation_time) appears twice in the store",
    long_about = None
)]
struct Args {}

fn main() -> ExitCode {
    let _ = Args::parse();
    logging::init_logger(LogLevel::Info, None);

    match run() {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            logging::error(Component::Audit, None, &format!("Audit could not run: {}", e));
            ExitCode::from(EXIT_SETUP_FAILURE)
        }
    }
}

fn run() -> Result<u8, SetupError> {
    let config = Config::from_env()?;
    logging::init_logger(config.log_level, config.log_file.as_deref());

    let store = PgStore::connect(
        config.require_database_url()?,
        &config.table,
        &config.actor,
        1,
        config.request_timeout,
    )?;
    let verdict = audit::audit(&store)?;
    print!("{}", audit::render_report(store.table(), &verdict));

    Ok(verdict.exit_code())
}
