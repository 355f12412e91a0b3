mod changes;
mod channels;
mod cli;
mod config;
mod database;
mod diff;
mod discovery;
mod error;
mod fetcher;
mod logging;
mod notify;
mod scan_manager;
mod scan_task;
mod scans;
mod schema;
mod service;
mod sites;
mod urls;

#[cfg(test)]
mod test_support;

use cli::Cli;
use config::{Config, CONFIG};
use directories::ProjectDirs;
use log::{error, info};

fn main() {
    let Some(project_dirs) = ProjectDirs::from("", "", "sitepulse") else {
        eprintln!("Could not determine project directories");
        std::process::exit(1);
    };

    let config = Config::load_config(&project_dirs);
    let log_dir = project_dirs.data_local_dir().join("logs");

    // The handle must outlive every log call
    let _logger = match logging::init_logging(&config.logging, &log_dir) {
        Ok(handle) => Some(handle),
        Err(e) => {
            eprintln!("Logging disabled: {}", e);
            None
        }
    };

    if CONFIG.set(config).is_err() {
        eprintln!("Configuration was already initialized");
    }

    info!("sitepulse {} starting", env!("CARGO_PKG_VERSION"));

    if let Err(err) = Cli::handle_command_line(&project_dirs) {
        error!("{:?}", err);
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }
}
