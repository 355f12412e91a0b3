use std::path::Path;

use flexi_logger::{Age, Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming};

use crate::config::LoggingConfig;
use crate::error::SitePulseError;

const LOG_BASENAME: &str = "sitepulse";
const KEEP_LOG_FILES: usize = 14;

/// Start file logging into `log_dir`. Keep the returned handle alive for the life of the process.
pub fn init_logging(config: &LoggingConfig, log_dir: &Path) -> Result<LoggerHandle, SitePulseError> {
    let handle = Logger::try_with_str(config.log_spec())
        .map_err(|e| SitePulseError::Error(format!("Invalid log specification: {}", e)))?
        .log_to_file(FileSpec::default().directory(log_dir).basename(LOG_BASENAME))
        .format_for_files(flexi_logger::detailed_format)
        .rotate(
            Criterion::Age(Age::Day),
            Naming::Timestamps,
            Cleanup::KeepLogFiles(KEEP_LOG_FILES),
        )
        .duplicate_to_stderr(Duplicate::Warn)
        .start()
        .map_err(|e| SitePulseError::Error(format!("Failed to start logger: {}", e)))?;

    Ok(handle)
}
