use rusqlite::Error as RusqliteError;
use std::io;
use thiserror::Error;

use crate::fetcher::FetchError;

#[derive(Error, Debug)]
pub enum SitePulseError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error), // Converts io::Error into SitePulseError automatically

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError), // Converts rusqlite::Error automatically

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    /// A state transition was attempted on a scan that is not in the expected source state
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The target site, scan, or channel does not exist or is not owned by the caller
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Fetch failed: {0}")]
    FetchFailure(#[from] FetchError),

    #[error("Delivery failed: {0}")]
    DeliveryFailure(String),

    #[error("Scan timeout - exceeded {0} minutes")]
    Timeout(i64),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Error: {0}")]
    Error(String), // Allows custom application errors
}

impl SitePulseError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, SitePulseError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SitePulseError::NotFound(_))
    }
}
