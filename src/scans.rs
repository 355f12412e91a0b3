use log::{info, warn};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::changes::ChangeCounts;
use crate::database::Database;
use crate::error::SitePulseError;
use crate::sites::Site;

/// Lifecycle state of a scan. Stored as an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i64)]
pub enum ScanStatus {
    Queued = 0,
    Running = 1,
    Success = 2,
    Failed = 3,
}

impl ScanStatus {
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Queued),
            1 => Some(Self::Running),
            2 => Some(Self::Success),
            3 => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_i64(self) -> i64 {
        self as i64
    }

    /// Queued and running scans hold the site's single active slot
    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// Terminal result handed to [`Scan::complete`]
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    Success(ChangeCounts),
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueStatus {
    Queued,
    AlreadyQueued,
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnqueueResult {
    pub scan_id: i64,
    pub status: EnqueueStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Scan {
    pub scan_id: i64,
    pub site_id: i64,
    pub status: ScanStatus,
    pub queued_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub error: Option<String>,
    pub added_count: Option<i64>,
    pub removed_count: Option<i64>,
    pub updated_count: Option<i64>,
}

const SELECT_COLUMNS: &str = "scan_id, site_id, status, queued_at, started_at, finished_at, error,
    added_count, removed_count, updated_count";

impl Scan {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let status_value: i64 = row.get(2)?;
        let status = ScanStatus::from_i64(status_value)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(2, status_value))?;

        Ok(Scan {
            scan_id: row.get(0)?,
            site_id: row.get(1)?,
            status,
            queued_at: row.get(3)?,
            started_at: row.get(4)?,
            finished_at: row.get(5)?,
            error: row.get(6)?,
            added_count: row.get(7)?,
            removed_count: row.get(8)?,
            updated_count: row.get(9)?,
        })
    }

    pub fn change_counts(&self) -> Option<ChangeCounts> {
        match (self.added_count, self.removed_count, self.updated_count) {
            (Some(added), Some(removed), Some(updated)) => Some(ChangeCounts {
                added,
                removed,
                updated,
            }),
            _ => None,
        }
    }

    pub fn get_by_id(conn: &Connection, scan_id: i64) -> Result<Option<Self>, SitePulseError> {
        conn.query_row(
            &format!("SELECT {} FROM scans WHERE scan_id = ?", SELECT_COLUMNS),
            [scan_id],
            Self::from_row,
        )
        .optional()
        .map_err(SitePulseError::DatabaseError)
    }

    /// The queued or running scan of a site, if any
    pub fn active_for_site(conn: &Connection, site_id: i64) -> Result<Option<Self>, SitePulseError> {
        conn.query_row(
            &format!(
                "SELECT {} FROM scans WHERE site_id = ? AND status IN (?, ?)",
                SELECT_COLUMNS
            ),
            params![
                site_id,
                ScanStatus::Queued.as_i64(),
                ScanStatus::Running.as_i64()
            ],
            Self::from_row,
        )
        .optional()
        .map_err(SitePulseError::DatabaseError)
    }

    /// Scan history of a site, newest first
    pub fn list_for_site(
        conn: &Connection,
        site_id: i64,
        limit: i64,
    ) -> Result<Vec<Self>, SitePulseError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM scans WHERE site_id = ? ORDER BY scan_id DESC LIMIT ?",
            SELECT_COLUMNS
        ))?;

        let scans = stmt
            .query_map(params![site_id, limit], Self::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(scans)
    }

    pub fn count_running(conn: &Connection) -> Result<i64, SitePulseError> {
        let count = conn.query_row(
            "SELECT COUNT(*) FROM scans WHERE status = ?",
            [ScanStatus::Running.as_i64()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Queued scan ids in dispatch order: site priority, then queue age, then id
    pub fn claimable_queued(conn: &Connection, limit: i64) -> Result<Vec<i64>, SitePulseError> {
        let mut stmt = conn.prepare(
            "SELECT scans.scan_id
             FROM scans
             JOIN sites ON sites.site_id = scans.site_id
             WHERE scans.status = ?
             ORDER BY sites.scan_priority ASC, scans.queued_at ASC, scans.scan_id ASC
             LIMIT ?",
        )?;

        let ids = stmt
            .query_map(params![ScanStatus::Queued.as_i64(), limit], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;

        Ok(ids)
    }

    /// Queue a scan for a site unless one is already queued or running.
    ///
    /// Returns the id of the new scan, or of the existing active scan.
    pub fn enqueue(conn: &Connection, site_id: i64) -> Result<EnqueueResult, SitePulseError> {
        Database::immediate_transaction(conn, |c| Self::enqueue_immediate(c, site_id))
    }

    pub fn enqueue_immediate(
        conn: &Connection,
        site_id: i64,
    ) -> Result<EnqueueResult, SitePulseError> {
        let site_exists = conn
            .query_row("SELECT 1 FROM sites WHERE site_id = ?", [site_id], |_| Ok(()))
            .optional()?
            .is_some();

        if !site_exists {
            return Err(SitePulseError::NotFound(format!("Site {} not found", site_id)));
        }

        if let Some(active) = Self::active_for_site(conn, site_id)? {
            let status = match active.status {
                ScanStatus::Running => EnqueueStatus::AlreadyRunning,
                _ => EnqueueStatus::AlreadyQueued,
            };
            return Ok(EnqueueResult {
                scan_id: active.scan_id,
                status,
            });
        }

        let scan_id: i64 = conn.query_row(
            "INSERT INTO scans (site_id, status, queued_at) VALUES (?, ?, ?) RETURNING scan_id",
            params![
                site_id,
                ScanStatus::Queued.as_i64(),
                chrono::Utc::now().timestamp()
            ],
            |row| row.get(0),
        )?;

        Ok(EnqueueResult {
            scan_id,
            status: EnqueueStatus::Queued,
        })
    }

    /// Claim a queued scan: queued -> running.
    ///
    /// A single conditional update, so two dispatchers racing on the same scan
    /// see exactly one success and one Conflict.
    pub fn start(conn: &Connection, scan_id: i64) -> Result<Self, SitePulseError> {
        let started = conn
            .query_row(
                &format!(
                    "UPDATE scans SET status = ?, started_at = ?
                     WHERE scan_id = ? AND status = ?
                     RETURNING {}",
                    SELECT_COLUMNS
                ),
                params![
                    ScanStatus::Running.as_i64(),
                    chrono::Utc::now().timestamp(),
                    scan_id,
                    ScanStatus::Queued.as_i64()
                ],
                Self::from_row,
            )
            .optional()?;

        match started {
            Some(scan) => Ok(scan),
            None => Err(Self::transition_error(conn, scan_id, ScanStatus::Queued)?),
        }
    }

    /// Finish a running scan: running -> success/failed. Also stamps the site's `last_scan_at`.
    pub fn complete(
        conn: &Connection,
        scan_id: i64,
        outcome: &ScanOutcome,
    ) -> Result<Self, SitePulseError> {
        Database::immediate_transaction(conn, |c| Self::complete_immediate(c, scan_id, outcome))
    }

    pub fn complete_immediate(
        conn: &Connection,
        scan_id: i64,
        outcome: &ScanOutcome,
    ) -> Result<Self, SitePulseError> {
        let now = chrono::Utc::now().timestamp();

        let (status, error, counts) = match outcome {
            ScanOutcome::Success(counts) => (ScanStatus::Success, None, Some(*counts)),
            ScanOutcome::Failed(message) => (ScanStatus::Failed, Some(message.as_str()), None),
        };

        let completed = conn
            .query_row(
                &format!(
                    "UPDATE scans SET status = ?, finished_at = ?, error = ?,
                        added_count = ?, removed_count = ?, updated_count = ?
                     WHERE scan_id = ? AND status = ?
                     RETURNING {}",
                    SELECT_COLUMNS
                ),
                params![
                    status.as_i64(),
                    now,
                    error,
                    counts.map(|c| c.added),
                    counts.map(|c| c.removed),
                    counts.map(|c| c.updated),
                    scan_id,
                    ScanStatus::Running.as_i64()
                ],
                Self::from_row,
            )
            .optional()?;

        let scan = match completed {
            Some(scan) => scan,
            None => return Err(Self::transition_error(conn, scan_id, ScanStatus::Running)?),
        };

        Site::set_last_scan_at(conn, scan.site_id, now)?;

        Ok(scan)
    }

    /// Force-fail every scan that has been running longer than `timeout_minutes`
    pub fn reap_stuck(conn: &Connection, timeout_minutes: i64) -> Result<Vec<Self>, SitePulseError> {
        Self::reap_stuck_at(conn, timeout_minutes, chrono::Utc::now().timestamp())
    }

    pub fn reap_stuck_at(
        conn: &Connection,
        timeout_minutes: i64,
        now: i64,
    ) -> Result<Vec<Self>, SitePulseError> {
        let cutoff = now - timeout_minutes * 60;
        let message = SitePulseError::Timeout(timeout_minutes).to_string();

        let mut stmt = conn.prepare(&format!(
            "UPDATE scans SET status = ?, finished_at = ?, error = ?
             WHERE status = ? AND started_at < ?
             RETURNING {}",
            SELECT_COLUMNS
        ))?;

        let reaped = stmt
            .query_map(
                params![
                    ScanStatus::Failed.as_i64(),
                    now,
                    message,
                    ScanStatus::Running.as_i64(),
                    cutoff
                ],
                Self::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        for scan in &reaped {
            warn!(
                "Reaped stuck scan {} for site {} (started at {:?})",
                scan.scan_id, scan.site_id, scan.started_at
            );
        }

        if !reaped.is_empty() {
            info!("Reaped {} stuck scan(s)", reaped.len());
        }

        Ok(reaped)
    }

    /// Record the zero-change baseline scan created when a site is discovered
    pub fn insert_baseline_immediate(
        conn: &Connection,
        site_id: i64,
        now: i64,
    ) -> Result<i64, SitePulseError> {
        let scan_id = conn.query_row(
            "INSERT INTO scans (
                site_id, status, queued_at, started_at, finished_at,
                added_count, removed_count, updated_count
            ) VALUES (?, ?, ?, ?, ?, 0, 0, 0)
            RETURNING scan_id",
            params![site_id, ScanStatus::Success.as_i64(), now, now, now],
            |row| row.get(0),
        )?;
        Ok(scan_id)
    }

    fn transition_error(
        conn: &Connection,
        scan_id: i64,
        expected: ScanStatus,
    ) -> Result<SitePulseError, SitePulseError> {
        Ok(match Self::get_by_id(conn, scan_id)? {
            Some(scan) => SitePulseError::Conflict(format!(
                "Scan {} is {}, expected {}",
                scan_id,
                scan.status.name(),
                expected.name()
            )),
            None => SitePulseError::NotFound(format!("Scan {} not found", scan_id)),
        })
    }
}
