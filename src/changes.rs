use rusqlite::{params, params_from_iter, types::Type, Connection, Row, ToSql};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

use crate::error::SitePulseError;
use crate::scans::Scan;
use crate::sites::Site;

#[derive(
    AsRefStr, EnumIter, EnumString, Debug, Display, PartialEq, Eq, Copy, Clone, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Added,
    Removed,
    Updated,
}

/// Per-scan delta counts
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCounts {
    pub added: i64,
    pub removed: i64,
    pub updated: i64,
}

impl ChangeCounts {
    pub fn total(&self) -> i64 {
        self.added + self.removed + self.updated
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn increment(&mut self, change_type: ChangeType) {
        match change_type {
            ChangeType::Added => self.added += 1,
            ChangeType::Removed => self.removed += 1,
            ChangeType::Updated => self.updated += 1,
        }
    }
}

/// Immutable record of one classified difference
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Change {
    pub change_id: i64,
    pub site_id: i64,
    pub scan_id: i64,
    pub url_id: Option<i64>,
    pub loc: Option<String>,
    pub change_type: ChangeType,
    pub detail: Option<String>,
    pub occurred_at: i64,
}

const SELECT_COLUMNS: &str =
    "change_id, site_id, scan_id, url_id, loc, change_type, detail, occurred_at";

impl Change {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let change_type: String = row.get(5)?;
        let change_type = change_type
            .parse::<ChangeType>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;

        Ok(Change {
            change_id: row.get(0)?,
            site_id: row.get(1)?,
            scan_id: row.get(2)?,
            url_id: row.get(3)?,
            loc: row.get(4)?,
            change_type,
            detail: row.get(6)?,
            occurred_at: row.get(7)?,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert_immediate(
        conn: &Connection,
        site_id: i64,
        scan_id: i64,
        url_id: i64,
        loc: &str,
        change_type: ChangeType,
        detail: &str,
        occurred_at: i64,
    ) -> Result<(), SitePulseError> {
        conn.execute(
            "INSERT INTO changes (site_id, scan_id, url_id, loc, change_type, detail, occurred_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                site_id,
                scan_id,
                url_id,
                loc,
                change_type.as_ref(),
                detail,
                occurred_at
            ],
        )?;
        Ok(())
    }

    pub fn list_for_scan(conn: &Connection, scan_id: i64) -> Result<Vec<Self>, SitePulseError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM changes WHERE scan_id = ? ORDER BY change_id ASC",
            SELECT_COLUMNS
        ))?;

        let changes = stmt
            .query_map([scan_id], Self::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(changes)
    }
}

/// Change history of one site, optionally narrowed by type and time window
#[derive(Debug, Clone, Default)]
pub struct ChangeQuery {
    pub site_id: i64,
    pub change_type: Option<ChangeType>,
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub limit: Option<i64>,
}

impl ChangeQuery {
    pub fn run(&self, conn: &Connection) -> Result<Vec<Change>, SitePulseError> {
        let mut sql = format!("SELECT {} FROM changes WHERE site_id = ?", SELECT_COLUMNS);
        let mut values: Vec<Box<dyn ToSql>> = vec![Box::new(self.site_id)];

        if let Some(change_type) = self.change_type {
            sql.push_str(" AND change_type = ?");
            values.push(Box::new(change_type.as_ref().to_owned()));
        }
        if let Some(from) = self.from {
            sql.push_str(" AND occurred_at >= ?");
            values.push(Box::new(from));
        }
        if let Some(to) = self.to {
            sql.push_str(" AND occurred_at <= ?");
            values.push(Box::new(to));
        }

        sql.push_str(" ORDER BY occurred_at DESC, change_id DESC LIMIT ?");
        values.push(Box::new(self.limit.unwrap_or(-1)));

        let mut stmt = conn.prepare(&sql)?;
        let changes = stmt
            .query_map(params_from_iter(values.iter()), Change::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(changes)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanDiffItem {
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    pub loc: Option<String>,
    pub detail: Option<String>,
    pub occurred_at: i64,
}

/// Per-scan change list with summary counts
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanDiff {
    pub scan_id: i64,
    pub site_id: i64,
    pub root_url: String,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub summary: ChangeCounts,
    pub items: Vec<ScanDiffItem>,
}

impl ScanDiff {
    /// Load the diff of `scan_id`, checking that it belongs to a site of `owner_id`
    pub fn for_scan(
        conn: &Connection,
        site_id: i64,
        scan_id: i64,
        owner_id: &str,
    ) -> Result<Self, SitePulseError> {
        let site = Site::get_for_owner(conn, site_id, owner_id)?;

        let scan = match Scan::get_by_id(conn, scan_id)? {
            Some(scan) if scan.site_id == site.site_id => scan,
            _ => return Err(SitePulseError::NotFound(format!("Scan {} not found", scan_id))),
        };

        let mut summary = ChangeCounts::default();
        let items = Change::list_for_scan(conn, scan_id)?
            .into_iter()
            .map(|change| {
                summary.increment(change.change_type);
                ScanDiffItem {
                    change_type: change.change_type,
                    loc: change.loc,
                    detail: change.detail,
                    occurred_at: change.occurred_at,
                }
            })
            .collect();

        Ok(ScanDiff {
            scan_id,
            site_id: site.site_id,
            root_url: site.root_url,
            started_at: scan.started_at,
            finished_at: scan.finished_at,
            summary,
            items,
        })
    }
}
