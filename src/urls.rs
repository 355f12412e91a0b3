use std::collections::HashMap;

use rusqlite::{params, params_from_iter, Connection, Row, ToSql};
use serde::Serialize;

use crate::error::SitePulseError;
use crate::fetcher::SitemapUrl;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(i64)]
pub enum UrlStatus {
    Active = 0,
    Removed = 1,
}

impl UrlStatus {
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Active),
            1 => Some(Self::Removed),
            _ => None,
        }
    }

    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

/// Stored observation of one sitemap location
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UrlRecord {
    pub url_id: i64,
    pub site_id: i64,
    pub loc: String,
    pub status: UrlStatus,
    pub changefreq: Option<String>,
    pub priority: Option<String>,
    pub lastmod: Option<String>,
    pub first_seen_at: i64,
    pub last_seen_at: i64,
}

const SELECT_COLUMNS: &str =
    "url_id, site_id, loc, status, changefreq, priority, lastmod, first_seen_at, last_seen_at";

impl UrlRecord {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let status_value: i64 = row.get(3)?;
        let status = UrlStatus::from_i64(status_value)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(3, status_value))?;

        Ok(UrlRecord {
            url_id: row.get(0)?,
            site_id: row.get(1)?,
            loc: row.get(2)?,
            status,
            changefreq: row.get(4)?,
            priority: row.get(5)?,
            lastmod: row.get(6)?,
            first_seen_at: row.get(7)?,
            last_seen_at: row.get(8)?,
        })
    }

    pub fn is_active(&self) -> bool {
        self.status == UrlStatus::Active
    }

    /// All records of a site, active and removed, keyed by location
    pub fn load_for_site(
        conn: &Connection,
        site_id: i64,
    ) -> Result<HashMap<String, UrlRecord>, SitePulseError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM urls WHERE site_id = ?",
            SELECT_COLUMNS
        ))?;

        let mut records = HashMap::new();
        for record in stmt.query_map([site_id], Self::from_row)? {
            let record = record?;
            records.insert(record.loc.clone(), record);
        }

        Ok(records)
    }

    pub fn count_active(conn: &Connection, site_id: i64) -> Result<i64, SitePulseError> {
        let count = conn.query_row(
            "SELECT COUNT(*) FROM urls WHERE site_id = ? AND status = ?",
            params![site_id, UrlStatus::Active.as_i64()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn insert_immediate(
        conn: &Connection,
        site_id: i64,
        url: &SitemapUrl,
        now: i64,
    ) -> Result<i64, SitePulseError> {
        let url_id = conn.query_row(
            "INSERT INTO urls (
                site_id, loc, status, changefreq, priority, lastmod, first_seen_at, last_seen_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING url_id",
            params![
                site_id,
                url.loc,
                UrlStatus::Active.as_i64(),
                url.changefreq,
                url.priority,
                url.lastmod,
                now,
                now
            ],
            |row| row.get(0),
        )?;
        Ok(url_id)
    }

    /// Bring a removed record back. `first_seen_at` restarts because this is a new appearance.
    pub fn reactivate_immediate(
        conn: &Connection,
        url_id: i64,
        url: &SitemapUrl,
        now: i64,
    ) -> Result<(), SitePulseError> {
        conn.execute(
            "UPDATE urls SET status = ?, changefreq = ?, priority = ?, lastmod = ?,
                first_seen_at = ?, last_seen_at = ?
             WHERE url_id = ?",
            params![
                UrlStatus::Active.as_i64(),
                url.changefreq,
                url.priority,
                url.lastmod,
                now,
                now,
                url_id
            ],
        )?;
        Ok(())
    }

    pub fn mark_removed_immediate(conn: &Connection, url_id: i64) -> Result<(), SitePulseError> {
        conn.execute(
            "UPDATE urls SET status = ? WHERE url_id = ?",
            params![UrlStatus::Removed.as_i64(), url_id],
        )?;
        Ok(())
    }

    /// Refresh a re-observed record. Hints are overwritten with the fetched values.
    pub fn observe_immediate(
        conn: &Connection,
        url_id: i64,
        url: &SitemapUrl,
        now: i64,
    ) -> Result<(), SitePulseError> {
        conn.execute(
            "UPDATE urls SET changefreq = ?, priority = ?, lastmod = ?, last_seen_at = ?
             WHERE url_id = ?",
            params![url.changefreq, url.priority, url.lastmod, now, url_id],
        )?;
        Ok(())
    }
}

/// URLs first seen inside a time window
#[derive(Debug, Clone, Default)]
pub struct NewUrlsQuery {
    pub owner_id: String,
    pub from: i64,
    pub to: i64,
    pub site_id: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewUrl {
    pub url_id: i64,
    pub site_id: i64,
    pub root_url: String,
    pub loc: String,
    pub changefreq: Option<String>,
    pub priority: Option<String>,
    pub first_seen_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SiteUrlCount {
    pub site_id: i64,
    pub root_url: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewUrlsReport {
    pub urls: Vec<NewUrl>,
    pub total_count: i64,
    pub site_stats: Vec<SiteUrlCount>,
}

impl NewUrlsQuery {
    pub fn run(&self, conn: &Connection) -> Result<NewUrlsReport, SitePulseError> {
        let mut where_clause =
            String::from("sites.owner_id = ? AND urls.first_seen_at >= ? AND urls.first_seen_at <= ?");
        let mut values: Vec<Box<dyn ToSql>> = vec![
            Box::new(self.owner_id.clone()),
            Box::new(self.from),
            Box::new(self.to),
        ];

        if let Some(site_id) = self.site_id {
            where_clause.push_str(" AND urls.site_id = ?");
            values.push(Box::new(site_id));
        }

        let from_clause = "FROM urls JOIN sites ON sites.site_id = urls.site_id";

        let total_count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) {} WHERE {}", from_clause, where_clause),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT urls.url_id, urls.site_id, sites.root_url, urls.loc, urls.changefreq,
                urls.priority, urls.first_seen_at
             {} WHERE {}
             ORDER BY urls.first_seen_at DESC, urls.url_id DESC
             LIMIT {}",
            from_clause,
            where_clause,
            self.limit.unwrap_or(-1)
        ))?;
        let urls = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok(NewUrl {
                    url_id: row.get(0)?,
                    site_id: row.get(1)?,
                    root_url: row.get(2)?,
                    loc: row.get(3)?,
                    changefreq: row.get(4)?,
                    priority: row.get(5)?,
                    first_seen_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT urls.site_id, sites.root_url, COUNT(*) AS count
             {} WHERE {}
             GROUP BY urls.site_id, sites.root_url
             ORDER BY count DESC, urls.site_id ASC",
            from_clause, where_clause
        ))?;
        let site_stats = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok(SiteUrlCount {
                    site_id: row.get(0)?,
                    root_url: row.get(1)?,
                    count: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(NewUrlsReport {
            urls,
            total_count,
            site_stats,
        })
    }
}
