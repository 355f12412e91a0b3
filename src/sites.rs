use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, ToSql};
use serde::{Deserialize, Serialize};

use crate::error::SitePulseError;

pub const MIN_SCAN_PRIORITY: i64 = 1;
pub const MAX_SCAN_PRIORITY: i64 = 5;
pub const DEFAULT_SCAN_PRIORITY: i64 = 3;

pub const MIN_SCAN_INTERVAL_MINUTES: i64 = 5;
pub const MAX_SCAN_INTERVAL_MINUTES: i64 = 10080;
pub const DEFAULT_SCAN_INTERVAL_MINUTES: i64 = 1440;

const SELECT_COLUMNS: &str = "site_id, owner_id, root_url, sitemap_url, enabled, scan_priority,
    scan_interval_minutes, last_scan_at, group_id, tags, created_at, updated_at";

/// A monitored website
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub site_id: i64,
    pub owner_id: String,
    pub root_url: String,
    pub sitemap_url: Option<String>,
    pub enabled: bool,
    pub scan_priority: i64,
    pub scan_interval_minutes: i64,
    pub last_scan_at: Option<i64>,
    pub group_id: Option<i64>,
    pub tags: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Parameters for creating a new site
#[derive(Debug, Clone, Default)]
pub struct NewSite {
    pub owner_id: String,
    pub root_url: String,
    pub sitemap_url: Option<String>,
    pub tags: Vec<String>,
    pub scan_priority: Option<i64>,
    pub scan_interval_minutes: Option<i64>,
    pub group_id: Option<i64>,
}

/// Partial update of a site. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct SitePatch {
    pub root_url: Option<String>,
    pub sitemap_url: Option<Option<String>>,
    pub enabled: Option<bool>,
    pub tags: Option<Vec<String>>,
    pub scan_priority: Option<i64>,
    pub scan_interval_minutes: Option<i64>,
    pub group_id: Option<Option<i64>>,
}

impl SitePatch {
    pub fn is_empty(&self) -> bool {
        self.root_url.is_none()
            && self.sitemap_url.is_none()
            && self.enabled.is_none()
            && self.tags.is_none()
            && self.scan_priority.is_none()
            && self.scan_interval_minutes.is_none()
            && self.group_id.is_none()
    }
}

/// How tag filters are matched against a site's tag list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagMatch {
    /// Substring match against the serialized tag list (`"news"` also matches `"newsletter"`)
    #[default]
    Substring,
    /// Exact membership of the tag in the list
    Exact,
}

/// Candidate filter for bulk operations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiteFilter {
    #[serde(default)]
    pub tags: Vec<String>,
    pub group_id: Option<i64>,
}

impl SiteFilter {
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.group_id.is_none()
    }
}

/// A site selected by the due-site pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DueSite {
    pub site_id: i64,
    pub root_url: String,
    pub scan_priority: i64,
    pub overdue_seconds: i64,
}

impl Site {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let tags: Option<String> = row.get(9)?;
        Ok(Site {
            site_id: row.get(0)?,
            owner_id: row.get(1)?,
            root_url: row.get(2)?,
            sitemap_url: row.get(3)?,
            enabled: row.get(4)?,
            scan_priority: row.get(5)?,
            scan_interval_minutes: row.get(6)?,
            last_scan_at: row.get(7)?,
            group_id: row.get(8)?,
            tags: parse_tags(tags.as_deref()),
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    pub fn create(conn: &Connection, new_site: &NewSite) -> Result<Self, SitePulseError> {
        let scan_priority = new_site.scan_priority.unwrap_or(DEFAULT_SCAN_PRIORITY);
        let scan_interval_minutes = new_site
            .scan_interval_minutes
            .unwrap_or(DEFAULT_SCAN_INTERVAL_MINUTES);
        validate_priority(scan_priority)?;
        validate_interval(scan_interval_minutes)?;
        if let Some(group_id) = new_site.group_id {
            Self::ensure_group_owner(conn, group_id, &new_site.owner_id)?;
        }

        let now = chrono::Utc::now().timestamp();
        let tags = normalize_tags(&new_site.tags);

        let site_id: i64 = conn.query_row(
            "INSERT INTO sites (
                owner_id, root_url, sitemap_url, enabled, scan_priority, scan_interval_minutes,
                last_scan_at, group_id, tags, created_at, updated_at
            ) VALUES (?, ?, ?, 1, ?, ?, NULL, ?, ?, ?, ?)
            RETURNING site_id",
            params![
                new_site.owner_id,
                new_site.root_url,
                new_site.sitemap_url,
                scan_priority,
                scan_interval_minutes,
                new_site.group_id,
                tags_to_column(&tags),
                now,
                now,
            ],
            |row| row.get(0),
        )?;

        Ok(Site {
            site_id,
            owner_id: new_site.owner_id.clone(),
            root_url: new_site.root_url.clone(),
            sitemap_url: new_site.sitemap_url.clone(),
            enabled: true,
            scan_priority,
            scan_interval_minutes,
            last_scan_at: None,
            group_id: new_site.group_id,
            tags,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_by_id(conn: &Connection, site_id: i64) -> Result<Option<Self>, SitePulseError> {
        conn.query_row(
            &format!("SELECT {} FROM sites WHERE site_id = ?", SELECT_COLUMNS),
            [site_id],
            Self::from_row,
        )
        .optional()
        .map_err(SitePulseError::DatabaseError)
    }

    /// Load a site, failing with NotFound unless it exists and belongs to `owner_id`
    pub fn get_for_owner(
        conn: &Connection,
        site_id: i64,
        owner_id: &str,
    ) -> Result<Self, SitePulseError> {
        match Self::get_by_id(conn, site_id)? {
            Some(site) if site.owner_id == owner_id => Ok(site),
            _ => Err(SitePulseError::NotFound(format!("Site {} not found", site_id))),
        }
    }

    pub fn list_for_owner(conn: &Connection, owner_id: &str) -> Result<Vec<Self>, SitePulseError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sites WHERE owner_id = ? ORDER BY created_at DESC, site_id DESC",
            SELECT_COLUMNS
        ))?;

        let sites = stmt
            .query_map([owner_id], Self::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(sites)
    }

    /// Enabled sites of an owner, narrowed by `filter`.
    ///
    /// Tags are OR'ed together; a group filter is AND'ed with the tag condition.
    pub fn list_filtered(
        conn: &Connection,
        owner_id: &str,
        filter: &SiteFilter,
        tag_match: TagMatch,
    ) -> Result<Vec<Self>, SitePulseError> {
        let mut sql = format!(
            "SELECT {} FROM sites WHERE owner_id = ? AND enabled = 1",
            SELECT_COLUMNS
        );
        let mut values: Vec<Box<dyn ToSql>> = vec![Box::new(owner_id.to_owned())];

        let tags = normalize_tags(&filter.tags);
        if !tags.is_empty() {
            let condition = match tag_match {
                TagMatch::Substring => "tags LIKE '%' || ? || '%'",
                TagMatch::Exact => {
                    "EXISTS (SELECT 1 FROM json_each(sites.tags) WHERE json_each.value = ?)"
                }
            };
            let clauses = vec![condition; tags.len()].join(" OR ");
            sql.push_str(&format!(" AND ({})", clauses));
            for tag in tags {
                values.push(Box::new(tag));
            }
        }

        if let Some(group_id) = filter.group_id {
            sql.push_str(" AND group_id = ?");
            values.push(Box::new(group_id));
        }

        sql.push_str(" ORDER BY created_at DESC, site_id DESC");

        let mut stmt = conn.prepare(&sql)?;
        let sites = stmt
            .query_map(params_from_iter(values.iter()), Self::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(sites)
    }

    /// Apply a validated patch and return the updated site
    pub fn update(
        conn: &Connection,
        site_id: i64,
        patch: &SitePatch,
    ) -> Result<Self, SitePulseError> {
        if patch.is_empty() {
            return Err(SitePulseError::InvalidInput("no updates provided".to_string()));
        }
        if let Some(priority) = patch.scan_priority {
            validate_priority(priority)?;
        }
        if let Some(interval) = patch.scan_interval_minutes {
            validate_interval(interval)?;
        }

        let mut site = Self::get_by_id(conn, site_id)?
            .ok_or_else(|| SitePulseError::NotFound(format!("Site {} not found", site_id)))?;

        if let Some(root_url) = &patch.root_url {
            site.root_url = root_url.clone();
        }
        if let Some(sitemap_url) = &patch.sitemap_url {
            site.sitemap_url = sitemap_url.clone();
        }
        if let Some(enabled) = patch.enabled {
            site.enabled = enabled;
        }
        if let Some(tags) = &patch.tags {
            site.tags = normalize_tags(tags);
        }
        if let Some(priority) = patch.scan_priority {
            site.scan_priority = priority;
        }
        if let Some(interval) = patch.scan_interval_minutes {
            site.scan_interval_minutes = interval;
        }
        if let Some(group_id) = patch.group_id {
            if let Some(group_id) = group_id {
                Self::ensure_group_owner(conn, group_id, &site.owner_id)?;
            }
            site.group_id = group_id;
        }
        site.updated_at = chrono::Utc::now().timestamp();

        conn.execute(
            "UPDATE sites SET
                root_url = ?, sitemap_url = ?, enabled = ?, tags = ?, scan_priority = ?,
                scan_interval_minutes = ?, group_id = ?, updated_at = ?
            WHERE site_id = ?",
            params![
                site.root_url,
                site.sitemap_url,
                site.enabled,
                tags_to_column(&site.tags),
                site.scan_priority,
                site.scan_interval_minutes,
                site.group_id,
                site.updated_at,
                site_id,
            ],
        )?;

        Ok(site)
    }

    pub fn set_last_scan_at(
        conn: &Connection,
        site_id: i64,
        timestamp: i64,
    ) -> Result<(), SitePulseError> {
        conn.execute(
            "UPDATE sites SET last_scan_at = ? WHERE site_id = ?",
            params![timestamp, site_id],
        )?;
        Ok(())
    }

    /// Enabled sites whose interval has elapsed, most urgent first.
    ///
    /// Ordered by priority (1 is most urgent), then by how long the site is overdue.
    /// Sites that have never been scanned count as overdue since the epoch.
    pub fn due_sites(
        conn: &Connection,
        now: i64,
        limit: Option<usize>,
    ) -> Result<Vec<DueSite>, SitePulseError> {
        let limit = limit.map(|l| l as i64).unwrap_or(-1); // LIMIT -1 is unbounded

        let mut stmt = conn.prepare(
            "SELECT site_id, root_url, scan_priority,
                (?1 - COALESCE(last_scan_at, 0)) - scan_interval_minutes * 60 AS overdue
             FROM sites
             WHERE enabled = 1
                AND (last_scan_at IS NULL OR ?1 - last_scan_at >= scan_interval_minutes * 60)
             ORDER BY scan_priority ASC, overdue DESC, site_id ASC
             LIMIT ?2",
        )?;

        let due = stmt
            .query_map(params![now, limit], |row| {
                Ok(DueSite {
                    site_id: row.get(0)?,
                    root_url: row.get(1)?,
                    scan_priority: row.get(2)?,
                    overdue_seconds: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(due)
    }

    /// NotFound unless the group exists and belongs to `owner_id`
    fn ensure_group_owner(
        conn: &Connection,
        group_id: i64,
        owner_id: &str,
    ) -> Result<(), SitePulseError> {
        let group_owner: Option<String> = conn
            .query_row(
                "SELECT owner_id FROM site_groups WHERE group_id = ?",
                [group_id],
                |row| row.get(0),
            )
            .optional()?;

        match group_owner {
            Some(owner) if owner == owner_id => Ok(()),
            _ => Err(SitePulseError::NotFound(format!("Group {} not found", group_id))),
        }
    }

    pub fn create_group(
        conn: &Connection,
        owner_id: &str,
        name: &str,
    ) -> Result<i64, SitePulseError> {
        let group_id = conn.query_row(
            "INSERT INTO site_groups (owner_id, name, created_at) VALUES (?, ?, ?) RETURNING group_id",
            params![owner_id, name, chrono::Utc::now().timestamp()],
            |row| row.get(0),
        )?;
        Ok(group_id)
    }
}

pub fn validate_priority(priority: i64) -> Result<(), SitePulseError> {
    if !(MIN_SCAN_PRIORITY..=MAX_SCAN_PRIORITY).contains(&priority) {
        return Err(SitePulseError::InvalidInput(format!(
            "scan priority must be {}-{}, got: {}",
            MIN_SCAN_PRIORITY, MAX_SCAN_PRIORITY, priority
        )));
    }
    Ok(())
}

pub fn validate_interval(minutes: i64) -> Result<(), SitePulseError> {
    if !(MIN_SCAN_INTERVAL_MINUTES..=MAX_SCAN_INTERVAL_MINUTES).contains(&minutes) {
        return Err(SitePulseError::InvalidInput(format!(
            "scan interval must be {}-{} minutes, got: {}",
            MIN_SCAN_INTERVAL_MINUTES, MAX_SCAN_INTERVAL_MINUTES, minutes
        )));
    }
    Ok(())
}

/// Trim, drop empties, and de-duplicate while keeping first-seen order
pub fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
        if !normalized.iter().any(|existing| existing == tag) {
            normalized.push(tag.to_owned());
        }
    }
    normalized
}

/// Lenient decoding of the `tags` column. Anything other than a JSON array of strings is empty.
fn parse_tags(value: Option<&str>) -> Vec<String> {
    let Some(value) = value else {
        return Vec::new();
    };

    match serde_json::from_str::<Vec<serde_json::Value>>(value) {
        Ok(items) => items
            .iter()
            .filter_map(|item| item.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect(),
        Err(_) => Vec::new(),
    }
}

fn tags_to_column(tags: &[String]) -> Option<String> {
    if tags.is_empty() {
        None
    } else {
        serde_json::to_string(tags).ok()
    }
}
