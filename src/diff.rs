use std::collections::{HashMap, HashSet};

use log::info;
use rusqlite::Connection;

use crate::changes::{Change, ChangeCounts, ChangeType};
use crate::database::Database;
use crate::error::SitePulseError;
use crate::fetcher::SitemapUrl;
use crate::scans::{Scan, ScanOutcome, ScanStatus};
use crate::urls::UrlRecord;

/// Classified difference between the stored snapshot and one fetched URL
#[derive(Debug, Clone, PartialEq)]
pub enum UrlDelta<'a> {
    /// Never seen before
    Added { url: &'a SitemapUrl },
    /// Previously removed, now listed again
    Reappeared { url_id: i64, url: &'a SitemapUrl },
    /// Active but no longer listed
    Removed { url_id: i64, loc: &'a str },
    /// Listed with different changefreq or priority
    Updated {
        url_id: i64,
        url: &'a SitemapUrl,
        detail: String,
    },
    /// Listed with the same hints
    Unchanged { url_id: i64, url: &'a SitemapUrl },
}

impl UrlDelta<'_> {
    pub fn change_type(&self) -> Option<ChangeType> {
        match self {
            UrlDelta::Added { .. } | UrlDelta::Reappeared { .. } => Some(ChangeType::Added),
            UrlDelta::Removed { .. } => Some(ChangeType::Removed),
            UrlDelta::Updated { .. } => Some(ChangeType::Updated),
            UrlDelta::Unchanged { .. } => None,
        }
    }
}

/// Compare a fetched URL set against the stored records of a site.
///
/// Fetched entries with a repeated `loc` keep the first occurrence. Removals are
/// reported after the fetched entries, ordered by location.
pub fn compute_delta<'a>(
    existing: &'a HashMap<String, UrlRecord>,
    fetched: &'a [SitemapUrl],
) -> Vec<UrlDelta<'a>> {
    let mut delta = Vec::with_capacity(fetched.len());
    let mut listed: HashSet<&str> = HashSet::with_capacity(fetched.len());

    for url in fetched {
        if !listed.insert(url.loc.as_str()) {
            continue;
        }

        let entry = match existing.get(&url.loc) {
            None => UrlDelta::Added { url },
            Some(record) if !record.is_active() => UrlDelta::Reappeared {
                url_id: record.url_id,
                url,
            },
            Some(record) => match hint_changes(record, url) {
                Some(detail) => UrlDelta::Updated {
                    url_id: record.url_id,
                    url,
                    detail,
                },
                None => UrlDelta::Unchanged {
                    url_id: record.url_id,
                    url,
                },
            },
        };
        delta.push(entry);
    }

    let mut removed: Vec<&UrlRecord> = existing
        .values()
        .filter(|record| record.is_active() && !listed.contains(record.loc.as_str()))
        .collect();
    removed.sort_by(|a, b| a.loc.cmp(&b.loc));

    delta.extend(removed.into_iter().map(|record| UrlDelta::Removed {
        url_id: record.url_id,
        loc: record.loc.as_str(),
    }));

    delta
}

/// `changefreq: weekly -> daily; priority: 0.5 -> 0.8`, or None when the hints match
fn hint_changes(record: &UrlRecord, url: &SitemapUrl) -> Option<String> {
    let mut parts = Vec::new();

    if record.changefreq != url.changefreq {
        parts.push(format!(
            "changefreq: {} -> {}",
            hint_text(&record.changefreq),
            hint_text(&url.changefreq)
        ));
    }
    if record.priority != url.priority {
        parts.push(format!(
            "priority: {} -> {}",
            hint_text(&record.priority),
            hint_text(&url.priority)
        ));
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("; "))
    }
}

fn hint_text(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("none")
}

/// Commit a fetched URL set for a running scan.
///
/// URL records, change rows, and the running -> success transition are written in one
/// immediate transaction. If the scan is no longer running (it was reaped), nothing is
/// written and Conflict is returned.
pub fn apply(
    conn: &Connection,
    site_id: i64,
    scan_id: i64,
    fetched: &[SitemapUrl],
) -> Result<ChangeCounts, SitePulseError> {
    Database::immediate_transaction(conn, |c| {
        let scan = Scan::get_by_id(c, scan_id)?
            .ok_or_else(|| SitePulseError::NotFound(format!("Scan {} not found", scan_id)))?;

        if scan.site_id != site_id {
            return Err(SitePulseError::Error(format!(
                "Scan {} belongs to site {}, not {}",
                scan_id, scan.site_id, site_id
            )));
        }
        if scan.status != ScanStatus::Running {
            return Err(SitePulseError::Conflict(format!(
                "Scan {} is {}, expected running",
                scan_id,
                scan.status.name()
            )));
        }

        let counts = apply_delta_immediate(c, site_id, scan_id, fetched)?;
        Scan::complete_immediate(c, scan_id, &ScanOutcome::Success(counts))?;

        info!(
            "Scan {} of site {} committed: {} added, {} removed, {} updated",
            scan_id, site_id, counts.added, counts.removed, counts.updated
        );

        Ok(counts)
    })
}

fn apply_delta_immediate(
    conn: &Connection,
    site_id: i64,
    scan_id: i64,
    fetched: &[SitemapUrl],
) -> Result<ChangeCounts, SitePulseError> {
    let now = chrono::Utc::now().timestamp();
    let existing = UrlRecord::load_for_site(conn, site_id)?;
    let mut counts = ChangeCounts::default();

    for entry in compute_delta(&existing, fetched) {
        match &entry {
            UrlDelta::Added { url } => {
                let url_id = UrlRecord::insert_immediate(conn, site_id, url, now)?;
                Change::insert_immediate(
                    conn,
                    site_id,
                    scan_id,
                    url_id,
                    &url.loc,
                    ChangeType::Added,
                    &url.loc,
                    now,
                )?;
            }
            UrlDelta::Reappeared { url_id, url } => {
                UrlRecord::reactivate_immediate(conn, *url_id, url, now)?;
                Change::insert_immediate(
                    conn,
                    site_id,
                    scan_id,
                    *url_id,
                    &url.loc,
                    ChangeType::Added,
                    &format!("{} (reappeared)", url.loc),
                    now,
                )?;
            }
            UrlDelta::Removed { url_id, loc } => {
                UrlRecord::mark_removed_immediate(conn, *url_id)?;
                Change::insert_immediate(
                    conn,
                    site_id,
                    scan_id,
                    *url_id,
                    loc,
                    ChangeType::Removed,
                    loc,
                    now,
                )?;
            }
            UrlDelta::Updated {
                url_id,
                url,
                detail,
            } => {
                UrlRecord::observe_immediate(conn, *url_id, url, now)?;
                Change::insert_immediate(
                    conn,
                    site_id,
                    scan_id,
                    *url_id,
                    &url.loc,
                    ChangeType::Updated,
                    detail,
                    now,
                )?;
            }
            UrlDelta::Unchanged { url_id, url } => {
                UrlRecord::observe_immediate(conn, *url_id, url, now)?;
            }
        }

        if let Some(change_type) = entry.change_type() {
            counts.increment(change_type);
        }
    }

    Ok(counts)
}

/// Store an initial URL set without recording changes. Returns the number of records written.
pub fn seed_snapshot_immediate(
    conn: &Connection,
    site_id: i64,
    urls: &[SitemapUrl],
    now: i64,
) -> Result<usize, SitePulseError> {
    let mut seen: HashSet<&str> = HashSet::with_capacity(urls.len());
    for url in urls {
        if seen.insert(url.loc.as_str()) {
            UrlRecord::insert_immediate(conn, site_id, url, now)?;
        }
    }
    Ok(seen.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{running_scan, seed_site, sitemap_urls, test_db};
    use crate::urls::UrlStatus;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn record(url_id: i64, loc: &str, status: UrlStatus) -> UrlRecord {
        UrlRecord {
            url_id,
            site_id: 1,
            loc: loc.to_owned(),
            status,
            changefreq: None,
            priority: None,
            lastmod: None,
            first_seen_at: 0,
            last_seen_at: 0,
        }
    }

    fn active_locs(conn: &Connection, site_id: i64) -> Vec<String> {
        let mut locs: Vec<String> = UrlRecord::load_for_site(conn, site_id)
            .unwrap()
            .into_values()
            .filter(|r| r.is_active())
            .map(|r| r.loc)
            .collect();
        locs.sort();
        locs
    }

    #[test]
    fn test_compute_delta_classifies() {
        let mut existing = HashMap::new();
        existing.insert("a".to_string(), record(1, "a", UrlStatus::Active));
        existing.insert("b".to_string(), record(2, "b", UrlStatus::Active));
        existing.insert("gone".to_string(), record(3, "gone", UrlStatus::Removed));

        let mut b = SitemapUrl::new("b");
        b.priority = Some("0.8".into());
        let fetched = vec![
            b.clone(),
            SitemapUrl::new("c"),
            SitemapUrl::new("gone"),
            SitemapUrl::new("c"),
        ];

        let delta = compute_delta(&existing, &fetched);
        assert_eq!(
            delta,
            vec![
                UrlDelta::Updated {
                    url_id: 2,
                    url: &fetched[0],
                    detail: "priority: none -> 0.8".into()
                },
                UrlDelta::Added { url: &fetched[1] },
                UrlDelta::Reappeared {
                    url_id: 3,
                    url: &fetched[2]
                },
                UrlDelta::Removed { url_id: 1, loc: "a" },
            ]
        );
    }

    #[test]
    fn test_hint_changes_detail() {
        let mut stored = record(1, "a", UrlStatus::Active);
        stored.changefreq = Some("weekly".into());
        stored.priority = Some("0.5".into());

        let mut fetched = SitemapUrl::new("a");
        fetched.changefreq = Some("daily".into());
        fetched.priority = Some("0.8".into());

        assert_eq!(
            hint_changes(&stored, &fetched).as_deref(),
            Some("changefreq: weekly -> daily; priority: 0.5 -> 0.8")
        );

        fetched.changefreq = Some("weekly".into());
        fetched.priority = Some("0.5".into());
        fetched.lastmod = Some("2024-01-01T00:00:00+00:00".into());
        assert_eq!(hint_changes(&stored, &fetched), None);
    }

    #[test]
    fn test_apply_ab_to_bc() {
        let (_dir, db) = test_db();
        let conn = db.get_connection().unwrap();
        let site = seed_site(&conn, "o", "https://a.example");

        let first = running_scan(&conn, site.site_id);
        let counts = apply(&conn, site.site_id, first, &sitemap_urls(&["A", "B"])).unwrap();
        assert_eq!(counts.added, 2);

        let second = running_scan(&conn, site.site_id);
        let counts = apply(&conn, site.site_id, second, &sitemap_urls(&["B", "C"])).unwrap();
        assert_eq!(
            counts,
            ChangeCounts {
                added: 1,
                removed: 1,
                updated: 0
            }
        );

        let changes = Change::list_for_scan(&conn, second).unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].change_type, ChangeType::Added);
        assert_eq!(changes[0].loc.as_deref(), Some("C"));
        assert_eq!(changes[1].change_type, ChangeType::Removed);
        assert_eq!(changes[1].loc.as_deref(), Some("A"));

        let scan = Scan::get_by_id(&conn, second).unwrap().unwrap();
        assert_eq!(scan.status, ScanStatus::Success);
        assert_eq!(scan.change_counts(), Some(counts));

        assert_eq!(active_locs(&conn, site.site_id), vec!["B", "C"]);
    }

    #[test]
    fn test_apply_is_idempotent() {
        let (_dir, db) = test_db();
        let conn = db.get_connection().unwrap();
        let site = seed_site(&conn, "o", "https://a.example");
        let urls = sitemap_urls(&["A", "B", "C"]);

        let first = running_scan(&conn, site.site_id);
        apply(&conn, site.site_id, first, &urls).unwrap();

        let second = running_scan(&conn, site.site_id);
        let counts = apply(&conn, site.site_id, second, &urls).unwrap();
        assert!(counts.is_empty());
        assert!(Change::list_for_scan(&conn, second).unwrap().is_empty());
    }

    #[test]
    fn test_reappearance_resets_first_seen() {
        let (_dir, db) = test_db();
        let conn = db.get_connection().unwrap();
        let site = seed_site(&conn, "o", "https://a.example");

        let scan = running_scan(&conn, site.site_id);
        apply(&conn, site.site_id, scan, &sitemap_urls(&["A"])).unwrap();
        conn.execute("UPDATE urls SET first_seen_at = 5", []).unwrap();

        let scan = running_scan(&conn, site.site_id);
        apply(&conn, site.site_id, scan, &[]).unwrap();

        let scan = running_scan(&conn, site.site_id);
        let counts = apply(&conn, site.site_id, scan, &sitemap_urls(&["A"])).unwrap();
        assert_eq!(counts.added, 1);

        let changes = Change::list_for_scan(&conn, scan).unwrap();
        assert_eq!(changes[0].detail.as_deref(), Some("A (reappeared)"));

        let records = UrlRecord::load_for_site(&conn, site.site_id).unwrap();
        assert_eq!(records.len(), 1);
        assert!(records["A"].first_seen_at > 5);
    }

    #[test]
    fn test_apply_on_reaped_scan_rolls_back() {
        let (_dir, db) = test_db();
        let conn = db.get_connection().unwrap();
        let site = seed_site(&conn, "o", "https://a.example");

        let scan = running_scan(&conn, site.site_id);
        Scan::complete(&conn, scan, &ScanOutcome::Failed("reaped".into())).unwrap();

        let err = apply(&conn, site.site_id, scan, &sitemap_urls(&["A"])).unwrap_err();
        assert!(err.is_conflict());
        assert!(UrlRecord::load_for_site(&conn, site.site_id).unwrap().is_empty());
        assert!(Change::list_for_scan(&conn, scan).unwrap().is_empty());
    }

    #[test]
    fn test_seed_snapshot_records_no_changes() {
        let (_dir, db) = test_db();
        let conn = db.get_connection().unwrap();
        let site = seed_site(&conn, "o", "https://a.example");

        let written =
            seed_snapshot_immediate(&conn, site.site_id, &sitemap_urls(&["A", "B", "A"]), 10)
                .unwrap();
        assert_eq!(written, 2);
        assert_eq!(active_locs(&conn, site.site_id), vec!["A", "B"]);

        let change_rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM changes", [], |row| row.get(0))
            .unwrap();
        assert_eq!(change_rows, 0);
    }

    fn url_strategy() -> impl Strategy<Value = SitemapUrl> {
        (
            "[a-f]{1,2}",
            proptest::option::of(prop_oneof![Just("daily"), Just("weekly")]),
            proptest::option::of(prop_oneof![Just("0.5"), Just("0.8")]),
        )
            .prop_map(|(loc, changefreq, priority)| SitemapUrl {
                loc: format!("https://p.example/{}", loc),
                changefreq: changefreq.map(str::to_owned),
                priority: priority.map(str::to_owned),
                lastmod: None,
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn test_reapplying_a_fetch_changes_nothing(
            before in proptest::collection::vec(url_strategy(), 0..12),
            after in proptest::collection::vec(url_strategy(), 0..12),
        ) {
            let (_dir, db) = test_db();
            let conn = db.get_connection().unwrap();
            let site = seed_site(&conn, "o", "https://p.example");

            let scan = running_scan(&conn, site.site_id);
            apply(&conn, site.site_id, scan, &before).unwrap();

            let scan = running_scan(&conn, site.site_id);
            apply(&conn, site.site_id, scan, &after).unwrap();

            let scan = running_scan(&conn, site.site_id);
            let counts = apply(&conn, site.site_id, scan, &after).unwrap();
            prop_assert!(counts.is_empty());

            let mut expected: Vec<String> = after.iter().map(|u| u.loc.clone()).collect();
            expected.sort();
            expected.dedup();
            prop_assert_eq!(active_locs(&conn, site.site_id), expected);
        }
    }
}
