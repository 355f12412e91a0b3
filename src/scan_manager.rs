use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn, Level};
use logging_timer::timer;
use serde::{Deserialize, Serialize};
use tokio_util::task::TaskTracker;

use crate::config::Config;
use crate::database::Database;
use crate::error::SitePulseError;
use crate::fetcher::SitemapSource;
use crate::notify::NotificationDispatcher;
use crate::scan_task::ScanPipeline;
use crate::scans::{EnqueueResult, EnqueueStatus, Scan};
use crate::sites::{Site, SiteFilter, TagMatch};

/// Outcome of enqueueing one site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteOutcome {
    Queued,
    AlreadyQueued,
    AlreadyRunning,
    Error,
}

impl From<EnqueueStatus> for SiteOutcome {
    fn from(status: EnqueueStatus) -> Self {
        match status {
            EnqueueStatus::Queued => SiteOutcome::Queued,
            EnqueueStatus::AlreadyQueued => SiteOutcome::AlreadyQueued,
            EnqueueStatus::AlreadyRunning => SiteOutcome::AlreadyRunning,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SiteResult {
    pub site_id: i64,
    pub root_url: String,
    pub outcome: SiteOutcome,
    pub scan_id: Option<i64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DuePassSummary {
    pub considered: usize,
    pub queued: usize,
    pub already_queued: usize,
    pub already_running: usize,
    pub errors: usize,
    pub sites: Vec<SiteResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatchSummary {
    pub running_before: i64,
    pub capacity: usize,
    pub started: Vec<i64>,
    /// Scans claimed by another dispatcher between selection and claim
    pub conflicts: Vec<i64>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ScanScope {
    All,
    Filtered,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanAllSummary {
    pub scope: ScanScope,
    pub queued: usize,
    pub skipped: usize,
    pub total: usize,
    pub errors: Vec<String>,
    pub details: Vec<ScanAllDetail>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanAllDetail {
    pub site_id: i64,
    pub root_url: String,
    pub scan_id: Option<i64>,
    /// `queued`, `skipped`, or `error`
    pub status: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReapSummary {
    pub cleaned: usize,
    pub timeout_minutes: i64,
    pub scan_ids: Vec<i64>,
    pub message: String,
}

/// Schedules, dispatches, and reaps scans.
///
/// The `scans` table is the queue. Every pass recomputes its view of the queue from the
/// store, so several managers (or processes) can share one database.
pub struct ScanManager {
    db: Database,
    pipeline: ScanPipeline,
    tracker: TaskTracker,
    tag_match: TagMatch,
}

impl ScanManager {
    pub fn new(
        db: Database,
        source: Arc<dyn SitemapSource>,
        notifier: Option<Arc<NotificationDispatcher>>,
        config: &Config,
    ) -> Self {
        let pipeline = ScanPipeline::new(
            db.clone(),
            source,
            notifier,
            Duration::from_secs(config.fetcher.scan_timeout_secs),
            config.notify.notify_on_empty,
        );

        ScanManager {
            db,
            pipeline,
            tracker: TaskTracker::new(),
            tag_match: config.sites.tag_match,
        }
    }

    pub fn enqueue(&self, site_id: i64) -> Result<EnqueueResult, SitePulseError> {
        let conn = self.db.get_connection()?;
        let result = Scan::enqueue(&conn, site_id)?;
        info!(
            "Enqueue site {}: scan {} ({:?})",
            site_id, result.scan_id, result.status
        );
        Ok(result)
    }

    /// Enqueue every enabled site whose scan interval has elapsed, most urgent first
    pub fn scan_due_sites(&self, max_sites: Option<usize>) -> Result<DuePassSummary, SitePulseError> {
        let _tmr = timer!(Level::Trace; "ScanManager::scan_due_sites");
        let conn = self.db.get_connection()?;
        let due = Site::due_sites(&conn, chrono::Utc::now().timestamp(), max_sites)?;

        let mut summary = DuePassSummary {
            considered: due.len(),
            ..Default::default()
        };

        for site in due {
            let result = match Scan::enqueue(&conn, site.site_id) {
                Ok(enqueued) => {
                    let outcome = SiteOutcome::from(enqueued.status);
                    match outcome {
                        SiteOutcome::Queued => summary.queued += 1,
                        SiteOutcome::AlreadyQueued => summary.already_queued += 1,
                        SiteOutcome::AlreadyRunning => summary.already_running += 1,
                        SiteOutcome::Error => {}
                    }
                    SiteResult {
                        site_id: site.site_id,
                        root_url: site.root_url,
                        outcome,
                        scan_id: Some(enqueued.scan_id),
                        error: None,
                    }
                }
                Err(e) => {
                    error!("Failed to enqueue due site {}: {}", site.site_id, e);
                    summary.errors += 1;
                    SiteResult {
                        site_id: site.site_id,
                        root_url: site.root_url,
                        outcome: SiteOutcome::Error,
                        scan_id: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            summary.sites.push(result);
        }

        if summary.considered > 0 {
            info!(
                "Due pass: {} due, {} queued, {} already queued, {} already running, {} errors",
                summary.considered,
                summary.queued,
                summary.already_queued,
                summary.already_running,
                summary.errors
            );
        }

        Ok(summary)
    }

    /// Claim queued scans up to the concurrency budget and spawn a pipeline for each.
    ///
    /// Returns as soon as the pipelines are spawned. Must be called from within a tokio runtime.
    pub fn start_queued_scans(&self, max_concurrent: usize) -> Result<DispatchSummary, SitePulseError> {
        let _tmr = timer!(Level::Trace; "ScanManager::start_queued_scans");
        let conn = self.db.get_connection()?;

        let running_before = Scan::count_running(&conn)?;
        let capacity = (max_concurrent as i64 - running_before).max(0) as usize;

        let mut summary = DispatchSummary {
            running_before,
            capacity,
            ..Default::default()
        };

        if capacity == 0 {
            return Ok(summary);
        }

        for scan_id in Scan::claimable_queued(&conn, capacity as i64)? {
            match Scan::start(&conn, scan_id) {
                Ok(scan) => {
                    info!("Starting scan {} for site {}", scan.scan_id, scan.site_id);
                    let pipeline = self.pipeline.clone();
                    self.tracker.spawn(async move {
                        pipeline.run(scan_id).await;
                    });
                    summary.started.push(scan_id);
                }
                Err(e) if e.is_conflict() || e.is_not_found() => {
                    warn!("Scan {} was claimed elsewhere: {}", scan_id, e);
                    summary.conflicts.push(scan_id);
                }
                Err(e) => {
                    error!("Failed to start scan {}: {}", scan_id, e);
                    summary.errors.push(format!("scan {}: {}", scan_id, e));
                }
            }
        }

        Ok(summary)
    }

    /// Enqueue scans for an owner's enabled sites. Per-site failures are collected.
    pub fn scan_all(
        &self,
        owner_id: &str,
        scope: ScanScope,
        filter: &SiteFilter,
    ) -> Result<ScanAllSummary, SitePulseError> {
        let conn = self.db.get_connection()?;

        let candidates = match scope {
            ScanScope::All => {
                Site::list_filtered(&conn, owner_id, &SiteFilter::default(), self.tag_match)?
            }
            ScanScope::Filtered => Site::list_filtered(&conn, owner_id, filter, self.tag_match)?,
        };

        let total = candidates.len();
        let mut queued = 0;
        let mut skipped = 0;
        let mut errors = Vec::new();
        let mut details = Vec::with_capacity(total);

        for site in candidates {
            let detail = match Scan::enqueue(&conn, site.site_id) {
                Ok(EnqueueResult {
                    scan_id,
                    status: EnqueueStatus::Queued,
                }) => {
                    queued += 1;
                    ScanAllDetail {
                        site_id: site.site_id,
                        root_url: site.root_url,
                        scan_id: Some(scan_id),
                        status: "queued".to_string(),
                        reason: None,
                    }
                }
                Ok(EnqueueResult { scan_id, status }) => {
                    skipped += 1;
                    let reason = match status {
                        EnqueueStatus::AlreadyRunning => "already_running",
                        _ => "already_queued",
                    };
                    ScanAllDetail {
                        site_id: site.site_id,
                        root_url: site.root_url,
                        scan_id: Some(scan_id),
                        status: "skipped".to_string(),
                        reason: Some(reason.to_string()),
                    }
                }
                Err(e) => {
                    error!("scan-all: failed to enqueue {}: {}", site.root_url, e);
                    errors.push(format!("{}: {}", site.root_url, e));
                    ScanAllDetail {
                        site_id: site.site_id,
                        root_url: site.root_url,
                        scan_id: None,
                        status: "error".to_string(),
                        reason: Some(e.to_string()),
                    }
                }
            };
            details.push(detail);
        }

        let mut message = format!("Queued {} of {} site(s)", queued, total);
        if skipped > 0 {
            message.push_str(&format!(", {} already active", skipped));
        }
        if !errors.is_empty() {
            message.push_str(&format!(", {} failed", errors.len()));
        }

        info!("scan-all for {}: {}", owner_id, message);

        Ok(ScanAllSummary {
            scope,
            queued,
            skipped,
            total,
            errors,
            details,
            message,
        })
    }

    pub fn reap_stuck(&self, timeout_minutes: i64) -> Result<ReapSummary, SitePulseError> {
        let conn = self.db.get_connection()?;
        let reaped = Scan::reap_stuck(&conn, timeout_minutes)?;

        let scan_ids: Vec<i64> = reaped.iter().map(|scan| scan.scan_id).collect();
        let message = format!(
            "Cleaned up {} stuck scan(s) running longer than {} minutes",
            scan_ids.len(),
            timeout_minutes
        );

        Ok(ReapSummary {
            cleaned: scan_ids.len(),
            timeout_minutes,
            scan_ids,
            message,
        })
    }

    /// Wait for every spawned pipeline to finish
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scans::ScanStatus;
    use crate::sites::SitePatch;
    use crate::test_support::{running_scan, seed_site, sitemap_urls, test_db, StubSource};
    use pretty_assertions::assert_eq;
    use rusqlite::params;

    fn manager(db: &Database, source: Arc<StubSource>) -> ScanManager {
        ScanManager::new(db.clone(), source, None, &Config::default())
    }

    fn stub_for(sites: &[&Site]) -> Arc<StubSource> {
        let source = Arc::new(StubSource::new());
        for site in sites {
            source.set_urls(
                site.sitemap_url.as_deref().unwrap(),
                sitemap_urls(&[format!("{}/page", site.root_url).as_str()]),
            );
        }
        source
    }

    #[test]
    fn test_scan_due_sites_enqueues_once() {
        let (_dir, db) = test_db();
        let conn = db.get_connection().unwrap();
        let a = seed_site(&conn, "o", "https://a.example");
        let b = seed_site(&conn, "o", "https://b.example");
        Site::update(&conn, b.site_id, &SitePatch { enabled: Some(false), ..Default::default() }).unwrap();

        let manager = manager(&db, Arc::new(StubSource::new()));

        let first = manager.scan_due_sites(None).unwrap();
        assert_eq!(first.considered, 1);
        assert_eq!(first.queued, 1);
        assert_eq!(first.sites[0].site_id, a.site_id);

        let second = manager.scan_due_sites(None).unwrap();
        assert_eq!(second.queued, 0);
        assert_eq!(second.already_queued, 1);
        assert_eq!(second.sites[0].scan_id, first.sites[0].scan_id);
    }

    #[test]
    fn test_scan_due_sites_respects_max() {
        let (_dir, db) = test_db();
        let conn = db.get_connection().unwrap();
        for i in 0..4 {
            seed_site(&conn, "o", &format!("https://{}.example", i));
        }

        let manager = manager(&db, Arc::new(StubSource::new()));
        let summary = manager.scan_due_sites(Some(2)).unwrap();
        assert_eq!(summary.considered, 2);
        assert_eq!(summary.queued, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dispatch_respects_capacity() {
        let (_dir, db) = test_db();
        let conn = db.get_connection().unwrap();

        let sites: Vec<Site> = (0..5)
            .map(|i| seed_site(&conn, "o", &format!("https://{}.example", i)))
            .collect();
        let site_refs: Vec<&Site> = sites.iter().collect();
        let manager = manager(&db, stub_for(&site_refs));

        // One scan is already running elsewhere
        running_scan(&conn, sites[0].site_id);
        for site in &sites[1..] {
            Scan::enqueue(&conn, site.site_id).unwrap();
        }

        let summary = manager.start_queued_scans(3).unwrap();
        assert_eq!(summary.running_before, 1);
        assert_eq!(summary.capacity, 2);
        assert_eq!(summary.started.len(), 2);
        assert!(summary.conflicts.is_empty());

        manager.wait_idle().await;

        for scan_id in &summary.started {
            let scan = Scan::get_by_id(&conn, *scan_id).unwrap().unwrap();
            assert_eq!(scan.status, ScanStatus::Success);
            assert_eq!(scan.added_count, Some(1));
        }

        let queued: i64 = conn
            .query_row("SELECT COUNT(*) FROM scans WHERE status = 0", [], |row| row.get(0))
            .unwrap();
        assert_eq!(queued, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dispatch_without_capacity_starts_nothing() {
        let (_dir, db) = test_db();
        let conn = db.get_connection().unwrap();
        let a = seed_site(&conn, "o", "https://a.example");
        let b = seed_site(&conn, "o", "https://b.example");
        running_scan(&conn, a.site_id);
        Scan::enqueue(&conn, b.site_id).unwrap();

        let manager = manager(&db, Arc::new(StubSource::new()));
        let summary = manager.start_queued_scans(1).unwrap();
        assert_eq!(summary.capacity, 0);
        assert!(summary.started.is_empty());
    }

    #[test]
    fn test_reap_stuck_summary() {
        let (_dir, db) = test_db();
        let conn = db.get_connection().unwrap();
        let site = seed_site(&conn, "o", "https://a.example");
        let scan_id = running_scan(&conn, site.site_id);
        conn.execute(
            "UPDATE scans SET started_at = ? WHERE scan_id = ?",
            params![chrono::Utc::now().timestamp() - 90 * 60, scan_id],
        )
        .unwrap();

        let manager = manager(&db, Arc::new(StubSource::new()));
        let summary = manager.reap_stuck(60).unwrap();
        assert_eq!(summary.cleaned, 1);
        assert_eq!(summary.scan_ids, vec![scan_id]);
        assert_eq!(summary.timeout_minutes, 60);

        let scan = Scan::get_by_id(&conn, scan_id).unwrap().unwrap();
        assert_eq!(scan.error.as_deref(), Some("Scan timeout - exceeded 60 minutes"));

        let again = manager.reap_stuck(60).unwrap();
        assert_eq!(again.cleaned, 0);
    }

    #[test]
    fn test_scan_all_skips_active_sites() {
        let (_dir, db) = test_db();
        let conn = db.get_connection().unwrap();
        let a = seed_site(&conn, "o", "https://a.example");
        let b = seed_site(&conn, "o", "https://b.example");
        let c = seed_site(&conn, "o", "https://c.example");
        seed_site(&conn, "other", "https://other.example");

        Scan::enqueue(&conn, a.site_id).unwrap();
        running_scan(&conn, b.site_id);

        let manager = manager(&db, Arc::new(StubSource::new()));
        let summary = manager
            .scan_all("o", ScanScope::All, &SiteFilter::default())
            .unwrap();

        assert_eq!(summary.total, 3);
        assert_eq!(summary.queued, 1);
        assert_eq!(summary.skipped, 2);
        assert!(summary.errors.is_empty());

        let reason_for = |site_id: i64| {
            summary
                .details
                .iter()
                .find(|d| d.site_id == site_id)
                .and_then(|d| d.reason.clone())
        };
        assert_eq!(reason_for(a.site_id).as_deref(), Some("already_queued"));
        assert_eq!(reason_for(b.site_id).as_deref(), Some("already_running"));
        assert_eq!(reason_for(c.site_id), None);
        assert_eq!(summary.message, "Queued 1 of 3 site(s), 2 already active");
    }

    #[test]
    fn test_scan_all_filtered_by_tag() {
        let (_dir, db) = test_db();
        let conn = db.get_connection().unwrap();
        let news = seed_site(&conn, "o", "https://news.example");
        seed_site(&conn, "o", "https://plain.example");
        Site::update(&conn, news.site_id, &SitePatch { tags: Some(vec!["news".into()]), ..Default::default() }).unwrap();

        let manager = manager(&db, Arc::new(StubSource::new()));
        let filter = SiteFilter {
            tags: vec!["news".into()],
            group_id: None,
        };

        let filtered = manager.scan_all("o", ScanScope::Filtered, &filter).unwrap();
        assert_eq!(filtered.total, 1);
        assert_eq!(filtered.details[0].site_id, news.site_id);
        assert_eq!(filtered.scope, ScanScope::Filtered);

        // Scope `all` ignores the filter
        let all = manager.scan_all("o", ScanScope::All, &filter).unwrap();
        assert_eq!(all.total, 2);
        assert_eq!(all.queued, 1);
    }
}
