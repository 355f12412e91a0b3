use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};

use crate::changes::ChangeCounts;
use crate::database::Database;
use crate::diff;
use crate::error::SitePulseError;
use crate::fetcher::{FetchError, SitemapSource};
use crate::notify::{ChangeNotification, NotificationDispatcher};
use crate::scans::{Scan, ScanOutcome, ScanStatus};
use crate::sites::Site;

/// How a pipeline run ended
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineResult {
    /// Delta committed together with the success transition
    Committed(ChangeCounts),
    /// Failure recorded on the scan
    Failed(String),
    /// The scan left the running state (reaped) before the result could be recorded
    Discarded(String),
}

/// fetch -> diff -> notify for one claimed scan
#[derive(Clone)]
pub struct ScanPipeline {
    db: Database,
    source: Arc<dyn SitemapSource>,
    notifier: Option<Arc<NotificationDispatcher>>,
    fetch_timeout: Duration,
    notify_on_empty: bool,
}

impl ScanPipeline {
    pub fn new(
        db: Database,
        source: Arc<dyn SitemapSource>,
        notifier: Option<Arc<NotificationDispatcher>>,
        fetch_timeout: Duration,
        notify_on_empty: bool,
    ) -> Self {
        ScanPipeline {
            db,
            source,
            notifier,
            fetch_timeout,
            notify_on_empty,
        }
    }

    pub async fn run(&self, scan_id: i64) -> PipelineResult {
        match self.fetch_and_commit(scan_id).await {
            Ok((site, counts)) => {
                if !counts.is_empty() || self.notify_on_empty {
                    self.notify(&site, scan_id, counts).await;
                }
                PipelineResult::Committed(counts)
            }
            Err(e) if e.is_conflict() => {
                warn!("Discarding result of scan {}: {}", scan_id, e);
                PipelineResult::Discarded(e.to_string())
            }
            Err(e) => self.record_failure(scan_id, e).await,
        }
    }

    async fn fetch_and_commit(&self, scan_id: i64) -> Result<(Site, ChangeCounts), SitePulseError> {
        let (scan, site) = self
            .db
            .run_blocking(move |conn| {
                let scan = Scan::get_by_id(conn, scan_id)?
                    .ok_or_else(|| SitePulseError::NotFound(format!("Scan {} not found", scan_id)))?;
                if scan.status != ScanStatus::Running {
                    return Err(SitePulseError::Conflict(format!(
                        "Scan {} is {}, expected running",
                        scan_id,
                        scan.status.name()
                    )));
                }
                let site = Site::get_by_id(conn, scan.site_id)?.ok_or_else(|| {
                    SitePulseError::NotFound(format!("Site {} not found", scan.site_id))
                })?;
                Ok((scan, site))
            })
            .await?;

        info!("Scan {}: fetching sitemap for {}", scan_id, site.root_url);

        let urls = tokio::time::timeout(self.fetch_timeout, self.source.fetch(&site))
            .await
            .map_err(|_| FetchError::TimedOut(self.fetch_timeout.as_secs()))??;

        let site_id = scan.site_id;
        let counts = self
            .db
            .run_blocking(move |conn| diff::apply(conn, site_id, scan_id, &urls))
            .await?;

        Ok((site, counts))
    }

    async fn record_failure(&self, scan_id: i64, cause: SitePulseError) -> PipelineResult {
        let message = cause.to_string();
        error!("Scan {} failed: {}", scan_id, message);

        let outcome = ScanOutcome::Failed(message.clone());
        let recorded = self
            .db
            .run_blocking(move |conn| Scan::complete(conn, scan_id, &outcome))
            .await;

        match recorded {
            Ok(_) => PipelineResult::Failed(message),
            Err(e) if e.is_conflict() || e.is_not_found() => {
                warn!("Could not record failure of scan {}: {}", scan_id, e);
                PipelineResult::Discarded(e.to_string())
            }
            Err(e) => {
                error!("Could not record failure of scan {}: {}", scan_id, e);
                PipelineResult::Failed(message)
            }
        }
    }

    async fn notify(&self, site: &Site, scan_id: i64, counts: ChangeCounts) {
        let Some(notifier) = &self.notifier else {
            return;
        };

        let notification = ChangeNotification::for_scan(site, scan_id, counts);
        match notifier.notify_change(site.site_id, &notification).await {
            Ok(report) if report.failed > 0 => warn!(
                "Scan {}: {} of {} notification(s) failed",
                scan_id,
                report.failed,
                report.failed + report.delivered
            ),
            Ok(_) => {}
            Err(e) => error!("Scan {}: could not dispatch notifications: {}", scan_id, e),
        }
    }
}
