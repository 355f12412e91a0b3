use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::signal;
use tokio::time::MissedTickBehavior;

use crate::config::SchedulerConfig;
use crate::error::SitePulseError;
use crate::scan_manager::ScanManager;

/// Long-running scheduler: due pass, queue advance, and reaper on their own intervals
pub struct ServiceLoop {
    manager: Arc<ScanManager>,
    config: SchedulerConfig,
}

impl ServiceLoop {
    pub fn new(manager: Arc<ScanManager>, config: SchedulerConfig) -> Self {
        ServiceLoop { manager, config }
    }

    /// Run until Ctrl-C or SIGTERM
    pub async fn run(&self) {
        self.run_until(shutdown_signal()).await
    }

    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut due = interval(self.config.due_interval_secs);
        let mut dispatch = interval(self.config.dispatch_interval_secs);
        let mut reap = interval(self.config.reap_interval_secs);

        info!(
            "Scheduler started (max_concurrent={}, reap_timeout={}m)",
            self.config.max_concurrent, self.config.reap_timeout_minutes
        );

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = due.tick() => {
                    let max_sites = self.config.max_sites_per_pass;
                    self.blocking_pass("Due-site pass", move |m| m.scan_due_sites(max_sites))
                        .await;
                    self.dispatch().await;
                }
                _ = dispatch.tick() => {
                    self.dispatch().await;
                }
                _ = reap.tick() => {
                    let timeout = self.config.reap_timeout_minutes;
                    if let Some(summary) = self
                        .blocking_pass("Reaper pass", move |m| m.reap_stuck(timeout))
                        .await
                    {
                        if summary.cleaned > 0 {
                            info!("{}", summary.message);
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("Scheduler shutting down");
                    break;
                }
            }
        }

        let in_flight = self.manager.in_flight();
        if in_flight > 0 {
            info!("Waiting for {} in-flight scan(s) to finish", in_flight);
        }
        self.manager.wait_idle().await;
        info!("Scheduler stopped");
    }

    async fn dispatch(&self) {
        let max_concurrent = self.config.max_concurrent;
        if let Some(summary) = self
            .blocking_pass("Queue dispatch", move |m| m.start_queued_scans(max_concurrent))
            .await
        {
            if !summary.started.is_empty() {
                info!("Dispatched scans {:?}", summary.started);
            }
        }
    }

    /// Run a store-bound manager pass on the blocking pool; its errors are logged
    async fn blocking_pass<T, F>(&self, name: &str, pass: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&ScanManager) -> Result<T, SitePulseError> + Send + 'static,
    {
        let manager = Arc::clone(&self.manager);
        match tokio::task::spawn_blocking(move || pass(&manager)).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                error!("{} failed: {}", name, e);
                None
            }
            Err(e) => {
                error!("{} aborted: {}", name, e);
                None
            }
        }
    }
}

fn interval(secs: u64) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(Duration::from_secs(secs));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::scans::{Scan, ScanStatus};
    use crate::test_support::{seed_site, sitemap_urls, test_db, StubSource};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_loop_scans_due_site_and_drains_on_shutdown() {
        let (_dir, db) = test_db();
        let conn = db.get_connection().unwrap();
        let site = seed_site(&conn, "o", "https://a.example");

        let source = Arc::new(StubSource::new());
        source.set_urls(
            "https://a.example/sitemap.xml",
            sitemap_urls(&["https://a.example/1"]),
        );

        let config = Config::default();
        let manager = Arc::new(ScanManager::new(db.clone(), source, None, &config));
        let service = ServiceLoop::new(manager, config.scheduler.clone());

        service
            .run_until(tokio::time::sleep(Duration::from_millis(300)))
            .await;

        let history = Scan::list_for_site(&conn, site.site_id, 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, ScanStatus::Success);
        assert_eq!(history[0].added_count, Some(1));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_passes_waiting_on_write_lock_leave_runtime_free() {
        let (_dir, db) = test_db();
        let site = {
            let conn = db.get_connection().unwrap();
            seed_site(&conn, "o", "https://a.example")
        };

        let source = Arc::new(StubSource::new());
        source.set_urls(
            "https://a.example/sitemap.xml",
            sitemap_urls(&["https://a.example/1"]),
        );

        let (locked_tx, locked_rx) = mpsc::channel();
        let locker_db = db.clone();
        let locker = std::thread::spawn(move || {
            let conn = locker_db.get_connection().unwrap();
            conn.execute_batch("BEGIN IMMEDIATE").unwrap();
            locked_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(400));
            conn.execute_batch("COMMIT").unwrap();
        });
        locked_rx.recv().unwrap();

        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = {
            let ticks = Arc::clone(&ticks);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        let config = Config::default();
        let manager = Arc::new(ScanManager::new(db.clone(), source, None, &config));
        let service = ServiceLoop::new(manager, config.scheduler.clone());
        service
            .run_until(tokio::time::sleep(Duration::from_millis(50)))
            .await;

        ticker.abort();
        locker.join().unwrap();

        // The single runtime thread kept running other tasks while the enqueue waited
        assert!(ticks.load(Ordering::SeqCst) >= 10);

        let conn = db.get_connection().unwrap();
        let history = Scan::list_for_site(&conn, site.site_id, 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, ScanStatus::Success);
    }
}
