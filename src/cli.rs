use std::path::PathBuf;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use log::info;
use serde::Serialize;

use crate::changes::{ChangeQuery, ChangeType, ScanDiff};
use crate::channels::{ChannelType, LegacyWebhook, NotificationChannel};
use crate::config::Config;
use crate::database::Database;
use crate::discovery;
use crate::error::SitePulseError;
use crate::fetcher::SitemapFetcher;
use crate::notify::{ChangeNotification, NotificationDispatcher};
use crate::scan_manager::{ScanManager, ScanScope};
use crate::scans::Scan;
use crate::service::ServiceLoop;
use crate::sites::{Site, SiteFilter, SitePatch};
use crate::urls::NewUrlsQuery;

const SECONDS_PER_DAY: i64 = 86_400;
const DEFAULT_NEW_URL_DAYS: i64 = 7;

#[derive(Parser)]
#[command(
    name = "sitepulse",
    version,
    about = "SitePulse: sitemap monitoring and change detection service"
)]
pub struct Cli {
    /// Directory holding the database (overrides the configured location)
    #[arg(long = "db-dir", global = true)]
    pub db_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the scheduler until interrupted (default if no command specified)
    Serve,

    /// Enqueue a scan for every enabled site whose interval has elapsed
    ScanDue {
        /// Maximum number of sites to enqueue in this pass
        #[arg(long)]
        max: Option<usize>,
    },

    /// Start queued scans up to the concurrency limit and wait for them to finish
    ProcessQueue {
        /// Maximum number of concurrently running scans (defaults to configuration)
        #[arg(long)]
        max: Option<usize>,
    },

    /// Fail running scans older than the timeout
    Reap {
        /// Timeout in minutes (defaults to configuration)
        #[arg(long)]
        timeout: Option<i64>,
    },

    /// Register a site by discovering its sitemap
    AddSite {
        #[arg(long, default_value = "local")]
        owner: String,

        /// Root URL of the site (http or https)
        #[arg(long)]
        url: String,

        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Point a site at a new root URL and re-resolve its sitemap
    Rediscover {
        #[arg(long)]
        site: i64,

        #[arg(long, default_value = "local")]
        owner: String,

        #[arg(long)]
        url: String,

        /// Replace the site's tags
        #[arg(long = "tag")]
        tags: Option<Vec<String>>,
    },

    /// Change a site's schedule, tags, group, or enabled flag
    UpdateSite {
        #[arg(long)]
        site: i64,

        #[arg(long, default_value = "local")]
        owner: String,

        #[arg(long)]
        enabled: Option<bool>,

        /// Scan priority, 1 (highest) to 5
        #[arg(long)]
        priority: Option<i64>,

        /// Scan interval in minutes, 5 to 10080
        #[arg(long)]
        interval: Option<i64>,

        #[arg(long = "tag")]
        tags: Option<Vec<String>>,

        #[arg(long, conflicts_with = "no_group")]
        group: Option<i64>,

        /// Remove the site from its group
        #[arg(long = "no-group", default_value_t = false)]
        no_group: bool,
    },

    /// List an owner's sites
    Sites {
        #[arg(long, default_value = "local")]
        owner: String,
    },

    /// Create a site group
    AddGroup {
        #[arg(long, default_value = "local")]
        owner: String,

        #[arg(long)]
        name: String,
    },

    /// Enqueue a scan for one site
    Scan {
        #[arg(long)]
        site: i64,

        #[arg(long, default_value = "local")]
        owner: String,
    },

    /// Enqueue scans for all of an owner's enabled sites
    ScanAll {
        #[arg(long, default_value = "local")]
        owner: String,

        #[arg(long, value_enum, default_value_t = ScanScope::All)]
        scope: ScanScope,

        /// Tag filter (scope `filtered` only, may be repeated)
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Group filter (scope `filtered` only)
        #[arg(long)]
        group: Option<i64>,
    },

    /// Show recent scans of a site
    History {
        #[arg(long)]
        site: i64,

        #[arg(long, default_value = "local")]
        owner: String,

        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Show the changes recorded by one scan
    ScanDiff {
        #[arg(long)]
        site: i64,

        #[arg(long)]
        scan: i64,

        #[arg(long, default_value = "local")]
        owner: String,
    },

    /// Show a site's change history
    Changes {
        #[arg(long)]
        site: i64,

        #[arg(long, default_value = "local")]
        owner: String,

        /// added, removed, or updated
        #[arg(long = "type")]
        change_type: Option<ChangeType>,

        /// First day to include (YYYY-MM-DD)
        #[arg(long, value_parser = parse_date)]
        from: Option<NaiveDate>,

        /// Last day to include (YYYY-MM-DD)
        #[arg(long, value_parser = parse_date)]
        to: Option<NaiveDate>,

        #[arg(long)]
        limit: Option<i64>,
    },

    /// List URLs first seen inside a date window
    NewUrls {
        #[arg(long, default_value = "local")]
        owner: String,

        /// First day to include (YYYY-MM-DD, default: 7 days ago)
        #[arg(long, value_parser = parse_date)]
        from: Option<NaiveDate>,

        /// Last day to include (YYYY-MM-DD, default: today)
        #[arg(long, value_parser = parse_date)]
        to: Option<NaiveDate>,

        #[arg(long)]
        site: Option<i64>,

        #[arg(long)]
        limit: Option<i64>,
    },

    /// Add a notification channel to a site
    AddChannel {
        #[arg(long)]
        site: i64,

        #[arg(long, default_value = "local")]
        owner: String,

        /// webhook, email, or slack
        #[arg(long = "type")]
        channel_type: ChannelType,

        /// URL for webhook and slack channels, address for email
        #[arg(long)]
        target: String,

        /// HMAC secret used to sign webhook payloads
        #[arg(long)]
        secret: Option<String>,
    },

    /// Add a legacy per-site webhook
    AddWebhook {
        #[arg(long)]
        site: i64,

        #[arg(long, default_value = "local")]
        owner: String,

        #[arg(long)]
        url: String,

        #[arg(long)]
        secret: Option<String>,
    },

    /// Send a test notification to every channel of a site
    TestNotify {
        #[arg(long)]
        site: i64,

        #[arg(long, default_value = "local")]
        owner: String,
    },
}

fn parse_date(value: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|e| format!("expected YYYY-MM-DD: {}", e))
}

fn day_start(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp()
}

fn day_end(date: NaiveDate) -> i64 {
    day_start(date) + SECONDS_PER_DAY - 1
}

fn print_json<T: Serialize>(value: &T) -> Result<(), SitePulseError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| SitePulseError::Error(format!("Failed to serialize output: {}", e)))?;
    println!("{}", json);
    Ok(())
}

impl Cli {
    pub fn handle_command_line(project_dirs: &ProjectDirs) -> Result<(), SitePulseError> {
        let args = Cli::parse();
        args.run(project_dirs)
    }

    fn run(self, project_dirs: &ProjectDirs) -> Result<(), SitePulseError> {
        let config = Config::get();
        let db_dir = self
            .db_dir
            .unwrap_or_else(|| config.database_dir(project_dirs));
        let db = Database::open(&db_dir)?;

        let rt = tokio::runtime::Runtime::new()
            .map_err(|e| SitePulseError::Error(format!("Failed to create runtime: {}", e)))?;

        let app = App { db, config };

        // Default to Serve if no command specified
        match self.command.unwrap_or(Command::Serve) {
            Command::Serve => rt.block_on(app.serve()),
            Command::ScanDue { max } => {
                let summary = app.manager()?.scan_due_sites(max)?;
                print_json(&summary)
            }
            Command::ProcessQueue { max } => {
                let max = max.unwrap_or(config.scheduler.max_concurrent);
                rt.block_on(async {
                    let manager = app.manager()?;
                    let summary = manager.start_queued_scans(max)?;
                    manager.wait_idle().await;
                    print_json(&summary)
                })
            }
            Command::Reap { timeout } => {
                let timeout = timeout.unwrap_or(config.scheduler.reap_timeout_minutes);
                let summary = app.manager()?.reap_stuck(timeout)?;
                print_json(&summary)
            }
            Command::AddSite { owner, url, tags } => rt.block_on(async {
                let fetcher = SitemapFetcher::new(&config.fetcher)?;
                let result = discovery::discover(&app.db, &fetcher, &owner, &url, tags).await?;
                print_json(&result)
            }),
            Command::Rediscover {
                site,
                owner,
                url,
                tags,
            } => rt.block_on(async {
                let fetcher = SitemapFetcher::new(&config.fetcher)?;
                let site =
                    discovery::rediscover_site(&app.db, &fetcher, site, &owner, &url, tags).await?;
                print_json(&site)
            }),
            Command::UpdateSite {
                site,
                owner,
                enabled,
                priority,
                interval,
                tags,
                group,
                no_group,
            } => {
                let group_id = match (group, no_group) {
                    (Some(id), _) => Some(Some(id)),
                    (None, true) => Some(None),
                    (None, false) => None,
                };
                let patch = SitePatch {
                    enabled,
                    tags,
                    scan_priority: priority,
                    scan_interval_minutes: interval,
                    group_id,
                    ..Default::default()
                };
                let conn = app.db.get_connection()?;
                Site::get_for_owner(&conn, site, &owner)?;
                print_json(&Site::update(&conn, site, &patch)?)
            }
            Command::Sites { owner } => {
                let conn = app.db.get_connection()?;
                print_json(&Site::list_for_owner(&conn, &owner)?)
            }
            Command::AddGroup { owner, name } => {
                let conn = app.db.get_connection()?;
                let group_id = Site::create_group(&conn, &owner, &name)?;
                print_json(&serde_json::json!({ "group_id": group_id, "name": name }))
            }
            Command::Scan { site, owner } => {
                {
                    let conn = app.db.get_connection()?;
                    Site::get_for_owner(&conn, site, &owner)?;
                }
                let result = app.manager()?.enqueue(site)?;
                print_json(&result)
            }
            Command::ScanAll {
                owner,
                scope,
                tags,
                group,
            } => {
                let filter = SiteFilter {
                    tags,
                    group_id: group,
                };
                let summary = app.manager()?.scan_all(&owner, scope, &filter)?;
                print_json(&summary)
            }
            Command::History { site, owner, limit } => {
                let conn = app.db.get_connection()?;
                Site::get_for_owner(&conn, site, &owner)?;
                print_json(&Scan::list_for_site(&conn, site, limit)?)
            }
            Command::ScanDiff { site, scan, owner } => {
                let conn = app.db.get_connection()?;
                print_json(&ScanDiff::for_scan(&conn, site, scan, &owner)?)
            }
            Command::Changes {
                site,
                owner,
                change_type,
                from,
                to,
                limit,
            } => {
                let conn = app.db.get_connection()?;
                Site::get_for_owner(&conn, site, &owner)?;
                let query = ChangeQuery {
                    site_id: site,
                    change_type,
                    from: from.map(day_start),
                    to: to.map(day_end),
                    limit,
                };
                print_json(&query.run(&conn)?)
            }
            Command::NewUrls {
                owner,
                from,
                to,
                site,
                limit,
            } => {
                let now = chrono::Utc::now().timestamp();
                let query = NewUrlsQuery {
                    owner_id: owner,
                    from: from
                        .map(day_start)
                        .unwrap_or(now - DEFAULT_NEW_URL_DAYS * SECONDS_PER_DAY),
                    to: to.map(day_end).unwrap_or(now),
                    site_id: site,
                    limit,
                };
                let conn = app.db.get_connection()?;
                print_json(&query.run(&conn)?)
            }
            Command::AddChannel {
                site,
                owner,
                channel_type,
                target,
                secret,
            } => {
                let conn = app.db.get_connection()?;
                Site::get_for_owner(&conn, site, &owner)?;
                let channel = NotificationChannel::create(
                    &conn,
                    site,
                    channel_type,
                    &target,
                    secret.as_deref(),
                )?;
                print_json(&channel)
            }
            Command::AddWebhook {
                site,
                owner,
                url,
                secret,
            } => {
                let conn = app.db.get_connection()?;
                Site::get_for_owner(&conn, site, &owner)?;
                print_json(&LegacyWebhook::create(&conn, site, &url, secret.as_deref())?)
            }
            Command::TestNotify { site, owner } => rt.block_on(async {
                let conn = app.db.get_connection()?;
                let site = Site::get_for_owner(&conn, site, &owner)?;
                drop(conn);

                let dispatcher = NotificationDispatcher::new(app.db.clone(), &config.notify)?;
                let report = dispatcher
                    .notify_change(site.site_id, &ChangeNotification::test(&site))
                    .await?;
                print_json(&report)
            }),
        }
    }
}

struct App {
    db: Database,
    config: &'static Config,
}

impl App {
    fn manager(&self) -> Result<Arc<ScanManager>, SitePulseError> {
        let fetcher = Arc::new(SitemapFetcher::new(&self.config.fetcher)?);
        let notifier = Arc::new(NotificationDispatcher::new(
            self.db.clone(),
            &self.config.notify,
        )?);

        Ok(Arc::new(ScanManager::new(
            self.db.clone(),
            fetcher,
            Some(notifier),
            self.config,
        )))
    }

    async fn serve(&self) -> Result<(), SitePulseError> {
        info!("Starting scheduler with database {}", self.db.path().display());

        let service = ServiceLoop::new(self.manager()?, self.config.scheduler.clone());
        service.run().await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cli_parsing_no_command_defaults_to_serve() {
        let result = Cli::try_parse_from(["sitepulse"]);
        assert!(result.is_ok(), "Should accept no command");

        let cli = result.unwrap();
        assert!(cli.command.is_none());
        assert!(matches!(cli.command.unwrap_or(Command::Serve), Command::Serve));
    }

    #[test]
    fn test_cli_parsing_scan_all_filtered() {
        let cli = Cli::try_parse_from([
            "sitepulse", "scan-all", "--owner", "acme", "--scope", "filtered", "--tag", "news",
            "--tag", "blog", "--group", "4",
        ])
        .unwrap();

        match cli.command {
            Some(Command::ScanAll {
                owner,
                scope,
                tags,
                group,
            }) => {
                assert_eq!(owner, "acme");
                assert_eq!(scope, ScanScope::Filtered);
                assert_eq!(tags, vec!["news", "blog"]);
                assert_eq!(group, Some(4));
            }
            _ => panic!("expected scan-all"),
        }
    }

    #[test]
    fn test_cli_parsing_changes_filters() {
        let cli = Cli::try_parse_from([
            "sitepulse", "changes", "--site", "3", "--type", "removed", "--from", "2024-03-01",
            "--to", "2024-03-02",
        ])
        .unwrap();

        match cli.command {
            Some(Command::Changes {
                site,
                owner,
                change_type,
                from,
                to,
                ..
            }) => {
                assert_eq!(site, 3);
                assert_eq!(owner, "local");
                assert_eq!(change_type, Some(ChangeType::Removed));
                assert_eq!(from, NaiveDate::from_ymd_opt(2024, 3, 1));
                assert_eq!(to, NaiveDate::from_ymd_opt(2024, 3, 2));
            }
            _ => panic!("expected changes"),
        }
    }

    #[test]
    fn test_cli_parsing_rejects_bad_values() {
        assert!(Cli::try_parse_from(["sitepulse", "changes", "--site", "1", "--type", "moved"]).is_err());
        assert!(Cli::try_parse_from(["sitepulse", "changes", "--site", "1", "--from", "03/01/2024"]).is_err());
        assert!(Cli::try_parse_from(["sitepulse", "add-channel", "--site", "1", "--type", "sms", "--target", "x"]).is_err());
        assert!(Cli::try_parse_from(["sitepulse", "update-site", "--site", "1", "--group", "2", "--no-group"]).is_err());
        assert!(Cli::try_parse_from(["sitepulse", "nonexistent-command"]).is_err());
    }

    #[test]
    fn test_cli_parsing_global_db_dir() {
        let cli = Cli::try_parse_from(["sitepulse", "reap", "--db-dir", "/tmp/sp", "--timeout", "90"]).unwrap();
        assert_eq!(cli.db_dir, Some(PathBuf::from("/tmp/sp")));
        assert!(matches!(cli.command, Some(Command::Reap { timeout: Some(90) })));
    }

    #[test]
    fn test_day_bounds_cover_whole_day() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(day_start(date), 1_709_251_200);
        assert_eq!(day_end(date), 1_709_251_200 + 86_399);
    }
}
