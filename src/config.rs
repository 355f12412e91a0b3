use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::sites::TagMatch;

pub static CONFIG: OnceCell<Config> = OnceCell::new();

const ENV_PREFIX: &str = "SITEPULSE_";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub sitepulse: String,
    pub http: String,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 6] = ["off", "error", "warn", "info", "debug", "trace"];
    const SITEPULSE_LEVEL: &str = "info";
    const HTTP_LEVEL: &str = "warn";

    fn default() -> Self {
        LoggingConfig {
            sitepulse: Self::SITEPULSE_LEVEL.to_string(),
            http: Self::HTTP_LEVEL.to_string(),
        }
    }

    fn ensure_valid(&mut self) {
        Self::ensure_level(&mut self.sitepulse, "sitepulse", Self::SITEPULSE_LEVEL);
        Self::ensure_level(&mut self.http, "http", Self::HTTP_LEVEL);
    }

    fn ensure_level(level: &mut String, name: &str, default: &str) {
        let original = level.clone();
        *level = level.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&level.as_str()) {
            eprintln!(
                "Config error: {} log level of '{}' is invalid - using default of '{}'",
                name, original, default
            );
            *level = default.to_owned();
        }
    }

    /// flexi_logger spec string. The HTTP level covers the client stack used by the fetcher and notifier.
    pub fn log_spec(&self) -> String {
        format!(
            "sitepulse={},reqwest={},hyper={},hyper_util={},lettre={}",
            self.sitepulse, self.http, self.http, self.http, self.http
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct DatabaseConfig {
    /// Directory holding `sitepulse.db`. Defaults to the application data directory.
    pub dir: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    pub reap_timeout_minutes: i64,
    pub max_sites_per_pass: Option<usize>,
    pub due_interval_secs: u64,
    pub dispatch_interval_secs: u64,
    pub reap_interval_secs: u64,
}

impl SchedulerConfig {
    const MAX_CONCURRENT: usize = 3;
    const REAP_TIMEOUT_MINUTES: i64 = 60;
    const DUE_INTERVAL_SECS: u64 = 60;
    const DISPATCH_INTERVAL_SECS: u64 = 15;
    const REAP_INTERVAL_SECS: u64 = 300;

    fn ensure_valid(&mut self) {
        if self.max_concurrent == 0 {
            eprintln!(
                "Config error: scheduler.max_concurrent must be at least 1 - using default of {}",
                Self::MAX_CONCURRENT
            );
            self.max_concurrent = Self::MAX_CONCURRENT;
        }
        if self.reap_timeout_minutes < 1 {
            eprintln!(
                "Config error: scheduler.reap_timeout_minutes of {} is invalid - using default of {}",
                self.reap_timeout_minutes,
                Self::REAP_TIMEOUT_MINUTES
            );
            self.reap_timeout_minutes = Self::REAP_TIMEOUT_MINUTES;
        }
        if self.max_sites_per_pass == Some(0) {
            eprintln!("Config error: scheduler.max_sites_per_pass of 0 is invalid - using no limit");
            self.max_sites_per_pass = None;
        }
        ensure_positive_secs(&mut self.due_interval_secs, "scheduler.due_interval_secs", Self::DUE_INTERVAL_SECS);
        ensure_positive_secs(
            &mut self.dispatch_interval_secs,
            "scheduler.dispatch_interval_secs",
            Self::DISPATCH_INTERVAL_SECS,
        );
        ensure_positive_secs(&mut self.reap_interval_secs, "scheduler.reap_interval_secs", Self::REAP_INTERVAL_SECS);
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            max_concurrent: Self::MAX_CONCURRENT,
            reap_timeout_minutes: Self::REAP_TIMEOUT_MINUTES,
            max_sites_per_pass: None,
            due_interval_secs: Self::DUE_INTERVAL_SECS,
            dispatch_interval_secs: Self::DISPATCH_INTERVAL_SECS,
            reap_interval_secs: Self::REAP_INTERVAL_SECS,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FetcherConfig {
    pub user_agent: String,
    /// Per-request timeout for sitemap and robots.txt downloads
    pub request_timeout_secs: u64,
    /// Overall bound on one scan's fetch phase
    pub scan_timeout_secs: u64,
    pub max_depth: usize,
    pub max_sitemaps: usize,
    pub max_urls: usize,
    /// Largest response body read for one sitemap or robots.txt document
    pub max_body_bytes: usize,
}

impl FetcherConfig {
    const USER_AGENT: &str = concat!("sitepulse/", env!("CARGO_PKG_VERSION"));
    const REQUEST_TIMEOUT_SECS: u64 = 30;
    const SCAN_TIMEOUT_SECS: u64 = 600;
    const MAX_DEPTH: usize = 3;
    const MAX_SITEMAPS: usize = 200;
    const MAX_URLS: usize = 50_000;
    const MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

    fn ensure_valid(&mut self) {
        if self.user_agent.trim().is_empty() {
            eprintln!(
                "Config error: fetcher.user_agent is empty - using default of '{}'",
                Self::USER_AGENT
            );
            self.user_agent = Self::USER_AGENT.to_owned();
        }
        ensure_positive_secs(
            &mut self.request_timeout_secs,
            "fetcher.request_timeout_secs",
            Self::REQUEST_TIMEOUT_SECS,
        );
        ensure_positive_secs(&mut self.scan_timeout_secs, "fetcher.scan_timeout_secs", Self::SCAN_TIMEOUT_SECS);
        if self.max_sitemaps == 0 {
            eprintln!(
                "Config error: fetcher.max_sitemaps must be at least 1 - using default of {}",
                Self::MAX_SITEMAPS
            );
            self.max_sitemaps = Self::MAX_SITEMAPS;
        }
        if self.max_urls == 0 {
            eprintln!(
                "Config error: fetcher.max_urls must be at least 1 - using default of {}",
                Self::MAX_URLS
            );
            self.max_urls = Self::MAX_URLS;
        }
        if self.max_body_bytes == 0 {
            eprintln!(
                "Config error: fetcher.max_body_bytes must be at least 1 - using default of {}",
                Self::MAX_BODY_BYTES
            );
            self.max_body_bytes = Self::MAX_BODY_BYTES;
        }
    }
}

impl Default for FetcherConfig {
    fn default() -> Self {
        FetcherConfig {
            user_agent: Self::USER_AGENT.to_owned(),
            request_timeout_secs: Self::REQUEST_TIMEOUT_SECS,
            scan_timeout_secs: Self::SCAN_TIMEOUT_SECS,
            max_depth: Self::MAX_DEPTH,
            max_sitemaps: Self::MAX_SITEMAPS,
            max_urls: Self::MAX_URLS,
            max_body_bytes: Self::MAX_BODY_BYTES,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NotifyConfig {
    pub timeout_secs: u64,
    /// Deliver a notification even when a scan found no changes
    pub notify_on_empty: bool,
    pub smtp: Option<SmtpConfig>,
}

impl NotifyConfig {
    const TIMEOUT_SECS: u64 = 10;

    fn ensure_valid(&mut self) {
        ensure_positive_secs(&mut self.timeout_secs, "notify.timeout_secs", Self::TIMEOUT_SECS);
        if let Some(smtp) = &self.smtp {
            if smtp.host.trim().is_empty() || smtp.from.trim().is_empty() {
                eprintln!("Config error: notify.smtp requires host and from - email delivery disabled");
                self.smtp = None;
            }
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        NotifyConfig {
            timeout_secs: Self::TIMEOUT_SECS,
            notify_on_empty: false,
            smtp: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct SitesConfig {
    pub tag_match: TagMatch,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub logging: LoggingConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub fetcher: FetcherConfig,
    pub notify: NotifyConfig,
    #[serde(default)]
    pub sites: SitesConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: LoggingConfig::default(),
            database: DatabaseConfig::default(),
            scheduler: SchedulerConfig::default(),
            fetcher: FetcherConfig::default(),
            notify: NotifyConfig::default(),
            sites: SitesConfig::default(),
        }
    }
}

impl Config {
    /// Loads the configuration from `config.toml` in the app's data directory, then
    /// applies `SITEPULSE_` environment overrides (`SITEPULSE_SCHEDULER__MAX_CONCURRENT=5`).
    /// Writes the default config to disk if no file exists.
    pub fn load_config(project_dirs: &ProjectDirs) -> Self {
        let config_path = project_dirs.data_local_dir().join("config.toml");
        Self::load_from_path(&config_path)
    }

    pub fn load_from_path(config_path: &Path) -> Self {
        let default_config = Config::default();

        if !config_path.exists() {
            Self::write_default(config_path, &default_config);
        }

        let figment = Figment::from(Serialized::defaults(default_config.clone()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config = figment.extract().unwrap_or_else(|err| {
            eprintln!(
                "Could not load config file {}: {}. Using default configuration.",
                config_path.display(),
                err
            );
            default_config
        });

        config.ensure_valid();

        config
    }

    fn write_default(config_path: &Path, default_config: &Config) {
        if let Some(parent) = config_path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                eprintln!(
                    "Failed to create configuration directory {}: {}",
                    parent.display(),
                    e
                );
            }
        }
        match toml::to_string_pretty(default_config) {
            Ok(toml_string) => {
                if let Err(e) = fs::write(config_path, toml_string) {
                    eprintln!(
                        "Failed to write default config to {}: {}",
                        config_path.display(),
                        e
                    );
                }
            }
            Err(_) => eprintln!("Failed to serialize default config."),
        }
    }

    /// The loaded configuration, or defaults when nothing was loaded
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(Config::default)
    }

    pub fn database_dir(&self, project_dirs: &ProjectDirs) -> PathBuf {
        match &self.database.dir {
            Some(dir) => PathBuf::from(dir),
            None => project_dirs.data_local_dir().to_path_buf(),
        }
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
        self.scheduler.ensure_valid();
        self.fetcher.ensure_valid();
        self.notify.ensure_valid();
    }
}

fn ensure_positive_secs(value: &mut u64, name: &str, default: u64) {
    if *value == 0 {
        eprintln!(
            "Config error: {} must be at least 1 - using default of {}",
            name, default
        );
        *value = default;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_missing_file_writes_defaults() {
        Jail::expect_with(|jail| {
            let path = jail.directory().join("nested").join("config.toml");
            let config = Config::load_from_path(&path);

            assert_eq!(config, Config::default());
            assert!(path.exists());

            let written = fs::read_to_string(&path).unwrap();
            assert!(written.contains("max_concurrent = 3"));
            Ok(())
        });
    }

    #[test]
    fn test_file_and_env_overrides() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                [scheduler]
                max_concurrent = 7
                reap_timeout_minutes = 30

                [sites]
                tag_match = "exact"
                "#,
            )?;
            jail.set_env("SITEPULSE_SCHEDULER__MAX_CONCURRENT", "5");
            jail.set_env("SITEPULSE_NOTIFY__NOTIFY_ON_EMPTY", "true");

            let config = Config::load_from_path(Path::new("config.toml"));
            assert_eq!(config.scheduler.max_concurrent, 5);
            assert_eq!(config.scheduler.reap_timeout_minutes, 30);
            assert!(config.notify.notify_on_empty);
            assert_eq!(config.sites.tag_match, TagMatch::Exact);
            assert_eq!(config.fetcher.max_urls, 50_000);
            Ok(())
        });
    }

    #[test]
    fn test_invalid_values_fall_back_to_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                [logging]
                sitepulse = " DEBUG "
                http = "loud"

                [scheduler]
                max_concurrent = 0
                reap_timeout_minutes = -5
                max_sites_per_pass = 0

                [fetcher]
                user_agent = ""
                max_urls = 0
                max_body_bytes = 0
                "#,
            )?;

            let config = Config::load_from_path(Path::new("config.toml"));
            assert_eq!(config.logging.sitepulse, "debug");
            assert_eq!(config.logging.http, "warn");
            assert_eq!(config.scheduler.max_concurrent, 3);
            assert_eq!(config.scheduler.reap_timeout_minutes, 60);
            assert_eq!(config.scheduler.max_sites_per_pass, None);
            assert_eq!(config.fetcher.user_agent, FetcherConfig::default().user_agent);
            assert_eq!(config.fetcher.max_urls, 50_000);
            assert_eq!(config.fetcher.max_body_bytes, 50 * 1024 * 1024);
            Ok(())
        });
    }

    #[test]
    fn test_log_spec() {
        let logging = LoggingConfig::default();
        assert_eq!(
            logging.log_spec(),
            "sitepulse=info,reqwest=warn,hyper=warn,hyper_util=warn,lettre=warn"
        );
    }
}
