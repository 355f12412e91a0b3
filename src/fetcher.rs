use std::collections::{HashSet, VecDeque};
use std::io::Cursor;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Serialize;
use sitemap::reader::{SiteMapEntity, SiteMapReader};
use sitemap::structs::{ChangeFreq, LastMod, Priority};
use thiserror::Error;
use url::Url;

use crate::config::FetcherConfig;
use crate::error::SitePulseError;
use crate::sites::Site;

/// Well-known locations probed when robots.txt declares no sitemap
const PROBE_PATHS: [&str; 2] = ["/sitemap.xml", "/sitemap_index.xml"];

/// One `<url>` entry of a sitemap
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SitemapUrl {
    pub loc: String,
    pub changefreq: Option<String>,
    pub priority: Option<String>,
    pub lastmod: Option<String>,
}

impl SitemapUrl {
    pub fn new(loc: impl Into<String>) -> Self {
        SitemapUrl {
            loc: loc.into(),
            changefreq: None,
            priority: None,
            lastmod: None,
        }
    }
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}")]
    Http { url: String, status: u16 },

    #[error("could not parse {url}: {message}")]
    Parse { url: String, message: String },

    /// A crawl bound was hit. The result is discarded rather than truncated.
    #[error("{bound} limit of {limit} exceeded at {url}")]
    LimitExceeded {
        url: String,
        bound: &'static str,
        limit: usize,
    },

    #[error("no sitemap found for {0}")]
    NotDiscovered(String),

    #[error("invalid URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    #[error("sitemap fetch timed out after {0} seconds")]
    TimedOut(u64),
}

/// Source of a site's current URL set
#[async_trait]
pub trait SitemapSource: Send + Sync {
    /// Fetch every URL reachable from a sitemap, sitemap index, or robots.txt location
    async fn fetch_location(&self, location: &str) -> Result<Vec<SitemapUrl>, FetchError>;

    /// Find the sitemap location for a site root
    async fn resolve_sitemap_location(&self, root_url: &str) -> Result<String, FetchError>;

    async fn fetch(&self, site: &Site) -> Result<Vec<SitemapUrl>, FetchError> {
        let location = match &site.sitemap_url {
            Some(location) => location.clone(),
            None => self.resolve_sitemap_location(&site.root_url).await?,
        };
        self.fetch_location(&location).await
    }
}

/// Content of one fetched document
#[derive(Debug, Default, PartialEq)]
struct ParsedDocument {
    urls: Vec<SitemapUrl>,
    sitemaps: Vec<String>,
}

/// HTTP implementation of [`SitemapSource`]
pub struct SitemapFetcher {
    client: reqwest::Client,
    config: FetcherConfig,
}

impl SitemapFetcher {
    pub fn new(config: &FetcherConfig) -> Result<Self, SitePulseError> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| SitePulseError::Error(format!("Failed to build HTTP client: {}", e)))?;

        Ok(SitemapFetcher {
            client,
            config: config.clone(),
        })
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| FetchError::Network {
                url: url.to_owned(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Http {
                url: url.to_owned(),
                status: status.as_u16(),
            });
        }

        Ok(response)
    }

    async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        let body = self.get_bytes(url).await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    /// Read a response body, failing as soon as it grows past `max_body_bytes`
    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let limit = self.config.max_body_bytes;
        let mut response = self.get(url).await?;

        if let Some(length) = response.content_length() {
            if length > limit as u64 {
                return Err(body_too_large(url, limit));
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|source| FetchError::Network {
                url: url.to_owned(),
                source,
            })?
        {
            if body.len() + chunk.len() > limit {
                return Err(body_too_large(url, limit));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(body)
    }

    /// Sitemap declarations of the robots.txt at `location`
    async fn robots_sitemaps(&self, location: &str) -> Result<Vec<String>, FetchError> {
        let text = self.get_text(location).await?;
        Ok(sitemaps_from_robots(&text))
    }
}

#[async_trait]
impl SitemapSource for SitemapFetcher {
    async fn fetch_location(&self, location: &str) -> Result<Vec<SitemapUrl>, FetchError> {
        let roots = if is_robots_location(location) {
            let declared = self.robots_sitemaps(location).await?;
            if declared.is_empty() {
                return Err(FetchError::NotDiscovered(location.to_owned()));
            }
            declared
        } else {
            vec![location.to_owned()]
        };

        let mut queue: VecDeque<(String, usize)> = roots.into_iter().map(|r| (r, 0)).collect();
        let mut visited: HashSet<String> = HashSet::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut urls: Vec<SitemapUrl> = Vec::new();

        while let Some((sitemap_url, depth)) = queue.pop_front() {
            if !visited.insert(sitemap_url.clone()) {
                debug!("Skipping already visited sitemap {}", sitemap_url);
                continue;
            }

            if visited.len() > self.config.max_sitemaps {
                return Err(FetchError::LimitExceeded {
                    url: sitemap_url,
                    bound: "sitemap document",
                    limit: self.config.max_sitemaps,
                });
            }

            let body = self.get_bytes(&sitemap_url).await?;
            let document = parse_document(&sitemap_url, &body)?;
            debug!(
                "Parsed {}: {} urls, {} child sitemaps",
                sitemap_url,
                document.urls.len(),
                document.sitemaps.len()
            );

            for url in document.urls {
                if !seen.insert(url.loc.clone()) {
                    continue;
                }
                urls.push(url);
                if urls.len() > self.config.max_urls {
                    return Err(FetchError::LimitExceeded {
                        url: sitemap_url,
                        bound: "url",
                        limit: self.config.max_urls,
                    });
                }
            }

            for child in document.sitemaps {
                if visited.contains(&child) {
                    continue;
                }
                if depth + 1 > self.config.max_depth {
                    return Err(FetchError::LimitExceeded {
                        url: child,
                        bound: "sitemap index depth",
                        limit: self.config.max_depth,
                    });
                }
                queue.push_back((child, depth + 1));
            }
        }

        info!(
            "Fetched {} urls from {} sitemap document(s) at {}",
            urls.len(),
            visited.len(),
            location
        );

        Ok(urls)
    }

    async fn resolve_sitemap_location(&self, root_url: &str) -> Result<String, FetchError> {
        let root = Url::parse(root_url).map_err(|e| FetchError::InvalidUrl {
            url: root_url.to_owned(),
            message: e.to_string(),
        })?;

        let robots = join_path(&root, "/robots.txt")?;
        match self.robots_sitemaps(&robots).await {
            Ok(declared) if !declared.is_empty() => {
                info!("Using robots.txt sitemap declarations for {}", root_url);
                return Ok(robots);
            }
            Ok(_) => debug!("robots.txt for {} declares no sitemaps", root_url),
            Err(e) => debug!("robots.txt unavailable for {}: {}", root_url, e),
        }

        for probe in PROBE_PATHS {
            let candidate = join_path(&root, probe)?;
            let parsed = match self.get_bytes(&candidate).await {
                Ok(body) => parse_document(&candidate, &body),
                Err(e) => Err(e),
            };
            match parsed {
                Ok(_) => {
                    info!("Found sitemap for {} at {}", root_url, candidate);
                    return Ok(candidate);
                }
                Err(e) => debug!("No sitemap at {}: {}", candidate, e),
            }
        }

        warn!("No sitemap discovered for {}", root_url);
        Err(FetchError::NotDiscovered(root_url.to_owned()))
    }
}

fn body_too_large(url: &str, limit: usize) -> FetchError {
    FetchError::LimitExceeded {
        url: url.to_owned(),
        bound: "document size",
        limit,
    }
}

fn join_path(root: &Url, path: &str) -> Result<String, FetchError> {
    root.join(path)
        .map(|u| u.to_string())
        .map_err(|e| FetchError::InvalidUrl {
            url: root.to_string(),
            message: e.to_string(),
        })
}

fn is_robots_location(location: &str) -> bool {
    match Url::parse(location) {
        Ok(url) => url.path().to_ascii_lowercase().ends_with("/robots.txt"),
        Err(_) => location.to_ascii_lowercase().ends_with("robots.txt"),
    }
}

/// `Sitemap:` declarations in a robots.txt body, in order, without duplicates
pub fn sitemaps_from_robots(text: &str) -> Vec<String> {
    let mut sitemaps: Vec<String> = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if !key.trim().eq_ignore_ascii_case("sitemap") {
            continue;
        }
        let value = value.trim();
        if !value.is_empty() && !sitemaps.iter().any(|s| s == value) {
            sitemaps.push(value.to_owned());
        }
    }
    sitemaps
}

fn parse_document(url: &str, body: &[u8]) -> Result<ParsedDocument, FetchError> {
    let mut document = ParsedDocument::default();

    for entity in SiteMapReader::new(Cursor::new(body)) {
        match entity {
            SiteMapEntity::Url(entry) => {
                let Some(loc) = entry.loc.get_url() else {
                    continue;
                };
                document.urls.push(SitemapUrl {
                    loc: loc.to_string(),
                    changefreq: changefreq_name(&entry.changefreq).map(str::to_owned),
                    priority: match entry.priority {
                        Priority::Value(value) => Some(format!("{}", value)),
                        _ => None,
                    },
                    lastmod: match entry.lastmod {
                        LastMod::DateTime(dt) => Some(dt.to_rfc3339()),
                        _ => None,
                    },
                });
            }
            SiteMapEntity::SiteMap(entry) => {
                if let Some(loc) = entry.loc.get_url() {
                    document.sitemaps.push(loc.to_string());
                }
            }
            SiteMapEntity::Err(e) => {
                return Err(FetchError::Parse {
                    url: url.to_owned(),
                    message: format!("{:?}", e),
                });
            }
        }
    }

    if document.urls.is_empty() && document.sitemaps.is_empty() {
        let text = String::from_utf8_lossy(body);
        if !text.contains("<urlset") && !text.contains("<sitemapindex") {
            return Err(FetchError::Parse {
                url: url.to_owned(),
                message: "document is not a sitemap or sitemap index".to_string(),
            });
        }
    }

    Ok(document)
}

fn changefreq_name(changefreq: &ChangeFreq) -> Option<&'static str> {
    match changefreq {
        ChangeFreq::Always => Some("always"),
        ChangeFreq::Hourly => Some("hourly"),
        ChangeFreq::Daily => Some("daily"),
        ChangeFreq::Weekly => Some("weekly"),
        ChangeFreq::Monthly => Some("monthly"),
        ChangeFreq::Yearly => Some("yearly"),
        ChangeFreq::Never => Some("never"),
        #[allow(unreachable_patterns)]
        _ => None,
    }
}
