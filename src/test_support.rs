//! Shared fixtures for unit tests

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::Connection;
use tempfile::TempDir;

use crate::database::Database;
use crate::fetcher::{FetchError, SitemapSource, SitemapUrl};
use crate::scans::Scan;
use crate::sites::{NewSite, Site};

/// A fresh database in a temp directory. Keep the `TempDir` alive for the test's duration.
pub fn test_db() -> (TempDir, Database) {
    let dir = TempDir::new().expect("create temp dir");
    let db = Database::open(dir.path()).expect("open test database");
    (dir, db)
}

pub fn seed_site(conn: &Connection, owner_id: &str, root_url: &str) -> Site {
    Site::create(
        conn,
        &NewSite {
            owner_id: owner_id.to_owned(),
            root_url: root_url.to_owned(),
            sitemap_url: Some(format!("{}/sitemap.xml", root_url)),
            ..Default::default()
        },
    )
    .expect("seed site")
}

/// Enqueue and claim a scan, returning its id
pub fn running_scan(conn: &Connection, site_id: i64) -> i64 {
    let queued = Scan::enqueue(conn, site_id).expect("enqueue");
    Scan::start(conn, queued.scan_id).expect("start");
    queued.scan_id
}

pub fn sitemap_url(loc: &str) -> SitemapUrl {
    SitemapUrl::new(loc)
}

pub fn sitemap_urls(locs: &[&str]) -> Vec<SitemapUrl> {
    locs.iter().map(|loc| SitemapUrl::new(*loc)).collect()
}

/// In-memory [`SitemapSource`] keyed by sitemap location
#[derive(Default)]
pub struct StubSource {
    documents: Mutex<HashMap<String, Result<Vec<SitemapUrl>, String>>>,
    resolved: Mutex<HashMap<String, String>>,
}

impl StubSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_urls(&self, location: &str, urls: Vec<SitemapUrl>) {
        self.documents
            .lock()
            .unwrap()
            .insert(location.to_owned(), Ok(urls));
    }

    pub fn set_failure(&self, location: &str, message: &str) {
        self.documents
            .lock()
            .unwrap()
            .insert(location.to_owned(), Err(message.to_owned()));
    }

    pub fn set_resolved(&self, root_url: &str, location: &str) {
        self.resolved
            .lock()
            .unwrap()
            .insert(root_url.to_owned(), location.to_owned());
    }
}

#[async_trait]
impl SitemapSource for StubSource {
    async fn fetch_location(&self, location: &str) -> Result<Vec<SitemapUrl>, FetchError> {
        match self.documents.lock().unwrap().get(location) {
            Some(Ok(urls)) => Ok(urls.clone()),
            Some(Err(message)) => Err(FetchError::Parse {
                url: location.to_owned(),
                message: message.clone(),
            }),
            None => Err(FetchError::Http {
                url: location.to_owned(),
                status: 404,
            }),
        }
    }

    async fn resolve_sitemap_location(&self, root_url: &str) -> Result<String, FetchError> {
        self.resolved
            .lock()
            .unwrap()
            .get(root_url)
            .cloned()
            .ok_or_else(|| FetchError::NotDiscovered(root_url.to_owned()))
    }
}
