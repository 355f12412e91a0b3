use log::info;
use serde::Serialize;
use url::Url;

use crate::database::Database;
use crate::diff;
use crate::error::SitePulseError;
use crate::fetcher::SitemapSource;
use crate::scans::Scan;
use crate::sites::{NewSite, Site, SitePatch};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveryResult {
    pub site: Site,
    pub baseline_scan_id: i64,
    pub url_count: usize,
}

fn validate_root_url(root_url: &str) -> Result<String, SitePulseError> {
    let parsed = Url::parse(root_url.trim())
        .map_err(|e| SitePulseError::InvalidInput(format!("invalid root URL '{}': {}", root_url, e)))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(SitePulseError::InvalidInput(format!(
            "root URL must be http or https: {}",
            root_url
        )));
    }

    Ok(parsed.as_str().trim_end_matches('/').to_owned())
}

/// Register a new site from its root URL.
///
/// The sitemap location is resolved and fetched first; the site, a zero-change baseline
/// scan, and the initial snapshot are then written in one transaction.
pub async fn discover(
    db: &Database,
    source: &dyn SitemapSource,
    owner_id: &str,
    root_url: &str,
    tags: Vec<String>,
) -> Result<DiscoveryResult, SitePulseError> {
    let root_url = validate_root_url(root_url)?;

    let location = source.resolve_sitemap_location(&root_url).await?;
    let urls = source.fetch_location(&location).await?;

    let new_site = NewSite {
        owner_id: owner_id.to_owned(),
        root_url,
        sitemap_url: Some(location),
        tags,
        ..Default::default()
    };

    let result = db
        .run_blocking(move |conn| {
            Database::immediate_transaction(conn, |c| {
                let now = chrono::Utc::now().timestamp();
                let mut site = Site::create(c, &new_site)?;
                let baseline_scan_id = Scan::insert_baseline_immediate(c, site.site_id, now)?;
                let url_count = diff::seed_snapshot_immediate(c, site.site_id, &urls, now)?;
                Site::set_last_scan_at(c, site.site_id, now)?;
                site.last_scan_at = Some(now);

                Ok(DiscoveryResult {
                    site,
                    baseline_scan_id,
                    url_count,
                })
            })
        })
        .await?;

    info!(
        "Discovered site {} ({}) with {} urls",
        result.site.site_id, result.site.root_url, result.url_count
    );

    Ok(result)
}

/// Point an existing site at a new root URL and re-resolve its sitemap location.
///
/// The stored snapshot is kept; the next scan reports the difference.
pub async fn rediscover_site(
    db: &Database,
    source: &dyn SitemapSource,
    site_id: i64,
    owner_id: &str,
    new_root_url: &str,
    tags: Option<Vec<String>>,
) -> Result<Site, SitePulseError> {
    let owner = owner_id.to_owned();
    db.run_blocking(move |conn| Site::get_for_owner(conn, site_id, &owner))
        .await?;

    let root_url = validate_root_url(new_root_url)?;
    let location = source.resolve_sitemap_location(&root_url).await?;

    let patch = SitePatch {
        root_url: Some(root_url),
        sitemap_url: Some(Some(location)),
        tags,
        ..Default::default()
    };

    let site = db
        .run_blocking(move |conn| Site::update(conn, site_id, &patch))
        .await?;

    info!(
        "Rediscovered site {}: {} -> {}",
        site.site_id,
        site.root_url,
        site.sitemap_url.as_deref().unwrap_or("-")
    );

    Ok(site)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scans::ScanStatus;
    use crate::test_support::{seed_site, sitemap_urls, test_db, StubSource};
    use crate::urls::UrlRecord;
    use pretty_assertions::assert_eq;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_discover_creates_site_with_baseline() {
        let (_dir, db) = test_db();
        let source = StubSource::new();
        source.set_resolved("https://new.example", "https://new.example/robots.txt");
        source.set_urls(
            "https://new.example/robots.txt",
            sitemap_urls(&["https://new.example/a", "https://new.example/b"]),
        );

        let result = discover(&db, &source, "o", "https://new.example/", vec!["news".into()])
            .await
            .unwrap();

        assert_eq!(result.url_count, 2);
        assert_eq!(result.site.root_url, "https://new.example");
        assert_eq!(
            result.site.sitemap_url.as_deref(),
            Some("https://new.example/robots.txt")
        );
        assert_eq!(result.site.tags, vec!["news"]);

        let conn = db.get_connection().unwrap();
        let scan = Scan::get_by_id(&conn, result.baseline_scan_id).unwrap().unwrap();
        assert_eq!(scan.status, ScanStatus::Success);
        assert_eq!(scan.added_count, Some(0));

        let changes: i64 = conn
            .query_row("SELECT COUNT(*) FROM changes", [], |row| row.get(0))
            .unwrap();
        assert_eq!(changes, 0);
        assert_eq!(UrlRecord::count_active(&conn, result.site.site_id).unwrap(), 2);

        let site = Site::get_by_id(&conn, result.site.site_id).unwrap().unwrap();
        assert!(site.last_scan_at.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_discover_failure_creates_nothing() {
        let (_dir, db) = test_db();
        let source = StubSource::new();

        let err = discover(&db, &source, "o", "https://nothing.example", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, SitePulseError::FetchFailure(_)));

        let err = discover(&db, &source, "o", "ftp://nothing.example", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, SitePulseError::InvalidInput(_)));

        let conn = db.get_connection().unwrap();
        assert!(Site::list_for_owner(&conn, "o").unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rediscover_checks_owner_and_repoints() {
        let (_dir, db) = test_db();
        let site = {
            let conn = db.get_connection().unwrap();
            seed_site(&conn, "o", "https://old.example")
        };

        let source = StubSource::new();
        source.set_resolved("https://moved.example", "https://moved.example/sitemap.xml");

        let err = rediscover_site(&db, &source, site.site_id, "intruder", "https://moved.example", None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let err = rediscover_site(&db, &source, 9999, "o", "https://moved.example", None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let updated = rediscover_site(
            &db,
            &source,
            site.site_id,
            "o",
            "https://moved.example",
            Some(vec!["moved".into()]),
        )
        .await
        .unwrap();
        assert_eq!(updated.root_url, "https://moved.example");
        assert_eq!(
            updated.sitemap_url.as_deref(),
            Some("https://moved.example/sitemap.xml")
        );
        assert_eq!(updated.tags, vec!["moved"]);
    }
}
