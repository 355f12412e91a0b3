pub const CREATE_SCHEMA_SQL: &str = r#"
BEGIN TRANSACTION;

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', '1');

CREATE TABLE IF NOT EXISTS site_groups (
    group_id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id TEXT NOT NULL,
    name TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sites (
    site_id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id TEXT NOT NULL,
    root_url TEXT NOT NULL,
    sitemap_url TEXT,                   -- Resolved robots.txt or sitemap location
    enabled BOOLEAN NOT NULL DEFAULT 1,
    scan_priority INTEGER NOT NULL DEFAULT 3 CHECK (scan_priority BETWEEN 1 AND 5),
    scan_interval_minutes INTEGER NOT NULL DEFAULT 1440 CHECK (scan_interval_minutes BETWEEN 5 AND 10080),
    last_scan_at INTEGER,
    group_id INTEGER,
    tags TEXT,                          -- JSON array of tag strings
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    FOREIGN KEY (group_id) REFERENCES site_groups(group_id) ON DELETE SET NULL
);

CREATE INDEX IF NOT EXISTS idx_sites_owner ON sites (owner_id);
CREATE INDEX IF NOT EXISTS idx_sites_due ON sites (enabled, scan_priority, last_scan_at);

CREATE TABLE IF NOT EXISTS scans (
    scan_id INTEGER PRIMARY KEY AUTOINCREMENT,
    site_id INTEGER NOT NULL,
    status INTEGER NOT NULL,            -- 0 queued, 1 running, 2 success, 3 failed
    queued_at INTEGER NOT NULL,
    started_at INTEGER,
    finished_at INTEGER,
    error TEXT,
    added_count INTEGER,
    removed_count INTEGER,
    updated_count INTEGER,
    FOREIGN KEY (site_id) REFERENCES sites(site_id) ON DELETE CASCADE
);

-- At most one queued or running scan per site
CREATE UNIQUE INDEX IF NOT EXISTS idx_scans_one_active ON scans (site_id) WHERE status IN (0, 1);
CREATE INDEX IF NOT EXISTS idx_scans_status ON scans (status, queued_at);
CREATE INDEX IF NOT EXISTS idx_scans_site ON scans (site_id, scan_id);

CREATE TABLE IF NOT EXISTS urls (
    url_id INTEGER PRIMARY KEY AUTOINCREMENT,
    site_id INTEGER NOT NULL,
    loc TEXT NOT NULL,
    status INTEGER NOT NULL,            -- 0 active, 1 removed
    changefreq TEXT,
    priority TEXT,
    lastmod TEXT,
    first_seen_at INTEGER NOT NULL,
    last_seen_at INTEGER NOT NULL,
    FOREIGN KEY (site_id) REFERENCES sites(site_id) ON DELETE CASCADE,
    UNIQUE (site_id, loc)
);

CREATE INDEX IF NOT EXISTS idx_urls_first_seen ON urls (site_id, first_seen_at);

CREATE TABLE IF NOT EXISTS changes (
    change_id INTEGER PRIMARY KEY AUTOINCREMENT,
    site_id INTEGER NOT NULL,
    scan_id INTEGER NOT NULL,
    url_id INTEGER,
    loc TEXT,
    change_type TEXT NOT NULL,          -- 'added', 'removed', 'updated'
    detail TEXT,
    occurred_at INTEGER NOT NULL,
    FOREIGN KEY (site_id) REFERENCES sites(site_id) ON DELETE CASCADE,
    FOREIGN KEY (scan_id) REFERENCES scans(scan_id) ON DELETE CASCADE,
    FOREIGN KEY (url_id) REFERENCES urls(url_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_changes_scan ON changes (scan_id);
CREATE INDEX IF NOT EXISTS idx_changes_site ON changes (site_id, occurred_at);

CREATE TABLE IF NOT EXISTS notification_channels (
    channel_id INTEGER PRIMARY KEY AUTOINCREMENT,
    site_id INTEGER NOT NULL,
    channel_type TEXT NOT NULL CHECK (channel_type IN ('webhook', 'email', 'slack')),
    target TEXT NOT NULL,
    secret TEXT,
    created_at INTEGER NOT NULL,
    FOREIGN KEY (site_id) REFERENCES sites(site_id) ON DELETE CASCADE
);

-- Legacy per-site webhooks, still delivered alongside notification_channels
CREATE TABLE IF NOT EXISTS webhooks (
    webhook_id INTEGER PRIMARY KEY AUTOINCREMENT,
    site_id INTEGER NOT NULL,
    target_url TEXT NOT NULL,
    secret TEXT,
    created_at INTEGER NOT NULL,
    FOREIGN KEY (site_id) REFERENCES sites(site_id) ON DELETE CASCADE
);

COMMIT;
"#;
