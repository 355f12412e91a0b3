use log::{error, info};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::SitePulseError;
use crate::schema::CREATE_SCHEMA_SQL;

const DB_FILENAME: &str = "sitepulse.db";
const SCHEMA_VERSION: &str = "1";
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);
const POOL_SIZE: u32 = 8;

pub type PooledConn = PooledConnection<SqliteConnectionManager>;

/// Handle to the snapshot store.
///
/// Cloning is cheap: every clone shares the same connection pool. Connections are
/// opened in WAL mode with a busy timeout so that concurrent writers serialize on
/// `BEGIN IMMEDIATE` instead of failing with SQLITE_BUSY.
#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
    path: PathBuf,
}

impl Database {
    /// Open (or create) the database file inside `db_dir`
    pub fn open(db_dir: &Path) -> Result<Self, SitePulseError> {
        fs::create_dir_all(db_dir)?;
        Self::open_path(&db_dir.join(DB_FILENAME))
    }

    pub fn open_path(db_path: &Path) -> Result<Self, SitePulseError> {
        let manager = SqliteConnectionManager::file(db_path).with_init(|c| {
            c.busy_timeout(BUSY_TIMEOUT)?;
            c.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
            c.execute_batch("PRAGMA foreign_keys = ON;")
        });

        let pool = Pool::builder().max_size(POOL_SIZE).build(manager)?;

        let db = Database {
            pool,
            path: db_path.to_owned(),
        };

        db.ensure_schema()?;
        info!("Database opened at: {}", db_path.display());

        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_connection(&self) -> Result<PooledConn, SitePulseError> {
        Ok(self.pool.get()?)
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction.
    ///
    /// The write lock is taken up front, so a read-then-write inside `f` cannot interleave
    /// with another writer. Commits when `f` succeeds and rolls back otherwise.
    ///
    /// Functions with an `_immediate` suffix expect to be called from inside `f`.
    pub fn immediate_transaction<T, F>(conn: &Connection, f: F) -> Result<T, SitePulseError>
    where
        F: FnOnce(&Connection) -> Result<T, SitePulseError>,
    {
        conn.execute_batch("BEGIN IMMEDIATE")?;

        match f(conn) {
            Ok(value) => {
                if let Err(e) = conn.execute_batch("COMMIT") {
                    Self::rollback(conn);
                    return Err(e.into());
                }
                Ok(value)
            }
            Err(e) => {
                Self::rollback(conn);
                Err(e)
            }
        }
    }

    /// Run synchronous store work on the blocking pool with a pooled connection
    pub async fn run_blocking<T, F>(&self, f: F) -> Result<T, SitePulseError>
    where
        F: FnOnce(&Connection) -> Result<T, SitePulseError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.get_connection()?;
            f(&conn)
        })
        .await
        .map_err(|e| SitePulseError::Error(format!("Blocking task failed: {}", e)))?
    }

    fn rollback(conn: &Connection) {
        if let Err(e) = conn.execute_batch("ROLLBACK") {
            error!("Failed to roll back transaction: {}", e);
        }
    }

    pub fn get_meta_value(conn: &Connection, key: &str) -> Result<Option<String>, SitePulseError> {
        conn.query_row("SELECT value FROM meta WHERE key = ?", [key], |row| {
            row.get(0)
        })
        .optional()
        .map_err(SitePulseError::DatabaseError)
    }

    fn ensure_schema(&self) -> Result<(), SitePulseError> {
        let conn = self.get_connection()?;

        let table_exists: bool = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='meta'",
                [],
                |row| row.get::<_, i32>(0),
            )
            .map(|count| count > 0)?;

        if !table_exists {
            info!("Creating database schema (version {})", SCHEMA_VERSION);
            conn.execute_batch(CREATE_SCHEMA_SQL)?;
            return Ok(());
        }

        match Self::get_meta_value(&conn, "schema_version")?.as_deref() {
            Some(SCHEMA_VERSION) => Ok(()), // Schema is up to date
            Some(other) => Err(SitePulseError::Error(format!(
                "Schema version mismatch: database is at version {}, expected {}",
                other, SCHEMA_VERSION
            ))),
            None => Err(SitePulseError::Error("Schema version missing".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_db;

    #[test]
    fn test_open_creates_schema() {
        let (_dir, db) = test_db();
        let conn = db.get_connection().unwrap();

        let version = Database::get_meta_value(&conn, "schema_version").unwrap();
        assert_eq!(version.as_deref(), Some(SCHEMA_VERSION));

        for table in ["sites", "scans", "urls", "changes", "notification_channels", "webhooks"] {
            let count: i64 = conn
                .query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type='table' AND name=?",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }

    #[test]
    fn test_reopen_existing_database() {
        let (dir, db) = test_db();
        let path = db.path().to_owned();
        drop(db);

        let reopened = Database::open_path(&path);
        assert!(reopened.is_ok());
        drop(dir);
    }

    #[test]
    fn test_immediate_transaction_rolls_back_on_error() {
        let (_dir, db) = test_db();
        let conn = db.get_connection().unwrap();

        let result: Result<(), SitePulseError> = Database::immediate_transaction(&conn, |c| {
            c.execute(
                "INSERT INTO meta (key, value) VALUES ('scratch', 'x')",
                [],
            )?;
            Err(SitePulseError::Error("boom".into()))
        });
        assert!(result.is_err());

        let value = Database::get_meta_value(&conn, "scratch").unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn test_immediate_transaction_commits() {
        let (_dir, db) = test_db();
        let conn = db.get_connection().unwrap();

        Database::immediate_transaction(&conn, |c| {
            c.execute(
                "INSERT INTO meta (key, value) VALUES ('scratch', 'y')",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let value = Database::get_meta_value(&conn, "scratch").unwrap();
        assert_eq!(value.as_deref(), Some("y"));
    }
}
