//! SQLite-backed object pools
//!
//! Lets several worker processes share one on-disk metadata pool. Every
//! pool operation is a single SQL statement, so SQLite's own locking gives
//! the same per-object atomicity the engine expects from a cluster.

use anyhow::Context;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{Cluster, CreateOutcome, ObjectPool};
use crate::error::StoreError;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

type SharedConnection = Arc<Mutex<Connection>>;

fn lock(conn: &SharedConnection) -> Result<MutexGuard<'_, Connection>, StoreError> {
    conn.lock()
        .map_err(|_| StoreError::Backend("sqlite connection lock poisoned".to_string()))
}

/// A database file holding any number of pools
pub struct SqliteCluster {
    conn: SharedConnection,
    db_path: PathBuf,
}

impl SqliteCluster {
    /// Open or create a store at the specified path
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let db_path = path.as_ref().to_path_buf();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("Failed to create store directory")?;
            }
        }

        let conn = Connection::open(&db_path)
            .context(format!("Failed to open store at {}", db_path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // journal_mode reports the resulting mode as a row
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
            .context("Failed to enable WAL mode")?;

        let cluster = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path,
        };
        cluster.initialize_schema()?;

        tracing::debug!("Opened metadata store {}", cluster.db_path.display());
        Ok(cluster)
    }

    /// Get the default store path (~/.datascan/metadata.db)
    pub fn default_path() -> anyhow::Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".datascan").join("metadata.db"))
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn initialize_schema(&self) -> anyhow::Result<()> {
        let conn = lock(&self.conn)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS pools (
                id INTEGER PRIMARY KEY
            );

            CREATE TABLE IF NOT EXISTS objects (
                pool INTEGER NOT NULL,
                oid TEXT NOT NULL,
                data BLOB NOT NULL,
                omap_header BLOB NOT NULL,
                PRIMARY KEY (pool, oid)
            );

            CREATE TABLE IF NOT EXISTS omap (
                pool INTEGER NOT NULL,
                oid TEXT NOT NULL,
                key TEXT NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (pool, oid, key)
            );
            "#,
        )
        .context("Failed to initialize store schema")?;
        Ok(())
    }

    /// Register a pool id; a no-op if it already exists
    pub fn create_pool(&self, pool_id: i64) -> Result<(), StoreError> {
        let conn = lock(&self.conn)?;
        conn.execute("INSERT OR IGNORE INTO pools (id) VALUES (?1)", params![pool_id])?;
        Ok(())
    }
}

impl Cluster for SqliteCluster {
    fn open_pool(&self, pool_id: i64) -> Result<Arc<dyn ObjectPool>, StoreError> {
        let known = {
            let conn = lock(&self.conn)?;
            conn.query_row(
                "SELECT 1 FROM pools WHERE id = ?1",
                params![pool_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some()
        };
        if !known {
            return Err(StoreError::NoSuchPool(pool_id));
        }
        Ok(Arc::new(SqlitePool {
            conn: self.conn.clone(),
            pool_id,
        }))
    }
}

/// One pool inside a [`SqliteCluster`]
pub struct SqlitePool {
    conn: SharedConnection,
    pool_id: i64,
}

impl ObjectPool for SqlitePool {
    fn pool_id(&self) -> i64 {
        self.pool_id
    }

    fn exists(&self, oid: &str) -> Result<bool, StoreError> {
        let conn = lock(&self.conn)?;
        let found = conn
            .query_row(
                "SELECT 1 FROM objects WHERE pool = ?1 AND oid = ?2",
                params![self.pool_id, oid],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn create(
        &self,
        oid: &str,
        data: &[u8],
        omap_header: &[u8],
    ) -> Result<CreateOutcome, StoreError> {
        let conn = lock(&self.conn)?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO objects (pool, oid, data, omap_header) VALUES (?1, ?2, ?3, ?4)",
            params![self.pool_id, oid, data, omap_header],
        )?;
        Ok(if inserted == 1 {
            CreateOutcome::Created
        } else {
            CreateOutcome::Exists
        })
    }

    fn read(&self, oid: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let conn = lock(&self.conn)?;
        Ok(conn
            .query_row(
                "SELECT data FROM objects WHERE pool = ?1 AND oid = ?2",
                params![self.pool_id, oid],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn omap_get_header(&self, oid: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let conn = lock(&self.conn)?;
        Ok(conn
            .query_row(
                "SELECT omap_header FROM objects WHERE pool = ?1 AND oid = ?2",
                params![self.pool_id, oid],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn omap_get(&self, oid: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let conn = lock(&self.conn)?;
        Ok(conn
            .query_row(
                "SELECT value FROM omap WHERE pool = ?1 AND oid = ?2 AND key = ?3",
                params![self.pool_id, oid, key],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn omap_set(&self, oid: &str, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let conn = lock(&self.conn)?;
        let written = conn.execute(
            r#"
            INSERT OR REPLACE INTO omap (pool, oid, key, value)
            SELECT ?1, ?2, ?3, ?4
            WHERE EXISTS (SELECT 1 FROM objects WHERE pool = ?1 AND oid = ?2)
            "#,
            params![self.pool_id, oid, key, value],
        )?;
        if written == 0 {
            return Err(StoreError::NoSuchObject(oid.to_string()));
        }
        Ok(())
    }

    fn omap_keys(&self, oid: &str) -> Result<Vec<String>, StoreError> {
        let conn = lock(&self.conn)?;
        let mut stmt =
            conn.prepare("SELECT key FROM omap WHERE pool = ?1 AND oid = ?2 ORDER BY key")?;
        let keys = stmt
            .query_map(params![self.pool_id, oid], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    fn list_objects(&self) -> Result<Vec<String>, StoreError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare("SELECT oid FROM objects WHERE pool = ?1 ORDER BY oid")?;
        let oids = stmt
            .query_map(params![self.pool_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(oids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_pool_must_be_created() {
        let temp_dir = TempDir::new().unwrap();
        let cluster = SqliteCluster::open(temp_dir.path().join("meta.db")).unwrap();

        assert!(matches!(
            cluster.open_pool(1),
            Err(StoreError::NoSuchPool(1))
        ));
        cluster.create_pool(1).unwrap();
        cluster.create_pool(1).unwrap();
        assert!(cluster.open_pool(1).is_ok());
    }

    #[test]
    fn test_create_and_omap() {
        let temp_dir = TempDir::new().unwrap();
        let cluster = SqliteCluster::open(temp_dir.path().join("meta.db")).unwrap();
        cluster.create_pool(1).unwrap();
        let pool = cluster.open_pool(1).unwrap();

        assert!(pool.create("1.00000000", b"", b"fnode").unwrap().created());
        assert!(!pool.create("1.00000000", b"", b"other").unwrap().created());
        assert_eq!(
            pool.omap_get_header("1.00000000").unwrap(),
            Some(b"fnode".to_vec())
        );

        assert!(matches!(
            pool.omap_set("2.00000000", "x_head", b"v"),
            Err(StoreError::NoSuchObject(_))
        ));
        pool.omap_set("1.00000000", "x_head", b"v1").unwrap();
        pool.omap_set("1.00000000", "x_head", b"v2").unwrap();
        assert_eq!(
            pool.omap_get("1.00000000", "x_head").unwrap(),
            Some(b"v2".to_vec())
        );
        assert_eq!(pool.omap_keys("1.00000000").unwrap(), vec!["x_head"]);
        assert_eq!(pool.list_objects().unwrap(), vec!["1.00000000"]);
    }

    #[test]
    fn test_pools_are_isolated() {
        let temp_dir = TempDir::new().unwrap();
        let cluster = SqliteCluster::open(temp_dir.path().join("meta.db")).unwrap();
        cluster.create_pool(1).unwrap();
        cluster.create_pool(2).unwrap();

        let meta = cluster.open_pool(1).unwrap();
        let data = cluster.open_pool(2).unwrap();
        meta.create("a", b"x", b"").unwrap();

        assert!(meta.exists("a").unwrap());
        assert!(!data.exists("a").unwrap());
        assert_eq!(data.read("a").unwrap(), None);
    }
}
