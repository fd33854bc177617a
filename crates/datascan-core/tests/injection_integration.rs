//! Injection behaviour of the metadata backend against an in-memory pool

use chrono::{DateTime, Utc};
use datascan_core::driver::{MetadataDriver, RecoveryDriver};
use datascan_core::error::{ScanError, StoreError};
use datascan_core::model::{
    dirfrag_object_name, inode_object_name, mdsdir_ino, Decode, Dentry, Frag, InodeBacktrace,
    InodeRecord, LOST_AND_FOUND_INO, ROOT_INO,
};
use datascan_core::store::{CreateOutcome, MemoryPool, ObjectPool};
use std::sync::{Arc, Mutex};

const DATA_POOL: i64 = 2;

fn mtime() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

/// /home/user/file.txt
fn nested_backtrace() -> InodeBacktrace {
    InodeBacktrace::new(0x10000000003, DATA_POOL)
        .with_ancestor(0x10000000002, "file.txt", 9)
        .with_ancestor(0x10000000001, "user", 5)
        .with_ancestor(ROOT_INO, "home", 3)
}

type Snapshot = Vec<(String, Option<Vec<u8>>, Option<Vec<u8>>, Vec<(String, Vec<u8>)>)>;

fn snapshot(pool: &dyn ObjectPool) -> Snapshot {
    pool.list_objects()
        .unwrap()
        .into_iter()
        .map(|oid| {
            let data = pool.read(&oid).unwrap();
            let header = pool.omap_get_header(&oid).unwrap();
            let omap = pool
                .omap_keys(&oid)
                .unwrap()
                .into_iter()
                .map(|key| {
                    let value = pool.omap_get(&oid, &key).unwrap().unwrap();
                    (key, value)
                })
                .collect();
            (oid, data, header, omap)
        })
        .collect()
}

/// Records every mutation, and optionally refuses to create one object
struct InstrumentedPool {
    inner: MemoryPool,
    fail_create: Option<String>,
    log: Mutex<Vec<(String, String, Option<Vec<u8>>)>>,
}

impl InstrumentedPool {
    fn new(fail_create: Option<String>) -> Self {
        Self {
            inner: MemoryPool::new(1),
            fail_create,
            log: Mutex::new(Vec::new()),
        }
    }

    fn log(&self) -> Vec<(String, String, Option<Vec<u8>>)> {
        self.log.lock().unwrap().clone()
    }
}

impl ObjectPool for InstrumentedPool {
    fn pool_id(&self) -> i64 {
        self.inner.pool_id()
    }

    fn exists(&self, oid: &str) -> Result<bool, StoreError> {
        self.inner.exists(oid)
    }

    fn create(&self, oid: &str, data: &[u8], omap_header: &[u8]) -> Result<CreateOutcome, StoreError> {
        if self.fail_create.as_deref() == Some(oid) {
            return Err(StoreError::Backend(format!("injected failure creating {}", oid)));
        }
        let outcome = self.inner.create(oid, data, omap_header)?;
        if outcome.created() {
            self.log
                .lock()
                .unwrap()
                .push(("create".to_string(), oid.to_string(), None));
        }
        Ok(outcome)
    }

    fn read(&self, oid: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.read(oid)
    }

    fn omap_get_header(&self, oid: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.omap_get_header(oid)
    }

    fn omap_get(&self, oid: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.omap_get(oid, key)
    }

    fn omap_set(&self, oid: &str, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.inner.omap_set(oid, key, value)?;
        self.log
            .lock()
            .unwrap()
            .push(("set".to_string(), oid.to_string(), Some(value.to_vec())));
        Ok(())
    }

    fn omap_keys(&self, oid: &str) -> Result<Vec<String>, StoreError> {
        self.inner.omap_keys(oid)
    }

    fn list_objects(&self) -> Result<Vec<String>, StoreError> {
        self.inner.list_objects()
    }
}

fn initialized_driver() -> (MetadataDriver, Arc<MemoryPool>) {
    let pool = Arc::new(MemoryPool::new(1));
    let driver = MetadataDriver::with_pool(pool.clone());
    driver.init_metadata(DATA_POOL).unwrap();
    (driver, pool)
}

#[test]
fn test_injection_is_idempotent() {
    let (driver, pool) = initialized_driver();
    let bt = nested_backtrace();

    driver
        .inject_with_backtrace(&bt, 4096, mtime(), 1 << 22, DATA_POOL)
        .unwrap();
    let first = snapshot(pool.as_ref());

    driver
        .inject_with_backtrace(&bt, 4096, mtime(), 1 << 22, DATA_POOL)
        .unwrap();
    assert_eq!(snapshot(pool.as_ref()), first);

    let paths = driver.list_paths().unwrap();
    assert_eq!(
        paths,
        vec![
            "/home",
            "/home/user",
            "/home/user/file.txt",
            "/lost+found",
        ]
    );

    let dentry = driver
        .read_dentry(0x10000000002, Frag::ROOT, "file.txt")
        .unwrap()
        .unwrap();
    let inode = dentry.inode().unwrap();
    assert_eq!(inode.size, 4096);
    assert_eq!(inode.mtime, mtime());
    assert_eq!(inode.layout.object_size, 1 << 22);
    assert_eq!(inode.layout.pool_id, DATA_POOL);
    assert_eq!(inode.version, 9);
}

#[test]
fn test_ancestors_linked_before_children() {
    let pool = Arc::new(InstrumentedPool::new(None));
    let driver = MetadataDriver::with_pool(pool.clone());
    driver
        .inject_with_backtrace(&nested_backtrace(), 1, mtime(), 4096, DATA_POOL)
        .unwrap();

    let log = pool.log();
    for (i, (op, oid, value)) in log.iter().enumerate() {
        let earlier = &log[..i];
        if op == "set" {
            // Dentries only land in fragments that already exist
            assert!(earlier.iter().any(|(o, id, _)| o == "create" && id == oid));
            // A linked directory's own fragment does not exist yet, or was
            // bootstrapped as a root
            let dentry = Dentry::from_bytes(value.as_ref().unwrap()).unwrap();
            if dentry.inode().map(InodeRecord::is_dir).unwrap_or(false) {
                let child_frag = dirfrag_object_name(dentry.ino(), Frag::ROOT);
                assert!(
                    !earlier.iter().any(|(_, id, _)| *id == child_frag),
                    "fragment {} created before its dentry",
                    child_frag
                );
            }
        }
        if op == "create" && oid.ends_with(".00000000") && oid != &dirfrag_object_name(ROOT_INO, Frag::ROOT) {
            // Every non-root fragment belongs to a directory already linked
            let ino = u64::from_str_radix(oid.trim_end_matches(".00000000"), 16).unwrap();
            let linked = earlier.iter().any(|(o, _, v)| {
                o == "set" && Dentry::from_bytes(v.as_ref().unwrap()).unwrap().ino() == ino
            });
            assert!(linked, "fragment {} created before any link to it", oid);
        }
    }
}

#[test]
fn test_root_init_is_idempotent() {
    let (driver, pool) = initialized_driver();
    let first = snapshot(pool.as_ref());
    driver.init_metadata(DATA_POOL).unwrap();
    assert_eq!(snapshot(pool.as_ref()), first);
    assert!(driver.check_roots().unwrap());

    let root = driver.read_root_inode(ROOT_INO).unwrap().unwrap();
    assert!(root.is_dir());
    assert!(driver.root_exists(mdsdir_ino(0)).unwrap());
}

#[test]
fn test_check_roots_reports_each_missing_piece() {
    let pool = Arc::new(MemoryPool::new(1));
    let driver = MetadataDriver::with_pool(pool.clone());
    assert!(!driver.check_roots().unwrap());

    driver.inject_unlinked_inode(ROOT_INO, 0o755, DATA_POOL).unwrap();
    driver.find_or_create_dirfrag(ROOT_INO).unwrap();
    assert!(!driver.check_roots().unwrap());

    driver
        .inject_unlinked_inode(mdsdir_ino(0), 0o700, DATA_POOL)
        .unwrap();
    assert!(!driver.check_roots().unwrap());

    // Linked but without its own fragment
    let lost_and_found = InodeRecord::directory(LOST_AND_FOUND_INO, 0o755, DATA_POOL, 1);
    driver
        .inject_linkage(ROOT_INO, "lost+found", &lost_and_found)
        .unwrap();
    assert!(!driver.check_roots().unwrap());

    driver.find_or_create_dirfrag(LOST_AND_FOUND_INO).unwrap();
    assert!(driver.check_roots().unwrap());
}

#[test]
fn test_check_roots_before_init_is_an_error() {
    let driver = MetadataDriver::new();
    assert!(matches!(
        driver.check_roots(),
        Err(ScanError::NotInitialized(_))
    ));
}

#[test]
fn test_orphan_bootstraps_lost_and_found() {
    let pool = Arc::new(MemoryPool::new(1));
    let driver = MetadataDriver::with_pool(pool.clone());

    driver
        .inject_lost_and_found(42, 512, mtime(), 4096, DATA_POOL)
        .unwrap();

    assert!(pool.exists(&inode_object_name(ROOT_INO)).unwrap());
    let dentry = driver
        .read_dentry(LOST_AND_FOUND_INO, Frag::ROOT, "42")
        .unwrap()
        .unwrap();
    assert_eq!(dentry.ino(), 42);
    assert_eq!(dentry.inode().unwrap().size, 512);
    assert_eq!(
        driver.list_paths().unwrap(),
        vec!["/lost+found", "/lost+found/42"]
    );
}

#[test]
fn test_failed_ancestor_leaves_leaf_unlinked() {
    let user_frag = dirfrag_object_name(0x10000000001, Frag::ROOT);
    let pool = Arc::new(InstrumentedPool::new(Some(user_frag)));
    let driver = MetadataDriver::with_pool(pool.clone());
    driver.init_metadata(DATA_POOL).unwrap();

    let err = driver
        .inject_with_backtrace(&nested_backtrace(), 1, mtime(), 4096, DATA_POOL)
        .unwrap_err();
    assert!(matches!(err, ScanError::Store(StoreError::Backend(_))));

    // /home got linked, nothing below it did
    assert_eq!(driver.list_paths().unwrap(), vec!["/home", "/lost+found"]);
    assert!(driver
        .read_dentry(0x10000000002, Frag::ROOT, "file.txt")
        .unwrap()
        .is_none());
}

#[test]
fn test_conflicting_dentry_is_overwritten() {
    let (driver, _) = initialized_driver();

    let old = InodeBacktrace::new(0x10000000010, DATA_POOL).with_ancestor(ROOT_INO, "report", 1);
    driver
        .inject_with_backtrace(&old, 10, mtime(), 4096, DATA_POOL)
        .unwrap();

    // Same name now recorded as a directory holding a newer file
    let new = InodeBacktrace::new(0x10000000012, DATA_POOL)
        .with_ancestor(0x10000000011, "draft.txt", 3)
        .with_ancestor(ROOT_INO, "report", 2);
    driver
        .inject_with_backtrace(&new, 20, mtime(), 4096, DATA_POOL)
        .unwrap();

    let dentry = driver
        .read_dentry(ROOT_INO, Frag::ROOT, "report")
        .unwrap()
        .unwrap();
    assert_eq!(dentry.ino(), 0x10000000011);
    assert!(dentry.inode().unwrap().is_dir());
    assert!(driver
        .list_paths()
        .unwrap()
        .contains(&"/report/draft.txt".to_string()));
}

#[test]
fn test_user_lost_and_found_directory_keeps_roots_intact() {
    let (driver, _) = initialized_driver();
    driver
        .inject_lost_and_found(42, 1, mtime(), 4096, DATA_POOL)
        .unwrap();

    // /lost+found/mine.txt where /lost+found is an ordinary user directory
    let bt = InodeBacktrace::new(0x10000000009, DATA_POOL)
        .with_ancestor(0x10000000008, "mine.txt", 3)
        .with_ancestor(ROOT_INO, "lost+found", 2);
    driver
        .inject_with_backtrace(&bt, 7, mtime(), 4096, DATA_POOL)
        .unwrap();

    assert!(driver.check_roots().unwrap());
    let dentry = driver
        .read_dentry(ROOT_INO, Frag::ROOT, "lost+found")
        .unwrap()
        .unwrap();
    assert_eq!(dentry.ino(), LOST_AND_FOUND_INO);
    assert_eq!(
        driver.list_paths().unwrap(),
        vec![
            "/lost+found",
            "/lost+found/1099511627784",
            "/lost+found/1099511627784/mine.txt",
            "/lost+found/42",
        ]
    );

    // Later orphans still land in the real lost+found
    driver
        .inject_lost_and_found(43, 1, mtime(), 4096, DATA_POOL)
        .unwrap();
    let paths = driver.list_paths().unwrap();
    for expected in [
        "/lost+found/42",
        "/lost+found/43",
        "/lost+found/1099511627784/mine.txt",
    ] {
        assert!(paths.contains(&expected.to_string()), "missing {}", expected);
    }
}

#[test]
fn test_root_inside_a_chain_is_never_relinked() {
    let (driver, pool) = initialized_driver();

    // /top/x/f where x claims to be the root directory
    let bt = InodeBacktrace::new(0x10000000003, DATA_POOL)
        .with_ancestor(ROOT_INO, "f", 3)
        .with_ancestor(0x10000000002, "x", 2)
        .with_ancestor(ROOT_INO, "top", 1);
    driver
        .inject_with_backtrace(&bt, 9, mtime(), 4096, DATA_POOL)
        .unwrap();

    assert!(driver.check_roots().unwrap());
    assert_eq!(
        driver.list_paths().unwrap(),
        vec!["/lost+found", "/lost+found/1099511627779"]
    );

    // No dentry anywhere links the root, so it has a single parent
    for oid in pool.list_objects().unwrap() {
        for key in pool.omap_keys(&oid).unwrap() {
            let raw = pool.omap_get(&oid, &key).unwrap().unwrap();
            let dentry = Dentry::from_bytes(&raw).unwrap();
            assert_ne!(dentry.ino(), ROOT_INO, "{} in {} links the root", key, oid);
        }
    }
}
