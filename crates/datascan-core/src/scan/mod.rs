//! Scan orchestration: from data objects to injected inodes
//!
//! A [`DataScan`] owns one recovery driver and consumes a stream of scanned
//! data objects. Each head object in this worker's shard results in exactly
//! one injection: along its backtrace when it has a usable one, into
//! lost+found otherwise. Per-object failures are logged and counted; the scan
//! itself keeps going.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

use crate::config::{ScanConfig, WorkerShard};
use crate::driver::RecoveryDriver;
use crate::error::{Result, ScanError};
use crate::model::{Decode, InodeBacktrace, LinkagePlan};

pub mod manifest;
pub mod objects;
pub mod parallel;

pub use manifest::ManifestSource;
pub use objects::{parse_object_name, DataObjectName, ScannedObject};
pub use parallel::run_workers;

/// What happened to one scanned object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectOutcome {
    /// Linked along its backtrace
    Linked,
    /// Linked into lost+found by inode number
    LostAndFound,
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Not the first object of its file
    NotHead,
    /// Belongs to another worker
    OtherShard,
    /// Name is not `"{ino:x}.{objno:08x}"`
    Unrecognized,
}

/// One object that could not be injected
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectFailure {
    /// `None` when the object source itself failed
    pub oid: Option<String>,
    pub error: String,
}

/// Summary of one worker's run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub run_id: Uuid,
    pub workers: Vec<WorkerShard>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub objects_seen: u64,
    pub linked: u64,
    pub lost_and_found: u64,
    pub skipped_not_head: u64,
    pub skipped_other_shard: u64,
    pub skipped_unrecognized: u64,
    pub failed: u64,
    pub failures: Vec<ObjectFailure>,
}

impl ScanReport {
    pub fn new(run_id: Uuid, worker: WorkerShard) -> Self {
        Self {
            run_id,
            workers: vec![worker],
            started_at: Utc::now(),
            finished_at: None,
            objects_seen: 0,
            linked: 0,
            lost_and_found: 0,
            skipped_not_head: 0,
            skipped_other_shard: 0,
            skipped_unrecognized: 0,
            failed: 0,
            failures: Vec::new(),
        }
    }

    fn record(&mut self, oid: Option<&str>, result: &Result<ObjectOutcome>) {
        self.objects_seen += 1;
        match result {
            Ok(ObjectOutcome::Linked) => self.linked += 1,
            Ok(ObjectOutcome::LostAndFound) => self.lost_and_found += 1,
            Ok(ObjectOutcome::Skipped(SkipReason::NotHead)) => self.skipped_not_head += 1,
            Ok(ObjectOutcome::Skipped(SkipReason::OtherShard)) => self.skipped_other_shard += 1,
            Ok(ObjectOutcome::Skipped(SkipReason::Unrecognized)) => self.skipped_unrecognized += 1,
            Err(e) => {
                self.failed += 1;
                self.failures.push(ObjectFailure {
                    oid: oid.map(str::to_string),
                    error: e.to_string(),
                });
            }
        }
    }

    /// Inodes injected, either way
    pub fn injected(&self) -> u64 {
        self.linked + self.lost_and_found
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }

    /// Fold another worker's report of the same run into this one
    pub fn merge(&mut self, other: ScanReport) {
        if other.run_id != self.run_id {
            tracing::warn!("Merging report of run {} into run {}", other.run_id, self.run_id);
        }
        self.workers.extend(other.workers);
        self.started_at = self.started_at.min(other.started_at);
        self.finished_at = match (self.finished_at, other.finished_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.objects_seen += other.objects_seen;
        self.linked += other.linked;
        self.lost_and_found += other.lost_and_found;
        self.skipped_not_head += other.skipped_not_head;
        self.skipped_other_shard += other.skipped_other_shard;
        self.skipped_unrecognized += other.skipped_unrecognized;
        self.failed += other.failed;
        self.failures.extend(other.failures);
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).context("Failed to serialize scan report")?;
        std::fs::write(path, json)
            .context(format!("Failed to write scan report {}", path.display()))?;
        Ok(())
    }
}

/// Running totals handed to a progress callback after every object
#[derive(Debug, Clone, Copy)]
pub struct ScanProgress {
    pub objects_seen: u64,
    pub injected: u64,
    pub failed: u64,
}

/// Drives one worker's share of a data scan
pub struct DataScan {
    driver: Box<dyn RecoveryDriver + Send>,
    config: ScanConfig,
    data_pool_id: i64,
    run_id: Uuid,
    progress_callback: Option<Box<dyn Fn(ScanProgress) + Send + Sync>>,
}

impl DataScan {
    /// `driver` must already be initialised against its cluster.
    ///
    /// `default_data_pool` is recorded in recovered layouts unless the
    /// config names a pool of its own.
    pub fn new(
        driver: Box<dyn RecoveryDriver + Send>,
        config: ScanConfig,
        default_data_pool: i64,
    ) -> Self {
        Self {
            driver,
            data_pool_id: config.data_pool_id.unwrap_or(default_data_pool),
            config,
            run_id: Uuid::new_v4(),
            progress_callback: None,
        }
    }

    /// Report under an existing run id, for workers of one run
    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Pool recorded in recovered layouts
    pub fn data_pool_id(&self) -> i64 {
        self.data_pool_id
    }

    pub fn set_progress_callback<F>(&mut self, callback: F)
    where
        F: Fn(ScanProgress) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Create the metadata roots. Run once, before any worker scans.
    pub fn init_metadata(&self) -> Result<()> {
        tracing::info!("Initializing metadata roots");
        self.driver.init_metadata(self.data_pool_id)
    }

    /// Refuse to scan into a store whose roots were never created
    pub fn preflight(&self) -> Result<()> {
        if !self.driver.check_roots()? {
            tracing::error!("Metadata roots missing");
            return Err(ScanError::RootsMissing);
        }
        Ok(())
    }

    /// Inject every object this worker owns and report what happened
    pub fn recover<I>(&self, objects: I) -> ScanReport
    where
        I: IntoIterator<Item = Result<ScannedObject>>,
    {
        let worker = self.config.worker;
        tracing::info!("Worker {}/{} starting scan", worker.n, worker.m);
        let mut report = ScanReport::new(self.run_id, worker);

        for item in objects {
            match item {
                Ok(object) => {
                    let result = self.recover_object(&object);
                    if let Err(e) = &result {
                        tracing::error!("Failed to inject {}: {}", object.oid, e);
                    }
                    report.record(Some(&object.oid), &result);
                }
                Err(e) => {
                    tracing::error!("Object source error: {}", e);
                    report.record(None, &Err(e));
                }
            }
            self.emit_progress(&report);
        }

        report.finished_at = Some(Utc::now());
        tracing::info!(
            "Worker {}/{} done: {} linked, {} to lost+found, {} failed",
            worker.n,
            worker.m,
            report.linked,
            report.lost_and_found,
            report.failed
        );
        report
    }

    /// Inject a single object, if it is a head object in this worker's shard
    pub fn recover_object(&self, object: &ScannedObject) -> Result<ObjectOutcome> {
        let Some(name) = parse_object_name(&object.oid) else {
            tracing::warn!("Skipping object with unrecognized name {}", object.oid);
            return Ok(ObjectOutcome::Skipped(SkipReason::Unrecognized));
        };
        if !name.is_head() {
            return Ok(ObjectOutcome::Skipped(SkipReason::NotHead));
        }
        if !self.config.worker.owns(name.ino) {
            return Ok(ObjectOutcome::Skipped(SkipReason::OtherShard));
        }

        let chunk_size = object.chunk_size.unwrap_or(self.config.default_chunk_size);
        match self.usable_backtrace(name.ino, object) {
            Some(backtrace) => {
                tracing::debug!("Injecting {:x} at {}", name.ino, backtrace.display_path());
                self.driver.inject_with_backtrace(
                    &backtrace,
                    object.size,
                    object.mtime,
                    chunk_size,
                    self.data_pool_id,
                )?;
                Ok(match backtrace.linkage_plan() {
                    LinkagePlan::Chain { .. } => ObjectOutcome::Linked,
                    LinkagePlan::Orphan(_) => ObjectOutcome::LostAndFound,
                })
            }
            None => {
                self.driver.inject_lost_and_found(
                    name.ino,
                    object.size,
                    object.mtime,
                    chunk_size,
                    self.data_pool_id,
                )?;
                Ok(ObjectOutcome::LostAndFound)
            }
        }
    }

    /// The object's backtrace, when it has one that describes this inode
    fn usable_backtrace(&self, ino: u64, object: &ScannedObject) -> Option<InodeBacktrace> {
        let raw = object.parent.as_deref()?;
        match InodeBacktrace::from_bytes(raw) {
            Ok(backtrace) if backtrace.ino == ino => Some(backtrace),
            Ok(backtrace) => {
                tracing::warn!(
                    "Backtrace on {} names inode {:x}, ignoring it",
                    object.oid,
                    backtrace.ino
                );
                None
            }
            Err(e) => {
                tracing::warn!("Undecodable backtrace on {}: {}", object.oid, e);
                None
            }
        }
    }

    fn emit_progress(&self, report: &ScanReport) {
        if let Some(callback) = &self.progress_callback {
            callback(ScanProgress {
                objects_seen: report.objects_seen,
                injected: report.injected(),
                failed: report.failed,
            });
        }
    }
}
