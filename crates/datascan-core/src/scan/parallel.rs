//! Several sharded workers in one process
//!
//! Each worker gets its own driver and its own [`WorkerShard`], exactly as if
//! it were a separate process; they share nothing but the target store.

use rayon::prelude::*;
use uuid::Uuid;

use super::{DataScan, ScanReport, ScannedObject};
use crate::config::{ScanConfig, WorkerShard};
use crate::driver::RecoveryDriver;
use crate::error::{Result, ScanError};

/// Run `m` workers over `objects` and merge their reports under one run id.
///
/// `make_driver` is called once per worker and must return an initialised
/// driver. Any worker failing its preflight fails the whole run.
pub fn run_workers<F>(
    m: u32,
    objects: &[ScannedObject],
    config: &ScanConfig,
    data_pool_id: i64,
    make_driver: F,
) -> Result<ScanReport>
where
    F: Fn(WorkerShard) -> Result<Box<dyn RecoveryDriver + Send>> + Sync,
{
    if m == 0 {
        return Err(ScanError::Config("worker count must be at least 1".to_string()));
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(m as usize)
        .build()
        .map_err(|e| ScanError::Config(format!("worker thread pool: {}", e)))?;

    let run_id = Uuid::new_v4();
    tracing::info!("Run {}: {} workers over {} objects", run_id, m, objects.len());
    let reports: Vec<Result<ScanReport>> = pool.install(|| {
        (0..m)
            .into_par_iter()
            .map(|n| {
                let worker = WorkerShard::new(n, m)?;
                let scan = DataScan::new(
                    make_driver(worker)?,
                    ScanConfig {
                        worker,
                        ..config.clone()
                    },
                    data_pool_id,
                )
                .with_run_id(run_id);
                scan.preflight()?;
                Ok(scan.recover(objects.iter().cloned().map(Ok)))
            })
            .collect()
    });

    let mut merged: Option<ScanReport> = None;
    for report in reports {
        let report = report?;
        match merged.as_mut() {
            Some(total) => total.merge(report),
            None => merged = Some(report),
        }
    }
    merged.ok_or_else(|| ScanError::Config("no workers ran".to_string()))
}
