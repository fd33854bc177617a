use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use datascan_core::config::{FsMap, ScanConfig, WorkerShard};
use datascan_core::driver::{LocalFileDriver, MetadataDriver, RecoveryDriver};
use datascan_core::scan::{run_workers, DataScan, ManifestSource, ScanReport, ScannedObject};
use datascan_core::store::SqliteCluster;
use datascan_core::ScanError;
use indicatif::{ProgressBar, ProgressStyle};

#[derive(Parser, Debug)]
#[command(name = "datascan", version, about = "Rebuild a lost metadata tree from data pool backtraces")]
struct Cli {
	#[command(subcommand)]
	command: Commands,
	/// Where recovered inodes are written
	#[arg(long, global = true, value_parser = ["metadata", "local"], default_value = "metadata")]
	backend: String,
	/// Metadata store database (defaults to ~/.datascan/metadata.db)
	#[arg(long, global = true)]
	store: Option<PathBuf>,
	/// Target directory for the local backend
	#[arg(long, global = true)]
	output: Option<PathBuf>,
	/// Filesystem map (JSON); defaults to pools 1 (metadata) and 2 (data)
	#[arg(long, global = true)]
	fsmap: Option<PathBuf>,
	/// Data pool recorded in recovered layouts
	#[arg(long, global = true)]
	data_pool: Option<i64>,
	/// Debug logging
	#[arg(long, short, global = true)]
	verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
	/// Create the root directory, system directory and lost+found
	Init,
	/// Check that the metadata roots exist
	Check,
	/// Inject inodes for the objects listed in a scanner manifest
	ScanInodes {
		/// JSON-lines manifest of data objects
		#[arg(long)]
		manifest: PathBuf,
		/// Index of this worker
		#[arg(long, requires = "worker_m", conflicts_with = "workers")]
		worker_n: Option<u32>,
		/// Total number of workers
		#[arg(long, requires = "worker_n")]
		worker_m: Option<u32>,
		/// Run this many workers in-process
		#[arg(long)]
		workers: Option<u32>,
		/// Write a JSON run report here
		#[arg(long)]
		report: Option<PathBuf>,
	},
	/// Print every recovered path
	Tree,
}

struct Session {
	backend: String,
	cluster: SqliteCluster,
	fsmap: FsMap,
	output: Option<PathBuf>,
	data_pool: i64,
}

impl Session {
	fn open(cli: &Cli) -> Result<Self> {
		let fsmap = match &cli.fsmap {
			Some(path) => FsMap::load(path)?,
			None => FsMap::default(),
		};
		let data_pool = fsmap.resolve_data_pool(cli.data_pool)?;

		let store_path = match &cli.store {
			Some(path) => path.clone(),
			None => SqliteCluster::default_path()?,
		};
		let cluster = SqliteCluster::open(&store_path)?;
		for pool in std::iter::once(fsmap.metadata_pool).chain(fsmap.data_pools.iter().copied()) {
			cluster
				.create_pool(pool)
				.context(format!("Failed to register pool {}", pool))?;
		}

		Ok(Self {
			backend: cli.backend.clone(),
			cluster,
			fsmap,
			output: cli.output.clone(),
			data_pool,
		})
	}

	fn output_dir(&self) -> datascan_core::Result<&Path> {
		self.output
			.as_deref()
			.ok_or_else(|| ScanError::Config("the local backend needs --output".to_string()))
	}

	fn metadata_driver(&self) -> datascan_core::Result<MetadataDriver> {
		let mut driver = MetadataDriver::new();
		driver.init(&self.cluster, &self.fsmap)?;
		Ok(driver)
	}

	fn local_driver(&self) -> datascan_core::Result<LocalFileDriver> {
		let mut driver = LocalFileDriver::new(self.output_dir()?);
		driver.init(&self.cluster, &self.fsmap)?;
		Ok(driver)
	}

	fn driver(&self) -> datascan_core::Result<Box<dyn RecoveryDriver + Send>> {
		match self.backend.as_str() {
			"local" => Ok(Box::new(self.local_driver()?)),
			_ => Ok(Box::new(self.metadata_driver()?)),
		}
	}
}

fn spinner() -> Result<Option<ProgressBar>> {
	if !atty::is(atty::Stream::Stdout) {
		return Ok(None);
	}
	let pb = ProgressBar::new_spinner();
	pb.set_style(ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg}")?);
	pb.enable_steady_tick(Duration::from_millis(120));
	Ok(Some(pb))
}

fn print_report(report: &ScanReport) {
	println!("✅ Scan completed");
	println!("📊 Run ID: {}", report.run_id);
	println!("🔎 Objects Seen: {}", report.objects_seen);
	println!("🔗 Linked: {}", report.linked);
	println!("📦 Lost+found: {}", report.lost_and_found);
	println!(
		"⏭️  Skipped: {} tail objects, {} other shards, {} unrecognized",
		report.skipped_not_head, report.skipped_other_shard, report.skipped_unrecognized
	);
	if report.is_clean() {
		println!("🎯 Failures: 0");
	} else {
		println!("❌ Failures: {}", report.failed);
		for failure in report.failures.iter().take(10) {
			println!("   {}: {}", failure.oid.as_deref().unwrap_or("<manifest>"), failure.error);
		}
	}
}

fn scan_inodes(
	session: &Session,
	manifest: &Path,
	worker: Option<WorkerShard>,
	workers: Option<u32>,
) -> Result<ScanReport> {
	let pb = spinner()?;

	let report = match workers {
		Some(m) => {
			let mut objects: Vec<ScannedObject> = Vec::new();
			let mut unreadable = 0;
			for item in ManifestSource::open(manifest)? {
				match item {
					Ok(object) => objects.push(object),
					Err(_) => unreadable += 1,
				}
			}
			if unreadable > 0 {
				println!("⚠️  Skipped {} unreadable manifest lines", unreadable);
			}
			if let Some(pb) = &pb {
				pb.set_message(format!("{} workers over {} objects", m, objects.len()));
			}
			run_workers(m, &objects, &ScanConfig::default(), session.data_pool, |_| session.driver())?
		}
		None => {
			let config = ScanConfig {
				worker: worker.unwrap_or_default(),
				..ScanConfig::default()
			};
			let mut scan = DataScan::new(session.driver()?, config, session.data_pool);
			scan.preflight()?;
			if let Some(pb) = &pb {
				let pb = pb.clone();
				scan.set_progress_callback(move |progress| {
					pb.set_message(format!(
						"{} objects, {} injected, {} failed",
						progress.objects_seen, progress.injected, progress.failed
					));
				});
			}
			scan.recover(ManifestSource::open(manifest)?)
		}
	};

	if let Some(pb) = pb {
		pb.finish_and_clear();
	}
	Ok(report)
}

fn main() -> Result<()> {
	let cli = Cli::parse();

	// Initialize tracing
	if cli.verbose {
		tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).init();
	} else {
		tracing_subscriber::fmt::init();
	}

	let session = Session::open(&cli)?;
	match &cli.command {
		Commands::Init => {
			let driver = session.driver()?;
			driver.init_metadata(session.data_pool)?;
			println!("✅ Metadata roots ready");
			println!("📁 File System: {}", session.fsmap.fs_name);
			println!("💾 Store: {}", session.cluster.path().display());
		}
		Commands::Check => {
			let driver = session.driver()?;
			if driver.check_roots()? {
				println!("✅ Metadata roots present");
			} else {
				println!("❌ Metadata roots missing; run `datascan init` first");
				std::process::exit(1);
			}
		}
		Commands::ScanInodes {
			manifest,
			worker_n,
			worker_m,
			workers,
			report,
		} => {
			let worker = match (worker_n, worker_m) {
				(Some(n), Some(m)) => Some(WorkerShard::new(*n, *m)?),
				_ => None,
			};
			println!("🔍 Scanning manifest: {}", manifest.display());

			let run = scan_inodes(&session, manifest, worker, *workers)?;
			print_report(&run);
			if let Some(path) = report {
				run.save(path)?;
				println!("📝 Report: {}", path.display());
			}
			if !run.is_clean() {
				std::process::exit(2);
			}
		}
		Commands::Tree => {
			let paths = match session.backend.as_str() {
				"local" => session.local_driver()?.list_paths()?,
				_ => session.metadata_driver()?.list_paths()?,
			};
			if paths.is_empty() {
				println!("📂 Nothing recovered yet");
			}
			for path in paths {
				println!("{}", path);
			}
		}
	}
	Ok(())
}
