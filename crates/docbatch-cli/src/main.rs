//! Command line front end: submits a batch, runs the worker pool until the
//! batch settles, and answers status queries.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, info, warn};
use tokio::runtime::Runtime;

use docbatch::db::default_database_path;
use docbatch::{
    build_storage, load_config, Config, Database, Intake, Orchestrator, PoolOptions,
    ProcessConverter, ReportedStatus, Upload, WorkerPool,
};

#[derive(Parser, Debug)]
#[command(
    name = "docbatch",
    version,
    about = "Convert batches of documents and collect the results in one archive"
)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long, env = "DOCBATCH_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert the given files as one job and wait for it to settle.
    Submit {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Queue again the work an interrupted run left unfinished and wait for
    /// it to settle.
    Resume,
    /// Print a job's status as JSON.
    Status { job_id: String },
    /// Re-run archiving for a job whose archive step failed.
    RetryArchive { job_id: String },
    /// Save a completed job's archive.
    Download {
        job_id: String,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// List recent jobs.
    List {
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
}

fn open_orchestrator(config: &Config) -> Result<Arc<Orchestrator>> {
    let db_path = config
        .database_path
        .as_ref()
        .map(PathBuf::from)
        .or_else(default_database_path)
        .context("Could not determine database path")?;
    let db = Database::open(&db_path)?;

    let storage = build_storage(config)?;
    let converter = Arc::new(ProcessConverter::new(
        storage.clone(),
        config.converter.clone(),
    ));

    Ok(Arc::new(
        Orchestrator::new(db, storage, converter)
            .with_archive_lease(Duration::from_secs(config.archive_lease_secs)),
    ))
}

fn read_uploads(files: &[PathBuf]) -> Result<Vec<Upload>> {
    files
        .iter()
        .map(|path| {
            let bytes = std::fs::read(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("document")
                .to_string();
            Ok(Upload::new(name, bytes))
        })
        .collect()
}

/// Runs the pool until nothing is outstanding or Ctrl-C is pressed.
fn run_until_settled(pool: WorkerPool) -> Result<()> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("Failed to install Ctrl-C handler")?;

    while pool.outstanding() > 0 {
        if interrupted.load(Ordering::SeqCst) {
            warn!("Interrupted; run `docbatch resume` to finish the remaining work");
            pool.shutdown();
            break;
        }
        if let Some(report) = pool.recv_result_timeout(Duration::from_secs(1)) {
            debug!("{}: {:?}", report.task, report.outcome);
        }
    }
    pool.wait();
    Ok(())
}

fn submit(config: &Config, runtime: &Runtime, files: &[PathBuf]) -> Result<()> {
    let orchestrator = open_orchestrator(config)?;
    let uploads = read_uploads(files)?;

    let pool = WorkerPool::new(orchestrator.clone(), PoolOptions::from_config(config))?;
    let started = runtime.block_on(Intake::new(orchestrator.clone()).submit(uploads, &pool))?;
    info!("Submitted job {} ({} files)", started.job_id, started.file_count);

    run_until_settled(pool)?;

    let report = orchestrator.status(&started.job_id);
    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.status != ReportedStatus::Completed {
        anyhow::bail!("Job {} finished as {}", started.job_id, report.status);
    }
    Ok(())
}

fn resume(config: &Config) -> Result<()> {
    let orchestrator = open_orchestrator(config)?;
    let pool = WorkerPool::new(orchestrator.clone(), PoolOptions::from_config(config))?;
    let work = Intake::new(orchestrator.clone()).resume(&pool)?;
    println!(
        "Resuming {} conversions and {} archive steps",
        work.file_ids.len(),
        work.archive_job_ids.len()
    );

    run_until_settled(pool)?;

    let left = orchestrator.unfinished_work()?;
    if !left.is_empty() {
        anyhow::bail!(
            "{} conversions and {} archive steps are still unfinished",
            left.file_ids.len(),
            left.archive_job_ids.len()
        );
    }
    Ok(())
}

fn download(config: &Config, runtime: &Runtime, job_id: &str, output: &Path) -> Result<()> {
    let orchestrator = open_orchestrator(config)?;
    let bytes = runtime.block_on(orchestrator.download_archive(job_id))?;
    std::fs::write(output, &bytes)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    info!("Saved {} bytes to {}", bytes.len(), output.display());
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    match cli.command {
        Command::Submit { files } => submit(&config, &runtime, &files),
        Command::Resume => resume(&config),
        Command::Status { job_id } => {
            let report = open_orchestrator(&config)?.status(&job_id);
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::RetryArchive { job_id } => {
            let orchestrator = open_orchestrator(&config)?;
            let outcome = runtime.block_on(orchestrator.retry_archive(&job_id))?;
            println!("{:?}", outcome);
            Ok(())
        }
        Command::Download { job_id, output } => download(&config, &runtime, &job_id, &output),
        Command::List { limit } => {
            for job in open_orchestrator(&config)?.list_jobs(limit)? {
                println!(
                    "{}  {:<11}  {}",
                    job.id,
                    job.status.as_str(),
                    job.created_at.to_rfc3339()
                );
            }
            Ok(())
        }
    }
}
