use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pipeline::{
    ClosingClipCatalog, FFmpegManager, JobOrchestrator, PipelineConfig, PipelineContext, WorkerPool,
    intake::{self, IntakeOutcome, UploadRequest},
    progress::{JsonlProgressSink, ProgressHub, spawn_transport},
    stats,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use log::{debug, info, warn, LevelFilter};

/// Closing-clip video pipeline daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon: poll the intake directory and process uploads
    Run,

    /// Queue an upload by writing a manifest into the intake directory
    Submit {
        /// Municipality whose closing clip is appended
        #[arg(short, long)]
        municipality: String,
        /// Video file to process
        #[arg(short, long)]
        file: PathBuf,
        /// Output format: square, vertical or horizontal
        #[arg(long, default_value = "square")]
        format: String,
        /// Client session that receives progress events
        #[arg(short, long)]
        session_id: Option<String>,
        #[arg(long)]
        user_agent: Option<String>,
        #[arg(long)]
        source_ip: Option<String>,
    },

    /// Aggregate the statistics log by municipality, format, device and month
    ExportStats {
        /// Write the CSV here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List the configured municipalities
    Municipalities,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Use RUST_LOG when set, otherwise info (debug with --verbose)
    let mut logger = env_logger::Builder::new();
    logger.filter_level(if args.verbose { LevelFilter::Debug } else { LevelFilter::Info });
    logger.parse_default_env().format_timestamp_secs().init();

    let cfg = PipelineConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    match args.command {
        Command::Run => run_daemon(cfg).await,
        Command::Submit { municipality, file, format, session_id, user_agent, source_ip } => {
            let file = file.canonicalize()
                .with_context(|| format!("Cannot read upload: {}", file.display()))?;
            let request = UploadRequest {
                municipality: Some(municipality),
                file: Some(file),
                format: Some(format),
                session_id: Some(session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string())),
                user_agent,
                source_ip,
            };
            // Catch bad input here instead of as a .rejected file later
            request.validate()?;

            let manifest = intake::write_manifest(&cfg.intake_dir, &request)?;
            println!("{}", manifest.display());
            Ok(())
        }
        Command::ExportStats { output } => {
            let rows = stats::summarize_log(&cfg.statistics_file)?;
            match output {
                Some(path) => {
                    let file = std::fs::File::create(&path)
                        .with_context(|| format!("Failed to create export: {}", path.display()))?;
                    stats::write_export(&rows, std::io::BufWriter::new(file))?;
                    info!("Exported {} row(s) to {}", rows.len(), path.display());
                }
                None => stats::write_export(&rows, std::io::stdout().lock())?,
            }
            Ok(())
        }
        Command::Municipalities => {
            let catalog = ClosingClipCatalog::load(
                &cfg.municipalities_file, &cfg.mapping_file, &cfg.closing_clip_dir,
            )?;
            let mut out = std::io::stdout().lock();
            for name in catalog.municipalities() {
                writeln!(out, "{}", name)?;
            }
            Ok(())
        }
    }
}

async fn run_daemon(cfg: PipelineConfig) -> Result<()> {
    info!("Closing clip daemon starting");
    info!("Configuration loaded:");
    info!("  Intake dir: {}", cfg.intake_dir.display());
    info!("  Upload dir: {}", cfg.upload_dir.display());
    info!("  Output dir: {}", cfg.output_dir.display());
    info!("  Closing clips: {}", cfg.closing_clip_dir.display());
    info!("  Workers: {}, queue: {}", cfg.max_concurrent_jobs, cfg.queue_capacity);
    info!("  Retention: {}s", cfg.retention_secs);
    info!("  Scan interval: {}s", cfg.scan_interval_secs);

    cfg.ensure_dirs()?;

    let ffmpeg = FFmpegManager::new(&cfg).await
        .context("FFmpeg is required")?;
    let catalog = Arc::new(ClosingClipCatalog::load(
        &cfg.municipalities_file, &cfg.mapping_file, &cfg.closing_clip_dir,
    )?);

    let (hub, events) = ProgressHub::new();
    let transport = spawn_transport(events, Arc::new(JsonlProgressSink::new(cfg.progress_dir.clone())));
    let ctx = Arc::new(PipelineContext::new(cfg.clone(), Arc::new(ffmpeg), catalog.clone(), hub));

    info!("🔄 Starting recovery checks...");
    let expired = JobOrchestrator::new(ctx.clone()).resume_retention()
        .context("Failed to resume retention on startup")?;
    if expired > 0 {
        info!("🗑️  Removed {} job(s) whose retention window closed while stopped", expired);
    }
    if ctx.reaper.pending() > 0 {
        info!("📋 {} finished job(s) still inside their retention window", ctx.reaper.pending());
    }

    let recovered = JobOrchestrator::new(ctx.clone()).recover_interrupted()
        .context("Failed to recover interrupted jobs on startup")?;
    if recovered > 0 {
        info!("✅ Startup recovery complete: {} interrupted job(s) failed and cleaned", recovered);
    } else {
        info!("✅ Startup recovery complete: no interrupted jobs found");
    }

    let pool = WorkerPool::start(ctx.clone(), cfg.max_concurrent_jobs, cfg.queue_capacity);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(Duration::from_secs(cfg.scan_interval_secs.max(1)));

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Interrupt received, finishing queued jobs");
                break;
            }
            _ = ticker.tick() => {
                if let Err(e) = scan_once(&cfg, &catalog, &pool).await {
                    warn!("Intake scan failed: {:#}", e);
                }
            }
        }
    }

    pool.shutdown().await;
    let pending = ctx.reaper.pending();
    if pending > 0 {
        warn!("{} job(s) still inside their retention window; their files are left in place", pending);
    }
    drop(ctx);
    transport.await.context("Progress transport failed")?;

    info!("Closing clip daemon stopped");
    Ok(())
}

async fn scan_once(cfg: &PipelineConfig, catalog: &ClosingClipCatalog, pool: &WorkerPool) -> Result<()> {
    if let Err(e) = catalog.refresh() {
        warn!("Keeping previous lookup tables: {:#}", e);
    }

    let manifests = intake::scan_intake(&cfg.intake_dir)?;
    if manifests.is_empty() {
        return Ok(());
    }
    debug!("Found {} manifest(s), {} job(s) queued", manifests.len(), pool.queued());

    let mut accepted = 0;
    let mut rejected = 0;
    for manifest in manifests {
        match intake::process_manifest(cfg, pool, &manifest).await {
            Ok(IntakeOutcome::Accepted(_)) => accepted += 1,
            Ok(IntakeOutcome::Rejected(_)) => rejected += 1,
            Err(e) => warn!("Failed to process {}: {:#}", manifest.display(), e),
        }
    }

    info!("Intake summary: {} accepted, {} rejected", accepted, rejected);
    Ok(())
}
