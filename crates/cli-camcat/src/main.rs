use anyhow::{Context, Result};
use camcat::{
    config::PipelineConfig,
    pipeline::{Pipeline, PipelineEvent, UnitOutcome, Workflow},
    JobStatus,
};
use clap::{Parser, Subcommand};
use humansize::{format_size, DECIMAL};
use log::{debug, info, warn};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Security-camera footage pipeline: daily merges, fast-forward copies and a combined timelapse
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding the camera's YYYYMMDDHH hour directories
    #[arg(long, global = true)]
    camera_dir: Option<PathBuf>,

    /// Directory for merged and accelerated outputs
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    /// Encoder thread hint; negative picks half of the available cores
    #[arg(long, global = true, allow_hyphen_values = true)]
    threads: Option<i32>,

    /// Overwrite outputs that already exist instead of skipping them
    #[arg(long, global = true)]
    overwrite: bool,

    /// Path to the ffmpeg binary
    #[arg(long, global = true)]
    ffmpeg: Option<PathBuf>,

    /// Write the JSON run report to this path
    #[arg(long, global = true)]
    report: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Merge each day's camera segments into YYYYMMDD.mp4
    MergeCamera,
    /// Fast-forward every YYYYMMDD.mp4 into YYYYMMDD_Accelerate.mp4
    Accelerate,
    /// Merge all accelerated files into FIRST_To_LAST.mp4
    MergeAccelerated,
}

impl From<Command> for Workflow {
    fn from(command: Command) -> Self {
        match command {
            Command::MergeCamera => Workflow::CameraMerge,
            Command::Accelerate => Workflow::Accelerate,
            Command::MergeAccelerated => Workflow::AcceleratedMerge,
        }
    }
}

/// Command-line flags take precedence over the configuration file
fn apply_overrides(cfg: &mut PipelineConfig, args: &Args) {
    if let Some(dir) = &args.camera_dir {
        cfg.camera_directory = dir.clone();
    }
    if let Some(dir) = &args.output_dir {
        cfg.output_directory = dir.clone();
    }
    if let Some(threads) = args.threads {
        cfg.threads_count = threads;
    }
    if args.overwrite {
        cfg.overwrite_output = true;
    }
    if let Some(ffmpeg) = &args.ffmpeg {
        cfg.ffmpeg_bin = ffmpeg.clone();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; otherwise info, or debug with --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let mut cfg = PipelineConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    apply_overrides(&mut cfg, &args);

    info!("camcat starting");
    info!("Configuration loaded:");
    info!("  Camera directory: {}", cfg.camera_directory.display());
    info!("  Output directory: {}", cfg.output_directory.display());
    info!("  Threads: {}", cfg.threads_count);
    info!("  Overwrite outputs: {}", cfg.overwrite_output);
    info!("  Accelerate parameters: {}", cfg.accelerate.parameters);

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let event_logger = tokio::spawn(log_events(event_rx));

    let pipeline = Pipeline::new(cfg, cancel.clone())
        .context("Invalid configuration")?
        .with_events(event_tx);

    let workflow = Workflow::from(args.command);
    let report = pipeline
        .run(workflow)
        .await
        .with_context(|| format!("Failed to run {}", workflow))?;

    // Closing the sender lets the logger drain and finish
    drop(pipeline);
    if let Err(e) = event_logger.await {
        warn!("Event logger ended abnormally: {}", e);
    }

    if let Some(path) = &args.report {
        report
            .save(path)
            .with_context(|| format!("Failed to write run report: {}", path.display()))?;
        info!("📝 Run report written to {}", path.display());
    }

    report.ensure_success().context("Encoding failed")?;
    Ok(())
}

/// Cancel the run on Ctrl-C or SIGTERM
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("🛑 Shutdown requested, waiting for encoder to exit...");
    cancel.cancel();
}

/// Decile of a job percentage, used to log progress in 10% steps
fn progress_step(percent: f64) -> u32 {
    (percent.clamp(0.0, 100.0) / 10.0).floor() as u32
}

async fn log_events(mut rx: mpsc::UnboundedReceiver<PipelineEvent>) {
    let mut last_step: Option<(usize, u32)> = None;

    while let Some(event) = rx.recv().await {
        match event {
            PipelineEvent::Planned { workflow, units, bytes } => {
                info!("📂 {}: {} unit(s), {} of input", workflow, units, format_size(bytes, DECIMAL));
            }
            PipelineEvent::StageSkipped { workflow, detail, .. } => {
                info!("Nothing to do for {}: {}", workflow, detail);
            }
            PipelineEvent::UnitSkipped { index, total, label, outcome } => {
                let reason = match outcome {
                    UnitOutcome::SkippedExisting => "output already exists",
                    _ => "no input files",
                };
                info!("[{}/{}] Skipped {}: {}", index + 1, total, label, reason);
            }
            PipelineEvent::JobStarted { index, total, input, bytes, .. } => {
                last_step = None;
                info!("[{}/{}] Reading {} ({})", index + 1, total, input, format_size(bytes, DECIMAL));
            }
            PipelineEvent::JobProgress { index, total, sample, overall_percent } => {
                let step = progress_step(sample.percent);
                let advanced = match last_step {
                    Some((i, s)) if i == index => step > s,
                    _ => true,
                };
                if advanced {
                    last_step = Some((index, step));
                    info!(
                        "⏳ [{}/{}] {}% (overall {:.1}%)",
                        index + 1,
                        total,
                        step * 10,
                        overall_percent
                    );
                }
            }
            PipelineEvent::JobFinished { index, total, output, status, .. } => {
                if status == JobStatus::Succeeded {
                    if let Ok(meta) = std::fs::metadata(&output) {
                        info!(
                            "[{}/{}] Wrote {} ({})",
                            index + 1,
                            total,
                            output.display(),
                            format_size(meta.len(), DECIMAL)
                        );
                    }
                } else {
                    debug!("[{}/{}] Job ended as {:?}", index + 1, total, status);
                }
            }
        }
    }
}
