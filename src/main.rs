use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};

use audiosync::convert::encoder::check_encoder;
use audiosync::report::{self, ReportOptions};
use audiosync::sync::{progress, RunOptions, RunOutcome, SyncManager};
use audiosync::utils::config::{write_config, ConfigFile, CONFIG_FILE};
use audiosync::utils::logging::{init_tracing, RunLog};
use audiosync::utils::SyncConfig;

/// Exit code of a run that was interrupted before finishing.
const EXIT_STOPPED: u8 = 2;

#[derive(Parser)]
#[command(
    name = "audiosync",
    version,
    about = "Mirror an audio library, converting formats on the way"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bring a target directory up to date with its source library
    Sync {
        /// Target directory holding audiosync.toml
        target: PathBuf,

        /// Config file to use instead of <TARGET>/audiosync.toml
        #[arg(long)]
        config: Option<PathBuf>,

        /// Clear the target and convert everything
        #[arg(long)]
        init: bool,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,

        /// Number of concurrent conversions
        #[arg(short, long)]
        workers: Option<usize>,

        /// Machine readable progress on stdout
        #[arg(long)]
        json: bool,

        #[arg(short, long)]
        verbose: bool,
    },

    /// Write a starter config into a target directory
    Init {
        target: PathBuf,

        /// Source library root
        #[arg(long)]
        source: PathBuf,

        /// Replace an existing config
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Command::Sync {
            target,
            config,
            init,
            yes,
            workers,
            json,
            verbose,
        } => {
            let run_log = RunLog::default();
            init_tracing(verbose, json, Some(run_log.clone()));

            let config_path = config.unwrap_or_else(|| target.join(CONFIG_FILE));
            let mut config = SyncConfig::load(&config_path, &target)
                .with_context(|| format!("loading {}", config_path.display()))?;
            if let Some(n) = workers.filter(|n| *n > 0) {
                config.workers = n;
            }

            run_sync(config, run_log, init, yes, json, verbose).await
        }
        Command::Init { target, source, force } => {
            init_tracing(false, false, None);
            init_target(target, source, force)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_sync(
    config: SyncConfig,
    run_log: RunLog,
    initial: bool,
    yes: bool,
    json: bool,
    verbose: bool,
) -> Result<ExitCode> {
    info!("Starting audiosync v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "{} -> {} with {} workers",
        config.source_dir.display(),
        config.target_dir.display(),
        config.workers
    );

    if config.rules.needs_encoder() {
        let version = check_encoder(&config.encoder)
            .await
            .with_context(|| format!("encoder '{}' is not usable", config.encoder))?;
        info!("Using {}", version);
    }

    let mut manager = SyncManager::new(config, RunOptions { initial });
    let worklist = manager.scan().await;
    if worklist.is_empty() {
        report::print_summary(&RunOutcome::NothingToDo, json);
        return Ok(ExitCode::SUCCESS);
    }

    if !json {
        report::print_plan(&worklist, manager.is_initial());
    }
    if !yes && !confirm().await? {
        println!("Nothing changed.");
        return Ok(ExitCode::SUCCESS);
    }

    let log_path = manager.config().log_file();
    run_log
        .open(&log_path)
        .with_context(|| format!("opening {}", log_path.display()))?;

    let stop = manager.stop_handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Stopping once running conversions finish");
        stop.stop();
    });

    let (tracker, reader) = progress::channel();
    let reporter = report::spawn(reader, ReportOptions { verbose, json });
    let outcome = manager.process(worklist, tracker).await;
    if !matches!(tokio::task::spawn_blocking(move || reporter.join()).await, Ok(Ok(()))) {
        warn!("Progress reporter ended abnormally");
    }
    let outcome = outcome?;

    report::print_summary(&outcome, json);
    Ok(match outcome {
        RunOutcome::Stopped(_) => ExitCode::from(EXIT_STOPPED),
        RunOutcome::Done(_) | RunOutcome::NothingToDo => ExitCode::SUCCESS,
    })
}

async fn confirm() -> Result<bool> {
    print!("Proceed? [y/N] ");
    std::io::stdout().flush()?;
    let answer = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).map(|_| line)
    })
    .await??;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

fn init_target(target: PathBuf, source: PathBuf, force: bool) -> Result<()> {
    let source = source
        .canonicalize()
        .with_context(|| format!("source directory {}", source.display()))?;
    std::fs::create_dir_all(&target).with_context(|| format!("creating {}", target.display()))?;

    let path = target.join(CONFIG_FILE);
    if path.exists() && !force {
        bail!("{} already exists (use --force to replace it)", path.display());
    }

    let file = ConfigFile::starter(&source);
    write_config(&path, &file)?;

    println!("Wrote {}", path.display());
    for rule in &file.rules {
        println!(
            "  {} -> {} ({})",
            rule.source,
            rule.target.as_deref().unwrap_or(&rule.source),
            rule.conversion.as_deref().unwrap_or("copy")
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install signal handler: {}", e);
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

    info!("Shutdown signal received");
}
