//! avocado-pipeline CLI - replay runner messages and collect system information.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufRead, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use avocado_pipeline::callback::run_at_exit;
use avocado_pipeline::config::{self, Config};
use avocado_pipeline::job::Job;
use avocado_pipeline::layout::SysInfoDirs;
use avocado_pipeline::report::print_summary;
use avocado_pipeline::sysinfo::{CollectibleLists, Host, SysInfo};

#[derive(Parser)]
#[command(name = "avocado-pipeline")]
#[command(about = "Runner message pipeline for test jobs", long_about = None)]
#[command(version)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Feed recorded runner messages (JSON lines) through a job
    Replay {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the job log directory
        #[arg(long)]
        logdir: Option<PathBuf>,

        /// Messages file, or `-` for stdin
        input: PathBuf,
    },

    /// Collect system information once (start, then end)
    Sysinfo {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output directory (default: sysinfo-<timestamp>)
        dir: Option<PathBuf>,
    },

    /// Validate configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install logger: {}", e);
    }

    let outcome = match cli.command {
        Commands::Replay {
            config,
            logdir,
            input,
        } => replay(config.as_deref(), logdir, &input).await,
        Commands::Sysinfo { config, dir } => collect_sysinfo(config.as_deref(), dir).await,
        Commands::Validate { config } => validate_config(&config),
    };

    let cleanup_failures = run_at_exit();
    if cleanup_failures > 0 {
        warn!("{} exit-time cleanups failed", cleanup_failures);
    }

    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

fn load_or_default(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => {
            let config = config::load_config(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?;
            info!("Loaded configuration from {}", path.display());
            Ok(config)
        }
        None => Ok(Config::default()),
    }
}

async fn replay(config_path: Option<&Path>, logdir: Option<PathBuf>, input: &Path) -> Result<bool> {
    let mut config = load_or_default(config_path)?;
    if let Some(logdir) = logdir {
        config.job.logdir = logdir;
    }

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = if input == Path::new("-") {
        Box::new(BufReader::new(tokio::io::stdin()))
    } else {
        let file = tokio::fs::File::open(input)
            .await
            .with_context(|| format!("Failed to open {}", input.display()))?;
        Box::new(BufReader::new(file))
    };

    let mut job = Job::new(config, Host::local()).await?;
    job.pre_tests().await;

    let replayed = job.replay(reader).await;
    match &replayed {
        Ok(stats) => info!(
            "Replayed {} messages ({} invalid lines, {} handler failures)",
            stats.messages, stats.invalid, stats.handler_failures
        ),
        Err(e) => error!("Replay stopped early: {:#}", e),
    }

    // The job is closed even when the input broke off.
    let snapshot = job.post_tests().await?;
    print_summary(&snapshot, job.layout().logdir());
    replayed?;
    Ok(snapshot.passed())
}

async fn collect_sysinfo(config_path: Option<&Path>, dir: Option<PathBuf>) -> Result<bool> {
    let config = load_or_default(config_path)?;
    let dir = dir.unwrap_or_else(|| {
        PathBuf::from(format!(
            "sysinfo-{}",
            chrono::Local::now().format("%Y-%m-%dT%H.%M.%S")
        ))
    });

    let lists = CollectibleLists::load(&config.sysinfo.collectibles);
    let mut sysinfo = SysInfo::new(
        SysInfoDirs::new(&dir),
        config.sysinfo.collect.clone(),
        &lists,
        Host::local(),
    )
    .await;
    let failures = sysinfo.start().await + sysinfo.end(None).await;

    println!("System information collected into {}", dir.display());
    if failures > 0 {
        println!(
            "{}",
            console::style(format!("{} collectibles could not be collected", failures)).yellow()
        );
    }
    Ok(true)
}

fn validate_config(config_path: &Path) -> Result<bool> {
    match config::load_config(config_path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Log directory: {}", config.job.logdir.display());
            println!(
                "  Job id: {}",
                config.job.unique_id.as_deref().unwrap_or("(generated)")
            );
            let collect = &config.sysinfo.collect;
            println!("  Sysinfo: {}", if collect.enabled { "enabled" } else { "disabled" });
            println!("  Per-test sysinfo: {}", collect.per_test);
            match collect.timeout() {
                Some(timeout) => println!("  Command timeout: {}s", timeout.as_secs()),
                None => println!("  Command timeout: none"),
            }
            println!("  Profiler: {}", collect.profiler);
            println!("  Optimize: {}", collect.optimize);

            let lists = CollectibleLists::load(&config.sysinfo.collectibles);
            println!(
                "  Collectibles: {} commands, {} files, {} profilers",
                lists.commands.len(),
                lists.files.len(),
                lists.profilers.len()
            );
            Ok(true)
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            Ok(false)
        }
    }
}
