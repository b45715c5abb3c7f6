//! live-migrate CLI - zero-downtime data store migration.

use clap::{Parser, Subcommand};
use live_migrate::{Config, MigrateError, MigrationState, Orchestrator};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// State file used when neither the flag nor a readable config names one.
const DEFAULT_STATE_FILE: &str = "migration-state.json";

#[derive(Parser)]
#[command(name = "live-migrate")]
#[command(about = "Zero-downtime data store migration with change replication and reversible cutover")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Path to the state file (overrides state_file in the configuration)
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a migration through bulk copy, replication, validation and cutover
    Start,

    /// Print the summary of the last run from the state file
    Report,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, MigrateError> {
    let cli = Cli::parse();
    setup_logging(&cli.verbosity, &cli.log_format);

    match cli.command {
        Commands::Start => start(&cli).await,
        Commands::Report => {
            report(&cli);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn start(cli: &Cli) -> Result<ExitCode, MigrateError> {
    let config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    let cancel_token = setup_signal_handler();

    let mut orchestrator = Orchestrator::new(config).await?;
    if let Some(ref path) = cli.state_file {
        orchestrator = orchestrator.with_state_file(path.clone());
    }

    let result = orchestrator.run(cancel_token).await?;

    if cli.output_json {
        println!("{}", result.to_json()?);
    } else {
        println!("\nMigration {}", result.job.status);
        println!("  Migration ID: {}", result.job.id);
        println!("  Final phase: {}", result.job.phase);
        println!("  Duration: {:.2}s", result.duration_seconds);
        println!(
            "  Collections: {}/{}",
            result.collections_copied, result.collections_total
        );
        println!("  Records: {} ({} skipped)", result.records_migrated, result.records_skipped);
        if let Some(n) = result.discrepancies {
            println!("  Discrepancies: {}", n);
        }
        if let Some(ref err) = result.error {
            println!("  Error: {}", err);
        }
    }

    Ok(if result.is_complete() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

/// Print the last run's summary. Never fails: problems become notices.
fn report(cli: &Cli) {
    let path = state_file_path(cli);
    if !path.exists() {
        println!("No migration state found at {}", path.display());
        return;
    }
    match MigrationState::load(&path) {
        Ok(state) => {
            if cli.output_json {
                match serde_json::to_string_pretty(&state) {
                    Ok(json) => println!("{}", json),
                    Err(e) => println!("Could not render state as JSON: {}", e),
                }
            } else {
                print!("{}", state.render_report());
            }
        }
        Err(e) => println!("Could not read migration state at {}: {}", path.display(), e),
    }
}

fn state_file_path(cli: &Cli) -> PathBuf {
    if let Some(ref path) = cli.state_file {
        return path.clone();
    }
    match Config::load(&cli.config) {
        Ok(config) => config.state_file,
        Err(e) => {
            if Path::new(&cli.config).exists() {
                warn!("Could not load {:?}: {}", cli.config, e);
            }
            PathBuf::from(DEFAULT_STATE_FILE)
        }
    }
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // stdout is reserved for results
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Cancel the returned token on SIGINT or SIGTERM; the orchestrator then
/// rolls the migration back.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        tokio::spawn(async move {
            let mut stream = match signal(kind) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Failed to set up {} handler: {}", name, e);
                    return;
                }
            };
            stream.recv().await;
            eprintln!("\nReceived {}. Rolling back...", name);
            token.cancel();
        });
    }

    cancel_token
}

/// Windows only delivers Ctrl-C.
#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to set up Ctrl-C handler: {}", e);
            return;
        }
        eprintln!("\nReceived Ctrl-C. Rolling back...");
        token.cancel();
    });

    cancel_token
}
