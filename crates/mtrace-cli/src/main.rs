//! Millennium Trace CLI
//!
//! Operator tool for the offline-first sync engine: inspect and drive the
//! pending queue, run reconciliations and settle conflicts.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use mtrace_core::{Config, StorageError, SyncEngine};

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "mtrace")]
#[command(about = "Millennium Trace - offline-first sync engine")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log engine activity to stderr (repeat for more detail)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Show engine status (queue, connection, storage)
    Status,
    /// Show this device's identity
    Device,
    /// Sign in an account and run the initial sync
    Login {
        /// Account identifier
        account: String,
    },
    /// Inspect and manage the pending queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Run a full reconciliation with the server
    Sync {
        /// Use the forced endpoint (recover from missed pushes)
        #[arg(long)]
        force: bool,
    },
    /// Deliver pending mutations now
    Drain,
    /// Show a locally stored entity
    Get {
        /// Entity type (user, artifact, scene, nft, activity)
        entity: String,
        /// Entity id
        id: String,
    },
    /// List and resolve conflicts
    Conflicts {
        #[command(subcommand)]
        command: Option<ConflictCommands>,
    },
    /// Keep the push channel open and print engine events
    Listen,
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, api_url, api_key, account_id, sync_enabled)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// List pending mutations
    #[command(alias = "ls")]
    List,
    /// Queue a mutation
    Add {
        /// Entity type (user, artifact, scene, nft, activity)
        entity: String,
        /// Action (create, update, delete)
        action: String,
        /// JSON payload, or @path to read it from a file
        payload: String,
    },
    /// List abandoned mutations
    Abandoned,
    /// Re-queue an abandoned mutation
    Retry {
        /// Queue item id (full UUID or prefix)
        id: String,
    },
    /// Drop an abandoned mutation for good
    Discard {
        /// Queue item id (full UUID or prefix)
        id: String,
    },
    /// Drop every pending mutation
    Clear {
        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum ConflictCommands {
    /// List conflicts
    #[command(alias = "ls")]
    List {
        /// Include resolved conflicts
        #[arg(short, long)]
        all: bool,
    },
    /// Resolve a conflict
    Resolve {
        /// Conflict id
        id: String,
        /// Resolution policy (local, remote, merge)
        policy: String,
        /// Merged payload (JSON or @path), required for merge
        #[arg(long)]
        merged: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));

    // Config commands work without opening the engine
    if let Commands::Config { command } = &cli.command {
        return handle_config_command(command.clone(), &output);
    }

    let config = Config::load()?;
    let engine = match SyncEngine::open(config) {
        Ok(engine) => engine,
        Err(e) => {
            if let Some(hint) = e
                .chain()
                .find_map(|cause| cause.downcast_ref::<StorageError>())
                .and_then(StorageError::recovery_suggestion)
            {
                eprintln!("hint: {}", hint);
            }
            return Err(e);
        }
    };

    let result = match cli.command {
        Commands::Config { .. } => unreachable!(), // Handled above
        Commands::Status => commands::status::show(&engine, &output),
        Commands::Device => commands::status::device(&engine, &output),
        Commands::Login { account } => commands::sync::login(&engine, &account, &output).await,
        Commands::Queue { command } => handle_queue_command(command, &engine, &output).await,
        Commands::Sync { force } => commands::sync::sync(&engine, force, &output).await,
        Commands::Drain => commands::sync::drain(&engine, &output).await,
        Commands::Get { entity, id } => commands::data::get(&engine, &entity, &id, &output),
        Commands::Conflicts { command } => {
            handle_conflict_command(command, &engine, &output).await
        }
        Commands::Listen => commands::sync::listen(&engine, &output).await,
    };

    engine.shutdown();
    result
}

async fn handle_queue_command(
    command: QueueCommands,
    engine: &SyncEngine,
    output: &Output,
) -> Result<()> {
    match command {
        QueueCommands::List => commands::queue::list(engine, output).await,
        QueueCommands::Add {
            entity,
            action,
            payload,
        } => commands::queue::add(engine, &entity, &action, &payload, output).await,
        QueueCommands::Abandoned => commands::queue::abandoned(engine, output).await,
        QueueCommands::Retry { id } => commands::queue::retry(engine, &id, output).await,
        QueueCommands::Discard { id } => commands::queue::discard(engine, &id, output).await,
        QueueCommands::Clear { yes } => commands::queue::clear(engine, yes, output).await,
    }
}

async fn handle_conflict_command(
    command: Option<ConflictCommands>,
    engine: &SyncEngine,
    output: &Output,
) -> Result<()> {
    match command {
        Some(ConflictCommands::List { all }) => commands::conflicts::list(engine, all, output),
        None => commands::conflicts::list(engine, false, output),
        Some(ConflictCommands::Resolve { id, policy, merged }) => {
            commands::conflicts::resolve(engine, &id, &policy, merged.as_deref(), output).await
        }
    }
}

fn handle_config_command(command: Option<ConfigCommands>, output: &Output) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(output),
        Some(ConfigCommands::Set { key, value }) => commands::config::set(key, value, output),
    }
}

/// Log to stderr; `RUST_LOG` wins over `--verbose`
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("mtrace_core={},mtrace_cli={}", level, level)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
