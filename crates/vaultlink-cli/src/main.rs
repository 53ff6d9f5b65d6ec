//! vaultlink - command-line client and MCP server for Veeva Vault.
//!
//! Configuration comes from `VAULT_*` environment variables (a `.env` file
//! in the working directory is loaded first). Sessions are cached on disk so
//! consecutive commands reuse one Vault session.

mod commands;

use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "vaultlink")]
#[command(author, version, about = "Command-line client and MCP server for Veeva Vault")]
#[command(propagate_version = true)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv). RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Also write logs to this file, rotated daily
    #[arg(long, env = "VAULTLINK_LOG_FILE", global = true)]
    log_file: Option<PathBuf>,

    /// Do not read or write the cached session
    #[arg(long, global = true)]
    no_session_cache: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Authenticate and cache a new session
    Login {
        /// Store the password in the system keychain for later logins
        #[arg(long)]
        save_password: bool,
    },

    /// End the cached session
    Logout {
        /// Also remove the password from the system keychain
        #[arg(long)]
        forget_password: bool,
    },

    /// Show the cached session
    Status,

    /// Keep the cached session from timing out
    KeepAlive {
        /// Keep pinging every SECS seconds until interrupted
        #[arg(long, value_name = "SECS")]
        every: Option<u64>,
    },

    /// Run a VQL query
    Query {
        /// VQL statement
        vql: String,
    },

    /// Call any Vault endpoint
    Call(commands::CallArgs),

    /// Serve Vault tools over MCP on stdin/stdout
    Serve {
        /// Ping keep-alive every SECS seconds while serving
        #[arg(long, value_name = "SECS")]
        keep_alive: Option<u64>,
    },
}

/// Log file rotated daily; each day's file gets a `.YYYY-MM-DD` suffix.
fn daily_log_file(path: &Path) -> Result<RollingFileAppender> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .context("log file path has no file name")?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(name.to_string_lossy())
        .build(dir)
        .with_context(|| format!("Failed to open log file {}", path.display()))
}

/// Initialize the tracing subscriber for logging
fn init_tracing(verbose: u8, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let (writer, guard) = tracing_appender::non_blocking(daily_log_file(path)?);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    // stdout carries command output and the MCP protocol, so logs go to stderr
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    Ok(guard)
}

async fn run(cli: Cli) -> Result<()> {
    let cache = !cli.no_session_cache;
    match cli.command {
        Commands::Login { save_password } => commands::login(cache, save_password).await,
        Commands::Logout { forget_password } => commands::logout(cache, forget_password).await,
        Commands::Status => commands::status(cache),
        Commands::KeepAlive { every } => commands::keep_alive(cache, every).await,
        Commands::Query { vql } => commands::query(cache, &vql).await,
        Commands::Call(args) => commands::call(cache, args).await,
        Commands::Serve { keep_alive } => commands::serve(cache, keep_alive).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let _guard = match init_tracing(cli.verbose, cli.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    info!("vaultlink starting");

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
