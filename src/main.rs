use std::path::PathBuf;

use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use netscope::commands::{self, CliResult};

#[derive(Parser, Debug)]
#[command(name = "netscope")]
#[command(about = "Traffic capture and inspection for an embedded browsing surface", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Inspect or bootstrap ~/.netscope/config.json
    Config {
        #[command(subcommand)]
        cmd: ConfigCommand,
    },
    /// Inspect recorded capture sessions
    Sessions {
        #[command(subcommand)]
        cmd: SessionsCommand,
    },
    /// Run environment diagnostics
    Doctor {
        /// Output diagnostics as JSON (machine-readable), without ANSI colors
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the effective configuration
    Show {
        #[arg(long)]
        json: bool,
    },
    /// Write a default config.json
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum SessionsCommand {
    /// List recorded sessions under the configured output folder
    List {
        /// Maximum number of sessions to show (newest first)
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Show the REST entries of one session directory
    Show {
        dir: PathBuf,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() {
    if let Err(err) = real_main().await {
        eprintln!("{}", err.to_string().red());
        std::process::exit(1);
    }
}

async fn real_main() -> CliResult<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing();

    match cli.command {
        Command::Config { cmd } => match cmd {
            ConfigCommand::Show { json } => commands::config::run_show(json)?,
            ConfigCommand::Init { force } => commands::config::run_init(force)?,
        },
        Command::Sessions { cmd } => match cmd {
            SessionsCommand::List { limit, json } => {
                commands::sessions::run_list(limit, json).await?
            }
            SessionsCommand::Show { dir, limit } => {
                commands::sessions::run_show(&dir, limit).await?
            }
        },
        Command::Doctor { json } => commands::doctor::run(json)?,
    }

    Ok(())
}

fn init_tracing() -> Option<WorkerGuard> {
    // Default to info logs unless the user sets RUST_LOG.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // When stderr belongs to an embedding application rather than a
    // terminal, logs can be redirected to a file instead.
    let to_file = std::env::var("NETSCOPE_LOG_TO_FILE")
        .map(|v| matches!(v.trim(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false);

    if to_file {
        let log_dir = netscope::config::netscope_home_dir().join("logs");
        let _ = std::fs::create_dir_all(&log_dir);

        rotate_runtime_log_if_needed(&log_dir);

        let file_appender = tracing_appender::rolling::never(&log_dir, "runtime.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_ansi(false)
            .with_writer(non_blocking)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
        None
    }
}

fn rotate_runtime_log_if_needed(log_dir: &std::path::Path) {
    const MAX_BYTES: u64 = 20 * 1024 * 1024;

    let path = log_dir.join("runtime.log");
    let Ok(meta) = std::fs::metadata(&path) else {
        return;
    };
    if meta.len() < MAX_BYTES {
        return;
    }
    let rotated = log_dir.join(format!("runtime.{}.log", netscope::util::now_ms()));
    let _ = std::fs::rename(&path, rotated);
}
