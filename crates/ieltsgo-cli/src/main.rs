//! ieltsgo - IELTSGo notifications from the terminal
//!
//! ```bash
//! ieltsgo login --token <jwt>
//! ieltsgo watch            # live stream, Ctrl-C to stop
//! ieltsgo list --unread
//! ieltsgo read <id>
//! ieltsgo prefs set push_enabled=false quiet_hours_start=22:00:00
//! ```

mod commands;
mod output;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ieltsgo_core::ClientConfig;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ieltsgo", version, about = "IELTSGo notifications client")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Config file (default: ~/.ieltsgo/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// API base URL override
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Enable debug logging
    #[arg(long, short = 'v', global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Store an access token
    Login {
        /// Access token (read from stdin when omitted)
        #[arg(long)]
        token: Option<String>,

        #[arg(long)]
        refresh_token: Option<String>,

        /// Seconds until the access token expires
        #[arg(long)]
        expires_in: Option<i64>,
    },

    /// Forget the stored token
    Logout,

    /// Stream notifications as they arrive
    Watch {
        /// Print raw JSON, one notification per line
        #[arg(long)]
        json: bool,
    },

    /// List notifications
    List {
        #[arg(long, default_value = "1")]
        page: u32,

        #[arg(long, default_value = "20")]
        limit: u32,

        /// Only unread
        #[arg(long, conflicts_with = "read")]
        unread: bool,

        /// Only read
        #[arg(long)]
        read: bool,

        #[arg(long)]
        json: bool,
    },

    /// Show the unread count
    Unread,

    /// Mark a notification as read
    Read { id: String },

    /// Mark every notification as read
    ReadAll,

    /// Delete a notification
    Delete { id: String },

    /// Notification preferences
    Prefs {
        #[command(subcommand)]
        action: PrefsCommand,
    },
}

#[derive(Subcommand)]
enum PrefsCommand {
    /// Show current preferences
    Show,

    /// Update preferences, e.g. `push_enabled=false`
    Set {
        #[arg(required = true, value_name = "KEY=VALUE")]
        updates: Vec<String>,
    },
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => ClientConfig::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ClientConfig::load().context("Failed to load config")?,
    };
    if let Some(url) = &cli.api_url {
        config.api_base_url = url.clone();
    }
    // Surface a bad URL here rather than on the first request
    config.stream_url().context("Invalid API base URL")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(&cli)?;

    match cli.command {
        Command::Login {
            token,
            refresh_token,
            expires_in,
        } => commands::login(token, refresh_token, expires_in),
        Command::Logout => commands::logout(),
        Command::Watch { json } => commands::watch(&config, json).await,
        Command::List {
            page,
            limit,
            unread,
            read,
            json,
        } => {
            let filter = match (unread, read) {
                (true, _) => Some(false),
                (_, true) => Some(true),
                _ => None,
            };
            commands::list(&config, page, limit, filter, json).await
        }
        Command::Unread => commands::unread(&config).await,
        Command::Read { id } => commands::read(&config, &id).await,
        Command::ReadAll => commands::read_all(&config).await,
        Command::Delete { id } => commands::delete(&config, &id).await,
        Command::Prefs { action } => match action {
            PrefsCommand::Show => commands::prefs_show(&config).await,
            PrefsCommand::Set { updates } => commands::prefs_set(&config, &updates).await,
        },
    }
}
