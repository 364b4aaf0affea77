#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::uninlined_format_args
)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use channelbridge::config::Config;
use channelbridge::daemon::{self, LogDispatcher};
use channelbridge::doctor;

/// Bridge WhatsApp, Telegram and e-mail accounts into one event stream.
#[derive(Parser, Debug)]
#[command(name = "channelbridge")]
#[command(version)]
#[command(about = "Multi-platform messaging bridge.", long_about = None)]
struct Cli {
    /// Config file (default: ~/.channelbridge/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect every enabled account and serve the webhook gateway
    Start {
        /// Port to listen on; defaults to config gateway.port
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to; defaults to config gateway.host
        #[arg(long)]
        host: Option<String>,
    },

    /// List configured accounts
    Accounts,

    /// Validate the configuration and report problems
    Doctor,
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    match path {
        Some(path) => {
            let mut config = Config::load_from(&path)?;
            config.apply_env_overrides();
            Ok(config)
        }
        None => Config::load_or_init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Both rustls consumers (IMAP and reqwest) pick up the process default.
    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        eprintln!("Warning: Failed to install default crypto provider: {e:?}");
    }

    let cli = Cli::parse();

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("setting default subscriber failed")?;

    let mut config = load_config(cli.config)?;

    match cli.command {
        Commands::Start { port, host } => {
            if let Some(port) = port {
                config.gateway.port = port;
            }
            if let Some(host) = host {
                config.gateway.host = host;
            }
            daemon::run(config, Arc::new(LogDispatcher)).await
        }
        Commands::Accounts => {
            if config.accounts.is_empty() {
                println!("No accounts configured in {}", config.config_path.display());
                return Ok(());
            }
            println!("Accounts:");
            for account in &config.accounts {
                println!(
                    "  {} {:<24} {}",
                    if account.enabled { "✅" } else { "❌" },
                    account.id,
                    account.platform()
                );
            }
            Ok(())
        }
        Commands::Doctor => doctor::run(&config).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn start_accepts_overrides() {
        let cli = Cli::try_parse_from(["channelbridge", "start", "--port", "0", "--host", "0.0.0.0"]).unwrap();
        match cli.command {
            Commands::Start { port, host } => {
                assert_eq!(port, Some(0));
                assert_eq!(host.as_deref(), Some("0.0.0.0"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn config_flag_is_global() {
        let cli = Cli::try_parse_from(["channelbridge", "doctor", "--config", "/tmp/c.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));
    }
}
