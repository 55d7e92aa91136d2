//! rsshd
//!
//! SSH server exposing shells, commands and SFTP to authorized keys.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use rsshd::config::{default_config_path, Config};
use rsshd::transport::keys;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// rsshd - a small SSH server.
#[derive(Parser, Debug)]
#[command(name = "rsshd")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Accept SSH connections until SIGTERM or SIGINT
    Serve {
        /// Listen address, overriding the configuration
        #[arg(long, short, value_name = "ADDR")]
        listen: Option<String>,
    },

    /// Validate the configuration and print it
    CheckConfig,

    /// Write the current configuration to the config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the host key fingerprint, generating the key if needed
    HostKey,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();
    if let Commands::Serve {
        listen: Some(addr),
    } = &cli.command
    {
        config.server.listen_addr = addr.clone();
    }

    let _guard = init_tracing(&config, cli.verbose)?;
    tracing::info!(config = %config_path.display(), "rsshd starting");

    config.validate()?;

    match cli.command {
        Commands::Serve { .. } => {
            let shutdown = CancellationToken::new();
            let server = rsshd::Server::bind(&config).await?;

            let trigger = shutdown.clone();
            tokio::spawn(async move {
                wait_for_shutdown_signal().await;
                trigger.cancel();
            });

            server.serve(shutdown).await?;
            tracing::info!("rsshd stopped");
        }
        Commands::CheckConfig => {
            println!("Configuration OK: {}", config_path.display());
            println!();
            print!("{}", config.to_toml()?);
        }
        Commands::InitConfig { force } => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "Config file already exists: {} (use --force to overwrite)",
                    config_path.display()
                );
            }
            config.save(&config_path)?;
            println!("Wrote {}", config_path.display());
        }
        Commands::HostKey => {
            let path = config.host_key_path();
            let key = keys::load_or_generate_host_key(&path)?;
            println!("{}", keys::fingerprint(key.public_key()));
            println!("{}", path.display());
        }
    }

    Ok(())
}

/// Install the global subscriber. Logs go to stderr, or to the configured
/// file through a non-blocking writer whose guard must outlive `main`.
fn init_tracing(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug"
    } else {
        config.daemon.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match &config.daemon.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("Invalid log file path: {}", path.display()))?;
            std::fs::create_dir_all(dir)?;

            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!(error = %e, "Failed to register signal handlers, falling back to Ctrl-C");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
}
