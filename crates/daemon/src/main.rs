//! dirshare daemon
//!
//! Serves a local directory tree to file-transfer clients.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::config::{default_config_path, Config};
use daemon::{serve_connection, LocalFs, SessionListener};

/// dirshare daemon - serves a local directory tree to file-transfer clients.
#[derive(Parser, Debug)]
#[command(name = "dirshare-daemon")]
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

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Serve the shared directory
    Serve {
        /// Serve a single session on stdin/stdout instead of a socket
        #[arg(long, conflicts_with = "socket")]
        stdio: bool,

        /// Unix socket to listen on (overrides the config file)
        #[arg(long, value_name = "PATH")]
        socket: Option<PathBuf>,

        /// Directory to share (overrides the config file)
        #[arg(long, value_name = "DIR")]
        root: Option<PathBuf>,
    },

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Validate the configuration and the shared directory
    Check,
}

/// Subcommands for configuration management.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();

    if let Commands::Serve {
        root: Some(root), ..
    } = &cli.command
    {
        config.share.root_dir = root.clone();
    }

    config.validate()?;

    let _logging =
        daemon::logging::init(&config.logging.level, cli.verbose, config.logging.file.as_deref())?;

    match cli.command {
        Commands::Serve { stdio, socket, .. } => {
            let root = config.ensure_root_dir()?;
            let settings = config.session_settings(root);
            let codec = config.frame_codec();
            let fs = Arc::new(LocalFs::new());

            if stdio {
                tracing::info!(root = %settings.root.display(), "Serving one session on stdio");
                let stats =
                    serve_connection(tokio::io::stdin(), tokio::io::stdout(), fs, settings, codec)
                        .await?;
                tracing::info!(
                    requests = stats.requests,
                    responses = stats.responses,
                    "Session ended"
                );
            } else {
                let socket_path = socket.unwrap_or_else(|| config.transport.socket_path.clone());
                let listener = SessionListener::bind(&socket_path).await.with_context(|| {
                    format!("Failed to bind socket: {}", socket_path.display())
                })?;
                listener
                    .serve(fs, settings, codec, wait_for_shutdown_signal())
                    .await?;
            }
        }
        Commands::Config(ConfigCommands::Show) => {
            print!("{}", config.to_toml()?);
        }
        Commands::Config(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "Config file already exists: {} (use --force to overwrite)",
                    config_path.display()
                );
            }
            Config::default().save(&config_path)?;
            println!("Wrote {}", config_path.display());
        }
        Commands::Check => {
            let root = config.ensure_root_dir()?;
            println!("Configuration OK");
            println!("  Root directory: {}", root.display());
            println!("  Display user:   {}", config.share.display_user);
            println!("  Max read size:  {} bytes", config.share.max_read_size);
            println!("  Socket:         {}", config.transport.socket_path.display());
        }
    }

    Ok(())
}

/// Wait for Ctrl-C.
async fn wait_for_shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received shutdown signal"),
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_command() {
        let cli = Cli::try_parse_from(["dirshare-daemon", "serve"]).unwrap();
        match cli.command {
            Commands::Serve {
                stdio,
                socket,
                root,
            } => {
                assert!(!stdio);
                assert!(socket.is_none());
                assert!(root.is_none());
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_serve_stdio_with_root() {
        let cli =
            Cli::try_parse_from(["dirshare-daemon", "serve", "--stdio", "--root", "/srv/share"])
                .unwrap();
        match cli.command {
            Commands::Serve { stdio, root, .. } => {
                assert!(stdio);
                assert_eq!(root, Some(PathBuf::from("/srv/share")));
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_serve_with_socket() {
        let cli =
            Cli::try_parse_from(["dirshare-daemon", "serve", "--socket", "/tmp/d.sock"]).unwrap();
        match cli.command {
            Commands::Serve { socket, .. } => {
                assert_eq!(socket, Some(PathBuf::from("/tmp/d.sock")));
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_stdio_conflicts_with_socket() {
        let result = Cli::try_parse_from([
            "dirshare-daemon",
            "serve",
            "--stdio",
            "--socket",
            "/tmp/d.sock",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_config_show() {
        let cli = Cli::try_parse_from(["dirshare-daemon", "config", "show"]).unwrap();
        assert!(matches!(cli.command, Commands::Config(ConfigCommands::Show)));
    }

    #[test]
    fn test_config_init_force() {
        let cli = Cli::try_parse_from(["dirshare-daemon", "config", "init", "-f"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Config(ConfigCommands::Init { force: true })
        ));
    }

    #[test]
    fn test_check_command() {
        let cli = Cli::try_parse_from(["dirshare-daemon", "check"]).unwrap();
        assert!(matches!(cli.command, Commands::Check));
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from([
            "dirshare-daemon",
            "check",
            "--verbose",
            "--config",
            "/etc/dirshare.toml",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/dirshare.toml")));
    }

    #[test]
    fn test_missing_subcommand_fails() {
        assert!(Cli::try_parse_from(["dirshare-daemon"]).is_err());
    }
}
