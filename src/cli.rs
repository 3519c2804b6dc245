use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "log-beacon", version, about = "Log ingestion, archival and search service")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml", global = true, env = "LOG_BEACON_CONFIG")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the server (default)
    Start {
        /// Override the listen port from the configuration
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Test configuration file validity
    Test,

    /// Configuration management commands
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Display the effective configuration (file, defaults and env overrides)
    Show,

    /// Validate configuration file
    Validate,
}

impl Cli {
    /// Get the command to execute, defaulting to Start if none provided
    pub fn get_command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Start { port: None })
    }

    /// Config path as passed to the loader
    ///
    /// The default `config.toml` is optional; any other path must exist.
    pub fn config_path(&self) -> Option<String> {
        if self.config == PathBuf::from("config.toml") && !self.config.exists() {
            return None;
        }
        Some(self.config.to_string_lossy().into_owned())
    }
}
