use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

use log_beacon::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let config_path = args.config_path();

    match args.get_command() {
        cli::Commands::Start { port } => {
            // Tracing is initialized from the loaded configuration
            commands::start::execute(config_path.as_deref(), port).await?;
        }
        cli::Commands::Test => {
            init_tracing("warn", "text");
            commands::test::execute(config_path.as_deref())?;
        }
        cli::Commands::Config { action } => {
            init_tracing("warn", "text");
            match action {
                cli::ConfigCommands::Show => commands::config::show(config_path.as_deref())?,
                cli::ConfigCommands::Validate => {
                    commands::config::validate(config_path.as_deref())?
                }
            }
        }
        cli::Commands::Version => {
            println!("log-beacon v{}", env!("CARGO_PKG_VERSION"));
            println!("Rust {}", env!("CARGO_PKG_RUST_VERSION"));
        }
    }

    Ok(())
}
