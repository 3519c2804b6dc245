use anyhow::Result;
use colored::Colorize;
use log_beacon::{config, init_tracing, server};
use tracing::info;

/// Execute the start command
///
/// This will:
/// 1. Load configuration
/// 2. Initialize tracing from the server section
/// 3. Start the server (blocks until shutdown)
pub async fn execute(config_path: Option<&str>, port: Option<u16>) -> Result<()> {
    let mut cfg = config::load_config(config_path)?;
    if let Some(port) = port {
        cfg.server.port = port;
    }

    init_tracing(&cfg.server.log_level, &cfg.server.log_format);

    println!("{}", "Starting log-beacon...".green());
    info!(
        config = config_path.unwrap_or("(defaults)"),
        "Starting log-beacon v{}",
        env!("CARGO_PKG_VERSION")
    );

    server::start_server(cfg).await?;

    Ok(())
}
