use anyhow::Result;
use colored::Colorize;
use log_beacon::config;
use tracing::info;

/// Execute the config show command
///
/// Displays the effective configuration after defaults and env overrides
pub fn show(config_path: Option<&str>) -> Result<()> {
    println!("{}", "Loading configuration...".yellow());
    info!("Loading configuration for display");

    let cfg = config::load_config(config_path)?;

    println!("{}", "Current Configuration:".green().bold());
    println!();

    let toml_string = toml::to_string_pretty(&cfg)?;
    println!("{}", toml_string);

    Ok(())
}

/// Execute the config validate command
pub fn validate(config_path: Option<&str>) -> Result<()> {
    println!("{}", "Validating configuration...".yellow());
    info!("Validating configuration file");

    let cfg = config::load_config(config_path)?;

    println!("{}", "✓ Configuration is valid".green());
    println!();
    println!("{}", "Summary:".bold());
    println!("  Stream: {} ({})", cfg.bus.stream, cfg.bus.subject);
    println!(
        "  Enabled Consumers: {}",
        [cfg.archiver.enabled, cfg.hot_storage.enabled]
            .iter()
            .filter(|enabled| **enabled)
            .count()
    );

    info!("Configuration validation successful");
    Ok(())
}
