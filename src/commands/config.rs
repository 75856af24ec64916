use owo_colors::OwoColorize;

use crate::commands::{CliError, CliResult};
use crate::config::{CaptureConfig, config_path, load_config, save_config};

/// `netscope config show [--json]`
pub fn run_show(json: bool) -> CliResult<()> {
    let config = load_config().map_err(|e| CliError::Config(format!("{e:#}")))?;

    if json {
        let text = serde_json::to_string_pretty(&config)
            .map_err(|e| CliError::Config(e.to_string()))?;
        println!("{text}");
        return Ok(());
    }

    let path = config_path();
    let on_disk = path.exists();
    println!(
        "{} {}{}",
        "Config:".bold(),
        path.display(),
        if on_disk { "" } else { " (defaults, not saved yet)" }
    );
    println!("  targetUrl            {}", config.target_url);
    println!("  outputFolder         {}", config.output_folder.display());
    println!(
        "  userAgent            {}",
        config.user_agent.as_deref().unwrap_or("(host default)")
    );
    println!(
        "  window               {}x{}",
        config.win_width, config.win_height
    );
    println!("  redactSecrets        {}", flag(config.redact_secrets));
    println!("  captureBodies        {}", flag(config.capture_bodies));
    println!("  captureBodyMaxBytes  {}", config.capture_body_max_bytes);
    println!("  captureBodyTypes     {}", config.capture_body_types);
    println!("  enableCdp            {}", flag(config.enable_cdp));
    Ok(())
}

fn flag(v: bool) -> String {
    if v {
        "on".green().to_string()
    } else {
        "off".dimmed().to_string()
    }
}

/// `netscope config init [--force]`
pub fn run_init(force: bool) -> CliResult<()> {
    let path = config_path();
    if path.exists() && !force {
        return Err(CliError::Config(format!(
            "{} already exists; pass --force to overwrite",
            path.display()
        )));
    }
    let config = CaptureConfig::default();
    save_config(&config).map_err(|e| CliError::Config(format!("{e:#}")))?;
    println!("{} wrote {}", "ok".green().bold(), path.display());
    Ok(())
}
