//! Config command handlers

use anyhow::{Context, Result};

use mtrace_core::Config;

use crate::output::{Output, OutputFormat};

/// Show current configuration
pub fn show(output: &Output) -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => {
            let mut shown = config.clone();
            if shown.api_key.is_some() {
                shown.api_key = Some("(hidden)".to_string());
            }
            output.print_json(&shown);
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            println!("Configuration:");
            println!("  data_dir:     {}", config.data_dir.display());
            println!("  api_url:      {}", config.api_url);
            println!(
                "  api_key:      {}",
                if config.api_key.is_some() {
                    "(set)"
                } else {
                    "(not set)"
                }
            );
            println!(
                "  account_id:   {}",
                config.account_id.as_deref().unwrap_or("(not set)")
            );
            println!("  sync_enabled: {}", config.sync_enabled);
            println!();
            println!("Sync tuning:");
            println!("  batch_size:           {}", config.sync.batch_size);
            println!("  max_retries:          {}", config.sync.max_retries);
            println!("  drain_interval_secs:  {}", config.sync.drain_interval_secs);
            println!("  reconnect_delay_secs: {}", config.sync.reconnect_delay_secs);
            println!();
            println!("Services:");
            println!("  recognition: {}", config.services.recognition_url);
            println!("  scene:       {}", config.services.scene_url);
            println!("  nft:         {}", config.services.nft_url);
            println!();
            println!("Config file: {}", Config::config_file_path().display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(key: String, value: String, output: &Output) -> Result<()> {
    let mut config = Config::load().context("Failed to load configuration")?;
    config.set(&key, &value)?;
    config.save().context("Failed to save configuration")?;

    let shown = if key == "api_key" { "(hidden)" } else { value.as_str() };
    output.success(&format!("Set {} = {}", key, shown));

    Ok(())
}
