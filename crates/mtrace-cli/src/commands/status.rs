//! Status and device command handlers

use anyhow::Result;

use mtrace_core::SyncEngine;

use crate::output::{human_size, Output, OutputFormat};

/// Show status information
pub fn show(engine: &SyncEngine, output: &Output) -> Result<()> {
    let status = engine.status()?;
    let config = engine.config();

    match output.format {
        OutputFormat::Json => output.print_json(&status),
        OutputFormat::Quiet => {
            println!("{}", status.state.queue_length);
        }
        OutputFormat::Human => {
            println!("Millennium Trace Status");
            println!("=======================");
            println!();
            println!("Account:");
            println!(
                "  ID:     {}",
                status.account_id.as_deref().unwrap_or("(not signed in)")
            );
            println!("  Device: {}", status.device_id);
            println!();
            println!("Sync:");
            println!(
                "  Status:  {}",
                if status.sync_enabled {
                    "enabled"
                } else {
                    "disabled"
                }
            );
            println!("  Server:  {}", config.api_url);
            println!(
                "  Last full sync: {}",
                status
                    .state
                    .last_full_sync_at
                    .map(|at| {
                        format!(
                            "{} ({} entities)",
                            at.format("%Y-%m-%d %H:%M"),
                            status.state.last_full_sync_count.unwrap_or(0)
                        )
                    })
                    .unwrap_or_else(|| "never".to_string())
            );
            println!();
            println!("Queue:");
            println!("  Pending:   {}", status.state.queue_length);
            println!("  Abandoned: {}", status.state.abandoned_count);
            println!("  Conflicts: {}", status.open_conflicts);
            println!();
            println!("Storage:");
            println!("  Location: {}", config.database_path().display());
            println!("  Entities: {}", status.stored_entities);
            println!("  Size:     {}", human_size(status.database_size));
        }
    }

    Ok(())
}

/// Show this device's identity
pub fn device(engine: &SyncEngine, output: &Output) -> Result<()> {
    let device_id = engine.device_id();
    let account_id = engine.account_id();

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "device_id": device_id,
                    "account_id": account_id
                })
            );
        }
        OutputFormat::Quiet => println!("{}", device_id),
        OutputFormat::Human => {
            println!();
            println!("Device ID:  {}", device_id);
            println!(
                "Account ID: {}",
                account_id.as_deref().unwrap_or("(not signed in)")
            );
            println!();
            println!("Every mutation from this device is tagged with its device ID.");
        }
    }

    Ok(())
}
