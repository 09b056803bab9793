//! Sync command handlers

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use mtrace_core::{SyncEngine, SyncEvent};

use super::require_account;
use crate::output::Output;

/// Sign in an account and run the initial sync
pub async fn login(engine: &SyncEngine, account: &str, output: &Output) -> Result<()> {
    if account.trim().is_empty() {
        bail!("Account id cannot be empty");
    }

    output.message(&format!("Signing in {}...", account));
    match engine
        .start(account)
        .await
        .context("Initial sync failed")?
    {
        Some(report) => output.print_sync_report(&report),
        None => output.message("Signed in. Sync is disabled; data stays local."),
    }
    Ok(())
}

/// Run a full reconciliation with the server
pub async fn sync(engine: &SyncEngine, force: bool, output: &Output) -> Result<()> {
    if !engine.config().sync_enabled {
        bail!(
            "Sync is not enabled. Enable it with:\n  \
             mtrace config set sync_enabled true"
        );
    }
    let account = require_account(engine)?;

    output.message("Contacting sync server...");
    let report = if force {
        engine.forced_sync(&account).await
    } else {
        engine.initial_sync(&account).await
    }
    .context("Sync failed")?;
    output.print_sync_report(&report);

    if !engine.pending().await.is_empty() {
        let drained = engine.drain().await;
        output.print_drain_report(&drained);
    }
    Ok(())
}

/// Deliver pending mutations now
pub async fn drain(engine: &SyncEngine, output: &Output) -> Result<()> {
    let report = engine.drain().await;
    output.print_drain_report(&report);
    Ok(())
}

/// Keep the push channel open and print engine events until Ctrl-C
pub async fn listen(engine: &SyncEngine, output: &Output) -> Result<()> {
    let account = require_account(engine)?;
    let mut events = engine.subscribe();

    if let Some(report) = engine.start(&account).await.context("Failed to start sync")? {
        output.print_sync_report(&report);
    }
    output.message(&format!("Listening for {} (Ctrl-C to stop)...", account));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                output.message("Stopping.");
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(event) => {
                    output.print_event(&event);
                    if let SyncEvent::AuthenticationFailed(reason) = event {
                        bail!("Authentication failed: {}", reason);
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Event listener fell behind");
                    output.message(&format!("({} events missed)", missed));
                }
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}
