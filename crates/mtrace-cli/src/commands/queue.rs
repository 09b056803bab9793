//! Queue command handlers

use anyhow::{anyhow, Result};

use mtrace_core::{Action, EntityType, SyncEngine};

use super::{confirm, match_id, parse_json_arg};
use crate::output::Output;

/// List pending mutations
pub async fn list(engine: &SyncEngine, output: &Output) -> Result<()> {
    let items = engine.pending().await;
    output.print_queue(&items);
    Ok(())
}

/// Queue a mutation and try to deliver it
pub async fn add(
    engine: &SyncEngine,
    entity: &str,
    action: &str,
    payload: &str,
    output: &Output,
) -> Result<()> {
    let entity_type: EntityType = entity.parse()?;
    let action: Action = action.parse().map_err(|e: String| anyhow!(e))?;
    let payload = parse_json_arg(payload)?;
    if payload.get("id").is_none() {
        return Err(anyhow!("Payload needs an \"id\" field"));
    }

    let item = engine.enqueue(entity_type, action, payload).await;
    let delivered = !engine.pending().await.iter().any(|p| p.id == item.id);

    if output.is_quiet() {
        println!("{}", item.id);
    } else if delivered {
        output.success(&format!("Delivered {} {} ({})", action, entity_type, item.id));
    } else {
        output.success(&format!("Queued {} {} ({})", action, entity_type, item.id));
    }
    Ok(())
}

/// List abandoned mutations
pub async fn abandoned(engine: &SyncEngine, output: &Output) -> Result<()> {
    let entries = engine.abandoned().await;
    output.print_abandoned(&entries);
    Ok(())
}

/// Re-queue an abandoned mutation with a fresh retry budget
pub async fn retry(engine: &SyncEngine, id: &str, output: &Output) -> Result<()> {
    let entries = engine.abandoned().await;
    let uuid = match_id(entries.iter().map(|e| e.item.id), id)?;

    let item = engine
        .retry_abandoned(uuid)
        .await
        .ok_or_else(|| anyhow!("Abandoned item not found: {}", id))?;
    output.success(&format!("Re-queued {} {} ({})", item.action, item.entity_type, item.id));

    let report = engine.drain().await;
    output.print_drain_report(&report);
    Ok(())
}

/// Drop an abandoned mutation for good
pub async fn discard(engine: &SyncEngine, id: &str, output: &Output) -> Result<()> {
    let entries = engine.abandoned().await;
    let uuid = match_id(entries.iter().map(|e| e.item.id), id)?;

    if output.should_prompt() && !confirm(&format!("Discard abandoned item {}?", uuid))? {
        println!("Cancelled.");
        return Ok(());
    }

    engine
        .discard_abandoned(uuid)
        .await
        .ok_or_else(|| anyhow!("Abandoned item not found: {}", id))?;
    output.success(&format!("Discarded {}", uuid));
    Ok(())
}

/// Drop every pending mutation
pub async fn clear(engine: &SyncEngine, yes: bool, output: &Output) -> Result<()> {
    let pending = engine.pending().await.len();
    if pending == 0 {
        output.message("Queue is already empty.");
        return Ok(());
    }

    if !yes
        && output.should_prompt()
        && !confirm(&format!(
            "Drop {} pending mutation(s)? They will never reach the server.",
            pending
        ))?
    {
        println!("Cancelled.");
        return Ok(());
    }

    let removed = engine.clear_queue().await;
    output.success(&format!("Removed {} pending mutation(s)", removed));
    Ok(())
}
