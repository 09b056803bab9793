//! Conflict command handlers

use anyhow::{anyhow, Context, Result};

use mtrace_core::{Resolution, SyncEngine};

use super::parse_json_arg;
use crate::output::{Output, OutputFormat};

/// List conflicts, open ones only unless `all`
pub fn list(engine: &SyncEngine, all: bool, output: &Output) -> Result<()> {
    let conflicts = engine.conflicts(!all);
    output.print_conflicts(&conflicts);
    Ok(())
}

/// Settle a conflict with the given policy
pub async fn resolve(
    engine: &SyncEngine,
    id: &str,
    policy: &str,
    merged: Option<&str>,
    output: &Output,
) -> Result<()> {
    let policy: Resolution = policy.parse().map_err(|e: String| anyhow!(e))?;
    let merged = merged.map(parse_json_arg).transpose()?;

    let record = engine
        .resolve_conflict(id, policy, merged)
        .await
        .with_context(|| format!("Failed to resolve conflict {}", id))?;

    match output.format {
        OutputFormat::Json => output.print_json(&record),
        _ => output.success(&format!(
            "Resolved {} on {} {} ({})",
            record.conflict_id,
            record.entity_type,
            record.entity_id().as_deref().unwrap_or("-"),
            policy
        )),
    }
    Ok(())
}
