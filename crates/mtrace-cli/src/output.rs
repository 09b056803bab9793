//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde::Serialize;
use serde_json::Value;

use mtrace_core::{AbandonedItem, ConflictRecord, DrainReport, QueueItem, SyncEvent, SyncReport};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Check if output is in quiet mode
    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    pub fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Print any serializable value as pretty JSON
    pub fn print_json<T: Serialize + ?Sized>(&self, value: &T) {
        match serde_json::to_string_pretty(value) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("Failed to encode output: {}", e),
        }
    }

    /// Print a stored entity
    pub fn print_entity(&self, entity: &Value) {
        match self.format {
            OutputFormat::Human | OutputFormat::Json => self.print_json(entity),
            OutputFormat::Quiet => {
                if let Some(id) = entity.get("id").and_then(Value::as_str) {
                    println!("{}", id);
                }
            }
        }
    }

    /// Print pending queue items
    pub fn print_queue(&self, items: &[QueueItem]) {
        match self.format {
            OutputFormat::Human => {
                if items.is_empty() {
                    println!("Queue is empty.");
                    return;
                }
                for item in items {
                    let held = match &item.held_by {
                        Some(conflict_id) => format!(" [held by {}]", conflict_id),
                        None => String::new(),
                    };
                    println!(
                        "{} | {:<8} | {:<6} | {:<24} | retries {}{}",
                        short_id(&item.id.to_string()),
                        item.entity_type.as_str(),
                        item.action.as_str(),
                        truncate(item.entity_id().as_deref().unwrap_or("-"), 24),
                        item.retry_count,
                        held
                    );
                }
                println!("\n{} pending", items.len());
            }
            OutputFormat::Json => self.print_json(items),
            OutputFormat::Quiet => {
                for item in items {
                    println!("{}", item.id);
                }
            }
        }
    }

    /// Print abandoned items
    pub fn print_abandoned(&self, entries: &[AbandonedItem]) {
        match self.format {
            OutputFormat::Human => {
                if entries.is_empty() {
                    println!("No abandoned mutations.");
                    return;
                }
                for entry in entries {
                    println!(
                        "{} | {:<8} | {:<6} | {} | {}",
                        short_id(&entry.item.id.to_string()),
                        entry.item.entity_type.as_str(),
                        entry.item.action.as_str(),
                        entry.abandoned_at.format("%Y-%m-%d %H:%M"),
                        truncate(&entry.reason, 50)
                    );
                }
                println!("\n{} abandoned", entries.len());
            }
            OutputFormat::Json => self.print_json(entries),
            OutputFormat::Quiet => {
                for entry in entries {
                    println!("{}", entry.item.id);
                }
            }
        }
    }

    /// Print a list of conflicts
    pub fn print_conflicts(&self, conflicts: &[ConflictRecord]) {
        match self.format {
            OutputFormat::Human => {
                if conflicts.is_empty() {
                    println!("No conflicts.");
                    return;
                }
                for record in conflicts {
                    let state = match (&record.resolution, record.resolved_at) {
                        (Some(resolution), Some(at)) => {
                            format!("{} at {}", resolution, at.format("%Y-%m-%d %H:%M"))
                        }
                        _ => "open".to_string(),
                    };
                    println!(
                        "{} | {:<8} | {:<24} | {} | {}",
                        record.conflict_id,
                        record.entity_type.as_str(),
                        truncate(record.entity_id().as_deref().unwrap_or("-"), 24),
                        record.detected_at.format("%Y-%m-%d %H:%M"),
                        state
                    );
                }
                println!("\n{} conflict(s)", conflicts.len());
            }
            OutputFormat::Json => self.print_json(conflicts),
            OutputFormat::Quiet => {
                for record in conflicts {
                    println!("{}", record.conflict_id);
                }
            }
        }
    }

    /// Print the outcome of a full reconciliation
    pub fn print_sync_report(&self, report: &SyncReport) {
        match self.format {
            OutputFormat::Human => {
                println!("Sync complete ({})", report.mode.path());
                for (entity_type, count) in &report.counts {
                    println!("  {:<12} {}", entity_type.collection(), count);
                }
                if report.overlaid_pending > 0 {
                    println!("  Pending mutations kept: {}", report.overlaid_pending);
                }
                for error in &report.errors {
                    println!("  ⚠ {}", error);
                }
            }
            OutputFormat::Json => self.print_json(report),
            OutputFormat::Quiet => println!("{}", report.total()),
        }
    }

    /// Print the outcome of a drain cycle
    pub fn print_drain_report(&self, report: &DrainReport) {
        match self.format {
            OutputFormat::Human => {
                if report.skipped {
                    println!("Drain skipped (offline, disabled, or already running).");
                    return;
                }
                if report.auth_failed {
                    println!("Drain stopped: the server refused our credentials.");
                    return;
                }
                if report.attempted() == 0 {
                    println!("Nothing to deliver.");
                    return;
                }
                println!(
                    "Delivered {}, conflicted {}, retrying {}, abandoned {}, rejected {}",
                    report.succeeded,
                    report.conflicted,
                    report.retried,
                    report.abandoned,
                    report.rejected
                );
            }
            OutputFormat::Json => self.print_json(report),
            OutputFormat::Quiet => println!("{}", report.succeeded),
        }
    }

    /// Print one engine event as it arrives
    pub fn print_event(&self, event: &SyncEvent) {
        match self.format {
            OutputFormat::Human => println!("{}", describe_event(event)),
            OutputFormat::Json => match serde_json::to_string(event) {
                Ok(line) => println!("{}", line),
                Err(e) => eprintln!("Failed to encode event: {}", e),
            },
            OutputFormat::Quiet => println!("{}", event.kind()),
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Check if we should prompt for confirmation
    pub fn should_prompt(&self) -> bool {
        self.format == OutputFormat::Human
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

/// One-line human description of an event
fn describe_event(event: &SyncEvent) -> String {
    match event {
        SyncEvent::QueueUpdated { pending, abandoned } => {
            format!("queue: {} pending, {} abandoned", pending, abandoned)
        }
        SyncEvent::SyncUpdate(update) => format!(
            "remote {} {} {}",
            update.action,
            update.entity_type,
            update.payload.get("id").and_then(Value::as_str).unwrap_or("-")
        ),
        SyncEvent::SyncConflict(record) => format!(
            "conflict {} on {} {}",
            record.conflict_id,
            record.entity_type,
            record.entity_id().as_deref().unwrap_or("-")
        ),
        SyncEvent::SyncCompleted { synced_count, errors } => {
            format!("server sync completed: {} synced, {} error(s)", synced_count, errors.len())
        }
        SyncEvent::LocalDataUpdated => "local data replaced by reconciliation".to_string(),
        SyncEvent::DrainFinished(report) => format!(
            "drain: {} delivered, {} retrying, {} abandoned",
            report.succeeded, report.retried, report.abandoned
        ),
        SyncEvent::ConnectionChanged(status) => format!("connection {}", status),
        SyncEvent::AuthenticationFailed(reason) => format!("authentication failed: {}", reason),
        SyncEvent::ItemAbandoned(entry) => format!(
            "abandoned {} {} after {} attempts",
            entry.item.action, entry.item.entity_type, entry.item.retry_count
        ),
        SyncEvent::ItemRejected { item, reason } => {
            format!("rejected {} {}: {}", item.action, item.entity_type, reason)
        }
        SyncEvent::ConflictResolved {
            conflict_id,
            resolution,
        } => format!("conflict {} resolved ({})", conflict_id, resolution),
        SyncEvent::StatusUpdate(status) => format!("status: {}", status),
    }
}

/// Format a byte count for display
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Truncate a string to max length, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
