//! Queue inspection commands
//!
//! These operate on the durable queue directly, without connecting, so they
//! work offline and while no other tether process is running.

use std::sync::Arc;

use anyhow::{Context, Result};
use uuid::Uuid;

use tether_core::{Config, EventBus, FileStore, OfflineQueue};

use crate::output::Output;

fn open_queue(config: &Config) -> Result<OfflineQueue> {
    let store = Arc::new(FileStore::new(&config.data_dir));
    let queue = OfflineQueue::new(store, EventBus::new(), config);
    queue
        .restore()
        .context("Failed to restore the offline queue")?;
    Ok(queue)
}

/// List all queued operations
pub fn list(config: &Config, output: &Output) -> Result<()> {
    let queue = open_queue(config)?;
    output.print_operations(&queue.snapshot_ops());
    Ok(())
}

/// List operations that exhausted their retries
pub fn failed(config: &Config, output: &Output) -> Result<()> {
    let queue = open_queue(config)?;
    let ops = queue.failed_ops();
    if ops.is_empty() && !output.is_quiet() && !output.is_json() {
        println!("No failed operations.");
        return Ok(());
    }
    output.print_operations(&ops);
    Ok(())
}

/// List quarantined records
pub fn quarantined(config: &Config, output: &Output) -> Result<()> {
    let queue = open_queue(config)?;
    let ops = queue.quarantined();
    if ops.is_empty() && !output.is_quiet() && !output.is_json() {
        println!("No quarantined records.");
        return Ok(());
    }
    output.print_operations(&ops);
    Ok(())
}

/// Reset a failed operation so the next flush retries it
pub fn retry(config: &Config, id: &str, output: &Output) -> Result<()> {
    let op_id: Uuid = id.parse().context("Invalid operation id")?;
    let queue = open_queue(config)?;
    queue
        .reset_failed(op_id)
        .with_context(|| format!("Could not reset operation {}", op_id))?;
    output.success(&format!("Operation {} will retry on the next flush", op_id));
    Ok(())
}
