//! Status command handler

use std::sync::Arc;

use anyhow::{Context, Result};

use tether_core::{Config, EventBus, FileStore, KvStore, OfflineQueue, SyncCheckpoint};

use crate::output::{Output, OutputFormat};

/// Show local state without connecting
pub fn show(config: &Config, output: &Output) -> Result<()> {
    let store: Arc<dyn KvStore> = Arc::new(FileStore::new(&config.data_dir));
    let queue = OfflineQueue::new(store.clone(), EventBus::new(), config);
    let restored = queue
        .restore()
        .context("Failed to restore the offline queue")?;
    let checkpoint = SyncCheckpoint::load(&store).context("Failed to load sync checkpoint")?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "relay_url": config.relay_url,
                    "user_id": config.user_id,
                    "data_dir": config.data_dir,
                    "queue": {
                        "pending": queue.pending_count(),
                        "failed": queue.failed_ops().len(),
                        "quarantined": restored.quarantined,
                        "total": queue.len(),
                    },
                    "checkpoint": {
                        "global": checkpoint.global,
                        "rooms": checkpoint.per_room.len(),
                    }
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", queue.pending_count());
        }
        OutputFormat::Human => {
            println!("Tether Status");
            println!("=============");
            println!();
            println!("Relay:");
            println!(
                "  URL:  {}",
                config.relay_url.as_deref().unwrap_or("(not set)")
            );
            println!(
                "  User: {}",
                config.user_id.as_deref().unwrap_or("(not set)")
            );
            println!();
            println!("Offline queue:");
            println!("  Pending:     {}", queue.pending_count());
            println!("  Failed:      {}", queue.failed_ops().len());
            println!("  Quarantined: {}", restored.quarantined);
            println!();
            println!("Sync checkpoint:");
            match checkpoint.global {
                Some(at) => println!("  Last sync: {}", at.format("%Y-%m-%d %H:%M:%S")),
                None => println!("  Last sync: never"),
            }
            println!("  Rooms:     {}", checkpoint.per_room.len());
            println!();
            println!("Storage:");
            println!("  Location: {}", config.data_dir.display());
        }
    }

    Ok(())
}
