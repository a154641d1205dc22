//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use tether_core::queue::QueuedOperation;
use tether_core::DeliveryRecord;

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
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    pub fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Print a list of queued operations
    pub fn print_operations(&self, ops: &[QueuedOperation]) {
        match self.format {
            OutputFormat::Human => {
                if ops.is_empty() {
                    println!("Queue is empty.");
                    return;
                }
                for op in ops {
                    println!(
                        "{} | {:>4} | {:?} {:?} | retries {}/{} | {}",
                        &op.id.to_string()[..8],
                        op.seq,
                        op.kind,
                        op.status,
                        op.retry_count,
                        op.max_retries,
                        op.created_at.format("%Y-%m-%d %H:%M:%S"),
                    );
                    if let Some(ref err) = op.last_error {
                        println!("           last error: {}", err);
                    }
                }
                println!("\n{} operation(s)", ops.len());
            }
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(ops).unwrap());
            }
            OutputFormat::Quiet => {
                for op in ops {
                    println!("{}", op.id);
                }
            }
        }
    }

    /// Print one delivery record
    pub fn print_delivery(&self, record: &DeliveryRecord) {
        match self.format {
            OutputFormat::Human => {
                println!("Message:  {}", record.client_message_id);
                if let Some(ref srv) = record.server_message_id {
                    println!("Server:   {}", srv);
                }
                println!("Room:     {}", record.room_id);
                println!("State:    {:?}", record.state);
                if let Some(ref err) = record.error {
                    println!(
                        "Error:    {} ({})",
                        err.message,
                        if err.retryable { "retryable" } else { "permanent" }
                    );
                }
            }
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({
                        "client_message_id": record.client_message_id,
                        "server_message_id": record.server_message_id,
                        "room_id": record.room_id,
                        "state": format!("{:?}", record.state).to_lowercase(),
                        "error": record.error.as_ref().map(|e| e.message.clone()),
                    })
                );
            }
            OutputFormat::Quiet => {
                println!("{}", record.client_message_id);
            }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }
}
