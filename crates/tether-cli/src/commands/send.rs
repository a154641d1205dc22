//! Send command handler

use std::time::Duration;

use anyhow::Result;
use tokio::time::timeout;

use tether_core::{Client, ClientEvent, DeliveryState};

use crate::output::Output;

/// Send a message, waiting briefly for the relay ack
///
/// If the relay is unreachable the message still queues durably and goes
/// out on the next connect; that is reported as success.
pub async fn run(
    client: &Client,
    room: String,
    content: String,
    to: Vec<String>,
    wait_secs: u64,
    output: &Output,
) -> Result<()> {
    let mut events = client.events();
    let online = match client.connect().await {
        Ok(()) => true,
        Err(e) => {
            output.message(&format!("Relay unreachable ({}); queueing offline", e));
            false
        }
    };

    let id = client.send_message(room, content, to)?;

    if online {
        let acked = timeout(Duration::from_secs(wait_secs), async {
            loop {
                match events.recv().await {
                    Ok(ClientEvent::DeliveryChanged {
                        client_message_id,
                        state,
                    }) if client_message_id == id => match state {
                        DeliveryState::Sent
                        | DeliveryState::Delivered
                        | DeliveryState::Read => return true,
                        DeliveryState::Failed => return false,
                        _ => {}
                    },
                    Ok(_) => {}
                    Err(_) => return false,
                }
            }
        })
        .await
        .unwrap_or(false);

        if acked {
            output.success(&format!("Sent {}", id));
        } else {
            output.message(&format!(
                "Message {} queued; no relay ack yet (check `tether queue`)",
                id
            ));
        }
    } else {
        output.success(&format!("Queued {} for the next connection", id));
    }

    if let Some(record) = client.delivery_records().iter().find(|r| r.client_message_id == id) {
        if output.is_json() {
            output.print_delivery(record);
        }
    }

    client.shutdown();
    Ok(())
}
