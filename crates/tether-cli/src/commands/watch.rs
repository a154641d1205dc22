//! Watch command handler

use anyhow::{Context, Result};

use tether_core::{format_typers, ClientEvent, Client};

use crate::output::Output;

/// Connect and stream events until interrupted
pub async fn run(client: &Client, output: &Output) -> Result<()> {
    let mut events = client.events();
    client.connect().await.context("Failed to connect")?;
    output.message("Connected. Watching events (ctrl-c to stop)...");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => print_event(&event, output),
                // Lagged: the core outpaced us; keep watching from here.
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    client.shutdown();
    output.message("Stopped.");
    Ok(())
}

fn print_event(event: &ClientEvent, output: &Output) {
    if output.is_json() {
        print_event_json(event);
        return;
    }
    match event {
        ClientEvent::Connected => println!("connected"),
        ClientEvent::Disconnected => println!("disconnected"),
        ClientEvent::Reconnecting { attempt, next_delay } => {
            println!("reconnecting (attempt {}, next in {:?})", attempt, next_delay)
        }
        ClientEvent::PresenceChanged { user_id, record } => {
            println!("presence  {} is {:?}", user_id, record.status)
        }
        ClientEvent::TypingChanged { room_id, typers } => {
            let line = format_typers(typers);
            if line.is_empty() {
                println!("typing    [{}] nobody", room_id);
            } else {
                println!("typing    [{}] {}", room_id, line);
            }
        }
        ClientEvent::DeliveryChanged {
            client_message_id,
            state,
        } => println!("delivery  {} -> {:?}", client_message_id, state),
        ClientEvent::QueueOverflow { evicted } => {
            println!("queue     evicted {} operation(s)", evicted.len())
        }
        ClientEvent::OperationFailed { operation_id, error } => {
            println!("queue     operation {} failed: {}", operation_id, error)
        }
        ClientEvent::IntegrityWarning { detail } => println!("warning   {}", detail),
        ClientEvent::SyncProgress { percent } => println!("sync      {}%", percent),
        ClientEvent::SyncCompleted { report } => println!(
            "sync      done: {} applied, {} conflicts, {} room(s) in {}ms",
            report.applied, report.conflicts, report.rooms, report.duration_ms
        ),
        ClientEvent::SyncFailed { error } => println!("sync      failed: {}", error),
    }
}

fn print_event_json(event: &ClientEvent) {
    let value = match event {
        ClientEvent::Connected => serde_json::json!({"event": "connected"}),
        ClientEvent::Disconnected => serde_json::json!({"event": "disconnected"}),
        ClientEvent::Reconnecting { attempt, next_delay } => serde_json::json!({
            "event": "reconnecting", "attempt": attempt, "next_delay_ms": next_delay.as_millis() as u64
        }),
        ClientEvent::PresenceChanged { user_id, record } => serde_json::json!({
            "event": "presence", "user_id": user_id, "record": record
        }),
        ClientEvent::TypingChanged { room_id, typers } => serde_json::json!({
            "event": "typing", "room_id": room_id, "typers": typers
        }),
        ClientEvent::DeliveryChanged {
            client_message_id,
            state,
        } => serde_json::json!({
            "event": "delivery", "client_message_id": client_message_id,
            "state": format!("{:?}", state).to_lowercase()
        }),
        ClientEvent::QueueOverflow { evicted } => serde_json::json!({
            "event": "queue_overflow", "evicted": evicted
        }),
        ClientEvent::OperationFailed { operation_id, error } => serde_json::json!({
            "event": "operation_failed", "operation_id": operation_id, "error": error
        }),
        ClientEvent::IntegrityWarning { detail } => serde_json::json!({
            "event": "integrity_warning", "detail": detail
        }),
        ClientEvent::SyncProgress { percent } => serde_json::json!({
            "event": "sync_progress", "percent": percent
        }),
        ClientEvent::SyncCompleted { report } => serde_json::json!({
            "event": "sync_completed", "report": report
        }),
        ClientEvent::SyncFailed { error } => serde_json::json!({
            "event": "sync_failed", "error": error
        }),
    };
    println!("{}", value);
}
