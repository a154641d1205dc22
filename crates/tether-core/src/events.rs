//! Typed client event bus
//!
//! Every observable change in the core is published as a [`ClientEvent`]
//! variant on a broadcast channel. Consumers (the UI layer, the CLI `watch`
//! command, tests) subscribe and match exhaustively instead of registering
//! stringly-typed callbacks.

use std::time::Duration;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::delivery::DeliveryState;
use crate::presence::PresenceRecord;
use crate::sync::SyncReport;
use crate::wire::{RoomId, UserId};

/// Default bus capacity; slow subscribers that fall further behind than this
/// observe a `Lagged` error rather than blocking the core.
const BUS_CAPACITY: usize = 256;

/// Events emitted by the sync core
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Session authenticated; a sync pass is about to start
    Connected,
    /// Session lost or closed
    Disconnected,
    /// A reconnect attempt is scheduled
    Reconnecting { attempt: u32, next_delay: Duration },

    /// A user's presence record changed
    PresenceChanged {
        user_id: UserId,
        record: PresenceRecord,
    },

    /// The set of active typers in a room changed
    TypingChanged {
        room_id: RoomId,
        typers: Vec<UserId>,
    },

    /// A tracked message moved to a new aggregate delivery state
    DeliveryChanged {
        client_message_id: Uuid,
        state: DeliveryState,
    },

    /// The offline queue evicted operations to stay within its bound
    QueueOverflow { evicted: Vec<Uuid> },

    /// A queued operation exhausted its retries and needs manual resolution
    OperationFailed { operation_id: Uuid, error: String },

    /// A persisted or inbound record failed validation and was quarantined
    IntegrityWarning { detail: String },

    /// Sync pass progress, 0..=100
    SyncProgress { percent: u8 },
    /// Sync pass finished successfully
    SyncCompleted { report: SyncReport },
    /// Sync pass aborted
    SyncFailed { error: String },
}

/// Broadcast bus for [`ClientEvent`]
///
/// Cheap to clone; every component holds one and publishes through it.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ClientEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }

    /// Publish an event, ignoring the no-subscriber case
    pub fn publish(&self, event: ClientEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
