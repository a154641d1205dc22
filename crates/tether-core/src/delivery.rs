//! Message delivery tracking
//!
//! Tracks every locally-sent message from composition to the far end's
//! read receipt. States only ever move forward; a late `message:delivered`
//! arriving after a read receipt never regresses the record. Failure is
//! tracked out of band so a failed message keeps its last good progress.
//!
//! For group messages the aggregate state is the floor across recipients:
//! the record reads `Delivered` only once every recipient has it, `Read`
//! only once every recipient has read it.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::events::{ClientEvent, EventBus};
use crate::wire::{ClientFrame, DiffMessage, RoomId, ServerMessageId, UserId};

/// Aggregate delivery state of a sent message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    /// Queued locally, not yet on the wire
    Pending,
    /// Handed to the transport
    Sending,
    /// Relay acknowledged receipt
    Sent,
    /// Every recipient's device has it
    Delivered,
    /// Every recipient has read it
    Read,
    /// Relay rejected it; progress before the failure is preserved
    Failed,
}

impl DeliveryState {
    /// Position on the forward-only progression; `Failed` sits outside it
    pub fn rank(self) -> Option<u8> {
        match self {
            DeliveryState::Pending => Some(0),
            DeliveryState::Sending => Some(1),
            DeliveryState::Sent => Some(2),
            DeliveryState::Delivered => Some(3),
            DeliveryState::Read => Some(4),
            DeliveryState::Failed => None,
        }
    }
}

/// Why a send failed, and whether retrying can help
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryFailure {
    pub message: String,
    pub retryable: bool,
}

/// Per-recipient progress for a group message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecipientProgress {
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

impl RecipientProgress {
    fn stage(&self) -> u8 {
        if self.read_at.is_some() {
            2
        } else if self.delivered_at.is_some() {
            1
        } else {
            0
        }
    }
}

/// One tracked outbound message
#[derive(Debug, Clone)]
pub struct DeliveryRecord {
    pub client_message_id: Uuid,
    pub server_message_id: Option<ServerMessageId>,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub content: String,
    pub recipients: HashMap<UserId, RecipientProgress>,
    pub state: DeliveryState,
    pub error: Option<DeliveryFailure>,
    /// Bumped on every accepted transition; lets observers detect staleness
    pub seq_token: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of folding one diff entry into local state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOutcome {
    /// Local record advanced
    Applied,
    /// Nothing to do (unknown message, or no new information)
    Ignored,
    /// The server already has a message we still held an unsent copy of
    Conflict,
}

struct ReadBatch {
    ids: HashSet<ServerMessageId>,
    since: DateTime<Utc>,
}

/// Tracks outbound message delivery and batches read receipts
pub struct DeliveryTracker {
    me: UserId,
    bus: EventBus,
    records: HashMap<Uuid, DeliveryRecord>,
    by_server: HashMap<ServerMessageId, Uuid>,
    pending_reads: HashMap<RoomId, ReadBatch>,
    batch_window: ChronoDuration,
}

impl DeliveryTracker {
    pub fn new(me: UserId, bus: EventBus, config: &Config) -> Self {
        Self {
            me,
            bus,
            records: HashMap::new(),
            by_server: HashMap::new(),
            pending_reads: HashMap::new(),
            batch_window: ChronoDuration::milliseconds(config.delivery_batch_window_ms as i64),
        }
    }

    /// Register a new outbound message and build its wire frame
    ///
    /// The caller must queue the frame durably before exposing the record;
    /// if queueing fails, roll back with [`remove`].
    ///
    /// [`remove`]: DeliveryTracker::remove
    pub fn begin_send(
        &mut self,
        room_id: RoomId,
        content: String,
        recipients: Vec<UserId>,
        now: DateTime<Utc>,
    ) -> (Uuid, ClientFrame) {
        let client_message_id = Uuid::new_v4();
        let record = DeliveryRecord {
            client_message_id,
            server_message_id: None,
            room_id: room_id.clone(),
            sender_id: self.me.clone(),
            content: content.clone(),
            recipients: recipients
                .iter()
                .map(|r| (r.clone(), RecipientProgress::default()))
                .collect(),
            state: DeliveryState::Pending,
            error: None,
            seq_token: 0,
            created_at: now,
            updated_at: now,
        };
        self.records.insert(client_message_id, record);
        let frame = ClientFrame::MessageSend {
            client_message_id,
            room_id,
            sender_id: self.me.clone(),
            content,
            recipients,
        };
        (client_message_id, frame)
    }

    /// Remove a record (rollback of a failed enqueue)
    pub fn remove(&mut self, client_message_id: Uuid) {
        if let Some(record) = self.records.remove(&client_message_id) {
            if let Some(server_id) = record.server_message_id {
                self.by_server.remove(&server_id);
            }
        }
    }

    pub fn get(&self, client_message_id: Uuid) -> Option<&DeliveryRecord> {
        self.records.get(&client_message_id)
    }

    /// All tracked records, newest first
    pub fn records(&self) -> Vec<&DeliveryRecord> {
        let mut records: Vec<&DeliveryRecord> = self.records.values().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    /// The message left the queue and is on the wire
    pub fn mark_sending(&mut self, client_message_id: Uuid, now: DateTime<Utc>) {
        self.advance(client_message_id, DeliveryState::Sending, now);
    }

    /// Relay acknowledged the send and assigned its id
    pub fn on_ack(
        &mut self,
        client_message_id: Uuid,
        server_message_id: ServerMessageId,
        now: DateTime<Utc>,
    ) {
        if let Some(record) = self.records.get_mut(&client_message_id) {
            record.server_message_id = Some(server_message_id.clone());
            self.by_server.insert(server_message_id, client_message_id);
            self.advance(client_message_id, DeliveryState::Sent, now);
        } else {
            warn!(client_message_id = %client_message_id, "ack for unknown message");
        }
    }

    /// A recipient's device received the message
    pub fn on_delivered(&mut self, server_message_id: &str, recipient_id: &str, at: DateTime<Utc>) {
        let Some(&client_id) = self.by_server.get(server_message_id) else {
            return;
        };
        if let Some(record) = self.records.get_mut(&client_id) {
            let progress = record.recipients.entry(recipient_id.to_string()).or_default();
            if progress.delivered_at.is_none() {
                progress.delivered_at = Some(at);
            }
        }
        self.recompute_aggregate(client_id, at);
    }

    /// A recipient read the message
    pub fn on_read(&mut self, server_message_id: &str, recipient_id: &str, at: DateTime<Utc>) {
        let Some(&client_id) = self.by_server.get(server_message_id) else {
            return;
        };
        if let Some(record) = self.records.get_mut(&client_id) {
            let progress = record.recipients.entry(recipient_id.to_string()).or_default();
            if progress.read_at.is_none() {
                progress.read_at = Some(at);
            }
            // Read implies delivered even if the delivered event never came.
            if progress.delivered_at.is_none() {
                progress.delivered_at = Some(at);
            }
        }
        self.recompute_aggregate(client_id, at);
    }

    /// Relay rejected the message
    pub fn on_failed(
        &mut self,
        client_message_id: Uuid,
        error: String,
        retryable: bool,
        now: DateTime<Utc>,
    ) {
        let Some(record) = self.records.get_mut(&client_message_id) else {
            return;
        };
        if record.state == DeliveryState::Read {
            // Nothing left to fail; a late rejection for a read message is noise.
            return;
        }
        record.error = Some(DeliveryFailure {
            message: error,
            retryable,
        });
        record.state = DeliveryState::Failed;
        record.seq_token += 1;
        record.updated_at = now;
        self.bus.publish(ClientEvent::DeliveryChanged {
            client_message_id,
            state: DeliveryState::Failed,
        });
    }

    /// Rebuild the wire frame for a failed message so it can be re-queued
    ///
    /// Only failed records can be retried; the record returns to `Pending`.
    pub fn retry(&mut self, client_message_id: Uuid, now: DateTime<Utc>) -> Option<ClientFrame> {
        let record = self.records.get_mut(&client_message_id)?;
        if record.state != DeliveryState::Failed {
            return None;
        }
        record.state = DeliveryState::Pending;
        record.error = None;
        record.seq_token += 1;
        record.updated_at = now;
        let frame = ClientFrame::MessageSend {
            client_message_id,
            room_id: record.room_id.clone(),
            sender_id: record.sender_id.clone(),
            content: record.content.clone(),
            recipients: record.recipients.keys().cloned().collect(),
        };
        self.bus.publish(ClientEvent::DeliveryChanged {
            client_message_id,
            state: DeliveryState::Pending,
        });
        Some(frame)
    }

    /// Note messages the local user has viewed; receipts go out in one
    /// batched frame per room once the window closes
    pub fn mark_read(
        &mut self,
        room_id: RoomId,
        server_message_ids: Vec<ServerMessageId>,
        now: DateTime<Utc>,
    ) {
        let batch = self.pending_reads.entry(room_id).or_insert_with(|| ReadBatch {
            ids: HashSet::new(),
            since: now,
        });
        batch.ids.extend(server_message_ids);
    }

    /// Drain read batches whose window has elapsed
    pub fn poll_read_acks(&mut self, now: DateTime<Utc>) -> Vec<ClientFrame> {
        let due: Vec<RoomId> = self
            .pending_reads
            .iter()
            .filter(|(_, batch)| now - batch.since >= self.batch_window)
            .map(|(room, _)| room.clone())
            .collect();

        let mut frames = Vec::new();
        for room_id in due {
            if let Some(batch) = self.pending_reads.remove(&room_id) {
                let mut ids: Vec<ServerMessageId> = batch.ids.into_iter().collect();
                ids.sort();
                frames.push(ClientFrame::ReadAck {
                    room_id,
                    reader_id: self.me.clone(),
                    server_message_ids: ids,
                    at: now,
                });
            }
        }
        frames
    }

    /// Server ids still short of `Read`, for sync requests
    pub fn unresolved(&self) -> Vec<ServerMessageId> {
        let mut ids: Vec<ServerMessageId> = self
            .records
            .values()
            .filter(|r| r.state != DeliveryState::Read && r.state != DeliveryState::Failed)
            .filter_map(|r| r.server_message_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Fold one sync diff entry into local state
    ///
    /// The server copy is authoritative. A diff entry matching a message we
    /// still hold in `Pending` or `Sending` means the send reached the relay
    /// before the connection died; the caller must discard the queued copy.
    pub fn apply_diff(&mut self, msg: &DiffMessage, now: DateTime<Utc>) -> DiffOutcome {
        let Some(client_id) = msg.client_message_id else {
            // Someone else's message; history storage is not this layer's job.
            return DiffOutcome::Ignored;
        };
        let Some(record) = self.records.get_mut(&client_id) else {
            return DiffOutcome::Ignored;
        };

        let had_unsent_copy = matches!(
            record.state,
            DeliveryState::Pending | DeliveryState::Sending | DeliveryState::Failed
        );

        record.server_message_id = Some(msg.server_message_id.clone());
        self.by_server
            .insert(msg.server_message_id.clone(), client_id);
        if record.state.rank() < DeliveryState::Sent.rank() {
            record.error = None;
        }
        self.advance(client_id, DeliveryState::Sent, now);

        for stamp in &msg.delivered_to {
            self.on_delivered(&msg.server_message_id, &stamp.user_id, stamp.at);
        }
        for stamp in &msg.read_by {
            self.on_read(&msg.server_message_id, &stamp.user_id, stamp.at);
        }

        if had_unsent_copy {
            debug!(client_message_id = %client_id, "diff supersedes local unsent copy");
            DiffOutcome::Conflict
        } else {
            DiffOutcome::Applied
        }
    }

    fn recompute_aggregate(&mut self, client_id: Uuid, now: DateTime<Utc>) {
        let Some(record) = self.records.get(&client_id) else {
            return;
        };
        if record.state.rank() < DeliveryState::Sent.rank() {
            // Receipts can't outrun the relay ack.
            return;
        }
        let floor = record
            .recipients
            .values()
            .map(RecipientProgress::stage)
            .min()
            .unwrap_or(0);
        let target = match floor {
            2 => DeliveryState::Read,
            1 => DeliveryState::Delivered,
            _ => DeliveryState::Sent,
        };
        self.advance(client_id, target, now);
    }

    /// Forward-only transition; lower or equal targets are ignored
    fn advance(&mut self, client_id: Uuid, target: DeliveryState, now: DateTime<Utc>) {
        let Some(record) = self.records.get_mut(&client_id) else {
            return;
        };
        let Some(target_rank) = target.rank() else {
            return;
        };
        match record.state.rank() {
            Some(current) if current >= target_rank => return,
            _ => {}
        }
        record.state = target;
        record.seq_token += 1;
        record.updated_at = now;
        self.bus.publish(ClientEvent::DeliveryChanged {
            client_message_id: client_id,
            state: target,
        });
    }
}
