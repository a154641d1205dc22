//! Client facade
//!
//! Owns the session, the offline queue, the three trackers, and the sync
//! coordinator, and wires them together with background tasks:
//!
//! - the router forwards inbound frames to the right tracker and feeds the
//!   diff stream to the coordinator
//! - the sync runner fires a full sync pass on every transition into
//!   `Authenticated`
//! - the driver ticks the trackers (typing debounce, presence heartbeat,
//!   read-receipt batching) and kicks queue flushes while connected
//!
//! All public methods are cheap; anything that can block goes through the
//! queue or the session task.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::delivery::{DeliveryRecord, DeliveryState, DeliveryTracker, DiffOutcome};
use crate::error::{QueueError, StoreError, TransportError};
use crate::events::{ClientEvent, EventBus};
use crate::presence::{
    CustomStatus, PresenceRecord, PresenceStatus, PresenceTracker, StaticContacts, Visibility,
};
use crate::queue::{
    OfflineQueue, OperationKind, OperationSink, Priority, QueuedOperation, RestoreReport,
};
use crate::storage::KvStore;
use crate::sync::{DiffEvent, Diffable, SyncCoordinator, SyncStatus};
use crate::transport::{
    spawn_session, ConnectionState, Connector, CredentialProvider, SessionHandle,
};
use crate::typing::TypingTracker;
use crate::wire::{ClientFrame, DiffMessage, RoomId, ServerFrame, ServerMessageId, UserId};

/// Tracker/driver tick cadence
const DRIVER_TICK: Duration = Duration::from_millis(250);

/// Routes flushed queue operations onto the live session
struct DispatchSink {
    session: SessionHandle,
    delivery: Arc<Mutex<DeliveryTracker>>,
}

#[async_trait]
impl OperationSink for DispatchSink {
    async fn dispatch(&self, op: &QueuedOperation) -> Result<(), TransportError> {
        let frame: ClientFrame = serde_json::from_value(op.payload.clone())?;
        if let ClientFrame::MessageSend {
            client_message_id, ..
        } = &frame
        {
            self.delivery
                .lock()
                .unwrap()
                .mark_sending(*client_message_id, Utc::now());
        }
        self.session.send(frame).await
    }
}

/// Lets the coordinator fold diff entries into the delivery tracker
struct DeliveryDiff {
    delivery: Arc<Mutex<DeliveryTracker>>,
}

impl Diffable for DeliveryDiff {
    fn apply_diff(&self, msg: &DiffMessage) -> DiffOutcome {
        self.delivery.lock().unwrap().apply_diff(msg, Utc::now())
    }
}

/// The assembled sync core
pub struct Client {
    bus: EventBus,
    session: SessionHandle,
    queue: Arc<OfflineQueue>,
    presence: Arc<Mutex<PresenceTracker>>,
    typing: Arc<Mutex<TypingTracker>>,
    delivery: Arc<Mutex<DeliveryTracker>>,
    coordinator: Arc<SyncCoordinator>,
    sink: Arc<DispatchSink>,
    tasks: Vec<JoinHandle<()>>,
}

impl Client {
    /// Assemble the core and restore durable state
    ///
    /// The session starts disconnected; call [`connect`] to go online.
    ///
    /// [`connect`]: Client::connect
    pub fn new(
        config: Config,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialProvider>,
        store: Arc<dyn KvStore>,
    ) -> Result<Self, StoreError> {
        let bus = EventBus::new();
        let me: UserId = config.user_id.clone().unwrap_or_default();

        let queue = Arc::new(OfflineQueue::new(store.clone(), bus.clone(), &config));
        let restored = queue.restore()?;
        if restored != RestoreReport::default() {
            debug!(
                restored = restored.restored,
                quarantined = restored.quarantined,
                "queue state restored"
            );
        }

        let contacts = StaticContacts::new(config.contacts.iter().cloned());
        let presence = Arc::new(Mutex::new(PresenceTracker::new(
            me.clone(),
            Box::new(contacts),
            bus.clone(),
            &config,
        )));
        let typing = Arc::new(Mutex::new(TypingTracker::new(
            me.clone(),
            bus.clone(),
            &config,
        )));
        let delivery = Arc::new(Mutex::new(DeliveryTracker::new(
            me,
            bus.clone(),
            &config,
        )));

        let coordinator = Arc::new(SyncCoordinator::new(
            store,
            queue.clone(),
            vec![Arc::new(DeliveryDiff {
                delivery: delivery.clone(),
            })],
            bus.clone(),
            &config,
        )?);

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let session = spawn_session(&config, connector, credentials, bus.clone(), inbound_tx);
        let sink = Arc::new(DispatchSink {
            session: session.clone(),
            delivery: delivery.clone(),
        });

        let (diff_tx, diff_rx) = mpsc::unbounded_channel();
        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(route_frames(
            inbound_rx,
            diff_tx,
            presence.clone(),
            typing.clone(),
            delivery.clone(),
        )));
        tasks.push(tokio::spawn(run_sync_on_connect(
            session.clone(),
            coordinator.clone(),
            delivery.clone(),
            sink.clone(),
            diff_rx,
        )));
        tasks.push(tokio::spawn(drive_ticks(
            session.clone(),
            queue.clone(),
            presence.clone(),
            typing.clone(),
            delivery.clone(),
            sink.clone(),
        )));

        Ok(Self {
            bus,
            session,
            queue,
            presence,
            typing,
            delivery,
            coordinator,
            sink,
            tasks,
        })
    }

    /// Subscribe to the event stream
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.bus.subscribe()
    }

    /// Connect and authenticate; a sync pass follows automatically
    pub async fn connect(&self) -> Result<(), TransportError> {
        self.session.connect().await
    }

    pub fn disconnect(&self) {
        self.session.disconnect();
    }

    /// Stop reconnecting; sends keep queueing locally
    pub fn go_offline(&self) {
        self.session.go_offline();
    }

    /// Stop all background tasks
    pub fn shutdown(&self) {
        self.coordinator.cancel();
        self.session.shutdown();
        for task in &self.tasks {
            task.abort();
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.session.state()
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.coordinator.status()
    }

    /// Queue a message for delivery
    ///
    /// Always succeeds locally (barring storage failure): the message is
    /// durably queued first and flows out on the next flush. The returned id
    /// tracks delivery progress.
    pub fn send_message(
        &self,
        room_id: RoomId,
        content: String,
        recipients: Vec<UserId>,
    ) -> Result<Uuid, QueueError> {
        let now = Utc::now();
        let (client_message_id, frame) = {
            let mut delivery = self.delivery.lock().unwrap();
            delivery.begin_send(room_id, content, recipients, now)
        };
        let payload = serde_json::to_value(&frame)?;
        if let Err(e) = self
            .queue
            .enqueue(OperationKind::SendMessage, payload, Priority::High)
        {
            // Record and queue entry must agree; roll the record back.
            self.delivery.lock().unwrap().remove(client_message_id);
            return Err(e);
        }
        self.kick_flush();
        Ok(client_message_id)
    }

    /// Re-queue a failed message
    pub fn retry_message(&self, client_message_id: Uuid) -> Result<bool, QueueError> {
        let frame = {
            let mut delivery = self.delivery.lock().unwrap();
            delivery.retry(client_message_id, Utc::now())
        };
        let Some(frame) = frame else {
            return Ok(false);
        };
        let payload = serde_json::to_value(&frame)?;
        self.queue
            .enqueue(OperationKind::SendMessage, payload, Priority::High)?;
        self.kick_flush();
        Ok(true)
    }

    /// Note messages the user has viewed; receipts batch per room
    pub fn mark_read(&self, room_id: RoomId, server_message_ids: Vec<ServerMessageId>) {
        self.delivery
            .lock()
            .unwrap()
            .mark_read(room_id, server_message_ids, Utc::now());
    }

    /// Record a keystroke in a room's composer
    pub fn start_typing(&self, room_id: RoomId) {
        let now = Utc::now();
        self.typing.lock().unwrap().start_typing(room_id, now);
        let frame = self.presence.lock().unwrap().note_activity(now);
        if let Some(frame) = frame {
            self.publish_presence(frame);
        }
    }

    /// Composer cleared or message sent
    pub fn stop_typing(&self, room_id: &str) {
        let frame = self.typing.lock().unwrap().stop_typing(room_id);
        if let Some(frame) = frame {
            self.send_ephemeral(frame);
        }
    }

    pub fn typers(&self, room_id: &str) -> Vec<UserId> {
        self.typing.lock().unwrap().active_typers(room_id)
    }

    pub fn set_status(&self, status: PresenceStatus) {
        let frame = self.presence.lock().unwrap().set_status(status);
        if let Some(frame) = frame {
            self.publish_presence(frame);
        }
    }

    pub fn set_custom_status(&self, custom: Option<CustomStatus>) {
        let frame = self.presence.lock().unwrap().set_custom_status(custom);
        if let Some(frame) = frame {
            self.publish_presence(frame);
        }
    }

    pub fn set_visibility(&self, visibility: Visibility) {
        let frame = self.presence.lock().unwrap().set_visibility(visibility);
        if let Some(frame) = frame {
            self.publish_presence(frame);
        }
    }

    pub fn subscribe_presence(&self, user_id: UserId) {
        self.presence.lock().unwrap().subscribe(user_id);
    }

    pub fn presence_of(&self, user_id: &str) -> Option<PresenceRecord> {
        self.presence.lock().unwrap().get(user_id)
    }

    pub fn delivery_state(&self, client_message_id: Uuid) -> Option<DeliveryState> {
        self.delivery
            .lock()
            .unwrap()
            .get(client_message_id)
            .map(|r| r.state)
    }

    pub fn delivery_records(&self) -> Vec<DeliveryRecord> {
        self.delivery
            .lock()
            .unwrap()
            .records()
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queued_operations(&self) -> Vec<QueuedOperation> {
        self.queue.snapshot_ops()
    }

    pub fn failed_operations(&self) -> Vec<QueuedOperation> {
        self.queue.failed_ops()
    }

    pub fn quarantined_operations(&self) -> Vec<QueuedOperation> {
        self.queue.quarantined()
    }

    /// Durable presence publish; older pending updates are superseded
    fn publish_presence(&self, frame: ClientFrame) {
        self.queue
            .discard_pending_of_kind(OperationKind::PresenceUpdate);
        match serde_json::to_value(&frame) {
            Ok(payload) => {
                if let Err(e) =
                    self.queue
                        .enqueue(OperationKind::PresenceUpdate, payload, Priority::Low)
                {
                    warn!(error = %e, "failed to queue presence update");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode presence update"),
        }
        self.kick_flush();
    }

    /// Fire-and-forget send for ephemeral frames (typing)
    fn send_ephemeral(&self, frame: ClientFrame) {
        let session = self.session.clone();
        tokio::spawn(async move {
            let _ = session.send(frame).await;
        });
    }

    /// Start a flush pass if connected and work is pending
    fn kick_flush(&self) {
        if !self.session.is_authenticated() {
            return;
        }
        if self.queue.pending_count() == 0 || self.queue.flush_in_progress() {
            return;
        }
        let queue = self.queue.clone();
        let sink = self.sink.clone();
        tokio::spawn(async move {
            let _ = queue.flush(sink.as_ref()).await;
        });
    }
}

/// Route inbound frames to trackers and the diff stream
async fn route_frames(
    mut inbound_rx: mpsc::UnboundedReceiver<ServerFrame>,
    diff_tx: mpsc::UnboundedSender<DiffEvent>,
    presence: Arc<Mutex<PresenceTracker>>,
    typing: Arc<Mutex<TypingTracker>>,
    delivery: Arc<Mutex<DeliveryTracker>>,
) {
    while let Some(frame) = inbound_rx.recv().await {
        let now = Utc::now();
        match frame {
            ServerFrame::PresenceChanged {
                user_id,
                status,
                custom_status,
                last_seen_at,
                visibility,
            } => {
                presence.lock().unwrap().apply_remote(PresenceRecord {
                    user_id,
                    status,
                    custom_status,
                    last_seen_at,
                    visibility,
                    displayable: false,
                });
            }
            ServerFrame::TypingStart {
                room_id,
                user_id,
                expires_at,
            } => {
                typing
                    .lock()
                    .unwrap()
                    .apply_remote_start(room_id, user_id, expires_at, now);
            }
            ServerFrame::TypingStop { room_id, user_id } => {
                typing.lock().unwrap().apply_remote_stop(&room_id, &user_id);
            }
            ServerFrame::MessageSentAck {
                client_message_id,
                server_message_id,
                at,
            } => {
                delivery
                    .lock()
                    .unwrap()
                    .on_ack(client_message_id, server_message_id, at);
            }
            ServerFrame::MessageDelivered {
                server_message_id,
                recipient_id,
                at,
            } => {
                delivery
                    .lock()
                    .unwrap()
                    .on_delivered(&server_message_id, &recipient_id, at);
            }
            ServerFrame::MessageReadBy {
                server_message_id,
                recipient_id,
                at,
            } => {
                delivery
                    .lock()
                    .unwrap()
                    .on_read(&server_message_id, &recipient_id, at);
            }
            ServerFrame::MessageFailed {
                client_message_id,
                error,
                retryable,
            } => {
                delivery
                    .lock()
                    .unwrap()
                    .on_failed(client_message_id, error, retryable, now);
            }
            ServerFrame::SyncDiff { batch } => {
                let _ = diff_tx.send(DiffEvent::Batch(batch));
            }
            ServerFrame::SyncComplete { .. } => {
                let _ = diff_tx.send(DiffEvent::Complete);
            }
            // Handshake and heartbeat frames are consumed by the session task.
            ServerFrame::AuthChallenge { .. }
            | ServerFrame::AuthOk { .. }
            | ServerFrame::AuthFailed { .. }
            | ServerFrame::HeartbeatPong { .. } => {}
        }
    }
}

/// Fire a sync pass on each transition into Authenticated
async fn run_sync_on_connect(
    session: SessionHandle,
    coordinator: Arc<SyncCoordinator>,
    delivery: Arc<Mutex<DeliveryTracker>>,
    sink: Arc<DispatchSink>,
    mut diff_rx: mpsc::UnboundedReceiver<DiffEvent>,
) {
    let mut state_rx = session.watch_state();
    let mut was_authenticated = false;
    loop {
        let authenticated = matches!(
            *state_rx.borrow_and_update(),
            ConnectionState::Authenticated
        );
        if authenticated && !was_authenticated {
            let unresolved = delivery.lock().unwrap().unresolved();
            if let Err(e) = coordinator
                .run(&session, &mut diff_rx, sink.as_ref(), unresolved)
                .await
            {
                warn!(error = %e, "post-connect sync failed");
            }
        }
        was_authenticated = authenticated;
        if state_rx.changed().await.is_err() {
            return;
        }
    }
}

/// Periodic tick for tracker timers and opportunistic flushes
async fn drive_ticks(
    session: SessionHandle,
    queue: Arc<OfflineQueue>,
    presence: Arc<Mutex<PresenceTracker>>,
    typing: Arc<Mutex<TypingTracker>>,
    delivery: Arc<Mutex<DeliveryTracker>>,
    sink: Arc<DispatchSink>,
) {
    let mut tick = tokio::time::interval(DRIVER_TICK);
    loop {
        tick.tick().await;
        let now = Utc::now();

        // Typing frames are ephemeral: send on a live session or drop.
        let typing_frames = typing.lock().unwrap().poll(now);
        for frame in typing_frames {
            let _ = session.send(frame).await;
        }

        // Presence and read receipts are durable.
        let presence_frames = presence.lock().unwrap().poll(now);
        if !presence_frames.is_empty() {
            queue.discard_pending_of_kind(OperationKind::PresenceUpdate);
        }
        for frame in presence_frames {
            if let Ok(payload) = serde_json::to_value(&frame) {
                let _ = queue.enqueue(OperationKind::PresenceUpdate, payload, Priority::Low);
            }
        }
        let read_frames = delivery.lock().unwrap().poll_read_acks(now);
        for frame in read_frames {
            if let Ok(payload) = serde_json::to_value(&frame) {
                let _ = queue.enqueue(OperationKind::ReadAck, payload, Priority::Normal);
            }
        }

        if session.is_authenticated()
            && queue.pending_count() > 0
            && !queue.flush_in_progress()
        {
            let _ = queue.flush(sink.as_ref()).await;
        }
    }
}
