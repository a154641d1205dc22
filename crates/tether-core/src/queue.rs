//! Durable offline operation queue
//!
//! An ordered, bounded store of client-originated operations that must reach
//! the relay at least once, even across disconnects and process restarts.
//! Every record carries a content checksum and a monotonic sequence number;
//! `restore()` validates checksums and quarantines anything that fails
//! instead of silently discarding it.
//!
//! The queue is a leaf component: it never touches the transport itself.
//! `flush()` is handed an [`OperationSink`] and enforces an
//! at-most-one-flush-in-progress invariant internally, so callers never
//! coordinate locking themselves.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backoff::BackoffPolicy;
use crate::config::Config;
use crate::error::{QueueError, StoreError, TransportError};
use crate::events::{ClientEvent, EventBus};
use crate::storage::KvStore;

/// Store key for the queue snapshot
const STORE_KEY: &str = "offline_queue";

/// Snapshot format version this build writes and reads
const STORE_VERSION: u32 = 1;

/// Operation id
pub type OperationId = Uuid;

/// What a queued operation does when it reaches the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    SendMessage,
    ReadAck,
    PresenceUpdate,
}

/// Priority tier; eviction under pressure removes the lowest tier first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

/// Lifecycle status of a queued operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Inflight,
    Done,
    Failed,
}

/// One durable queue record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    pub id: OperationId,
    pub kind: OperationKind,
    /// The wire frame to replay, as JSON
    pub payload: Value,
    pub priority: Priority,
    pub status: OperationStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    /// SHA-256 over the immutable fields, hex encoded
    pub checksum: String,
    /// Monotonic position in the queue
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl QueuedOperation {
    /// Recompute the checksum over the immutable fields
    pub fn expected_checksum(&self) -> String {
        compute_checksum(&self.id, self.kind, &self.payload, self.seq)
    }
}

fn compute_checksum(id: &Uuid, kind: OperationKind, payload: &Value, seq: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hasher.update(serde_json::to_string(&kind).unwrap_or_default());
    hasher.update(payload.to_string());
    hasher.update(seq.to_le_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Durable snapshot written to the key-value store
#[derive(Debug, Serialize, Deserialize)]
struct QueueSnapshot {
    version: u32,
    next_seq: u64,
    ops: Vec<QueuedOperation>,
    #[serde(default)]
    quarantined: Vec<QueuedOperation>,
}

/// Result of one flush pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlushReport {
    /// Operations that were pending when the pass started
    pub attempted: usize,
    /// Operations acknowledged and removed
    pub sent: usize,
    /// Operations that exhausted their retries this pass
    pub failed: usize,
    /// Operations still pending after the pass
    pub remaining: usize,
    /// The pass stopped early because the connection went away
    pub aborted: bool,
}

/// Result of restoring the queue from its durable snapshot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestoreReport {
    pub restored: usize,
    pub quarantined: usize,
}

/// Where flushed operations go
///
/// Implemented over the live session by the client facade; tests supply
/// scripted sinks.
#[async_trait]
pub trait OperationSink: Send + Sync {
    async fn dispatch(&self, op: &QueuedOperation) -> Result<(), TransportError>;
}

struct QueueInner {
    ops: Vec<QueuedOperation>,
    quarantined: Vec<QueuedOperation>,
    next_seq: u64,
}

/// Persistent, ordered, bounded offline queue
pub struct OfflineQueue {
    store: Arc<dyn KvStore>,
    bus: EventBus,
    max_size: usize,
    max_retries: u32,
    backoff: BackoffPolicy,
    inner: Mutex<QueueInner>,
    /// Single-flight gate: holds the in-progress pass's report receiver
    flush_slot: Mutex<Option<watch::Receiver<Option<FlushReport>>>>,
}

impl OfflineQueue {
    pub fn new(store: Arc<dyn KvStore>, bus: EventBus, config: &Config) -> Self {
        Self {
            store,
            bus,
            max_size: config.queue.max_size,
            max_retries: config.queue.max_retries,
            backoff: config.backoff_policy(),
            inner: Mutex::new(QueueInner {
                ops: Vec::new(),
                quarantined: Vec::new(),
                next_seq: 0,
            }),
            flush_slot: Mutex::new(None),
        }
    }

    /// Load the durable snapshot, validating every record's checksum
    ///
    /// Records that fail validation are quarantined (kept for diagnostics,
    /// excluded from processing) and a warning event is emitted; everything
    /// else is restored in original sequence order. Operations that were
    /// inflight when the process died go back to pending.
    pub fn restore(&self) -> Result<RestoreReport, StoreError> {
        let Some(bytes) = self.store.get(STORE_KEY)? else {
            return Ok(RestoreReport::default());
        };

        let snapshot: QueueSnapshot =
            serde_json::from_slice(&bytes).map_err(|e| StoreError::InvalidRecord {
                key: STORE_KEY.to_string(),
                details: e.to_string(),
            })?;

        if snapshot.version > STORE_VERSION {
            return Err(StoreError::Version {
                found: snapshot.version,
                supported: STORE_VERSION,
            });
        }

        let mut report = RestoreReport::default();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.next_seq = snapshot.next_seq;
            inner.quarantined = snapshot.quarantined;

            for mut op in snapshot.ops {
                if op.checksum != op.expected_checksum() {
                    warn!(
                        operation = %op.id,
                        seq = op.seq,
                        "queue record failed checksum validation, quarantining"
                    );
                    self.bus.publish(ClientEvent::IntegrityWarning {
                        detail: format!("queued operation {} failed checksum validation", op.id),
                    });
                    report.quarantined += 1;
                    inner.quarantined.push(op);
                    continue;
                }
                if op.status == OperationStatus::Inflight {
                    op.status = OperationStatus::Pending;
                }
                report.restored += 1;
                inner.ops.push(op);
            }
            inner.ops.sort_by_key(|op| op.seq);
            self.persist_locked(&inner)?;
        }

        info!(
            restored = report.restored,
            quarantined = report.quarantined,
            "offline queue restored"
        );
        Ok(report)
    }

    /// Append an operation, evicting under capacity pressure
    ///
    /// When the queue is full the lowest-priority non-inflight operation
    /// (oldest first within a tier) is evicted and a `queue:overflow` event
    /// is emitted. The new operation competes on the same terms: a newcomer
    /// below every queued tier is itself the eviction victim. This is
    /// deliberate backpressure, never a silent drop.
    pub fn enqueue(
        &self,
        kind: OperationKind,
        payload: Value,
        priority: Priority,
    ) -> Result<OperationId, QueueError> {
        let mut inner = self.inner.lock().unwrap();

        let id = Uuid::new_v4();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let now = Utc::now();
        let op = QueuedOperation {
            id,
            kind,
            checksum: compute_checksum(&id, kind, &payload, seq),
            payload,
            priority,
            status: OperationStatus::Pending,
            retry_count: 0,
            max_retries: self.max_retries,
            seq,
            created_at: now,
            updated_at: now,
            last_error: None,
        };
        debug!(operation = %id, kind = ?kind, seq, "enqueued operation");
        inner.ops.push(op);

        let mut evicted = Vec::new();
        while inner.ops.len() > self.max_size {
            let candidate = inner
                .ops
                .iter()
                .filter(|op| op.status != OperationStatus::Inflight)
                .min_by_key(|op| (op.priority, op.seq))
                .map(|op| op.id);
            let Some(victim) = candidate else {
                break;
            };
            inner.ops.retain(|op| op.id != victim);
            evicted.push(victim);
        }
        if !evicted.is_empty() {
            warn!(count = evicted.len(), "offline queue full, evicting");
            self.bus.publish(ClientEvent::QueueOverflow {
                evicted: evicted.clone(),
            });
        }

        self.persist_locked(&inner)?;
        Ok(id)
    }

    /// Pending operations in dispatch order: priority tiers first, FIFO by
    /// sequence number within a tier
    pub fn dequeue_pending(&self, limit: usize) -> Vec<QueuedOperation> {
        let inner = self.inner.lock().unwrap();
        let mut pending: Vec<QueuedOperation> = inner
            .ops
            .iter()
            .filter(|op| op.status == OperationStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|op| (std::cmp::Reverse(op.priority), op.seq));
        pending.truncate(limit);
        pending
    }

    pub fn mark_inflight(&self, id: OperationId) -> Result<(), QueueError> {
        self.update_status(id, OperationStatus::Inflight, None)
    }

    /// Remove an acknowledged operation
    pub fn mark_done(&self, id: OperationId) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.ops.len();
        inner.ops.retain(|op| op.id != id);
        if inner.ops.len() == before {
            return Err(QueueError::NotFound(id));
        }
        self.persist_locked(&inner)?;
        Ok(())
    }

    /// Mark an operation failed; it stays in the queue for manual resolution
    pub fn mark_failed(&self, id: OperationId, error: &str) -> Result<(), QueueError> {
        self.update_status(id, OperationStatus::Failed, Some(error.to_string()))
    }

    /// Return an inflight operation to pending (connection lost mid-flush)
    pub fn mark_pending(&self, id: OperationId) -> Result<(), QueueError> {
        self.update_status(id, OperationStatus::Pending, None)
    }

    /// Reset a failed operation for another round of retries
    pub fn reset_failed(&self, id: OperationId) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let op = inner
            .ops
            .iter_mut()
            .find(|op| op.id == id)
            .ok_or(QueueError::NotFound(id))?;
        op.status = OperationStatus::Pending;
        op.retry_count = 0;
        op.last_error = None;
        op.updated_at = Utc::now();
        self.persist_locked(&inner)?;
        Ok(())
    }

    /// Find the queued send operation for a client message id
    pub fn find_send(&self, client_message_id: Uuid) -> Option<OperationId> {
        let wanted = client_message_id.to_string();
        let inner = self.inner.lock().unwrap();
        inner
            .ops
            .iter()
            .find(|op| {
                op.kind == OperationKind::SendMessage
                    && op.payload.get("clientMessageId").and_then(Value::as_str)
                        == Some(wanted.as_str())
            })
            .map(|op| op.id)
    }

    /// Drop pending operations of a kind a newer operation supersedes
    ///
    /// Presence updates carry full state, so only the latest one matters.
    pub fn discard_pending_of_kind(&self, kind: OperationKind) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.ops.len();
        inner
            .ops
            .retain(|op| !(op.kind == kind && op.status == OperationStatus::Pending));
        let removed = before - inner.ops.len();
        if removed > 0 {
            let _ = self.persist_locked(&inner);
        }
        removed
    }

    /// Drop an unsent local copy of a message the server already has
    pub fn discard_send(&self, client_message_id: Uuid) -> bool {
        let Some(id) = self.find_send(client_message_id) else {
            return false;
        };
        let mut inner = self.inner.lock().unwrap();
        inner.ops.retain(|op| op.id != id);
        let _ = self.persist_locked(&inner);
        debug!(client_message_id = %client_message_id, "discarded superseded send operation");
        true
    }

    pub fn pending_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .ops
            .iter()
            .filter(|op| op.status == OperationStatus::Pending)
            .count()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Failed operations awaiting manual resolution
    pub fn failed_ops(&self) -> Vec<QueuedOperation> {
        self.inner
            .lock()
            .unwrap()
            .ops
            .iter()
            .filter(|op| op.status == OperationStatus::Failed)
            .cloned()
            .collect()
    }

    /// Quarantined records kept for diagnostics
    pub fn quarantined(&self) -> Vec<QueuedOperation> {
        self.inner.lock().unwrap().quarantined.clone()
    }

    /// All live operations in sequence order
    pub fn snapshot_ops(&self) -> Vec<QueuedOperation> {
        self.inner.lock().unwrap().ops.clone()
    }

    /// Whether a flush pass is currently running
    pub fn flush_in_progress(&self) -> bool {
        self.flush_slot.lock().unwrap().is_some()
    }

    /// Drain pending operations through the sink
    ///
    /// Idempotent and single-flight: if a pass is already running, this call
    /// waits for it and returns that pass's report instead of starting a
    /// duplicate. Per-operation retries use the shared backoff policy until
    /// `max_retries` is exceeded, at which point the operation is marked
    /// failed and surfaced for manual resolution.
    pub async fn flush(&self, sink: &dyn OperationSink) -> Result<FlushReport, QueueError> {
        enum FlushEntry {
            Run(watch::Sender<Option<FlushReport>>),
            Wait(watch::Receiver<Option<FlushReport>>),
        }

        // Take or join the slot without holding the lock across an await.
        let entry = {
            let mut slot = self.flush_slot.lock().unwrap();
            match slot.as_ref() {
                Some(rx) => FlushEntry::Wait(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    *slot = Some(rx);
                    FlushEntry::Run(tx)
                }
            }
        };
        let report_tx = match entry {
            FlushEntry::Wait(mut rx) => return Ok(Self::await_report(&mut rx).await),
            FlushEntry::Run(tx) => tx,
        };

        // The caller owning this future can be cancelled mid-pass (the sync
        // coordinator runs under a hard timeout); the guard releases the gate
        // and returns any inflight operation to pending on every exit path.
        let guard = FlushGuard { queue: self };
        let report = self.flush_pass(sink).await;
        drop(guard);
        let _ = report_tx.send(Some(report.clone()));
        Ok(report)
    }

    async fn await_report(rx: &mut watch::Receiver<Option<FlushReport>>) -> FlushReport {
        loop {
            if let Some(report) = rx.borrow().clone() {
                return report;
            }
            if rx.changed().await.is_err() {
                // Flush task went away without a report; treat as aborted.
                return FlushReport {
                    aborted: true,
                    ..FlushReport::default()
                };
            }
        }
    }

    async fn flush_pass(&self, sink: &dyn OperationSink) -> FlushReport {
        let pending = self.dequeue_pending(usize::MAX);
        let mut report = FlushReport {
            attempted: pending.len(),
            ..FlushReport::default()
        };
        if pending.is_empty() {
            return report;
        }
        debug!(count = pending.len(), "flushing offline queue");

        for op in pending {
            if self.mark_inflight(op.id).is_err() {
                // Evicted or discarded since the pass started.
                continue;
            }
            let mut retry_count = op.retry_count;
            loop {
                match sink.dispatch(&op).await {
                    Ok(()) => {
                        let _ = self.mark_done(op.id);
                        report.sent += 1;
                        break;
                    }
                    Err(err) if connection_gone(&err) => {
                        let _ = self.mark_pending(op.id);
                        warn!(operation = %op.id, error = %err, "flush aborted, connection gone");
                        report.aborted = true;
                        report.remaining = self.pending_count();
                        return report;
                    }
                    Err(err) => {
                        retry_count += 1;
                        if retry_count >= op.max_retries {
                            warn!(
                                operation = %op.id,
                                retries = retry_count,
                                error = %err,
                                "operation exhausted retries"
                            );
                            let _ = self.mark_failed(op.id, &err.to_string());
                            self.bus.publish(ClientEvent::OperationFailed {
                                operation_id: op.id,
                                error: err.to_string(),
                            });
                            report.failed += 1;
                            break;
                        }
                        let _ = self.bump_retry(op.id, &err.to_string());
                        tokio::time::sleep(self.backoff.delay(retry_count - 1)).await;
                    }
                }
            }
        }

        report.remaining = self.pending_count();
        report
    }

    fn bump_retry(&self, id: OperationId, error: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let op = inner
            .ops
            .iter_mut()
            .find(|op| op.id == id)
            .ok_or(QueueError::NotFound(id))?;
        op.retry_count += 1;
        op.last_error = Some(error.to_string());
        op.updated_at = Utc::now();
        self.persist_locked(&inner)?;
        Ok(())
    }

    fn update_status(
        &self,
        id: OperationId,
        status: OperationStatus,
        error: Option<String>,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let op = inner
            .ops
            .iter_mut()
            .find(|op| op.id == id)
            .ok_or(QueueError::NotFound(id))?;
        op.status = status;
        if error.is_some() {
            op.last_error = error;
        }
        op.updated_at = Utc::now();
        self.persist_locked(&inner)?;
        Ok(())
    }

    fn persist_locked(&self, inner: &QueueInner) -> Result<(), StoreError> {
        let snapshot = QueueSnapshot {
            version: STORE_VERSION,
            next_seq: inner.next_seq,
            ops: inner.ops.clone(),
            quarantined: inner.quarantined.clone(),
        };
        let bytes = serde_json::to_vec(&snapshot).map_err(|e| StoreError::InvalidRecord {
            key: STORE_KEY.to_string(),
            details: e.to_string(),
        })?;
        self.store.put(STORE_KEY, &bytes)
    }
}

/// Releases the single-flight gate when a flush pass ends, normally or by
/// cancellation
///
/// Dropping the pass future between marking an operation inflight and
/// clearing the slot would otherwise leave `flush_in_progress()` true
/// forever and the operation unreachable.
struct FlushGuard<'a> {
    queue: &'a OfflineQueue,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        {
            let mut inner = self.queue.inner.lock().unwrap();
            let mut reverted = false;
            for op in inner.ops.iter_mut() {
                if op.status == OperationStatus::Inflight {
                    op.status = OperationStatus::Pending;
                    op.updated_at = Utc::now();
                    reverted = true;
                }
            }
            if reverted {
                let _ = self.queue.persist_locked(&inner);
            }
        }
        *self.queue.flush_slot.lock().unwrap() = None;
    }
}

/// Errors that mean the connection is gone and the pass should stop rather
/// than burn an operation's retries
fn connection_gone(err: &TransportError) -> bool {
    matches!(
        err,
        TransportError::NotConnected | TransportError::Closed | TransportError::Auth(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn small_config() -> Config {
        let mut config = Config::default();
        config.queue.max_size = 5;
        config.queue.max_retries = 3;
        config.reconnect.base_delay_ms = 1;
        config.reconnect.max_delay_ms = 5;
        config
    }

    fn queue_with(store: Arc<dyn KvStore>, config: &Config) -> OfflineQueue {
        OfflineQueue::new(store, EventBus::new(), config)
    }

    struct OkSink;

    #[async_trait]
    impl OperationSink for OkSink {
        async fn dispatch(&self, _op: &QueuedOperation) -> Result<(), TransportError> {
            Ok(())
        }
    }

    struct FailingSink {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl OperationSink for FailingSink {
        async fn dispatch(&self, _op: &QueuedOperation) -> Result<(), TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::SendTimeout)
        }
    }

    struct SlowSink;

    #[async_trait]
    impl OperationSink for SlowSink {
        async fn dispatch(&self, _op: &QueuedOperation) -> Result<(), TransportError> {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            Ok(())
        }
    }

    #[test]
    fn test_enqueue_assigns_monotonic_seq() {
        let config = small_config();
        let queue = queue_with(Arc::new(MemoryStore::new()), &config);

        queue
            .enqueue(OperationKind::ReadAck, json!({"a": 1}), Priority::Normal)
            .unwrap();
        queue
            .enqueue(OperationKind::ReadAck, json!({"a": 2}), Priority::Normal)
            .unwrap();

        let ops = queue.snapshot_ops();
        assert_eq!(ops[0].seq, 0);
        assert_eq!(ops[1].seq, 1);
    }

    #[test]
    fn test_dequeue_order_priority_then_fifo() {
        let config = small_config();
        let queue = queue_with(Arc::new(MemoryStore::new()), &config);

        let low = queue
            .enqueue(OperationKind::PresenceUpdate, json!({}), Priority::Low)
            .unwrap();
        let high = queue
            .enqueue(OperationKind::SendMessage, json!({}), Priority::High)
            .unwrap();
        let normal1 = queue
            .enqueue(OperationKind::ReadAck, json!({"n": 1}), Priority::Normal)
            .unwrap();
        let normal2 = queue
            .enqueue(OperationKind::ReadAck, json!({"n": 2}), Priority::Normal)
            .unwrap();

        let order: Vec<OperationId> =
            queue.dequeue_pending(10).into_iter().map(|op| op.id).collect();
        assert_eq!(order, vec![high, normal1, normal2, low]);
    }

    #[test]
    fn test_overflow_evicts_lowest_priority_oldest_first() {
        let config = small_config();
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let queue = OfflineQueue::new(Arc::new(MemoryStore::new()), bus, &config);

        let first_low = queue
            .enqueue(OperationKind::PresenceUpdate, json!({"i": 0}), Priority::Low)
            .unwrap();
        queue
            .enqueue(OperationKind::PresenceUpdate, json!({"i": 1}), Priority::Low)
            .unwrap();
        for i in 2..5 {
            queue
                .enqueue(OperationKind::SendMessage, json!({"i": i}), Priority::High)
                .unwrap();
        }
        assert_eq!(queue.len(), 5);

        // Queue is at the bound; this enqueue evicts the oldest low entry.
        queue
            .enqueue(OperationKind::SendMessage, json!({"i": 5}), Priority::High)
            .unwrap();
        assert_eq!(queue.len(), 5);
        assert!(queue.snapshot_ops().iter().all(|op| op.id != first_low));

        match events.try_recv().unwrap() {
            ClientEvent::QueueOverflow { evicted } => assert_eq!(evicted, vec![first_low]),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_overflow_drops_lowest_priority_newcomer() {
        let config = small_config();
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let queue = OfflineQueue::new(Arc::new(MemoryStore::new()), bus, &config);

        for i in 0..5 {
            queue
                .enqueue(OperationKind::SendMessage, json!({"i": i}), Priority::High)
                .unwrap();
        }

        // A low-priority arrival must not displace queued high-priority sends.
        let newcomer = queue
            .enqueue(OperationKind::PresenceUpdate, json!({}), Priority::Low)
            .unwrap();
        assert_eq!(queue.len(), 5);
        assert!(queue
            .snapshot_ops()
            .iter()
            .all(|op| op.priority == Priority::High));

        match events.try_recv().unwrap() {
            ClientEvent::QueueOverflow { evicted } => assert_eq!(evicted, vec![newcomer]),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_durability_across_restart() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let mut config = small_config();
        config.queue.max_size = 100;

        let mut ids = Vec::new();
        {
            let queue = queue_with(store.clone(), &config);
            for i in 0..50 {
                ids.push(
                    queue
                        .enqueue(
                            OperationKind::SendMessage,
                            json!({"content": format!("msg {}", i)}),
                            Priority::Normal,
                        )
                        .unwrap(),
                );
            }
        }

        // Simulated restart: a fresh queue over the same store.
        let queue = queue_with(store, &config);
        let report = queue.restore().unwrap();
        assert_eq!(report, RestoreReport { restored: 50, quarantined: 0 });

        let ops = queue.snapshot_ops();
        assert_eq!(ops.len(), 50);
        for (i, op) in ops.iter().enumerate() {
            assert_eq!(op.seq, i as u64);
            assert_eq!(op.id, ids[i]);
            assert_eq!(op.checksum, op.expected_checksum());
        }
    }

    #[test]
    fn test_restore_quarantines_corrupt_records() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let config = small_config();

        {
            let queue = queue_with(store.clone(), &config);
            queue
                .enqueue(OperationKind::SendMessage, json!({"content": "ok"}), Priority::Normal)
                .unwrap();
            queue
                .enqueue(OperationKind::SendMessage, json!({"content": "bad"}), Priority::Normal)
                .unwrap();
        }

        // Corrupt the second record's payload behind the checksum's back.
        let bytes = store.get(STORE_KEY).unwrap().unwrap();
        let mut snapshot: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        snapshot["ops"][1]["payload"]["content"] = json!("tampered");
        store
            .put(STORE_KEY, serde_json::to_vec(&snapshot).unwrap().as_slice())
            .unwrap();

        let queue = queue_with(store, &config);
        let report = queue.restore().unwrap();
        assert_eq!(report.restored, 1);
        assert_eq!(report.quarantined, 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.quarantined().len(), 1);
        assert_eq!(
            queue.quarantined()[0].payload["content"],
            json!("tampered")
        );
    }

    #[test]
    fn test_restore_resets_inflight_to_pending() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let config = small_config();

        {
            let queue = queue_with(store.clone(), &config);
            let id = queue
                .enqueue(OperationKind::SendMessage, json!({}), Priority::Normal)
                .unwrap();
            queue.mark_inflight(id).unwrap();
        }

        let queue = queue_with(store, &config);
        queue.restore().unwrap();
        assert_eq!(queue.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_flush_sends_and_removes() {
        let config = small_config();
        let queue = queue_with(Arc::new(MemoryStore::new()), &config);
        queue
            .enqueue(OperationKind::SendMessage, json!({"content": "hi"}), Priority::High)
            .unwrap();

        let report = queue.flush(&OkSink).await.unwrap();
        assert_eq!(report.attempted, 1);
        assert_eq!(report.sent, 1);
        assert_eq!(report.remaining, 0);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_flush_marks_failed_after_retry_cap() {
        let config = small_config();
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let queue = OfflineQueue::new(Arc::new(MemoryStore::new()), bus, &config);
        let id = queue
            .enqueue(OperationKind::ReadAck, json!({}), Priority::Normal)
            .unwrap();

        let sink = FailingSink { calls: AtomicUsize::new(0) };
        let report = queue.flush(&sink).await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
        let failed = queue.failed_ops();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, id);

        // Surfaced, not silently dropped
        loop {
            match events.try_recv() {
                Ok(ClientEvent::OperationFailed { operation_id, .. }) => {
                    assert_eq!(operation_id, id);
                    break;
                }
                Ok(_) => continue,
                Err(e) => panic!("no failure event: {:?}", e),
            }
        }
    }

    #[tokio::test]
    async fn test_concurrent_flush_returns_same_pass_result() {
        let mut config = small_config();
        config.queue.max_size = 100;
        let queue = Arc::new(queue_with(Arc::new(MemoryStore::new()), &config));
        for i in 0..4 {
            queue
                .enqueue(OperationKind::SendMessage, json!({"i": i}), Priority::Normal)
                .unwrap();
        }

        let q1 = queue.clone();
        let first = tokio::spawn(async move { q1.flush(&SlowSink).await.unwrap() });
        // Give the first pass time to take the flush slot.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(queue.flush_in_progress());

        let second = queue.flush(&OkSink).await.unwrap();
        let first = first.await.unwrap();

        // The second caller observed the first pass's report; nothing ran twice.
        assert_eq!(first.sent, 4);
        assert_eq!(second.sent, 4);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_timed_out_flush_releases_gate_and_inflight() {
        struct HangingSink;
        #[async_trait]
        impl OperationSink for HangingSink {
            async fn dispatch(&self, _op: &QueuedOperation) -> Result<(), TransportError> {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                Ok(())
            }
        }

        let config = small_config();
        let queue = Arc::new(queue_with(Arc::new(MemoryStore::new()), &config));
        queue
            .enqueue(OperationKind::SendMessage, json!({}), Priority::Normal)
            .unwrap();

        // The sync coordinator runs flushes under a hard timeout; when it
        // fires, the pass future is dropped mid-dispatch.
        let q = queue.clone();
        let cancelled = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            async move { q.flush(&HangingSink).await },
        )
        .await;
        assert!(cancelled.is_err());

        // The gate is released and the operation is pending again.
        assert!(!queue.flush_in_progress());
        assert_eq!(queue.pending_count(), 1);

        let report = queue.flush(&OkSink).await.unwrap();
        assert_eq!(report.sent, 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_flush_aborts_when_connection_gone() {
        struct GoneSink;
        #[async_trait]
        impl OperationSink for GoneSink {
            async fn dispatch(&self, _op: &QueuedOperation) -> Result<(), TransportError> {
                Err(TransportError::NotConnected)
            }
        }

        let config = small_config();
        let queue = queue_with(Arc::new(MemoryStore::new()), &config);
        queue
            .enqueue(OperationKind::SendMessage, json!({}), Priority::Normal)
            .unwrap();
        queue
            .enqueue(OperationKind::SendMessage, json!({}), Priority::Normal)
            .unwrap();

        let report = queue.flush(&GoneSink).await.unwrap();
        assert!(report.aborted);
        assert_eq!(report.sent, 0);
        // Both stayed pending for the next reconnect.
        assert_eq!(queue.pending_count(), 2);
    }

    #[test]
    fn test_discard_send_by_client_message_id() {
        let config = small_config();
        let queue = queue_with(Arc::new(MemoryStore::new()), &config);
        let client_id = Uuid::new_v4();
        queue
            .enqueue(
                OperationKind::SendMessage,
                json!({"clientMessageId": client_id.to_string(), "content": "x"}),
                Priority::High,
            )
            .unwrap();

        assert!(queue.discard_send(client_id));
        assert!(queue.is_empty());
        assert!(!queue.discard_send(client_id));
    }

    #[test]
    fn test_reset_failed_returns_to_pending() {
        let config = small_config();
        let queue = queue_with(Arc::new(MemoryStore::new()), &config);
        let id = queue
            .enqueue(OperationKind::SendMessage, json!({}), Priority::Normal)
            .unwrap();
        queue.mark_failed(id, "boom").unwrap();
        assert_eq!(queue.pending_count(), 0);

        queue.reset_failed(id).unwrap();
        assert_eq!(queue.pending_count(), 1);
        let op = &queue.snapshot_ops()[0];
        assert_eq!(op.retry_count, 0);
        assert!(op.last_error.is_none());
    }
}
