//! Sync coordinator
//!
//! Runs the three-phase reconnect pass: flush the offline queue, fetch the
//! incremental diff since the last checkpoint, then fold the diff into local
//! state. Conflict policy is fixed: the server's copy of a message wins over
//! a local unsent one, and the highest delivery state wins. The checkpoint is
//! committed only after the whole pass succeeds, so an interrupted pass
//! replays its diff instead of dropping it; replay is idempotent.
//!
//! The coordinator depends on the queue and tracker through the narrow
//! [`Flushable`] and [`Diffable`] traits rather than on the concrete types.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::delivery::DiffOutcome;
use crate::error::{QueueError, StoreError, SyncError, TransportError};
use crate::events::{ClientEvent, EventBus};
use crate::queue::{FlushReport, OfflineQueue, OperationSink};
use crate::storage::KvStore;
use crate::sync::checkpoint::SyncCheckpoint;
use crate::transport::SessionHandle;
use crate::wire::{ClientFrame, DiffMessage, ServerMessageId, SyncDiffBatch};

/// If the relay goes quiet mid-diff for this long, the pass is stalled
const DIFF_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Phase of an in-progress sync pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    FlushingQueue,
    FetchingDiff,
    ResolvingConflicts,
}

/// Coordinator status, published on a watch channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    Syncing(SyncPhase),
}

/// Summary of one completed sync pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub flushed: FlushReport,
    /// Rooms that appeared in the diff
    pub rooms: usize,
    /// Diff entries that advanced local state
    pub applied: usize,
    /// Local unsent copies superseded by the server
    pub conflicts: usize,
    pub duration_ms: u64,
}

/// Items of the diff stream, routed from inbound frames
#[derive(Debug)]
pub enum DiffEvent {
    Batch(SyncDiffBatch),
    Complete,
}

/// State that can fold a diff entry into itself
pub trait Diffable: Send + Sync {
    fn apply_diff(&self, msg: &DiffMessage) -> DiffOutcome;
}

/// Queue surface the coordinator needs for phase one and conflict handling
#[async_trait]
pub trait Flushable: Send + Sync {
    async fn flush_pending(&self, sink: &dyn OperationSink) -> Result<FlushReport, QueueError>;

    /// Drop a queued send the server already has; true if one was found
    fn discard_send(&self, client_message_id: Uuid) -> bool;
}

#[async_trait]
impl Flushable for OfflineQueue {
    async fn flush_pending(&self, sink: &dyn OperationSink) -> Result<FlushReport, QueueError> {
        self.flush(sink).await
    }

    fn discard_send(&self, client_message_id: Uuid) -> bool {
        OfflineQueue::discard_send(self, client_message_id)
    }
}

/// Where sync requests go; the live session in production
#[async_trait]
pub trait RequestSink: Send + Sync {
    async fn send_frame(&self, frame: ClientFrame) -> Result<(), TransportError>;
}

#[async_trait]
impl RequestSink for SessionHandle {
    async fn send_frame(&self, frame: ClientFrame) -> Result<(), TransportError> {
        self.send(frame).await
    }
}

/// Orchestrates reconnect sync passes
pub struct SyncCoordinator {
    store: Arc<dyn KvStore>,
    checkpoint: Mutex<SyncCheckpoint>,
    flushable: Arc<dyn Flushable>,
    diffables: Vec<Arc<dyn Diffable>>,
    bus: EventBus,
    status_tx: watch::Sender<SyncStatus>,
    status_rx: watch::Receiver<SyncStatus>,
    cancel: AtomicBool,
    timeout: Duration,
    batch_limit: u32,
}

impl SyncCoordinator {
    pub fn new(
        store: Arc<dyn KvStore>,
        flushable: Arc<dyn Flushable>,
        diffables: Vec<Arc<dyn Diffable>>,
        bus: EventBus,
        config: &Config,
    ) -> Result<Self, StoreError> {
        let checkpoint = SyncCheckpoint::load(&store)?;
        let (status_tx, status_rx) = watch::channel(SyncStatus::Idle);
        Ok(Self {
            store,
            checkpoint: Mutex::new(checkpoint),
            flushable,
            diffables,
            bus,
            status_tx,
            status_rx,
            cancel: AtomicBool::new(false),
            timeout: config.sync_timeout(),
            batch_limit: config.sync.max_batch_size,
        })
    }

    pub fn status(&self) -> SyncStatus {
        *self.status_rx.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.status_rx.clone()
    }

    pub fn checkpoint(&self) -> SyncCheckpoint {
        self.checkpoint.lock().unwrap().clone()
    }

    /// Request cancellation; observed between phases
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Run one full sync pass
    ///
    /// `diff_rx` carries the diff stream the frame router extracts from
    /// inbound traffic; `unresolved` lists server ids still short of Read so
    /// the relay reports their current status even below the checkpoint.
    pub async fn run(
        &self,
        request: &dyn RequestSink,
        diff_rx: &mut mpsc::UnboundedReceiver<DiffEvent>,
        sink: &dyn OperationSink,
        unresolved: Vec<ServerMessageId>,
    ) -> Result<SyncReport, SyncError> {
        self.cancel.store(false, Ordering::SeqCst);
        let started = Instant::now();

        let outcome = tokio::time::timeout(
            self.timeout,
            self.run_phases(request, diff_rx, sink, unresolved),
        )
        .await;
        let _ = self.status_tx.send(SyncStatus::Idle);

        match outcome {
            Ok(Ok(mut report)) => {
                report.duration_ms = started.elapsed().as_millis() as u64;
                info!(
                    applied = report.applied,
                    conflicts = report.conflicts,
                    rooms = report.rooms,
                    duration_ms = report.duration_ms,
                    "sync pass complete"
                );
                self.bus.publish(ClientEvent::SyncCompleted {
                    report: report.clone(),
                });
                Ok(report)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "sync pass failed");
                self.bus.publish(ClientEvent::SyncFailed {
                    error: e.to_string(),
                });
                Err(e)
            }
            Err(_) => {
                let e = SyncError::Timeout(self.timeout);
                warn!(error = %e, "sync pass failed");
                self.bus.publish(ClientEvent::SyncFailed {
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run_phases(
        &self,
        request: &dyn RequestSink,
        diff_rx: &mut mpsc::UnboundedReceiver<DiffEvent>,
        sink: &dyn OperationSink,
        unresolved: Vec<ServerMessageId>,
    ) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();

        // Phase one: replay what we owe the relay.
        self.enter_phase(SyncPhase::FlushingQueue, 0);
        report.flushed = self.flushable.flush_pending(sink).await?;
        debug!(sent = report.flushed.sent, "queue flushed");

        // Phase two: fetch what the relay owes us. A pass that timed out can
        // leave its batches behind in the channel; drop them first so this
        // pass only ever sees the response to its own request.
        self.check_cancel()?;
        self.enter_phase(SyncPhase::FetchingDiff, 33);
        while diff_rx.try_recv().is_ok() {}
        let checkpoint = self.checkpoint.lock().unwrap().clone();
        request
            .send_frame(ClientFrame::SyncRequest {
                checkpoint,
                limit: self.batch_limit,
                unresolved,
            })
            .await?;
        let batches = self.collect_diff(diff_rx).await?;

        // Phase three: fold the diff in and commit the checkpoint.
        self.check_cancel()?;
        self.enter_phase(SyncPhase::ResolvingConflicts, 66);
        let mut next_checkpoint = self.checkpoint.lock().unwrap().clone();
        let mut rooms = std::collections::HashSet::new();
        for batch in &batches {
            rooms.insert(batch.room_id.clone());
            for msg in &batch.messages {
                match self.resolve(msg) {
                    DiffOutcome::Applied => report.applied += 1,
                    DiffOutcome::Conflict => report.conflicts += 1,
                    DiffOutcome::Ignored => {}
                }
                next_checkpoint.advance(&batch.room_id, msg.sent_at);
            }
        }
        report.rooms = rooms.len();

        next_checkpoint.save(&self.store)?;
        *self.checkpoint.lock().unwrap() = next_checkpoint;
        self.bus.publish(ClientEvent::SyncProgress { percent: 100 });

        Ok(report)
    }

    async fn collect_diff(
        &self,
        diff_rx: &mut mpsc::UnboundedReceiver<DiffEvent>,
    ) -> Result<Vec<SyncDiffBatch>, SyncError> {
        let mut batches = Vec::new();
        loop {
            match tokio::time::timeout(DIFF_IDLE_TIMEOUT, diff_rx.recv()).await {
                Ok(Some(DiffEvent::Batch(batch))) => {
                    debug!(room = %batch.room_id, messages = batch.messages.len(), "diff batch");
                    batches.push(batch);
                }
                Ok(Some(DiffEvent::Complete)) => return Ok(batches),
                Ok(None) | Err(_) => return Err(SyncError::DiffStalled),
            }
        }
    }

    /// Apply one diff entry: server wins over a local unsent copy, highest
    /// delivery state wins otherwise
    fn resolve(&self, msg: &DiffMessage) -> DiffOutcome {
        let mut outcome = DiffOutcome::Ignored;
        for diffable in &self.diffables {
            match diffable.apply_diff(msg) {
                DiffOutcome::Conflict => {
                    outcome = DiffOutcome::Conflict;
                    break;
                }
                DiffOutcome::Applied => outcome = DiffOutcome::Applied,
                DiffOutcome::Ignored => {}
            }
        }
        if outcome == DiffOutcome::Conflict {
            if let Some(client_id) = msg.client_message_id {
                self.flushable.discard_send(client_id);
            }
        }
        outcome
    }

    fn enter_phase(&self, phase: SyncPhase, percent: u8) {
        let _ = self.status_tx.send(SyncStatus::Syncing(phase));
        self.bus.publish(ClientEvent::SyncProgress { percent });
    }

    fn check_cancel(&self) -> Result<(), SyncError> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }
}
