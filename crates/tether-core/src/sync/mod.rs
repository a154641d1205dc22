//! Reconnect synchronization: checkpoint persistence and the sync pass

mod checkpoint;
mod coordinator;

pub use checkpoint::SyncCheckpoint;
pub use coordinator::{
    DiffEvent, Diffable, Flushable, RequestSink, SyncCoordinator, SyncPhase, SyncReport,
    SyncStatus,
};
