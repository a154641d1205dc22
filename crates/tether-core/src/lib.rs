//! Tether core: realtime chat synchronization for flaky networks
//!
//! The core keeps a chat client correct while its connection is not: sends
//! queue durably while offline and replay on reconnect, presence and typing
//! indicators degrade gracefully, per-recipient delivery state only moves
//! forward, and a checkpointed sync pass reconciles local state with the
//! relay after every gap.
//!
//! [`Client`] assembles the pieces; the individual modules are public for
//! callers that want to wire them differently.

pub mod backoff;
pub mod client;
pub mod config;
pub mod delivery;
pub mod error;
pub mod events;
pub mod presence;
pub mod queue;
pub mod storage;
pub mod sync;
pub mod transport;
pub mod typing;
pub mod wire;

pub use client::Client;
pub use config::Config;
pub use delivery::{DeliveryRecord, DeliveryState, DiffOutcome};
pub use error::{AuthError, QueueError, StoreError, SyncError, TransportError};
pub use events::{ClientEvent, EventBus};
pub use presence::{ContactLookup, PresenceRecord, PresenceStatus, StaticContacts, Visibility};
pub use queue::{FlushReport, OfflineQueue, OperationKind, OperationStatus, Priority};
pub use storage::{FileStore, KvStore, MemoryStore};
pub use sync::{SyncCheckpoint, SyncCoordinator, SyncPhase, SyncReport, SyncStatus};
pub use transport::{
    ConnectionState, Connector, CredentialProvider, SessionHandle, StaticCredentials, WsConnector,
};
pub use typing::format_typers;
