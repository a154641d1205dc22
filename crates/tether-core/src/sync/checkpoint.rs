//! Sync checkpoint persistence

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::storage::KvStore;
use crate::wire::RoomId;

const STORE_KEY: &str = "sync_checkpoint";

/// High-water marks of what this client has already incorporated
///
/// Sent verbatim in `sync:request`; the relay returns only what is newer.
/// Advanced and persisted only after a pass completes, so an interrupted
/// sync replays its diff on the next attempt instead of losing it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCheckpoint {
    #[serde(default)]
    pub per_room: HashMap<RoomId, DateTime<Utc>>,
    #[serde(default)]
    pub global: Option<DateTime<Utc>>,
}

impl SyncCheckpoint {
    pub fn load(store: &Arc<dyn KvStore>) -> Result<Self, StoreError> {
        let Some(bytes) = store.get(STORE_KEY)? else {
            return Ok(Self::default());
        };
        serde_json::from_slice(&bytes).map_err(|e| StoreError::InvalidRecord {
            key: STORE_KEY.to_string(),
            details: e.to_string(),
        })
    }

    pub fn save(&self, store: &Arc<dyn KvStore>) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(self).map_err(|e| StoreError::InvalidRecord {
            key: STORE_KEY.to_string(),
            details: e.to_string(),
        })?;
        store.put(STORE_KEY, &bytes)
    }

    /// Raise the room and global marks, never lowering them
    pub fn advance(&mut self, room_id: &str, at: DateTime<Utc>) {
        let mark = self
            .per_room
            .entry(room_id.to_string())
            .or_insert(at);
        if at > *mark {
            *mark = at;
        }
        if self.global.is_none_or(|g| at > g) {
            self.global = Some(at);
        }
    }

    pub fn room(&self, room_id: &str) -> Option<DateTime<Utc>> {
        self.per_room.get(room_id).copied()
    }
}
