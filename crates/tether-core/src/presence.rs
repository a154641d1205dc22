//! Presence tracking
//!
//! Tracks the local user's advertised status (with idle auto-away and
//! periodic re-assertion) and a bounded map of remote users' presence.
//! Privacy is enforced on both sides of the wire: `visibility = "nobody"`
//! suppresses outbound publishes entirely, and inbound records from users
//! whose visibility excludes us are stored but never displayable.
//!
//! The tracker itself never touches the transport. Mutating calls return the
//! wire frame to publish (if any); the client facade routes durable publishes
//! through the offline queue.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Config;
use crate::events::{ClientEvent, EventBus};
use crate::wire::{ClientFrame, UserId};

/// Advertised availability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    Offline,
}

/// Who may observe a user's presence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Everyone,
    Contacts,
    Nobody,
}

/// Free-form status line with optional expiry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomStatus {
    pub text: String,
    #[serde(default)]
    pub emoji: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// A user's presence as last observed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub status: PresenceStatus,
    #[serde(default)]
    pub custom_status: Option<CustomStatus>,
    pub last_seen_at: DateTime<Utc>,
    pub visibility: Visibility,
    /// Whether this client is allowed to show the record to the user.
    /// Records we are not allowed to see are kept (so a later contact add
    /// shows current data) but stay hidden.
    #[serde(skip)]
    pub displayable: bool,
}

/// Contact membership check used for presence privacy
pub trait ContactLookup: Send + Sync {
    fn is_contact(&self, user_id: &str) -> bool;
}

/// Fixed contact list, typically loaded from config
pub struct StaticContacts {
    contacts: HashSet<String>,
}

impl StaticContacts {
    pub fn new(contacts: impl IntoIterator<Item = String>) -> Self {
        Self {
            contacts: contacts.into_iter().collect(),
        }
    }
}

impl ContactLookup for StaticContacts {
    fn is_contact(&self, user_id: &str) -> bool {
        self.contacts.contains(user_id)
    }
}

struct RemoteEntry {
    record: PresenceRecord,
    touch: u64,
}

/// Tracks local and remote presence state
pub struct PresenceTracker {
    me: UserId,
    bus: EventBus,
    contacts: Box<dyn ContactLookup>,

    my_status: PresenceStatus,
    my_custom: Option<CustomStatus>,
    my_visibility: Visibility,
    /// Status was set to Away by the idle timer, not the user
    auto_away: bool,
    last_activity: DateTime<Utc>,
    last_broadcast: Option<DateTime<Utc>>,

    records: HashMap<UserId, RemoteEntry>,
    subscriptions: HashSet<UserId>,
    touch_counter: u64,

    idle_timeout: ChronoDuration,
    heartbeat: ChronoDuration,
    max_records: usize,
}

impl PresenceTracker {
    pub fn new(me: UserId, contacts: Box<dyn ContactLookup>, bus: EventBus, config: &Config) -> Self {
        Self {
            me,
            bus,
            contacts,
            my_status: PresenceStatus::Online,
            my_custom: None,
            my_visibility: Visibility::Everyone,
            auto_away: false,
            last_activity: Utc::now(),
            last_broadcast: None,
            records: HashMap::new(),
            subscriptions: HashSet::new(),
            touch_counter: 0,
            idle_timeout: ChronoDuration::milliseconds(config.idle_timeout_ms as i64),
            heartbeat: ChronoDuration::milliseconds(config.presence.heartbeat_ms as i64),
            max_records: config.presence.max_records,
        }
    }

    /// Set the local status explicitly, clearing any idle auto-away
    pub fn set_status(&mut self, status: PresenceStatus) -> Option<ClientFrame> {
        self.my_status = status;
        self.auto_away = false;
        self.outbound_frame()
    }

    /// Set or clear the custom status line
    pub fn set_custom_status(&mut self, custom: Option<CustomStatus>) -> Option<ClientFrame> {
        self.my_custom = custom;
        self.outbound_frame()
    }

    /// Change who may observe this user's presence
    ///
    /// Tightening to `Nobody` publishes nothing; the relay treats the silence
    /// as offline.
    pub fn set_visibility(&mut self, visibility: Visibility) -> Option<ClientFrame> {
        self.my_visibility = visibility;
        self.outbound_frame()
    }

    /// Record user activity, reverting an idle auto-away to Online
    pub fn note_activity(&mut self, now: DateTime<Utc>) -> Option<ClientFrame> {
        self.last_activity = now;
        if self.auto_away {
            self.auto_away = false;
            self.my_status = PresenceStatus::Online;
            debug!("activity after idle, reverting to online");
            return self.outbound_frame();
        }
        None
    }

    pub fn status(&self) -> PresenceStatus {
        self.my_status
    }

    pub fn visibility(&self) -> Visibility {
        self.my_visibility
    }

    /// Express interest in a user's presence; subscribed records are never
    /// evicted by the record-map bound
    pub fn subscribe(&mut self, user_id: UserId) {
        self.subscriptions.insert(user_id);
    }

    pub fn unsubscribe(&mut self, user_id: &str) {
        self.subscriptions.remove(user_id);
    }

    /// Last observed record for a user, if any
    ///
    /// Callers must honor `displayable` before showing it.
    pub fn get(&mut self, user_id: &str) -> Option<PresenceRecord> {
        self.touch_counter += 1;
        let touch = self.touch_counter;
        self.records.get_mut(user_id).map(|entry| {
            entry.touch = touch;
            entry.record.clone()
        })
    }

    /// Apply a remote presence change from the relay
    pub fn apply_remote(&mut self, record: PresenceRecord) {
        let mut record = record;
        record.displayable = match record.visibility {
            Visibility::Everyone => true,
            Visibility::Contacts => self.contacts.is_contact(&record.user_id),
            Visibility::Nobody => false,
        };

        self.touch_counter += 1;
        let changed = self
            .records
            .get(&record.user_id)
            .map(|e| e.record != record)
            .unwrap_or(true);
        self.records.insert(
            record.user_id.clone(),
            RemoteEntry {
                record: record.clone(),
                touch: self.touch_counter,
            },
        );
        self.evict_over_bound();

        if changed && record.displayable {
            self.bus.publish(ClientEvent::PresenceChanged {
                user_id: record.user_id.clone(),
                record,
            });
        }
    }

    /// Periodic tick: idle auto-away, custom status expiry, and heartbeat
    /// re-assertion so the relay doesn't mark us stale
    pub fn poll(&mut self, now: DateTime<Utc>) -> Vec<ClientFrame> {
        let mut frames = Vec::new();

        if self.my_status == PresenceStatus::Online
            && now - self.last_activity >= self.idle_timeout
        {
            self.my_status = PresenceStatus::Away;
            self.auto_away = true;
            debug!("idle timeout reached, auto-away");
            frames.extend(self.outbound_frame());
        }

        if let Some(custom) = &self.my_custom {
            if custom.expires_at.is_some_and(|at| at <= now) {
                self.my_custom = None;
                frames.extend(self.outbound_frame());
            }
        }

        self.expire_remote_customs(now);

        let due = match self.last_broadcast {
            Some(at) => now - at >= self.heartbeat,
            None => true,
        };
        if due && frames.is_empty() {
            frames.extend(self.outbound_frame());
        }
        if !frames.is_empty() {
            self.last_broadcast = Some(now);
        }

        frames
    }

    fn expire_remote_customs(&mut self, now: DateTime<Utc>) {
        let mut expired = Vec::new();
        for (user_id, entry) in self.records.iter_mut() {
            let gone = entry
                .record
                .custom_status
                .as_ref()
                .and_then(|c| c.expires_at)
                .is_some_and(|at| at <= now);
            if gone {
                entry.record.custom_status = None;
                if entry.record.displayable {
                    expired.push((user_id.clone(), entry.record.clone()));
                }
            }
        }
        for (user_id, record) in expired {
            self.bus.publish(ClientEvent::PresenceChanged { user_id, record });
        }
    }

    fn outbound_frame(&mut self) -> Option<ClientFrame> {
        if self.my_visibility == Visibility::Nobody {
            return None;
        }
        self.last_broadcast = Some(Utc::now());
        Some(ClientFrame::PresenceUpdate {
            user_id: self.me.clone(),
            status: self.my_status,
            custom_status: self.my_custom.clone(),
            visibility: self.my_visibility,
        })
    }

    fn evict_over_bound(&mut self) {
        while self.records.len() > self.max_records {
            let victim = self
                .records
                .iter()
                .filter(|(user_id, _)| !self.subscriptions.contains(*user_id))
                .min_by_key(|(_, entry)| entry.touch)
                .map(|(user_id, _)| user_id.clone());
            let Some(victim) = victim else {
                break;
            };
            debug!(user = %victim, "evicting least recently touched presence record");
            self.records.remove(&victim);
        }
    }
}
