//! Typing indicators
//!
//! Outbound: keystrokes are debounced before the first `typing:start` goes
//! out, re-emissions are throttled per room, and a quiet period produces an
//! implicit `typing:stop`. Inbound: remote typers are tracked per room with
//! an expiry, so a peer that vanishes mid-keystroke never leaves a stuck
//! indicator.
//!
//! Typing state is ephemeral by contract: frames returned here are sent on
//! the live session or dropped, never queued.

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::config::Config;
use crate::events::{ClientEvent, EventBus};
use crate::wire::{ClientFrame, RoomId, UserId};

/// A remote user currently typing in a room
#[derive(Debug, Clone, PartialEq)]
pub struct TypingRecord {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug)]
struct OutgoingState {
    last_keystroke: DateTime<Utc>,
    /// First keystroke of the current burst; start emission is held until the
    /// debounce window after it passes
    pending_since: DateTime<Utc>,
    last_emit: Option<DateTime<Utc>>,
    active: bool,
}

/// Tracks local and remote typing activity
pub struct TypingTracker {
    me: UserId,
    bus: EventBus,

    outgoing: HashMap<RoomId, OutgoingState>,
    inbound: HashMap<(RoomId, UserId), TypingRecord>,

    debounce: ChronoDuration,
    throttle: ChronoDuration,
    auto_stop: ChronoDuration,
    sweep_interval: ChronoDuration,
    last_sweep: Option<DateTime<Utc>>,
}

impl TypingTracker {
    pub fn new(me: UserId, bus: EventBus, config: &Config) -> Self {
        Self {
            me,
            bus,
            outgoing: HashMap::new(),
            inbound: HashMap::new(),
            debounce: ChronoDuration::milliseconds(config.typing.debounce_ms as i64),
            throttle: ChronoDuration::milliseconds(config.typing.throttle_ms as i64),
            auto_stop: ChronoDuration::milliseconds(config.typing.auto_stop_ms as i64),
            sweep_interval: ChronoDuration::milliseconds(config.typing.sweep_interval_ms as i64),
            last_sweep: None,
        }
    }

    /// Record a local keystroke in a room
    ///
    /// Nothing is emitted here; emission timing is decided by [`poll`].
    ///
    /// [`poll`]: TypingTracker::poll
    pub fn start_typing(&mut self, room_id: RoomId, now: DateTime<Utc>) {
        self.outgoing
            .entry(room_id)
            .and_modify(|state| state.last_keystroke = now)
            .or_insert(OutgoingState {
                last_keystroke: now,
                pending_since: now,
                last_emit: None,
                active: false,
            });
    }

    /// Explicitly stop typing in a room (message sent, composer cleared)
    ///
    /// Returns the stop frame if a start had already been announced.
    pub fn stop_typing(&mut self, room_id: &str) -> Option<ClientFrame> {
        let state = self.outgoing.remove(room_id)?;
        if !state.active {
            return None;
        }
        Some(ClientFrame::TypingStop {
            room_id: room_id.to_string(),
            user_id: self.me.clone(),
        })
    }

    /// Remote users currently typing in a room, oldest first
    pub fn active_typers(&self, room_id: &str) -> Vec<UserId> {
        let mut records: Vec<&TypingRecord> = self
            .inbound
            .values()
            .filter(|r| r.room_id == room_id)
            .collect();
        records.sort_by_key(|r| (r.started_at, r.user_id.clone()));
        records.iter().map(|r| r.user_id.clone()).collect()
    }

    /// Apply a remote `typing:start`
    pub fn apply_remote_start(
        &mut self,
        room_id: RoomId,
        user_id: UserId,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        if user_id == self.me {
            return;
        }
        let key = (room_id.clone(), user_id.clone());
        let started_at = self
            .inbound
            .get(&key)
            .map(|r| r.started_at)
            .unwrap_or(now);
        let fresh = !self.inbound.contains_key(&key);
        self.inbound.insert(
            key,
            TypingRecord {
                room_id: room_id.clone(),
                user_id,
                started_at,
                expires_at: expires_at.unwrap_or(now + self.auto_stop),
            },
        );
        if fresh {
            self.publish_room_change(&room_id);
        }
    }

    /// Apply a remote `typing:stop`
    pub fn apply_remote_stop(&mut self, room_id: &str, user_id: &str) {
        if self
            .inbound
            .remove(&(room_id.to_string(), user_id.to_string()))
            .is_some()
        {
            self.publish_room_change(room_id);
        }
    }

    /// Periodic tick driving debounce, throttle, auto-stop, and inbound expiry
    pub fn poll(&mut self, now: DateTime<Utc>) -> Vec<ClientFrame> {
        let mut frames = Vec::new();
        let mut finished = Vec::new();

        for (room_id, state) in self.outgoing.iter_mut() {
            if state.active && now - state.last_keystroke >= self.auto_stop {
                frames.push(ClientFrame::TypingStop {
                    room_id: room_id.clone(),
                    user_id: self.me.clone(),
                });
                finished.push(room_id.clone());
                continue;
            }

            let emit = if !state.active {
                now - state.pending_since >= self.debounce
            } else {
                // Re-assert while keystrokes continue, at most once per throttle.
                state
                    .last_emit
                    .is_some_and(|at| now - at >= self.throttle && state.last_keystroke > at)
            };
            if emit {
                state.active = true;
                state.last_emit = Some(now);
                frames.push(ClientFrame::TypingStart {
                    room_id: room_id.clone(),
                    user_id: self.me.clone(),
                });
            }
        }
        for room_id in finished {
            self.outgoing.remove(&room_id);
        }

        // The inbound sweep runs on its own, coarser cadence; expired typers
        // linger at most one sweep interval past their expiry.
        if self
            .last_sweep
            .is_none_or(|at| now - at >= self.sweep_interval)
        {
            self.last_sweep = Some(now);
            self.sweep_inbound(now);
        }
        frames
    }

    fn sweep_inbound(&mut self, now: DateTime<Utc>) {
        let expired: Vec<(RoomId, UserId)> = self
            .inbound
            .iter()
            .filter(|(_, r)| r.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        let mut rooms: Vec<RoomId> = expired.iter().map(|(room, _)| room.clone()).collect();
        rooms.sort();
        rooms.dedup();
        for key in expired {
            self.inbound.remove(&key);
        }
        for room_id in rooms {
            self.publish_room_change(&room_id);
        }
    }

    fn publish_room_change(&self, room_id: &str) {
        self.bus.publish(ClientEvent::TypingChanged {
            room_id: room_id.to_string(),
            typers: self.active_typers(room_id),
        });
    }
}

/// Human-readable summary of who is typing
pub fn format_typers(typers: &[UserId]) -> String {
    match typers {
        [] => String::new(),
        [a] => format!("{} is typing...", a),
        [a, b] => format!("{} and {} are typing...", a, b),
        [a, b, c] => format!("{}, {}, and {} are typing...", a, b, c),
        _ => "Several people are typing...".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> Config {
        let mut config = Config::default();
        config.typing.debounce_ms = 300;
        config.typing.throttle_ms = 1_000;
        config.typing.auto_stop_ms = 5_000;
        config
    }

    fn tracker() -> (TypingTracker, EventBus) {
        let bus = EventBus::new();
        let t = TypingTracker::new("alice".to_string(), bus.clone(), &quick_config());
        (t, bus)
    }

    fn ms(n: i64) -> ChronoDuration {
        ChronoDuration::milliseconds(n)
    }

    #[test]
    fn test_start_is_debounced() {
        let (mut t, _bus) = tracker();
        let now = Utc::now();
        t.start_typing("room-1".to_string(), now);

        // Inside the debounce window nothing goes out.
        assert!(t.poll(now + ms(100)).is_empty());

        let frames = t.poll(now + ms(350));
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            &frames[0],
            ClientFrame::TypingStart { room_id, user_id }
                if room_id == "room-1" && user_id == "alice"
        ));
    }

    #[test]
    fn test_reemission_is_throttled() {
        let (mut t, _bus) = tracker();
        let now = Utc::now();
        t.start_typing("room-1".to_string(), now);
        assert_eq!(t.poll(now + ms(300)).len(), 1);

        // Continuous keystrokes, but the wire only sees one start per throttle.
        t.start_typing("room-1".to_string(), now + ms(500));
        assert!(t.poll(now + ms(600)).is_empty());
        t.start_typing("room-1".to_string(), now + ms(1_200));
        let frames = t.poll(now + ms(1_400));
        assert_eq!(frames.len(), 1);
        assert!(matches!(&frames[0], ClientFrame::TypingStart { .. }));
    }

    #[test]
    fn test_auto_stop_after_quiet_period() {
        let (mut t, _bus) = tracker();
        let now = Utc::now();
        t.start_typing("room-1".to_string(), now);
        t.poll(now + ms(300));

        let frames = t.poll(now + ms(5_400));
        assert_eq!(frames.len(), 1);
        assert!(matches!(&frames[0], ClientFrame::TypingStop { .. }));
        // Cleared; the next keystroke starts a fresh debounce cycle.
        assert!(t.poll(now + ms(5_500)).is_empty());
    }

    #[test]
    fn test_explicit_stop_only_after_announced_start() {
        let (mut t, _bus) = tracker();
        let now = Utc::now();

        // Not yet announced; nothing to retract.
        t.start_typing("room-1".to_string(), now);
        assert!(t.stop_typing("room-1").is_none());

        t.start_typing("room-1".to_string(), now);
        t.poll(now + ms(300));
        assert!(matches!(
            t.stop_typing("room-1"),
            Some(ClientFrame::TypingStop { .. })
        ));
    }

    #[test]
    fn test_inbound_typers_expire() {
        let (mut t, bus) = tracker();
        let mut events = bus.subscribe();
        let now = Utc::now();

        t.apply_remote_start("room-1".to_string(), "bob".to_string(), None, now);
        assert_eq!(t.active_typers("room-1"), vec!["bob"]);
        assert!(matches!(
            events.try_recv().unwrap(),
            ClientEvent::TypingChanged { ref typers, .. } if typers == &["bob".to_string()]
        ));

        // No stop ever arrives; the sweep clears the record at expiry.
        t.poll(now + ms(5_100));
        assert!(t.active_typers("room-1").is_empty());
        assert!(matches!(
            events.try_recv().unwrap(),
            ClientEvent::TypingChanged { ref typers, .. } if typers.is_empty()
        ));
    }

    #[test]
    fn test_inbound_sweep_honors_interval() {
        let mut config = quick_config();
        config.typing.sweep_interval_ms = 1_000;
        let bus = EventBus::new();
        let mut t = TypingTracker::new("alice".to_string(), bus, &config);
        let now = Utc::now();

        // Arm the sweep clock, then let bob's record expire quickly.
        t.poll(now);
        t.apply_remote_start(
            "room-1".to_string(),
            "bob".to_string(),
            Some(now + ms(100)),
            now,
        );

        // Expired, but the next sweep is not due yet.
        t.poll(now + ms(500));
        assert_eq!(t.active_typers("room-1"), vec!["bob"]);

        t.poll(now + ms(1_100));
        assert!(t.active_typers("room-1").is_empty());
    }

    #[test]
    fn test_remote_stop_clears_immediately() {
        let (mut t, _bus) = tracker();
        let now = Utc::now();
        t.apply_remote_start("room-1".to_string(), "bob".to_string(), None, now);
        t.apply_remote_stop("room-1", "bob");
        assert!(t.active_typers("room-1").is_empty());
    }

    #[test]
    fn test_own_echo_is_ignored() {
        let (mut t, _bus) = tracker();
        t.apply_remote_start("room-1".to_string(), "alice".to_string(), None, Utc::now());
        assert!(t.active_typers("room-1").is_empty());
    }

    #[test]
    fn test_typers_ordered_by_start_time() {
        let (mut t, _bus) = tracker();
        let now = Utc::now();
        t.apply_remote_start("room-1".to_string(), "carol".to_string(), None, now);
        t.apply_remote_start("room-1".to_string(), "bob".to_string(), None, now + ms(10));
        assert_eq!(t.active_typers("room-1"), vec!["carol", "bob"]);
    }

    #[test]
    fn test_format_typers() {
        let u = |s: &str| s.to_string();
        assert_eq!(format_typers(&[]), "");
        assert_eq!(format_typers(&[u("Ann")]), "Ann is typing...");
        assert_eq!(format_typers(&[u("Ann"), u("Bo")]), "Ann and Bo are typing...");
        assert_eq!(
            format_typers(&[u("Ann"), u("Bo"), u("Cy")]),
            "Ann, Bo, and Cy are typing..."
        );
        assert_eq!(
            format_typers(&[u("Ann"), u("Bo"), u("Cy"), u("Di")]),
            "Several people are typing..."
        );
    }
}
