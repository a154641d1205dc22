//! Transport session
//!
//! A background task owns the connection and its whole lifecycle: dial,
//! challenge-response auth, heartbeats, and backoff reconnect. Callers hold a
//! [`SessionHandle`] and talk to the task over a command channel; connection
//! state is published on a watch channel and inbound frames are forwarded, in
//! arrival order, on an unbounded channel the client facade routes.
//!
//! Error classification drives the loop: transient failures reconnect with
//! jittered exponential backoff, authentication failures park the session in
//! `Failed` until the caller re-connects with fresh credentials.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::config::Config;
use crate::error::{AuthError, TransportError};
use crate::events::{ClientEvent, EventBus};
use crate::transport::conn::{Conn, Connector};
use crate::wire::{ClientFrame, ServerFrame};

/// Auth handshake must finish this quickly or the attempt counts as failed
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Unanswered heartbeats tolerated before the link is declared dead
const MAX_MISSED_PONGS: u32 = 3;

/// Observable connection state
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Socket open, auth handshake in progress
    Connected,
    /// Handshake complete; the session is usable
    Authenticated,
    Reconnecting { attempt: u32, next_delay: Duration },
    /// Deliberately offline; no reconnect attempts
    Offline,
    /// Needs caller action (bad credentials, attempts exhausted)
    Failed(String),
}

/// Produces the auth token for the handshake
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn token(&self) -> Result<String, AuthError>;
}

/// Fixed token, typically from config or TETHER_TOKEN
pub struct StaticCredentials {
    token: String,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn token(&self) -> Result<String, AuthError> {
        Ok(self.token.clone())
    }
}

enum SessionCommand {
    Send(ClientFrame, oneshot::Sender<Result<(), TransportError>>),
    Connect,
    Disconnect,
    GoOffline,
    Shutdown,
}

/// Handle to the session task
#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    latency_rx: watch::Receiver<Option<Duration>>,
}

impl SessionHandle {
    /// Send a frame on the live connection
    ///
    /// Fails with `NotConnected` when there is no authenticated session;
    /// durable traffic belongs in the offline queue, not here.
    pub async fn send(&self, frame: ClientFrame) -> Result<(), TransportError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::Send(frame, tx))
            .map_err(|_| TransportError::NotConnected)?;
        rx.await.map_err(|_| TransportError::NotConnected)?
    }

    /// Ask the task to connect and wait for the handshake to settle
    pub async fn connect(&self) -> Result<(), TransportError> {
        self.cmd_tx
            .send(SessionCommand::Connect)
            .map_err(|_| TransportError::NotConnected)?;

        let mut rx = self.state_rx.clone();
        // A stale Failed from an earlier attempt may still be in the watch
        // channel; only accept Failed once this attempt has visibly started.
        let mut attempt_seen = false;
        loop {
            {
                let state = rx.borrow_and_update().clone();
                match state {
                    ConnectionState::Authenticated => return Ok(()),
                    ConnectionState::Connecting
                    | ConnectionState::Connected
                    | ConnectionState::Reconnecting { .. } => attempt_seen = true,
                    ConnectionState::Failed(msg) if attempt_seen => {
                        return Err(TransportError::Connect(msg));
                    }
                    _ => {}
                }
            }
            if rx.changed().await.is_err() {
                return Err(TransportError::Closed);
            }
        }
    }

    pub fn disconnect(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Disconnect);
    }

    /// Stop reconnecting until the next explicit connect
    pub fn go_offline(&self) {
        let _ = self.cmd_tx.send(SessionCommand::GoOffline);
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Shutdown);
    }

    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.state(), ConnectionState::Authenticated)
    }

    /// Round-trip time measured by the last answered heartbeat, if any
    ///
    /// Cleared when a new connection is established.
    pub fn latency(&self) -> Option<Duration> {
        *self.latency_rx.borrow()
    }
}

/// Spawn the session task
pub fn spawn_session(
    config: &Config,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialProvider>,
    bus: EventBus,
    inbound_tx: mpsc::UnboundedSender<ServerFrame>,
) -> SessionHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
    let (latency_tx, latency_rx) = watch::channel(None);

    let task = SessionTask {
        relay_url: config.relay_url.clone().unwrap_or_default(),
        connector,
        credentials,
        bus,
        inbound_tx,
        state_tx,
        latency_tx,
        cmd_rx,
        backoff: config.backoff_policy(),
        heartbeat: config.heartbeat_interval(),
    };
    tokio::spawn(task.run());

    SessionHandle {
        cmd_tx,
        state_rx,
        latency_rx,
    }
}

enum Served {
    Shutdown,
    Disconnect,
    Offline,
    /// Connection lost; reconnect with backoff
    Lost,
    /// Unrecoverable; park in Failed
    Fatal(String),
}

enum BackoffWait {
    Elapsed,
    Shutdown,
    Disconnect,
    Offline,
    /// Attempt cap reached; state already set to Failed
    Exhausted,
}

struct SessionTask {
    relay_url: String,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialProvider>,
    bus: EventBus,
    inbound_tx: mpsc::UnboundedSender<ServerFrame>,
    state_tx: watch::Sender<ConnectionState>,
    latency_tx: watch::Sender<Option<Duration>>,
    cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
    backoff: BackoffPolicy,
    heartbeat: Duration,
}

impl SessionTask {
    async fn run(mut self) {
        let mut want_connection = false;
        let mut attempt: u32 = 0;

        loop {
            if !want_connection {
                match self.cmd_rx.recv().await {
                    None | Some(SessionCommand::Shutdown) => return,
                    Some(SessionCommand::Connect) => {
                        want_connection = true;
                        attempt = 0;
                    }
                    Some(SessionCommand::Send(_, reply)) => {
                        let _ = reply.send(Err(TransportError::NotConnected));
                    }
                    Some(SessionCommand::Disconnect) | Some(SessionCommand::GoOffline) => {}
                }
                continue;
            }

            self.set_state(ConnectionState::Connecting);
            let conn = match self.establish().await {
                Ok(conn) => conn,
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "connection attempt failed");
                    match self.backoff_wait(&mut attempt).await {
                        BackoffWait::Elapsed => continue,
                        BackoffWait::Shutdown => return,
                        BackoffWait::Disconnect => {
                            want_connection = false;
                            self.set_state(ConnectionState::Disconnected);
                            continue;
                        }
                        BackoffWait::Offline => {
                            want_connection = false;
                            self.set_state(ConnectionState::Offline);
                            continue;
                        }
                        BackoffWait::Exhausted => {
                            want_connection = false;
                            continue;
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "connection failed fatally");
                    want_connection = false;
                    self.set_state(ConnectionState::Failed(e.to_string()));
                    continue;
                }
            };

            info!("session authenticated");
            attempt = 0;
            self.set_state(ConnectionState::Authenticated);
            self.bus.publish(ClientEvent::Connected);

            match self.serve(conn).await {
                Served::Shutdown => return,
                Served::Disconnect => {
                    want_connection = false;
                    self.set_state(ConnectionState::Disconnected);
                    self.bus.publish(ClientEvent::Disconnected);
                }
                Served::Offline => {
                    want_connection = false;
                    self.set_state(ConnectionState::Offline);
                    self.bus.publish(ClientEvent::Disconnected);
                }
                Served::Fatal(msg) => {
                    want_connection = false;
                    self.set_state(ConnectionState::Failed(msg));
                    self.bus.publish(ClientEvent::Disconnected);
                }
                Served::Lost => {
                    self.bus.publish(ClientEvent::Disconnected);
                    match self.backoff_wait(&mut attempt).await {
                        BackoffWait::Elapsed => {}
                        BackoffWait::Shutdown => return,
                        BackoffWait::Disconnect => {
                            want_connection = false;
                            self.set_state(ConnectionState::Disconnected);
                        }
                        BackoffWait::Offline => {
                            want_connection = false;
                            self.set_state(ConnectionState::Offline);
                        }
                        BackoffWait::Exhausted => {
                            want_connection = false;
                        }
                    }
                }
            }
        }
    }

    /// Dial and run the challenge-response handshake
    async fn establish(&mut self) -> Result<Box<dyn Conn>, TransportError> {
        let mut conn = self.connector.connect(&self.relay_url).await?;
        self.set_state(ConnectionState::Connected);

        match tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            Self::handshake(&mut conn, self.credentials.as_ref()),
        )
        .await
        {
            Ok(Ok(())) => Ok(conn),
            Ok(Err(e)) => {
                conn.close().await;
                Err(e)
            }
            Err(_) => {
                conn.close().await;
                Err(TransportError::HandshakeTimeout)
            }
        }
    }

    async fn handshake(
        conn: &mut Box<dyn Conn>,
        credentials: &dyn CredentialProvider,
    ) -> Result<(), TransportError> {
        loop {
            match conn.recv().await {
                Some(Ok(ServerFrame::AuthChallenge { nonce })) => {
                    let token = credentials.token().await?;
                    conn.send(ClientFrame::AuthResponse { nonce, token }).await?;
                }
                Some(Ok(ServerFrame::AuthOk { session_id })) => {
                    debug!(session_id, "handshake complete");
                    return Ok(());
                }
                Some(Ok(ServerFrame::AuthFailed { message })) => {
                    return Err(AuthError::Rejected(message).into());
                }
                Some(Ok(other)) => {
                    // The relay shouldn't chat before auth completes; skip it.
                    debug!(frame = ?other, "ignoring pre-auth frame");
                }
                Some(Err(e)) => return Err(e),
                None => return Err(TransportError::Closed),
            }
        }
    }

    /// Drive one authenticated connection until it ends
    async fn serve(&mut self, mut conn: Box<dyn Conn>) -> Served {
        let mut heartbeat = tokio::time::interval(self.heartbeat);
        // The first tick fires immediately; skip it so pings start one
        // interval in.
        heartbeat.tick().await;
        let mut seq: u64 = 0;
        let mut missed: u32 = 0;
        // A fresh connection has no measurement yet.
        let _ = self.latency_tx.send(None);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    None | Some(SessionCommand::Shutdown) => {
                        conn.close().await;
                        return Served::Shutdown;
                    }
                    Some(SessionCommand::Disconnect) => {
                        conn.close().await;
                        return Served::Disconnect;
                    }
                    Some(SessionCommand::GoOffline) => {
                        conn.close().await;
                        return Served::Offline;
                    }
                    Some(SessionCommand::Connect) => {}
                    Some(SessionCommand::Send(frame, reply)) => {
                        let result = conn.send(frame).await;
                        let lost = matches!(&result, Err(e) if e.is_transient());
                        let _ = reply.send(result);
                        if lost {
                            return Served::Lost;
                        }
                    }
                },
                inbound = conn.recv() => match inbound {
                    None => return Served::Lost,
                    Some(Err(e)) if e.is_transient() => {
                        warn!(error = %e, "connection error");
                        return Served::Lost;
                    }
                    Some(Err(e)) => return Served::Fatal(e.to_string()),
                    Some(Ok(ServerFrame::HeartbeatPong { sent_at, .. })) => {
                        // The pong echoes the ping's timestamp.
                        let rtt = (Utc::now() - sent_at).to_std().unwrap_or_default();
                        debug!(rtt_ms = rtt.as_millis() as u64, "heartbeat answered");
                        let _ = self.latency_tx.send(Some(rtt));
                        missed = 0;
                    }
                    Some(Ok(ServerFrame::AuthFailed { message })) => {
                        // Mid-session revocation.
                        return Served::Fatal(message);
                    }
                    Some(Ok(frame)) => {
                        let _ = self.inbound_tx.send(frame);
                    }
                },
                _ = heartbeat.tick() => {
                    if missed >= MAX_MISSED_PONGS {
                        warn!(missed, "heartbeats unanswered, dropping connection");
                        conn.close().await;
                        return Served::Lost;
                    }
                    seq += 1;
                    missed += 1;
                    let ping = ClientFrame::HeartbeatPing { seq, sent_at: Utc::now() };
                    if conn.send(ping).await.is_err() {
                        return Served::Lost;
                    }
                },
            }
        }
    }

    /// Sleep out one backoff delay while staying responsive to commands
    async fn backoff_wait(&mut self, attempt: &mut u32) -> BackoffWait {
        if self.backoff.exhausted(*attempt) {
            warn!(attempts = *attempt, "reconnect attempts exhausted");
            self.set_state(ConnectionState::Failed(
                "reconnect attempts exhausted".to_string(),
            ));
            return BackoffWait::Exhausted;
        }

        let delay = self.backoff.delay(*attempt);
        *attempt += 1;
        self.set_state(ConnectionState::Reconnecting {
            attempt: *attempt,
            next_delay: delay,
        });
        self.bus.publish(ClientEvent::Reconnecting {
            attempt: *attempt,
            next_delay: delay,
        });
        debug!(attempt = *attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return BackoffWait::Elapsed,
                cmd = self.cmd_rx.recv() => match cmd {
                    None | Some(SessionCommand::Shutdown) => return BackoffWait::Shutdown,
                    Some(SessionCommand::Disconnect) => return BackoffWait::Disconnect,
                    Some(SessionCommand::GoOffline) => return BackoffWait::Offline,
                    // Explicit connect skips the rest of the wait.
                    Some(SessionCommand::Connect) => return BackoffWait::Elapsed,
                    Some(SessionCommand::Send(_, reply)) => {
                        let _ = reply.send(Err(TransportError::NotConnected));
                    }
                },
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::conn::{channel_conn, ChannelConnector, RelayEnd};

    fn test_config() -> Config {
        let mut config = Config::default();
        config.relay_url = Some("test://relay".to_string());
        config.reconnect.base_delay_ms = 5;
        config.reconnect.max_delay_ms = 20;
        config.reconnect.max_attempts = 3;
        config.heartbeat_interval_ms = 60_000;
        config
    }

    /// Scripted relay: complete the handshake, then keep the end alive
    fn accept_auth(mut relay: RelayEnd, expect_token: &'static str) -> tokio::task::JoinHandle<RelayEnd> {
        tokio::spawn(async move {
            relay
                .to_client
                .send(ServerFrame::AuthChallenge { nonce: "n1".into() })
                .unwrap();
            match relay.from_client.recv().await.unwrap() {
                ClientFrame::AuthResponse { nonce, token } => {
                    assert_eq!(nonce, "n1");
                    assert_eq!(token, expect_token);
                }
                other => panic!("expected auth response, got {:?}", other),
            }
            relay
                .to_client
                .send(ServerFrame::AuthOk { session_id: "s1".into() })
                .unwrap();
            relay
        })
    }

    fn spawn_test_session(
        connector: Arc<ChannelConnector>,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<ServerFrame>, EventBus) {
        let bus = EventBus::new();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let handle = spawn_session(
            &test_config(),
            connector,
            Arc::new(StaticCredentials::new("tok-1")),
            bus.clone(),
            inbound_tx,
        );
        (handle, inbound_rx, bus)
    }

    #[tokio::test]
    async fn test_connect_runs_handshake() {
        let connector = Arc::new(ChannelConnector::new());
        let (conn, relay) = channel_conn();
        connector.push(conn);
        let relay_task = accept_auth(relay, "tok-1");

        let (handle, _inbound, _bus) = spawn_test_session(connector);
        handle.connect().await.unwrap();
        assert!(handle.is_authenticated());

        let _relay = relay_task.await.unwrap();
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_auth_rejection_parks_in_failed() {
        let connector = Arc::new(ChannelConnector::new());
        let (conn, mut relay) = channel_conn();
        connector.push(conn);

        tokio::spawn(async move {
            relay
                .to_client
                .send(ServerFrame::AuthChallenge { nonce: "n1".into() })
                .unwrap();
            let _ = relay.from_client.recv().await;
            relay
                .to_client
                .send(ServerFrame::AuthFailed { message: "bad token".into() })
                .unwrap();
            // Keep the relay end alive until the session gives up.
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let (handle, _inbound, _bus) = spawn_test_session(connector);
        let err = handle.connect().await.unwrap_err();
        assert!(err.to_string().contains("bad token"));
        assert!(matches!(handle.state(), ConnectionState::Failed(_)));
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_inbound_frames_forwarded_in_order() {
        let connector = Arc::new(ChannelConnector::new());
        let (conn, relay) = channel_conn();
        connector.push(conn);
        let relay_task = accept_auth(relay, "tok-1");

        let (handle, mut inbound, _bus) = spawn_test_session(connector);
        handle.connect().await.unwrap();
        let relay = relay_task.await.unwrap();

        relay
            .to_client
            .send(ServerFrame::TypingStart {
                room_id: "r".into(),
                user_id: "bob".into(),
                expires_at: None,
            })
            .unwrap();
        relay
            .to_client
            .send(ServerFrame::TypingStop {
                room_id: "r".into(),
                user_id: "bob".into(),
            })
            .unwrap();

        assert!(matches!(
            inbound.recv().await.unwrap(),
            ServerFrame::TypingStart { .. }
        ));
        assert!(matches!(
            inbound.recv().await.unwrap(),
            ServerFrame::TypingStop { .. }
        ));
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_heartbeat_pong_updates_latency() {
        let connector = Arc::new(ChannelConnector::new());
        let (conn, relay) = channel_conn();
        connector.push(conn);
        let relay_task = accept_auth(relay, "tok-1");

        let mut config = test_config();
        config.heartbeat_interval_ms = 20;
        let bus = EventBus::new();
        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let handle = spawn_session(
            &config,
            connector,
            Arc::new(StaticCredentials::new("tok-1")),
            bus,
            inbound_tx,
        );

        handle.connect().await.unwrap();
        assert!(handle.latency().is_none());
        let mut relay = relay_task.await.unwrap();

        // Echo each ping's timestamp back, like the relay does.
        tokio::spawn(async move {
            while let Some(frame) = relay.from_client.recv().await {
                if let ClientFrame::HeartbeatPing { seq, sent_at } = frame {
                    let _ = relay
                        .to_client
                        .send(ServerFrame::HeartbeatPong { seq, sent_at });
                }
            }
        });

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if handle.latency().is_some() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("no latency measurement recorded");
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let connector = Arc::new(ChannelConnector::new());
        let (handle, _inbound, _bus) = spawn_test_session(connector);

        let err = handle
            .send(ClientFrame::TypingStart {
                room_id: "r".into(),
                user_id: "alice".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_lost_connection_reconnects_with_backoff() {
        let connector = Arc::new(ChannelConnector::new());
        let (first, first_relay) = channel_conn();
        let (second, second_relay) = channel_conn();
        connector.push(first);
        connector.push(second);

        let first_task = accept_auth(first_relay, "tok-1");
        let second_task = accept_auth(second_relay, "tok-1");

        let (handle, _inbound, bus) = spawn_test_session(connector);
        handle.connect().await.unwrap();
        let mut events = bus.subscribe();

        // Drop the first relay end; the session must notice and redial.
        drop(first_task.await.unwrap());

        let mut saw_reconnecting = false;
        loop {
            match tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("reconnect cycle stalled")
                .unwrap()
            {
                ClientEvent::Reconnecting { attempt, .. } => {
                    assert!(attempt >= 1);
                    saw_reconnecting = true;
                }
                ClientEvent::Connected => break,
                _ => {}
            }
        }
        assert!(saw_reconnecting);
        assert!(handle.is_authenticated());

        let _relay = second_task.await.unwrap();
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_exhausted_reconnects_fail() {
        let connector = Arc::new(ChannelConnector::new());
        let (conn, relay) = channel_conn();
        connector.push(conn);
        let relay_task = accept_auth(relay, "tok-1");

        let (handle, _inbound, _bus) = spawn_test_session(connector);
        handle.connect().await.unwrap();
        // No more conns queued; every redial fails until attempts run out.
        drop(relay_task.await.unwrap());

        let mut rx = handle.watch_state();
        let failed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if matches!(&*rx.borrow(), ConnectionState::Failed(_)) {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await
        .unwrap();
        assert!(failed);
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_go_offline_stops_reconnecting() {
        let connector = Arc::new(ChannelConnector::new());
        let (conn, relay) = channel_conn();
        connector.push(conn);
        let relay_task = accept_auth(relay, "tok-1");

        let (handle, _inbound, _bus) = spawn_test_session(connector);
        handle.connect().await.unwrap();
        let relay = relay_task.await.unwrap();

        handle.go_offline();
        let mut rx = handle.watch_state();
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if *rx.borrow() == ConnectionState::Offline {
                    return;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        drop(relay);
        handle.shutdown();
    }
}
