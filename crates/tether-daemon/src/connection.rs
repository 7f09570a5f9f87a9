//! WebSocket connection manager.
//!
//! Owns one client connection to the sync server and keeps it healthy:
//! application-level ping/pong heartbeats, forced close when the server
//! stops answering, and reconnection with exponential backoff. State
//! transitions and incoming events are announced on the shared
//! [`EventBus`] so the sync engine and application code can react without
//! holding a reference to the socket.
//!
//! Each call to [`ConnectionManager::connect`] starts a fresh generation;
//! [`ConnectionManager::disconnect`] bumps the generation so any reconnect
//! loop still sleeping on a backoff exits instead of resurrecting a
//! connection the caller just tore down.

use crate::frame::{CLOSE_HEARTBEAT_TIMEOUT, CLOSE_NORMAL, WireFrame};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tether_core::{EventBus, ReconnectConfig, SyncEvent, reconnect_delay};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, interval, sleep, sleep_until, timeout};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::protocol::{CloseFrame, frame::coding::CloseCode},
    tungstenite::Message,
};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Callback registered for a named server event.
pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Handle for removing a listener registered with [`ConnectionManager::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(usize);

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and no reconnect pending.
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// Connected and heartbeating.
    Connected,
    /// Connection lost, waiting out the backoff before the next attempt.
    Reconnecting,
    /// The manager was dropped; terminal.
    Closed,
}

/// Connection tuning knobs.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket URL of the sync server.
    pub url: String,
    /// Interval between application-level pings.
    pub ping_interval: Duration,
    /// How long to wait for a pong before force-closing.
    pub pong_timeout: Duration,
    /// Timeout for the initial WebSocket handshake.
    pub connect_timeout: Duration,
    /// Reconnection backoff policy.
    pub reconnect: ReconnectConfig,
    /// Refuse to connect until a token has been set.
    pub require_auth: bool,
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
            require_auth: false,
        }
    }
}

enum Command {
    Send(String),
    Close(u16, String),
}

enum SessionEnd {
    /// We sent the close frame (or the command channel closed).
    LocalClose,
    /// The server closed with code 1000.
    RemoteNormal,
    /// Anything else: error, abrupt drop, heartbeat timeout.
    Abnormal { code: u16, reason: String },
}

struct Shared {
    config: ConnectionConfig,
    bus: Arc<EventBus>,
    state: RwLock<ConnectionState>,
    listeners: RwLock<HashMap<String, Vec<(usize, Listener)>>>,
    next_listener_id: AtomicUsize,
    token: RwLock<Option<String>>,
    attempts: AtomicU32,
    generation: AtomicU64,
    outbox: RwLock<Option<mpsc::UnboundedSender<Command>>>,
}

impl Shared {
    fn stale(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) != generation
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn connect_url(&self) -> String {
        let token = self
            .token
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match token {
            Some(token) if !token.is_empty() => {
                let sep = if self.config.url.contains('?') { '&' } else { '?' };
                format!("{}{}token={}", self.config.url, sep, token)
            }
            _ => self.config.url.clone(),
        }
    }

    /// Invoke listeners for a named event, then republish it on the bus.
    /// A panicking listener is logged and never takes the session down.
    fn dispatch(&self, name: &str, data: &Value) {
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(data))).is_err() {
                error!(event = name, "event listener panicked");
            }
        }

        self.bus.emit(SyncEvent::Custom {
            name: format!("connection:{name}"),
            payload: data.clone(),
        });
    }
}

/// Manages the client connection to the sync server.
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, bus: Arc<EventBus>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                bus,
                state: RwLock::new(ConnectionState::Disconnected),
                listeners: RwLock::new(HashMap::new()),
                next_listener_id: AtomicUsize::new(0),
                token: RwLock::new(None),
                attempts: AtomicU32::new(0),
                generation: AtomicU64::new(0),
                outbox: RwLock::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Set (or clear) the auth token appended to the connect URL. Takes
    /// effect on the next connect attempt.
    pub fn set_token(&self, token: Option<String>) {
        *self.shared.token.write().unwrap_or_else(|e| e.into_inner()) = token;
    }

    /// Start connecting. No-op when already `Connected` or `Connecting`, or
    /// when auth is required and no token has been set. Calling this while
    /// `Reconnecting` skips the remaining backoff and attempts immediately.
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) {
        if self.shared.config.require_auth
            && self
                .shared
                .token
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .is_none()
        {
            warn!("connect ignored: auth required but no token set");
            return;
        }
        {
            let mut state = self.shared.state.write().unwrap_or_else(|e| e.into_inner());
            match *state {
                ConnectionState::Connecting | ConnectionState::Connected => {
                    debug!(state = ?*state, "connect ignored, already active");
                    return;
                }
                // A manual connect during backoff supersedes the waiting
                // loop: the generation bump below makes it exit, and we
                // attempt immediately instead of waiting out the delay.
                _ => *state = ConnectionState::Connecting,
            }
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.attempts.store(0, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            run(shared, generation).await;
        });
    }

    /// Tear the connection down with the given close code. No reconnect
    /// follows, even if a backoff was pending.
    pub fn disconnect(&self, code: u16, reason: &str) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        let outbox = self
            .shared
            .outbox
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(tx) = outbox {
            let _ = tx.send(Command::Close(code, reason.to_string()));
        }
        self.shared.set_state(ConnectionState::Disconnected);
        info!(code, reason, "disconnected");
        self.shared.bus.emit(SyncEvent::Disconnected {
            code,
            reason: reason.to_string(),
        });
    }

    /// Send an application event to the server. Returns false when not
    /// connected; nothing is queued here (the sync engine owns durable
    /// queueing).
    pub fn send(&self, event: &str, data: Value) -> bool {
        if self.state() != ConnectionState::Connected {
            return false;
        }
        let outbox = self.shared.outbox.read().unwrap_or_else(|e| e.into_inner());
        match outbox.as_ref() {
            Some(tx) => tx
                .send(Command::Send(WireFrame::event(event, data).to_text()))
                .is_ok(),
            None => false,
        }
    }

    /// Register a listener for a named server event.
    pub fn on(
        &self,
        event: &str,
        listener: impl Fn(&Value) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.shared.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.shared
            .listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(listener)));
        ListenerId(id)
    }

    /// Remove a previously registered listener. Unknown ids are a no-op.
    pub fn off(&self, event: &str, id: ListenerId) {
        let mut listeners = self
            .shared
            .listeners
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(entries) = listeners.get_mut(event) {
            entries.retain(|(i, _)| *i != id.0);
        }
    }
}

impl Drop for ConnectionManager {
    /// Abandon any live session or reconnect loop still holding the shared
    /// state.
    fn drop(&mut self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = self
            .shared
            .outbox
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = tx.send(Command::Close(CLOSE_NORMAL, "shutdown".to_string()));
        }
        self.shared.set_state(ConnectionState::Closed);
    }
}

/// Connect/session/reconnect loop for one generation. Exits as soon as the
/// generation goes stale (a newer connect or a disconnect superseded us).
async fn run(shared: Arc<Shared>, generation: u64) {
    loop {
        if shared.stale(generation) {
            return;
        }

        let url = shared.connect_url();
        debug!(url = %shared.config.url, "connecting");
        let connected = match timeout(shared.config.connect_timeout, connect_async(url.as_str()))
            .await
        {
            Ok(Ok((ws, _response))) => Some(ws),
            Ok(Err(err)) => {
                warn!("connect failed: {err}");
                shared.bus.emit(SyncEvent::ConnectionError {
                    message: err.to_string(),
                });
                None
            }
            Err(_) => {
                warn!("connect timed out");
                shared.bus.emit(SyncEvent::ConnectionError {
                    message: "connect timed out".into(),
                });
                None
            }
        };
        if shared.stale(generation) {
            return;
        }

        if let Some(ws) = connected {
            let (tx, rx) = mpsc::unbounded_channel();
            *shared.outbox.write().unwrap_or_else(|e| e.into_inner()) = Some(tx);
            shared.attempts.store(0, Ordering::SeqCst);
            shared.set_state(ConnectionState::Connected);
            info!(url = %shared.config.url, "connected");
            shared.bus.emit(SyncEvent::Connected);

            let end = session(&shared, ws, rx).await;
            *shared.outbox.write().unwrap_or_else(|e| e.into_inner()) = None;
            if shared.stale(generation) {
                return;
            }

            match end {
                SessionEnd::LocalClose => {
                    // disconnect() already set the state and announced it.
                    return;
                }
                SessionEnd::RemoteNormal => {
                    info!("server closed the connection");
                    shared.set_state(ConnectionState::Disconnected);
                    shared.bus.emit(SyncEvent::Disconnected {
                        code: CLOSE_NORMAL,
                        reason: "closed by server".into(),
                    });
                    return;
                }
                SessionEnd::Abnormal { code, reason } => {
                    warn!(code, %reason, "connection lost");
                    shared.bus.emit(SyncEvent::Disconnected { code, reason });
                }
            }
        }

        let attempt = shared.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(max) = shared.config.reconnect.max_attempts {
            if attempt > max {
                error!(attempts = max, "giving up on reconnection");
                shared.set_state(ConnectionState::Disconnected);
                shared.bus.emit(SyncEvent::ReconnectFailed { attempts: max });
                return;
            }
        }
        shared.set_state(ConnectionState::Reconnecting);
        let delay = reconnect_delay(attempt, &shared.config.reconnect);
        debug!(attempt, ?delay, "reconnecting after backoff");
        sleep(delay).await;
    }
}

/// Drive one established connection until it ends.
///
/// The heartbeat arms at most one pong deadline at a time: a later ping
/// never extends a deadline the server is already failing to meet.
async fn session(
    shared: &Arc<Shared>,
    ws: WsStream,
    mut rx: mpsc::UnboundedReceiver<Command>,
) -> SessionEnd {
    let (mut sink, mut stream) = ws.split();
    let mut ping_timer = interval(shared.config.ping_interval);
    ping_timer.tick().await; // the first tick fires immediately
    let mut pong_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(Command::Send(text)) => {
                    if let Err(err) = sink.send(Message::Text(text)).await {
                        return SessionEnd::Abnormal {
                            code: 1006,
                            reason: format!("send failed: {err}"),
                        };
                    }
                }
                Some(Command::Close(code, reason)) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    let _ = sink.flush().await;
                    return SessionEnd::LocalClose;
                }
                None => return SessionEnd::LocalClose,
            },

            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => match WireFrame::parse(&text) {
                    Some(WireFrame::Ping) => {
                        if sink.send(Message::Text(WireFrame::Pong.to_text())).await.is_err() {
                            return SessionEnd::Abnormal {
                                code: 1006,
                                reason: "pong send failed".into(),
                            };
                        }
                    }
                    Some(WireFrame::Pong) => pong_deadline = None,
                    Some(WireFrame::Event { name, data }) => shared.dispatch(&name, &data),
                    None => warn!("dropping unparseable frame: {text}"),
                },
                // Protocol-level heartbeats count too.
                Some(Ok(Message::Ping(payload))) => {
                    let _ = sink.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Pong(_))) => pong_deadline = None,
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.into_owned()))
                        .unwrap_or((1005, String::new()));
                    if code == CLOSE_NORMAL {
                        return SessionEnd::RemoteNormal;
                    }
                    return SessionEnd::Abnormal { code, reason };
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    shared.bus.emit(SyncEvent::ConnectionError {
                        message: err.to_string(),
                    });
                    return SessionEnd::Abnormal {
                        code: 1006,
                        reason: err.to_string(),
                    };
                }
                None => {
                    return SessionEnd::Abnormal {
                        code: 1006,
                        reason: "stream ended".into(),
                    };
                }
            },

            _ = ping_timer.tick() => {
                if sink.send(Message::Text(WireFrame::Ping.to_text())).await.is_err() {
                    return SessionEnd::Abnormal {
                        code: 1006,
                        reason: "ping send failed".into(),
                    };
                }
                if pong_deadline.is_none() {
                    pong_deadline = Some(Instant::now() + shared.config.pong_timeout);
                }
            },

            _ = wait_until(pong_deadline), if pong_deadline.is_some() => {
                warn!("heartbeat timed out, forcing close");
                let frame = CloseFrame {
                    code: CloseCode::from(CLOSE_HEARTBEAT_TIMEOUT),
                    reason: "heartbeat timeout".into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                return SessionEnd::Abnormal {
                    code: CLOSE_HEARTBEAT_TIMEOUT,
                    reason: "heartbeat timeout".into(),
                };
            },
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
