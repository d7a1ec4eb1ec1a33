use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::channel::Channel;
use crate::config::{BrokerSettings, ConnectionSettings};
use crate::transport::backoff::ReconnectBackoff;
use crate::transport::event::{ConnectionState, SessionEvent};
use crate::utils::error::{ChannelError, ConnectionError};
use crate::wire::Frame;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Broker location and credentials, supplied via configuration rather than
/// hardcoded in the roles.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub username: String,
    pub password: String,
}

impl Endpoint {
    pub fn from_settings(settings: &BrokerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            vhost: settings.vhost.clone(),
            username: settings.username.clone(),
            password: settings.password.clone(),
        }
    }

    pub(crate) fn url(&self) -> String {
        format!("ws://{}:{}/", self.host, self.port)
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::from_settings(&BrokerSettings::default())
    }
}

/// Tunables for the session's recovery behavior.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub backoff: ReconnectBackoff,
    /// Reconnect attempts before the session gives up. `None` retries
    /// forever.
    pub max_reconnect_attempts: Option<u32>,
    /// Fail sends immediately while disconnected instead of queueing them
    /// locally until recovery.
    pub fail_fast: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            backoff: ReconnectBackoff::default(),
            max_reconnect_attempts: None,
            fail_fast: false,
        }
    }
}

impl SessionOptions {
    pub fn from_settings(settings: &ConnectionSettings) -> Self {
        Self {
            backoff: ReconnectBackoff {
                first: std::time::Duration::from_millis(settings.retry_base_ms),
                cap: std::time::Duration::from_millis(settings.retry_cap_ms),
                ..ReconnectBackoff::default()
            },
            max_reconnect_attempts: settings.max_reconnect_attempts,
            fail_fast: settings.fail_fast,
        }
    }
}

struct SessionInner {
    /// Single-writer send path; every outbound frame from any caller is
    /// serialized through here onto the socket, tagged with the epoch it
    /// was queued under so stale frames can be dropped after a recovery.
    outbound: mpsc::UnboundedSender<(u64, Frame)>,
    /// Inbound routing table: channel id to the channel's frame queue.
    /// Cleared on disconnect, which is what invalidates old channels.
    routes: Mutex<HashMap<u16, mpsc::UnboundedSender<Frame>>>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<SessionEvent>,
    /// Bumped on every successful reconnect. Channels capture the epoch
    /// they were opened under.
    epoch: AtomicU64,
    next_channel: AtomicU32,
    close_reason: Mutex<Option<String>>,
    shutdown: watch::Sender<bool>,
    fail_fast: bool,
}

/// A logical connection to the broker.
///
/// The session owns the socket exclusively: one background task drives all
/// socket I/O, reconnecting with backoff when the link drops. Clones are
/// cheap handles onto the same connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Connects and authenticates against the broker, then spawns the
    /// background task that owns the link for the session's lifetime.
    pub async fn connect(
        endpoint: Endpoint,
        options: SessionOptions,
    ) -> Result<Session, ConnectionError> {
        let socket = handshake(&endpoint).await?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let (events_tx, _) = broadcast::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(SessionInner {
            outbound: outbound_tx,
            routes: Mutex::new(HashMap::new()),
            state: state_tx,
            events: events_tx,
            epoch: AtomicU64::new(1),
            next_channel: AtomicU32::new(1),
            close_reason: Mutex::new(None),
            shutdown: shutdown_tx,
            fail_fast: options.fail_fast,
        });

        let _ = inner.state.send(ConnectionState::Connected);
        let _ = inner.events.send(SessionEvent::Connected);
        info!(host = %endpoint.host, port = endpoint.port, "connected to broker");

        tokio::spawn(run_session(
            inner.clone(),
            socket,
            outbound_rx,
            shutdown_rx,
            endpoint,
            options,
        ));

        Ok(Session { inner })
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// The current connection epoch; starts at 1 and increases by one on
    /// every successful recovery.
    pub fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    /// Subscribe to lifecycle events. Only events emitted after the call
    /// are observed; use [`Session::state`] for the current picture.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Opens a new channel on this session. Channels are a client-side
    /// construct; the broker learns about one when it first sees a frame
    /// carrying its id, so opening is purely local.
    pub fn open_channel(&self) -> Result<Channel, ChannelError> {
        if self.state() == ConnectionState::Disconnected {
            return Err(ChannelError::Disconnected);
        }
        let id = self.inner.next_channel.fetch_add(1, Ordering::Relaxed) as u16;
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.routes.lock().unwrap().insert(id, tx);
        Ok(Channel::new(self.clone(), id, self.epoch(), rx))
    }

    /// Queue a frame onto the send path. With `fail_fast` the call errors
    /// while the link is down; otherwise frames queue locally and are
    /// flushed after recovery — except channel-scoped non-publish frames,
    /// which die with the epoch they were queued under.
    pub(crate) fn send_frame(&self, frame: Frame) -> Result<(), ChannelError> {
        if self.inner.fail_fast && self.state() != ConnectionState::Connected {
            return Err(ChannelError::Disconnected);
        }
        self.inner
            .outbound
            .send((self.epoch(), frame))
            .map_err(|_| ChannelError::Disconnected)
    }

    pub(crate) fn deregister_channel(&self, id: u16) {
        self.inner.routes.lock().unwrap().remove(&id);
    }

    /// Resolves once the session is connected; errors if it is permanently
    /// closed instead.
    pub async fn wait_connected(&self) -> Result<(), ConnectionError> {
        let mut rx = self.inner.state.subscribe();
        loop {
            match *rx.borrow_and_update() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Disconnected => {
                    return Err(ConnectionError::Closed(self.close_reason()));
                }
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(ConnectionError::Closed(self.close_reason()));
            }
        }
    }

    /// Graceful shutdown: flushes locally queued frames, closes the socket
    /// and resolves once the background task has finished.
    pub async fn close(&self) {
        let _ = self.inner.shutdown.send(true);
        self.closed().await;
    }

    /// Resolves when the session reaches its terminal state, returning the
    /// close reason.
    pub async fn closed(&self) -> String {
        let mut rx = self.inner.state.subscribe();
        loop {
            if *rx.borrow_and_update() == ConnectionState::Disconnected {
                return self.close_reason();
            }
            if rx.changed().await.is_err() {
                return self.close_reason();
            }
        }
    }

    fn close_reason(&self) -> String {
        self.inner
            .close_reason
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| "session closed".to_string())
    }
}

enum LinkOutcome {
    Shutdown,
    Lost,
}

async fn run_session(
    inner: Arc<SessionInner>,
    mut socket: WsStream,
    mut outbound: mpsc::UnboundedReceiver<(u64, Frame)>,
    mut shutdown: watch::Receiver<bool>,
    endpoint: Endpoint,
    options: SessionOptions,
) {
    loop {
        match drive_connection(&inner, &mut socket, &mut outbound, &mut shutdown).await {
            LinkOutcome::Shutdown => {
                flush_pending(&inner, &mut socket, &mut outbound).await;
                let _ = socket.close(None).await;
                finish(&inner, "clean shutdown");
                return;
            }
            LinkOutcome::Lost => {
                let _ = inner.state.send(ConnectionState::Recovering);
                let _ = inner.events.send(SessionEvent::Disconnected);
                // Dropping the routes is what turns every open channel
                // stale: their inbound streams end immediately.
                inner.routes.lock().unwrap().clear();

                match recover(&inner, &endpoint, &options, &mut shutdown).await {
                    Some(new_socket) => {
                        socket = new_socket;
                        let epoch = inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                        let _ = inner.state.send(ConnectionState::Connected);
                        let _ = inner.events.send(SessionEvent::Recovered { epoch });
                        info!(epoch, "connection recovered");
                    }
                    None => return,
                }
            }
        }
    }
}

async fn drive_connection(
    inner: &SessionInner,
    socket: &mut WsStream,
    outbound: &mut mpsc::UnboundedReceiver<(u64, Frame)>,
    shutdown: &mut watch::Receiver<bool>,
) -> LinkOutcome {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return LinkOutcome::Shutdown;
                }
            }
            maybe = outbound.recv() => match maybe {
                Some((queued_epoch, frame)) => {
                    if !replayable(queued_epoch, inner.epoch.load(Ordering::SeqCst), &frame) {
                        debug!(queued_epoch, frame = ?frame, "dropping frame from a dead channel");
                        continue;
                    }
                    let text = serde_json::to_string(&frame)
                        .expect("frames are always serializable");
                    if let Err(e) = socket.send(WsMessage::text(text)).await {
                        warn!(error = %e, "send failed, connection lost");
                        return LinkOutcome::Lost;
                    }
                }
                None => return LinkOutcome::Shutdown,
            },
            incoming = socket.next() => match incoming {
                Some(Ok(msg)) => {
                    if msg.is_text() {
                        if let Ok(text) = msg.to_text() {
                            route_frame(inner, text);
                        }
                    } else if matches!(msg, WsMessage::Close(_)) {
                        info!("broker closed the connection");
                        return LinkOutcome::Lost;
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "read failed, connection lost");
                    return LinkOutcome::Lost;
                }
                None => {
                    info!("connection closed by peer");
                    return LinkOutcome::Lost;
                }
            },
        }
    }
}

fn route_frame(inner: &SessionInner, text: &str) {
    let frame = match serde_json::from_str::<Frame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "malformed frame from broker");
            return;
        }
    };
    match frame.channel_id() {
        Some(channel) => {
            let mut routes = inner.routes.lock().unwrap();
            if let Some(tx) = routes.get(&channel) {
                if tx.send(frame).is_err() {
                    routes.remove(&channel);
                }
            } else {
                debug!(channel, "frame for unknown channel dropped");
            }
        }
        None => match frame {
            // The socket closes right after; the read loop handles it.
            Frame::Close { reason } => warn!(%reason, "broker sent connection close"),
            other => debug!(frame = ?other, "unexpected connection-level frame"),
        },
    }
}

async fn recover(
    inner: &SessionInner,
    endpoint: &Endpoint,
    options: &SessionOptions,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<WsStream> {
    let mut attempt: u32 = 0;
    loop {
        if *shutdown.borrow() {
            finish(inner, "clean shutdown");
            return None;
        }
        if let Some(max) = options.max_reconnect_attempts {
            if attempt >= max {
                error!(attempts = attempt, "reconnect attempts exhausted");
                finish(
                    inner,
                    &ConnectionError::RetriesExhausted(attempt).to_string(),
                );
                return None;
            }
        }

        let delay = options.backoff.delay(attempt);
        let _ = inner.events.send(SessionEvent::Recovering {
            attempt: attempt + 1,
        });
        debug!(
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "waiting before reconnect"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                finish(inner, "clean shutdown");
                return None;
            }
        }

        match handshake(endpoint).await {
            Ok(socket) => return Some(socket),
            Err(e) => {
                warn!(error = %e, attempt = attempt + 1, "reconnect attempt failed");
                attempt += 1;
            }
        }
    }
}

async fn handshake(endpoint: &Endpoint) -> Result<WsStream, ConnectionError> {
    let url = endpoint.url();
    let (mut socket, _) = connect_async(&url)
        .await
        .map_err(|source| ConnectionError::Connect {
            addr: url.clone(),
            source,
        })?;

    let hello = Frame::Hello {
        vhost: endpoint.vhost.clone(),
        username: endpoint.username.clone(),
        password: endpoint.password.clone(),
    };
    let text = serde_json::to_string(&hello).expect("frames are always serializable");
    socket
        .send(WsMessage::text(text))
        .await
        .map_err(|source| ConnectionError::Connect { addr: url, source })?;

    while let Some(msg) = socket.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => return Err(ConnectionError::Closed(e.to_string())),
        };
        if !msg.is_text() {
            continue;
        }
        let Ok(text) = msg.to_text() else { continue };
        match serde_json::from_str::<Frame>(text) {
            Ok(Frame::HelloOk {}) => return Ok(socket),
            Ok(Frame::Close { reason }) => return Err(ConnectionError::AuthRefused(reason)),
            Ok(other) => debug!(frame = ?other, "unexpected frame during handshake"),
            Err(e) => {
                return Err(ConnectionError::Closed(format!(
                    "malformed handshake reply: {e}"
                )));
            }
        }
    }
    Err(ConnectionError::Closed(
        "connection closed during handshake".to_string(),
    ))
}

/// Whether a frame queued under `queued_epoch` may still be sent on the
/// connection of `current_epoch`.
///
/// A channel-scoped frame from an earlier epoch belongs to a channel that
/// died with its connection; replaying it would create state on the broker
/// (a consumer registration, an acknowledgment for a reissued tag) that
/// nothing on this side routes or owns. Publishes are the exception:
/// enqueueing a message is connection-agnostic, and flushing publishes
/// queued while the link was down is exactly the offline-publish contract.
pub(super) fn replayable(queued_epoch: u64, current_epoch: u64, frame: &Frame) -> bool {
    queued_epoch == current_epoch
        || frame.channel_id().is_none()
        || matches!(frame, Frame::Publish { .. })
}

async fn flush_pending(
    inner: &SessionInner,
    socket: &mut WsStream,
    outbound: &mut mpsc::UnboundedReceiver<(u64, Frame)>,
) {
    let current_epoch = inner.epoch.load(Ordering::SeqCst);
    while let Ok((queued_epoch, frame)) = outbound.try_recv() {
        if !replayable(queued_epoch, current_epoch, &frame) {
            continue;
        }
        let text = serde_json::to_string(&frame).expect("frames are always serializable");
        if socket.send(WsMessage::text(text)).await.is_err() {
            break;
        }
    }
}

fn finish(inner: &SessionInner, reason: &str) {
    *inner.close_reason.lock().unwrap() = Some(reason.to_string());
    let _ = inner.events.send(SessionEvent::Closed {
        reason: reason.to_string(),
    });
    let _ = inner.state.send(ConnectionState::Disconnected);
    inner.routes.lock().unwrap().clear();
}
