//! One WebSocket connection per server role.
//!
//! Each role runs a connection task that owns its socket, forwards decoded
//! inbound frames to a [`FrameSink`], writes queued outbound text and
//! reconnects with exponential backoff. Status is published through a
//! `watch` channel per role.

use crate::backoff::ExponentialBackoff;
use crate::config::{ReconnectConfig, parse_ws_url};
use crate::error::{ClientError, Result};
use crate::message::{MessageCodec, MessageError, WireFrame};
use crate::role::{RoleMap, ServerRole};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long a stopping connection task gets to close its socket.
const STOP_GRACE: Duration = Duration::from_secs(1);

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and no reconnect pending
    Disconnected,
    /// Connecting, or waiting to retry
    Connecting,
    /// Connected and ready
    Connected,
}

/// Observable status of one role's connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub role: ServerRole,
    pub state: ConnectionState,
    pub url: Option<Url>,
    /// Failed attempts since the last connection that outlived the grace period
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl ConnectionStatus {
    fn disconnected(role: ServerRole) -> Self {
        Self {
            role,
            state: ConnectionState::Disconnected,
            url: None,
            retry_count: 0,
            last_error: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// Inbound frame tagged with the role it arrived on.
pub type InboundFrame = (ServerRole, std::result::Result<WireFrame, MessageError>);

/// Receives every decoded inbound frame.
pub trait FrameSink: Send + Sync {
    fn on_frame(&self, role: ServerRole, frame: std::result::Result<WireFrame, MessageError>);
}

impl FrameSink for mpsc::UnboundedSender<InboundFrame> {
    fn on_frame(&self, role: ServerRole, frame: std::result::Result<WireFrame, MessageError>) {
        if self.send((role, frame)).is_err() {
            debug!("Inbound frame for {} dropped, dispatcher gone", role);
        }
    }
}

/// Outbound half used by the multiplexer.
pub trait FrameSender: Send + Sync {
    /// Queue encoded text on `role`'s connection. Fails fast when the role
    /// is not connected.
    fn send_text(&self, role: ServerRole, text: String) -> Result<()>;
}

/// Writes status for one connection task, unless a newer task has taken
/// over the role.
#[derive(Clone)]
struct StatusPublisher {
    tx: Arc<watch::Sender<ConnectionStatus>>,
    generation: Arc<AtomicU64>,
    mine: u64,
}

impl StatusPublisher {
    fn update(&self, f: impl FnOnce(&mut ConnectionStatus)) {
        self.tx.send_if_modified(|status| {
            if self.generation.load(Ordering::SeqCst) != self.mine {
                return false;
            }
            f(status);
            true
        });
    }
}

struct Runner {
    url: Url,
    outbound: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

struct RoleSlot {
    status: Arc<watch::Sender<ConnectionStatus>>,
    generation: Arc<AtomicU64>,
    runner: Mutex<Option<Runner>>,
}

impl RoleSlot {
    fn new(role: ServerRole) -> Self {
        let (tx, _) = watch::channel(ConnectionStatus::disconnected(role));
        Self {
            status: Arc::new(tx),
            generation: Arc::new(AtomicU64::new(0)),
            runner: Mutex::new(None),
        }
    }
}

/// Owns the per-role connections.
pub struct ConnectionManager {
    config: ReconnectConfig,
    sink: Arc<dyn FrameSink>,
    slots: RoleMap<RoleSlot>,
}

impl ConnectionManager {
    pub fn new(config: ReconnectConfig, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            config,
            sink,
            slots: RoleMap::from_fn(RoleSlot::new),
        }
    }

    /// Establish, or migrate to `url`, the connection for `role`.
    ///
    /// Resolves once the first attempt succeeds or fails. A failed first
    /// attempt is returned as an error while retries continue in the
    /// background until [`ConnectionManager::disconnect`].
    pub async fn connect(&self, role: ServerRole, url: &str) -> Result<()> {
        let url = parse_ws_url(url)?;
        let slot = &self.slots[role];

        let same_url_live = slot
            .runner
            .lock()
            .as_ref()
            .is_some_and(|r| r.url == url && !r.task.is_finished());
        if same_url_live && slot.status.borrow().is_connected() {
            return Ok(());
        }

        self.stop_runner(role).await;

        let mine = slot.generation.fetch_add(1, Ordering::SeqCst) + 1;
        slot.status.send_replace(ConnectionStatus {
            role,
            state: ConnectionState::Connecting,
            url: Some(url.clone()),
            retry_count: 0,
            last_error: None,
        });
        let mut status_rx = slot.status.subscribe();

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let publisher = StatusPublisher {
            tx: Arc::clone(&slot.status),
            generation: Arc::clone(&slot.generation),
            mine,
        };
        let task = tokio::spawn(run_connection(
            role,
            url.clone(),
            self.config.clone(),
            Arc::clone(&self.sink),
            publisher,
            outbound_rx,
        ));
        *slot.runner.lock() = Some(Runner {
            url: url.clone(),
            outbound,
            task,
        });

        info!("Connecting {} server: {}", role, url);

        let wait = status_rx.wait_for(|s| s.is_connected() || s.retry_count > 0);
        let outcome = match timeout(self.config.connect_timeout() + STOP_GRACE, wait).await {
            Ok(Ok(status)) => Ok((status.is_connected(), status.last_error.clone())),
            Ok(Err(_)) => Err(ClientError::Internal(format!("{role} status channel closed"))),
            Err(_) => Err(ClientError::Timeout(format!("connect to {role} server"))),
        };
        match outcome? {
            (true, _) => Ok(()),
            (false, last_error) => Err(ClientError::WebSocket(
                last_error.unwrap_or_else(|| "connection failed".to_string()),
            )),
        }
    }

    /// Current status for `role`.
    pub fn status(&self, role: ServerRole) -> ConnectionStatus {
        self.slots[role].status.borrow().clone()
    }

    /// Watch status changes for `role`.
    pub fn watch_status(&self, role: ServerRole) -> watch::Receiver<ConnectionStatus> {
        self.slots[role].status.subscribe()
    }

    /// Queue a frame on `role`'s connection.
    pub fn send(&self, role: ServerRole, frame: &WireFrame) -> Result<()> {
        let text = MessageCodec::encode(frame)?;
        self.send_text(role, text)
    }

    /// Close the connection for `role` and cancel pending retries.
    pub async fn disconnect(&self, role: ServerRole) {
        self.stop_runner(role).await;
        let slot = &self.slots[role];
        slot.generation.fetch_add(1, Ordering::SeqCst);
        slot.status.send_modify(|status| {
            status.state = ConnectionState::Disconnected;
            status.retry_count = 0;
        });
    }

    /// Close every connection. Every role reports `Disconnected` afterwards.
    pub async fn shutdown(&self) {
        info!("Shutting down all server connections");
        futures::future::join_all(ServerRole::ALL.map(|role| self.disconnect(role))).await;
    }

    async fn stop_runner(&self, role: ServerRole) {
        let slot = &self.slots[role];
        slot.generation.fetch_add(1, Ordering::SeqCst);
        let runner = slot.runner.lock().take();
        if let Some(Runner {
            url,
            outbound,
            mut task,
        }) = runner
        {
            debug!("Stopping {} connection to {}", role, url);
            // closing the queue asks the task to close its socket
            drop(outbound);
            if timeout(STOP_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
    }
}

impl FrameSender for ConnectionManager {
    fn send_text(&self, role: ServerRole, text: String) -> Result<()> {
        let slot = &self.slots[role];
        if !slot.status.borrow().is_connected() {
            return Err(ClientError::NotConnected(role.to_string()));
        }
        let runner = slot.runner.lock();
        let Some(runner) = runner.as_ref() else {
            return Err(ClientError::NotConnected(role.to_string()));
        };
        runner
            .outbound
            .send(text)
            .map_err(|_| ClientError::NotConnected(role.to_string()))
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        for role in ServerRole::ALL {
            if let Some(runner) = self.slots[role].runner.lock().take() {
                runner.task.abort();
            }
        }
    }
}

enum PumpExit {
    /// Outbound queue closed by the manager
    Stopped,
    /// Transport closed or failed
    Lost(String),
}

async fn run_connection(
    role: ServerRole,
    url: Url,
    config: ReconnectConfig,
    sink: Arc<dyn FrameSink>,
    status: StatusPublisher,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
) {
    let mut backoff =
        ExponentialBackoff::new(config.base_delay(), config.max_delay()).with_jitter(config.jitter);
    let mut retry_count: u32 = 0;

    loop {
        status.update(|s| s.state = ConnectionState::Connecting);

        let attempt = tokio::select! {
            result = timeout(config.connect_timeout(), connect_async(url.as_str())) => result,
            _ = wait_closed(&mut outbound_rx) => break,
        };

        let last_error = match attempt {
            Ok(Ok((ws, _))) => {
                info!("Connected to {} server: {}", role, url);
                let connected_at = Instant::now();
                status.update(|s| {
                    s.state = ConnectionState::Connected;
                    s.retry_count = retry_count;
                    s.last_error = None;
                });

                let exit = pump(role, ws, sink.as_ref(), &mut outbound_rx).await;
                if connected_at.elapsed() >= config.grace_period() {
                    backoff.reset();
                    retry_count = 0;
                }
                match exit {
                    PumpExit::Stopped => break,
                    PumpExit::Lost(reason) => {
                        warn!("Connection to {} server lost: {}", role, reason);
                        reason
                    }
                }
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("connect timeout after {:?}", config.connect_timeout()),
        };

        retry_count = retry_count.saturating_add(1);
        let delay = backoff.next_delay();
        debug!(
            "Reconnecting to {} server in {:?} (attempt {})",
            role, delay, retry_count
        );
        status.update(|s| {
            s.state = ConnectionState::Connecting;
            s.retry_count = retry_count;
            s.last_error = Some(last_error);
        });

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wait_closed(&mut outbound_rx) => break,
        }
    }

    status.update(|s| s.state = ConnectionState::Disconnected);
    info!("Connection task for {} server stopped", role);
}

/// Resolves once the outbound queue is closed, discarding anything queued
/// while there is no socket to write to.
async fn wait_closed(outbound_rx: &mut mpsc::UnboundedReceiver<String>) {
    while outbound_rx.recv().await.is_some() {
        debug!("Dropping frame queued while disconnected");
    }
}

async fn pump(
    role: ServerRole,
    ws: WsStream,
    sink: &dyn FrameSink,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
) -> PumpExit {
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => match outgoing {
                Some(text) => {
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        return PumpExit::Lost(e.to_string());
                    }
                }
                None => {
                    let _ = write.send(Message::Close(None)).await;
                    return PumpExit::Stopped;
                }
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    sink.on_frame(role, MessageCodec::decode(text.as_str()));
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) => {
                    return PumpExit::Lost("closed by server".to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return PumpExit::Lost(e.to_string()),
                None => return PumpExit::Lost("stream ended".to_string()),
            },
        }
    }
}
