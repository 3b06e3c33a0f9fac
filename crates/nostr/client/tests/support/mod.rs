//! In-process relay used by the integration tests.
//!
//! Stores published events, answers REQ with stored matches followed by
//! EOSE, keeps subscriptions open for live delivery and acknowledges every
//! EVENT with an OK. A filter containing `"notice"` is answered with a
//! NOTICE addressed to the request instead. Tests can drop every open
//! socket to simulate a server-side close.

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use nostr::{Event, EventTemplate, finalize_event};
use nostr_mux::{ClientConfig, ServerUrls};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}

/// Produces follow-up events for each stored event.
pub type EventHook = Arc<dyn Fn(&Event) -> Vec<Event> + Send + Sync>;

struct LiveSub {
    conn: u64,
    id: String,
    filter: Value,
    tx: mpsc::UnboundedSender<String>,
}

struct RelayState {
    events: Mutex<Vec<Event>>,
    subs: Mutex<Vec<LiveSub>>,
    frames: Mutex<Vec<Value>>,
    hook: Option<EventHook>,
    accepted: AtomicU64,
    open: AtomicU64,
    /// bumped to close every open socket
    drops: watch::Sender<u64>,
}

impl RelayState {
    fn store(&self, event: Event) {
        let text = |id: &str| json!(["EVENT", id, event]).to_string();
        for sub in self.subs.lock().iter() {
            if matches(&sub.filter, &event) {
                let _ = sub.tx.send(text(&sub.id));
            }
        }
        self.events.lock().push(event);
    }
}

pub struct MockRelay {
    addr: SocketAddr,
    state: Arc<RelayState>,
    accept: JoinHandle<()>,
}

impl MockRelay {
    pub async fn start() -> Self {
        Self::start_inner(None).await
    }

    pub async fn start_with_hook(hook: EventHook) -> Self {
        Self::start_inner(Some(hook)).await
    }

    async fn start_inner(hook: Option<EventHook>) -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(RelayState {
            events: Mutex::default(),
            subs: Mutex::default(),
            frames: Mutex::default(),
            hook,
            accepted: AtomicU64::new(0),
            open: AtomicU64::new(0),
            drops: watch::channel(0).0,
        });

        let accept_state = Arc::clone(&state);
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let conn = accept_state.accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(Arc::clone(&accept_state), conn, stream));
            }
        });

        Self {
            addr,
            state,
            accept,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Pre-load an event without announcing it.
    pub fn seed(&self, event: Event) {
        self.state.events.lock().push(event);
    }

    pub fn stored(&self) -> Vec<Event> {
        self.state.events.lock().clone()
    }

    /// Every frame received so far, in arrival order.
    pub fn frames(&self) -> Vec<Value> {
        self.state.frames.lock().clone()
    }

    /// Correlation ids of the REQ frames received so far.
    pub fn request_ids(&self) -> Vec<String> {
        self.frames()
            .iter()
            .filter(|f| f[0] == "REQ")
            .filter_map(|f| f[1].as_str().map(str::to_string))
            .collect()
    }

    /// WebSocket connections accepted so far.
    pub fn connection_count(&self) -> u64 {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// WebSocket connections currently open.
    pub fn open_connections(&self) -> u64 {
        self.state.open.load(Ordering::SeqCst)
    }

    /// Close every open socket from the server side.
    pub fn drop_connections(&self) {
        self.state.drops.send_modify(|round| *round += 1);
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

async fn serve(state: Arc<RelayState>, conn: u64, stream: TcpStream) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let mut drops = state.drops.subscribe();
    state.open.fetch_add(1, Ordering::SeqCst);
    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        let message = tokio::select! {
            message = source.next() => message,
            _ = drops.changed() => break,
        };
        let Some(Ok(message)) = message else {
            break;
        };
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else {
            continue;
        };
        state.frames.lock().push(frame.clone());

        match frame[0].as_str() {
            Some("EVENT") => {
                let Ok(event) = serde_json::from_value::<Event>(frame[1].clone()) else {
                    continue;
                };
                let ok = json!(["OK", event.id, true, ""]).to_string();
                let follow_ups = state
                    .hook
                    .as_ref()
                    .map(|hook| hook(&event))
                    .unwrap_or_default();
                state.store(event);
                let _ = tx.send(ok);
                for follow_up in follow_ups {
                    state.store(follow_up);
                }
            }
            Some("REQ") => {
                let id = frame[1].as_str().unwrap_or_default().to_string();
                let filter = frame[2].clone();
                if let Some(notice) = filter.get("notice") {
                    let _ = tx.send(json!(["NOTICE", id, notice]).to_string());
                    continue;
                }
                let stored: Vec<Event> = state
                    .events
                    .lock()
                    .iter()
                    .filter(|e| matches(&filter, e))
                    .cloned()
                    .collect();
                for event in stored {
                    let _ = tx.send(json!(["EVENT", id, event]).to_string());
                }
                let _ = tx.send(json!(["EOSE", id]).to_string());
                state.subs.lock().push(LiveSub {
                    conn,
                    id,
                    filter,
                    tx: tx.clone(),
                });
            }
            Some("CLOSE") => {
                let id = frame[1].as_str().unwrap_or_default();
                state.subs.lock().retain(|s| !(s.conn == conn && s.id == id));
            }
            _ => {}
        }
    }

    state.subs.lock().retain(|s| s.conn != conn);
    writer.abort();
    let _ = writer.await;
    drop(source);
    state.open.fetch_sub(1, Ordering::SeqCst);
}

fn contains(list: &Value, candidate: &Value) -> bool {
    list.as_array()
        .is_some_and(|items| items.iter().any(|item| item == candidate))
}

fn matches(filter: &Value, event: &Event) -> bool {
    let Some(fields) = filter.as_object() else {
        return true;
    };
    fields.iter().all(|(key, value)| match key.as_str() {
        "ids" => contains(value, &json!(event.id)),
        "authors" => contains(value, &json!(event.pubkey)),
        "kinds" => contains(value, &json!(event.kind)),
        "since" => value.as_u64().is_none_or(|since| event.created_at >= since),
        "until" => value.as_u64().is_none_or(|until| event.created_at <= until),
        tag if tag.starts_with('#') => event.tags.iter().any(|t| {
            t.len() >= 2 && t[0] == tag[1..] && contains(value, &json!(t[1]))
        }),
        _ => true,
    })
}

/// Config whose three roles all point at `url`.
pub fn config_for(url: &str) -> ClientConfig {
    ClientConfig {
        servers: ServerUrls {
            caching: url.to_string(),
            upload: url.to_string(),
            wallet: url.to_string(),
        },
        request_timeout_ms: 5_000,
        publish_timeout_ms: 5_000,
        ..Default::default()
    }
}

pub fn note(secret_key: &[u8; 32], created_at: u64, content: &str) -> Event {
    let template = EventTemplate {
        kind: 1,
        tags: vec![],
        content: content.to_string(),
        created_at,
    };
    finalize_event(&template, secret_key).unwrap()
}
