//! Correlation of outbound requests with inbound frames.
//!
//! Every request or subscription gets a correlation id and a pending entry
//! in its role's table. [`RequestMultiplexer::dispatch`] routes each inbound
//! frame to the matching entry; frames for ids that are no longer pending
//! are logged and dropped.

use crate::config::ClientConfig;
use crate::connection::FrameSender;
use crate::error::{ClientError, Result};
use crate::message::{MessageCodec, MessageError, WireFrame};
use crate::role::{RoleMap, ServerRole};
use crate::seen::SeenCache;
use futures::Stream;
use nostr::Event;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Sleep, timeout, timeout_at};
use tracing::{debug, trace, warn};

/// Write-only persistence collaborator for newly seen events.
pub trait EventSink: Send + Sync {
    fn on_event(&self, role: ServerRole, correlation_id: &str, event: &Event);
}

/// Per-call options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOptions {
    /// Deadline measured from issue time; `None` waits indefinitely
    pub timeout: Option<Duration>,
    /// Skip events whose id the seen cache already holds
    pub dedupe: bool,
    /// Subscriptions only: keep streaming after EOSE
    pub live: bool,
}

impl RequestOptions {
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_dedupe(mut self, dedupe: bool) -> Self {
        self.dedupe = dedupe;
        self
    }

    pub fn live(mut self) -> Self {
        self.live = true;
        self
    }
}

/// Events collected for a request up to its EOSE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResult {
    pub correlation_id: String,
    pub events: Vec<Event>,
}

/// Item yielded by a [`Subscription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionItem {
    Event(Event),
    /// End of stored events; only yielded by live subscriptions
    Eose,
}

/// Relay verdict on a published event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub event_id: String,
    pub accepted: bool,
    pub message: String,
}

enum Waiter {
    Request {
        tx: oneshot::Sender<Result<QueryResult>>,
        events: Vec<Event>,
    },
    Subscription {
        tx: mpsc::UnboundedSender<Result<SubscriptionItem>>,
        live: bool,
    },
}

impl Waiter {
    fn fail(self, error: ClientError) {
        match self {
            Waiter::Request { tx, .. } => {
                let _ = tx.send(Err(error));
            }
            Waiter::Subscription { tx, .. } => {
                let _ = tx.send(Err(error));
            }
        }
    }
}

struct PendingRequest {
    created_at: Instant,
    dedupe: bool,
    waiter: Waiter,
}

struct MuxInner {
    outbound: Arc<dyn FrameSender>,
    seen: Arc<SeenCache>,
    event_sink: Option<Arc<dyn EventSink>>,
    pending: RoleMap<Mutex<HashMap<String, PendingRequest>>>,
    /// event id -> (token, waiter) for every publish awaiting its OK
    acks: RoleMap<Mutex<HashMap<String, Vec<(u64, oneshot::Sender<PublishAck>)>>>>,
    id_prefix: String,
    counter: AtomicU64,
    request_defaults: RequestOptions,
    subscription_defaults: RequestOptions,
}

impl MuxInner {
    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.id_prefix, n)
    }

    fn send_close(&self, role: ServerRole, correlation_id: &str) {
        let frame = WireFrame::Close {
            correlation_id: correlation_id.to_string(),
        };
        let sent = MessageCodec::encode(&frame)
            .map_err(ClientError::from)
            .and_then(|text| self.outbound.send_text(role, text));
        if let Err(e) = sent {
            debug!("CLOSE for {} not sent: {}", correlation_id, e);
        }
    }

    fn take(&self, role: ServerRole, correlation_id: &str) -> Option<PendingRequest> {
        self.pending[role].lock().remove(correlation_id)
    }

    /// Remove an entry and fail its caller with `error`. Sends CLOSE when
    /// the entry was still pending.
    fn abort(&self, role: ServerRole, correlation_id: &str, error: ClientError) -> bool {
        match self.take(role, correlation_id) {
            Some(entry) => {
                entry.waiter.fail(error);
                self.send_close(role, correlation_id);
                true
            }
            None => false,
        }
    }

    /// Handle drop: quietly forget an unfinished entry.
    fn abandon(&self, role: ServerRole, correlation_id: &str) {
        if self.take(role, correlation_id).is_some() {
            debug!("Handle for {} dropped before completion", correlation_id);
            self.send_close(role, correlation_id);
        }
    }

    fn expire(&self, role: ServerRole, correlation_id: &str) {
        if self.abort(
            role,
            correlation_id,
            ClientError::Timeout(correlation_id.to_string()),
        ) {
            debug!("Request {} on {} timed out", correlation_id, role);
        }
    }
}

/// Removes one publish waiter when `issue_publish` returns or its future is
/// dropped. Waiters of other publishes of the same event stay in place.
struct AckGuard<'a> {
    inner: &'a MuxInner,
    role: ServerRole,
    event_id: &'a str,
    token: u64,
}

impl Drop for AckGuard<'_> {
    fn drop(&mut self) {
        let mut acks = self.inner.acks[self.role].lock();
        if let Some(waiters) = acks.get_mut(self.event_id) {
            waiters.retain(|(token, _)| *token != self.token);
            if waiters.is_empty() {
                acks.remove(self.event_id);
            }
        }
    }
}

/// Issues requests and routes inbound frames back to their callers.
#[derive(Clone)]
pub struct RequestMultiplexer {
    inner: Arc<MuxInner>,
}

impl RequestMultiplexer {
    pub fn new(
        outbound: Arc<dyn FrameSender>,
        seen: Arc<SeenCache>,
        config: &ClientConfig,
        event_sink: Option<Arc<dyn EventSink>>,
    ) -> Self {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        Self {
            inner: Arc::new(MuxInner {
                outbound,
                seen,
                event_sink,
                pending: RoleMap::from_fn(|_| Mutex::new(HashMap::new())),
                acks: RoleMap::from_fn(|_| Mutex::new(HashMap::new())),
                id_prefix: uuid[..8].to_string(),
                counter: AtomicU64::new(0),
                request_defaults: RequestOptions {
                    timeout: Some(config.request_timeout()),
                    dedupe: false,
                    live: false,
                },
                subscription_defaults: RequestOptions {
                    timeout: config.subscription_timeout(),
                    dedupe: true,
                    live: false,
                },
            }),
        }
    }

    /// Default options for request/response calls.
    pub fn request_options(&self) -> RequestOptions {
        self.inner.request_defaults
    }

    /// Default options for subscriptions.
    pub fn subscription_options(&self) -> RequestOptions {
        self.inner.subscription_defaults
    }

    /// Issue a request whose events are collected up to EOSE.
    pub fn issue_request(
        &self,
        role: ServerRole,
        verb: &str,
        payload: &Value,
    ) -> Result<ResponseHandle> {
        self.issue_request_with(role, verb, payload, self.request_options())
    }

    pub fn issue_request_with(
        &self,
        role: ServerRole,
        verb: &str,
        payload: &Value,
        options: RequestOptions,
    ) -> Result<ResponseHandle> {
        let (tx, rx) = oneshot::channel();
        let waiter = Waiter::Request {
            tx,
            events: Vec::new(),
        };
        let (correlation_id, deadline) = self.register(role, verb, payload, &options, waiter)?;
        Ok(ResponseHandle {
            inner: Arc::clone(&self.inner),
            role,
            correlation_id,
            deadline,
            rx,
        })
    }

    /// Issue a streamed request. The stream ends at EOSE unless live.
    pub fn issue_subscription(
        &self,
        role: ServerRole,
        verb: &str,
        payload: &Value,
    ) -> Result<Subscription> {
        self.issue_subscription_with(role, verb, payload, self.subscription_options())
    }

    pub fn issue_subscription_with(
        &self,
        role: ServerRole,
        verb: &str,
        payload: &Value,
        options: RequestOptions,
    ) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let waiter = Waiter::Subscription {
            tx,
            live: options.live,
        };
        let (correlation_id, deadline) = self.register(role, verb, payload, &options, waiter)?;
        Ok(Subscription {
            inner: Arc::clone(&self.inner),
            role,
            correlation_id,
            deadline: deadline.map(|d| Box::pin(tokio::time::sleep_until(d))),
            rx,
            finished: false,
        })
    }

    fn register(
        &self,
        role: ServerRole,
        verb: &str,
        payload: &Value,
        options: &RequestOptions,
        waiter: Waiter,
    ) -> Result<(String, Option<Instant>)> {
        let correlation_id = self.inner.next_id();
        let created_at = Instant::now();
        let deadline = options.timeout.map(|t| created_at + t);

        // registered before sending so a fast reply cannot miss its entry
        self.inner.pending[role].lock().insert(
            correlation_id.clone(),
            PendingRequest {
                created_at,
                dedupe: options.dedupe,
                waiter,
            },
        );

        let text = MessageCodec::encode_request(verb, &correlation_id, payload);
        if let Err(e) = self.inner.outbound.send_text(role, text) {
            self.inner.take(role, &correlation_id);
            return Err(e);
        }
        trace!("Issued {} {} on {}", verb, correlation_id, role);
        Ok((correlation_id, deadline))
    }

    /// Cancel a pending request or subscription by id.
    ///
    /// Its caller observes `Cancelled`. Returns false if nothing was pending.
    pub fn cancel(&self, correlation_id: &str) -> bool {
        ServerRole::ALL.into_iter().any(|role| {
            self.inner.abort(
                role,
                correlation_id,
                ClientError::Cancelled(correlation_id.to_string()),
            )
        })
    }

    /// Publish `event` on `role` and wait for the server's OK.
    pub async fn issue_publish(
        &self,
        role: ServerRole,
        event: &Event,
        wait: Duration,
    ) -> Result<PublishAck> {
        let (tx, rx) = oneshot::channel();
        let token = self.inner.counter.fetch_add(1, Ordering::Relaxed);
        self.inner.acks[role]
            .lock()
            .entry(event.id.clone())
            .or_default()
            .push((token, tx));
        let _guard = AckGuard {
            inner: &self.inner,
            role,
            event_id: &event.id,
            token,
        };

        MessageCodec::encode(&WireFrame::Publish {
            event: event.clone(),
        })
        .map_err(ClientError::from)
        .and_then(|text| self.inner.outbound.send_text(role, text))?;

        match timeout(wait, rx).await {
            Ok(Ok(ack)) if ack.accepted => Ok(ack),
            Ok(Ok(ack)) => Err(ClientError::PublishRejected {
                event_id: ack.event_id,
                message: ack.message,
            }),
            Ok(Err(_)) => Err(ClientError::Cancelled(event.id.clone())),
            Err(_) => Err(ClientError::Timeout(event.id.clone())),
        }
    }

    /// Route one decoded inbound frame.
    pub fn dispatch(&self, role: ServerRole, frame: WireFrame) {
        match frame {
            WireFrame::Event {
                correlation_id,
                event,
            } => self.dispatch_event(role, &correlation_id, event),
            WireFrame::Eose { correlation_id } => self.dispatch_eose(role, &correlation_id),
            WireFrame::Notice {
                correlation_id: Some(correlation_id),
                message,
            } => self.fail_remote(role, &correlation_id, message),
            WireFrame::Notice {
                correlation_id: None,
                message,
            } => warn!("Notice from {} server: {}", role, message),
            WireFrame::Error {
                correlation_id,
                reason,
            } => self.fail_remote(role, &correlation_id, reason),
            WireFrame::Ok {
                event_id,
                accepted,
                message,
            } => match self.inner.acks[role].lock().remove(&event_id) {
                Some(waiters) => {
                    let ack = PublishAck {
                        event_id,
                        accepted,
                        message,
                    };
                    for (_, tx) in waiters {
                        let _ = tx.send(ack.clone());
                    }
                }
                None => debug!("OK for untracked event {} on {}", event_id, role),
            },
            other @ (WireFrame::Request { .. } | WireFrame::Close { .. } | WireFrame::Publish { .. }) => {
                debug!("Ignoring client-only frame from {} server: {:?}", role, other);
            }
        }
    }

    /// Route a frame that failed to decode.
    pub fn dispatch_decode_error(&self, role: ServerRole, error: MessageError) {
        match error.correlation_id().map(str::to_string) {
            Some(correlation_id) => {
                let failed = self.inner.abort(
                    role,
                    &correlation_id,
                    ClientError::MalformedFrame(error.to_string()),
                );
                if !failed {
                    debug!("Malformed frame for stale id {}: {}", correlation_id, error);
                }
            }
            None => match error {
                MessageError::UnknownFrame(kind) => {
                    debug!("Ignoring {} frame from {} server", kind, role)
                }
                other => warn!("Dropping malformed frame from {} server: {}", role, other),
            },
        }
    }

    fn dispatch_event(&self, role: ServerRole, correlation_id: &str, event: Event) {
        let mut table = self.inner.pending[role].lock();
        let Some(entry) = table.get_mut(correlation_id) else {
            debug!("Event for stale id {} on {}", correlation_id, role);
            return;
        };

        let repeat = self.inner.seen.check_and_mark(&event.id);
        if entry.dedupe && repeat {
            trace!("Skipping seen event {} for {}", event.id, correlation_id);
            return;
        }

        let delivered = match &mut entry.waiter {
            Waiter::Request { events, .. } => {
                events.push(event.clone());
                true
            }
            Waiter::Subscription { tx, .. } => tx.send(Ok(SubscriptionItem::Event(event.clone()))).is_ok(),
        };
        if !delivered {
            table.remove(correlation_id);
        }
        drop(table);

        if !repeat && let Some(sink) = &self.inner.event_sink {
            sink.on_event(role, correlation_id, &event);
        }
    }

    fn dispatch_eose(&self, role: ServerRole, correlation_id: &str) {
        let mut table = self.inner.pending[role].lock();
        match table.get(correlation_id) {
            None => {
                debug!("EOSE for stale id {} on {}", correlation_id, role);
                return;
            }
            Some(PendingRequest {
                waiter: Waiter::Subscription { tx, live: true },
                ..
            }) => {
                if tx.send(Ok(SubscriptionItem::Eose)).is_err() {
                    table.remove(correlation_id);
                }
                return;
            }
            Some(_) => {}
        }

        let Some(entry) = table.remove(correlation_id) else {
            return;
        };
        drop(table);

        trace!(
            "{} completed in {:?}",
            correlation_id,
            entry.created_at.elapsed()
        );
        match entry.waiter {
            Waiter::Request { tx, events } => {
                let _ = tx.send(Ok(QueryResult {
                    correlation_id: correlation_id.to_string(),
                    events,
                }));
            }
            // dropping the sender ends the stream
            Waiter::Subscription { .. } => {}
        }
    }

    fn fail_remote(&self, role: ServerRole, correlation_id: &str, reason: String) {
        match self.inner.take(role, correlation_id) {
            Some(entry) => {
                debug!("Request {} failed on {}: {}", correlation_id, role, reason);
                entry.waiter.fail(ClientError::Remote {
                    correlation_id: correlation_id.to_string(),
                    reason,
                });
            }
            None => debug!("Error for stale id {} on {}: {}", correlation_id, role, reason),
        }
    }

    /// Number of pending requests and subscriptions on `role`.
    pub fn pending_count(&self, role: ServerRole) -> usize {
        self.inner.pending[role].lock().len()
    }

    /// Publishes on `role` still waiting for an OK.
    pub fn publish_count(&self, role: ServerRole) -> usize {
        self.inner.acks[role].lock().values().map(Vec::len).sum()
    }

    /// Fail every pending request, subscription and publish with
    /// `Cancelled`. No CLOSE frames are sent. Returns how many callers were
    /// resolved.
    pub fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for role in ServerRole::ALL {
            let pending: Vec<_> = self.inner.pending[role].lock().drain().collect();
            for (correlation_id, entry) in pending {
                entry
                    .waiter
                    .fail(ClientError::Cancelled(correlation_id.clone()));
                cancelled += 1;
            }
            // dropped senders resolve their publishers with `Cancelled`
            let acks: Vec<_> = self.inner.acks[role].lock().drain().collect();
            cancelled += acks.iter().map(|(_, waiters)| waiters.len()).sum::<usize>();
        }
        if cancelled > 0 {
            debug!("Cancelled {} pending callers", cancelled);
        }
        cancelled
    }

    /// Whether `correlation_id` is pending on any role.
    pub fn is_pending(&self, correlation_id: &str) -> bool {
        ServerRole::ALL
            .into_iter()
            .any(|role| self.inner.pending[role].lock().contains_key(correlation_id))
    }
}

/// Caller side of a request. Dropping it cancels the request.
pub struct ResponseHandle {
    inner: Arc<MuxInner>,
    role: ServerRole,
    correlation_id: String,
    deadline: Option<Instant>,
    rx: oneshot::Receiver<Result<QueryResult>>,
}

impl ResponseHandle {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn role(&self) -> ServerRole {
        self.role
    }

    /// Wait for the result, the deadline or cancellation.
    pub async fn wait(mut self) -> Result<QueryResult> {
        let received = match self.deadline {
            Some(deadline) => match timeout_at(deadline, &mut self.rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.inner.expire(self.role, &self.correlation_id);
                    return Err(ClientError::Timeout(self.correlation_id.clone()));
                }
            },
            None => (&mut self.rx).await,
        };
        received.unwrap_or_else(|_| Err(ClientError::Cancelled(self.correlation_id.clone())))
    }
}

impl Drop for ResponseHandle {
    fn drop(&mut self) {
        self.inner.abandon(self.role, &self.correlation_id);
    }
}

/// Stream of items for one subscription. Dropping it cancels the
/// subscription.
pub struct Subscription {
    inner: Arc<MuxInner>,
    role: ServerRole,
    correlation_id: String,
    deadline: Option<Pin<Box<Sleep>>>,
    rx: mpsc::UnboundedReceiver<Result<SubscriptionItem>>,
    finished: bool,
}

impl Subscription {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn role(&self) -> ServerRole {
        self.role
    }

    /// Collect every event until the stream ends.
    pub async fn collect_events(mut self) -> Result<Vec<Event>> {
        use futures::StreamExt;

        let mut events = Vec::new();
        while let Some(item) = self.next().await {
            if let SubscriptionItem::Event(event) = item? {
                events.push(event);
            }
        }
        Ok(events)
    }
}

impl Stream for Subscription {
    type Item = Result<SubscriptionItem>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(item)) => {
                if item.is_err() {
                    this.finished = true;
                }
                return Poll::Ready(Some(item));
            }
            Poll::Ready(None) => {
                this.finished = true;
                return Poll::Ready(None);
            }
            Poll::Pending => {}
        }

        if let Some(deadline) = this.deadline.as_mut()
            && deadline.as_mut().poll(cx).is_ready()
        {
            this.finished = true;
            this.inner.expire(this.role, &this.correlation_id);
            return Poll::Ready(Some(Err(ClientError::Timeout(this.correlation_id.clone()))));
        }
        Poll::Pending
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.abandon(self.role, &self.correlation_id);
    }
}
