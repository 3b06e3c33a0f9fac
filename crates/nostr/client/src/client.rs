//! Client facade wiring connections, multiplexing and publishing together.

use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, ConnectionStatus, FrameSender, InboundFrame};
use crate::error::{ClientError, Result};
use crate::handshake::{WalletConnectUri, WalletRequest, build_wallet_request, open_wallet_response};
use crate::message::REQ;
use crate::multiplexer::{
    EventSink, QueryResult, RequestMultiplexer, ResponseHandle, Subscription, SubscriptionItem,
};
use crate::pagination::{Direction, PaginationCursorTracker, RemoteKey};
use crate::publisher::{EventPublisher, PublishReport, RelayConnector, WebSocketRelayConnector};
use crate::role::{RoleMap, ServerRole};
use crate::seen::SeenCache;
use futures::StreamExt;
use futures::future::join_all;
use nostr::{EncryptionService, EventTemplate, PeerCapabilities, SchemePolicy, Signer};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// Optional collaborators for [`NostrClient`].
pub struct ClientBuilder {
    config: ClientConfig,
    signer: Arc<dyn Signer>,
    event_sink: Option<Arc<dyn EventSink>>,
    connector: Option<Arc<dyn RelayConnector>>,
    scheme_policy: Option<Arc<dyn SchemePolicy>>,
}

impl ClientBuilder {
    /// Receive every first-seen event in addition to the issuing caller.
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    /// Replace how outbox relays are reached.
    pub fn relay_connector(mut self, connector: Arc<dyn RelayConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Replace the encryption scheme policy.
    pub fn scheme_policy(mut self, policy: Arc<dyn SchemePolicy>) -> Self {
        self.scheme_policy = Some(policy);
        self
    }

    /// Validate the config and start the dispatch task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> Result<NostrClient> {
        self.config.validate()?;
        let urls = self.config.servers.resolve()?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<InboundFrame>();
        let connections = Arc::new(ConnectionManager::new(
            self.config.reconnect.clone(),
            Arc::new(inbound_tx),
        ));
        let seen = Arc::new(SeenCache::new(self.config.seen_capacity));
        let outbound: Arc<dyn FrameSender> = connections.clone();
        let mux = RequestMultiplexer::new(outbound, Arc::clone(&seen), &self.config, self.event_sink);
        let dispatcher = tokio::spawn(dispatch_loop(mux.clone(), inbound_rx));

        let encryption = match self.scheme_policy {
            Some(policy) => EncryptionService::with_policy(policy),
            None => EncryptionService::new(),
        };
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WebSocketRelayConnector));
        let publisher = EventPublisher::new(
            Arc::clone(&self.signer),
            mux.clone(),
            connector,
            self.config.publish_timeout(),
        );

        info!(
            "Client ready for {} servers as {}",
            ServerRole::ALL.len(),
            self.signer.public_key()
        );

        Ok(NostrClient {
            config: self.config,
            urls,
            connections,
            mux,
            seen,
            cursors: PaginationCursorTracker::new(),
            encryption,
            publisher,
            signer: self.signer,
            dispatcher,
        })
    }
}

async fn dispatch_loop(mux: RequestMultiplexer, mut inbound: mpsc::UnboundedReceiver<InboundFrame>) {
    while let Some((role, frame)) = inbound.recv().await {
        match frame {
            Ok(frame) => mux.dispatch(role, frame),
            Err(e) => mux.dispatch_decode_error(role, e),
        }
    }
    debug!("Inbound frame channel closed");
}

/// One client session: a connection per server role plus the services
/// layered on top of them.
pub struct NostrClient {
    config: ClientConfig,
    urls: RoleMap<Url>,
    connections: Arc<ConnectionManager>,
    mux: RequestMultiplexer,
    seen: Arc<SeenCache>,
    cursors: PaginationCursorTracker,
    encryption: EncryptionService,
    publisher: EventPublisher,
    signer: Arc<dyn Signer>,
    dispatcher: JoinHandle<()>,
}

impl NostrClient {
    /// Client with default collaborators.
    pub fn new(config: ClientConfig, signer: Arc<dyn Signer>) -> Result<Self> {
        Self::builder(config, signer).build()
    }

    pub fn builder(config: ClientConfig, signer: Arc<dyn Signer>) -> ClientBuilder {
        ClientBuilder {
            config,
            signer,
            event_sink: None,
            connector: None,
            scheme_policy: None,
        }
    }

    /// Connect `role` to its configured URL.
    pub async fn connect(&self, role: ServerRole) -> Result<()> {
        self.connections.connect(role, self.urls[role].as_str()).await
    }

    /// Connect `role` to `url`, migrating away from any current connection.
    pub async fn connect_to(&self, role: ServerRole, url: &str) -> Result<()> {
        self.connections.connect(role, url).await
    }

    /// Connect every role concurrently.
    pub async fn connect_all(&self) -> Vec<(ServerRole, Result<()>)> {
        let results = join_all(ServerRole::ALL.into_iter().map(|role| self.connect(role))).await;
        ServerRole::ALL.into_iter().zip(results).collect()
    }

    pub async fn disconnect(&self, role: ServerRole) {
        self.connections.disconnect(role).await;
    }

    pub fn status(&self, role: ServerRole) -> ConnectionStatus {
        self.connections.status(role)
    }

    pub fn watch_status(&self, role: ServerRole) -> watch::Receiver<ConnectionStatus> {
        self.connections.watch_status(role)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn multiplexer(&self) -> &RequestMultiplexer {
        &self.mux
    }

    pub fn seen(&self) -> &SeenCache {
        &self.seen
    }

    pub fn cursors(&self) -> &PaginationCursorTracker {
        &self.cursors
    }

    pub fn encryption(&self) -> &EncryptionService {
        &self.encryption
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    /// Issue a REQ and collect its events up to EOSE.
    pub fn request(&self, role: ServerRole, payload: &Value) -> Result<ResponseHandle> {
        self.mux.issue_request(role, REQ, payload)
    }

    /// Issue a REQ and stream its events.
    pub fn subscribe(&self, role: ServerRole, payload: &Value) -> Result<Subscription> {
        self.mux.issue_subscription(role, REQ, payload)
    }

    /// Issue a REQ that stays open past EOSE.
    pub fn subscribe_live(&self, role: ServerRole, payload: &Value) -> Result<Subscription> {
        let options = self.mux.subscription_options().live();
        self.mux.issue_subscription_with(role, REQ, payload, options)
    }

    pub fn cancel(&self, correlation_id: &str) -> bool {
        self.mux.cancel(correlation_id)
    }

    /// Fetch the next page of `key` in `direction` and advance its cursor.
    ///
    /// `payload` is the unbounded query; page bounds are written into it.
    /// Events already returned at an inclusive boundary by an earlier page
    /// are left out. Returns `None` once the older end is exhausted.
    pub async fn fetch_page(
        &self,
        role: ServerRole,
        key: &str,
        payload: &Value,
        direction: Direction,
    ) -> Result<Option<(QueryResult, Option<RemoteKey>)>> {
        let fetch = self.cursors.begin(key, direction)?;
        let Some(bounds) = fetch.request() else {
            debug!("No older pages left for {}", key);
            return Ok(None);
        };

        let mut payload = payload.clone();
        bounds.apply_to(&mut payload);
        let mut result = self.request(role, &payload)?.wait().await?;

        let (events, cursor) = fetch.complete_events(std::mem::take(&mut result.events));
        result.events = events;
        Ok(Some((result, cursor)))
    }

    /// Sign `template` with the session signer and publish it to the
    /// primary server and `outbox_relays`.
    pub async fn publish(
        &self,
        template: EventTemplate,
        outbox_relays: &[String],
    ) -> Result<PublishReport> {
        let user_id = self.signer.public_key();
        self.publisher.publish(&user_id, template, outbox_relays).await
    }

    /// Send a NIP-47 request over the wallet connection and wait for the
    /// wallet's answer.
    pub async fn wallet_request(
        &self,
        uri: &WalletConnectUri,
        peer: &PeerCapabilities,
        request: &WalletRequest,
    ) -> Result<Value> {
        let sealed = build_wallet_request(&self.encryption, uri, peer, request)?;
        let filter = sealed.response_filter(&uri.wallet_pubkey).to_payload();
        let options = self.mux.request_options().live();
        let mut responses =
            self.mux
                .issue_subscription_with(ServerRole::Wallet, REQ, &filter, options)?;

        let ack = self
            .mux
            .issue_publish(ServerRole::Wallet, &sealed.event, self.config.publish_timeout())
            .await?;
        debug!("Wallet relay stored {}: {}", ack.event_id, ack.message);

        while let Some(item) = responses.next().await {
            match item? {
                SubscriptionItem::Event(event) => {
                    match open_wallet_response(&self.encryption, uri, sealed.scheme, &event) {
                        Ok(response) => return response.into_result(&sealed.event.id),
                        Err(e) => warn!("Skipping unreadable wallet response {}: {}", event.id, e),
                    }
                }
                SubscriptionItem::Eose => {}
            }
        }
        Err(ClientError::Cancelled(sealed.event.id))
    }

    /// Close every connection and resolve every pending request,
    /// subscription and publish with `Cancelled`.
    pub async fn shutdown(&self) {
        self.connections.shutdown().await;
        self.mux.cancel_all();
    }
}

impl Drop for NostrClient {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}
