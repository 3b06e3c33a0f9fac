//! Event publishing to the primary server and outbox relays.
//!
//! Every destination is attempted concurrently and independently; the
//! report carries one outcome per destination.

use crate::config::parse_ws_url;
use crate::error::{ClientError, Result};
use crate::message::{MessageCodec, WireFrame};
use crate::multiplexer::{PublishAck, RequestMultiplexer};
use crate::role::ServerRole;
use async_trait::async_trait;
use futures::future::join_all;
use futures::{SinkExt, StreamExt};
use nostr::{Event, EventTemplate, Signer};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Delivers one event to one relay outside the managed connections.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn publish(&self, relay_url: &str, event: &Event, wait: Duration) -> Result<PublishAck>;
}

/// Opens a short-lived WebSocket per publish and waits for the OK.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketRelayConnector;

#[async_trait]
impl RelayConnector for WebSocketRelayConnector {
    async fn publish(&self, relay_url: &str, event: &Event, wait: Duration) -> Result<PublishAck> {
        let url = parse_ws_url(relay_url)?;
        let text = MessageCodec::encode(&WireFrame::Publish {
            event: event.clone(),
        })?;

        let exchange = async {
            let (mut ws, _) = connect_async(url.as_str())
                .await
                .map_err(|e| ClientError::WebSocket(e.to_string()))?;
            ws.send(Message::Text(text.into()))
                .await
                .map_err(|e| ClientError::WebSocket(e.to_string()))?;

            while let Some(message) = ws.next().await {
                let message = message.map_err(|e| ClientError::WebSocket(e.to_string()))?;
                let Message::Text(text) = message else {
                    continue;
                };
                match MessageCodec::decode(text.as_str()) {
                    Ok(WireFrame::Ok {
                        event_id,
                        accepted,
                        message,
                    }) if event_id == event.id => {
                        let _ = ws.close(None).await;
                        return Ok(PublishAck {
                            event_id,
                            accepted,
                            message,
                        });
                    }
                    Ok(other) => debug!("Ignoring {:?} from {} while publishing", other, url),
                    Err(e) => debug!("Ignoring undecodable frame from {}: {}", url, e),
                }
            }
            Err(ClientError::WebSocket(format!("{url} closed before OK")))
        };

        timeout(wait, exchange)
            .await
            .map_err(|_| ClientError::Timeout(format!("publish {} to {}", event.id, url)))?
    }
}

/// Result for one destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Destination stored the event
    Accepted { message: String },
    /// Destination answered with a negative OK
    Rejected { message: String },
    /// No verdict: bad URL, transport error, timeout
    Failed { error: ClientError },
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Accepted { .. })
    }

    fn from_result(result: Result<PublishAck>) -> Self {
        match result {
            Ok(ack) if ack.accepted => DeliveryOutcome::Accepted {
                message: ack.message,
            },
            Ok(ack) => DeliveryOutcome::Rejected {
                message: ack.message,
            },
            Err(ClientError::PublishRejected { message, .. }) => {
                DeliveryOutcome::Rejected { message }
            }
            Err(error) => DeliveryOutcome::Failed { error },
        }
    }
}

/// Per-destination outcomes of one publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub event: Event,
    pub primary: DeliveryOutcome,
    /// Outbox relays in request order
    pub relays: Vec<(String, DeliveryOutcome)>,
}

impl PublishReport {
    pub fn event_id(&self) -> &str {
        &self.event.id
    }

    /// Destinations that accepted the event, the primary included.
    pub fn successes(&self) -> usize {
        usize::from(self.primary.is_success())
            + self.relays.iter().filter(|(_, o)| o.is_success()).count()
    }

    /// Destinations that did not accept the event, the primary included.
    pub fn failures(&self) -> usize {
        1 + self.relays.len() - self.successes()
    }
}

/// Signs events and fans them out to the primary connection and outbox
/// relays.
pub struct EventPublisher {
    signer: Arc<dyn Signer>,
    mux: RequestMultiplexer,
    connector: Arc<dyn RelayConnector>,
    primary_role: ServerRole,
    publish_timeout: Duration,
}

impl EventPublisher {
    pub fn new(
        signer: Arc<dyn Signer>,
        mux: RequestMultiplexer,
        connector: Arc<dyn RelayConnector>,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            signer,
            mux,
            connector,
            primary_role: ServerRole::Caching,
            publish_timeout,
        }
    }

    /// Send primary publishes to `role` instead of the caching server.
    pub fn with_primary_role(mut self, role: ServerRole) -> Self {
        self.primary_role = role;
        self
    }

    /// Sign `template` as `user_id` and publish it everywhere.
    ///
    /// Fails only when signing fails; delivery problems are reported per
    /// destination.
    pub async fn publish(
        &self,
        user_id: &str,
        template: EventTemplate,
        outbox_relays: &[String],
    ) -> Result<PublishReport> {
        let signer_key = self.signer.public_key();
        if !signer_key.eq_ignore_ascii_case(user_id) {
            return Err(ClientError::Signer(format!(
                "signer holds {signer_key}, not {user_id}"
            )));
        }
        let event = self.signer.sign_event(template).await?;
        Ok(self.publish_signed(event, outbox_relays).await)
    }

    /// Publish an already signed event everywhere.
    pub async fn publish_signed(&self, event: Event, outbox_relays: &[String]) -> PublishReport {
        let mut unique = HashSet::new();
        let relays: Vec<&String> = outbox_relays
            .iter()
            .filter(|url| unique.insert(url.as_str()))
            .collect();

        info!(
            "Publishing {} to {} server and {} outbox relays",
            event.id,
            self.primary_role,
            relays.len()
        );

        let primary = self
            .mux
            .issue_publish(self.primary_role, &event, self.publish_timeout);
        let outbox = join_all(relays.iter().map(|url| {
            self.connector
                .publish(url.as_str(), &event, self.publish_timeout)
        }));
        let (primary, outbox) = futures::join!(primary, outbox);

        let primary = DeliveryOutcome::from_result(primary);
        if !primary.is_success() {
            warn!("Primary publish of {} failed: {:?}", event.id, primary);
        }
        let relays = relays
            .into_iter()
            .zip(outbox)
            .map(|(url, result)| {
                let outcome = DeliveryOutcome::from_result(result);
                if !outcome.is_success() {
                    debug!("Outbox publish of {} to {} failed: {:?}", event.id, url, outcome);
                }
                (url.clone(), outcome)
            })
            .collect();

        PublishReport {
            event,
            primary,
            relays,
        }
    }
}
