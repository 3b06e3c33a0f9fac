//! Multiplexed WebSocket client for Nostr-shaped application servers.
//!
//! This crate provides:
//! - One managed connection per [`ServerRole`] with backoff reconnects
//! - Request/response and streaming calls correlated over shared sockets
//! - Cross-subscription deduplication through a bounded [`SeenCache`]
//! - Remote pagination cursors with a single writer per query
//! - Event publishing with per-destination outcomes
//! - NIP-46 and NIP-47 envelopes over NIP-04 or NIP-44 encryption
//!
//! # Example
//!
//! ```rust,no_run
//! use nostr::{LocalSigner, generate_secret_key};
//! use nostr_mux::{ClientConfig, Filter, NostrClient, ServerRole};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> nostr_mux::Result<()> {
//!     let signer = Arc::new(LocalSigner::new(generate_secret_key()).unwrap());
//!     let client = NostrClient::new(ClientConfig::default(), signer)?;
//!     client.connect(ServerRole::Caching).await?;
//!
//!     let filter = Filter::new().kinds(vec![1]).limit(20);
//!     let result = client
//!         .request(ServerRole::Caching, &filter.to_payload())?
//!         .wait()
//!         .await?;
//!     for event in result.events {
//!         println!("{}: {}", event.id, event.content);
//!     }
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

mod backoff;
mod client;
mod config;
mod connection;
mod error;
mod handshake;
mod message;
mod multiplexer;
mod pagination;
mod publisher;
mod role;
mod seen;

// Re-export main types
pub use backoff::ExponentialBackoff;
pub use client::{ClientBuilder, NostrClient};
pub use config::{ClientConfig, ReconnectConfig, ServerUrls, parse_ws_url};
pub use connection::{
    ConnectionManager, ConnectionState, ConnectionStatus, FrameSender, FrameSink, InboundFrame,
};
pub use error::{ClientError, Result};
pub use handshake::{
    REMOTE_SIGNER_KIND, RemoteSignerRequest, RemoteSignerResponse, SealedWalletRequest,
    WALLET_INFO_KIND, WALLET_REQUEST_KIND, WALLET_RESPONSE_KIND, WalletConnectUri, WalletError,
    WalletRequest, WalletResponse, build_remote_signer_request, build_wallet_request,
    open_remote_signer_response, open_wallet_response, wallet_capabilities,
};
pub use message::{Filter, MessageCodec, MessageError, REQ, WireFrame, cache_payload};
pub use multiplexer::{
    EventSink, PublishAck, QueryResult, RequestMultiplexer, RequestOptions, ResponseHandle,
    Subscription, SubscriptionItem,
};
pub use pagination::{
    Direction, PAGING_EVENT_KIND, PageFetch, PageRequest, PageResult, PaginationCursorTracker,
    RemoteKey,
};
pub use publisher::{
    DeliveryOutcome, EventPublisher, PublishReport, RelayConnector, WebSocketRelayConnector,
};
pub use role::{RoleMap, ServerRole};
pub use seen::SeenCache;
