//! Remote-signer (NIP-46) and wallet-connect (NIP-47) envelopes.
//!
//! Requests are JSON encrypted with the scheme the [`EncryptionService`]
//! policy picks for the peer, wrapped in an event signed by the client key.

use crate::error::{ClientError, Result};
use crate::message::Filter;
use nostr::{
    EncryptionService, Event, EventTemplate, PeerCapabilities, Scheme, finalize_event,
    get_public_key_hex, verify_event,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// NIP-46 request and response kind.
pub const REMOTE_SIGNER_KIND: u32 = 24133;
/// NIP-47 wallet info kind.
pub const WALLET_INFO_KIND: u32 = 13194;
/// NIP-47 request kind.
pub const WALLET_REQUEST_KIND: u32 = 23194;
/// NIP-47 response kind.
pub const WALLET_RESPONSE_KIND: u32 = 23195;

const WALLET_CONNECT_SCHEME: &str = "nostr+walletconnect";

/// NIP-46 request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSignerRequest {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Vec<String>,
}

impl RemoteSignerRequest {
    /// Request with a fresh random id.
    pub fn new(method: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            method: method.into(),
            params,
        }
    }
}

/// NIP-46 response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSignerResponse {
    pub id: String,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// NIP-47 request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletRequest {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl WalletRequest {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// NIP-47 error object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletError {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// NIP-47 response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletResponse {
    pub result_type: String,
    #[serde(default)]
    pub error: Option<WalletError>,
    #[serde(default)]
    pub result: Option<Value>,
}

impl WalletResponse {
    /// The result payload, or the wallet's error as `Remote`.
    pub fn into_result(self, request_id: &str) -> Result<Value> {
        match self.error {
            Some(error) => Err(ClientError::Remote {
                correlation_id: request_id.to_string(),
                reason: format!("{}: {}", error.code, error.message),
            }),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Parsed `nostr+walletconnect://` connection string.
#[derive(Clone, PartialEq, Eq)]
pub struct WalletConnectUri {
    pub wallet_pubkey: String,
    pub relays: Vec<String>,
    /// Client secret the wallet service authorizes
    pub secret: [u8; 32],
    pub lud16: Option<String>,
}

impl std::fmt::Debug for WalletConnectUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletConnectUri")
            .field("wallet_pubkey", &self.wallet_pubkey)
            .field("relays", &self.relays)
            .field("lud16", &self.lud16)
            .finish_non_exhaustive()
    }
}

impl WalletConnectUri {
    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri)?;
        if url.scheme() != WALLET_CONNECT_SCHEME {
            return Err(ClientError::InvalidUrl(format!(
                "expected {WALLET_CONNECT_SCHEME}:// URI, got {}://",
                url.scheme()
            )));
        }

        let wallet_pubkey = match url.host_str() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => url.path().trim_start_matches('/').to_string(),
        }
        .to_lowercase();
        if wallet_pubkey.len() != 64 || hex::decode(&wallet_pubkey).is_err() {
            return Err(ClientError::InvalidUrl("wallet pubkey must be 32-byte hex".to_string()));
        }

        let mut relays = Vec::new();
        let mut secret = None;
        let mut lud16 = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "relay" => relays.push(value.into_owned()),
                "secret" => secret = Some(value.into_owned()),
                "lud16" => lud16 = Some(value.into_owned()),
                _ => {}
            }
        }

        let secret = secret
            .and_then(|s| hex::decode(s).ok())
            .and_then(|bytes| <[u8; 32]>::try_from(bytes).ok())
            .ok_or_else(|| ClientError::InvalidUrl("secret must be 32-byte hex".to_string()))?;

        Ok(Self {
            wallet_pubkey,
            relays,
            secret,
            lud16,
        })
    }

    /// Public key of the client secret.
    pub fn client_pubkey(&self) -> Result<String> {
        get_public_key_hex(&self.secret).map_err(|e| ClientError::Signer(e.to_string()))
    }
}

fn sign(template: &EventTemplate, secret_key: &[u8; 32]) -> Result<Event> {
    finalize_event(template, secret_key).map_err(|e| ClientError::Signer(e.to_string()))
}

fn expect_kind(event: &Event, kind: u32) -> Result<()> {
    if event.kind != kind {
        return Err(ClientError::UnknownFrame(format!(
            "expected kind {kind}, got {}",
            event.kind
        )));
    }
    Ok(())
}

/// Reject an event whose id or signature does not match its content.
fn expect_signed(event: &Event) -> Result<()> {
    match verify_event(event) {
        Ok(true) => Ok(()),
        Ok(false) => Err(ClientError::InvalidSignature(event.id.clone())),
        Err(e) => Err(ClientError::InvalidSignature(format!("{}: {e}", event.id))),
    }
}

/// Build a NIP-46 request event addressed to `signer_pubkey`.
pub fn build_remote_signer_request(
    encryption: &EncryptionService,
    client_secret: &[u8; 32],
    signer_pubkey: &str,
    peer: &PeerCapabilities,
    request: &RemoteSignerRequest,
) -> Result<Event> {
    let body = serde_json::to_string(request)?;
    let envelope = encryption.encrypt_for_peer(peer, client_secret, signer_pubkey, &body)?;
    let template = EventTemplate::now(
        REMOTE_SIGNER_KIND,
        vec![vec!["p".to_string(), signer_pubkey.to_string()]],
        envelope.to_content(),
    );
    sign(&template, client_secret)
}

/// Open a NIP-46 response, detecting its scheme. The event must carry a
/// valid signature.
pub fn open_remote_signer_response(
    encryption: &EncryptionService,
    client_secret: &[u8; 32],
    event: &Event,
) -> Result<RemoteSignerResponse> {
    expect_kind(event, REMOTE_SIGNER_KIND)?;
    expect_signed(event)?;
    let body = encryption.decrypt_content(&event.content, client_secret, &event.pubkey)?;
    Ok(serde_json::from_str(&body)?)
}

/// Capabilities a wallet advertises in its info event.
pub fn wallet_capabilities(info: &Event) -> PeerCapabilities {
    PeerCapabilities::from_encryption_tag(info.tag_value("encryption"))
}

/// NIP-47 request event plus the scheme its content uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedWalletRequest {
    pub event: Event,
    pub scheme: Scheme,
}

impl SealedWalletRequest {
    /// Filter matching the wallet's response to this request.
    pub fn response_filter(&self, wallet_pubkey: &str) -> Filter {
        Filter::new()
            .kinds(vec![WALLET_RESPONSE_KIND])
            .authors(vec![wallet_pubkey.to_string()])
            .tag("e", vec![self.event.id.clone()])
    }
}

/// Build a NIP-47 request event for the wallet in `uri`.
pub fn build_wallet_request(
    encryption: &EncryptionService,
    uri: &WalletConnectUri,
    peer: &PeerCapabilities,
    request: &WalletRequest,
) -> Result<SealedWalletRequest> {
    let scheme = encryption.select_scheme(peer);
    let body = serde_json::to_string(request)?;
    let envelope = encryption.encrypt(scheme, &uri.secret, &uri.wallet_pubkey, &body)?;

    let mut tags = vec![vec!["p".to_string(), uri.wallet_pubkey.clone()]];
    if scheme == Scheme::Nip44V2 {
        tags.push(vec!["encryption".to_string(), scheme.as_tag().to_string()]);
    }
    let template = EventTemplate::now(WALLET_REQUEST_KIND, tags, envelope.to_content());
    Ok(SealedWalletRequest {
        event: sign(&template, &uri.secret)?,
        scheme,
    })
}

/// Open a NIP-47 response. Its scheme must match the request's.
pub fn open_wallet_response(
    encryption: &EncryptionService,
    uri: &WalletConnectUri,
    expected: Scheme,
    event: &Event,
) -> Result<WalletResponse> {
    expect_kind(event, WALLET_RESPONSE_KIND)?;
    if !event.pubkey.eq_ignore_ascii_case(&uri.wallet_pubkey) {
        return Err(ClientError::DecryptionFailed(format!(
            "response signed by {}, expected wallet {}",
            event.pubkey, uri.wallet_pubkey
        )));
    }
    expect_signed(event)?;
    let body = encryption.decrypt_expecting(expected, &event.content, &uri.secret, &event.pubkey)?;
    Ok(serde_json::from_str(&body)?)
}
