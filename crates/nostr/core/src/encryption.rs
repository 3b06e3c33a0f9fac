//! Envelope encryption with pluggable scheme selection.
//!
//! Two schemes are supported:
//! - [`Scheme::Nip04`]: legacy shared-secret AES-CBC
//! - [`Scheme::Nip44V2`]: versioned conversation-key ChaCha20 + HMAC
//!
//! Outgoing envelopes for remote-signer and wallet-connect handshakes go
//! through a [`SchemePolicy`]. Conversation keys are derived once per
//! (local key, peer key, scheme) and reused for the lifetime of the service.

use crate::{nip04, nip44};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while building or opening envelopes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncryptionError {
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("unsupported encryption scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid plaintext: {0}")]
    InvalidPlaintext(String),
}

/// Encryption scheme tag carried by every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scheme {
    /// SchemeA: NIP-04 legacy shared secret.
    #[serde(rename = "nip04")]
    Nip04,
    /// SchemeB: NIP-44 version 2 conversation key.
    #[serde(rename = "nip44_v2")]
    Nip44V2,
}

impl Scheme {
    /// Tag string used in `encryption` event tags.
    pub fn as_tag(&self) -> &'static str {
        match self {
            Scheme::Nip04 => "nip04",
            Scheme::Nip44V2 => "nip44_v2",
        }
    }

    /// Parse a tag string.
    pub fn from_tag(tag: &str) -> Result<Self, EncryptionError> {
        match tag {
            "nip04" => Ok(Scheme::Nip04),
            "nip44_v2" => Ok(Scheme::Nip44V2),
            other => Err(EncryptionError::UnsupportedScheme(other.to_string())),
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// An encrypted message: scheme tag, nonce/IV and ciphertext.
///
/// For [`Scheme::Nip44V2`] the ciphertext includes the trailing MAC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionEnvelope {
    pub scheme: Scheme,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

impl EncryptionEnvelope {
    /// Encode as event content in the scheme's wire format.
    pub fn to_content(&self) -> String {
        match self.scheme {
            Scheme::Nip04 => nip04::format_content(&self.nonce, &self.ciphertext),
            Scheme::Nip44V2 => nip44::encode_payload(&self.nonce, &self.ciphertext),
        }
    }

    /// Parse event content, detecting the scheme from its encoding.
    pub fn parse(content: &str) -> Result<Self, EncryptionError> {
        if content.contains("?iv=") {
            let (nonce, ciphertext) = nip04::parse_content(content)?;
            return Ok(Self {
                scheme: Scheme::Nip04,
                nonce,
                ciphertext,
            });
        }

        let (nonce, ciphertext) = nip44::decode_payload(content)?;
        Ok(Self {
            scheme: Scheme::Nip44V2,
            nonce,
            ciphertext,
        })
    }
}

/// What a peer has declared about the schemes it can read.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PeerCapabilities {
    /// Nothing declared.
    #[default]
    Unknown,
    /// Explicit list of supported schemes.
    Declared(Vec<Scheme>),
}

impl PeerCapabilities {
    /// Build from the value of a wallet-connect `encryption` tag.
    ///
    /// A missing tag means the wallet predates NIP-44 and only reads NIP-04.
    /// Unknown scheme names are ignored.
    pub fn from_encryption_tag(value: Option<&str>) -> Self {
        match value {
            None => PeerCapabilities::Declared(vec![Scheme::Nip04]),
            Some(value) => PeerCapabilities::Declared(
                value
                    .split_whitespace()
                    .filter_map(|tag| Scheme::from_tag(tag).ok())
                    .collect(),
            ),
        }
    }

    /// Whether the peer is known or assumed to read `scheme`.
    pub fn supports(&self, scheme: Scheme) -> bool {
        match self {
            PeerCapabilities::Unknown => true,
            PeerCapabilities::Declared(schemes) => schemes.contains(&scheme),
        }
    }
}

/// Strategy deciding which scheme to use for a given peer.
pub trait SchemePolicy: Send + Sync {
    fn select(&self, peer: &PeerCapabilities) -> Scheme;
}

/// Use NIP-44 unless the peer declared it cannot read it.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreferVersioned;

impl SchemePolicy for PreferVersioned {
    fn select(&self, peer: &PeerCapabilities) -> Scheme {
        if peer.supports(Scheme::Nip44V2) {
            Scheme::Nip44V2
        } else {
            Scheme::Nip04
        }
    }
}

/// Always use NIP-04.
#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyOnly;

impl SchemePolicy for LegacyOnly {
    fn select(&self, _peer: &PeerCapabilities) -> Scheme {
        Scheme::Nip04
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ConversationId {
    /// SHA-256 of the local secret key
    local: [u8; 32],
    peer: String,
    scheme: Scheme,
}

impl ConversationId {
    fn new(scheme: Scheme, secret_key: &[u8; 32], peer_pubkey: &str) -> Self {
        Self {
            local: Sha256::digest(secret_key).into(),
            peer: peer_pubkey.to_lowercase(),
            scheme,
        }
    }
}

/// Builds and opens encrypted envelopes, caching conversation keys.
pub struct EncryptionService {
    policy: Arc<dyn SchemePolicy>,
    conversations: Mutex<HashMap<ConversationId, [u8; 32]>>,
}

impl EncryptionService {
    /// Create a service with the [`PreferVersioned`] policy.
    pub fn new() -> Self {
        Self::with_policy(Arc::new(PreferVersioned))
    }

    /// Create a service with a custom scheme policy.
    pub fn with_policy(policy: Arc<dyn SchemePolicy>) -> Self {
        Self {
            policy,
            conversations: Mutex::new(HashMap::new()),
        }
    }

    /// Scheme the policy picks for `peer`.
    pub fn select_scheme(&self, peer: &PeerCapabilities) -> Scheme {
        self.policy.select(peer)
    }

    /// Conversation key for a key pair, derived on first use.
    pub fn conversation_key(
        &self,
        scheme: Scheme,
        secret_key: &[u8; 32],
        peer_pubkey: &str,
    ) -> Result<[u8; 32], EncryptionError> {
        let id = ConversationId::new(scheme, secret_key, peer_pubkey);

        if let Some(key) = self.conversations.lock().get(&id) {
            return Ok(*key);
        }

        let key = match scheme {
            Scheme::Nip04 => nip04::shared_secret(secret_key, peer_pubkey)?,
            Scheme::Nip44V2 => nip44::get_conversation_key(secret_key, peer_pubkey)?,
        };
        self.conversations.lock().insert(id, key);
        Ok(key)
    }

    /// Encrypt `plaintext` from `sender_secret_key` to `recipient_pubkey`.
    pub fn encrypt(
        &self,
        scheme: Scheme,
        sender_secret_key: &[u8; 32],
        recipient_pubkey: &str,
        plaintext: &str,
    ) -> Result<EncryptionEnvelope, EncryptionError> {
        let key = self.conversation_key(scheme, sender_secret_key, recipient_pubkey)?;
        match scheme {
            Scheme::Nip04 => {
                let (iv, ciphertext) = nip04::encrypt_with_key(&key, plaintext);
                Ok(EncryptionEnvelope {
                    scheme,
                    nonce: iv.to_vec(),
                    ciphertext,
                })
            }
            Scheme::Nip44V2 => {
                let payload = nip44::encrypt(&key, plaintext)?;
                let (nonce, ciphertext) = nip44::decode_payload(&payload)?;
                Ok(EncryptionEnvelope {
                    scheme,
                    nonce,
                    ciphertext,
                })
            }
        }
    }

    /// Encrypt for a peer using the scheme the policy selects.
    pub fn encrypt_for_peer(
        &self,
        peer: &PeerCapabilities,
        sender_secret_key: &[u8; 32],
        recipient_pubkey: &str,
        plaintext: &str,
    ) -> Result<EncryptionEnvelope, EncryptionError> {
        let scheme = self.select_scheme(peer);
        self.encrypt(scheme, sender_secret_key, recipient_pubkey, plaintext)
    }

    /// Open an envelope using the scheme its tag names.
    pub fn decrypt(
        &self,
        envelope: &EncryptionEnvelope,
        receiver_secret_key: &[u8; 32],
        sender_pubkey: &str,
    ) -> Result<String, EncryptionError> {
        let key = self.conversation_key(envelope.scheme, receiver_secret_key, sender_pubkey)?;
        match envelope.scheme {
            Scheme::Nip04 => nip04::decrypt_with_key(&key, &envelope.nonce, &envelope.ciphertext),
            Scheme::Nip44V2 => {
                nip44::decrypt_with_nonce(&key, &envelope.nonce, &envelope.ciphertext)
            }
        }
    }

    /// Parse event content and open it with whichever scheme it uses.
    pub fn decrypt_content(
        &self,
        content: &str,
        receiver_secret_key: &[u8; 32],
        sender_pubkey: &str,
    ) -> Result<String, EncryptionError> {
        let envelope = EncryptionEnvelope::parse(content)?;
        self.decrypt(&envelope, receiver_secret_key, sender_pubkey)
    }

    /// Open content that must be encrypted with `expected`.
    pub fn decrypt_expecting(
        &self,
        expected: Scheme,
        content: &str,
        receiver_secret_key: &[u8; 32],
        sender_pubkey: &str,
    ) -> Result<String, EncryptionError> {
        let envelope = EncryptionEnvelope::parse(content)?;
        if envelope.scheme != expected {
            return Err(EncryptionError::DecryptionFailed(format!(
                "expected {} envelope, got {}",
                expected, envelope.scheme
            )));
        }
        self.decrypt(&envelope, receiver_secret_key, sender_pubkey)
    }

    /// Drop cached conversation keys involving `peer_pubkey`.
    pub fn forget_peer(&self, peer_pubkey: &str) {
        let peer = peer_pubkey.to_lowercase();
        self.conversations.lock().retain(|id, _| id.peer != peer);
    }

    /// Number of cached conversation keys.
    pub fn cached_conversations(&self) -> usize {
        self.conversations.lock().len()
    }
}

impl Default for EncryptionService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nip01::{generate_secret_key, get_public_key_hex};

    struct Pair {
        alice: [u8; 32],
        bob: [u8; 32],
        alice_pk: String,
        bob_pk: String,
    }

    fn pair() -> Pair {
        let alice = generate_secret_key();
        let bob = generate_secret_key();
        Pair {
            alice_pk: get_public_key_hex(&alice).unwrap(),
            bob_pk: get_public_key_hex(&bob).unwrap(),
            alice,
            bob,
        }
    }

    #[test]
    fn test_roundtrip_both_schemes() {
        let keys = pair();
        let service = EncryptionService::new();

        for scheme in [Scheme::Nip04, Scheme::Nip44V2] {
            let envelope = service
                .encrypt(scheme, &keys.alice, &keys.bob_pk, "get_balance")
                .unwrap();
            assert_eq!(envelope.scheme, scheme);

            let opened = service.decrypt(&envelope, &keys.bob, &keys.alice_pk).unwrap();
            assert_eq!(opened, "get_balance");
        }
    }

    #[test]
    fn test_content_roundtrip_detects_scheme() {
        let keys = pair();
        let service = EncryptionService::new();

        for scheme in [Scheme::Nip04, Scheme::Nip44V2] {
            let envelope = service
                .encrypt(scheme, &keys.alice, &keys.bob_pk, "connect")
                .unwrap();
            let content = envelope.to_content();
            assert_eq!(EncryptionEnvelope::parse(&content).unwrap().scheme, scheme);
            assert_eq!(
                service
                    .decrypt_content(&content, &keys.bob, &keys.alice_pk)
                    .unwrap(),
                "connect"
            );
        }
    }

    #[test]
    fn test_mismatched_scheme_tag_fails() {
        let keys = pair();
        let service = EncryptionService::new();

        let mut envelope = service
            .encrypt(Scheme::Nip44V2, &keys.alice, &keys.bob_pk, "secret")
            .unwrap();
        envelope.scheme = Scheme::Nip04;
        assert!(matches!(
            service.decrypt(&envelope, &keys.bob, &keys.alice_pk),
            Err(EncryptionError::DecryptionFailed(_))
        ));

        let mut envelope = service
            .encrypt(Scheme::Nip04, &keys.alice, &keys.bob_pk, "secret")
            .unwrap();
        envelope.scheme = Scheme::Nip44V2;
        assert!(matches!(
            service.decrypt(&envelope, &keys.bob, &keys.alice_pk),
            Err(EncryptionError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_decrypt_expecting_rejects_other_scheme() {
        let keys = pair();
        let service = EncryptionService::new();
        let content = service
            .encrypt(Scheme::Nip04, &keys.alice, &keys.bob_pk, "hello")
            .unwrap()
            .to_content();

        assert!(matches!(
            service.decrypt_expecting(Scheme::Nip44V2, &content, &keys.bob, &keys.alice_pk),
            Err(EncryptionError::DecryptionFailed(_))
        ));
        assert_eq!(
            service
                .decrypt_expecting(Scheme::Nip04, &content, &keys.bob, &keys.alice_pk)
                .unwrap(),
            "hello"
        );
    }

    #[test]
    fn test_wrong_key_fails_nip44() {
        let keys = pair();
        let eve = generate_secret_key();
        let service = EncryptionService::new();
        let envelope = service
            .encrypt(Scheme::Nip44V2, &keys.alice, &keys.bob_pk, "secret")
            .unwrap();

        assert!(matches!(
            service.decrypt(&envelope, &eve, &keys.alice_pk),
            Err(EncryptionError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_conversation_key_is_reused() {
        let keys = pair();
        let service = EncryptionService::new();

        let first = service
            .conversation_key(Scheme::Nip44V2, &keys.alice, &keys.bob_pk)
            .unwrap();
        service
            .encrypt(Scheme::Nip44V2, &keys.alice, &keys.bob_pk, "one")
            .unwrap();
        service
            .encrypt(Scheme::Nip44V2, &keys.alice, &keys.bob_pk, "two")
            .unwrap();
        assert_eq!(service.cached_conversations(), 1);
        assert_eq!(
            service
                .conversation_key(Scheme::Nip44V2, &keys.alice, &keys.bob_pk)
                .unwrap(),
            first
        );

        service.forget_peer(&keys.bob_pk);
        assert_eq!(service.cached_conversations(), 0);
    }

    #[test]
    fn test_conversation_keys_are_per_local_key() {
        let keys = pair();
        let carol = generate_secret_key();
        let service = EncryptionService::new();

        let from_alice = service
            .conversation_key(Scheme::Nip04, &keys.alice, &keys.bob_pk)
            .unwrap();
        let from_carol = service
            .conversation_key(Scheme::Nip04, &carol, &keys.bob_pk)
            .unwrap();
        assert_ne!(from_alice, from_carol);
        assert_eq!(service.cached_conversations(), 2);

        // bob's side of the same conversation derives the same key
        assert_eq!(
            service
                .conversation_key(Scheme::Nip04, &keys.bob, &keys.alice_pk)
                .unwrap(),
            from_alice
        );
        assert_eq!(
            service
                .conversation_key(Scheme::Nip04, &keys.alice, &keys.bob_pk.to_uppercase())
                .unwrap(),
            from_alice
        );
        assert_eq!(service.cached_conversations(), 3);
    }

    #[test]
    fn test_invalid_local_key_is_not_cached() {
        let keys = pair();
        let service = EncryptionService::new();
        assert!(matches!(
            service.conversation_key(Scheme::Nip44V2, &[0u8; 32], &keys.bob_pk),
            Err(EncryptionError::InvalidKey(_))
        ));
        assert_eq!(service.cached_conversations(), 0);
    }

    #[test]
    fn test_policy_selection() {
        let policy = PreferVersioned;
        assert_eq!(policy.select(&PeerCapabilities::Unknown), Scheme::Nip44V2);
        assert_eq!(
            policy.select(&PeerCapabilities::from_encryption_tag(None)),
            Scheme::Nip04
        );
        assert_eq!(
            policy.select(&PeerCapabilities::from_encryption_tag(Some("nip44_v2 nip04"))),
            Scheme::Nip44V2
        );
        assert_eq!(
            policy.select(&PeerCapabilities::from_encryption_tag(Some("nip04 nip99"))),
            Scheme::Nip04
        );
        assert_eq!(LegacyOnly.select(&PeerCapabilities::Unknown), Scheme::Nip04);
    }

    #[test]
    fn test_encrypt_for_peer_falls_back() {
        let keys = pair();
        let service = EncryptionService::new();
        let legacy_wallet = PeerCapabilities::from_encryption_tag(None);

        let envelope = service
            .encrypt_for_peer(&legacy_wallet, &keys.alice, &keys.bob_pk, "pay")
            .unwrap();
        assert_eq!(envelope.scheme, Scheme::Nip04);
    }

    #[test]
    fn test_unknown_scheme_tag() {
        assert!(matches!(
            Scheme::from_tag("nip99"),
            Err(EncryptionError::UnsupportedScheme(_))
        ));
    }
}
