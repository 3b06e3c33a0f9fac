//! NIP-01: Basic protocol flow description.
//!
//! This module implements the core Nostr event structure and operations:
//! - Event structure (id, pubkey, created_at, kind, tags, content, sig)
//! - Event serialization for hashing
//! - Event signing with BIP-340 Schnorr signatures
//! - Event verification

use rand::RngCore;
use secp256k1::{Keypair, Message, PublicKey, SECP256K1, SecretKey, XOnlyPublicKey, schnorr};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors that can occur during NIP-01 operations.
#[derive(Debug, Error)]
pub enum Nip01Error {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("verification error: {0}")]
    Verification(String),

    #[error("invalid secret key: {0}")]
    InvalidSecretKey(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
}

/// A signed Nostr event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 32-bytes lowercase hex-encoded sha256 of the serialized event data
    pub id: String,
    /// 32-bytes lowercase hex-encoded public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u32,
    /// Array of arrays of strings (tags)
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    #[serde(default)]
    pub content: String,
    /// 64-bytes lowercase hex signature
    #[serde(default)]
    pub sig: String,
}

impl Event {
    /// First value of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.len() >= 2 && tag[0] == name)
            .map(|tag| tag[1].as_str())
    }
}

/// An unsigned event (before signing).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// A template for creating events. The pubkey comes from the signing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTemplate {
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl EventTemplate {
    /// Template stamped with the current wall-clock time.
    pub fn now(kind: u32, tags: Vec<Vec<String>>, content: impl Into<String>) -> Self {
        Self {
            created_at: unix_now(),
            kind,
            tags,
            content: content.into(),
        }
    }
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Generate a random 32-byte secret key.
pub fn generate_secret_key() -> [u8; 32] {
    loop {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        if SecretKey::from_slice(&key).is_ok() {
            return key;
        }
    }
}

/// Get the x-only public key (32 bytes) for a secret key.
pub fn get_public_key(secret_key: &[u8; 32]) -> Result<[u8; 32], Nip01Error> {
    let sk = SecretKey::from_slice(secret_key)
        .map_err(|e| Nip01Error::InvalidSecretKey(e.to_string()))?;
    let (xonly, _parity) = sk.x_only_public_key(SECP256K1);
    Ok(xonly.serialize())
}

/// Get the public key as a hex string from a secret key.
pub fn get_public_key_hex(secret_key: &[u8; 32]) -> Result<String, Nip01Error> {
    Ok(hex::encode(get_public_key(secret_key)?))
}

/// Parse a hex x-only public key into a full point with even parity.
pub fn parse_public_key(pubkey_hex: &str) -> Result<PublicKey, Nip01Error> {
    let bytes =
        hex::decode(pubkey_hex).map_err(|e| Nip01Error::InvalidPublicKey(e.to_string()))?;
    let xonly = XOnlyPublicKey::from_slice(&bytes)
        .map_err(|e| Nip01Error::InvalidPublicKey(e.to_string()))?;
    Ok(xonly.public_key(secp256k1::Parity::Even))
}

/// Serialize an unsigned event for hashing.
///
/// Format: `[0, pubkey, created_at, kind, tags, content]`
pub fn serialize_event(event: &UnsignedEvent) -> Result<String, Nip01Error> {
    if !is_lower_hex(&event.pubkey, 64) {
        return Err(Nip01Error::InvalidEvent(
            "pubkey must be 64 lowercase hex characters".to_string(),
        ));
    }

    serde_json::to_string(&(
        0,
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    ))
    .map_err(|e| Nip01Error::Serialization(e.to_string()))
}

/// Get the event hash (id) from an unsigned event.
pub fn get_event_hash(event: &UnsignedEvent) -> Result<String, Nip01Error> {
    let serialized = serialize_event(event)?;
    Ok(hex::encode(Sha256::digest(serialized.as_bytes())))
}

/// Sign an event template with a secret key, producing a complete signed event.
pub fn finalize_event(
    template: &EventTemplate,
    secret_key: &[u8; 32],
) -> Result<Event, Nip01Error> {
    let sk = SecretKey::from_slice(secret_key).map_err(|e| Nip01Error::Signing(e.to_string()))?;
    let keypair = Keypair::from_secret_key(SECP256K1, &sk);
    let (xonly_pk, _parity) = keypair.x_only_public_key();
    let pubkey = hex::encode(xonly_pk.serialize());

    let unsigned = UnsignedEvent {
        pubkey: pubkey.clone(),
        created_at: template.created_at,
        kind: template.kind,
        tags: template.tags.clone(),
        content: template.content.clone(),
    };
    let id = get_event_hash(&unsigned)?;

    let message = message_from_hex(&id).map_err(Nip01Error::Signing)?;
    let sig = SECP256K1.sign_schnorr_no_aux_rand(&message, &keypair);

    Ok(Event {
        id,
        pubkey,
        created_at: unsigned.created_at,
        kind: unsigned.kind,
        tags: unsigned.tags,
        content: unsigned.content,
        sig: hex::encode(sig.serialize()),
    })
}

/// Verify an event's id and signature.
pub fn verify_event(event: &Event) -> Result<bool, Nip01Error> {
    if !is_lower_hex(&event.id, 64) || !is_lower_hex(&event.pubkey, 64) {
        return Ok(false);
    }
    if event.sig.len() != 128 {
        return Ok(false);
    }

    let unsigned = UnsignedEvent {
        pubkey: event.pubkey.clone(),
        created_at: event.created_at,
        kind: event.kind,
        tags: event.tags.clone(),
        content: event.content.clone(),
    };
    if get_event_hash(&unsigned)? != event.id {
        return Ok(false);
    }

    let message = message_from_hex(&event.id).map_err(Nip01Error::Verification)?;
    let sig_bytes = hex::decode(&event.sig)
        .map_err(|e| Nip01Error::Verification(format!("invalid sig hex: {}", e)))?;
    let sig = schnorr::Signature::from_slice(&sig_bytes)
        .map_err(|e| Nip01Error::Verification(format!("invalid signature: {}", e)))?;
    let pubkey_bytes = hex::decode(&event.pubkey)
        .map_err(|e| Nip01Error::Verification(format!("invalid pubkey hex: {}", e)))?;
    let pubkey = XOnlyPublicKey::from_slice(&pubkey_bytes)
        .map_err(|e| Nip01Error::Verification(format!("invalid pubkey: {}", e)))?;

    Ok(SECP256K1.verify_schnorr(&sig, &message, &pubkey).is_ok())
}

fn message_from_hex(id: &str) -> Result<Message, String> {
    let bytes = hex::decode(id).map_err(|e| format!("invalid id hex: {}", e))?;
    let digest: [u8; 32] = bytes
        .try_into()
        .map_err(|_| "event id must be 32 bytes".to_string())?;
    Ok(Message::from_digest(digest))
}

fn is_lower_hex(value: &str, len: usize) -> bool {
    value.len() == len && value.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test private key used in nostr-tools tests
    const TEST_PRIVATE_KEY: &str =
        "d217c1ff2f8a65c3e3a1740db3b9f58b8c848bb45e26d00ed4714e4a0f4ceecf";

    fn test_private_key() -> [u8; 32] {
        hex::decode(TEST_PRIVATE_KEY).unwrap().try_into().unwrap()
    }

    fn note(content: &str) -> EventTemplate {
        EventTemplate {
            created_at: 1_617_932_115,
            kind: 1,
            tags: vec![],
            content: content.to_string(),
        }
    }

    #[test]
    fn test_public_key_generation() {
        let mut one = [0u8; 32];
        one[31] = 1;
        // Secret key 1 maps to the generator point.
        assert_eq!(
            get_public_key_hex(&one).unwrap(),
            "79be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798"
        );

        let pk = get_public_key_hex(&test_private_key()).unwrap();
        assert_eq!(pk.len(), 64);
        assert!(parse_public_key(&pk).is_ok());
    }

    #[test]
    fn test_finalize_event_creates_signed_event() {
        let event = finalize_event(&note("Hello, world!"), &test_private_key()).unwrap();

        assert_eq!(event.kind, 1);
        assert_eq!(event.content, "Hello, world!");
        assert_eq!(event.id.len(), 64);
        assert_eq!(event.sig.len(), 128);
        assert!(verify_event(&event).unwrap());
    }

    #[test]
    fn test_verify_event_rejects_tampered_content() {
        let mut event = finalize_event(&note("original"), &test_private_key()).unwrap();
        event.content = "tampered".to_string();
        assert!(!verify_event(&event).unwrap());
    }

    #[test]
    fn test_verify_event_rejects_wrong_pubkey() {
        let mut event = finalize_event(&note("hi"), &test_private_key()).unwrap();
        event.pubkey = get_public_key_hex(&generate_secret_key()).unwrap();
        assert!(!verify_event(&event).unwrap());
    }

    #[test]
    fn test_deterministic_event_id() {
        let a = finalize_event(&note("same"), &test_private_key()).unwrap();
        let b = finalize_event(&note("same"), &test_private_key()).unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn test_serialize_event_rejects_uppercase_pubkey() {
        let unsigned = UnsignedEvent {
            pubkey: "6E468422DFB74A5738702A8823B9B28168ABAB8655FAACB6853CD0EE15DEEE93".to_string(),
            created_at: 0,
            kind: 1,
            tags: vec![],
            content: String::new(),
        };
        assert!(serialize_event(&unsigned).is_err());
    }

    #[test]
    fn test_event_decodes_with_missing_optional_fields() {
        let json = r#"{"id":"abc","pubkey":"pk","created_at":1,"kind":10000113,"extra":true}"#;
        let event: Event = serde_json::from_str(json).unwrap();
        assert!(event.tags.is_empty());
        assert_eq!(event.content, "");
        assert_eq!(event.kind, 10000113);
    }

    #[test]
    fn test_tag_value() {
        let mut event = finalize_event(&note("x"), &test_private_key()).unwrap();
        event.tags = vec![vec!["p".to_string(), "abc".to_string()]];
        assert_eq!(event.tag_value("p"), Some("abc"));
        assert_eq!(event.tag_value("e"), None);
    }
}
