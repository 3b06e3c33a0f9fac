//! Nostr protocol primitives for the multiplexed client.
//!
//! This crate provides:
//! - NIP-01: Event type, serialization, signing and verification
//! - NIP-04: Legacy encrypted content (SchemeA)
//! - NIP-44: Versioned encryption (SchemeB)
//! - [`EncryptionService`]: envelope building with a pluggable [`SchemePolicy`]
//! - [`Signer`]: the signing seam used by event publishing

pub mod encryption;
pub mod nip01;
pub mod nip04;
pub mod nip44;
mod signer;

pub use encryption::{
    EncryptionEnvelope, EncryptionError, EncryptionService, LegacyOnly, PeerCapabilities,
    PreferVersioned, Scheme, SchemePolicy,
};
pub use nip01::{
    Event, EventTemplate, Nip01Error, UnsignedEvent, finalize_event, generate_secret_key,
    get_event_hash, get_public_key, get_public_key_hex, parse_public_key, serialize_event,
    unix_now, verify_event,
};
pub use signer::{LocalSigner, Signer, SignerError};
