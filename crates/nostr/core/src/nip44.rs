//! NIP-44: Versioned Encryption (version 2).
//!
//! - Conversation key: HKDF-extract(salt = "nip44-v2", ikm = ECDH x-coordinate)
//! - Message keys: HKDF-expand(conversation key, info = nonce, 76 bytes)
//!   split into ChaCha20 key (32), ChaCha20 nonce (12) and HMAC key (32)
//! - Payload: `base64(0x02 || nonce[32] || ciphertext || mac[32])`
//!
//! See: <https://github.com/nostr-protocol/nips/blob/master/44.md>

use crate::encryption::EncryptionError;
use crate::nip04;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chacha20::ChaCha20;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

/// Version byte for this payload format.
pub const VERSION: u8 = 0x02;

/// Size of the per-message nonce.
pub const NONCE_SIZE: usize = 32;

/// Size of the HMAC-SHA256 tag.
pub const MAC_SIZE: usize = 32;

const SALT: &[u8] = b"nip44-v2";
const MIN_PLAINTEXT_SIZE: usize = 1;
const MAX_PLAINTEXT_SIZE: usize = 65535;

type HmacSha256 = Hmac<Sha256>;

struct MessageKeys {
    chacha_key: [u8; 32],
    chacha_nonce: [u8; 12],
    hmac_key: [u8; 32],
}

/// Derive the long-lived conversation key shared by two parties.
pub fn get_conversation_key(
    secret_key: &[u8; 32],
    pubkey_hex: &str,
) -> Result<[u8; 32], EncryptionError> {
    let shared_x = nip04::shared_secret(secret_key, pubkey_hex)?;
    let (prk, _) = Hkdf::<Sha256>::extract(Some(SALT), &shared_x);
    let mut key = [0u8; 32];
    key.copy_from_slice(&prk);
    Ok(key)
}

fn message_keys(
    conversation_key: &[u8; 32],
    nonce: &[u8; NONCE_SIZE],
) -> Result<MessageKeys, EncryptionError> {
    let hk = Hkdf::<Sha256>::from_prk(conversation_key)
        .map_err(|e| EncryptionError::InvalidKey(e.to_string()))?;
    let mut okm = [0u8; 76];
    hk.expand(nonce, &mut okm)
        .map_err(|e| EncryptionError::InvalidKey(e.to_string()))?;

    let mut keys = MessageKeys {
        chacha_key: [0u8; 32],
        chacha_nonce: [0u8; 12],
        hmac_key: [0u8; 32],
    };
    keys.chacha_key.copy_from_slice(&okm[0..32]);
    keys.chacha_nonce.copy_from_slice(&okm[32..44]);
    keys.hmac_key.copy_from_slice(&okm[44..76]);
    Ok(keys)
}

/// Padded length for a plaintext of `len` bytes.
pub fn calc_padded_len(len: usize) -> usize {
    if len <= 32 {
        return 32;
    }
    let next_power = 1usize << (usize::BITS - (len - 1).leading_zeros());
    let chunk = if next_power <= 256 { 32 } else { next_power / 8 };
    chunk * ((len - 1) / chunk + 1)
}

fn pad(plaintext: &str) -> Result<Vec<u8>, EncryptionError> {
    let bytes = plaintext.as_bytes();
    if bytes.len() < MIN_PLAINTEXT_SIZE || bytes.len() > MAX_PLAINTEXT_SIZE {
        return Err(EncryptionError::InvalidPlaintext(format!(
            "plaintext length {} outside {}..={}",
            bytes.len(),
            MIN_PLAINTEXT_SIZE,
            MAX_PLAINTEXT_SIZE
        )));
    }

    let padded_len = calc_padded_len(bytes.len());
    let mut padded = Vec::with_capacity(2 + padded_len);
    padded.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    padded.extend_from_slice(bytes);
    padded.resize(2 + padded_len, 0);
    Ok(padded)
}

fn unpad(padded: &[u8]) -> Result<String, EncryptionError> {
    if padded.len() < 2 {
        return Err(EncryptionError::DecryptionFailed("padding too short".to_string()));
    }
    let len = u16::from_be_bytes([padded[0], padded[1]]) as usize;
    if len < MIN_PLAINTEXT_SIZE
        || 2 + len > padded.len()
        || padded.len() != 2 + calc_padded_len(len)
    {
        return Err(EncryptionError::DecryptionFailed("invalid padding".to_string()));
    }
    String::from_utf8(padded[2..2 + len].to_vec())
        .map_err(|_| EncryptionError::DecryptionFailed("plaintext is not utf-8".to_string()))
}

fn compute_mac(
    hmac_key: &[u8; 32],
    nonce: &[u8],
    ciphertext: &[u8],
) -> Result<HmacSha256, EncryptionError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(hmac_key)
        .map_err(|e| EncryptionError::InvalidKey(e.to_string()))?;
    mac.update(nonce);
    mac.update(ciphertext);
    Ok(mac)
}

/// Encrypt with an explicit nonce. Returns `ciphertext || mac`.
pub fn encrypt_with_nonce(
    conversation_key: &[u8; 32],
    plaintext: &str,
    nonce: &[u8; NONCE_SIZE],
) -> Result<Vec<u8>, EncryptionError> {
    let keys = message_keys(conversation_key, nonce)?;
    let mut buf = pad(plaintext)?;
    ChaCha20::new(&keys.chacha_key.into(), &keys.chacha_nonce.into()).apply_keystream(&mut buf);

    let tag = compute_mac(&keys.hmac_key, nonce, &buf)?.finalize().into_bytes();
    buf.extend_from_slice(&tag);
    Ok(buf)
}

/// Decrypt `ciphertext || mac` produced for `nonce`.
pub fn decrypt_with_nonce(
    conversation_key: &[u8; 32],
    nonce: &[u8],
    sealed: &[u8],
) -> Result<String, EncryptionError> {
    let nonce: &[u8; NONCE_SIZE] = nonce.try_into().map_err(|_| {
        EncryptionError::DecryptionFailed(format!(
            "nonce must be {} bytes, got {}",
            NONCE_SIZE,
            nonce.len()
        ))
    })?;
    if sealed.len() < MAC_SIZE + 2 + 32 {
        return Err(EncryptionError::DecryptionFailed("ciphertext too short".to_string()));
    }

    let (ciphertext, tag) = sealed.split_at(sealed.len() - MAC_SIZE);
    let keys = message_keys(conversation_key, nonce)?;
    compute_mac(&keys.hmac_key, nonce, ciphertext)?
        .verify_slice(tag)
        .map_err(|_| EncryptionError::DecryptionFailed("invalid MAC".to_string()))?;

    let mut buf = ciphertext.to_vec();
    ChaCha20::new(&keys.chacha_key.into(), &keys.chacha_nonce.into()).apply_keystream(&mut buf);
    unpad(&buf)
}

/// Encode `(nonce, ciphertext || mac)` as a versioned base64 payload.
pub fn encode_payload(nonce: &[u8], sealed: &[u8]) -> String {
    let mut raw = Vec::with_capacity(1 + nonce.len() + sealed.len());
    raw.push(VERSION);
    raw.extend_from_slice(nonce);
    raw.extend_from_slice(sealed);
    BASE64.encode(raw)
}

/// Decode a versioned payload into `(nonce, ciphertext || mac)`.
pub fn decode_payload(payload: &str) -> Result<(Vec<u8>, Vec<u8>), EncryptionError> {
    if payload.starts_with('#') {
        return Err(EncryptionError::UnsupportedScheme(
            "unknown nip44 encoding".to_string(),
        ));
    }
    let raw = BASE64
        .decode(payload)
        .map_err(|e| EncryptionError::DecryptionFailed(format!("payload base64: {}", e)))?;
    match raw.first() {
        Some(&VERSION) => {}
        Some(other) => {
            return Err(EncryptionError::UnsupportedScheme(format!(
                "nip44 version {}",
                other
            )));
        }
        None => return Err(EncryptionError::DecryptionFailed("empty payload".to_string())),
    }
    if raw.len() < 1 + NONCE_SIZE + MAC_SIZE {
        return Err(EncryptionError::DecryptionFailed("payload too short".to_string()));
    }
    let nonce = raw[1..1 + NONCE_SIZE].to_vec();
    let sealed = raw[1 + NONCE_SIZE..].to_vec();
    Ok((nonce, sealed))
}

/// Encrypt with a random nonce, returning the base64 payload.
pub fn encrypt(conversation_key: &[u8; 32], plaintext: &str) -> Result<String, EncryptionError> {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    let sealed = encrypt_with_nonce(conversation_key, plaintext, &nonce)?;
    Ok(encode_payload(&nonce, &sealed))
}

/// Decrypt a base64 payload.
pub fn decrypt(conversation_key: &[u8; 32], payload: &str) -> Result<String, EncryptionError> {
    let (nonce, sealed) = decode_payload(payload)?;
    decrypt_with_nonce(conversation_key, &nonce, &sealed)
}
