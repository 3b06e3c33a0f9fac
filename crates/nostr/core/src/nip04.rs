//! NIP-04: Encrypted Direct Message (legacy scheme).
//!
//! AES-256-CBC keyed by the raw ECDH x-coordinate, PKCS#7 padded, with a
//! random 16-byte IV. Content format: `base64(ciphertext)?iv=base64(iv)`.
//!
//! NIP-04 carries no authentication tag. A wrong key is only detected when the
//! padding or the UTF-8 check fails.

use crate::encryption::EncryptionError;
use crate::nip01::parse_public_key;
use aes::Aes256;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use secp256k1::SecretKey;

/// Size of the CBC initialization vector.
pub const IV_SIZE: usize = 16;

/// Kind used for NIP-04 direct messages.
pub const ENCRYPTED_DM_KIND: u32 = 4;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Shared secret used as the AES key: the x-coordinate of `sk * PK`.
pub fn shared_secret(secret_key: &[u8; 32], pubkey_hex: &str) -> Result<[u8; 32], EncryptionError> {
    let sk = SecretKey::from_slice(secret_key)
        .map_err(|e| EncryptionError::InvalidKey(e.to_string()))?;
    let pk = parse_public_key(pubkey_hex).map_err(|e| EncryptionError::InvalidKey(e.to_string()))?;
    let point = secp256k1::ecdh::shared_secret_point(&pk, &sk);
    let mut x = [0u8; 32];
    x.copy_from_slice(&point[..32]);
    Ok(x)
}

/// Encrypt with an explicit IV. Returns the raw ciphertext.
pub fn encrypt_with_iv(key: &[u8; 32], iv: &[u8; IV_SIZE], plaintext: &str) -> Vec<u8> {
    Aes256CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes())
}

/// Encrypt with a fresh random IV. Returns `(iv, ciphertext)`.
pub fn encrypt_with_key(key: &[u8; 32], plaintext: &str) -> ([u8; IV_SIZE], Vec<u8>) {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    let ciphertext = encrypt_with_iv(key, &iv, plaintext);
    (iv, ciphertext)
}

/// Decrypt raw ciphertext with the shared key and IV.
pub fn decrypt_with_key(
    key: &[u8; 32],
    iv: &[u8],
    ciphertext: &[u8],
) -> Result<String, EncryptionError> {
    let iv: &[u8; IV_SIZE] = iv.try_into().map_err(|_| {
        EncryptionError::DecryptionFailed(format!("iv must be {} bytes, got {}", IV_SIZE, iv.len()))
    })?;
    if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
        return Err(EncryptionError::DecryptionFailed(
            "ciphertext is not a whole number of blocks".to_string(),
        ));
    }

    let plaintext = Aes256CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| EncryptionError::DecryptionFailed("bad padding".to_string()))?;

    String::from_utf8(plaintext)
        .map_err(|_| EncryptionError::DecryptionFailed("plaintext is not utf-8".to_string()))
}

/// Format `(iv, ciphertext)` as NIP-04 content.
pub fn format_content(iv: &[u8], ciphertext: &[u8]) -> String {
    format!("{}?iv={}", BASE64.encode(ciphertext), BASE64.encode(iv))
}

/// Split NIP-04 content into `(iv, ciphertext)`.
pub fn parse_content(content: &str) -> Result<(Vec<u8>, Vec<u8>), EncryptionError> {
    let (ct_b64, iv_b64) = content.split_once("?iv=").ok_or_else(|| {
        EncryptionError::DecryptionFailed("missing ?iv= separator".to_string())
    })?;
    let ciphertext = BASE64
        .decode(ct_b64)
        .map_err(|e| EncryptionError::DecryptionFailed(format!("ciphertext base64: {}", e)))?;
    let iv = BASE64
        .decode(iv_b64)
        .map_err(|e| EncryptionError::DecryptionFailed(format!("iv base64: {}", e)))?;
    Ok((iv, ciphertext))
}

/// Encrypt a message from `secret_key` to `pubkey_hex`.
pub fn encrypt(
    secret_key: &[u8; 32],
    pubkey_hex: &str,
    plaintext: &str,
) -> Result<String, EncryptionError> {
    let key = shared_secret(secret_key, pubkey_hex)?;
    let (iv, ciphertext) = encrypt_with_key(&key, plaintext);
    Ok(format_content(&iv, &ciphertext))
}

/// Decrypt NIP-04 content received from `pubkey_hex`.
pub fn decrypt(
    secret_key: &[u8; 32],
    pubkey_hex: &str,
    content: &str,
) -> Result<String, EncryptionError> {
    let key = shared_secret(secret_key, pubkey_hex)?;
    let (iv, ciphertext) = parse_content(content)?;
    decrypt_with_key(&key, &iv, &ciphertext)
}
