//! Event signing seam.
//!
//! Publishing code only sees [`Signer`]; key custody lives behind it.

use crate::nip01::{Event, EventTemplate, Nip01Error, finalize_event, get_public_key_hex};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("signing rejected: {0}")]
    Rejected(String),

    #[error("signer unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Nip01(#[from] Nip01Error),
}

/// Signs event templates on behalf of one identity.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Hex public key of the identity this signer signs for.
    fn public_key(&self) -> String;

    /// Produce a signed event from a template.
    async fn sign_event(&self, template: EventTemplate) -> Result<Event, SignerError>;
}

/// Signer backed by an in-memory secret key.
pub struct LocalSigner {
    secret_key: [u8; 32],
    public_key: String,
}

impl LocalSigner {
    pub fn new(secret_key: [u8; 32]) -> Result<Self, SignerError> {
        let public_key = get_public_key_hex(&secret_key)?;
        Ok(Self {
            secret_key,
            public_key,
        })
    }

    /// Secret key, for encryption alongside signing.
    pub fn secret_key(&self) -> &[u8; 32] {
        &self.secret_key
    }
}

impl std::fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSigner")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Signer for LocalSigner {
    fn public_key(&self) -> String {
        self.public_key.clone()
    }

    async fn sign_event(&self, template: EventTemplate) -> Result<Event, SignerError> {
        Ok(finalize_event(&template, &self.secret_key)?)
    }
}
