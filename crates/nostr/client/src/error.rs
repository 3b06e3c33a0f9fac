//! Client error types

use crate::message::MessageError;
use nostr::{EncryptionError, SignerError};
use thiserror::Error;

/// Client error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Transport unavailable at send time
    #[error("Not connected to {0} server")]
    NotConnected(String),

    /// Deadline elapsed before a terminal frame arrived
    #[error("Request {0} timed out")]
    Timeout(String),

    /// Structurally invalid frame addressed to this request
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Recognizable but unhandled frame kind
    #[error("Unknown frame: {0}")]
    UnknownFrame(String),

    /// Envelope could not be opened
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Envelope uses a scheme this client does not know
    #[error("Unsupported encryption scheme: {0}")]
    UnsupportedScheme(String),

    /// Another page fetch for the same query is in flight
    #[error("Concurrent advance for query {0}")]
    ConcurrentAdvance(String),

    /// Cancelled by the caller
    #[error("Request {0} cancelled")]
    Cancelled(String),

    /// Event id or signature does not check out
    #[error("Invalid signature on event {0}")]
    InvalidSignature(String),

    /// Server answered with NOTICE, ERROR or CLOSED
    #[error("Server error for {correlation_id}: {reason}")]
    Remote {
        correlation_id: String,
        reason: String,
    },

    /// Relay rejected a published event
    #[error("Event {event_id} rejected: {message}")]
    PublishRejected { event_id: String, message: String },

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Signer failure
    #[error("Signer error: {0}")]
    Signer(String),

    /// Encryption failure other than a failed open
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Serialization(e.to_string())
    }
}

impl From<url::ParseError> for ClientError {
    fn from(e: url::ParseError) -> Self {
        ClientError::InvalidUrl(e.to_string())
    }
}

impl From<MessageError> for ClientError {
    fn from(e: MessageError) -> Self {
        match e {
            MessageError::UnknownFrame(kind) => ClientError::UnknownFrame(kind),
            other => ClientError::MalformedFrame(other.to_string()),
        }
    }
}

impl From<EncryptionError> for ClientError {
    fn from(e: EncryptionError) -> Self {
        match e {
            EncryptionError::DecryptionFailed(reason) => ClientError::DecryptionFailed(reason),
            EncryptionError::UnsupportedScheme(scheme) => ClientError::UnsupportedScheme(scheme),
            other => ClientError::Encryption(other.to_string()),
        }
    }
}

impl From<SignerError> for ClientError {
    fn from(e: SignerError) -> Self {
        ClientError::Signer(e.to_string())
    }
}

/// Client result type
pub type Result<T> = std::result::Result<T, ClientError>;
