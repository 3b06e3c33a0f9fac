//! Wire frames and the codec that maps them to and from JSON text.
//!
//! Outbound:
//! - `[verb, correlation_id, payload]` requests
//! - `["CLOSE", correlation_id]`
//! - `["EVENT", event]` publishes
//!
//! Inbound:
//! - `["EVENT", correlation_id, event]`
//! - `["EOSE", correlation_id]`
//! - `["NOTICE", message]` or `["NOTICE", correlation_id, message]`
//! - `["ERROR", correlation_id, reason]` and `["CLOSED", correlation_id, reason]`
//! - `["OK", event_id, accepted, message]`

use nostr::Event;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use thiserror::Error;

/// Verb used for plain subscription requests.
pub const REQ: &str = "REQ";

/// Errors that can occur when decoding frames.
#[derive(Debug, Error)]
pub enum MessageError {
    /// Structurally invalid frame. When the correlation id could still be
    /// read, only that caller is failed.
    #[error("malformed frame: {reason}")]
    MalformedFrame {
        correlation_id: Option<String>,
        reason: String,
    },

    /// Recognizable frame kind this client does not handle.
    #[error("unknown frame type: {0}")]
    UnknownFrame(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MessageError {
    fn malformed(reason: impl Into<String>) -> Self {
        MessageError::MalformedFrame {
            correlation_id: None,
            reason: reason.into(),
        }
    }

    /// Correlation id of the caller this error belongs to, if known.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            MessageError::MalformedFrame { correlation_id, .. } => correlation_id.as_deref(),
            _ => None,
        }
    }
}

/// One decoded protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    /// Request: `[verb, correlation_id, payload]`
    Request {
        verb: String,
        correlation_id: String,
        payload: Value,
    },

    /// Unsubscribe: `["CLOSE", correlation_id]`
    Close { correlation_id: String },

    /// Publish: `["EVENT", event]`
    Publish { event: Event },

    /// Event for a request: `["EVENT", correlation_id, event]`
    Event { correlation_id: String, event: Event },

    /// End of stored events: `["EOSE", correlation_id]`
    Eose { correlation_id: String },

    /// Human-readable notice, optionally addressed to a request
    Notice {
        correlation_id: Option<String>,
        message: String,
    },

    /// Request failed: `["ERROR", correlation_id, reason]`
    Error {
        correlation_id: String,
        reason: String,
    },

    /// Publish result: `["OK", event_id, accepted, message]`
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
}

impl WireFrame {
    /// Correlation id the frame is addressed to, if any.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            WireFrame::Request { correlation_id, .. }
            | WireFrame::Close { correlation_id }
            | WireFrame::Event { correlation_id, .. }
            | WireFrame::Eose { correlation_id }
            | WireFrame::Error { correlation_id, .. } => Some(correlation_id),
            WireFrame::Notice { correlation_id, .. } => correlation_id.as_deref(),
            WireFrame::Publish { .. } | WireFrame::Ok { .. } => None,
        }
    }
}

/// Stateless JSON codec for [`WireFrame`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodec;

impl MessageCodec {
    /// Encode a request frame.
    pub fn encode_request(verb: &str, correlation_id: &str, payload: &Value) -> String {
        json!([verb, correlation_id, payload]).to_string()
    }

    /// Encode any frame.
    pub fn encode(frame: &WireFrame) -> Result<String, MessageError> {
        let value = match frame {
            WireFrame::Request {
                verb,
                correlation_id,
                payload,
            } => return Ok(Self::encode_request(verb, correlation_id, payload)),
            WireFrame::Close { correlation_id } => json!(["CLOSE", correlation_id]),
            WireFrame::Publish { event } => json!(["EVENT", serde_json::to_value(event)?]),
            WireFrame::Event {
                correlation_id,
                event,
            } => json!(["EVENT", correlation_id, serde_json::to_value(event)?]),
            WireFrame::Eose { correlation_id } => json!(["EOSE", correlation_id]),
            WireFrame::Notice {
                correlation_id: Some(id),
                message,
            } => json!(["NOTICE", id, message]),
            WireFrame::Notice {
                correlation_id: None,
                message,
            } => json!(["NOTICE", message]),
            WireFrame::Error {
                correlation_id,
                reason,
            } => json!(["ERROR", correlation_id, reason]),
            WireFrame::Ok {
                event_id,
                accepted,
                message,
            } => json!(["OK", event_id, accepted, message]),
        };
        Ok(value.to_string())
    }

    /// Decode one text frame.
    pub fn decode(text: &str) -> Result<WireFrame, MessageError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| MessageError::malformed(format!("invalid JSON: {e}")))?;
        let arr = value
            .as_array()
            .ok_or_else(|| MessageError::malformed("frame is not an array"))?;

        let kind = arr
            .first()
            .ok_or_else(|| MessageError::malformed("empty array"))?
            .as_str()
            .ok_or_else(|| MessageError::malformed("first element not a string"))?;

        match kind {
            "EVENT" if arr.len() == 2 => {
                let event = serde_json::from_value(arr[1].clone())
                    .map_err(|e| MessageError::malformed(format!("invalid event: {e}")))?;
                Ok(WireFrame::Publish { event })
            }
            "EVENT" => {
                let correlation_id = string_at(arr, 1, "correlation_id")?;
                let raw = arr.get(2).ok_or_else(|| MessageError::MalformedFrame {
                    correlation_id: Some(correlation_id.clone()),
                    reason: "missing event".to_string(),
                })?;
                match serde_json::from_value::<Event>(raw.clone()) {
                    Ok(event) => Ok(WireFrame::Event {
                        correlation_id,
                        event,
                    }),
                    Err(e) => Err(MessageError::MalformedFrame {
                        correlation_id: Some(correlation_id),
                        reason: format!("invalid event: {e}"),
                    }),
                }
            }
            "EOSE" => Ok(WireFrame::Eose {
                correlation_id: string_at(arr, 1, "correlation_id")?,
            }),
            "NOTICE" => match arr.len() {
                0 | 1 => Ok(WireFrame::Notice {
                    correlation_id: None,
                    message: String::new(),
                }),
                2 => Ok(WireFrame::Notice {
                    correlation_id: None,
                    message: optional_string_at(arr, 1),
                }),
                _ => Ok(WireFrame::Notice {
                    correlation_id: Some(string_at(arr, 1, "correlation_id")?),
                    message: optional_string_at(arr, 2),
                }),
            },
            "ERROR" | "CLOSED" => Ok(WireFrame::Error {
                correlation_id: string_at(arr, 1, "correlation_id")?,
                reason: optional_string_at(arr, 2),
            }),
            "OK" => {
                let event_id = string_at(arr, 1, "event_id")?;
                let accepted = arr.get(2).and_then(Value::as_bool).ok_or_else(|| {
                    MessageError::malformed("OK accepted flag not a boolean")
                })?;
                Ok(WireFrame::Ok {
                    event_id,
                    accepted,
                    message: optional_string_at(arr, 3),
                })
            }
            "CLOSE" => Ok(WireFrame::Close {
                correlation_id: string_at(arr, 1, "correlation_id")?,
            }),
            REQ => Ok(WireFrame::Request {
                verb: kind.to_string(),
                correlation_id: string_at(arr, 1, "correlation_id")?,
                payload: arr.get(2).cloned().unwrap_or(Value::Null),
            }),
            other => Err(MessageError::UnknownFrame(other.to_string())),
        }
    }
}

fn string_at(arr: &[Value], index: usize, field: &str) -> Result<String, MessageError> {
    arr.get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| MessageError::malformed(format!("{field} missing or not a string")))
}

fn optional_string_at(arr: &[Value], index: usize) -> String {
    arr.get(index)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Payload for a named caching-server query: `{"cache": [name, args]}`.
pub fn cache_payload(name: &str, args: Value) -> Value {
    json!({ "cache": [name, args] })
}

/// Filter for subscription requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// Event IDs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    /// Authors (pubkeys)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    /// Event kinds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u32>>,

    /// Events since timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    /// Events until timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    /// Maximum number of events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// Tag queries keyed by `#<letter>`
    #[serde(flatten, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, Vec<String>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(mut self, ids: Vec<String>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn authors(mut self, authors: Vec<String>) -> Self {
        self.authors = Some(authors);
        self
    }

    pub fn kinds(mut self, kinds: Vec<u32>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    pub fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    /// Add a tag filter. The key is the tag letter (e.g., "e", "p").
    pub fn tag(mut self, key: impl Into<String>, values: Vec<String>) -> Self {
        self.tags.insert(format!("#{}", key.into()), values);
        self
    }

    /// Filter by #p (pubkey reference) tags.
    pub fn pubkey_refs(self, pubkeys: Vec<String>) -> Self {
        self.tag("p", pubkeys)
    }

    /// Filter as a request payload.
    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
