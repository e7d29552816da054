use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use url::Url;

use crate::client::{RelayError, RelayResult};
use crate::protocol::Frame;

/// Opaque ID types for readability
pub type SubscriptionId = String;
pub type Topic = String;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(String),

    #[error("Unsupported endpoint scheme '{0}', expected ws or wss")]
    UnsupportedScheme(String),

    #[error("Endpoint URL has no host")]
    MissingHost,
}

/// Address of the broadcast service. Immutable once parsed.
///
/// `http`/`https` URLs are accepted and rewritten to `ws`/`wss` so the same
/// value can be copied from a browser address bar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint(Url);

impl Endpoint {
    pub fn parse(raw: &str) -> Result<Self, EndpointError> {
        let mut url =
            Url::parse(raw.trim()).map_err(|e| EndpointError::InvalidUrl(e.to_string()))?;

        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => return Err(EndpointError::UnsupportedScheme(other.to_string())),
        };
        if url.scheme() != scheme {
            url.set_scheme(scheme)
                .map_err(|_| EndpointError::UnsupportedScheme(url.scheme().to_string()))?;
        }

        if url.host_str().map_or(true, str::is_empty) {
            return Err(EndpointError::MissingHost);
        }

        Ok(Self(url))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Host name, used as the STOMP `host` header unless overridden
    pub fn host(&self) -> &str {
        self.0.host_str().unwrap_or_default()
    }

    pub fn url(&self) -> &Url {
        &self.0
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connected => f.write_str("connected"),
        }
    }
}

/// Details from the broker's CONNECTED frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Negotiated protocol version ("1.0" when the broker omits it)
    pub version: String,
    pub server: Option<String>,
    pub session: Option<String>,
    /// Effective (outgoing, incoming) heart-beat in milliseconds, 0 = off
    pub heartbeat: (u64, u64),
}

/// A decoded broadcast entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Point in time carried in the payload's `date` field
    pub received_at: DateTime<Utc>,
    /// The payload's `content` field, exactly as sent (no escaping applied)
    pub payload: String,
    /// Topic the frame was addressed to
    pub destination: Option<String>,
    /// Broker-assigned message id
    pub message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(deserialize_with = "deserialize_date")]
    date: DateTime<Utc>,
    content: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireDate {
    Millis(i64),
    Text(String),
}

fn deserialize_date<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    match WireDate::deserialize(deserializer)? {
        WireDate::Millis(ms) => Utc
            .timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| serde::de::Error::custom(format!("timestamp out of range: {ms}"))),
        WireDate::Text(text) => DateTime::parse_from_rfc3339(&text)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom),
    }
}

impl Message {
    /// Decode a JSON body of the form `{"date": ..., "content": "..."}`
    pub fn parse(body: &str) -> RelayResult<Self> {
        let wire: WireMessage = serde_json::from_str(body)
            .map_err(|e| RelayError::MalformedMessage(e.to_string()))?;

        Ok(Self {
            received_at: wire.date,
            payload: wire.content,
            destination: None,
            message_id: None,
        })
    }

    pub(crate) fn from_frame(frame: &Frame) -> RelayResult<Self> {
        let mut message = Self::parse(&frame.body)?;
        message.destination = frame.get("destination").map(str::to_string);
        message.message_id = frame.get("message-id").map(str::to_string);
        Ok(message)
    }
}

/// Returned by `subscribe`; pass it to `unsubscribe` to stop delivery.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    topic: Topic,
    active: Arc<AtomicBool>,
    session_open: Arc<AtomicBool>,
}

impl SubscriptionHandle {
    pub(crate) fn new(
        id: SubscriptionId,
        topic: Topic,
        active: Arc<AtomicBool>,
        session_open: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            topic,
            active,
            session_open,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// False once unsubscribed or once its session has ended
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && self.session_open.load(Ordering::SeqCst)
    }

    /// Clears the delivery flag. Returns true only for the call that cleared it.
    pub(crate) fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn belongs_to(&self, session_open: &Arc<AtomicBool>) -> bool {
        Arc::ptr_eq(&self.session_open, session_open)
    }
}
