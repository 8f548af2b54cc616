use std::fmt;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

/// EventKind identifies what a tracked event represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Ordinary activity within a session (pageview, interaction, heartbeat).
    Activity,
    /// Explicit end-of-session marker.
    SessionEnd,
}

impl EventKind {
    /// Returns the canonical wire/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Activity => "activity",
            Self::SessionEnd => "session_end",
        }
    }

    /// Convert from the canonical wire label.
    pub fn from_str(name: &str) -> Option<Self> {
        match name {
            "activity" => Some(Self::Activity),
            "session_end" => Some(Self::SessionEnd),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded activity event. Immutable once decoded.
#[derive(Debug, Clone)]
pub struct Event {
    /// Session or user key that time is accumulated against.
    pub entity_id: String,
    /// Originating host, matched against the internal-host allow-list.
    pub host_id: String,
    /// Event timestamp as reported by the producer.
    pub time: DateTime<Utc>,
    pub kind: EventKind,
    /// Opaque producer payload, carried through untouched.
    pub payload: serde_json::Value,
}

/// Errors produced when decoding a raw broker message.
///
/// Decode failures are per-message: the orchestrator logs and drops the
/// message, it never retries (re-decoding malformed input cannot succeed).
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("entity_id is empty")]
    EmptyEntity,

    #[error("host is empty")]
    EmptyHost,

    #[error("unknown event kind: {0:?}")]
    UnknownKind(String),

    #[error("timestamp out of range: {0}")]
    TimestampOutOfRange(i64),

    #[error("unparseable timestamp: {0:?}")]
    BadTimestamp(String),
}

/// Raw JSON envelope shape. `time` accepts both RFC 3339 strings and
/// integer Unix seconds since producers disagree on the format.
#[derive(Deserialize)]
struct Envelope {
    entity_id: String,
    host: String,
    time: RawTime,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTime {
    Unix(i64),
    Rfc3339(String),
}

/// Decodes a raw broker message into an [`Event`].
///
/// Pure and side-effect-free so the codec is testable without a broker.
pub fn decode(raw: &[u8]) -> Result<Event, DecodeError> {
    let envelope: Envelope = serde_json::from_slice(raw)?;

    if envelope.entity_id.is_empty() {
        return Err(DecodeError::EmptyEntity);
    }
    if envelope.host.is_empty() {
        return Err(DecodeError::EmptyHost);
    }

    let time = match envelope.time {
        RawTime::Unix(secs) => DateTime::from_timestamp(secs, 0)
            .ok_or(DecodeError::TimestampOutOfRange(secs))?,
        RawTime::Rfc3339(ref s) => DateTime::parse_from_rfc3339(s)
            .map_err(|_| DecodeError::BadTimestamp(s.clone()))?
            .with_timezone(&Utc),
    };

    let kind = match envelope.kind.as_deref() {
        // Absent kind means plain activity; producers only tag terminal events.
        None => EventKind::Activity,
        Some(name) => {
            EventKind::from_str(name).ok_or_else(|| DecodeError::UnknownKind(name.to_string()))?
        }
    };

    Ok(Event {
        entity_id: envelope.entity_id,
        host_id: envelope.host,
        time,
        kind,
        payload: envelope.payload,
    })
}
