//! Event envelopes for the collection endpoint
//!
//! An [`EventEnvelope`] is the full record of one tracked event. It is built right
//! before dispatch from three sources:
//!
//! ```text
//! identity (session_id, user_id) ─┐
//! context  (path, utm, device)   ─┼─→ EventEnvelope ─→ EventBatch { events: [envelope] }
//! caller   (event_type, payload) ─┘
//! ```
//!
//! Envelopes are never mutated after construction and never retried.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};

use crate::context::{Context, DeviceClass};
use crate::identity::{SessionId, UserId};

/// Free-form event payload
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// One tracked event as sent to the collection endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Emission time, ISO-8601 with millisecond precision
    #[serde(serialize_with = "serialize_iso_millis")]
    pub timestamp: DateTime<Utc>,

    pub session_id: String,
    pub user_id: String,

    pub page_path: String,

    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub utm_campaign: Option<String>,

    pub device_type: DeviceClass,

    pub country: String,

    /// Event type tag (pageview, click, conversion, ...)
    pub event_type: String,

    /// Type-specific payload; `null` when empty
    pub event_data: Option<Payload>,

    pub referrer: Option<String>,
}

impl EventEnvelope {
    pub fn new(
        timestamp: DateTime<Utc>,
        session_id: &SessionId,
        user_id: &UserId,
        context: Context,
        event_type: impl Into<String>,
        payload: Payload,
    ) -> Self {
        EventEnvelope {
            timestamp,
            session_id: session_id.as_str().to_string(),
            user_id: user_id.as_str().to_string(),
            page_path: context.page_path,
            utm_source: context.utm_source,
            utm_medium: context.utm_medium,
            utm_campaign: context.utm_campaign,
            device_type: context.device_type,
            country: context.country,
            event_type: event_type.into(),
            event_data: if payload.is_empty() { None } else { Some(payload) },
            referrer: context.referrer,
        }
    }
}

fn serialize_iso_millis<S: Serializer>(
    ts: &DateTime<Utc>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Request body for the collection endpoint
///
/// The tracker always sends exactly one envelope per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    pub events: Vec<EventEnvelope>,
}

impl EventBatch {
    pub fn single(envelope: EventEnvelope) -> Self {
        EventBatch {
            events: vec![envelope],
        }
    }
}

/// Build a payload from `(key, value)` pairs.
pub fn payload<K, V, I>(entries: I) -> Payload
where
    K: Into<String>,
    V: Into<serde_json::Value>,
    I: IntoIterator<Item = (K, V)>,
{
    entries
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
