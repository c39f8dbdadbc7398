//! Wire format for outbound webhook bodies.

use chrono::{DateTime, Utc};
use relay_core::{AccountId, Event, EventId, EventSource, EventType};
use serde::Serialize;

/// JSON body posted to a target endpoint.
///
/// Field names are camelCase on the wire. The envelope is rebuilt from the
/// stored event on every attempt, so retries carry the same content.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<'a> {
    /// Event identifier.
    pub id: EventId,
    /// Event type in dotted form, e.g. `message.inbound.received`.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Where the event originated.
    pub source: EventSource,
    /// When the event occurred, RFC 3339.
    pub occurred_at: DateTime<Utc>,
    /// Owning account.
    pub account_id: AccountId,
    /// Domain payload, forwarded verbatim.
    pub payload: &'a serde_json::Value,
}

impl<'a> Envelope<'a> {
    /// Builds the envelope for an event.
    pub fn for_event(event: &'a Event) -> Self {
        Self {
            id: event.id,
            event_type: event.event_type,
            source: event.source,
            occurred_at: event.occurred_at,
            account_id: event.account_id,
            payload: &event.payload,
        }
    }
}
