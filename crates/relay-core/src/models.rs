//! Domain models and strongly-typed identifiers.
//!
//! Defines events, targets, deliveries, and newtype ID wrappers for
//! compile-time type safety, along with the database codec impls the
//! storage layer relies on.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgRow = sqlx::postgres::PgRow;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed event identifier.
///
/// Wraps a UUID to prevent mixing with other ID types. Events are immutable
/// once created, and this ID follows them through planning and delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for EventId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for EventId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed account identifier.
///
/// All events, targets, and deliveries are scoped to an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountId(pub Uuid);

impl AccountId {
    /// Creates a new random account ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AccountId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for AccountId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for AccountId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for AccountId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for AccountId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed target identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetId(pub Uuid);

impl TargetId {
    /// Creates a new random target ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TargetId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for TargetId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for TargetId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for TargetId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for TargetId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed delivery identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryId(pub Uuid);

impl DeliveryId {
    /// Creates a new random delivery ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeliveryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for DeliveryId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for DeliveryId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DeliveryId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for DeliveryId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Closed set of domain event types that can be forwarded to targets.
///
/// The string form (dotted lowercase) is used for storage, subscription
/// matching, and the `type` field of the outbound envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// An inbound message was received.
    #[serde(rename = "message.inbound.received")]
    MessageInboundReceived,
    /// An outbound message was handed to the carrier.
    #[serde(rename = "message.outbound.sent")]
    MessageOutboundSent,
    /// An outbound message could not be sent.
    #[serde(rename = "message.outbound.failed")]
    MessageOutboundFailed,
    /// A message changed delivery status.
    #[serde(rename = "message.status.updated")]
    MessageStatusUpdated,
}

impl EventType {
    /// Canonical string form used on the wire and in the database.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MessageInboundReceived => "message.inbound.received",
            Self::MessageOutboundSent => "message.outbound.sent",
            Self::MessageOutboundFailed => "message.outbound.failed",
            Self::MessageStatusUpdated => "message.status.updated",
        }
    }

    /// Parses the canonical string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "message.inbound.received" => Some(Self::MessageInboundReceived),
            "message.outbound.sent" => Some(Self::MessageOutboundSent),
            "message.outbound.failed" => Some(Self::MessageOutboundFailed),
            "message.status.updated" => Some(Self::MessageStatusUpdated),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown event type: {s}"))
    }
}

impl sqlx::Type<PgDb> for EventType {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventType {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Self::parse(s).ok_or_else(|| format!("invalid event type: {s}").into())
    }
}

impl sqlx::Encode<'_, PgDb> for EventType {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Origin of a domain event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    /// Submitted through the public API.
    Api,
    /// Emitted by an internal subsystem.
    System,
    /// Reported by the upstream carrier.
    Carrier,
}

impl EventSource {
    /// Canonical string form.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::System => "system",
            Self::Carrier => "carrier",
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl sqlx::Type<PgDb> for EventSource {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventSource {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "api" => Ok(Self::Api),
            "system" => Ok(Self::System),
            "carrier" => Ok(Self::Carrier),
            _ => Err(format!("invalid event source: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for EventSource {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Delivery lifecycle status.
///
/// A delivery is created `Pending` and moves exactly once to `Succeeded`
/// or `Failed`. Terminal states never reverse; the dispatcher treats any
/// further invocation against a terminal delivery as a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Waiting for the next attempt.
    Pending,
    /// Delivered with HTTP 200. Terminal.
    Succeeded,
    /// Target disabled or attempt budget exhausted. Terminal.
    Failed,
}

impl DeliveryStatus {
    /// True for `Succeeded` and `Failed`.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl sqlx::Type<PgDb> for DeliveryStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DeliveryStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "pending" => Ok(Self::Pending),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid delivery status: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for DeliveryStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(
            &match self {
                Self::Pending => "pending",
                Self::Succeeded => "succeeded",
                Self::Failed => "failed",
            },
            buf,
        )
    }
}

/// An immutable record of something that happened, destined for zero or
/// more targets.
///
/// # Idempotency
///
/// When `dedupe_key` is supplied, at most one event exists per
/// `(account_id, dedupe_key)`; a second submission returns the original
/// event and triggers no new delivery work.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Event {
    /// Unique identifier for this event.
    pub id: EventId,

    /// Account that owns this event.
    pub account_id: AccountId,

    /// What kind of thing happened.
    pub event_type: EventType,

    /// Where the event originated.
    pub source: EventSource,

    /// When the event occurred. Defaults to ingestion time.
    pub occurred_at: DateTime<Utc>,

    /// Opaque structured payload, stored and forwarded verbatim.
    pub payload: serde_json::Value,

    /// Caller-supplied idempotency token, scoped per account.
    pub dedupe_key: Option<String>,

    /// When the event was persisted.
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Builds a new event with a fresh ID.
    pub fn new(
        account_id: AccountId,
        event_type: EventType,
        source: EventSource,
        occurred_at: DateTime<Utc>,
        payload: serde_json::Value,
        dedupe_key: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EventId::new(),
            account_id,
            event_type,
            source,
            occurred_at,
            payload,
            dedupe_key,
            created_at,
        }
    }
}

/// A user-configured webhook endpoint subscribed to a subset of event
/// types.
///
/// Configuration fields (`url`, `enabled`, `subscribed_events`,
/// `signing_secret`, `max_attempts`, `timeout_ms`) are owned by the
/// external target-management service; this core reads them and writes
/// only the bookkeeping fields below `consecutive_failures`. Bounds on
/// `max_attempts` (1..=20) and `timeout_ms` (1000..=60000) are enforced
/// upstream before a target is ever observed here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    /// Unique identifier for this target.
    pub id: TargetId,

    /// Account that owns this target.
    pub account_id: AccountId,

    /// Destination URL for webhook POSTs.
    pub url: String,

    /// Disabled targets receive no deliveries; an in-flight delivery that
    /// observes a disabled target fails terminally.
    pub enabled: bool,

    /// Event types this target wants to receive.
    pub subscribed_events: Vec<EventType>,

    /// Shared secret for request signing.
    pub signing_secret: String,

    /// Delivery attempt budget, copied onto each delivery at creation.
    pub max_attempts: i32,

    /// Per-request HTTP timeout in milliseconds.
    pub timeout_ms: i32,

    /// Uninterrupted failed attempts; reset to zero on any success.
    pub consecutive_failures: i32,

    /// Last attempt of any outcome against this target.
    pub last_delivery_at: Option<DateTime<Utc>>,

    /// Last successful delivery.
    pub last_success_at: Option<DateTime<Utc>>,

    /// Last failed attempt.
    pub last_failure_at: Option<DateTime<Utc>>,

    /// Truncated text of the most recent failure. Cleared on success.
    pub last_error: Option<String>,

    /// When this target was created.
    pub created_at: DateTime<Utc>,

    /// When this target was last modified.
    pub updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for Target {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        // subscribed_events is TEXT[]; unknown entries are a decode error
        // rather than silently dropped.
        let raw_events: Vec<String> = row.try_get("subscribed_events")?;
        let mut subscribed_events = Vec::with_capacity(raw_events.len());
        for s in &raw_events {
            let parsed = EventType::parse(s)
                .ok_or_else(|| sqlx::Error::Decode(format!("invalid event type: {s}").into()))?;
            subscribed_events.push(parsed);
        }

        Ok(Self {
            id: row.try_get("id")?,
            account_id: row.try_get("account_id")?,
            url: row.try_get("url")?,
            enabled: row.try_get("enabled")?,
            subscribed_events,
            signing_secret: row.try_get("signing_secret")?,
            max_attempts: row.try_get("max_attempts")?,
            timeout_ms: row.try_get("timeout_ms")?,
            consecutive_failures: row.try_get("consecutive_failures")?,
            last_delivery_at: row.try_get("last_delivery_at")?,
            last_success_at: row.try_get("last_success_at")?,
            last_failure_at: row.try_get("last_failure_at")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl Target {
    /// Whether this target should receive events of the given type.
    pub fn subscribes_to(&self, event_type: EventType) -> bool {
        self.enabled && self.subscribed_events.contains(&event_type)
    }
}

/// The per-(event, target) unit of work tracking attempts and outcome.
///
/// Created by the planner, mutated only by the dispatcher, terminal at
/// `Succeeded` or `Failed`. `max_attempts` is fixed at creation even if
/// the target's configuration later changes.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Delivery {
    /// Unique identifier for this delivery.
    pub id: DeliveryId,

    /// Account that owns this delivery.
    pub account_id: AccountId,

    /// Event being forwarded.
    pub event_id: EventId,

    /// Target being delivered to.
    pub target_id: TargetId,

    /// Current lifecycle status.
    pub status: DeliveryStatus,

    /// Attempts spent so far. Never exceeds `max_attempts`.
    pub attempt_count: i32,

    /// Attempt budget copied from the target at creation time.
    pub max_attempts: i32,

    /// When the next attempt becomes due. None for terminal deliveries
    /// and for deliveries currently claimed by a worker.
    pub next_attempt_at: Option<DateTime<Utc>>,

    /// When the most recent attempt started.
    pub last_attempt_at: Option<DateTime<Utc>>,

    /// HTTP status of the most recent response, if one was received.
    pub last_status_code: Option<i32>,

    /// Truncated text of the most recent failure.
    pub last_error: Option<String>,

    /// Truncated body of the most recent response.
    pub last_response_snippet: Option<String>,

    /// When delivery succeeded. Terminal-success marker.
    pub delivered_at: Option<DateTime<Utc>>,

    /// When this delivery was created by the planner.
    pub created_at: DateTime<Utc>,
}

impl Delivery {
    /// Builds a pending delivery for an event/target pair, due
    /// immediately.
    pub fn plan(event: &Event, target: &Target, now: DateTime<Utc>) -> Self {
        Self {
            id: DeliveryId::new(),
            account_id: event.account_id,
            event_id: event.id,
            target_id: target.id,
            status: DeliveryStatus::Pending,
            attempt_count: 0,
            max_attempts: target.max_attempts,
            next_attempt_at: Some(now),
            last_attempt_at: None,
            last_status_code: None,
            last_error: None,
            last_response_snippet: None,
            delivered_at: None,
            created_at: now,
        }
    }
}

/// A delivery enriched with its originating event, as returned by the
/// per-target history read model.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryRecord {
    /// Delivery identifier.
    pub id: DeliveryId,
    /// Originating event.
    pub event_id: EventId,
    /// Final or current status.
    pub status: DeliveryStatus,
    /// Attempts spent.
    pub attempt_count: i32,
    /// Attempt budget.
    pub max_attempts: i32,
    /// Next scheduled attempt, if any.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Most recent attempt.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Most recent response status.
    pub last_status_code: Option<i32>,
    /// Most recent failure text.
    pub last_error: Option<String>,
    /// Most recent response body snippet.
    pub last_response_snippet: Option<String>,
    /// When delivery succeeded.
    pub delivered_at: Option<DateTime<Utc>>,
    /// When the delivery was planned.
    pub created_at: DateTime<Utc>,
    /// Type of the originating event.
    pub event_type: EventType,
    /// When the originating event occurred.
    pub event_occurred_at: DateTime<Utc>,
}
