//! Core types for the delivery tracker.
//!
//! Identities, message envelopes, source-log positions, and the wire record
//! handed to the publisher.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Offset cursor value meaning "nothing recorded yet".
pub const NO_OFFSET: i64 = -1;

/// Unique identifier of an outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Wraps an existing identifier.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A member identity inside a membership group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldingIdentity {
    pub x500_name: String,
    pub group_id: String,
}

impl HoldingIdentity {
    pub fn new(x500_name: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            x500_name: x500_name.into(),
            group_id: group_id.into(),
        }
    }
}

/// The communicating pair a message belongs to, scoped to a membership group.
///
/// Ordered: `our_id` is the local identity and `their_id` the peer, whichever
/// direction the message travels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Counterparties {
    pub group_id: String,
    pub our_id: String,
    pub their_id: String,
}

impl Counterparties {
    pub fn new(
        group_id: impl Into<String>,
        our_id: impl Into<String>,
        their_id: impl Into<String>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            our_id: our_id.into(),
            their_id: their_id.into(),
        }
    }
}

impl fmt::Display for Counterparties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}->{}", self.group_id, self.our_id, self.their_id)
    }
}

/// Header of an authenticated outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHeader {
    pub message_id: MessageId,
    pub source: HoldingIdentity,
    pub destination: HoldingIdentity,
}

/// An authenticated point-to-point message. These are the trackable ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedMessage {
    pub header: MessageHeader,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

impl AuthenticatedMessage {
    pub fn message_id(&self) -> &MessageId {
        &self.header.message_id
    }

    /// Counterparties as seen by the sender.
    pub fn counterparties(&self) -> Counterparties {
        Counterparties::new(
            self.header.source.group_id.clone(),
            self.header.source.x500_name.clone(),
            self.header.destination.x500_name.clone(),
        )
    }

    /// Approximate in-memory footprint, used for cache size accounting.
    pub fn estimated_size(&self) -> usize {
        let header = &self.header;
        self.payload.len()
            + header.message_id.as_str().len()
            + header.source.x500_name.len()
            + header.source.group_id.len()
            + header.destination.x500_name.len()
            + header.destination.group_id.len()
    }
}

/// A message sent without session authentication. Never tracked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnauthenticatedMessage {
    pub source: HoldingIdentity,
    pub destination: HoldingIdentity,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

/// An outbound message as it appears on the source log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Authenticated(AuthenticatedMessage),
    Unauthenticated(UnauthenticatedMessage),
}

impl OutboundMessage {
    /// Returns the message when it is trackable.
    pub fn as_authenticated(&self) -> Option<&AuthenticatedMessage> {
        match self {
            OutboundMessage::Authenticated(message) => Some(message),
            OutboundMessage::Unauthenticated(_) => None,
        }
    }
}

/// A position on a partitioned source log.
pub trait SourcePosition {
    fn partition(&self) -> u32;
    fn offset(&self) -> i64;
}

/// A record consumed from the outbound source log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLogRecord {
    pub topic: String,
    pub key: String,
    /// `None` for tombstones.
    pub value: Option<OutboundMessage>,
    pub partition: u32,
    pub offset: i64,
}

impl EventLogRecord {
    /// Pairs the authenticated payload with its position, if there is one.
    pub fn to_message_record(&self) -> Option<MessageRecord> {
        let message = self.value.as_ref()?.as_authenticated()?;
        Some(MessageRecord {
            message: message.clone(),
            partition: self.partition,
            offset: self.offset,
        })
    }
}

impl SourcePosition for EventLogRecord {
    fn partition(&self) -> u32 {
        self.partition
    }

    fn offset(&self) -> i64 {
        self.offset
    }
}

/// A trackable message together with the source position it was read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message: AuthenticatedMessage,
    pub partition: u32,
    pub offset: i64,
}

impl MessageRecord {
    pub fn message_id(&self) -> &MessageId {
        self.message.message_id()
    }

    pub fn counterparties(&self) -> Counterparties {
        self.message.counterparties()
    }
}

impl SourcePosition for MessageRecord {
    fn partition(&self) -> u32 {
        self.partition
    }

    fn offset(&self) -> i64 {
        self.offset
    }
}

/// A sent message still waiting for its acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedMessageState {
    #[serde(rename = "id")]
    pub message_id: MessageId,
    /// Epoch milliseconds of the original send attempt.
    pub timestamp: i64,
}

/// A wire-ready record for the publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub key: String,
    pub value: Vec<u8>,
}

impl Record {
    pub fn new(topic: impl Into<String>, key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            value,
        }
    }
}

/// Current wall-clock time in epoch milliseconds.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    const BASE64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}
