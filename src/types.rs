//! Core identifiers and the message model.
//!
//! Identifiers that are plain strings on the wire (member ids, group ids)
//! stay `String` aliases; the fencing token is a newtype so it cannot be
//! confused with a partition index or a counter.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;

use crate::constants::{HEADER_DESTINATION, HEADER_MESSAGE_ID, HEADER_PARTITION_ID};

/// Index of a partition within a destination, in `[0, partition_count)`.
pub type PartitionId = u32;

/// Unique identifier of one group member (`member-{uuid}`).
pub type MemberId = String;

/// Identifier of a consumer group: `{subscriber_id}:{destination}`.
pub type GroupId = String;

/// Monotonic token issued with every lease grant.
///
/// Tokens strictly increase per partition across grants, so a holder with an
/// older token can always be told apart from the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FencingToken(pub u64);

impl FencingToken {
    /// Create a new token from a raw value.
    #[inline]
    pub const fn new(value: u64) -> Self {
        FencingToken(value)
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The token that follows this one.
    #[inline]
    pub const fn next(self) -> Self {
        FencingToken(self.0 + 1)
    }
}

impl From<u64> for FencingToken {
    fn from(value: u64) -> Self {
        FencingToken(value)
    }
}

impl fmt::Display for FencingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Build the group id shared by all members of one subscription to one destination.
pub fn group_id(subscriber_id: &str, destination: &str) -> GroupId {
    format!("{}:{}", subscriber_id, destination)
}

/// Physical broker channel backing one partition of a destination.
pub fn partition_channel(destination: &str, partition: PartitionId) -> String {
    format!("{}-{}", destination, partition)
}

/// Generate a fresh member id.
pub fn new_member_id() -> MemberId {
    format!("member-{}", uuid::Uuid::new_v4())
}

/// A message travelling from a producer to a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Unique id, used for duplicate detection.
    pub id: String,
    /// Partition key; messages with equal keys land on the same partition.
    pub key: String,
    pub payload: Bytes,
    pub headers: BTreeMap<String, String>,
}

impl Message {
    /// Create a message with a generated id.
    pub fn new(key: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), key, payload)
    }

    /// Create a message with an explicit id.
    pub fn with_id(
        id: impl Into<String>,
        key: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            id: id.into(),
            key: key.into(),
            payload: payload.into(),
            headers: BTreeMap::new(),
        }
    }

    /// Builder-style header insertion.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Destination stamped by the producer, if any.
    pub fn destination(&self) -> Option<&str> {
        self.get_header(HEADER_DESTINATION)
    }

    /// Partition stamped by the producer, if any.
    pub fn partition(&self) -> Option<PartitionId> {
        self.get_header(HEADER_PARTITION_ID)?.parse().ok()
    }

    /// Stamp routing headers before publishing.
    pub(crate) fn stamp_routing(&mut self, destination: &str, partition: PartitionId) {
        self.headers
            .insert(HEADER_MESSAGE_ID.to_string(), self.id.clone());
        self.headers
            .insert(HEADER_DESTINATION.to_string(), destination.to_string());
        self.headers
            .insert(HEADER_PARTITION_ID.to_string(), partition.to_string());
    }
}

/// A message pulled from a channel, awaiting ack or nack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub channel: String,
    /// Broker-assigned tag identifying this delivery attempt.
    pub delivery_tag: u64,
    /// True if the message was delivered before and nacked.
    pub redelivered: bool,
    pub message: Message,
}
