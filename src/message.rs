//! Envelopes routed between services on the bus.
//!
//! A [`Message`] travels on a [`Channel`], the `(publisher, table)` pair that
//! is the only addressing the bus knows about. Its [`Payload`] is a raw
//! value, an ordered batch of events, or a full table snapshot.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::formula::Event;
use crate::value::Tuple;

/// Well-known table name on which policy updates are published.
pub const POLICY_UPDATE: &str = "policy-update";

/// A publish/subscribe channel key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Channel {
    pub publisher: String,
    pub table: String,
}

impl Channel {
    pub fn new(publisher: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            publisher: publisher.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.publisher, self.table)
    }
}

/// Message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Payload {
    /// An opaque value; the bus does not interpret it.
    Raw(serde_json::Value),
    /// Insert/Delete events, applied strictly in order by the receiver.
    Events(Vec<Event>),
    /// Full point-in-time content of one table; the receiver diffs it.
    Snapshot(BTreeSet<Tuple>),
}

impl Payload {
    pub fn as_raw(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Raw(v) => Some(v),
            _ => None,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Raw(_) => "raw".into(),
            Self::Events(events) => format!("{} events", events.len()),
            Self::Snapshot(rows) => format!("snapshot of {} rows", rows.len()),
        }
    }
}

impl From<serde_json::Value> for Payload {
    fn from(v: serde_json::Value) -> Self {
        Self::Raw(v)
    }
}

impl From<Vec<Event>> for Payload {
    fn from(events: Vec<Event>) -> Self {
        Self::Events(events)
    }
}

impl From<BTreeSet<Tuple>> for Payload {
    fn from(rows: BTreeSet<Tuple>) -> Self {
        Self::Snapshot(rows)
    }
}

/// A payload in flight, tagged with the channel it was published on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub channel: Channel,
    pub body: Payload,
}

impl Message {
    pub fn new(channel: Channel, body: Payload) -> Self {
        Self { channel, body }
    }

    pub fn publisher(&self) -> &str {
        &self.channel.publisher
    }

    pub fn table(&self) -> &str {
        &self.channel.table
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.channel, self.body.describe())
    }
}
