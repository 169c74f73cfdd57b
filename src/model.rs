//! Commit model.
//!
//! Immutable value types that flow between the event stream, the persistence
//! backends and catch-up consumers. Nothing here performs I/O.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Revision of an event within its stream (1-based, 0 = empty stream).
pub type StreamRevision = u32;

/// Store-wide ordering position assigned by the backend on commit.
pub type CheckpointToken = i64;

/// Headers attached to events and commits.
///
/// Keys are free-form; values are opaque JSON. Ordering carries no meaning.
pub type Headers = BTreeMap<String, serde_json::Value>;

/// Tenant used when callers do not partition their store.
pub const DEFAULT_TENANT: &str = "default";

/// Typed event payload.
///
/// `kind` names the payload's schema (e.g. `"orders.OrderPlaced.v1"`). The
/// upconverter keys its conversions on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub kind: String,
    pub data: serde_json::Value,
}

impl Payload {
    pub fn new(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    /// Build a payload from any serializable value.
    pub fn from_typed<T: Serialize>(
        kind: impl Into<String>,
        value: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(kind, serde_json::to_value(value)?))
    }

    /// Decode the payload data into a concrete type.
    pub fn to_typed<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}

/// One domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub body: Payload,
    #[serde(default)]
    pub headers: Headers,
}

impl EventMessage {
    pub fn new(body: Payload) -> Self {
        Self {
            body,
            headers: Headers::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.headers.insert(key.into(), value);
        self
    }
}

/// A proposed, not yet durable write to one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitAttempt {
    pub tenant_id: String,
    pub stream_id: String,
    /// Revision the stream will be at after this commit.
    pub stream_revision: StreamRevision,
    pub commit_id: Uuid,
    /// 1-based ordinal of this commit within the stream.
    pub commit_sequence: u32,
    pub commit_stamp: DateTime<Utc>,
    pub headers: Headers,
    pub events: Vec<EventMessage>,
}

impl CommitAttempt {
    /// Revision of the last event already in the stream when this attempt was built.
    pub fn previous_revision(&self) -> i64 {
        i64::from(self.stream_revision) - self.events.len() as i64
    }

    /// Confirm the attempt with a backend-assigned checkpoint.
    pub fn into_commit(self, checkpoint_token: CheckpointToken) -> Commit {
        Commit {
            tenant_id: self.tenant_id,
            stream_id: self.stream_id,
            stream_revision: self.stream_revision,
            commit_id: self.commit_id,
            commit_sequence: self.commit_sequence,
            commit_stamp: self.commit_stamp,
            checkpoint_token,
            headers: self.headers,
            events: self.events,
        }
    }
}

/// A durable commit as confirmed by a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    pub tenant_id: String,
    pub stream_id: String,
    pub stream_revision: StreamRevision,
    pub commit_id: Uuid,
    pub commit_sequence: u32,
    pub commit_stamp: DateTime<Utc>,
    pub checkpoint_token: CheckpointToken,
    pub headers: Headers,
    pub events: Vec<EventMessage>,
}

impl Commit {
    /// Revision of the first event carried by this commit.
    pub fn first_revision(&self) -> StreamRevision {
        let count = u32::try_from(self.events.len()).unwrap_or(u32::MAX);
        self.stream_revision.saturating_sub(count).saturating_add(1)
    }
}

/// Materialised stream state at a revision.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub tenant_id: String,
    pub stream_id: String,
    pub stream_revision: StreamRevision,
    pub payload: Payload,
}

impl Snapshot {
    pub fn new(
        tenant_id: impl Into<String>,
        stream_id: impl Into<String>,
        stream_revision: StreamRevision,
        payload: Payload,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            stream_id: stream_id.into(),
            stream_revision,
            payload,
        }
    }
}

/// Head summary of a stream, used to find streams due for a snapshot.
///
/// Identity is the stream id only.
#[derive(Debug, Clone)]
pub struct StreamHead {
    pub tenant_id: String,
    pub stream_id: String,
    pub head_revision: StreamRevision,
    pub snapshot_revision: StreamRevision,
}

impl StreamHead {
    /// Number of revisions committed since the latest snapshot.
    pub fn unsnapshotted(&self) -> u32 {
        self.head_revision.saturating_sub(self.snapshot_revision)
    }
}

impl PartialEq for StreamHead {
    fn eq(&self, other: &Self) -> bool {
        self.stream_id == other.stream_id
    }
}

impl Eq for StreamHead {}

impl Hash for StreamHead {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.stream_id.hash(state);
    }
}
