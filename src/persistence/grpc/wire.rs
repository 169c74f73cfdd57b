//! Wire messages for the remote persistence service.
//!
//! Service `commitstore.v1.Persistence`. Event bodies, header values and
//! snapshot payloads are encoded by the injected `Serializer` and carried as
//! base64 strings; the remote store never interprets them. Commit ids travel
//! as 32-character hex (no dashes) and commit stamps as Unix seconds, so a
//! commit read back over the wire has its stamp truncated to the second.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::DateTime;

use crate::model::{Commit, CommitAttempt, EventMessage, Headers, Payload, Snapshot, StreamHead};
use crate::persistence::{PersistenceError, Result};
use crate::serialization::{deserialize_typed, serialize_typed, Serializer};

pub const COMMIT: &str = "/commitstore.v1.Persistence/Commit";
pub const GET_FROM_MIN_MAX: &str = "/commitstore.v1.Persistence/GetFromMinMax";
pub const GET_FROM_CHECKPOINT: &str = "/commitstore.v1.Persistence/GetFromCheckpoint";
pub const GET_FROM_TIME: &str = "/commitstore.v1.Persistence/GetFromTime";
pub const GET_SNAPSHOT: &str = "/commitstore.v1.Persistence/GetSnapshot";
pub const ADD_SNAPSHOT: &str = "/commitstore.v1.Persistence/AddSnapshot";
pub const GET_STREAMS_TO_SNAPSHOT: &str = "/commitstore.v1.Persistence/GetStreamsToSnapshot";
pub const INITIALIZE: &str = "/commitstore.v1.Persistence/Initialize";
pub const DROP: &str = "/commitstore.v1.Persistence/Drop";
pub const PURGE: &str = "/commitstore.v1.Persistence/Purge";
pub const DELETE_STREAM: &str = "/commitstore.v1.Persistence/DeleteStream";

#[derive(Clone, PartialEq, prost::Message)]
pub struct Empty {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WireEvent {
    /// Base64 of the serialized `Payload`.
    #[prost(string, tag = "1")]
    pub body: String,
    /// Header values as base64 of their serialized form.
    #[prost(map = "string, string", tag = "2")]
    pub headers: HashMap<String, String>,
}

/// Commit or commit attempt. Attempts carry checkpoint 0.
#[derive(Clone, PartialEq, prost::Message)]
pub struct WireCommit {
    #[prost(string, tag = "1")]
    pub tenant_id: String,
    #[prost(string, tag = "2")]
    pub stream_id: String,
    #[prost(uint32, tag = "3")]
    pub stream_revision: u32,
    #[prost(string, tag = "4")]
    pub commit_id: String,
    #[prost(uint32, tag = "5")]
    pub commit_sequence: u32,
    /// Unix seconds.
    #[prost(int64, tag = "6")]
    pub commit_stamp: i64,
    #[prost(int64, tag = "7")]
    pub checkpoint_token: i64,
    #[prost(map = "string, string", tag = "8")]
    pub headers: HashMap<String, String>,
    #[prost(message, repeated, tag = "9")]
    pub events: Vec<WireEvent>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum CommitOutcome {
    /// Attempt carried no events; nothing was written.
    Empty = 0,
    Committed = 1,
    /// Commit id already recorded; `commit` holds the stored commit.
    Duplicate = 2,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CommitResponse {
    #[prost(enumeration = "CommitOutcome", tag = "1")]
    pub outcome: i32,
    #[prost(message, optional, tag = "2")]
    pub commit: Option<WireCommit>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GetFromMinMaxRequest {
    #[prost(string, tag = "1")]
    pub tenant_id: String,
    #[prost(string, tag = "2")]
    pub stream_id: String,
    #[prost(uint32, tag = "3")]
    pub min_revision: u32,
    #[prost(uint32, tag = "4")]
    pub max_revision: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GetFromCheckpointRequest {
    #[prost(string, tag = "1")]
    pub tenant_id: String,
    #[prost(int64, tag = "2")]
    pub checkpoint_token: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GetFromTimeRequest {
    #[prost(string, tag = "1")]
    pub tenant_id: String,
    /// Unix seconds, inclusive.
    #[prost(int64, tag = "2")]
    pub start: i64,
    /// Unix seconds, exclusive. Absent reads to the present.
    #[prost(int64, optional, tag = "3")]
    pub end: Option<i64>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WireSnapshot {
    #[prost(string, tag = "1")]
    pub tenant_id: String,
    #[prost(string, tag = "2")]
    pub stream_id: String,
    #[prost(uint32, tag = "3")]
    pub stream_revision: u32,
    /// Base64 of the serialized `Payload`.
    #[prost(string, tag = "4")]
    pub payload: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GetSnapshotRequest {
    #[prost(string, tag = "1")]
    pub tenant_id: String,
    #[prost(string, tag = "2")]
    pub stream_id: String,
    #[prost(uint32, tag = "3")]
    pub max_revision: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GetSnapshotResponse {
    #[prost(message, optional, tag = "1")]
    pub snapshot: Option<WireSnapshot>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AddSnapshotResponse {
    #[prost(bool, tag = "1")]
    pub added: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GetStreamsToSnapshotRequest {
    #[prost(string, tag = "1")]
    pub tenant_id: String,
    #[prost(uint32, tag = "2")]
    pub max_threshold: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WireStreamHead {
    #[prost(string, tag = "1")]
    pub tenant_id: String,
    #[prost(string, tag = "2")]
    pub stream_id: String,
    #[prost(uint32, tag = "3")]
    pub head_revision: u32,
    #[prost(uint32, tag = "4")]
    pub snapshot_revision: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PurgeRequest {
    /// Absent purges every tenant.
    #[prost(string, optional, tag = "1")]
    pub tenant_id: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeleteStreamRequest {
    #[prost(string, tag = "1")]
    pub tenant_id: String,
    #[prost(string, tag = "2")]
    pub stream_id: String,
}

fn encode_value<T: serde::Serialize + ?Sized>(
    serializer: &dyn Serializer,
    value: &T,
) -> Result<String> {
    Ok(STANDARD.encode(serialize_typed(serializer, value)?))
}

fn decode_value<T: serde::de::DeserializeOwned>(
    serializer: &dyn Serializer,
    field: &str,
    encoded: &str,
) -> Result<T> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| PersistenceError::Wire(format!("{field}: {e}")))?;
    Ok(deserialize_typed(serializer, &bytes)?)
}

fn encode_headers(serializer: &dyn Serializer, headers: &Headers) -> Result<HashMap<String, String>> {
    headers
        .iter()
        .map(|(key, value)| Ok((key.clone(), encode_value(serializer, value)?)))
        .collect()
}

fn decode_headers(serializer: &dyn Serializer, headers: HashMap<String, String>) -> Result<Headers> {
    headers
        .into_iter()
        .map(|(key, value)| {
            let value = decode_value(serializer, &key, &value)?;
            Ok((key, value))
        })
        .collect()
}

fn encode_events(serializer: &dyn Serializer, events: &[EventMessage]) -> Result<Vec<WireEvent>> {
    events
        .iter()
        .map(|event| {
            Ok(WireEvent {
                body: encode_value(serializer, &event.body)?,
                headers: encode_headers(serializer, &event.headers)?,
            })
        })
        .collect()
}

impl WireCommit {
    pub fn from_attempt(attempt: &CommitAttempt, serializer: &dyn Serializer) -> Result<Self> {
        Ok(Self {
            tenant_id: attempt.tenant_id.clone(),
            stream_id: attempt.stream_id.clone(),
            stream_revision: attempt.stream_revision,
            commit_id: hex::encode(attempt.commit_id.as_bytes()),
            commit_sequence: attempt.commit_sequence,
            commit_stamp: attempt.commit_stamp.timestamp(),
            checkpoint_token: 0,
            headers: encode_headers(serializer, &attempt.headers)?,
            events: encode_events(serializer, &attempt.events)?,
        })
    }

    pub fn from_commit(commit: &Commit, serializer: &dyn Serializer) -> Result<Self> {
        Ok(Self {
            tenant_id: commit.tenant_id.clone(),
            stream_id: commit.stream_id.clone(),
            stream_revision: commit.stream_revision,
            commit_id: hex::encode(commit.commit_id.as_bytes()),
            commit_sequence: commit.commit_sequence,
            commit_stamp: commit.commit_stamp.timestamp(),
            checkpoint_token: commit.checkpoint_token,
            headers: encode_headers(serializer, &commit.headers)?,
            events: encode_events(serializer, &commit.events)?,
        })
    }

    pub fn into_commit(self, serializer: &dyn Serializer) -> Result<Commit> {
        let commit_id = hex::decode(&self.commit_id)
            .map_err(|e| PersistenceError::Wire(format!("commit_id: {e}")))?;
        let commit_stamp = DateTime::from_timestamp(self.commit_stamp, 0)
            .ok_or_else(|| PersistenceError::Wire(format!("commit_stamp: {}", self.commit_stamp)))?;

        let events = self
            .events
            .into_iter()
            .map(|event| {
                Ok(EventMessage {
                    body: decode_value::<Payload>(serializer, "body", &event.body)?,
                    headers: decode_headers(serializer, event.headers)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Commit {
            tenant_id: self.tenant_id,
            stream_id: self.stream_id,
            stream_revision: self.stream_revision,
            commit_id: uuid::Uuid::from_slice(&commit_id)?,
            commit_sequence: self.commit_sequence,
            commit_stamp,
            checkpoint_token: self.checkpoint_token,
            headers: decode_headers(serializer, self.headers)?,
            events,
        })
    }
}

impl WireSnapshot {
    pub fn from_snapshot(snapshot: &Snapshot, serializer: &dyn Serializer) -> Result<Self> {
        Ok(Self {
            tenant_id: snapshot.tenant_id.clone(),
            stream_id: snapshot.stream_id.clone(),
            stream_revision: snapshot.stream_revision,
            payload: encode_value(serializer, &snapshot.payload)?,
        })
    }

    pub fn into_snapshot(self, serializer: &dyn Serializer) -> Result<Snapshot> {
        Ok(Snapshot {
            payload: decode_value(serializer, "payload", &self.payload)?,
            tenant_id: self.tenant_id,
            stream_id: self.stream_id,
            stream_revision: self.stream_revision,
        })
    }
}

impl From<WireStreamHead> for StreamHead {
    fn from(head: WireStreamHead) -> Self {
        Self {
            tenant_id: head.tenant_id,
            stream_id: head.stream_id,
            head_revision: head.head_revision,
            snapshot_revision: head.snapshot_revision,
        }
    }
}
