//! commitstore - optimistic event store
//!
//! Streams of domain events are appended as atomic commits guarded by
//! optimistic concurrency. Commits are persisted through a pluggable engine
//! (in-memory, SQLite or a remote gRPC store), read back per stream, by
//! global checkpoint or by time, and followed by catch-up consumers.

pub mod config;
pub mod conversion;
pub mod model;
pub mod persistence;
pub mod polling;
pub mod serialization;
pub mod store;
pub mod stream;
pub mod utils;

pub use model::{
    CheckpointToken, Commit, CommitAttempt, EventMessage, Headers, Payload, Snapshot, StreamHead,
    StreamRevision, DEFAULT_TENANT,
};
pub use persistence::{PersistStreams, PersistenceError};
pub use polling::{CommitHandler, PollingClient, PollingResult};
pub use store::EventStore;
pub use stream::OptimisticEventStream;
