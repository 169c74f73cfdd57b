//! Persistence engine contract and backends.
//!
//! A backend exposes three capability groups:
//! - [`CommitEvents`]: append commits and read them back by stream,
//!   checkpoint or time range
//! - [`AccessSnapshots`]: snapshot storage and "who needs a snapshot" queries
//! - [`ManagePersistence`]: store lifecycle (initialize, drop, purge, delete)
//!
//! [`PersistStreams`] is the umbrella trait the event store works against.
//!
//! Implementations:
//! - `InMemoryPersistence`: in-process maps, used in tests
//! - `SqlitePersistence`: SQLite via sqlx + sea-query (feature `sqlite`)
//! - `GrpcPersistence`: remote store reached over gRPC

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use tracing::{error, info};

use crate::config::{StorageConfig, StorageType};
use crate::conversion::UpconverterError;
use crate::model::{
    CheckpointToken, Commit, CommitAttempt, Snapshot, StreamHead, StreamRevision,
};
use crate::serialization::{SerializationError, Serializer};
use crate::utils::retry::is_transient_status;

pub mod grpc;
pub mod hooks;
pub mod in_memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use grpc::GrpcPersistence;
pub use hooks::{HookedPersistence, PipelineHook};
pub use in_memory::InMemoryPersistence;
#[cfg(feature = "sqlite")]
pub use sqlite::SqlitePersistence;

/// Errors raised by persistence backends.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error(
        "Concurrency conflict: {tenant}/{stream} already has a commit at revision {stream_revision} (commit sequence {commit_sequence})"
    )]
    ConcurrencyConflict {
        tenant: String,
        stream: String,
        stream_revision: StreamRevision,
        commit_sequence: u32,
    },

    /// The commit id is already recorded for the stream. Carries the stored commit.
    #[error("Duplicate commit {} on {}/{}", .0.commit_id, .0.tenant_id, .0.stream_id)]
    DuplicateCommit(Box<Commit>),

    #[error("Stream not found: {tenant}/{stream}")]
    StreamNotFound { tenant: String, stream: String },

    #[error("Invalid commit attempt: {0}")]
    InvalidAttempt(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Upconversion error: {0}")]
    Conversion(#[from] UpconverterError),

    #[error("Invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Remote store error: {0}")]
    Transport(#[from] tonic::Status),

    #[error("Remote store connection error: {0}")]
    Connect(#[from] tonic::transport::Error),

    #[error("Malformed wire message: {0}")]
    Wire(String),

    #[error("Corrupt stored record: {0}")]
    Corrupt(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl PersistenceError {
    /// Connectivity-class failures that may succeed when retried unchanged.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::Connect(_) => true,
            Self::Transport(status) => is_transient_status(status),
            #[cfg(feature = "sqlite")]
            Self::Database(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Lazily consumed, ordered sequence of commits.
///
/// Dropping the stream cancels the read.
pub type CommitStream<'a> = BoxStream<'a, Result<Commit>>;

/// Lazily consumed sequence of stream heads.
pub type StreamHeadStream<'a> = BoxStream<'a, Result<StreamHead>>;

/// Commit access.
#[async_trait]
pub trait CommitEvents: Send + Sync {
    /// Durably append a commit attempt.
    ///
    /// Returns `Ok(None)` when the attempt carries no events. Fails with
    /// `DuplicateCommit` when the commit id is already recorded for the
    /// stream, and with `ConcurrencyConflict` when the attempted commit
    /// sequence or revision range is already occupied.
    async fn commit(&self, attempt: CommitAttempt) -> Result<Option<Commit>>;

    /// Commits of one stream whose revision range intersects `[min_revision, max_revision]`,
    /// ordered by stream revision.
    fn get(
        &self,
        tenant: &str,
        stream: &str,
        min_revision: StreamRevision,
        max_revision: StreamRevision,
    ) -> CommitStream<'_>;

    /// Commits of a tenant with a checkpoint strictly greater than `checkpoint`,
    /// ordered by checkpoint.
    fn get_from(&self, tenant: &str, checkpoint: CheckpointToken) -> CommitStream<'_>;

    /// Commits of a tenant stamped in `[start, end)`, ordered by commit stamp.
    /// A missing `end` reads to the present.
    fn get_by_time(
        &self,
        tenant: &str,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> CommitStream<'_>;
}

/// Snapshot access.
#[async_trait]
pub trait AccessSnapshots: Send + Sync {
    /// Most recent snapshot at or below `max_revision`.
    async fn get_snapshot(
        &self,
        tenant: &str,
        stream: &str,
        max_revision: StreamRevision,
    ) -> Result<Option<Snapshot>>;

    /// Store a snapshot. Returns `false` when it was not recorded (unknown stream,
    /// revision beyond the head, or a snapshot already exists at that revision).
    async fn add_snapshot(&self, snapshot: Snapshot) -> Result<bool>;

    /// Streams whose `head_revision - snapshot_revision` exceeds `max_threshold`.
    fn streams_to_snapshot(&self, tenant: &str, max_threshold: u32) -> StreamHeadStream<'_>;
}

/// Store lifecycle management.
#[async_trait]
pub trait ManagePersistence: Send + Sync {
    /// Create tables or other structures. Idempotent.
    async fn initialize(&self) -> Result<()>;

    /// Remove every structure the store created.
    async fn drop_store(&self) -> Result<()>;

    /// Remove all data belonging to one tenant.
    async fn purge(&self, tenant: &str) -> Result<()>;

    /// Remove all data of every tenant.
    async fn purge_all(&self) -> Result<()>;

    /// Remove one stream with its snapshots.
    async fn delete_stream(&self, tenant: &str, stream: &str) -> Result<()>;
}

/// Full persistence engine.
pub trait PersistStreams: CommitEvents + AccessSnapshots + ManagePersistence {}

impl<T: CommitEvents + AccessSnapshots + ManagePersistence + ?Sized> PersistStreams for T {}

/// Check an attempt against the current head of its stream.
///
/// `head_sequence`/`head_revision` are the last committed values (0 for a new
/// stream). An attempt reusing an occupied slot is a conflict; one that skips
/// ahead of the head is malformed.
pub(crate) fn validate_against_head(
    attempt: &CommitAttempt,
    head_sequence: u32,
    head_revision: StreamRevision,
) -> Result<()> {
    let previous = attempt.previous_revision();

    if attempt.commit_sequence <= head_sequence || previous < i64::from(head_revision) {
        return Err(PersistenceError::ConcurrencyConflict {
            tenant: attempt.tenant_id.clone(),
            stream: attempt.stream_id.clone(),
            stream_revision: attempt.stream_revision,
            commit_sequence: attempt.commit_sequence,
        });
    }

    if attempt.commit_sequence != head_sequence.saturating_add(1)
        || previous != i64::from(head_revision)
    {
        return Err(PersistenceError::InvalidAttempt(format!(
            "commit sequence {} / revision {} leaves a gap after head sequence {} / revision {}",
            attempt.commit_sequence, attempt.stream_revision, head_sequence, head_revision
        )));
    }

    Ok(())
}

/// Initialize persistence based on configuration.
pub async fn init_persistence(
    config: &StorageConfig,
    serializer: Arc<dyn Serializer>,
) -> Result<Arc<dyn PersistStreams>> {
    info!(storage_type = ?config.storage_type, "Initializing persistence");

    let persistence: Arc<dyn PersistStreams> = match config.storage_type {
        StorageType::Memory => Arc::new(InMemoryPersistence::new()),
        #[cfg(feature = "sqlite")]
        StorageType::Sqlite => {
            Arc::new(SqlitePersistence::connect(&config.sqlite, serializer).await?)
        }
        #[cfg(not(feature = "sqlite"))]
        StorageType::Sqlite => {
            error!("SQLite storage requested but 'sqlite' feature is not enabled");
            return Err(PersistenceError::Configuration(
                "sqlite feature not enabled".to_string(),
            ));
        }
        StorageType::Grpc => {
            Arc::new(GrpcPersistence::connect_with_retry(&config.grpc, serializer).await?)
        }
    };

    if let Err(e) = persistence.initialize().await {
        error!(error = %e, "Failed to initialize persistence");
        return Err(e);
    }

    Ok(persistence)
}
