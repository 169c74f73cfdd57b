//! Remote persistence over gRPC.
//!
//! `GrpcPersistence` forwards every operation to a remote store speaking the
//! `commitstore.v1.Persistence` service (see [`wire`]). Reads are server
//! streams consumed lazily. Status mapping on the way back:
//!
//! - `ABORTED`: concurrency conflict
//! - `INVALID_ARGUMENT`: malformed attempt
//! - `NOT_FOUND`: stream not found
//! - anything else surfaces as `PersistenceError::Transport`

pub mod wire;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::Retryable;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;
use tonic::{Code, Request, Status};
use tracing::{debug, info, warn};

use self::wire::{
    AddSnapshotResponse, CommitOutcome, CommitResponse, DeleteStreamRequest, Empty,
    GetFromCheckpointRequest, GetFromMinMaxRequest, GetFromTimeRequest, GetSnapshotRequest,
    GetSnapshotResponse, GetStreamsToSnapshotRequest, PurgeRequest, WireCommit, WireSnapshot,
    WireStreamHead,
};
use super::{
    AccessSnapshots, CommitEvents, CommitStream, ManagePersistence, PersistenceError, Result,
    StreamHeadStream,
};
use crate::config::GrpcConfig;
use crate::model::{CheckpointToken, Commit, CommitAttempt, Snapshot, StreamRevision};
use crate::serialization::Serializer;
use crate::utils::retry::connection_backoff;

/// Client for a remote persistence service.
pub struct GrpcPersistence {
    grpc: Grpc<Channel>,
    serializer: Arc<dyn Serializer>,
}

impl GrpcPersistence {
    /// Wrap an established channel.
    pub fn new(channel: Channel, serializer: Arc<dyn Serializer>) -> Self {
        Self {
            grpc: Grpc::new(channel),
            serializer,
        }
    }

    /// Connect once to the configured address.
    pub async fn connect(config: &GrpcConfig, serializer: Arc<dyn Serializer>) -> Result<Self> {
        let endpoint = if config.address.starts_with("http://")
            || config.address.starts_with("https://")
        {
            config.address.clone()
        } else {
            format!("http://{}", config.address)
        };

        let channel = Channel::from_shared(endpoint)
            .map_err(|e| PersistenceError::Configuration(format!("invalid address: {e}")))?
            .timeout(Duration::from_millis(config.timeout_ms))
            .connect()
            .await?;

        info!(address = %config.address, "Remote store connected");
        Ok(Self::new(channel, serializer))
    }

    /// Connect with exponential backoff while the store is unreachable.
    pub async fn connect_with_retry(
        config: &GrpcConfig,
        serializer: Arc<dyn Serializer>,
    ) -> Result<Self> {
        (|| Self::connect(config, Arc::clone(&serializer)))
            .retry(connection_backoff())
            .when(PersistenceError::is_transient)
            .notify(|err: &PersistenceError, dur: Duration| {
                warn!(
                    address = %config.address,
                    error = %err,
                    delay = ?dur,
                    "Connection failed, retrying"
                );
            })
            .await
    }

    async fn ready(&self) -> Result<Grpc<Channel>> {
        let mut grpc = self.grpc.clone();
        grpc.ready()
            .await
            .map_err(|e| PersistenceError::Unavailable(format!("service was not ready: {e}")))?;
        Ok(grpc)
    }

    async fn unary<Req, Resp>(&self, path: &'static str, request: Req) -> Result<Resp>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = self.ready().await?;
        let codec: ProstCodec<Req, Resp> = ProstCodec::default();
        let response = grpc
            .unary(Request::new(request), PathAndQuery::from_static(path), codec)
            .await?;
        Ok(response.into_inner())
    }

    fn server_stream<'a, Req, Resp>(
        &'a self,
        path: &'static str,
        request: Req,
    ) -> BoxStream<'a, Result<Resp>>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        futures::stream::once(async move {
            let mut grpc = self.ready().await?;
            let codec: ProstCodec<Req, Resp> = ProstCodec::default();
            let response = grpc
                .server_streaming(Request::new(request), PathAndQuery::from_static(path), codec)
                .await?;
            Ok::<_, PersistenceError>(response.into_inner().map_err(PersistenceError::from))
        })
        .try_flatten()
        .boxed()
    }

    fn commit_stream<Req>(&self, path: &'static str, request: Req) -> CommitStream<'_>
    where
        Req: prost::Message + Send + Sync + 'static,
    {
        decode_commits(
            self.server_stream::<Req, WireCommit>(path, request),
            Arc::clone(&self.serializer),
        )
    }
}

fn decode_commits<'a>(
    wire: BoxStream<'a, Result<WireCommit>>,
    serializer: Arc<dyn Serializer>,
) -> CommitStream<'a> {
    wire.and_then(move |wire| futures::future::ready(wire.into_commit(serializer.as_ref())))
        .boxed()
}

/// Interpret the response of a commit call.
fn commit_result(response: CommitResponse, serializer: &dyn Serializer) -> Result<Option<Commit>> {
    let outcome = CommitOutcome::try_from(response.outcome)
        .map_err(|_| PersistenceError::Wire(format!("unknown commit outcome {}", response.outcome)))?;
    let commit = response
        .commit
        .map(|commit| commit.into_commit(serializer))
        .transpose()?;

    match (outcome, commit) {
        (CommitOutcome::Empty, _) => Ok(None),
        (CommitOutcome::Committed, Some(commit)) => Ok(Some(commit)),
        (CommitOutcome::Duplicate, Some(existing)) => {
            debug!(commit_id = %existing.commit_id, "Remote store reported duplicate commit");
            Err(PersistenceError::DuplicateCommit(Box::new(existing)))
        }
        (outcome, None) => Err(PersistenceError::Wire(format!(
            "{outcome:?} response without a commit"
        ))),
    }
}

/// Translate a failed commit call into the store's error vocabulary.
fn commit_error(status: Status, attempt: &CommitAttempt) -> PersistenceError {
    match status.code() {
        Code::Aborted => PersistenceError::ConcurrencyConflict {
            tenant: attempt.tenant_id.clone(),
            stream: attempt.stream_id.clone(),
            stream_revision: attempt.stream_revision,
            commit_sequence: attempt.commit_sequence,
        },
        Code::InvalidArgument => PersistenceError::InvalidAttempt(status.message().to_string()),
        _ => PersistenceError::Transport(status),
    }
}

fn read_error(status: Status, tenant: &str, stream: &str) -> PersistenceError {
    match status.code() {
        Code::NotFound => PersistenceError::StreamNotFound {
            tenant: tenant.to_string(),
            stream: stream.to_string(),
        },
        _ => PersistenceError::Transport(status),
    }
}

/// Map transport failures of a single-stream read, including ones raised mid-stream.
fn with_read_errors(commits: CommitStream<'_>, tenant: String, stream: String) -> CommitStream<'_> {
    commits
        .map_err(move |e| match e {
            PersistenceError::Transport(status) => read_error(status, &tenant, &stream),
            other => other,
        })
        .boxed()
}

#[async_trait]
impl CommitEvents for GrpcPersistence {
    async fn commit(&self, attempt: CommitAttempt) -> Result<Option<Commit>> {
        if attempt.events.is_empty() {
            return Ok(None);
        }

        let request = WireCommit::from_attempt(&attempt, self.serializer.as_ref())?;
        let response: CommitResponse = match self.unary(wire::COMMIT, request).await {
            Ok(response) => response,
            Err(PersistenceError::Transport(status)) => return Err(commit_error(status, &attempt)),
            Err(e) => return Err(e),
        };

        commit_result(response, self.serializer.as_ref())
    }

    fn get(
        &self,
        tenant: &str,
        stream: &str,
        min_revision: StreamRevision,
        max_revision: StreamRevision,
    ) -> CommitStream<'_> {
        let request = GetFromMinMaxRequest {
            tenant_id: tenant.to_string(),
            stream_id: stream.to_string(),
            min_revision,
            max_revision,
        };
        with_read_errors(
            self.commit_stream(wire::GET_FROM_MIN_MAX, request),
            tenant.to_string(),
            stream.to_string(),
        )
    }

    fn get_from(&self, tenant: &str, checkpoint: CheckpointToken) -> CommitStream<'_> {
        self.commit_stream(
            wire::GET_FROM_CHECKPOINT,
            GetFromCheckpointRequest {
                tenant_id: tenant.to_string(),
                checkpoint_token: checkpoint,
            },
        )
    }

    fn get_by_time(
        &self,
        tenant: &str,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> CommitStream<'_> {
        self.commit_stream(
            wire::GET_FROM_TIME,
            GetFromTimeRequest {
                tenant_id: tenant.to_string(),
                start: start.timestamp(),
                end: end.map(|e| e.timestamp()),
            },
        )
    }
}

#[async_trait]
impl AccessSnapshots for GrpcPersistence {
    async fn get_snapshot(
        &self,
        tenant: &str,
        stream: &str,
        max_revision: StreamRevision,
    ) -> Result<Option<Snapshot>> {
        let request = GetSnapshotRequest {
            tenant_id: tenant.to_string(),
            stream_id: stream.to_string(),
            max_revision,
        };
        let response: GetSnapshotResponse = self.unary(wire::GET_SNAPSHOT, request).await?;
        response
            .snapshot
            .map(|s| s.into_snapshot(self.serializer.as_ref()))
            .transpose()
    }

    async fn add_snapshot(&self, snapshot: Snapshot) -> Result<bool> {
        let request = WireSnapshot::from_snapshot(&snapshot, self.serializer.as_ref())?;
        let response: AddSnapshotResponse = self.unary(wire::ADD_SNAPSHOT, request).await?;
        Ok(response.added)
    }

    fn streams_to_snapshot(&self, tenant: &str, max_threshold: u32) -> StreamHeadStream<'_> {
        let request = GetStreamsToSnapshotRequest {
            tenant_id: tenant.to_string(),
            max_threshold,
        };
        self.server_stream::<_, WireStreamHead>(wire::GET_STREAMS_TO_SNAPSHOT, request)
            .map_ok(Into::into)
            .boxed()
    }
}

#[async_trait]
impl ManagePersistence for GrpcPersistence {
    async fn initialize(&self) -> Result<()> {
        let _: Empty = self.unary(wire::INITIALIZE, Empty {}).await?;
        Ok(())
    }

    async fn drop_store(&self) -> Result<()> {
        let _: Empty = self.unary(wire::DROP, Empty {}).await?;
        Ok(())
    }

    async fn purge(&self, tenant: &str) -> Result<()> {
        let request = PurgeRequest {
            tenant_id: Some(tenant.to_string()),
        };
        let _: Empty = self.unary(wire::PURGE, request).await?;
        Ok(())
    }

    async fn purge_all(&self) -> Result<()> {
        let _: Empty = self.unary(wire::PURGE, PurgeRequest { tenant_id: None }).await?;
        Ok(())
    }

    async fn delete_stream(&self, tenant: &str, stream: &str) -> Result<()> {
        let request = DeleteStreamRequest {
            tenant_id: tenant.to_string(),
            stream_id: stream.to_string(),
        };
        let _: Empty = self.unary(wire::DELETE_STREAM, request).await?;
        Ok(())
    }
}
