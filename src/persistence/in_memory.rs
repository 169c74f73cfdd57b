//! In-memory persistence engine.
//!
//! Holds every tenant in one process-local structure guarded by an async
//! `RwLock`. Commits are validated and appended under the write lock, which
//! makes compare-and-append atomic per stream. Used by tests and as the
//! `memory` storage type.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::RwLock;
use tracing::debug;

use super::{
    validate_against_head, AccessSnapshots, CommitEvents, CommitStream, ManagePersistence,
    PersistenceError, Result, StreamHeadStream,
};
use crate::model::{CheckpointToken, Commit, CommitAttempt, Snapshot, StreamHead, StreamRevision};

/// Key type for per-stream state: (tenant, stream).
type StreamKey = (String, String);

#[derive(Default)]
struct Inner {
    /// All commits in checkpoint order.
    commits: Vec<Commit>,
    /// Positions in `commits` per stream, in commit order.
    by_stream: HashMap<StreamKey, Vec<usize>>,
    snapshots: HashMap<StreamKey, Vec<Snapshot>>,
    heads: HashMap<StreamKey, StreamHead>,
    last_checkpoint: CheckpointToken,
}

impl Inner {
    fn stream_commits<'a>(
        &'a self,
        key: &StreamKey,
    ) -> impl DoubleEndedIterator<Item = &'a Commit> + 'a {
        self.by_stream
            .get(key)
            .into_iter()
            .flatten()
            .map(move |&position| &self.commits[position])
    }

    fn append(&mut self, key: StreamKey, commit: Commit) {
        self.by_stream
            .entry(key)
            .or_default()
            .push(self.commits.len());
        self.commits.push(commit);
    }

    /// Drop commits failing `keep` and rebuild the stream index.
    fn retain_commits<F: Fn(&Commit) -> bool>(&mut self, keep: F) {
        self.commits.retain(|c| keep(c));
        self.by_stream.clear();
        for (position, commit) in self.commits.iter().enumerate() {
            self.by_stream
                .entry((commit.tenant_id.clone(), commit.stream_id.clone()))
                .or_default()
                .push(position);
        }
    }
}

/// Persistence engine that keeps everything in memory.
#[derive(Default)]
pub struct InMemoryPersistence {
    inner: RwLock<Inner>,
    fail_on_read: AtomicBool,
    fail_on_commit: AtomicBool,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every read fail with `Unavailable` until reset.
    pub fn set_fail_on_read(&self, fail: bool) {
        self.fail_on_read.store(fail, Ordering::SeqCst);
    }

    /// Make every commit fail with `Unavailable` until reset.
    pub fn set_fail_on_commit(&self, fail: bool) {
        self.fail_on_commit.store(fail, Ordering::SeqCst);
    }

    /// Number of commits stored across all tenants.
    pub async fn commit_count(&self) -> usize {
        self.inner.read().await.commits.len()
    }

    /// Build a lazily evaluated read that filters the commit log under the read lock.
    fn read_commits<F>(&self, filter: F) -> CommitStream<'_>
    where
        F: Fn(&Commit) -> bool + Send + 'static,
    {
        let fail = self.fail_on_read.load(Ordering::SeqCst);
        futures::stream::once(async move {
            if fail {
                return vec![Err(PersistenceError::Unavailable(
                    "in-memory reads disabled".to_string(),
                ))];
            }
            let inner = self.inner.read().await;
            inner
                .commits
                .iter()
                .filter(|c| filter(c))
                .cloned()
                .map(Ok)
                .collect::<Vec<_>>()
        })
        .flat_map(futures::stream::iter)
        .boxed()
    }
}

#[async_trait]
impl CommitEvents for InMemoryPersistence {
    async fn commit(&self, attempt: CommitAttempt) -> Result<Option<Commit>> {
        if attempt.events.is_empty() {
            return Ok(None);
        }
        if self.fail_on_commit.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable(
                "in-memory commits disabled".to_string(),
            ));
        }

        let mut inner = self.inner.write().await;

        let key = (attempt.tenant_id.clone(), attempt.stream_id.clone());
        if let Some(existing) = inner
            .stream_commits(&key)
            .find(|c| c.commit_id == attempt.commit_id)
        {
            return Err(PersistenceError::DuplicateCommit(Box::new(existing.clone())));
        }

        let (head_sequence, head_revision) = inner
            .stream_commits(&key)
            .next_back()
            .map(|c| (c.commit_sequence, c.stream_revision))
            .unwrap_or((0, 0));

        validate_against_head(&attempt, head_sequence, head_revision)?;

        inner.last_checkpoint += 1;
        let commit = attempt.into_commit(inner.last_checkpoint);

        let head = inner.heads.entry(key.clone()).or_insert_with(|| StreamHead {
            tenant_id: commit.tenant_id.clone(),
            stream_id: commit.stream_id.clone(),
            head_revision: 0,
            snapshot_revision: 0,
        });
        head.head_revision = commit.stream_revision;

        inner.append(key, commit.clone());

        debug!(
            tenant = %commit.tenant_id,
            stream = %commit.stream_id,
            checkpoint = commit.checkpoint_token,
            "Commit appended"
        );

        Ok(Some(commit))
    }

    fn get(
        &self,
        tenant: &str,
        stream: &str,
        min_revision: StreamRevision,
        max_revision: StreamRevision,
    ) -> CommitStream<'_> {
        let tenant = tenant.to_string();
        let stream = stream.to_string();
        self.read_commits(move |c| {
            c.tenant_id == tenant
                && c.stream_id == stream
                && c.stream_revision >= min_revision
                && c.first_revision() <= max_revision
        })
    }

    fn get_from(&self, tenant: &str, checkpoint: CheckpointToken) -> CommitStream<'_> {
        let tenant = tenant.to_string();
        self.read_commits(move |c| c.tenant_id == tenant && c.checkpoint_token > checkpoint)
    }

    fn get_by_time(
        &self,
        tenant: &str,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> CommitStream<'_> {
        let tenant = tenant.to_string();
        let fail = self.fail_on_read.load(Ordering::SeqCst);
        futures::stream::once(async move {
            if fail {
                return vec![Err(PersistenceError::Unavailable(
                    "in-memory reads disabled".to_string(),
                ))];
            }
            let inner = self.inner.read().await;
            let mut commits: Vec<Commit> = inner
                .commits
                .iter()
                .filter(|c| {
                    c.tenant_id == tenant
                        && c.commit_stamp >= start
                        && end.map_or(true, |end| c.commit_stamp < end)
                })
                .cloned()
                .collect();
            // stable sort keeps checkpoint order for equal stamps
            commits.sort_by_key(|c| c.commit_stamp);
            commits.into_iter().map(Ok).collect::<Vec<_>>()
        })
        .flat_map(futures::stream::iter)
        .boxed()
    }
}

#[async_trait]
impl AccessSnapshots for InMemoryPersistence {
    async fn get_snapshot(
        &self,
        tenant: &str,
        stream: &str,
        max_revision: StreamRevision,
    ) -> Result<Option<Snapshot>> {
        let key = (tenant.to_string(), stream.to_string());
        let inner = self.inner.read().await;
        Ok(inner.snapshots.get(&key).and_then(|snapshots| {
            snapshots
                .iter()
                .filter(|s| s.stream_revision <= max_revision)
                .max_by_key(|s| s.stream_revision)
                .cloned()
        }))
    }

    async fn add_snapshot(&self, snapshot: Snapshot) -> Result<bool> {
        let key = (snapshot.tenant_id.clone(), snapshot.stream_id.clone());
        let mut inner = self.inner.write().await;

        let Some(head) = inner.heads.get(&key) else {
            return Ok(false);
        };
        if snapshot.stream_revision == 0 || snapshot.stream_revision > head.head_revision {
            return Ok(false);
        }

        let existing = inner.snapshots.entry(key.clone()).or_default();
        if existing
            .iter()
            .any(|s| s.stream_revision == snapshot.stream_revision)
        {
            return Ok(false);
        }
        let revision = snapshot.stream_revision;
        existing.push(snapshot);

        if let Some(head) = inner.heads.get_mut(&key) {
            head.snapshot_revision = head.snapshot_revision.max(revision);
        }
        Ok(true)
    }

    fn streams_to_snapshot(&self, tenant: &str, max_threshold: u32) -> StreamHeadStream<'_> {
        let tenant = tenant.to_string();
        futures::stream::once(async move {
            let inner = self.inner.read().await;
            let mut heads: Vec<StreamHead> = inner
                .heads
                .values()
                .filter(|h| h.tenant_id == tenant && h.unsnapshotted() > max_threshold)
                .cloned()
                .collect();
            heads.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
            heads.into_iter().map(Ok).collect::<Vec<_>>()
        })
        .flat_map(futures::stream::iter)
        .boxed()
    }
}

#[async_trait]
impl ManagePersistence for InMemoryPersistence {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn drop_store(&self) -> Result<()> {
        *self.inner.write().await = Inner::default();
        Ok(())
    }

    async fn purge(&self, tenant: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.retain_commits(|c| c.tenant_id != tenant);
        inner.snapshots.retain(|(t, _), _| t != tenant);
        inner.heads.retain(|(t, _), _| t != tenant);
        Ok(())
    }

    async fn purge_all(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        // checkpoint keeps counting so tokens are never reissued
        inner.commits.clear();
        inner.by_stream.clear();
        inner.snapshots.clear();
        inner.heads.clear();
        Ok(())
    }

    async fn delete_stream(&self, tenant: &str, stream: &str) -> Result<()> {
        let key = (tenant.to_string(), stream.to_string());
        let mut inner = self.inner.write().await;
        inner.retain_commits(|c| !(c.tenant_id == tenant && c.stream_id == stream));
        inner.snapshots.remove(&key);
        inner.heads.remove(&key);
        Ok(())
    }
}
