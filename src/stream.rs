//! Optimistic event stream.
//!
//! An [`OptimisticEventStream`] is a caller-owned handle onto one
//! `(tenant, stream)`. Events are staged with [`add`](OptimisticEventStream::add)
//! and written as one commit by
//! [`commit_changes`](OptimisticEventStream::commit_changes), which claims the
//! next revision and commit sequence. The backend decides who wins a slot;
//! the handle never retries or merges on its own.
//!
//! A handle is not internally synchronized: use one per unit of work.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use futures::TryStreamExt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::model::{Commit, CommitAttempt, EventMessage, Headers, Snapshot, StreamRevision};
use crate::persistence::{PersistStreams, PersistenceError, Result};

pub struct OptimisticEventStream {
    tenant_id: String,
    stream_id: String,
    persistence: Arc<dyn PersistStreams>,
    committed: Vec<EventMessage>,
    committed_headers: Headers,
    uncommitted: Vec<EventMessage>,
    uncommitted_headers: Headers,
    identifiers: HashSet<Uuid>,
    stream_revision: StreamRevision,
    commit_sequence: u32,
}

impl OptimisticEventStream {
    /// Handle onto a stream that is assumed empty. No I/O.
    pub fn create(
        tenant_id: impl Into<String>,
        stream_id: impl Into<String>,
        persistence: Arc<dyn PersistStreams>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            stream_id: stream_id.into(),
            persistence,
            committed: Vec::new(),
            committed_headers: Headers::new(),
            uncommitted: Vec::new(),
            uncommitted_headers: Headers::new(),
            identifiers: HashSet::new(),
            stream_revision: 0,
            commit_sequence: 0,
        }
    }

    /// Load the events in `[min_revision, max_revision]`.
    ///
    /// Fails with `StreamNotFound` when `min_revision > 0` and nothing was found.
    pub async fn open(
        tenant_id: impl Into<String>,
        stream_id: impl Into<String>,
        persistence: Arc<dyn PersistStreams>,
        min_revision: StreamRevision,
        max_revision: StreamRevision,
    ) -> Result<Self> {
        let mut stream = Self::create(tenant_id, stream_id, persistence);
        let commits = stream.load(min_revision, max_revision).await?;
        stream.populate(min_revision, max_revision, commits);

        if min_revision > 0 && stream.committed.is_empty() {
            return Err(PersistenceError::StreamNotFound {
                tenant: stream.tenant_id.clone(),
                stream: stream.stream_id.clone(),
            });
        }
        Ok(stream)
    }

    /// Seed the handle from a snapshot, loading only the events after it.
    pub async fn open_from_snapshot(
        persistence: Arc<dyn PersistStreams>,
        snapshot: &Snapshot,
        max_revision: StreamRevision,
    ) -> Result<Self> {
        let mut stream = Self::create(
            snapshot.tenant_id.clone(),
            snapshot.stream_id.clone(),
            persistence,
        );

        // the commit holding the snapshot revision carries the commit sequence
        let commits = stream.load(snapshot.stream_revision, max_revision).await?;
        stream.populate(snapshot.stream_revision.saturating_add(1), max_revision, commits);
        stream.stream_revision = snapshot.stream_revision + stream.committed_len();

        Ok(stream)
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Revision of the last event known to this handle.
    pub fn stream_revision(&self) -> StreamRevision {
        self.stream_revision
    }

    /// Sequence of the last commit known to this handle.
    pub fn commit_sequence(&self) -> u32 {
        self.commit_sequence
    }

    pub fn committed_events(&self) -> &[EventMessage] {
        &self.committed
    }

    /// Headers merged from every loaded commit, later commits winning.
    pub fn committed_headers(&self) -> &Headers {
        &self.committed_headers
    }

    pub fn uncommitted_events(&self) -> &[EventMessage] {
        &self.uncommitted
    }

    pub fn uncommitted_headers(&self) -> &Headers {
        &self.uncommitted_headers
    }

    /// Headers copied onto the next commit.
    pub fn uncommitted_headers_mut(&mut self) -> &mut Headers {
        &mut self.uncommitted_headers
    }

    pub fn has_changes(&self) -> bool {
        !self.uncommitted.is_empty()
    }

    /// Stage an event for the next commit.
    pub fn add(&mut self, event: EventMessage) {
        self.uncommitted.push(event);
    }

    /// Discard staged events and headers.
    pub fn clear_changes(&mut self) {
        self.uncommitted.clear();
        self.uncommitted_headers.clear();
    }

    /// Commit the staged events under `commit_id`.
    ///
    /// Returns `Ok(None)` when nothing is staged or a pipeline hook vetoed the
    /// attempt. A commit id already recorded for the stream is treated as
    /// applied: the stored commit is returned and the buffer cleared. On
    /// `ConcurrencyConflict` the handle catches up with the commits it missed,
    /// keeps the staged events, and returns the conflict.
    pub async fn commit_changes(&mut self, commit_id: Uuid) -> Result<Option<Commit>> {
        if self.uncommitted.is_empty() {
            return Ok(None);
        }
        if self.identifiers.contains(&commit_id) {
            if let Some(existing) = self.find_commit(commit_id).await? {
                debug!(
                    tenant = %self.tenant_id,
                    stream = %self.stream_id,
                    commit_id = %commit_id,
                    "Commit already applied to this stream"
                );
                self.clear_changes();
                return Ok(Some(existing));
            }
        }

        let attempt = self.build_attempt(commit_id);
        debug!(
            tenant = %self.tenant_id,
            stream = %self.stream_id,
            commit_id = %commit_id,
            stream_revision = attempt.stream_revision,
            commit_sequence = attempt.commit_sequence,
            "Committing stream changes"
        );

        match self.persistence.commit(attempt).await {
            Ok(Some(commit)) => {
                let min = self.stream_revision.saturating_add(1);
                self.populate(min, commit.stream_revision, vec![commit.clone()]);
                self.clear_changes();
                Ok(Some(commit))
            }
            Ok(None) => Ok(None),
            Err(PersistenceError::DuplicateCommit(existing)) => {
                info!(
                    tenant = %self.tenant_id,
                    stream = %self.stream_id,
                    commit_id = %existing.commit_id,
                    "Commit already recorded, treating as applied"
                );
                self.refresh().await?;
                self.clear_changes();
                Ok(Some(*existing))
            }
            Err(conflict @ PersistenceError::ConcurrencyConflict { .. }) => {
                info!(
                    tenant = %self.tenant_id,
                    stream = %self.stream_id,
                    stream_revision = self.stream_revision,
                    "Concurrency conflict, reloading stream"
                );
                self.refresh().await?;
                Err(conflict)
            }
            Err(e) => Err(e),
        }
    }

    fn build_attempt(&self, commit_id: Uuid) -> CommitAttempt {
        CommitAttempt {
            tenant_id: self.tenant_id.clone(),
            stream_id: self.stream_id.clone(),
            stream_revision: self.stream_revision + Self::count(&self.uncommitted),
            commit_id,
            commit_sequence: self.commit_sequence + 1,
            commit_stamp: Utc::now(),
            headers: self.uncommitted_headers.clone(),
            events: self.uncommitted.clone(),
        }
    }

    async fn load(
        &self,
        min_revision: StreamRevision,
        max_revision: StreamRevision,
    ) -> Result<Vec<Commit>> {
        self.persistence
            .get(&self.tenant_id, &self.stream_id, min_revision, max_revision)
            .try_collect()
            .await
    }

    async fn find_commit(&self, commit_id: Uuid) -> Result<Option<Commit>> {
        let mut commits = self
            .persistence
            .get(&self.tenant_id, &self.stream_id, 0, StreamRevision::MAX);
        while let Some(commit) = commits.try_next().await? {
            if commit.commit_id == commit_id {
                return Ok(Some(commit));
            }
        }
        Ok(None)
    }

    /// Pull in every commit past the current revision.
    async fn refresh(&mut self) -> Result<()> {
        let min = self.stream_revision.saturating_add(1);
        let commits = self.load(min, StreamRevision::MAX).await?;
        self.populate(min, StreamRevision::MAX, commits);
        Ok(())
    }

    /// Merge commits, keeping only events within `[min_revision, max_revision]`.
    fn populate(
        &mut self,
        min_revision: StreamRevision,
        max_revision: StreamRevision,
        commits: Vec<Commit>,
    ) {
        for commit in commits {
            if !self.identifiers.insert(commit.commit_id) {
                continue;
            }
            self.commit_sequence = commit.commit_sequence;

            let mut current = commit.first_revision();
            if current > max_revision {
                return;
            }

            self.committed_headers.extend(commit.headers);

            for event in commit.events {
                if current > max_revision {
                    break;
                }
                if current >= min_revision {
                    self.committed.push(event);
                    self.stream_revision = current;
                }
                current = current.saturating_add(1);
            }
        }
    }

    fn committed_len(&self) -> StreamRevision {
        Self::count(&self.committed)
    }

    fn count(events: &[EventMessage]) -> u32 {
        u32::try_from(events.len()).unwrap_or(u32::MAX)
    }
}

impl Drop for OptimisticEventStream {
    fn drop(&mut self) {
        if !self.uncommitted.is_empty() {
            debug!(
                tenant = %self.tenant_id,
                stream = %self.stream_id,
                discarded = self.uncommitted.len(),
                "Stream handle dropped with uncommitted events"
            );
        }
    }
}
