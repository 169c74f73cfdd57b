//! Pipeline hooks around a persistence engine.
//!
//! A hook can veto commits before they reach the backend, observe them
//! afterwards, and rewrite or filter commits on every read path. The event
//! upconverter plugs in here.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use tracing::{debug, info};

use super::{
    AccessSnapshots, CommitEvents, CommitStream, ManagePersistence, PersistStreams,
    PersistenceError, Result, StreamHeadStream,
};
use crate::model::{CheckpointToken, Commit, CommitAttempt, Snapshot, StreamRevision};

/// Interception points on the commit pipeline.
///
/// Every method has a pass-through default.
pub trait PipelineHook: Send + Sync {
    /// Rewrite a commit on its way out of the store. `None` hides it from the reader.
    fn select(&self, commit: Commit) -> Result<Option<Commit>> {
        Ok(Some(commit))
    }

    /// Return `false` to veto the attempt before it reaches the backend.
    fn pre_commit(&self, _attempt: &CommitAttempt) -> bool {
        true
    }

    fn post_commit(&self, _commit: &Commit) {}

    /// `None` means every tenant was purged.
    fn on_purge(&self, _tenant: Option<&str>) {}

    fn on_delete_stream(&self, _tenant: &str, _stream: &str) {}
}

/// Run a commit through every hook's `select`, stopping at the first filter.
fn select_all(hooks: &[Arc<dyn PipelineHook>], commit: Commit) -> Result<Option<Commit>> {
    let mut current = commit;
    for hook in hooks {
        match hook.select(current)? {
            Some(next) => current = next,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

/// Persistence decorator applying pipeline hooks.
pub struct HookedPersistence {
    inner: Arc<dyn PersistStreams>,
    hooks: Arc<[Arc<dyn PipelineHook>]>,
}

impl HookedPersistence {
    pub fn new(inner: Arc<dyn PersistStreams>, hooks: Vec<Arc<dyn PipelineHook>>) -> Self {
        Self {
            inner,
            hooks: hooks.into(),
        }
    }

    /// The wrapped engine.
    pub fn inner(&self) -> &Arc<dyn PersistStreams> {
        &self.inner
    }

    fn filtered<'a>(&self, commits: CommitStream<'a>) -> CommitStream<'a> {
        let hooks = Arc::clone(&self.hooks);
        commits
            .and_then(move |commit| {
                let selected = select_all(&hooks, commit);
                futures::future::ready(selected)
            })
            .try_filter_map(|commit| futures::future::ready(Ok(commit)))
            .boxed()
    }
}

#[async_trait]
impl CommitEvents for HookedPersistence {
    async fn commit(&self, attempt: CommitAttempt) -> Result<Option<Commit>> {
        if let Some(hook_index) = self.hooks.iter().position(|h| !h.pre_commit(&attempt)) {
            info!(
                tenant = %attempt.tenant_id,
                stream = %attempt.stream_id,
                commit_id = %attempt.commit_id,
                hook_index,
                "Commit attempt vetoed by pipeline hook"
            );
            return Ok(None);
        }

        match self.inner.commit(attempt).await {
            Ok(Some(commit)) => {
                for hook in self.hooks.iter() {
                    hook.post_commit(&commit);
                }
                Ok(Some(commit))
            }
            Ok(None) => Ok(None),
            Err(PersistenceError::DuplicateCommit(existing)) => {
                // the stored commit is a read; give hooks the chance to upgrade it
                debug!(commit_id = %existing.commit_id, "Duplicate commit passed through hooks");
                match select_all(&self.hooks, *existing)? {
                    Some(existing) => Err(PersistenceError::DuplicateCommit(Box::new(existing))),
                    None => Ok(None),
                }
            }
            Err(e) => Err(e),
        }
    }

    fn get(
        &self,
        tenant: &str,
        stream: &str,
        min_revision: StreamRevision,
        max_revision: StreamRevision,
    ) -> CommitStream<'_> {
        self.filtered(self.inner.get(tenant, stream, min_revision, max_revision))
    }

    fn get_from(&self, tenant: &str, checkpoint: CheckpointToken) -> CommitStream<'_> {
        self.filtered(self.inner.get_from(tenant, checkpoint))
    }

    fn get_by_time(
        &self,
        tenant: &str,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> CommitStream<'_> {
        self.filtered(self.inner.get_by_time(tenant, start, end))
    }
}

#[async_trait]
impl AccessSnapshots for HookedPersistence {
    async fn get_snapshot(
        &self,
        tenant: &str,
        stream: &str,
        max_revision: StreamRevision,
    ) -> Result<Option<Snapshot>> {
        self.inner.get_snapshot(tenant, stream, max_revision).await
    }

    async fn add_snapshot(&self, snapshot: Snapshot) -> Result<bool> {
        self.inner.add_snapshot(snapshot).await
    }

    fn streams_to_snapshot(&self, tenant: &str, max_threshold: u32) -> StreamHeadStream<'_> {
        self.inner.streams_to_snapshot(tenant, max_threshold)
    }
}

#[async_trait]
impl ManagePersistence for HookedPersistence {
    async fn initialize(&self) -> Result<()> {
        self.inner.initialize().await
    }

    async fn drop_store(&self) -> Result<()> {
        self.inner.drop_store().await
    }

    async fn purge(&self, tenant: &str) -> Result<()> {
        for hook in self.hooks.iter() {
            hook.on_purge(Some(tenant));
        }
        self.inner.purge(tenant).await
    }

    async fn purge_all(&self) -> Result<()> {
        for hook in self.hooks.iter() {
            hook.on_purge(None);
        }
        self.inner.purge_all().await
    }

    async fn delete_stream(&self, tenant: &str, stream: &str) -> Result<()> {
        for hook in self.hooks.iter() {
            hook.on_delete_stream(tenant, stream);
        }
        self.inner.delete_stream(tenant, stream).await
    }
}
