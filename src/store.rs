//! Event store façade.
//!
//! Entry point for applications: hands out [`OptimisticEventStream`] handles
//! bound to one persistence engine. When pipeline hooks are configured every
//! handle reads through them, so an upconverter applies to stream loads as
//! well as to direct reads via [`EventStore::advanced`].

use std::sync::Arc;

use tracing::debug;

use crate::model::{Snapshot, StreamRevision};
use crate::persistence::{HookedPersistence, PersistStreams, PipelineHook, Result};
use crate::stream::OptimisticEventStream;

#[derive(Clone)]
pub struct EventStore {
    persistence: Arc<dyn PersistStreams>,
}

impl EventStore {
    pub fn new(persistence: Arc<dyn PersistStreams>) -> Self {
        Self { persistence }
    }

    /// Wrap `persistence` with pipeline hooks, applied in order.
    pub fn with_hooks(
        persistence: Arc<dyn PersistStreams>,
        hooks: Vec<Arc<dyn PipelineHook>>,
    ) -> Self {
        if hooks.is_empty() {
            return Self::new(persistence);
        }
        debug!(hooks = hooks.len(), "Event store pipeline hooks configured");
        Self::new(Arc::new(HookedPersistence::new(persistence, hooks)))
    }

    /// Handle onto a new stream. No I/O.
    pub fn create_stream(&self, tenant: &str, stream: &str) -> OptimisticEventStream {
        OptimisticEventStream::create(tenant, stream, Arc::clone(&self.persistence))
    }

    /// Open a stream loaded with the events in `[min_revision, max_revision]`.
    pub async fn open_stream(
        &self,
        tenant: &str,
        stream: &str,
        min_revision: StreamRevision,
        max_revision: StreamRevision,
    ) -> Result<OptimisticEventStream> {
        OptimisticEventStream::open(
            tenant,
            stream,
            Arc::clone(&self.persistence),
            min_revision,
            max_revision,
        )
        .await
    }

    /// Open a stream from a snapshot, loading events up to `max_revision`.
    pub async fn open_stream_from_snapshot(
        &self,
        snapshot: &Snapshot,
        max_revision: StreamRevision,
    ) -> Result<OptimisticEventStream> {
        OptimisticEventStream::open_from_snapshot(
            Arc::clone(&self.persistence),
            snapshot,
            max_revision,
        )
        .await
    }

    /// Direct access to the persistence engine (hooks included).
    pub fn advanced(&self) -> &Arc<dyn PersistStreams> {
        &self.persistence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventMessage, Payload};
    use crate::persistence::InMemoryPersistence;
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_open_from_latest_snapshot() {
        let store = EventStore::new(Arc::new(InMemoryPersistence::new()));

        let mut stream = store.create_stream("t", "account-1");
        for n in 1..=3 {
            stream.add(EventMessage::new(Payload::new("Deposited", json!({ "amount": n }))));
        }
        stream.commit_changes(Uuid::new_v4()).await.unwrap();
        stream.add(EventMessage::new(Payload::new("Deposited", json!({ "amount": 4 }))));
        stream.commit_changes(Uuid::new_v4()).await.unwrap();

        let added = store
            .advanced()
            .add_snapshot(Snapshot::new("t", "account-1", 3, Payload::new("Balance", json!(6))))
            .await
            .unwrap();
        assert!(added);

        let snapshot = store
            .advanced()
            .get_snapshot("t", "account-1", StreamRevision::MAX)
            .await
            .unwrap()
            .unwrap();
        let stream = store
            .open_stream_from_snapshot(&snapshot, StreamRevision::MAX)
            .await
            .unwrap();
        assert_eq!(stream.committed_events().len(), 1);
        assert_eq!(stream.stream_revision(), 4);
        assert_eq!(stream.commit_sequence(), 2);
    }

    #[tokio::test]
    async fn test_without_hooks_uses_engine_directly() {
        let engine: Arc<dyn PersistStreams> = Arc::new(InMemoryPersistence::new());
        let store = EventStore::with_hooks(Arc::clone(&engine), Vec::new());
        assert!(Arc::ptr_eq(store.advanced(), &engine));
    }
}
