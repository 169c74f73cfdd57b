//! Checkpoint-driven catch-up polling.
//!
//! A [`PollingClient`] repeatedly reads the commits of one tenant after its
//! current checkpoint and hands each to a [`CommitHandler`]. The handler's
//! [`PollingResult`] decides whether the checkpoint advances, the batch is
//! abandoned until the next tick, or the whole client stops.
//!
//! Only one poll runs at a time. A poll requested while another is in flight
//! (a timer tick or [`PollingClient::poll_now`]) returns immediately.
//!
//! ## Configuration
//!
//! ```yaml
//! polling:
//!   interval_ms: 1000
//!   tenant: "default"
//! ```

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::model::{CheckpointToken, Commit, DEFAULT_TENANT};
use crate::persistence::CommitEvents;

// ============================================================================
// Configuration
// ============================================================================

/// Polling configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Delay between polls in milliseconds. Default: 1000.
    pub interval_ms: u64,
    /// Tenant to follow. Default: "default".
    pub tenant: String,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            tenant: DEFAULT_TENANT.to_string(),
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

// ============================================================================
// Handler contract
// ============================================================================

/// What the client does after a commit was handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PollingResult {
    /// Advance the checkpoint past this commit and keep going.
    #[default]
    Continue,
    /// Leave the checkpoint where it is and end this poll.
    Retry,
    /// Stop the client.
    Stop,
}

/// Consumer of polled commits, invoked in checkpoint order.
///
/// Delivery is at-least-once: a commit is seen again after `Retry` or a
/// failed poll.
#[async_trait]
pub trait CommitHandler: Send + Sync {
    async fn handle(&self, commit: &Commit) -> PollingResult;
}

/// Adapter turning a closure into a [`CommitHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F> CommitHandler for FnHandler<F>
where
    F: Fn(&Commit) -> PollingResult + Send + Sync,
{
    async fn handle(&self, commit: &Commit) -> PollingResult {
        (self.0)(commit)
    }
}

/// Wrap a synchronous closure as a shared handler.
pub fn handler_fn<F>(f: F) -> Arc<dyn CommitHandler>
where
    F: Fn(&Commit) -> PollingResult + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

// ============================================================================
// Client
// ============================================================================

/// Illegal state transitions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollingClientError {
    #[error("Polling client already started")]
    AlreadyStarted,

    #[error("Polling client has no tenant configured")]
    NotConfigured,
}

pub type Result<T> = std::result::Result<T, PollingClientError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PollingState {
    Idle = 0,
    Running = 1,
    Stopped = 2,
}

impl PollingState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Running,
            _ => Self::Stopped,
        }
    }
}

/// Resets the in-flight flag when a poll ends, however it ends.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// State shared between the client handle and its polling task.
struct Shared<P: ?Sized> {
    persistence: Arc<P>,
    handler: Arc<dyn CommitHandler>,
    tenant: RwLock<Option<String>>,
    checkpoint: AtomicI64,
    /// Unix millis of the last poll start or observed commit; 0 = never.
    last_activity: AtomicI64,
    in_flight: AtomicBool,
    state: AtomicU8,
    cancel: watch::Sender<bool>,
}

impl<P: CommitEvents + ?Sized> Shared<P> {
    fn tenant(&self) -> Option<String> {
        self.tenant
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    async fn poll(&self) {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Poll already in flight, skipping");
            return;
        }
        let _guard = InFlightGuard(&self.in_flight);

        let Some(tenant) = self.tenant() else {
            warn!("Poll requested before a tenant was configured");
            return;
        };

        let mut cancel_rx = self.cancel.subscribe();
        if *cancel_rx.borrow_and_update() {
            return;
        }

        self.touch();
        let from = self.checkpoint.load(Ordering::Acquire);
        let mut commits = self.persistence.get_from(&tenant, from);

        loop {
            // a stalled read must not outlive stop()
            let next = tokio::select! {
                next = commits.next() => next,
                _ = cancel_rx.changed() => {
                    debug!(tenant = %tenant, "Poll cancelled during read");
                    break;
                }
            };
            let Some(next) = next else {
                break;
            };
            if self.cancelled() {
                break;
            }

            let commit = match next {
                Ok(commit) => commit,
                Err(e) => {
                    let checkpoint = self.checkpoint.load(Ordering::Acquire);
                    if e.is_transient() {
                        warn!(tenant = %tenant, checkpoint, error = %e, "Poll failed, retrying on next tick");
                    } else {
                        error!(tenant = %tenant, checkpoint, error = %e, "Poll failed, retrying on next tick");
                    }
                    break;
                }
            };
            self.touch();

            match self.handler.handle(&commit).await {
                PollingResult::Continue => {
                    self.checkpoint
                        .store(commit.checkpoint_token, Ordering::Release);
                }
                PollingResult::Retry => {
                    debug!(
                        tenant = %tenant,
                        checkpoint = commit.checkpoint_token,
                        "Handler asked to retry commit"
                    );
                    break;
                }
                PollingResult::Stop => {
                    info!(
                        tenant = %tenant,
                        checkpoint = commit.checkpoint_token,
                        "Handler stopped polling"
                    );
                    self.state
                        .store(PollingState::Stopped as u8, Ordering::Release);
                    self.cancel.send_replace(true);
                    break;
                }
            }
        }
    }
}

/// Catch-up reader over any commit source.
pub struct PollingClient<P: ?Sized> {
    shared: Arc<Shared<P>>,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<P> PollingClient<P>
where
    P: CommitEvents + ?Sized + 'static,
{
    pub fn new(persistence: Arc<P>, handler: Arc<dyn CommitHandler>, interval: Duration) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                persistence,
                handler,
                tenant: RwLock::new(None),
                checkpoint: AtomicI64::new(0),
                last_activity: AtomicI64::new(0),
                in_flight: AtomicBool::new(false),
                state: AtomicU8::new(PollingState::Idle as u8),
                cancel,
            }),
            interval,
            task: Mutex::new(None),
        }
    }

    /// Bind the client to a tenant. Only allowed before polling starts.
    pub fn configure(&self, tenant: impl Into<String>) -> Result<()> {
        if self.state() != PollingState::Idle {
            return Err(PollingClientError::AlreadyStarted);
        }
        *self
            .shared
            .tenant
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(tenant.into());
        Ok(())
    }

    /// Start polling the configured tenant after `checkpoint`.
    pub fn start_from(&self, checkpoint: CheckpointToken) -> Result<()> {
        let Some(tenant) = self.shared.tenant() else {
            return Err(PollingClientError::NotConfigured);
        };
        if self
            .shared
            .state
            .compare_exchange(
                PollingState::Idle as u8,
                PollingState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(PollingClientError::AlreadyStarted);
        }

        self.shared.checkpoint.store(checkpoint, Ordering::Release);
        info!(
            tenant = %tenant,
            checkpoint,
            interval_ms = self.interval.as_millis() as u64,
            "Polling client started"
        );

        let handle = tokio::spawn(run(Arc::clone(&self.shared), self.interval));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Configure `tenant` and start polling after `checkpoint`.
    pub fn start(&self, tenant: impl Into<String>, checkpoint: CheckpointToken) -> Result<()> {
        self.configure(tenant)?;
        self.start_from(checkpoint)
    }

    /// Poll once right away. No-op if a poll is already in flight.
    pub async fn poll_now(&self) {
        self.shared.poll().await;
    }

    /// Stop polling and wait for the loop to finish. Idempotent.
    pub async fn stop(&self) {
        self.shared.cancel.send_replace(true);
        let previous = self
            .shared
            .state
            .swap(PollingState::Stopped as u8, Ordering::AcqRel);

        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Polling task failed");
            }
        }

        if PollingState::from_u8(previous) != PollingState::Stopped {
            info!(checkpoint = self.checkpoint(), "Polling client stopped");
        }
    }

    /// Checkpoint of the last commit the handler accepted.
    pub fn checkpoint(&self) -> CheckpointToken {
        self.shared.checkpoint.load(Ordering::Acquire)
    }

    /// Last time a poll started or a commit was observed.
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        match self.shared.last_activity.load(Ordering::Relaxed) {
            0 => None,
            millis => DateTime::from_timestamp_millis(millis),
        }
    }

    pub fn state(&self) -> PollingState {
        PollingState::from_u8(self.shared.state.load(Ordering::Acquire))
    }
}

impl<P: ?Sized> Drop for PollingClient<P> {
    fn drop(&mut self) {
        self.shared.cancel.send_replace(true);
    }
}

async fn run<P>(shared: Arc<Shared<P>>, interval: Duration)
where
    P: CommitEvents + ?Sized,
{
    let mut cancel_rx = shared.cancel.subscribe();

    loop {
        if *cancel_rx.borrow() {
            break;
        }

        shared.poll().await;

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel_rx.changed() => {}
        }
    }

    debug!("Polling loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CommitAttempt, EventMessage, Headers, Payload};
    use crate::persistence::InMemoryPersistence;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;
    use uuid::Uuid;

    async fn seeded(commits: u32) -> Arc<InMemoryPersistence> {
        let store = Arc::new(InMemoryPersistence::new());
        for n in 1..=commits {
            store
                .commit(CommitAttempt {
                    tenant_id: "t".to_string(),
                    stream_id: "s".to_string(),
                    stream_revision: n,
                    commit_id: Uuid::new_v4(),
                    commit_sequence: n,
                    commit_stamp: Utc::now(),
                    headers: Headers::new(),
                    events: vec![EventMessage::new(Payload::new("e", serde_json::json!(n)))],
                })
                .await
                .unwrap();
        }
        store
    }

    #[test]
    fn test_polling_config_default() {
        let config = PollingConfig::default();
        assert_eq!(config.interval(), Duration::from_secs(1));
        assert_eq!(config.tenant, "default");
    }

    #[tokio::test]
    async fn test_start_requires_tenant() {
        let client = PollingClient::new(
            seeded(0).await,
            handler_fn(|_| PollingResult::Continue),
            Duration::from_millis(10),
        );
        assert_eq!(client.start_from(0), Err(PollingClientError::NotConfigured));
        assert_eq!(client.state(), PollingState::Idle);
    }

    #[tokio::test]
    async fn test_configure_after_start_is_rejected() {
        let client = PollingClient::new(
            seeded(0).await,
            handler_fn(|_| PollingResult::Continue),
            Duration::from_millis(10),
        );
        client.start("t", 0).unwrap();
        assert_eq!(client.configure("other"), Err(PollingClientError::AlreadyStarted));
        assert_eq!(client.start_from(0), Err(PollingClientError::AlreadyStarted));
        client.stop().await;
        client.stop().await;
        assert_eq!(client.state(), PollingState::Stopped);
    }

    #[tokio::test]
    async fn test_continue_advances_checkpoint() {
        let client = PollingClient::new(
            seeded(3).await,
            handler_fn(|_| PollingResult::Continue),
            Duration::from_millis(10),
        );
        client.configure("t").unwrap();
        assert!(client.last_activity().is_none());

        client.poll_now().await;
        assert_eq!(client.checkpoint(), 3);
        assert!(client.last_activity().is_some());
    }

    #[tokio::test]
    async fn test_retry_keeps_checkpoint() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let client = PollingClient::new(
            seeded(2).await,
            handler_fn(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                PollingResult::Retry
            }),
            Duration::from_millis(10),
        );
        client.configure("t").unwrap();

        client.poll_now().await;
        client.poll_now().await;
        assert_eq!(client.checkpoint(), 0);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_read_failure_ends_poll_without_stopping() {
        let store = seeded(2).await;
        let client = PollingClient::new(
            Arc::clone(&store),
            handler_fn(|_| PollingResult::Continue),
            Duration::from_millis(10),
        );
        client.configure("t").unwrap();

        store.set_fail_on_read(true);
        client.poll_now().await;
        assert_eq!(client.checkpoint(), 0);
        assert_eq!(client.state(), PollingState::Idle);

        store.set_fail_on_read(false);
        client.poll_now().await;
        assert_eq!(client.checkpoint(), 2);
    }

    /// Blocks inside `handle` until released.
    struct GateHandler {
        entered: Notify,
        release: Notify,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CommitHandler for GateHandler {
        async fn handle(&self, _commit: &Commit) -> PollingResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            self.release.notified().await;
            PollingResult::Continue
        }
    }

    #[tokio::test]
    async fn test_overlapping_poll_is_a_noop() {
        let handler = Arc::new(GateHandler {
            entered: Notify::new(),
            release: Notify::new(),
            calls: AtomicUsize::new(0),
        });
        let client = Arc::new(PollingClient::new(
            seeded(1).await,
            handler.clone() as Arc<dyn CommitHandler>,
            Duration::from_millis(10),
        ));
        client.configure("t").unwrap();

        let first = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.poll_now().await })
        };
        handler.entered.notified().await;

        // returns immediately while the first poll is parked in the handler
        client.poll_now().await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        handler.release.notify_one();
        first.await.unwrap();
        assert_eq!(client.checkpoint(), 1);
    }

    /// Commit source whose checkpoint reads never yield.
    struct StalledReads {
        reads: AtomicUsize,
    }

    #[async_trait]
    impl CommitEvents for StalledReads {
        async fn commit(
            &self,
            _attempt: CommitAttempt,
        ) -> crate::persistence::Result<Option<Commit>> {
            Ok(None)
        }

        fn get(
            &self,
            _tenant: &str,
            _stream: &str,
            _min_revision: u32,
            _max_revision: u32,
        ) -> crate::persistence::CommitStream<'_> {
            futures::stream::empty().boxed()
        }

        fn get_from(
            &self,
            _tenant: &str,
            _checkpoint: CheckpointToken,
        ) -> crate::persistence::CommitStream<'_> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            futures::stream::pending().boxed()
        }

        fn get_by_time(
            &self,
            _tenant: &str,
            _start: DateTime<Utc>,
            _end: Option<DateTime<Utc>>,
        ) -> crate::persistence::CommitStream<'_> {
            futures::stream::empty().boxed()
        }
    }

    #[tokio::test]
    async fn test_stop_interrupts_stalled_read() {
        let source = Arc::new(StalledReads {
            reads: AtomicUsize::new(0),
        });
        let client = PollingClient::new(
            Arc::clone(&source),
            handler_fn(|_| PollingResult::Continue),
            Duration::from_millis(10),
        );
        client.start("t", 0).unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while source.reads.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("poll never started");

        let stopped = tokio::time::timeout(Duration::from_secs(2), client.stop()).await;
        assert!(stopped.is_ok(), "stop blocked on a stalled read");
        assert_eq!(client.state(), PollingState::Stopped);
    }
}
