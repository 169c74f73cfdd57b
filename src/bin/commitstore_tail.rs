//! commitstore-tail: follow a tenant's commits
//!
//! Catch-up consumer that logs every commit of one tenant in checkpoint
//! order, starting at the beginning of the store. Useful for checking what a
//! store holds and for watching writes as they land.
//!
//! ## Configuration
//! - COMMITSTORE_CONFIG: YAML config file (optional, `commitstore.yaml` is read if present)
//! - COMMITSTORE_LOG: tracing filter (default: info)
//! - COMMITSTORE__STORAGE__TYPE, COMMITSTORE__POLLING__TENANT, ...: per-key overrides
//!
//! An optional first argument sets the checkpoint to start after.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use commitstore::config::Config;
use commitstore::persistence::init_persistence;
use commitstore::polling::{CommitHandler, PollingClient, PollingResult};
use commitstore::serialization::JsonSerializer;
use commitstore::utils::bootstrap::{init_tracing, shutdown_signal};
use commitstore::Commit;

struct LogHandler;

#[async_trait]
impl CommitHandler for LogHandler {
    async fn handle(&self, commit: &Commit) -> PollingResult {
        info!(
            checkpoint = commit.checkpoint_token,
            stream = %commit.stream_id,
            revision = commit.stream_revision,
            sequence = commit.commit_sequence,
            commit_id = %commit.commit_id,
            stamp = %commit.commit_stamp,
            events = commit.events.len(),
            "Commit"
        );
        for event in &commit.events {
            info!(kind = %event.body.kind, data = %event.body.data, "  Event");
        }
        PollingResult::Continue
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    let start_after = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => 0,
    };

    let serializer = Arc::new(JsonSerializer::new(config.serializer.clone()));
    let persistence = init_persistence(&config.storage, serializer).await?;

    let client = PollingClient::new(
        persistence,
        Arc::new(LogHandler),
        config.polling.interval(),
    );
    client.start(config.polling.tenant.clone(), start_after)?;

    info!(
        tenant = %config.polling.tenant,
        checkpoint = start_after,
        "commitstore-tail started"
    );

    shutdown_signal().await;
    client.stop().await;

    Ok(())
}
