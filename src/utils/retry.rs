//! Retry utilities: backoff builders and transient error classification.
//!
//! Uses `backon` for exponential backoff with jitter. Only connection setup is
//! retried this way; commit conflicts always surface to the caller.

use std::time::Duration;

use backon::ExponentialBuilder;
use tonic::{Code, Status};

/// Backoff for remote store connection retries at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}

/// Determines if a gRPC status reports a connectivity-class failure.
///
/// `Aborted` reports a concurrency conflict and is not transient.
pub fn is_transient_status(status: &Status) -> bool {
    matches!(
        status.code(),
        Code::Unavailable | Code::DeadlineExceeded | Code::ResourceExhausted
    )
}
