//! Helpers for the shared shutdown scope.
//!
//! The scope is a `watch::channel(bool)`; `true` means shut down. A dropped
//! sender is treated the same as `true`.

use std::time::Duration;

use tokio::sync::watch;

/// Resolve once shutdown has been signaled.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Sleep for `duration` unless shutdown is signaled first.
///
/// Returns `true` if the full duration elapsed.
pub async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        biased;
        _ = wait_for_shutdown(shutdown) => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
