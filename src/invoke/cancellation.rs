//! Client-side cancellation wiring shared by unary and streaming invokes.
//!
//! The server-side cooperative token table lives in [`crate::invoke::state`];
//! this module only covers turning a caller-supplied
//! [`tokio_util::sync::CancellationToken`] into a `send-abort` emission and
//! a settled-as-`Aborted` call.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Spawn a task that resolves `on_trip` the first time `cancel` trips.
///
/// Returns the task's handle so the caller can abort the watcher once the
/// call has settled through some other path (response, error, or
/// stream-end) — otherwise the watcher task would outlive the call.
pub(crate) fn spawn_cancel_watcher(
    cancel: CancellationToken,
    on_trip: impl FnOnce() + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        cancel.cancelled().await;
        on_trip();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn watcher_fires_exactly_once_on_trip() {
        let cancel = CancellationToken::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let handle = spawn_cancel_watcher(cancel.clone(), move || {
            fired2.store(true, Ordering::SeqCst);
        });
        cancel.cancel();
        handle.await.unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn watcher_can_be_aborted_before_trip() {
        let cancel = CancellationToken::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let handle = spawn_cancel_watcher(cancel, move || {
            fired2.store(true, Ordering::SeqCst);
        });
        handle.abort();
        let _ = handle.await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
