//! Lock heartbeat.
//!
//! A cooperating task that extends the run lock every refresh interval. When
//! an extension fails — the lock expired or another owner took it — the task
//! flips a shared watch flag and exits; the runner observes the flag at its
//! next suspension point, abandons the current stage, and unwinds as
//! `LockLost` without further state writes.

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::lock::{LockManager, LockSettings};

/// Handle to the background heartbeat task.
pub struct Heartbeat {
    handle: JoinHandle<()>,
    lost_rx: watch::Receiver<bool>,
}

impl Heartbeat {
    /// Spawn a heartbeat extending `key` (held with `value`) on every
    /// refresh interval.
    #[must_use]
    pub fn spawn(lock: LockManager, key: String, value: String, settings: LockSettings) -> Self {
        let (lost_tx, lost_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(settings.refresh_interval);
            // The first tick fires immediately; skip it, the lock is fresh.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match lock.extend(&key, &value, settings.ttl).await {
                    Ok(true) => {
                        tracing::trace!(%key, "lock extended");
                    }
                    Ok(false) => {
                        tracing::warn!(%key, "lock no longer held; signalling abort");
                        let _ = lost_tx.send(true);
                        return;
                    }
                    Err(err) => {
                        tracing::warn!(%key, error = %err, "lock extension errored; signalling abort");
                        let _ = lost_tx.send(true);
                        return;
                    }
                }
            }
        });
        Self { handle, lost_rx }
    }

    /// Watch handle that flips to true when the lock is lost.
    #[must_use]
    pub fn lost(&self) -> watch::Receiver<bool> {
        self.lost_rx.clone()
    }

    /// Whether the heartbeat has observed lock loss.
    #[must_use]
    pub fn is_lost(&self) -> bool {
        *self.lost_rx.borrow()
    }

    /// Stop the background task (the lock itself is left to the caller).
    pub fn stop(self) {
        self.handle.abort();
    }
}

/// Resolve once the watch flag flips to true; pends forever if the sender
/// goes away without flipping it.
pub(crate) async fn wait_lost(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
