//! Progress notifications.
//!
//! The runner reports stage transitions through the [`ProgressSink`] trait.
//! Observers must never block the runner: the bundled channel sink uses a
//! bounded queue and drops the oldest update on overflow, so a slow consumer
//! sees stale progress rather than stalling the pipeline.

use crate::types::StageName;

/// One progress notification, emitted on every stage transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub current_stage: StageName,
    /// 4 without the crux stage, 5 with it.
    pub total_stages: usize,
    pub completed_stages: usize,
    pub percent_complete: u8,
}

/// Non-blocking observer of pipeline progress.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, update: ProgressUpdate);
}

/// Channel-backed sink: bounded, drop-oldest on overflow.
pub struct ChannelProgress {
    tx: flume::Sender<ProgressUpdate>,
    rx: flume::Receiver<ProgressUpdate>,
}

impl ChannelProgress {
    /// Create a sink with the given queue capacity (must be non-zero).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = flume::bounded(capacity.max(1));
        Self { tx, rx }
    }

    /// A receiver handle for consumers.
    #[must_use]
    pub fn subscribe(&self) -> flume::Receiver<ProgressUpdate> {
        self.rx.clone()
    }
}

impl ProgressSink for ChannelProgress {
    fn on_progress(&self, update: ProgressUpdate) {
        loop {
            match self.tx.try_send(update) {
                Ok(()) => return,
                Err(flume::TrySendError::Full(_)) => {
                    // Drop the oldest queued update and retry once more.
                    let _ = self.rx.try_recv();
                }
                Err(flume::TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(completed: usize) -> ProgressUpdate {
        ProgressUpdate {
            current_stage: StageName::Clustering,
            total_stages: 4,
            completed_stages: completed,
            percent_complete: (completed * 25) as u8,
        }
    }

    #[test]
    fn delivers_in_order() {
        let sink = ChannelProgress::new(8);
        let rx = sink.subscribe();
        sink.on_progress(update(1));
        sink.on_progress(update(2));
        assert_eq!(rx.try_recv().unwrap().completed_stages, 1);
        assert_eq!(rx.try_recv().unwrap().completed_stages, 2);
    }

    #[test]
    fn overflow_drops_oldest() {
        let sink = ChannelProgress::new(2);
        let rx = sink.subscribe();
        sink.on_progress(update(1));
        sink.on_progress(update(2));
        sink.on_progress(update(3));
        // Update 1 was sacrificed; 2 and 3 remain.
        assert_eq!(rx.try_recv().unwrap().completed_stages, 2);
        assert_eq!(rx.try_recv().unwrap().completed_stages, 3);
        assert!(rx.try_recv().is_err());
    }
}
