//! Progress notification
//!
//! Publishing never blocks the frame loop: the broadcast channel keeps a
//! bounded buffer per listener and a slow listener loses its oldest events.

use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::trace;
use video_track_common::ProgressEvent;

/// Fire-and-forget sink for progress events
///
/// Events of one task are published from one place at a time, so their
/// order is preserved for every listener.
pub trait ProgressChannel: Send + Sync {
    fn publish(&self, event: ProgressEvent);
}

/// In-process fan-out over a tokio broadcast channel
#[derive(Clone)]
pub struct BroadcastProgressChannel {
    sender: broadcast::Sender<ProgressEvent>,
}

impl BroadcastProgressChannel {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// New listener, receiving events published from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl ProgressChannel for BroadcastProgressChannel {
    fn publish(&self, event: ProgressEvent) {
        // No listeners is not an error
        if self.sender.send(event).is_err() {
            trace!("Progress event dropped, no listeners");
        }
    }
}

/// Decides which intermediate progress values are worth publishing
///
/// Values never go backwards, and 100 always passes.
#[derive(Debug)]
pub struct ProgressThrottle {
    min_step: u8,
    min_interval: Duration,
    last_value: u8,
    last_emit: Option<Instant>,
}

impl ProgressThrottle {
    /// `initial` is the value already published
    #[must_use]
    pub fn new(initial: u8, min_step: u8, min_interval: Duration) -> Self {
        Self {
            min_step: min_step.max(1),
            min_interval,
            last_value: initial,
            last_emit: None,
        }
    }

    /// Returns the value to publish, if any
    pub fn offer(&mut self, progress: u8) -> Option<u8> {
        let progress = progress.min(100);
        if progress <= self.last_value {
            return None;
        }

        let due = self
            .last_emit
            .map_or(true, |at| at.elapsed() >= self.min_interval);
        let big_enough = progress - self.last_value >= self.min_step;

        if progress == 100 || (due && big_enough) {
            self.last_value = progress;
            self.last_emit = Some(Instant::now());
            Some(progress)
        } else {
            None
        }
    }

    #[must_use]
    pub fn last_value(&self) -> u8 {
        self.last_value
    }
}
