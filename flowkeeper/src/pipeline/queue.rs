use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::metrics::registry::{CHANNEL_CAPACITY, CHANNEL_SENDS_TOTAL};

/// Sending half of a bounded inter-stage queue that never waits.
///
/// A full or closed queue drops the item and bumps the drop counter shared by
/// every clone of this sender.
#[derive(Debug)]
pub struct DropSender<T> {
    channel: &'static str,
    tx: mpsc::Sender<T>,
    dropped: Arc<AtomicU64>,
}

impl<T> Clone for DropSender<T> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel,
            tx: self.tx.clone(),
            dropped: Arc::clone(&self.dropped),
        }
    }
}

/// Creates a bounded queue named `channel` (used as the metrics label).
pub fn bounded<T>(channel: &'static str, capacity: usize) -> (DropSender<T>, mpsc::Receiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    CHANNEL_CAPACITY
        .with_label_values(&[channel])
        .set(capacity as i64);
    (
        DropSender {
            channel,
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}

impl<T> DropSender<T> {
    /// Enqueues without waiting. Returns `false` if the item was dropped.
    pub fn offer(&self, item: T) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => {
                CHANNEL_SENDS_TOTAL
                    .with_label_values(&[self.channel, "success"])
                    .inc();
                true
            }
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                CHANNEL_SENDS_TOTAL
                    .with_label_values(&[self.channel, "backpressure"])
                    .inc();
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                CHANNEL_SENDS_TOTAL
                    .with_label_values(&[self.channel, "closed"])
                    .inc();
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// The shared drop counter, readable after the sender is gone.
    pub fn drop_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }

    pub fn channel(&self) -> &'static str {
        self.channel
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
