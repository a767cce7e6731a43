//! Unbounded FIFO hand-off between device callbacks and the writer
//!
//! Producers never wait: `enqueue` is a plain append. The only way the queue
//! shrinks is the writer draining it, so a sink that stays down makes the
//! queue grow without bound. [`IngestionReceiver::depth`] exposes that growth.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::models::Reading;

/// Returned when a reading is offered after the queue was closed.
#[derive(Error, Debug, PartialEq)]
#[error("ingestion queue closed, reading from {} rejected", .0.address())]
pub struct QueueClosed(pub Reading);

struct Shared {
    tx: Mutex<Option<mpsc::UnboundedSender<Reading>>>,
    depth: AtomicUsize,
}

/// Producer side. Cheap to clone; every clone feeds the same queue.
#[derive(Clone)]
pub struct IngestionSender {
    shared: Arc<Shared>,
}

/// The single consumer side.
pub struct IngestionReceiver {
    rx: mpsc::UnboundedReceiver<Reading>,
    shared: Arc<Shared>,
}

/// Create a connected sender/receiver pair.
pub fn ingestion_queue() -> (IngestionSender, IngestionReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        tx: Mutex::new(Some(tx)),
        depth: AtomicUsize::new(0),
    });

    (
        IngestionSender {
            shared: shared.clone(),
        },
        IngestionReceiver { rx, shared },
    )
}

impl IngestionSender {
    /// Append a reading. Never blocks; fails only after [`IngestionSender::close`].
    pub fn enqueue(&self, reading: Reading) -> Result<(), QueueClosed> {
        let tx = self
            .shared
            .tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match tx.as_ref() {
            Some(tx) => {
                // Counted before sending so the receiver never sees depth underflow
                self.shared.depth.fetch_add(1, Ordering::SeqCst);
                tx.send(reading).map_err(|e| {
                    self.shared.depth.fetch_sub(1, Ordering::SeqCst);
                    QueueClosed(e.0)
                })
            }
            None => Err(QueueClosed(reading)),
        }
    }

    /// Signal that no more readings will be produced. Idempotent.
    ///
    /// Readings already queued stay available to the receiver.
    pub fn close(&self) {
        self.shared
            .tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.shared
            .tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }

    pub fn depth(&self) -> usize {
        self.shared.depth.load(Ordering::SeqCst)
    }
}

impl IngestionReceiver {
    /// Next reading in FIFO order, or `None` once closed and drained.
    pub async fn dequeue(&mut self) -> Option<Reading> {
        let reading = self.rx.recv().await?;
        self.shared.depth.fetch_sub(1, Ordering::SeqCst);
        Some(reading)
    }

    /// Refuse further readings from every sender
    ///
    /// Readings accepted before the call stay available to
    /// [`IngestionReceiver::drain_ready`]; later `enqueue` calls get
    /// [`QueueClosed`].
    pub fn close(&mut self) {
        self.rx.close();
        self.shared
            .tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }

    /// Take whatever is queued right now without waiting.
    pub fn drain_ready(&mut self) -> Vec<Reading> {
        let mut drained = Vec::new();
        while let Ok(reading) = self.rx.try_recv() {
            self.shared.depth.fetch_sub(1, Ordering::SeqCst);
            drained.push(reading);
        }
        drained
    }

    /// Readings enqueued but not yet dequeued
    pub fn depth(&self) -> usize {
        self.shared.depth.load(Ordering::SeqCst)
    }
}
