//! Single consumer forwarding queued readings to the configured sink
use log::{debug, error, info, warn};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::models::Reading;
use crate::pipeline::queue::IngestionReceiver;
use crate::sink::ReadingSink;
use crate::utils::format_datetime;

/// Totals for one writer run.
#[derive(Debug, Default)]
pub struct WriterReport {
    pub delivered: u64,
    pub dropped: u64,
    pub retries: u64,
    /// Readings still pending when shutdown interrupted a retry wait
    pub undelivered: Vec<Reading>,
}

enum Delivery {
    Delivered,
    Dropped,
    Interrupted,
}

/// Forwards readings in FIFO order, retrying transient failures forever.
///
/// A reading that keeps failing with a transient error blocks every reading
/// behind it; there is no retry limit and no dead-letter path. Only the
/// shutdown signal can end the wait between attempts. An attempt that is
/// already running is always allowed to finish.
pub struct ForwardingWriter<S> {
    sink: S,
    receiver: IngestionReceiver,
    retry_interval: Duration,
    shutdown: CancellationToken,
    report: WriterReport,
}

impl<S: ReadingSink> ForwardingWriter<S> {
    pub fn new(
        sink: S,
        receiver: IngestionReceiver,
        retry_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        ForwardingWriter {
            sink,
            receiver,
            retry_interval,
            shutdown,
            report: WriterReport::default(),
        }
    }

    /// Run until the queue is closed and drained, or shutdown interrupts a retry
    pub async fn run(mut self) -> WriterReport {
        info!("Forwarding readings to {}", self.sink.name());

        while let Some(reading) = self.receiver.dequeue().await {
            match self.forward(&reading).await {
                Delivery::Delivered => self.report.delivered += 1,
                Delivery::Dropped => self.report.dropped += 1,
                Delivery::Interrupted => {
                    self.report.undelivered.push(reading);
                    // Producers still running get QueueClosed from here on
                    self.receiver.close();
                    let queued = self.receiver.drain_ready();
                    self.report.undelivered.extend(queued);
                    warn!(
                        "Shutdown during retry wait, {} reading(s) not delivered to {}",
                        self.report.undelivered.len(),
                        self.sink.name()
                    );
                    break;
                }
            }
        }

        info!(
            "Ending sensor send: {} delivered, {} dropped, {} retries",
            self.report.delivered, self.report.dropped, self.report.retries
        );
        self.report
    }

    async fn forward(&mut self, reading: &Reading) -> Delivery {
        let mut attempt: u64 = 0;

        loop {
            debug!(
                "[{}] Sending reading captured at {}",
                reading.address(),
                format_datetime(&reading.timestamp())
            );

            match self.sink.send(reading).await {
                Ok(()) => return Delivery::Delivered,
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    self.report.retries += 1;
                    error!(
                        "[{}] Failed to send sensor data: {}, retry attempt {} in {:?} ({} queued)",
                        reading.address(),
                        e,
                        attempt,
                        self.retry_interval,
                        self.receiver.depth()
                    );

                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Delivery::Interrupted,
                        _ = tokio::time::sleep(self.retry_interval) => {}
                    }
                }
                Err(e) => {
                    error!(
                        "[{}] Caught exception while trying to write sensor data, dropping reading: {}",
                        reading.address(),
                        e
                    );
                    return Delivery::Dropped;
                }
            }
        }
    }
}
