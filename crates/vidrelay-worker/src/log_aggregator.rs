//! Worker-side batching of log lines sent to the host.
//!
//! Routine messages are queued and sent as one `message_logged` notification
//! per flush interval. Errors and exceptions flush the queue first so the
//! host always sees the routine lines that led up to them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::protocol::{Notification, WorkerFrame};

/// Default flush interval.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Batches log lines onto the worker's outbound frame queue.
pub struct LogAggregator {
    pending: Arc<Mutex<Vec<String>>>,
    sink: mpsc::UnboundedSender<WorkerFrame>,
    ticker: JoinHandle<()>,
}

impl LogAggregator {
    /// Start the periodic flush.
    pub fn start(interval: Duration, sink: mpsc::UnboundedSender<WorkerFrame>) -> Self {
        let pending: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let ticker = {
            let pending = pending.clone();
            let sink = sink.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if sink.is_closed() {
                        break;
                    }
                    flush_into(&pending, &sink).await;
                }
            })
        };

        Self {
            pending,
            sink,
            ticker,
        }
    }

    /// Queue a routine message.
    pub async fn log_message(&self, text: impl Into<String>) {
        self.pending.lock().await.push(text.into());
    }

    /// Flush queued messages, then send an error.
    pub async fn log_error(&self, text: impl Into<String>) {
        self.flush().await;
        let _ = self.sink.send(WorkerFrame::Notify(Notification::ErrorLogged {
            text: text.into(),
        }));
    }

    /// Flush queued messages, then send an exception report.
    pub async fn log_exception(&self, text: impl Into<String>) {
        self.flush().await;
        let _ = self.sink.send(WorkerFrame::Notify(Notification::Exception {
            text: text.into(),
        }));
    }

    /// Send everything queued so far.
    pub async fn flush(&self) {
        flush_into(&self.pending, &self.sink).await;
    }
}

impl Drop for LogAggregator {
    fn drop(&mut self) {
        self.ticker.abort();
    }
}

async fn flush_into(pending: &Mutex<Vec<String>>, sink: &mpsc::UnboundedSender<WorkerFrame>) {
    // Holding the lock across the send keeps batches in order.
    let mut queue = pending.lock().await;
    if queue.is_empty() {
        return;
    }
    let text = queue.join("\n");
    queue.clear();
    let _ = sink.send(WorkerFrame::Notify(Notification::MessageLogged { text }));
}
