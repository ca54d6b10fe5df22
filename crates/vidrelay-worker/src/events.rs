//! Events delivered to the host application.
//!
//! Every executor hands out one [`OperationEvent`] receiver. The
//! [`EventRelay`] in front of it enforces the delivery order: `Started`
//! before any `Progress`, nothing after `Completed`, and `Completed` at most
//! once. The stream closes right after `Completed`.

use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use vidrelay_core::{CompletionResult, LogEntry, OperationState, ProgressEvent, RelayError};

/// One event on an operation's event stream.
#[derive(Debug)]
pub enum OperationEvent {
    StateChanged(OperationState),
    Started,
    Progress(ProgressEvent),
    Log(LogEntry),
    ScanCompleted { scan_json: String },
    /// The single consolidated failure report. Followed by `Completed`.
    Failed(RelayError),
    /// Always the last event.
    Completed(CompletionResult),
}

impl OperationEvent {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

#[derive(Debug)]
struct RelayInner {
    tx: Option<mpsc::UnboundedSender<OperationEvent>>,
    started: bool,
}

/// Ordering gate in front of the event stream.
#[derive(Debug)]
pub struct EventRelay {
    inner: Mutex<RelayInner>,
}

impl EventRelay {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OperationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let relay = Self {
            inner: Mutex::new(RelayInner {
                tx: Some(tx),
                started: false,
            }),
        };
        (relay, rx)
    }

    pub async fn state_changed(&self, state: OperationState) {
        self.send(OperationEvent::StateChanged(state)).await;
    }

    /// Forward `Started`. Duplicates are dropped.
    pub async fn started(&self) {
        let mut inner = self.inner.lock().await;
        if inner.started {
            return;
        }
        inner.started = true;
        emit(&inner, OperationEvent::Started);
    }

    /// Forward progress. Dropped until `Started` has been sent.
    pub async fn progress(&self, progress: ProgressEvent) {
        let inner = self.inner.lock().await;
        if !inner.started {
            debug!(fraction = progress.fraction_complete, "dropping progress before start");
            return;
        }
        emit(&inner, OperationEvent::Progress(progress));
    }

    pub async fn log(&self, entry: LogEntry) {
        self.send(OperationEvent::Log(entry)).await;
    }

    pub async fn scan_completed(&self, scan_json: String) {
        self.send(OperationEvent::ScanCompleted { scan_json }).await;
    }

    pub async fn failed(&self, error: RelayError) {
        self.send(OperationEvent::Failed(error)).await;
    }

    /// Send `Completed` and close the stream. Returns false if the stream
    /// was already closed.
    pub async fn complete(&self, result: CompletionResult) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.tx.take() {
            Some(tx) => {
                let _ = tx.send(OperationEvent::Completed(result));
                true
            }
            None => false,
        }
    }

    /// Close the stream without a completion.
    pub async fn close(&self) {
        self.inner.lock().await.tx.take();
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.tx.is_none()
    }

    async fn send(&self, event: OperationEvent) {
        let inner = self.inner.lock().await;
        emit(&inner, event);
    }
}

fn emit(inner: &RelayInner, event: OperationEvent) {
    match &inner.tx {
        Some(tx) => {
            let _ = tx.send(event);
        }
        None => debug!(?event, "dropping event after completion"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vidrelay_core::LogSource;

    fn drain(rx: &mut mpsc::UnboundedReceiver<OperationEvent>) -> Vec<OperationEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_progress_before_started_is_dropped() {
        let (relay, mut rx) = EventRelay::new();
        relay.progress(ProgressEvent::new(0.1)).await;
        relay.started().await;
        relay.progress(ProgressEvent::new(0.2)).await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], OperationEvent::Started));
        assert!(matches!(events[1], OperationEvent::Progress(ref p) if p.fraction_complete == 0.2));
    }

    #[tokio::test]
    async fn test_started_only_once() {
        let (relay, mut rx) = EventRelay::new();
        relay.started().await;
        relay.started().await;
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn test_nothing_after_completed() {
        let (relay, mut rx) = EventRelay::new();
        relay.started().await;
        assert!(relay.complete(CompletionResult::success()).await);
        relay.progress(ProgressEvent::new(0.9)).await;
        relay
            .log(LogEntry::message(LogSource::Worker, "late line"))
            .await;
        assert!(!relay.complete(CompletionResult::cancelled()).await);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(events[1].is_completed());
        // Stream is closed after completion.
        assert!(rx.recv().await.is_none());
        assert!(relay.is_closed().await);
    }

    #[tokio::test]
    async fn test_close_without_completion() {
        let (relay, mut rx) = EventRelay::new();
        relay.state_changed(OperationState::Finished).await;
        relay.close().await;
        assert!(matches!(
            rx.recv().await,
            Some(OperationEvent::StateChanged(OperationState::Finished))
        ));
        assert!(rx.recv().await.is_none());
    }
}
