//! Host side of the duplex pipe.
//!
//! A [`DuplexChannel`] owns one connection to one worker. Outbound calls are
//! correlated with replies by id and bounded by the call timeout. Inbound
//! notifications and the final close are forwarded, in arrival order, to the
//! [`ChannelEvent`] receiver returned by [`DuplexChannel::open`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use vidrelay_core::{ConfigurationSnapshot, EncodeRequest, RelayError, Result};

use crate::protocol::{
    Notification, PING_REPLY, Reply, Request, WorkerCall, WorkerFrame, decode_frame, encode_frame,
};
use crate::transport::IoBox;

/// Something the worker pushed to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Notification(Notification),
    /// The connection ended. Always the last event.
    Closed { reason: String },
}

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

/// A single persistent connection to a worker.
pub struct DuplexChannel {
    pipe_name: String,
    writer: Mutex<WriteHalf<IoBox>>,
    pending: PendingReplies,
    next_id: AtomicU64,
    call_timeout_ms: AtomicU64,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for DuplexChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexChannel")
            .field("pipe_name", &self.pipe_name)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl DuplexChannel {
    /// Wrap an established connection.
    ///
    /// `connection_timeout` bounds every call until [`set_up_worker`]
    /// succeeds and lowers it.
    ///
    /// [`set_up_worker`]: DuplexChannel::set_up_worker
    pub fn open(
        io: IoBox,
        pipe_name: impl Into<String>,
        connection_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let pipe_name = pipe_name.into();
        let (read_half, write_half) = tokio::io::split(io);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(read_loop(
            read_half,
            pending.clone(),
            closed.clone(),
            events_tx,
            pipe_name.clone(),
        ));

        let channel = Self {
            pipe_name,
            writer: Mutex::new(write_half),
            pending,
            next_id: AtomicU64::new(1),
            call_timeout_ms: AtomicU64::new(duration_ms(connection_timeout)),
            closed,
            reader,
        };
        (channel, events_rx)
    }

    pub fn pipe_name(&self) -> &str {
        &self.pipe_name
    }

    /// Timeout currently applied to each call.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms.load(Ordering::Acquire))
    }

    pub fn set_call_timeout(&self, timeout: Duration) {
        self.call_timeout_ms
            .store(duration_ms(timeout), Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send a call and wait for its reply.
    ///
    /// Fails with a communication fault on timeout or a broken connection,
    /// and with [`RelayError::OperationFailure`] when the worker rejects the call.
    pub async fn call(&self, call: WorkerCall) -> Result<Option<String>> {
        let name = call.name();
        if self.is_closed() {
            return Err(RelayError::transport(name, "channel closed"));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = encode_frame(&Request { id, call })?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().await.insert(id, reply_tx);

        let timeout = self.call_timeout();
        let exchange = async {
            {
                let mut writer = self.writer.lock().await;
                writer
                    .write_all(&frame)
                    .await
                    .map_err(|e| RelayError::transport(name, e.to_string()))?;
                writer
                    .flush()
                    .await
                    .map_err(|e| RelayError::transport(name, e.to_string()))?;
            }
            reply_rx
                .await
                .map_err(|_| RelayError::transport(name, "connection closed before reply"))
        };

        let outcome = tokio::time::timeout(timeout, exchange).await;
        let reply = match outcome {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                self.pending.lock().await.remove(&id);
                return Err(e);
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(RelayError::timeout(name, timeout));
            }
        };

        match reply.error {
            Some(message) => Err(RelayError::OperationFailure { message }),
            None => Ok(reply.result),
        }
    }

    /// Configure the worker's engine, then lower the call timeout to the
    /// steady-state value.
    #[instrument(skip(self, config), fields(pipe_name = %self.pipe_name))]
    pub async fn set_up_worker(
        &self,
        config: &ConfigurationSnapshot,
        steady_timeout: Duration,
    ) -> Result<()> {
        self.call(WorkerCall::SetUpWorker {
            config: config.clone(),
        })
        .await?;
        self.set_call_timeout(steady_timeout);
        debug!(timeout_ms = duration_ms(steady_timeout), "worker set up");
        Ok(())
    }

    pub async fn start_scan(&self, path: &str) -> Result<()> {
        self.call(WorkerCall::StartScan {
            path: path.to_string(),
        })
        .await
        .map(drop)
    }

    pub async fn start_encode(&self, request: &EncodeRequest) -> Result<()> {
        self.call(WorkerCall::StartEncode {
            request: request.clone(),
        })
        .await
        .map(drop)
    }

    pub async fn start_encode_from_payload(&self, payload: &str) -> Result<()> {
        self.call(WorkerCall::StartEncodeFromPayload {
            payload: payload.to_string(),
        })
        .await
        .map(drop)
    }

    pub async fn pause(&self) -> Result<()> {
        self.call(WorkerCall::Pause).await.map(drop)
    }

    pub async fn resume(&self) -> Result<()> {
        self.call(WorkerCall::Resume).await.map(drop)
    }

    pub async fn stop(&self) -> Result<()> {
        self.call(WorkerCall::Stop).await.map(drop)
    }

    pub async fn update_cpu_throttling(&self, fraction: f64) -> Result<()> {
        self.call(WorkerCall::UpdateCpuThrottling { fraction })
            .await
            .map(drop)
    }

    /// Liveness check. Succeeds only on the exact `OK` reply.
    pub async fn ping(&self) -> Result<()> {
        match self.call(WorkerCall::Ping).await? {
            Some(value) if value == PING_REPLY => Ok(()),
            other => Err(RelayError::protocol(format!(
                "unexpected ping reply {:?}",
                other
            ))),
        }
    }

    /// Shut down the write side and stop reading.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        self.reader.abort();
        self.pending.lock().await.clear();
    }
}

impl Drop for DuplexChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(
    read_half: ReadHalf<IoBox>,
    pending: PendingReplies,
    closed: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    pipe_name: String,
) {
    let mut lines = BufReader::new(read_half).lines();
    let reason = loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match decode_frame::<WorkerFrame>(&line) {
                    Ok(WorkerFrame::Reply(reply)) => {
                        match pending.lock().await.remove(&reply.id) {
                            Some(tx) => {
                                let _ = tx.send(reply);
                            }
                            None => debug!(id = reply.id, %pipe_name, "reply for abandoned call"),
                        }
                    }
                    Ok(WorkerFrame::Notify(notification)) => {
                        let _ = events.send(ChannelEvent::Notification(notification));
                    }
                    Err(e) => warn!(%pipe_name, error = %e, "dropping malformed frame"),
                }
            }
            Ok(None) => break "worker closed the connection".to_string(),
            Err(e) => break format!("read failed: {e}"),
        }
    };

    closed.store(true, Ordering::Release);
    // Dropping the senders fails every in-flight call.
    pending.lock().await.clear();
    debug!(%pipe_name, %reason, "channel closed");
    let _ = events.send(ChannelEvent::Closed { reason });
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
    use vidrelay_core::{FaultKind, ProgressEvent};

    struct FakeWorker {
        lines: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeWorker {
        async fn next_request(&mut self) -> Request {
            let line = self.lines.next_line().await.unwrap().unwrap();
            decode_frame(&line).unwrap()
        }

        async fn send(&mut self, frame: WorkerFrame) {
            let bytes = encode_frame(&frame).unwrap();
            self.writer.write_all(&bytes).await.unwrap();
            self.writer.flush().await.unwrap();
        }
    }

    fn pair(timeout: Duration) -> (DuplexChannel, mpsc::UnboundedReceiver<ChannelEvent>, FakeWorker) {
        let (host, worker) = tokio::io::duplex(64 * 1024);
        let (channel, events) = DuplexChannel::open(Box::new(host), "vidrelay.test", timeout);
        let (read, write) = tokio::io::split(worker);
        let fake = FakeWorker {
            lines: BufReader::new(read).lines(),
            writer: write,
        };
        (channel, events, fake)
    }

    #[tokio::test]
    async fn test_ping_round_trip() {
        let (channel, _events, mut worker) = pair(Duration::from_secs(5));

        let server = tokio::spawn(async move {
            let request = worker.next_request().await;
            assert_eq!(request.call, WorkerCall::Ping);
            worker
                .send(WorkerFrame::Reply(Reply::value(request.id, PING_REPLY)))
                .await;
            worker
        });

        channel.ping().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_ping_reply_is_protocol_error() {
        let (channel, _events, mut worker) = pair(Duration::from_secs(5));
        let server = tokio::spawn(async move {
            let request = worker.next_request().await;
            worker.send(WorkerFrame::Reply(Reply::value(request.id, "NO"))).await;
            worker
        });

        let err = channel.ping().await.unwrap_err();
        assert!(matches!(err, RelayError::Protocol { .. }));
        server.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_times_out() {
        let (channel, _events, mut worker) = pair(Duration::from_secs(5));
        let server = tokio::spawn(async move {
            let _ignored = worker.next_request().await;
            worker
        });

        let err = channel.pause().await.unwrap_err();
        match err {
            RelayError::CommunicationFault { operation, kind } => {
                assert_eq!(operation, "pause");
                assert_eq!(kind, FaultKind::Timeout { after: Duration::from_secs(5) });
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(channel.pending.lock().await.is_empty());
        server.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_up_lowers_timeout() {
        let (channel, _events, mut worker) = pair(Duration::from_secs(30));
        assert_eq!(channel.call_timeout(), Duration::from_secs(30));

        let server = tokio::spawn(async move {
            let request = worker.next_request().await;
            assert!(matches!(request.call, WorkerCall::SetUpWorker { .. }));
            worker.send(WorkerFrame::Reply(Reply::ok(request.id))).await;
            worker
        });

        channel
            .set_up_worker(&ConfigurationSnapshot::default(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(channel.call_timeout(), Duration::from_secs(5));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_error_reply() {
        let (channel, _events, mut worker) = pair(Duration::from_secs(5));
        let server = tokio::spawn(async move {
            let request = worker.next_request().await;
            worker
                .send(WorkerFrame::Reply(Reply::error(request.id, "no such title")))
                .await;
            worker
        });

        let err = channel.start_scan("/movies/a.mkv").await.unwrap_err();
        assert!(matches!(err, RelayError::OperationFailure { ref message } if message == "no such title"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_notifications_arrive_in_order() {
        let (_channel, mut events, mut worker) = pair(Duration::from_secs(5));

        worker.send(WorkerFrame::Notify(Notification::Started)).await;
        worker
            .send(WorkerFrame::Notify(Notification::Progress {
                progress: ProgressEvent::new(0.5),
            }))
            .await;
        worker
            .send(WorkerFrame::Notify(Notification::MessageLogged {
                text: "pass 1".into(),
            }))
            .await;

        assert_eq!(
            events.recv().await,
            Some(ChannelEvent::Notification(Notification::Started))
        );
        assert!(matches!(
            events.recv().await,
            Some(ChannelEvent::Notification(Notification::Progress { .. }))
        ));
        assert!(matches!(
            events.recv().await,
            Some(ChannelEvent::Notification(Notification::MessageLogged { .. }))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_call_and_emits_closed() {
        let (channel, mut events, mut worker) = pair(Duration::from_secs(5));

        let server = tokio::spawn(async move {
            let _request = worker.next_request().await;
            drop(worker);
        });

        let err = channel.stop().await.unwrap_err();
        assert!(err.is_communication_fault());
        server.await.unwrap();

        assert!(matches!(events.recv().await, Some(ChannelEvent::Closed { .. })));
        assert!(channel.is_closed());

        let err = channel.resume().await.unwrap_err();
        assert!(err.to_string().contains("channel closed"));
    }

    #[tokio::test]
    async fn test_malformed_frame_is_skipped() {
        let (_channel, mut events, mut worker) = pair(Duration::from_secs(5));
        worker.writer.write_all(b"garbage\n").await.unwrap();
        worker.send(WorkerFrame::Notify(Notification::Started)).await;

        assert_eq!(
            events.recv().await,
            Some(ChannelEvent::Notification(Notification::Started))
        );
    }
}
