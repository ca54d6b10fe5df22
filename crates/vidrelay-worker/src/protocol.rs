//! Wire protocol between the host and the worker process.
//!
//! Frames are newline-delimited JSON. The host sends [`Request`] frames, each
//! carrying a correlation id. The worker answers with [`WorkerFrame::Reply`]
//! for calls and pushes [`WorkerFrame::Notify`] frames at any time.
//!
//! ```text
//! host → worker   {"id":7,"call":{"call":"ping"}}
//! worker → host   {"reply":{"id":7,"result":"OK"}}
//! worker → host   {"notify":{"event":"progress","progress":{...}}}
//! ```

use serde::{Deserialize, Serialize};

use vidrelay_core::{
    CompletionResult, ConfigurationSnapshot, EncodeRequest, ProgressEvent, RelayError, Result,
};

/// Line the worker prints on stdout once its endpoint is listening.
pub const READY_LINE: &str = "ready";

/// Reply value for a successful ping.
pub const PING_REPLY: &str = "OK";

/// A host-to-worker call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum WorkerCall {
    /// Configure the engine. Must be the first call on a connection.
    SetUpWorker { config: ConfigurationSnapshot },
    StartEncode { request: EncodeRequest },
    /// Start an encode from an already-serialized job payload
    StartEncodeFromPayload { payload: String },
    StartScan { path: String },
    Pause,
    Resume,
    Stop,
    Ping,
    /// Mid-operation CPU throttling change, applied by the worker directly
    UpdateCpuThrottling { fraction: f64 },
}

impl WorkerCall {
    /// Short name used in logs and fault reports.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetUpWorker { .. } => "set_up_worker",
            Self::StartEncode { .. } => "start_encode",
            Self::StartEncodeFromPayload { .. } => "start_encode_from_payload",
            Self::StartScan { .. } => "start_scan",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
            Self::Ping => "ping",
            Self::UpdateCpuThrottling { .. } => "update_cpu_throttling",
        }
    }
}

/// Host-to-worker frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub call: WorkerCall,
}

/// Answer to a [`Request`] with the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    pub fn ok(id: u64) -> Self {
        Self {
            id,
            result: None,
            error: None,
        }
    }

    pub fn value(id: u64, value: impl Into<String>) -> Self {
        Self {
            id,
            result: Some(value.into()),
            error: None,
        }
    }

    pub fn error(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(message.into()),
        }
    }
}

/// One-way worker-to-host notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    Started,
    Progress { progress: ProgressEvent },
    ScanCompleted { scan_json: String },
    Completed { result: CompletionResult },
    /// One or more batched routine log lines, newline separated
    MessageLogged { text: String },
    ErrorLogged { text: String },
    Exception { text: String },
}

impl Notification {
    /// True for the notification that ends an operation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Worker-to-host frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerFrame {
    Reply(Reply),
    Notify(Notification),
}

/// Serialize a frame as one JSON line (including the trailing newline).
pub fn encode_frame<T: Serialize>(frame: &T) -> Result<Vec<u8>> {
    let mut bytes =
        serde_json::to_vec(frame).map_err(|e| RelayError::json_parse("encoding frame", e))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Parse one JSON line into a frame.
pub fn decode_frame<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T> {
    serde_json::from_str(line.trim_end()).map_err(|e| RelayError::JsonParse {
        context: "decoding frame".into(),
        message: format!("{e}: {}", truncate(line, 120)),
        source: Some(e),
    })
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vidrelay_core::EncodeJob;

    #[test]
    fn test_request_wire_shape() {
        let bytes = encode_frame(&Request {
            id: 7,
            call: WorkerCall::Ping,
        })
        .unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text, "{\"id\":7,\"call\":{\"call\":\"ping\"}}\n");
    }

    #[test]
    fn test_reply_wire_shape() {
        let bytes = encode_frame(&WorkerFrame::Reply(Reply::value(7, PING_REPLY))).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text, "{\"reply\":{\"id\":7,\"result\":\"OK\"}}\n");
    }

    #[test]
    fn test_notification_wire_shape() {
        let frame: WorkerFrame =
            decode_frame(r#"{"notify":{"event":"scan_completed","scan_json":"{}"}}"#).unwrap();
        assert_eq!(
            frame,
            WorkerFrame::Notify(Notification::ScanCompleted {
                scan_json: "{}".into()
            })
        );
    }

    #[test]
    fn test_start_encode_carries_request() {
        let request = EncodeRequest::new(EncodeJob::new("/in.mkv", "/out.mp4")).with_preview(2, 15);
        let call = WorkerCall::StartEncode { request };
        let line = String::from_utf8(encode_frame(&call).unwrap()).unwrap();
        assert!(line.contains("\"call\":\"start_encode\""));
        assert!(line.contains("\"preview_index\":2"));

        let back: WorkerCall = decode_frame(&line).unwrap();
        assert_eq!(back, call);
        assert_eq!(back.name(), "start_encode");
    }

    #[test]
    fn test_set_up_accepts_partial_config() {
        let call: WorkerCall =
            decode_frame(r#"{"call":"set_up_worker","config":{"cpu_throttling":0.5}}"#).unwrap();
        match call {
            WorkerCall::SetUpWorker { config } => {
                assert_eq!(config.cpu_throttling, 0.5);
                assert_eq!(config.preview_count, 10);
            }
            other => panic!("unexpected call {other:?}"),
        }
    }

    #[test]
    fn test_decode_garbage_reports_context() {
        let err = decode_frame::<WorkerFrame>("not json at all").unwrap_err();
        assert!(err.to_string().contains("decoding frame"));
    }

    #[test]
    fn test_terminal_notification() {
        assert!(
            Notification::Completed {
                result: CompletionResult::success()
            }
            .is_terminal()
        );
        assert!(!Notification::Started.is_terminal());
    }
}
