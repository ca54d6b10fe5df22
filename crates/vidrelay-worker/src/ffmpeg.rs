//! Engine backed by the ffmpeg command-line tools.
//!
//! Scans run `ffprobe -print_format json` and hand its output back verbatim.
//! Encodes run `ffmpeg -progress pipe:1` and translate its key=value
//! progress blocks into [`ProgressEvent`]s. Pause and resume stop and
//! continue the ffmpeg process on Unix.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, Notify, mpsc};
use tracing::{debug, info, warn};

use vidrelay_core::{
    CompletionResult, ConfigurationSnapshot, EncodeRequest, ProgressEvent, RelayError, Result,
};

use crate::engine::{Engine, EngineEvent, spawn_job};

/// Number of stderr lines kept for the failure report.
const STDERR_TAIL: usize = 5;

/// Parser for ffmpeg `-progress` output (key=value lines).
#[derive(Debug, Default, Clone)]
pub struct ProgressParser {
    pub out_time_us: u64,
    pub fps: Option<f64>,
    pub speed: Option<f64>,
    pub is_complete: bool,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one line. Returns true when the line closes a progress block.
    pub fn parse_line(&mut self, line: &str) -> bool {
        let Some((key, value)) = line.split_once('=') else {
            return false;
        };
        let value = value.trim();
        match key.trim() {
            "out_time_us" => {
                if let Ok(us) = value.parse::<u64>() {
                    self.out_time_us = us;
                }
            }
            "fps" => {
                if let Ok(f) = value.parse::<f64>() {
                    self.fps = Some(f);
                }
            }
            "speed" => {
                // Speed is in format "1.23x", strip the 'x'
                if let Ok(s) = value.trim_end_matches('x').parse::<f64>() {
                    self.speed = Some(s);
                }
            }
            "progress" => {
                if value == "end" {
                    self.is_complete = true;
                }
                return true;
            }
            _ => {}
        }
        false
    }

    /// Output time in seconds.
    pub fn out_time_s(&self) -> f64 {
        self.out_time_us as f64 / 1_000_000.0
    }

    /// Snapshot as a progress event, given the total duration being encoded.
    pub fn to_event(&self, duration_s: Option<f64>) -> ProgressEvent {
        let fraction = match duration_s {
            Some(total) if total > 0.0 => self.out_time_s() / total,
            _ => 0.0,
        };
        let fraction = if self.is_complete { 1.0 } else { fraction };
        let mut event = ProgressEvent::new(fraction).with_rates(self.fps, None);
        if let (Some(total), Some(speed)) = (duration_s, self.speed) {
            if speed > 0.0 {
                event = event.with_eta((total - self.out_time_s()).max(0.0) / speed);
            }
        }
        event
    }
}

/// Start offset of preview segment `index` out of `count`, evenly spaced.
pub fn preview_start(duration_s: f64, index: u32, count: u32) -> f64 {
    let count = count.max(1);
    duration_s * f64::from(index.min(count - 1) + 1) / f64::from(count + 1)
}

/// Threads allowed by a CPU throttling fraction.
pub fn thread_budget(fraction: f64, cores: usize) -> usize {
    ((cores as f64) * fraction.clamp(0.0, 1.0)).ceil().max(1.0) as usize
}

/// Build the ffmpeg argument list for an encode.
///
/// Extra arguments come from `settings.args` (an array of strings) on the
/// job, placed between the input and the output.
pub fn encode_args(
    request: &EncodeRequest,
    config: &ConfigurationSnapshot,
    duration_s: Option<f64>,
    cores: usize,
) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-nostdin".into(), "-y".into()];

    let mut encode_seconds = None;
    if let (Some(index), Some(seconds), Some(total)) =
        (request.preview_index, request.preview_seconds, duration_s)
    {
        let start = preview_start(total, index, config.preview_count);
        args.push("-ss".into());
        args.push(format!("{start:.3}"));
        encode_seconds = Some(seconds);
    }

    args.push("-i".into());
    args.push(request.job.source.display().to_string());

    if let Some(seconds) = encode_seconds {
        args.push("-t".into());
        args.push(seconds.to_string());
    }

    if config.cpu_throttling < 1.0 {
        args.push("-threads".into());
        args.push(thread_budget(config.cpu_throttling, cores).to_string());
    }

    if let Some(extra) = request.job.settings.get("args").and_then(|a| a.as_array()) {
        args.extend(extra.iter().filter_map(|a| a.as_str().map(str::to_string)));
    }

    args.push("-progress".into());
    args.push("pipe:1".into());
    args.push("-nostats".into());
    args.push(request.job.destination.display().to_string());
    args
}

/// Encoder engine that drives ffmpeg/ffprobe processes.
pub struct FfmpegEngine {
    config: Mutex<ConfigurationSnapshot>,
    events: Mutex<Option<mpsc::UnboundedSender<EngineEvent>>>,
    running: AtomicBool,
    pid: Arc<AtomicU32>,
    stop: Arc<Notify>,
    stopped: Arc<AtomicBool>,
    throttling_bits: AtomicU64,
}

impl Default for FfmpegEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegEngine {
    pub fn new() -> Self {
        Self {
            config: Mutex::new(ConfigurationSnapshot::default()),
            events: Mutex::new(None),
            running: AtomicBool::new(false),
            pid: Arc::new(AtomicU32::new(0)),
            stop: Arc::new(Notify::new()),
            stopped: Arc::new(AtomicBool::new(false)),
            throttling_bits: AtomicU64::new(1.0f64.to_bits()),
        }
    }

    async fn claim(&self) -> Result<mpsc::UnboundedSender<EngineEvent>> {
        let events = self
            .events
            .lock()
            .await
            .clone()
            .ok_or_else(|| RelayError::OperationFailure {
                message: "engine is not set up".into(),
            })?;
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(RelayError::OperationInProgress);
        }
        Ok(events)
    }

    fn signal(&self, _operation: &str, _signal: i32) -> Result<()> {
        let pid = self.pid.load(Ordering::Acquire);
        if pid == 0 {
            return Err(RelayError::OperationFailure {
                message: "no encode is running".into(),
            });
        }
        #[cfg(unix)]
        {
            // SAFETY: kill with a valid pid and signal has no memory effects.
            let rc = unsafe { libc::kill(pid as libc::pid_t, _signal) };
            if rc != 0 {
                return Err(RelayError::OperationFailure {
                    message: format!(
                        "failed to signal ffmpeg: {}",
                        std::io::Error::last_os_error()
                    ),
                });
            }
            Ok(())
        }
        #[cfg(not(unix))]
        {
            Err(RelayError::OperationFailure {
                message: format!("{_operation} is not supported on this platform"),
            })
        }
    }
}

#[cfg(unix)]
const SIGSTOP: i32 = libc::SIGSTOP;
#[cfg(unix)]
const SIGCONT: i32 = libc::SIGCONT;
#[cfg(not(unix))]
const SIGSTOP: i32 = 0;
#[cfg(not(unix))]
const SIGCONT: i32 = 0;

#[async_trait]
impl Engine for FfmpegEngine {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    async fn set_up(
        &self,
        config: &ConfigurationSnapshot,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<()> {
        let version = Command::new("ffmpeg")
            .arg("-version")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(|e| RelayError::OperationFailure {
                message: format!("ffmpeg is not available: {e}"),
            })?;
        let banner = String::from_utf8_lossy(&version.stdout);
        if let Some(first) = banner.lines().next() {
            let _ = events.send(EngineEvent::Log(first.to_string()));
        }

        self.throttling_bits
            .store(config.cpu_throttling.to_bits(), Ordering::Relaxed);
        *self.config.lock().await = config.clone();
        *self.events.lock().await = Some(events);
        info!("ffmpeg engine set up");
        Ok(())
    }

    async fn start_scan(&self, path: &str) -> Result<()> {
        let events = self.claim().await?;
        let path = path.to_string();
        spawn_job(events.clone(), async move {
            let _ = events.send(EngineEvent::Started);
            let _ = events.send(EngineEvent::Log(format!("Scanning {path}")));
            match probe(Path::new(&path)).await {
                Ok(json) => {
                    let _ = events.send(EngineEvent::Progress(ProgressEvent::new(1.0)));
                    let _ = events.send(EngineEvent::ScanCompleted(json));
                    let _ = events.send(EngineEvent::Completed(CompletionResult::success()));
                }
                Err(message) => {
                    let _ = events.send(EngineEvent::Error(message.clone()));
                    let _ = events.send(EngineEvent::Completed(CompletionResult::failed(message)));
                }
            }
        });
        Ok(())
    }

    async fn start_encode(&self, request: &EncodeRequest) -> Result<()> {
        let events = self.claim().await?;
        let mut config = self.config.lock().await.clone();
        config.cpu_throttling = f64::from_bits(self.throttling_bits.load(Ordering::Relaxed));

        let duration = probe_duration(&request.job.source).await;
        let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
        let args = encode_args(request, &config, duration, cores);
        let encoded_duration = match (request.preview_seconds, request.preview_index) {
            (Some(seconds), Some(_)) => Some(f64::from(seconds)),
            _ => duration,
        };
        debug!(?args, "starting ffmpeg");

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                self.running.store(false, Ordering::Release);
                RelayError::OperationFailure {
                    message: format!("failed to start ffmpeg: {e}"),
                }
            })?;
        self.pid.store(child.id().unwrap_or(0), Ordering::Release);

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let pid = self.pid.clone();
        let stop = self.stop.clone();
        let stopped = self.stopped.clone();

        spawn_job(events.clone(), async move {
            let _ = events.send(EngineEvent::Started);

            let progress_task = stdout.map(|stdout| {
                let events = events.clone();
                tokio::spawn(async move {
                    let mut parser = ProgressParser::new();
                    let mut lines = BufReader::new(stdout).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        if parser.parse_line(&line) {
                            let _ = events.send(EngineEvent::Progress(parser.to_event(encoded_duration)));
                        }
                    }
                })
            });

            let log_task = stderr.map(|stderr| {
                let events = events.clone();
                tokio::spawn(async move {
                    let mut tail = Vec::new();
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let _ = events.send(EngineEvent::Log(line.clone()));
                        tail.push(line);
                        if tail.len() > STDERR_TAIL {
                            tail.remove(0);
                        }
                    }
                    tail
                })
            });

            let status = tokio::select! {
                status = child.wait() => status,
                _ = stop.notified() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            pid.store(0, Ordering::Release);

            if let Some(task) = progress_task {
                let _ = task.await;
            }
            let tail = match log_task {
                Some(task) => task.await.unwrap_or_default(),
                None => Vec::new(),
            };

            let result = if stopped.load(Ordering::Acquire) {
                CompletionResult::cancelled()
            } else {
                match status {
                    Ok(status) if status.success() => CompletionResult::success(),
                    Ok(status) => {
                        let detail = format!("ffmpeg exited with {status}: {}", tail.join(" | "));
                        let _ = events.send(EngineEvent::Error(detail.clone()));
                        CompletionResult::failed(detail)
                    }
                    Err(e) => {
                        let detail = format!("failed to wait for ffmpeg: {e}");
                        let _ = events.send(EngineEvent::Error(detail.clone()));
                        CompletionResult::failed(detail)
                    }
                }
            };
            let _ = events.send(EngineEvent::Completed(result));
        });
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        self.signal("pause", SIGSTOP)
    }

    async fn resume(&self) -> Result<()> {
        self.signal("resume", SIGCONT)
    }

    async fn stop(&self) -> Result<()> {
        if self.pid.load(Ordering::Acquire) == 0 {
            return Ok(());
        }
        self.stopped.store(true, Ordering::Release);
        // A stopped process cannot handle the kill until continued.
        let _ = self.signal("resume", SIGCONT);
        self.stop.notify_one();
        Ok(())
    }

    async fn set_cpu_throttling(&self, fraction: f64) -> Result<()> {
        self.throttling_bits
            .store(fraction.to_bits(), Ordering::Relaxed);
        if self.pid.load(Ordering::Acquire) != 0 {
            warn!(fraction, "cpu throttling change applies to the next encode");
        }
        Ok(())
    }
}

/// Run ffprobe and return its JSON output.
async fn probe(path: &Path) -> std::result::Result<String, String> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
            "-show_chapters",
        ])
        .arg(path)
        .output()
        .await
        .map_err(|e| format!("Failed to run ffprobe: {}", e))?;

    if !output.status.success() {
        return Err(format!(
            "ffprobe failed on {}: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }

    let json = String::from_utf8_lossy(&output.stdout).into_owned();
    serde_json::from_str::<serde_json::Value>(&json)
        .map_err(|e| format!("Failed to parse ffprobe JSON: {}", e))?;
    Ok(json)
}

/// Container duration in seconds, if ffprobe can tell.
async fn probe_duration(path: &Path) -> Option<f64> {
    let json = probe(path).await.ok()?;
    let value: serde_json::Value = serde_json::from_str(&json).ok()?;
    value["format"]["duration"]
        .as_str()
        .and_then(|s| s.parse::<f64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vidrelay_core::EncodeJob;

    #[test]
    fn test_progress_block() {
        let mut parser = ProgressParser::new();
        assert!(!parser.parse_line("frame=240"));
        assert!(!parser.parse_line("fps=47.5"));
        assert!(!parser.parse_line("out_time_us=30000000"));
        assert!(!parser.parse_line("speed=2.0x"));
        assert!(parser.parse_line("progress=continue"));

        let event = parser.to_event(Some(120.0));
        assert!((event.fraction_complete - 0.25).abs() < 1e-9);
        assert_eq!(event.current_rate, Some(47.5));
        assert_eq!(event.estimated_seconds_left, Some(45.0));
    }

    #[test]
    fn test_progress_end_is_complete() {
        let mut parser = ProgressParser::new();
        parser.parse_line("out_time_us=1000");
        assert!(parser.parse_line("progress=end"));
        assert!(parser.is_complete);
        assert_eq!(parser.to_event(None).fraction_complete, 1.0);
    }

    #[test]
    fn test_progress_without_duration() {
        let mut parser = ProgressParser::new();
        parser.parse_line("out_time_us=5000000");
        assert_eq!(parser.to_event(None).fraction_complete, 0.0);
        assert_eq!(parser.out_time_s(), 5.0);
    }

    #[test]
    fn test_garbage_lines_ignored() {
        let mut parser = ProgressParser::new();
        assert!(!parser.parse_line("no equals sign"));
        assert!(!parser.parse_line("fps=N/A"));
        assert_eq!(parser.fps, None);
    }

    #[test]
    fn test_preview_start_spacing() {
        assert_eq!(preview_start(110.0, 0, 10), 10.0);
        assert_eq!(preview_start(110.0, 9, 10), 100.0);
        // Out-of-range index clamps to the last preview.
        assert_eq!(preview_start(110.0, 42, 10), 100.0);
    }

    #[test]
    fn test_thread_budget() {
        assert_eq!(thread_budget(0.5, 8), 4);
        assert_eq!(thread_budget(0.1, 4), 1);
        assert_eq!(thread_budget(1.0, 6), 6);
    }

    #[test]
    fn test_encode_args_basic() {
        let job = EncodeJob::new("/in.mkv", "/out.mp4")
            .with_settings(serde_json::json!({ "args": ["-c:v", "libx264", "-crf", "20"] }));
        let args = encode_args(
            &EncodeRequest::new(job),
            &ConfigurationSnapshot::default(),
            Some(60.0),
            8,
        );
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[input + 1], "/in.mkv");
        assert!(args.windows(2).any(|w| w == ["-c:v", "libx264"]));
        assert!(!args.contains(&"-threads".to_string()));
        assert_eq!(args.last().unwrap(), "/out.mp4");
        assert!(args.windows(2).any(|w| w == ["-progress", "pipe:1"]));
    }

    #[test]
    fn test_encode_args_preview_and_throttling() {
        let request =
            EncodeRequest::new(EncodeJob::new("/in.mkv", "/out.mp4")).with_preview(0, 15);
        let config = ConfigurationSnapshot::default().with_cpu_throttling(0.5);
        let args = encode_args(&request, &config, Some(110.0), 8);

        let ss = args.iter().position(|a| a == "-ss").unwrap();
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert!(ss < input);
        assert_eq!(args[ss + 1], "10.000");
        assert!(args.windows(2).any(|w| w == ["-t", "15"]));
        assert!(args.windows(2).any(|w| w == ["-threads", "4"]));
    }

    #[tokio::test]
    async fn test_control_without_encode() {
        let engine = FfmpegEngine::new();
        assert!(engine.pause().await.is_err());
        assert!(engine.stop().await.is_ok());
        assert!(engine.start_scan("/nope").await.is_err());
    }
}
