//! Local duplex transport: Unix domain sockets, or named pipes on Windows.
//!
//! Both sides address the endpoint by pipe name only. The worker binds a
//! [`PipeListener`] before it prints its ready line, the host calls
//! [`connect`] after it has seen that line.

#[cfg(not(windows))]
use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncWrite};

use vidrelay_core::{RelayError, Result};

/// Any bidirectional byte stream the channel can run over.
pub trait AsyncIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> AsyncIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Boxed connection handed to the channel.
pub type IoBox = Box<dyn AsyncIo>;

/// OS-level location of a pipe endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipeEndpoint {
    #[cfg(windows)]
    NamedPipe { name: String, path: String },
    #[cfg(not(windows))]
    UnixSocket { name: String, path: PathBuf },
}

impl PipeEndpoint {
    /// Endpoint for a pipe name.
    pub fn new(pipe_name: &str) -> Self {
        #[cfg(windows)]
        {
            Self::NamedPipe {
                name: pipe_name.to_string(),
                path: format!(r"\\.\pipe\{}", pipe_name),
            }
        }
        #[cfg(not(windows))]
        {
            Self::UnixSocket {
                name: pipe_name.to_string(),
                path: std::env::temp_dir().join(format!("{pipe_name}.sock")),
            }
        }
    }

    pub fn pipe_name(&self) -> &str {
        match self {
            #[cfg(windows)]
            Self::NamedPipe { name, .. } => name,
            #[cfg(not(windows))]
            Self::UnixSocket { name, .. } => name,
        }
    }

    /// Display address, `<transport>://localhost/<pipe_name>`.
    pub fn address(&self) -> String {
        match self {
            #[cfg(windows)]
            Self::NamedPipe { name, .. } => format!("pipe://localhost/{name}"),
            #[cfg(not(windows))]
            Self::UnixSocket { name, .. } => format!("unix://localhost/{name}"),
        }
    }
}

/// Worker-side listening endpoint. Accepts exactly one connection.
pub struct PipeListener {
    endpoint: PipeEndpoint,
    #[cfg(not(windows))]
    listener: tokio::net::UnixListener,
    #[cfg(windows)]
    server: Option<tokio::net::windows::named_pipe::NamedPipeServer>,
}

impl PipeListener {
    /// Bind the endpoint. Once this returns, host connection attempts succeed.
    pub fn bind(endpoint: PipeEndpoint) -> Result<Self> {
        #[cfg(not(windows))]
        {
            let PipeEndpoint::UnixSocket { path, .. } = &endpoint;
            if path.exists() {
                let _ = std::fs::remove_file(path);
            }
            let listener = tokio::net::UnixListener::bind(path)
                .map_err(|e| RelayError::io("binding pipe endpoint", path, e))?;
            Ok(Self { endpoint, listener })
        }

        #[cfg(windows)]
        {
            use tokio::net::windows::named_pipe::ServerOptions;
            let PipeEndpoint::NamedPipe { path, .. } = &endpoint;
            let server = ServerOptions::new()
                .first_pipe_instance(true)
                .create(path)
                .map_err(|e| RelayError::io("creating named pipe", path.as_str(), e))?;
            Ok(Self {
                endpoint,
                server: Some(server),
            })
        }
    }

    pub fn endpoint(&self) -> &PipeEndpoint {
        &self.endpoint
    }

    /// Wait for the host to connect.
    pub async fn accept(&mut self) -> Result<IoBox> {
        #[cfg(not(windows))]
        {
            let (stream, _) = self.listener.accept().await.map_err(|e| {
                RelayError::transport("accept", format!("{}: {e}", self.endpoint.address()))
            })?;
            Ok(Box::new(stream))
        }

        #[cfg(windows)]
        {
            let server = self
                .server
                .take()
                .ok_or_else(|| RelayError::internal("named pipe already accepted a connection"))?;
            server.connect().await.map_err(|e| {
                RelayError::transport("accept", format!("{}: {e}", self.endpoint.address()))
            })?;
            Ok(Box::new(server))
        }
    }
}

impl Drop for PipeListener {
    fn drop(&mut self) {
        remove_endpoint(&self.endpoint);
    }
}

/// Remove what a worker left behind at `endpoint`.
///
/// A worker that aborts or is killed never drops its listener, so the host
/// calls this once the process is gone. Named pipes vanish with their last
/// handle and need nothing.
pub fn remove_endpoint(endpoint: &PipeEndpoint) {
    #[cfg(not(windows))]
    {
        let PipeEndpoint::UnixSocket { path, .. } = endpoint;
        match std::fs::remove_file(path) {
            Ok(()) => tracing::debug!(path = %path.display(), "removed socket file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove socket file"),
        }
    }
    #[cfg(windows)]
    let _ = endpoint;
}

/// Open a single connection attempt to a worker endpoint.
pub async fn connect(endpoint: &PipeEndpoint) -> std::io::Result<IoBox> {
    #[cfg(windows)]
    {
        use tokio::net::windows::named_pipe::ClientOptions;
        let PipeEndpoint::NamedPipe { path, .. } = endpoint;
        let client = ClientOptions::new().open(path)?;
        Ok(Box::new(client))
    }

    #[cfg(not(windows))]
    {
        let PipeEndpoint::UnixSocket { path, .. } = endpoint;
        let stream = tokio::net::UnixStream::connect(path).await?;
        Ok(Box::new(stream))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn unique_name() -> String {
        format!("vidrelay-test.{}", uuid::Uuid::new_v4())
    }

    #[test]
    fn test_address_form() {
        let endpoint = PipeEndpoint::new("vidrelay.abc");
        assert_eq!(endpoint.address(), "unix://localhost/vidrelay.abc");
        assert_eq!(endpoint.pipe_name(), "vidrelay.abc");
    }

    #[tokio::test]
    async fn test_connect_before_bind_fails() {
        let endpoint = PipeEndpoint::new(&unique_name());
        assert!(connect(&endpoint).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_accept_connect() {
        let endpoint = PipeEndpoint::new(&unique_name());
        let mut listener = PipeListener::bind(endpoint.clone()).unwrap();

        let server = tokio::spawn(async move {
            let mut io = listener.accept().await.unwrap();
            io.write_all(b"hello\n").await.unwrap();
            io.flush().await.unwrap();
            listener
        });

        let mut client = connect(&endpoint).await.unwrap();
        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello\n");

        let listener = server.await.unwrap();
        drop(listener);
        let PipeEndpoint::UnixSocket { path, .. } = &endpoint;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_remove_endpoint_after_listener_leaked() {
        let endpoint = PipeEndpoint::new(&unique_name());
        let listener = PipeListener::bind(endpoint.clone()).unwrap();
        // A killed worker never runs its destructors.
        std::mem::forget(listener);
        let PipeEndpoint::UnixSocket { path, .. } = &endpoint;
        assert!(path.exists());

        remove_endpoint(&endpoint);
        assert!(!path.exists());
        // Already gone is fine.
        remove_endpoint(&endpoint);
    }
}
