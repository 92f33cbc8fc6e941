//! Control socket for IPC with a running bridge
//!
//! Carries control-plane messages between processes over a Unix domain
//! socket. Every message, in both directions, is one frame:
//!
//! ```text
//! +----------------+-------------------+
//! | length (u32 BE)| payload (length)  |
//! +----------------+-------------------+
//! ```
//!
//! A zero-length reply means the bridge had no response (the request was not
//! UTF-8). A connection may carry any number of request/response pairs.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

use crate::bridge::Backoff;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::protocol::{ApiRequest, ControlMessage};
use crate::proxy::ProxyMode;
use crate::stats::StatsSnapshot;

/// Default socket path for the control socket
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/tunbridge.sock";

/// Largest accepted frame
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Control socket server
pub struct ControlServer {
    socket_path: PathBuf,
    dispatcher: Arc<Dispatcher>,
}

impl ControlServer {
    /// Create a new control server
    pub fn new(socket_path: impl AsRef<Path>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            dispatcher,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket
    pub fn bind(&self) -> Result<UnixListener> {
        // Remove existing socket file
        let _ = std::fs::remove_file(&self.socket_path);

        if let Some(parent) = self.socket_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let listener = UnixListener::bind(&self.socket_path)
            .map_err(|e| Error::Control(format!("failed to bind control socket: {}", e)))?;

        // Owner read/write only
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            let _ = std::fs::set_permissions(&self.socket_path, perms);
        }

        log::info!("Control socket listening on {:?}", self.socket_path);
        Ok(listener)
    }

    /// Bind and serve until the task is dropped
    pub async fn start(&self) -> Result<()> {
        let listener = self.bind()?;
        self.serve(listener).await
    }

    /// Serve connections on an already bound listener
    ///
    /// Accept errors (descriptor exhaustion, mostly) are retried after a
    /// growing pause that resets on the next accepted connection.
    pub async fn serve(&self, listener: UnixListener) -> Result<()> {
        let mut backoff = Backoff::default();
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    backoff.reset();
                    let dispatcher = self.dispatcher.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, dispatcher).await {
                            log::debug!("Control connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    log::warn!("Control socket accept error (retry in {:?}): {}", delay, e);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn handle_connection(mut stream: UnixStream, dispatcher: Arc<Dispatcher>) -> Result<()> {
        while let Some(request) = read_frame(&mut stream).await? {
            let (tx, rx) = tokio::sync::oneshot::channel();
            dispatcher
                .handle_app_message(request, move |response| {
                    let _ = tx.send(response);
                })
                .await;
            let response = rx.await.ok().flatten().unwrap_or_default();
            write_frame(&mut stream, &response).await?;
        }
        Ok(())
    }

    /// Remove the socket file
    pub fn cleanup(&self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Read one frame; `None` on a clean end of stream
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::Control(format!("frame too large: {} bytes", len)));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Write one frame
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::Control(format!("frame too large: {} bytes", payload.len())))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Control socket client for talking to a running bridge
pub struct ControlClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl ControlClient {
    /// Create a new control client
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            timeout: Duration::from_secs(15),
        }
    }

    /// Set the response timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send a raw message; `None` means the bridge had no response
    pub async fn send_raw(&self, message: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            Error::Control(format!(
                "failed to connect to control socket at {:?}: {}. Is the bridge running?",
                self.socket_path, e
            ))
        })?;

        write_frame(&mut stream, message).await?;

        let response = tokio::time::timeout(self.timeout, read_frame(&mut stream))
            .await
            .map_err(|_| Error::Control("timeout waiting for response".into()))??
            .ok_or_else(|| Error::Control("connection closed before response".into()))?;

        Ok(if response.is_empty() { None } else { Some(response) })
    }

    /// Send a message and decode the reply as text
    pub async fn send(&self, message: &ControlMessage) -> Result<String> {
        let response = self
            .send_raw(message.encode().as_bytes())
            .await?
            .ok_or_else(|| Error::Control("empty response".into()))?;
        String::from_utf8(response).map_err(|e| Error::Control(format!("invalid response: {}", e)))
    }

    /// Check the bridge is alive
    pub async fn ping(&self) -> Result<()> {
        match self.send(&ControlMessage::Ping).await?.as_str() {
            crate::dispatch::PONG => Ok(()),
            other => Err(Error::Control(format!("unexpected ping reply: {}", other))),
        }
    }

    /// Current proxy mode
    pub async fn get_mode(&self) -> Result<ProxyMode> {
        self.send(&ControlMessage::GetMode).await?.parse()
    }

    /// Switch the proxy mode
    pub async fn set_mode(&self, mode: ProxyMode) -> Result<()> {
        let reply = self.send(&ControlMessage::SetMode(mode.to_string())).await?;
        if reply == crate::dispatch::ACK {
            Ok(())
        } else {
            Err(Error::Control(error_message(&reply)))
        }
    }

    /// Restart the session from its last configuration
    pub async fn restart(&self) -> Result<()> {
        let reply = self.send(&ControlMessage::Restart).await?;
        if reply == crate::dispatch::ACK {
            Ok(())
        } else {
            Err(Error::Control(error_message(&reply)))
        }
    }

    /// Session statistics
    pub async fn stats(&self) -> Result<StatsSnapshot> {
        let reply = self.send(&ControlMessage::Stats).await?;
        Ok(serde_json::from_str(&reply)?)
    }

    /// Forward a request to the proxy core's controller, returning the payload
    pub async fn api_request(&self, method: &str, path: &str, body: &str) -> Result<String> {
        self.send(&ControlMessage::Api(ApiRequest::new(method, path, body)))
            .await
    }
}

/// Pull the message out of an `{"error": ...}` payload
fn error_message(reply: &str) -> String {
    serde_json::from_str::<serde_json::Value>(reply)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| reply.to_string())
}
