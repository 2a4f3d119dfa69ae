//! Client-side connector for a broker socket.
//!
//! Connects, performs the one-time bind handshake (first frame carries the
//! bare client identifier), then exchanges opaque length-prefixed frames
//! with the broker. Blocking and single-threaded by design: a caller that
//! wants to send and receive concurrently runs one client per concern.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::broker::MAX_CLIENT_ID_BYTES;
use crate::framing::{encode_frame, FrameDecoder};

/// Default receive timeout for [`PipeClient::recv`].
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A connected, bound broker client.
#[derive(Debug)]
pub struct PipeClient {
    stream: UnixStream,
    decoder: FrameDecoder,
    /// Decoded-but-unconsumed payloads; a single read can complete more
    /// than one frame.
    pending: VecDeque<Vec<u8>>,
    client_id: String,
}

impl PipeClient {
    /// Connect to the broker at `socket_path` and bind as `client_id`.
    ///
    /// The handshake frame is sent before this returns; the broker sends
    /// no acknowledgement, so a successful return means the identifier
    /// was written, not that it was accepted.
    ///
    /// # Errors
    ///
    /// Returns an error if the identifier is empty or too long, or if the
    /// socket cannot be connected.
    pub fn connect(socket_path: &Path, client_id: &str) -> Result<Self> {
        if client_id.is_empty() || client_id.len() >= MAX_CLIENT_ID_BYTES {
            bail!(
                "Invalid client id ({} bytes): must be 1..{MAX_CLIENT_ID_BYTES} bytes",
                client_id.len()
            );
        }

        let stream = UnixStream::connect(socket_path).with_context(|| {
            format!("Failed to connect to broker at {}", socket_path.display())
        })?;
        stream
            .set_read_timeout(Some(RECV_TIMEOUT))
            .context("set read timeout")?;

        let mut client = Self {
            stream,
            decoder: FrameDecoder::new(),
            pending: VecDeque::new(),
            client_id: client_id.to_string(),
        };
        client
            .send(client_id.as_bytes())
            .context("send bind handshake")?;
        Ok(client)
    }

    /// The identifier this client bound with.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Override the receive timeout (default 5s).
    pub fn set_timeout(&self, timeout: Duration) -> Result<()> {
        self.stream
            .set_read_timeout(Some(timeout))
            .context("set read timeout")
    }

    /// Frame `payload` and write it to the broker.
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.stream
            .write_all(&encode_frame(payload))
            .context("write frame to broker")?;
        Ok(())
    }

    /// Serialize `value` as JSON and send it.
    pub fn send_json(&mut self, value: &serde_json::Value) -> Result<()> {
        let payload = serde_json::to_vec(value).context("serialize JSON payload")?;
        self.send(&payload)
    }

    /// Receive the next frame payload, blocking up to the receive timeout.
    ///
    /// Frames arrive in broker-send order. A zero-length payload is a
    /// valid (empty) frame, not an error.
    ///
    /// # Errors
    ///
    /// Fails on timeout, on a closed connection, or on a framing
    /// violation from the broker side.
    pub fn recv(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(payload) = self.pending.pop_front() {
                return Ok(payload);
            }

            let mut buf = [0u8; 8192];
            let n = match self.stream.read(&mut buf) {
                Ok(0) => bail!("Broker closed the connection"),
                Ok(n) => n,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    bail!("Timed out waiting for a frame from the broker")
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("read from broker"),
            };

            let frames = self.decoder.feed(&buf[..n])?;
            self.pending.extend(frames);
        }
    }
}
