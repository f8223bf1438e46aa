//! Buffered TCP links to workers.
//!
//! A [`Link`] wraps a connected stream with a small receive buffer that
//! tolerates partial messages: the event loop drains whatever bytes are
//! available without blocking and extracts complete lines, while payload
//! reads (file bytes following a header) consume the buffer first and then
//! read the socket under an explicit deadline. All byte counters live here so
//! transfer statistics stay consistent no matter which path moved the data.

use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Transfer chunk size for file streaming.
const CHUNK: usize = 64 * 1024;

/// One connected worker (or status client) socket.
#[derive(Debug)]
pub struct Link {
    stream: TcpStream,
    peer: String,
    rx: Vec<u8>,
    /// Bytes written to this link since connect.
    pub bytes_sent: u64,
    /// Bytes read from this link since connect.
    pub bytes_received: u64,
}

impl Link {
    /// Wrap an accepted stream.
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown:0".to_string());
        let _ = stream.set_nodelay(true);
        Link {
            stream,
            peer,
            rx: Vec::new(),
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    /// Remote address:port string.
    pub fn peer_addr(&self) -> String {
        self.peer.clone()
    }

    /// Wait until the socket is readable (used by the event loop select).
    pub async fn readable(&self) -> io::Result<()> {
        self.stream.readable().await
    }

    /// True if buffered bytes are already waiting to be parsed.
    pub fn has_buffered(&self) -> bool {
        !self.rx.is_empty()
    }

    /// Number of buffered bytes not yet consumed.
    pub fn buffered_len(&self) -> usize {
        self.rx.len()
    }

    /// Drain all currently available socket bytes into the receive buffer
    /// without blocking. Returns the number of bytes added; an orderly or
    /// errored close surfaces as `Err`.
    pub fn try_fill(&mut self) -> io::Result<usize> {
        let mut added = 0;
        let mut chunk = [0u8; CHUNK];
        loop {
            match self.stream.try_read(&mut chunk) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed connection",
                    ));
                }
                Ok(n) => {
                    self.rx.extend_from_slice(&chunk[..n]);
                    self.bytes_received += n as u64;
                    added += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(added)
    }

    /// Extract one complete line from the receive buffer, if any.
    ///
    /// The trailing newline (and optional carriage return) is stripped.
    pub fn pop_line(&mut self) -> Option<String> {
        let pos = self.rx.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.rx.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Receive one line, blocking up to `timeout`.
    pub async fn recv_line(&mut self, timeout: Duration) -> io::Result<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(line) = self.pop_line() {
                return Ok(line);
            }
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "recv_line timed out"))?;
            tokio::time::timeout(remaining, self.stream.readable())
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "recv_line timed out"))??;
            self.try_fill()?;
        }
    }

    /// Receive exactly `len` payload bytes, consuming buffered data first.
    pub async fn recv_exact(&mut self, len: usize, timeout: Duration) -> io::Result<Vec<u8>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut out = Vec::with_capacity(len);

        let take = len.min(self.rx.len());
        out.extend(self.rx.drain(..take));

        while out.len() < len {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "recv_exact timed out"))?;
            let mut chunk = vec![0u8; (len - out.len()).min(CHUNK)];
            let n = tokio::time::timeout(remaining, self.stream.read(&mut chunk))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "recv_exact timed out"))??;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed during payload",
                ));
            }
            self.bytes_received += n as u64;
            out.extend_from_slice(&chunk[..n]);
        }
        Ok(out)
    }

    /// Send one line; the newline terminator is appended here.
    pub async fn send_line(&mut self, line: &str, timeout: Duration) -> io::Result<()> {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.send_bytes(&data, timeout).await
    }

    /// Send a raw payload under a deadline.
    pub async fn send_bytes(&mut self, data: &[u8], timeout: Duration) -> io::Result<()> {
        tokio::time::timeout(timeout, self.stream.write_all(data))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "send timed out"))??;
        self.bytes_sent += data.len() as u64;
        Ok(())
    }

    /// Stream `length` bytes from an open file onto the link.
    ///
    /// Returns the number of bytes actually sent; a short count means the
    /// local file ran dry early and the connection can no longer be framed.
    pub async fn stream_from_file(
        &mut self,
        file: &mut tokio::fs::File,
        length: u64,
        timeout: Duration,
    ) -> io::Result<u64> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut sent: u64 = 0;
        let mut chunk = vec![0u8; CHUNK];
        while sent < length {
            let want = ((length - sent) as usize).min(CHUNK);
            let n = file.read(&mut chunk[..want]).await?;
            if n == 0 {
                break;
            }
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "transfer timed out"))?;
            tokio::time::timeout(remaining, self.stream.write_all(&chunk[..n]))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "transfer timed out"))??;
            self.bytes_sent += n as u64;
            sent += n as u64;
        }
        Ok(sent)
    }

    /// Stream `length` bytes from the link into an open file.
    ///
    /// Buffered bytes are consumed first so a payload that arrived together
    /// with its header line is not lost.
    pub async fn stream_to_file(
        &mut self,
        file: &mut tokio::fs::File,
        length: u64,
        timeout: Duration,
    ) -> io::Result<u64> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut received: u64 = 0;

        while received < length && !self.rx.is_empty() {
            let take = ((length - received) as usize).min(self.rx.len());
            let buffered: Vec<u8> = self.rx.drain(..take).collect();
            file.write_all(&buffered).await?;
            received += take as u64;
        }

        let mut chunk = vec![0u8; CHUNK];
        while received < length {
            let want = ((length - received) as usize).min(CHUNK);
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "transfer timed out"))?;
            let n = tokio::time::timeout(remaining, self.stream.read(&mut chunk[..want]))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "transfer timed out"))??;
            if n == 0 {
                break;
            }
            self.bytes_received += n as u64;
            file.write_all(&chunk[..n]).await?;
            received += n as u64;
        }
        file.flush().await?;
        Ok(received)
    }

    /// Read and discard `length` bytes, keeping the stream framed after a
    /// local failure.
    pub async fn soak(&mut self, length: u64, timeout: Duration) -> io::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut remaining_len = length;

        let take = (remaining_len as usize).min(self.rx.len());
        self.rx.drain(..take);
        remaining_len -= take as u64;

        let mut chunk = vec![0u8; CHUNK];
        while remaining_len > 0 {
            let want = (remaining_len as usize).min(CHUNK);
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "soak timed out"))?;
            let n = tokio::time::timeout(remaining, self.stream.read(&mut chunk[..want]))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "soak timed out"))??;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed during soak",
                ));
            }
            self.bytes_received += n as u64;
            remaining_len -= n as u64;
        }
        Ok(())
    }
}
