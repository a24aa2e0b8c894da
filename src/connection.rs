//! Per-connection request handling.
//!
//! Each accepted connection is serviced by exactly one handler task: a
//! single bounded read, at most one fixed response, then the stream is
//! dropped. Taking the stream by value means it closes on every exit
//! path, including the error returns.

use crate::protocol::{Response, MAX_REQUEST_SIZE};
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

/// I/O deadlines applied to a single connection.
///
/// `None` disables the deadline for that operation.
#[derive(Debug, Clone, Copy)]
pub struct IoDeadlines {
    pub read: Option<Duration>,
    pub write: Option<Duration>,
}

impl IoDeadlines {
    /// Build deadlines from configured seconds; 0 disables a deadline.
    pub fn from_secs(read_secs: u64, write_secs: u64) -> Self {
        Self {
            read: (read_secs > 0).then(|| Duration::from_secs(read_secs)),
            write: (write_secs > 0).then(|| Duration::from_secs(write_secs)),
        }
    }
}

/// What happened on a connection that was serviced without error.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Peer closed before sending anything; no response was written.
    EmptyRequest,
    /// A request was read and the fixed response written back.
    Responded { request_bytes: usize },
}

/// Failures local to one connection. Logged by the caller, never
/// propagated to the accept loop.
#[derive(Debug)]
pub enum ConnectionError {
    Receive(std::io::Error),
    ReceiveTimeout(Duration),
    Send(std::io::Error),
    SendTimeout(Duration),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Receive(e) => write!(f, "Receive failed: {}", e),
            ConnectionError::ReceiveTimeout(limit) => {
                write!(f, "No request received within {:?}", limit)
            }
            ConnectionError::Send(e) => write!(f, "Send failed: {}", e),
            ConnectionError::SendTimeout(limit) => {
                write!(f, "Response not flushed within {:?}", limit)
            }
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Receive(e) | ConnectionError::Send(e) => Some(e),
            _ => None,
        }
    }
}

/// Service one connection to completion.
///
/// Reads up to [`MAX_REQUEST_SIZE`] bytes in a single call and answers
/// any non-empty request with the fixed response. The read is never
/// retried or continued; a request that arrives in more than one segment
/// is answered on the strength of its first segment alone.
pub async fn handle_connection<S>(
    mut stream: S,
    deadlines: IoDeadlines,
) -> Result<Outcome, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(MAX_REQUEST_SIZE);

    let n = match deadlines.read {
        Some(limit) => timeout(limit, stream.read_buf(&mut buffer))
            .await
            .map_err(|_| ConnectionError::ReceiveTimeout(limit))?
            .map_err(ConnectionError::Receive)?,
        None => stream
            .read_buf(&mut buffer)
            .await
            .map_err(ConnectionError::Receive)?,
    };

    if n == 0 {
        debug!("Client closed without sending a request");
        return Ok(Outcome::EmptyRequest);
    }

    debug!(
        bytes = n,
        payload = %String::from_utf8_lossy(&buffer[..n]),
        "Client sent request"
    );

    let response = Response::hello();
    let write = async {
        stream.write_all(&response).await?;
        stream.flush().await
    };
    match deadlines.write {
        Some(limit) => timeout(limit, write)
            .await
            .map_err(|_| ConnectionError::SendTimeout(limit))?
            .map_err(ConnectionError::Send)?,
        None => write.await.map_err(ConnectionError::Send)?,
    }

    Ok(Outcome::Responded { request_bytes: n })
}
