//! Fixed HTTP response sent for every non-empty request.
//!
//! The server speaks just enough HTTP/1.1 for plain clients: one status
//! line, three headers, a fixed body, then the connection closes. There
//! is no request parsing and no routing; the reply never depends on the
//! payload.

use bytes::{BufMut, Bytes, BytesMut};

/// Response body sent on every non-empty request
pub const BODY: &[u8] = b"Hello from C Server!";

/// Maximum number of request bytes read from a connection.
///
/// A larger request is truncated at this boundary and the remainder is
/// left unread on the socket.
pub const MAX_REQUEST_SIZE: usize = 1024;

/// Response generator for the fixed reply
pub struct Response;

impl Response {
    /// Build the complete wire response.
    ///
    /// `Content-Length` is derived from the actual body so the header
    /// cannot drift from the payload.
    pub fn hello() -> Bytes {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_slice(b"HTTP/1.1 200 OK\r\n");
        buf.put_slice(b"Content-Type: text/plain\r\n");
        buf.put_slice(format!("Content-Length: {}\r\n", BODY.len()).as_bytes());
        buf.put_slice(b"Connection: close\r\n");
        buf.put_slice(b"\r\n");
        buf.put_slice(BODY);
        buf.freeze()
    }
}
