//! Fixed response texts written by the proxy

use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Reply to a successful CONNECT
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Build the structured error response for `message`
///
/// `Content-Length` is the UTF-8 byte length of the message.
#[must_use]
pub fn error_response(message: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 500 Internal Server Error\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         \r\n\
         {message}",
        message.len()
    )
    .into_bytes()
}

/// Write the structured error response and flush
///
/// # Errors
///
/// Returns the write error if the client is already gone.
pub async fn write_error_response<W>(writer: &mut W, message: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&error_response(message)).await?;
    writer.flush().await
}

/// Serialize a response head as `HTTP/1.1 <status>` plus one line per header value
pub fn response_head<'a, I>(status: u16, headers: I) -> Vec<u8>
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut head = format!("HTTP/1.1 {status}\r\n").into_bytes();
    for (name, value) in headers {
        head.extend_from_slice(name.as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value);
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}
