//! The `CONNECT` exchange that opens a session on the relay.

use std::io::Write;

use bytes::{BufMut, BytesMut};
use rv_http::codec::HeadDecoder;
use rv_http::protocol::ResponseHead;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::config::Endpoint;
use crate::error::TunnelError;

/// Field of the handshake response naming the local destination.
pub(crate) const RV_HOST: &str = "X-RV-Host";

/// Builds `CONNECT <path> HTTP/1.1` with the `Host` field and any extra fields.
pub(crate) fn connect_request(relay: &Endpoint, headers: &[(String, String)]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(256);
    let mut writer = (&mut buf).writer();
    // writing into a BytesMut never fails
    let _ = write!(writer, "CONNECT {} HTTP/1.1\r\nHost: {}\r\n", relay.path(), relay.host_header());
    for (name, value) in headers {
        let _ = write!(writer, "{name}: {value}\r\n");
    }
    buf.put_slice(b"\r\n");
    buf
}

/// Sends the handshake and reads the relay's response head.
///
/// Returns the head and whatever bytes followed it in the same reads; those
/// belong to the tunneled stream and are not parsed again.
pub(crate) async fn handshake<S>(stream: &mut S, relay: &Endpoint, headers: &[(String, String)]) -> Result<(ResponseHead, BytesMut), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&connect_request(relay, headers)).await?;
    stream.flush().await?;

    let mut decoder = HeadDecoder::<ResponseHead>::new();
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some(head) = decoder.decode(&mut buf)? {
            trace!(status = head.status().as_u16(), leftover = buf.len(), "handshake response");
            return Ok((head, buf));
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(TunnelError::HandshakeClosed);
        }
    }
}

/// Checks whether the first payload from the relay is an HTTP response, which
/// is how the relay ends a session it already accepted.
///
/// Returns `None` for normal payload, otherwise the status code if it can be read.
pub(crate) fn disconnect_status(payload: &[u8]) -> Option<Option<u16>> {
    if !payload.starts_with(b"HTTP/") {
        return None;
    }

    let mut probe = BytesMut::from(payload);
    if let Ok(Some(head)) = HeadDecoder::<ResponseHead>::new().decode(&mut probe) {
        return Some(Some(head.status().as_u16()));
    }

    // incomplete head: try the status line alone
    let status = payload
        .split(|b| *b == b' ')
        .nth(1)
        .and_then(|code| std::str::from_utf8(code).ok())
        .and_then(|code| code.trim().parse::<u16>().ok());
    Some(status)
}
