//! Byte relay between an established relay session and the local destination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, sleep_until};
use tracing::trace;

use crate::error::TunnelError;
use crate::transcode::TranscodingDuplex;
use crate::tunnel::Tunnel;

const READ_BUF_SIZE: usize = 16 * 1024;

/// Why the relay loop ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Closed {
    Relay,
    Destination,
}

/// Last time the destination socket saw traffic, in millis since `start`.
struct IdleWatch {
    start: Instant,
    last: AtomicU64,
}

impl IdleWatch {
    fn new() -> Self {
        Self { start: Instant::now(), last: AtomicU64::new(0) }
    }

    fn touch(&self) {
        let elapsed = u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last.store(elapsed, Ordering::Relaxed);
    }

    /// Resolves once nothing touched the watch for `idle`.
    async fn expired(&self, idle: Duration) {
        loop {
            let deadline = self.start + Duration::from_millis(self.last.load(Ordering::Relaxed)) + idle;
            if Instant::now() >= deadline {
                return;
            }
            sleep_until(deadline).await;
        }
    }
}

/// Relays until either side closes, the destination idles for `idle`, or an io
/// error occurs.
///
/// `first` holds relay bytes that were already read and go to the destination first.
pub(crate) async fn relay<R, D>(tunnel: &Tunnel, relay: R, destination: D, first: BytesMut, idle: Duration) -> Result<Closed, TunnelError>
where
    R: AsyncRead + AsyncWrite,
    D: AsyncRead + AsyncWrite,
{
    let (mut inspector, mut transcoder) = TranscodingDuplex::new().split();
    let (mut relay_rd, mut relay_wr) = tokio::io::split(relay);
    let (mut dest_rd, mut dest_wr) = tokio::io::split(destination);
    let watch = IdleWatch::new();

    let inbound = async {
        let mut buf = first;
        loop {
            if !buf.is_empty() {
                inspector.inspect(&buf);
                dest_wr.write_all(&buf).await?;
                tunnel.record_traffic(buf.len());
                watch.touch();
            }

            buf.clear();
            buf.reserve(READ_BUF_SIZE);
            if relay_rd.read_buf(&mut buf).await? == 0 {
                trace!(tunnel = tunnel.id(), "relay closed");
                return Ok::<_, TunnelError>(Closed::Relay);
            }
            tunnel.record_traffic(buf.len());
            tunnel.report_activity();
        }
    };

    let outbound = async {
        let mut buf = BytesMut::with_capacity(READ_BUF_SIZE);
        let mut out = BytesMut::with_capacity(READ_BUF_SIZE);
        loop {
            buf.clear();
            buf.reserve(READ_BUF_SIZE);
            let n = dest_rd.read_buf(&mut buf).await?;
            if n == 0 {
                trace!(tunnel = tunnel.id(), "destination closed");
                transcoder.finish(&mut out)?;
            } else {
                tunnel.record_traffic(n);
                tunnel.report_activity();
                watch.touch();
                transcoder.transform(&buf, &mut out)?;
            }

            if !out.is_empty() {
                relay_wr.write_all(&out).await?;
                relay_wr.flush().await?;
                tunnel.record_traffic(out.len());
                out.clear();
            }
            if n == 0 {
                return Ok::<_, TunnelError>(Closed::Destination);
            }
        }
    };

    tokio::select! {
        closed = inbound => closed,
        closed = outbound => closed,
        () = watch.expired(idle) => Err(TunnelError::DestinationTimeout { idle }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::TunnelEvent;
    use tokio::io::duplex;
    use tokio::sync::mpsc;

    fn tunnel() -> (Tunnel, mpsc::UnboundedReceiver<(u64, TunnelEvent)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Tunnel::detached(1, tx), rx)
    }

    #[tokio::test]
    async fn relays_both_ways_and_counts_traffic() {
        let (tunnel, mut events) = tunnel();
        let (relay_side, mut relay_peer) = duplex(4096);
        let (dest_side, mut dest_peer) = duplex(4096);

        let task = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move {
                relay(&tunnel, relay_side, dest_side, BytesMut::from(&b"GET / HTTP/1.1\r\n\r\n"[..]), Duration::from_secs(5)).await
            })
        };

        let mut buf = vec![0u8; 64];
        let n = dest_peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"GET / HTTP/1.1\r\n\r\n");

        dest_peer.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
        let n = relay_peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"HTTP/1.1 204 No Content\r\n\r\n");

        drop(dest_peer);
        assert_eq!(task.await.unwrap().unwrap(), Closed::Destination);

        // first payload written, response read and written
        assert_eq!(tunnel.traffic(), 18 + 27 + 27);
        assert!(matches!(events.recv().await, Some((1, TunnelEvent::Activity))));
    }

    #[tokio::test]
    async fn relay_eof_ends_cleanly() {
        let (tunnel, _events) = tunnel();
        let (relay_side, relay_peer) = duplex(4096);
        let (dest_side, _dest_peer) = duplex(4096);
        drop(relay_peer);

        let closed = relay(&tunnel, relay_side, dest_side, BytesMut::new(), Duration::from_secs(5)).await.unwrap();
        assert_eq!(closed, Closed::Relay);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_destination_times_out() {
        let (tunnel, _events) = tunnel();
        let (relay_side, _relay_peer) = duplex(4096);
        let (dest_side, _dest_peer) = duplex(4096);

        let result = relay(&tunnel, relay_side, dest_side, BytesMut::new(), Duration::from_millis(300)).await;
        assert!(matches!(result, Err(TunnelError::DestinationTimeout { .. })));
    }
}
