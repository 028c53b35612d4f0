use std::future::Future;
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use flate2::read::GzDecoder;
use rv_client::{ClusterConfig, ClusterEvent, ClusterState, ErrorCode, TunnelCluster, TunnelError};
use rv_http::codec::ChunkedDecoder;
use rv_http::protocol::PayloadItem;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);

/// Reads until the end of an HTTP head, or EOF.
async fn read_head(socket: &mut TcpStream) -> Vec<u8> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
    head
}

/// Accepts connections forever, handing the n-th one to `handler(n, socket)`.
async fn fake_server<F, Fut>(handler: F) -> (u16, Arc<AtomicUsize>)
where
    F: Fn(usize, TcpStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepted = Arc::new(AtomicUsize::new(0));

    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(handler(n, socket));
        }
    });
    (port, accepted)
}

/// A destination answering every request with `response`, then closing.
async fn fake_destination(response: &'static [u8]) -> u16 {
    let (port, _) = fake_server(move |_, mut socket| async move {
        read_head(&mut socket).await;
        let _ = socket.write_all(response).await;
    })
    .await;
    port
}

fn accepted_handshake(destination: u16) -> String {
    format!("HTTP/1.1 200 OK\r\nX-RV-Host: http://127.0.0.1:{destination}\r\n\r\n")
}

/// Accepts the handshake and holds the session open until the tunnel leaves.
async fn hold(mut socket: TcpStream, destination: u16) {
    read_head(&mut socket).await;
    let _ = socket.write_all(accepted_handshake(destination).as_bytes()).await;
    let mut sink = Vec::new();
    let _ = socket.read_to_end(&mut sink).await;
}

fn config(relay: u16) -> rv_client::ClusterConfigBuilder {
    ClusterConfig::builder().url(format!("http://127.0.0.1:{relay}/session-1"))
}

async fn wait_for<F>(events: &mut broadcast::Receiver<ClusterEvent>, mut matches: F) -> ClusterEvent
where
    F: FnMut(&ClusterEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("cluster events closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for cluster event")
}

async fn eventually<F: Fn() -> bool>(condition: F) {
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

fn destroyed_error(event: ClusterEvent) -> Option<Arc<TunnelError>> {
    match event {
        ClusterEvent::Destroyed { error } => error,
        event => panic!("unexpected event {event:?}"),
    }
}

#[tokio::test]
async fn forbidden_relay_destroys_cluster() {
    let (relay, _) = fake_server(|_, mut socket| async move {
        read_head(&mut socket).await;
        let _ = socket.write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n").await;
    })
    .await;

    let (cluster, mut events) = TunnelCluster::start(config(relay).retry_count(5).build().unwrap()).unwrap();

    let closed = wait_for(&mut events, |e| matches!(e, ClusterEvent::TunnelClosed { .. })).await;
    assert!(matches!(closed, ClusterEvent::TunnelClosed { error: Some(ref e), .. } if e.code() == ErrorCode::Forbidden));

    let error = destroyed_error(wait_for(&mut events, |e| matches!(e, ClusterEvent::Destroyed { .. })).await).unwrap();
    assert_eq!(error.code().as_str(), "EFORBIDDEN");
    assert_eq!(error.status(), Some(403));

    timeout(WAIT, cluster.closed()).await.unwrap();
    assert_eq!(cluster.state(), ClusterState::Destroyed);
    assert!(cluster.tunnels().is_empty());
    assert_eq!(cluster.reconnect_attempts(), 0);
    assert_eq!(cluster.errors().len(), 1);
}

#[tokio::test]
async fn unreachable_relay_gives_up_after_retries() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let config = config(port).retry_count(3).retry_delay(Duration::from_millis(50)).build().unwrap();
    let (_cluster, mut events) = TunnelCluster::start(config).unwrap();

    let mut reconnects = Vec::new();
    let error = loop {
        match wait_for(&mut events, |e| matches!(e, ClusterEvent::Reconnect(_) | ClusterEvent::Destroyed { .. })).await {
            ClusterEvent::Reconnect(attempt) => reconnects.push(attempt),
            event => break destroyed_error(event).unwrap(),
        }
    };

    assert_eq!(reconnects, vec![1, 2, 3]);
    assert_eq!(error.code(), ErrorCode::ServerUnreachable);
    assert!(matches!(*error, TunnelError::ServerUnreachable { attempts: 3 }));
}

#[tokio::test]
async fn no_retries_fails_on_first_error() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let config = config(port).retry_count(0).retry_delay(Duration::from_millis(20)).build().unwrap();
    let (_cluster, mut events) = TunnelCluster::start(config).unwrap();

    let event = wait_for(&mut events, |e| matches!(e, ClusterEvent::Reconnect(_) | ClusterEvent::Destroyed { .. })).await;
    assert_eq!(destroyed_error(event).unwrap().code(), ErrorCode::ServerUnreachable);
}

#[tokio::test]
async fn activity_grows_pool_and_idle_shrinks_it() {
    const IDLE_TIMEOUT: Duration = Duration::from_millis(300);
    // events reach subscribers slightly after the cluster handled them
    const SLACK: Duration = Duration::from_millis(20);

    let destination = fake_destination(b"HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nContent-Length: 4\r\n\r\nPNG!").await;
    let (relay, _) = fake_server(move |n, mut socket| async move {
        if n > 0 {
            return hold(socket, destination).await;
        }
        read_head(&mut socket).await;
        let _ = socket.write_all(accepted_handshake(destination).as_bytes()).await;
        // the request arrives well after the idle timer first started
        sleep(Duration::from_millis(150)).await;
        let _ = socket.write_all(b"GET /logo.png HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
        let mut sink = Vec::new();
        let _ = socket.read_to_end(&mut sink).await;
    })
    .await;

    let config = config(relay).max_connections(3).idle_timeout(IDLE_TIMEOUT).build().unwrap();
    let (cluster, mut events) = TunnelCluster::start(config).unwrap();

    let mut last_activity = Instant::now();
    let mut largest_pool = 0;
    let mut went_active = false;
    wait_for(&mut events, |e| {
        largest_pool = largest_pool.max(cluster.tunnels().len());
        match e {
            ClusterEvent::Activity(_) => last_activity = Instant::now(),
            ClusterEvent::State(ClusterState::Active) => went_active = true,
            _ => {}
        }
        matches!(e, ClusterEvent::State(ClusterState::Idle))
    })
    .await;
    let quiet = last_activity.elapsed();

    assert!(went_active);
    assert_eq!(largest_pool, 3);
    assert!(quiet + SLACK >= IDLE_TIMEOUT, "demoted {quiet:?} after the last activity");
    eventually(|| cluster.state() == ClusterState::Idle && cluster.tunnels().len() == 1).await;

    cluster.destroy(None).await;
}

#[tokio::test]
async fn compresses_text_responses_end_to_end() {
    const SCRIPT: &str = "console.log('hello from the destination');\n";

    let destination = fake_destination(
        b"HTTP/1.1 200 OK\r\nContent-Type: application/javascript; charset=utf-8\r\nContent-Length: 43\r\n\r\nconsole.log('hello from the destination');\n",
    )
    .await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let (relay, _) = fake_server(move |n, mut socket| {
        let tx = tx.clone();
        async move {
            if n > 0 {
                return hold(socket, destination).await;
            }
            read_head(&mut socket).await;
            let _ = socket.write_all(accepted_handshake(destination).as_bytes()).await;
            let _ = socket.write_all(b"GET /app.js HTTP/1.1\r\nHost: localhost\r\nAccept-Encoding: gzip, deflate\r\n\r\n").await;
            let mut response = Vec::new();
            let _ = socket.read_to_end(&mut response).await;
            let _ = tx.send(response);
        }
    })
    .await;

    let (cluster, _events) = TunnelCluster::start(config(relay).build().unwrap()).unwrap();
    let response = timeout(WAIT, rx.recv()).await.unwrap().unwrap();

    let head_len = response.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
    let head = String::from_utf8(response[..head_len].to_vec()).unwrap();
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Transfer-Encoding: chunked\r\n"));
    assert!(head.contains("Content-Encoding: gzip\r\n"));
    assert!(!head.to_ascii_lowercase().contains("content-length"));

    let mut body = BytesMut::from(&response[head_len..]);
    let mut decoder = ChunkedDecoder::new();
    let mut compressed = Vec::new();
    while let Some(item) = tokio_util::codec::Decoder::decode(&mut decoder, &mut body).unwrap() {
        match item {
            PayloadItem::Chunk(data) => compressed.extend_from_slice(&data),
            PayloadItem::Eof => break,
        }
    }
    assert!(decoder.is_finished());

    let mut plain = String::new();
    GzDecoder::new(&compressed[..]).read_to_string(&mut plain).unwrap();
    assert_eq!(plain, SCRIPT);

    cluster.destroy(None).await;
}

#[tokio::test]
async fn destroy_is_idempotent() {
    let (relay, _) = fake_server(|_, socket| hold(socket, 1)).await;
    let (cluster, mut events) = TunnelCluster::start(config(relay).build().unwrap()).unwrap();

    wait_for(&mut events, |e| matches!(e, ClusterEvent::Connect(_))).await;
    assert_eq!(cluster.tunnels().len(), 1);

    cluster.destroy(None).await;
    assert_eq!(cluster.state(), ClusterState::Destroyed);
    assert!(cluster.tunnels().is_empty());

    cluster.destroy(Some(TunnelError::HandshakeClosed)).await;
    cluster.clone().destroy(None).await;

    let error = destroyed_error(wait_for(&mut events, |e| matches!(e, ClusterEvent::Destroyed { .. })).await);
    assert!(error.is_none());
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn dropping_the_handle_destroys_cluster() {
    let (relay, _) = fake_server(|_, socket| hold(socket, 1)).await;
    let (cluster, mut events) = TunnelCluster::start(config(relay).build().unwrap()).unwrap();

    wait_for(&mut events, |e| matches!(e, ClusterEvent::Connect(_))).await;
    drop(cluster);

    let error = destroyed_error(wait_for(&mut events, |e| matches!(e, ClusterEvent::Destroyed { .. })).await);
    assert!(error.is_none());
}

#[tokio::test]
async fn relay_disconnect_reconnects() {
    let (relay, accepted) = fake_server(|n, mut socket| async move {
        if n > 0 {
            return hold(socket, 1).await;
        }
        read_head(&mut socket).await;
        let _ = socket.write_all(accepted_handshake(1).as_bytes()).await;
        let _ = socket.write_all(b"HTTP/1.1 410 Gone\r\nContent-Length: 0\r\n\r\n").await;
    })
    .await;

    let config = config(relay).retry_delay(Duration::from_millis(50)).build().unwrap();
    let (cluster, mut events) = TunnelCluster::start(config).unwrap();

    let closed = wait_for(&mut events, |e| matches!(e, ClusterEvent::TunnelClosed { .. })).await;
    assert!(matches!(closed, ClusterEvent::TunnelClosed { error: Some(ref e), .. } if e.status() == Some(410)));

    assert!(matches!(wait_for(&mut events, |e| matches!(e, ClusterEvent::Reconnect(_))).await, ClusterEvent::Reconnect(1)));
    wait_for(&mut events, |e| matches!(e, ClusterEvent::Connect(_))).await;
    eventually(|| cluster.reconnect_attempts() == 0).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
    assert_ne!(cluster.state(), ClusterState::Destroyed);

    cluster.destroy(None).await;
}

#[tokio::test]
async fn relay_disconnect_can_be_fatal() {
    let (relay, _) = fake_server(|_, mut socket| async move {
        read_head(&mut socket).await;
        let _ = socket.write_all(accepted_handshake(1).as_bytes()).await;
        let _ = socket.write_all(b"HTTP/1.1 410 Gone\r\nContent-Length: 0\r\n\r\n").await;
    })
    .await;

    let config = config(relay).disconnect_is_fatal(true).build().unwrap();
    let (_cluster, mut events) = TunnelCluster::start(config).unwrap();

    let error = destroyed_error(wait_for(&mut events, |e| matches!(e, ClusterEvent::Destroyed { .. })).await).unwrap();
    assert_eq!(error.code().as_str(), "ESERVERDISCONNECT");
}
