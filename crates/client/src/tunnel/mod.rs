//! A single tunnel: one connection to the relay relaying one session stream to
//! a local destination.
//!
//! Lifecycle:
//!
//! 1. connect to the relay and send `CONNECT <session>`
//! 2. a `200` answer carries the destination in `X-RV-Host`; anything else is
//!    [`TunnelError::Forbidden`]
//! 3. wait for the first payload from the relay; an HTTP response there means
//!    the relay closed the session ([`TunnelError::ServerDisconnect`])
//! 4. connect to the destination and relay both ways through the transcoder
//!    until one side closes
//!
//! Each tunnel runs in its own task. The [`Tunnel`] handle is cheap to clone and
//! only exposes read-only state plus [`Tunnel::destroy`]. Lifecycle changes are
//! reported as [`TunnelEvent`]s on the channel given at spawn time.

mod handshake;
mod relay;
mod transport;

pub use transport::tls_connector;

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::BytesMut;
use http::StatusCode;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::config::{ClusterConfig, Endpoint};
use crate::error::{ConfigError, TunnelError};

pub type TunnelId = u64;

/// Sender half tunnels report their events to.
pub type TunnelNotifier = mpsc::UnboundedSender<(TunnelId, TunnelEvent)>;

/// Lifecycle notifications of a tunnel.
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    /// The relay accepted the handshake
    Connected,
    /// Data was read from the relay or the destination
    Activity,
    /// The tunnel is gone, with the error that ended it if any
    Destroyed(Option<Arc<TunnelError>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TunnelState {
    Connecting = 0,
    Connected = 1,
    Destroyed = 2,
}

impl TunnelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TunnelState::Connecting,
            1 => TunnelState::Connected,
            _ => TunnelState::Destroyed,
        }
    }
}

/// Per-tunnel settings shared by every tunnel of a cluster.
#[derive(Clone)]
pub struct TunnelOptions {
    destination_timeout: Duration,
    headers: Vec<(String, String)>,
    tls: TlsConnector,
}

impl TunnelOptions {
    /// # Errors
    ///
    /// Fails when the TLS client can not be built.
    pub fn new(insecure: bool) -> Result<Self, ConfigError> {
        Ok(Self { destination_timeout: Duration::from_secs(30), headers: Vec::new(), tls: tls_connector(insecure)? })
    }

    /// # Errors
    ///
    /// Fails when the TLS client can not be built.
    pub fn from_config(config: &ClusterConfig) -> Result<Self, ConfigError> {
        let headers = config.headers.iter().map(|(name, value)| (name.clone(), value.clone())).collect();
        Ok(Self { destination_timeout: config.destination_timeout, headers, tls: tls_connector(config.insecure)? })
    }

    #[must_use]
    pub fn destination_timeout(mut self, timeout: Duration) -> Self {
        self.destination_timeout = timeout;
        self
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

impl fmt::Debug for TunnelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelOptions")
            .field("destination_timeout", &self.destination_timeout)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-unique tunnel id.
pub fn next_tunnel_id() -> TunnelId {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Handle to a running tunnel.
#[derive(Clone)]
pub struct Tunnel {
    inner: Arc<Inner>,
}

struct Inner {
    id: TunnelId,
    state: AtomicU8,
    traffic: AtomicU64,
    task: OnceLock<AbortHandle>,
    notifier: TunnelNotifier,
}

impl Tunnel {
    /// Starts a tunnel to `relay` in a new task.
    ///
    /// `TunnelEvent::Connected` is sent once the handshake succeeds, and exactly
    /// one `TunnelEvent::Destroyed` when the tunnel ends for whatever reason.
    pub fn spawn(id: TunnelId, relay: Endpoint, options: TunnelOptions, notifier: TunnelNotifier) -> Self {
        let tunnel = Self::detached(id, notifier);

        let task = tokio::spawn({
            let tunnel = tunnel.clone();
            async move {
                match run(&tunnel, &relay, &options).await {
                    Ok(()) => tunnel.destroy(None),
                    Err(e) => tunnel.destroy(Some(e)),
                }
            }
        });
        // set once, right after spawning
        let _ = tunnel.inner.task.set(task.abort_handle());
        tunnel
    }

    /// Starts a standalone tunnel to the relay `url`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when `url` is not a usable relay url.
    pub fn open(url: &str, options: TunnelOptions) -> Result<(Self, mpsc::UnboundedReceiver<(TunnelId, TunnelEvent)>), ConfigError> {
        let relay = Endpoint::parse(url)?;
        let (notifier, events) = mpsc::unbounded_channel();
        Ok((Self::spawn(next_tunnel_id(), relay, options, notifier), events))
    }

    /// A handle without a task, used by tests driving the relay directly.
    pub(crate) fn detached(id: TunnelId, notifier: TunnelNotifier) -> Self {
        let inner = Inner {
            id,
            state: AtomicU8::new(TunnelState::Connecting as u8),
            traffic: AtomicU64::new(0),
            task: OnceLock::new(),
            notifier,
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn id(&self) -> TunnelId {
        self.inner.id
    }

    pub fn state(&self) -> TunnelState {
        TunnelState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == TunnelState::Connected
    }

    pub fn is_destroyed(&self) -> bool {
        self.state() == TunnelState::Destroyed
    }

    /// Bytes read and written on both sockets so far.
    pub fn traffic(&self) -> u64 {
        self.inner.traffic.load(Ordering::Relaxed)
    }

    /// Closes both sockets and reports `TunnelEvent::Destroyed(error)`.
    ///
    /// Only the first call has an effect.
    pub fn destroy(&self, error: Option<TunnelError>) {
        let previous = self.inner.state.swap(TunnelState::Destroyed as u8, Ordering::AcqRel);
        if TunnelState::from_u8(previous) == TunnelState::Destroyed {
            return;
        }

        match &error {
            Some(e) => debug!(tunnel = self.id(), cause = %e, "destroying tunnel"),
            None => debug!(tunnel = self.id(), "destroying tunnel"),
        }
        if let Some(task) = self.inner.task.get() {
            task.abort();
        }
        self.notify(TunnelEvent::Destroyed(error.map(Arc::new)));
    }

    fn mark_connected(&self) -> bool {
        let swapped = self
            .inner
            .state
            .compare_exchange(TunnelState::Connecting as u8, TunnelState::Connected as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            self.notify(TunnelEvent::Connected);
        }
        swapped
    }

    pub(crate) fn record_traffic(&self, bytes: usize) {
        self.inner.traffic.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn report_activity(&self) {
        self.notify(TunnelEvent::Activity);
    }

    fn notify(&self, event: TunnelEvent) {
        // the receiver is gone once the owner stopped listening
        let _ = self.inner.notifier.send((self.inner.id, event));
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("traffic", &self.traffic())
            .finish()
    }
}

/// The whole life of a tunnel; the caller turns the result into `destroy`.
async fn run(tunnel: &Tunnel, relay_endpoint: &Endpoint, options: &TunnelOptions) -> Result<(), TunnelError> {
    let mut relay_stream = transport::connect(relay_endpoint, &options.tls).await?;
    let (head, mut payload) = handshake::handshake(&mut relay_stream, relay_endpoint, &options.headers).await?;

    if head.status() != StatusCode::OK {
        warn!(tunnel = tunnel.id(), session = relay_endpoint.session(), status = head.status().as_u16(), "relay refused tunnel");
        return Err(TunnelError::forbidden(head.status().as_u16()));
    }

    let destination = head
        .fields()
        .get_str(handshake::RV_HOST)
        .ok_or_else(|| TunnelError::invalid_destination("missing X-RV-Host"))
        .and_then(|host| Endpoint::parse(host).map_err(TunnelError::invalid_destination))?;

    if !tunnel.mark_connected() {
        return Ok(());
    }
    info!(tunnel = tunnel.id(), session = relay_endpoint.session(), "tunnel connected");

    if payload.is_empty() {
        payload = BytesMut::with_capacity(8 * 1024);
        if relay_stream.read_buf(&mut payload).await? == 0 {
            debug!(tunnel = tunnel.id(), "relay closed before any payload");
            return Ok(());
        }
    }
    tunnel.record_traffic(payload.len());
    if let Some(status) = handshake::disconnect_status(&payload) {
        return Err(TunnelError::server_disconnect(status));
    }
    tunnel.report_activity();

    let destination_stream = transport::connect(&destination, &options.tls).await?;
    debug!(tunnel = tunnel.id(), host = destination.host(), port = destination.port(), "destination connected");

    let closed = relay::relay(tunnel, relay_stream, destination_stream, payload, options.destination_timeout).await?;
    debug!(tunnel = tunnel.id(), closed = ?closed, "tunnel closed");
    Ok(())
}
