//! A pool of tunnels serving one relay session.
//!
//! The pool grows and shrinks with traffic:
//!
//! - `idle`: a single tunnel waits for the relay to send something
//! - `active`: after the first activity, the pool is filled up to `maxConnections`
//!   so the relay can forward concurrent requests
//! - back to `idle` once no tunnel reported activity for `idleTimeout`; extra
//!   tunnels are closed, newest first
//!
//! When the pool runs empty because tunnels keep failing, a retry timer
//! reconnects every `retryDelay`, at most `retryCount` times in a row, before
//! giving up with `ESERVERUNREACHABLE`. A relay that rejects the handshake
//! (`EFORBIDDEN`) ends the cluster at once.
//!
//! All pool state lives in one worker task. The [`TunnelCluster`] handle sends
//! it commands, and reads a snapshot the worker publishes after every turn.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::config::{ClusterConfig, Endpoint};
use crate::error::{ConfigError, ErrorCode, TunnelError};
use crate::timer::ResumableTimer;
use crate::tunnel::{Tunnel, TunnelEvent, TunnelId, TunnelNotifier, TunnelOptions, next_tunnel_id};

/// How many recent error messages a cluster keeps.
const ERROR_LOG_CAPACITY: usize = 100;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    Idle,
    Active,
    Destroyed,
}

impl ClusterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterState::Idle => "idle",
            ClusterState::Active => "active",
            ClusterState::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notifications published to cluster subscribers.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    /// A tunnel completed its handshake
    Connect(TunnelId),
    /// A tunnel saw data
    Activity(TunnelId),
    State(ClusterState),
    /// The pool ran empty and the cluster reconnects, with the attempt number
    Reconnect(u32),
    /// A tunnel left the pool
    TunnelClosed { id: TunnelId, error: Option<Arc<TunnelError>> },
    /// The cluster is gone; sent exactly once
    Destroyed { error: Option<Arc<TunnelError>> },
}

/// Read-only view of a cluster, as of the worker's last turn.
#[derive(Debug, Clone)]
pub struct ClusterSnapshot {
    pub state: ClusterState,
    /// Live tunnels, oldest first
    pub tunnels: Vec<Tunnel>,
    /// Most recent error messages, oldest first
    pub errors: Vec<String>,
    pub reconnect_attempts: u32,
}

enum Command {
    Destroy { error: Option<TunnelError>, ack: oneshot::Sender<()> },
}

/// Handle to a running cluster.
///
/// Cloning the handle is cheap. The cluster is destroyed when [`destroy`](Self::destroy)
/// is called or the last handle is dropped.
#[derive(Clone)]
pub struct TunnelCluster {
    session: Arc<str>,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ClusterEvent>,
    snapshot: watch::Receiver<ClusterSnapshot>,
}

impl TunnelCluster {
    /// Validates `config` and starts the cluster with one tunnel.
    ///
    /// Returns the handle and a subscription that sees every event from the start.
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the config is invalid; nothing is started then.
    pub fn start(config: ClusterConfig) -> Result<(Self, broadcast::Receiver<ClusterEvent>), ConfigError> {
        let relay = config.validate()?;
        let options = TunnelOptions::from_config(&config)?;
        let session: Arc<str> = Arc::from(relay.session());

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (notifier, tunnel_events) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(ClusterSnapshot {
            state: ClusterState::Idle,
            tunnels: Vec::new(),
            errors: Vec::new(),
            reconnect_attempts: 0,
        });

        info!(session = %session, max_connections = config.max_connections, "starting tunnel cluster");
        let worker = ClusterWorker {
            relay,
            options,
            idle_timer: ResumableTimer::new(config.idle_timeout),
            retry_timer: ResumableTimer::new(config.retry_delay),
            config,
            state: ClusterState::Idle,
            tunnels: Vec::new(),
            handshaken: HashSet::new(),
            reconnect_attempts: 0,
            errors: ErrorLog::new(ERROR_LOG_CAPACITY),
            fill_pending: false,
            changed: true,
            notifier,
            tunnel_events,
            commands: commands_rx,
            events: events_tx.clone(),
            snapshot: snapshot_tx,
        };
        tokio::spawn(worker.run());

        Ok((Self { session, commands: commands_tx, events: events_tx, snapshot: snapshot_rx }, events_rx))
    }

    /// The session this cluster serves.
    pub fn session(&self) -> &str {
        &self.session
    }

    /// A new subscription, seeing events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> ClusterSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> ClusterState {
        self.snapshot.borrow().state
    }

    pub fn tunnels(&self) -> Vec<Tunnel> {
        self.snapshot.borrow().tunnels.clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.snapshot.borrow().errors.clone()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.snapshot.borrow().reconnect_attempts
    }

    /// Closes every tunnel and stops the cluster for good.
    ///
    /// Resolves once the cluster is destroyed. Calling it again, or on a cluster
    /// that already failed, does nothing.
    pub async fn destroy(&self, error: Option<TunnelError>) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Destroy { error, ack }).is_ok() {
            let _ = done.await;
        }
    }

    /// Waits until the cluster is destroyed, for any reason.
    pub async fn closed(&self) {
        let mut snapshot = self.snapshot.clone();
        let _ = snapshot.wait_for(|s| s.state == ClusterState::Destroyed).await;
    }
}

impl fmt::Debug for TunnelCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelCluster").field("session", &self.session).field("state", &self.state()).finish_non_exhaustive()
    }
}

/// Bounded log of recent error messages.
#[derive(Debug)]
struct ErrorLog {
    capacity: usize,
    entries: VecDeque<String>,
}

impl ErrorLog {
    fn new(capacity: usize) -> Self {
        Self { capacity, entries: VecDeque::with_capacity(capacity) }
    }

    fn push(&mut self, message: String) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(message);
    }

    fn to_vec(&self) -> Vec<String> {
        self.entries.iter().cloned().collect()
    }
}

/// Owns the pool; the only writer of cluster state.
struct ClusterWorker {
    relay: Endpoint,
    config: ClusterConfig,
    options: TunnelOptions,
    state: ClusterState,
    /// oldest first, index 0 is kept when pruning
    tunnels: Vec<Tunnel>,
    /// pooled tunnels whose handshake completed
    handshaken: HashSet<TunnelId>,
    reconnect_attempts: u32,
    idle_timer: ResumableTimer,
    retry_timer: ResumableTimer,
    errors: ErrorLog,
    /// a fill pass runs once the current batch of notifications is handled
    fill_pending: bool,
    /// the snapshot is stale
    changed: bool,
    notifier: TunnelNotifier,
    tunnel_events: mpsc::UnboundedReceiver<(TunnelId, TunnelEvent)>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<ClusterEvent>,
    snapshot: watch::Sender<ClusterSnapshot>,
}

impl ClusterWorker {
    async fn run(mut self) {
        self.idle_timer.start();
        self.create_tunnel();
        self.publish();

        while self.state != ClusterState::Destroyed {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Destroy { error, ack }) => {
                        self.destroy(error.map(Arc::new));
                        self.publish();
                        let _ = ack.send(());
                    }
                    None => {
                        debug!(session = self.relay.session(), "all cluster handles dropped");
                        self.destroy(None);
                    }
                },
                Some((id, event)) = self.tunnel_events.recv() => {
                    self.on_tunnel_event(id, event);
                    while let Ok((id, event)) = self.tunnel_events.try_recv() {
                        self.on_tunnel_event(id, event);
                    }
                }
                () = self.idle_timer.fired() => self.on_idle_timeout(),
                () = self.retry_timer.fired() => self.on_retry_timeout(),
            }

            if std::mem::take(&mut self.fill_pending) {
                self.fill();
            }
            self.publish();
        }
        debug!(session = self.relay.session(), "cluster worker finished");
    }

    fn emit(&self, event: ClusterEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn publish(&mut self) {
        if !std::mem::take(&mut self.changed) {
            return;
        }
        self.snapshot.send_replace(ClusterSnapshot {
            state: self.state,
            tunnels: self.tunnels.clone(),
            errors: self.errors.to_vec(),
            reconnect_attempts: self.reconnect_attempts,
        });
    }

    fn position(&self, id: TunnelId) -> Option<usize> {
        self.tunnels.iter().position(|tunnel| tunnel.id() == id)
    }

    fn on_tunnel_event(&mut self, id: TunnelId, event: TunnelEvent) {
        let Some(index) = self.position(id) else {
            // tunnels the cluster already let go of
            return;
        };

        match event {
            TunnelEvent::Connected => {
                debug!(tunnel = id, total = self.tunnels.len(), "tunnel connected to relay");
                self.handshaken.insert(id);
                self.retry_timer.stop();
                self.reconnect_attempts = 0;
                self.changed = true;
                self.emit(ClusterEvent::Connect(id));
            }
            TunnelEvent::Activity => {
                self.emit(ClusterEvent::Activity(id));
                self.idle_timer.restart();
                self.set_state(ClusterState::Active);
                self.fill_pending = true;
            }
            TunnelEvent::Destroyed(error) => {
                self.tunnels.remove(index);
                let was_connected = self.handshaken.remove(&id);
                self.changed = true;
                debug!(tunnel = id, left = self.tunnels.len(), "tunnel closed");
                self.emit(ClusterEvent::TunnelClosed { id, error: error.clone() });

                match error {
                    None => self.fill_pending = true,
                    Some(error) => self.on_tunnel_error(error, was_connected),
                }
            }
        }
    }

    fn on_tunnel_error(&mut self, error: Arc<TunnelError>, was_connected: bool) {
        warn!(session = self.relay.session(), code = %error.code(), cause = %error, "tunnel error");
        self.errors.push(error.to_string());

        let code = error.code();
        let fatal = code == ErrorCode::Forbidden || (code == ErrorCode::ServerDisconnect && self.config.disconnect_is_fatal);
        if fatal {
            self.retry_timer.stop();
            self.destroy(Some(error));
            return;
        }

        self.retry_timer.restart();
        debug!(session = self.relay.session(), retry_in = ?self.retry_timer.delay(), "retry timer armed");
        // the relay was reachable, replace the tunnel right away
        if was_connected && code != ErrorCode::ServerDisconnect {
            self.fill_pending = true;
        }
    }

    fn on_idle_timeout(&mut self) {
        if self.state == ClusterState::Active {
            debug!(session = self.relay.session(), "going to idle state");
            self.set_state(ClusterState::Idle);
        }
    }

    fn on_retry_timeout(&mut self) {
        if !self.tunnels.is_empty() || self.state == ClusterState::Destroyed {
            return;
        }

        if self.reconnect_attempts < self.config.retry_count {
            self.reconnect_attempts += 1;
            self.changed = true;
            info!(session = self.relay.session(), attempt = self.reconnect_attempts, "reconnecting to relay");
            self.set_state(ClusterState::Idle);
            self.idle_timer.restart();
            self.emit(ClusterEvent::Reconnect(self.reconnect_attempts));
            self.fill_pending = true;
            self.retry_timer.restart();
        } else {
            let error = Arc::new(TunnelError::server_unreachable(self.reconnect_attempts));
            self.errors.push(error.to_string());
            self.destroy(Some(error));
        }
    }

    /// Changes state; `destroyed` is final and entering `idle` prunes the pool to one tunnel.
    fn set_state(&mut self, state: ClusterState) {
        if self.state == ClusterState::Destroyed || self.state == state {
            return;
        }

        if state == ClusterState::Idle {
            while self.tunnels.len() > 1 {
                if let Some(tunnel) = self.tunnels.pop() {
                    self.release(&tunnel);
                }
            }
        }

        self.state = state;
        self.changed = true;
        self.emit(ClusterEvent::State(state));
    }

    /// Creates tunnels until the pool matches the current state.
    fn fill(&mut self) {
        let desired = match self.state {
            ClusterState::Destroyed => 0,
            ClusterState::Idle => 1,
            ClusterState::Active => self.config.max_connections,
        };
        if self.tunnels.len() < desired {
            debug!(session = self.relay.session(), desired, added = desired - self.tunnels.len(), "filling tunnels");
        }
        while self.tunnels.len() < desired {
            self.create_tunnel();
        }
    }

    fn create_tunnel(&mut self) {
        if self.state == ClusterState::Destroyed {
            return;
        }
        let tunnel = Tunnel::spawn(next_tunnel_id(), self.relay.clone(), self.options.clone(), self.notifier.clone());
        debug!(tunnel = tunnel.id(), session = self.relay.session(), "tunnel created");
        self.tunnels.push(tunnel);
        self.changed = true;
    }

    /// Destroys a tunnel the cluster removed from the pool itself.
    fn release(&mut self, tunnel: &Tunnel) {
        self.handshaken.remove(&tunnel.id());
        tunnel.destroy(None);
        self.emit(ClusterEvent::TunnelClosed { id: tunnel.id(), error: None });
    }

    fn destroy(&mut self, error: Option<Arc<TunnelError>>) {
        if self.state == ClusterState::Destroyed {
            return;
        }

        match &error {
            Some(e) => error!(session = self.relay.session(), code = %e.code(), cause = %e, "tunnel cluster failed"),
            None => info!(session = self.relay.session(), "destroying tunnel cluster"),
        }

        self.state = ClusterState::Destroyed;
        self.changed = true;
        self.emit(ClusterEvent::State(ClusterState::Destroyed));

        self.idle_timer.stop();
        self.retry_timer.stop();
        while let Some(tunnel) = self.tunnels.pop() {
            self.release(&tunnel);
        }
        self.emit(ClusterEvent::Destroyed { error });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_log_keeps_most_recent() {
        let mut log = ErrorLog::new(3);
        for i in 0..5 {
            log.push(format!("error {i}"));
        }
        assert_eq!(log.to_vec(), vec!["error 2", "error 3", "error 4"]);
    }

    #[tokio::test]
    async fn invalid_config_starts_nothing() {
        let result = TunnelCluster::start(ClusterConfig::default());
        assert!(matches!(result, Err(ConfigError::MissingUrl)));

        let config = ClusterConfig::builder().url("http://127.0.0.1:9/abc").max_connections(0);
        assert!(config.build().is_err());
    }
}
