//! Reverse-tunnel client for an rv relay.
//!
//! A relay exposes a public url for a session. This crate keeps a small pool of
//! outbound connections ("tunnels") to the relay; the relay forwards each public
//! request over one of them and the tunnel relays it to a local destination,
//! gzip or deflate compressing text responses on the way back when the client
//! accepts it.
//!
//! ```no_run
//! use rv_client::{ClusterConfig, ClusterEvent, TunnelCluster};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClusterConfig::builder().url("https://relay.example.com/my-session").build()?;
//! let (cluster, mut events) = TunnelCluster::start(config)?;
//!
//! while let Ok(event) = events.recv().await {
//!     if let ClusterEvent::Destroyed { error } = event {
//!         eprintln!("cluster {} stopped: {error:?}", cluster.session());
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod cluster;
pub mod config;
pub mod error;
pub mod transcode;
pub mod tunnel;

mod timer;

pub use cluster::{ClusterEvent, ClusterSnapshot, ClusterState, TunnelCluster};
pub use config::{ClusterConfig, ClusterConfigBuilder, Endpoint};
pub use error::{ConfigError, ErrorCode, TunnelError};
pub use timer::ResumableTimer;
pub use tunnel::{Tunnel, TunnelEvent, TunnelId, TunnelOptions, TunnelState};
