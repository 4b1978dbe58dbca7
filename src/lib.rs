//! This crate provides the routing and dispatch engine of a multi-protocol proxy.
//!
//! # Feature
//! ## Rules
//!
//! Every flow is described by a [`Metadata`] record and tested against an
//! ordered list of route rules. A matching rule either decides the flow
//! (`route`, `reject`, `hijack-dns`) or enriches the record and lets the walk
//! go on (`sniff`, `resolve`, `route-options`).
//! Rules may refer to rule-sets, which are loaded inline, from a local file
//! (optionally watched) or from a remote URL refreshed on an interval.
//!
//! ## Outbounds
//!
//! Leaf outbounds dial directly or refuse every dial. Group outbounds pick
//! among other outbounds: `selector` by hand, `urltest` by probed latency and
//! `balancer` by `least_load` / `least_ping` health statistics.
//!
//! ## Dispatch
//!
//! The chosen outbound is dialed and both sides are joined by a copy engine.
//! Flows registered with a cancellation context are closed by the connection
//! monitor once the context is cancelled.
//!
//! # Usage
//!
//! ## Router
//!
//! ```rust
//! use switchyard::*;
//! let config: Config = serde_yaml::from_str(r#"
//! outbounds:
//!   - {tag: direct, type: direct}
//! route:
//!   rules:
//!     - {domain_suffix: ads.example, action: reject}
//! "#).unwrap();
//! let router = Router::new(&config).unwrap();
//! let rt = tokio::runtime::Runtime::new().unwrap();
//!
//! let mut metadata = Metadata::new(
//!     Network::Tcp,
//!     "10.0.0.2:50000".parse().unwrap(),
//!     "track.ads.example:443".parse().unwrap(),
//! );
//! let err = rt.block_on(router.pre_match(&mut metadata)).unwrap_err();
//! assert!(err.is_rejected());
//! ```
//!
//! ## Server
//!
//! Here is a minimum server forwarding one local port.
//!
//! ```rust,no_run
//! use switchyard::*;
//! # async fn run() -> Result<()> {
//! let config: Config = serde_yaml::from_str(r#"
//! inbounds:
//!   - {tag: forward-in, listen: 127.0.0.1:10800, destination: example.com:443}
//! "#)?;
//! let (mut server, tx) = Server::new(config)?;
//! tokio::spawn(async move {
//!     tokio::time::sleep(std::time::Duration::from_secs(1)).await;
//!     tx.send(ServerCommand::Terminate).ok();
//! });
//! server.serve().await
//! # }
//! ```

pub mod acceptor;
pub mod byte_stream;
pub mod config;
pub mod connection;
pub mod connector;
pub mod dialer;
pub mod dns;
pub mod error;
pub mod geoip;
pub mod metadata;
pub mod model;
pub mod monitor;
pub mod outbound;
pub mod pkt_stream;
pub mod process;
pub mod relay;
pub mod router;
pub mod rule;
pub mod rule_set;
pub mod server;
pub mod server_command;
pub mod session;
pub mod sniff;

pub use config::*;
pub use error::{Error, Result};
pub use metadata::Metadata;
pub use model::{Address, Network};
pub use router::Router;
pub use server::*;
pub use server_command::*;
pub use session::{CloseHandler, ConnectionId};
