//! # RelayMQ Broker Module
//!
//! Core broker functionality: listener setup, per-peer connection
//! lifecycle, and the single-task routing core.
//!
//! ## Architecture
//!
//! The broker is built around two components:
//!
//! - [`server`] - binds the TCP or Unix listener, accepts peers, and runs
//!   one connection task per peer that reassembles frames and relays them
//!   to the router
//! - [`router`] - the single routing task that owns the channel registry
//!   and task queues, classifies every decoded message, and forwards
//!   inter-channel traffic as the exact received bytes
//!
//! Connections never touch the registry or queues directly; everything
//! flows through the router's event channel, which is what gives the broker
//! its per-peer ordering guarantees without locks.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use relaymq::{BrokerConfig, BrokerServer};
//!
//! #[tokio::main]
//! async fn main() -> relaymq::Result<()> {
//!     let config = BrokerConfig {
//!         host: "127.0.0.1".to_string(),
//!         port: 7171,
//!         ..Default::default()
//!     };
//!
//!     let server = BrokerServer::new(config)?;
//!     server.run().await
//! }
//! ```

pub mod router;
pub mod server;

pub use router::{LocalHandler, MessageRouter, RouterEvent};
pub use server::{BrokerHandle, BrokerServer};
