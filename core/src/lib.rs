//! # RelayMQ Core Library
//!
//! RelayMQ is an in-process message broker that multiplexes several
//! messaging patterns over a single connection-oriented transport (TCP or
//! a local stream socket):
//!
//! - **request/response** - point-to-point `req`/`res` between named
//!   channels, with responses routed back to the originator
//! - **push/pull** - work queues with round-robin dispatch, exactly one
//!   worker per item, and ack-tracked redelivery on worker death
//! - **publish/subscribe** - topic fan-out to every current subscriber
//!
//! Peers connect, register under a **channel name**, and exchange
//! length-prefixed binary messages. The broker routes by channel and topic
//! and forwards inter-channel traffic as the exact received bytes.
//!
//! ## Architecture Overview
//!
//! - [`protocol`] - wire framing and the message codec
//! - [`registry`] - channel registry, patterns, and monitors
//! - [`queues`] - per-topic pull/subscribe queues with dispatch policy
//! - [`broker`] - TCP/Unix server, connection lifecycle, and the single
//!   routing task
//! - [`config`] - broker configuration
//! - [`metrics`] - lock-free broker counters
//!
//! All broker state is in memory and dies with the process; there is no
//! persistence, authentication, or cross-broker federation.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use relaymq::{BrokerConfig, BrokerServer};
//!
//! #[tokio::main]
//! async fn main() -> relaymq::Result<()> {
//!     let config = BrokerConfig {
//!         port: 7171,
//!         ..Default::default()
//!     };
//!
//!     let server = BrokerServer::new(config)?;
//!     server.run().await
//! }
//! ```

pub mod broker;
pub mod config;
pub mod metrics;
pub mod protocol;
pub mod queues;
pub mod registry;

pub use broker::{BrokerHandle, BrokerServer, MessageRouter};
pub use config::BrokerConfig;
pub use metrics::{BrokerMetrics, MetricsSnapshot};
pub use protocol::{
    ChannelName, ContentType, ErrorCode, FrameCodec, Message, MessageCodec, MessageId, MessageKind,
    Payload, RequestMessage, ResponseMessage, TopicName,
};
pub use registry::{ChannelRegistry, NamePattern};
pub use queues::TaskQueues;

use thiserror::Error;

/// RelayMQ error types.
///
/// Wire-level failures (framing violations, unknown enum values, malformed
/// JSON payloads) are carried by [`protocol::CodecError`] and recovered
/// locally by closing the offending peer; routing failures for requests are
/// answered with an error `res` instead of surfacing here. What remains are
/// the process-level failures an embedder sees.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Transport errors: bind, accept, read, and write failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire codec errors surfaced through embedder-facing calls.
    #[error("codec error: {0}")]
    Codec(#[from] protocol::CodecError),

    /// JSON serialization errors for internal payloads.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration validation and parsing errors.
    #[error("configuration error: {0}")]
    Config(String),

    /// A broker-originated request named a channel that is not registered
    /// or died before responding.
    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    /// The routing task is not running.
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RelayError>;
