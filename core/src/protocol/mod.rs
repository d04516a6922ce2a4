//! # RelayMQ Protocol Module
//!
//! This module implements the broker's native wire protocol: a
//! self-describing binary envelope with per-kind header schemas and typed
//! payloads.
//!
//! ## Message kinds
//!
//! - **req / res** - point-to-point request/response between channels
//! - **push / pull / ack** - work queues with exactly-one-worker dispatch
//! - **pub / sub** - topic fan-out to every subscriber
//! - **mon** - channel lifecycle notifications for pattern monitors
//! - **sreq** - administrative requests addressed to the broker itself
//!
//! ## Wire format
//!
//! Each frame is `[u32 BE totalLen][u32 BE headerLen][header][payload]`.
//! Header integers are big-endian, strings are varint-length-prefixed UTF-8,
//! and `push` payloads carry a sequence of `[u32 BE itemLen][bytes]` items.
//! Byte-exact interop with existing deployments depends on this layout; see
//! [`codec`] for the authoritative encoding rules.
//!
//! ## Modules
//!
//! - [`messages`] - message kinds, content types, error codes, payloads
//! - [`codec`] - frame reassembly plus header/payload encode and decode

pub mod codec;
pub mod messages;

pub use codec::{CodecError, FrameCodec, MessageCodec, DEFAULT_MAX_FRAME_SIZE};
pub use messages::*;
