//! Broker metrics: lock-free atomic counters.
//!
//! Counters are bumped with relaxed ordering on the hot path; nothing here
//! allocates. A [`MetricsSnapshot`] is taken for tests and for the final
//! shutdown log line.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct BrokerMetrics {
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    frames_received: AtomicU64,
    messages_forwarded: AtomicU64,
    publishes_routed: AtomicU64,
    push_items_enqueued: AtomicU64,
    push_items_dispatched: AtomicU64,
    push_items_acked: AtomicU64,
    protocol_errors: AtomicU64,
}

impl BrokerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_forwarded(&self) {
        self.messages_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_routed(&self) {
        self.publishes_routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn push_items_enqueued(&self, count: u64) {
        self.push_items_enqueued.fetch_add(count, Ordering::Relaxed);
    }

    pub fn push_item_dispatched(&self) {
        self.push_items_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn push_item_acked(&self) {
        self.push_items_acked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            messages_forwarded: self.messages_forwarded.load(Ordering::Relaxed),
            publishes_routed: self.publishes_routed.load(Ordering::Relaxed),
            push_items_enqueued: self.push_items_enqueued.load(Ordering::Relaxed),
            push_items_dispatched: self.push_items_dispatched.load(Ordering::Relaxed),
            push_items_acked: self.push_items_acked.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the broker counters.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub frames_received: u64,
    pub messages_forwarded: u64,
    pub publishes_routed: u64,
    pub push_items_enqueued: u64,
    pub push_items_dispatched: u64,
    pub push_items_acked: u64,
    pub protocol_errors: u64,
}
