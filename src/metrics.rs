// SPDX-License-Identifier: MIT
//! Process-wide atomic counters surfaced by the IPC `status` opcode.
//!
//! Kept deliberately small — the device/application maps already live in
//! [`crate::balancer`] and are the source of truth for "how many devices are
//! online right now"; these counters only track monotonic totals that the
//! maps can't answer on their own.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    connections_accepted: AtomicU64,
    worker_messages_processed: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_message(&self) {
        self.worker_messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_messages_processed(&self) -> u64 {
        self.worker_messages_processed.load(Ordering::Relaxed)
    }
}
