// SPDX-License-Identifier: MIT
//! Structured logging helpers and lightweight latency tracking shared by the
//! balancer and workers.

use std::time::Instant;
use tracing::{debug, info};

/// Track latency of an async operation and emit a structured log event.
pub struct LatencyTracker {
    operation: String,
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency for an operation.
    ///
    /// Examples:
    ///   let tracker = LatencyTracker::start("session.create");
    pub fn start(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            start: Instant::now(),
        }
    }

    /// Finish tracking and emit a log event with the elapsed time.
    pub fn finish(self) {
        let elapsed_ms = self.start.elapsed().as_millis();
        if elapsed_ms > 1000 {
            // Slow operation — log at info level
            info!(
                operation = %self.operation,
                elapsed_ms = elapsed_ms,
                "slow operation"
            );
        } else {
            debug!(
                operation = %self.operation,
                elapsed_ms = elapsed_ms,
                "operation complete"
            );
        }
    }
}

/// Process health, as reported by the `status` IPC opcode and by `doctor`.
#[derive(Debug, serde::Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
}

impl HealthStatus {
    pub fn ok(uptime_secs: u64) -> Self {
        Self { status: "ok", version: env!("CARGO_PKG_VERSION"), uptime_secs }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_status_ok() {
        let h = HealthStatus::ok(300);
        assert_eq!(h.status, "ok");
        assert_eq!(h.uptime_secs, 300);
    }
}
