//! Optional per-operation instrumentation hook.
//!
//! The client calls [`OperationMonitor::record`] once per operation when a monitor
//! is installed; without one, nothing is recorded. [`ClientMetrics`] is the stock
//! counter-based implementation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::error::MetainfoError;
use crate::rpc::Operation;

/// Coarse result of an operation, as seen by a monitor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum Outcome {
    /// The operation succeeded.
    Success,
    /// The addressed segment did not exist.
    NotFound,
    /// The caller cancelled, the deadline passed, or the connection was closed.
    Cancelled,
    /// Any other failure.
    Failed,
}

impl Outcome {
    /// Classifies an operation result.
    pub fn of<T>(result: &Result<T, MetainfoError>) -> Self {
        match result {
            Ok(_) => Outcome::Success,
            Err(e) if e.is_not_found() => Outcome::NotFound,
            Err(e) if e.is_cancelled() => Outcome::Cancelled,
            Err(_) => Outcome::Failed,
        }
    }
}

/// Receives timing and outcome of every client operation.
pub trait OperationMonitor: Send + Sync {
    /// Called once when `op` finishes.
    fn record(&self, op: Operation, elapsed: Duration, outcome: Outcome);
}

/// Snapshot of the counters for one operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OperationStats {
    /// Operation name.
    pub operation: &'static str,
    /// Completed calls.
    pub calls: u64,
    /// Successful calls.
    pub successes: u64,
    /// Calls answered with not-found.
    pub not_found: u64,
    /// Cancelled or timed-out calls.
    pub cancelled: u64,
    /// Failed calls.
    pub failures: u64,
    /// Sum of call latencies in microseconds.
    pub total_latency_us: u64,
}

impl OperationStats {
    /// Mean latency in microseconds, 0 when there were no calls.
    pub fn mean_latency_us(&self) -> u64 {
        if self.calls == 0 {
            0
        } else {
            self.total_latency_us / self.calls
        }
    }
}

/// Snapshot of all client metrics at a point in time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    /// Per-operation stats in [`Operation::ALL`] order.
    pub operations: Vec<OperationStats>,
}

impl MetricsSnapshot {
    /// Stats for a single operation.
    pub fn get(&self, op: Operation) -> Option<&OperationStats> {
        self.operations.get(op.index())
    }
}

#[derive(Default)]
struct Counters {
    calls: AtomicU64,
    successes: AtomicU64,
    not_found: AtomicU64,
    cancelled: AtomicU64,
    failures: AtomicU64,
    total_latency_us: AtomicU64,
}

/// Thread-safe per-operation counters.
pub struct ClientMetrics {
    ops: [Counters; Operation::ALL.len()],
}

impl Default for ClientMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ClientMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl ClientMetrics {
    /// Creates a ClientMetrics instance with all counters initialized to zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ops: Default::default(),
        }
    }

    /// Takes a consistent-enough snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let operations = Operation::ALL
            .iter()
            .map(|op| {
                let c = &self.ops[op.index()];
                OperationStats {
                    operation: op.name(),
                    calls: c.calls.load(Ordering::Relaxed),
                    successes: c.successes.load(Ordering::Relaxed),
                    not_found: c.not_found.load(Ordering::Relaxed),
                    cancelled: c.cancelled.load(Ordering::Relaxed),
                    failures: c.failures.load(Ordering::Relaxed),
                    total_latency_us: c.total_latency_us.load(Ordering::Relaxed),
                }
            })
            .collect();
        MetricsSnapshot { operations }
    }
}

impl OperationMonitor for ClientMetrics {
    fn record(&self, op: Operation, elapsed: Duration, outcome: Outcome) {
        let c = &self.ops[op.index()];
        c.calls.fetch_add(1, Ordering::Relaxed);
        c.total_latency_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        let counter = match outcome {
            Outcome::Success => &c.successes,
            Outcome::NotFound => &c.not_found,
            Outcome::Cancelled => &c.cancelled,
            Outcome::Failed => &c.failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CancelReason;
    use crate::error::Status;

    #[test]
    fn test_outcome_classification() {
        assert_eq!(Outcome::of(&Ok::<_, MetainfoError>(())), Outcome::Success);
        let nf: Result<(), _> = Err(MetainfoError::from_status(
            Operation::SegmentInfo,
            Status::not_found("gone"),
        ));
        assert_eq!(Outcome::of(&nf), Outcome::NotFound);
        let cancelled: Result<(), _> = Err(MetainfoError::Cancelled {
            op: Operation::ReadSegment,
            reason: CancelReason::DeadlineExceeded,
        });
        assert_eq!(Outcome::of(&cancelled), Outcome::Cancelled);
        let failed: Result<(), _> = Err(MetainfoError::from_status(
            Operation::ListSegments,
            Status::internal("boom"),
        ));
        assert_eq!(Outcome::of(&failed), Outcome::Failed);
    }

    #[test]
    fn test_record_and_snapshot() {
        let metrics = ClientMetrics::new();
        metrics.record(Operation::ReadSegment, Duration::from_micros(100), Outcome::Success);
        metrics.record(Operation::ReadSegment, Duration::from_micros(300), Outcome::NotFound);
        metrics.record(Operation::CommitSegment, Duration::from_micros(50), Outcome::Failed);

        let snap = metrics.snapshot();
        let read = snap.get(Operation::ReadSegment).unwrap();
        assert_eq!(read.operation, "read_segment");
        assert_eq!(read.calls, 2);
        assert_eq!(read.successes, 1);
        assert_eq!(read.not_found, 1);
        assert_eq!(read.mean_latency_us(), 200);

        let commit = snap.get(Operation::CommitSegment).unwrap();
        assert_eq!(commit.failures, 1);
        assert_eq!(snap.get(Operation::ProjectInfo).unwrap().calls, 0);
        assert_eq!(snap.get(Operation::ProjectInfo).unwrap().mean_latency_us(), 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = ClientMetrics::new();
        metrics.record(Operation::ListSegments, Duration::from_millis(1), Outcome::Cancelled);
        let json = serde_json::to_string(&metrics.snapshot()).unwrap();
        assert!(json.contains("\"operation\":\"list_segments\""));
        assert!(json.contains("\"cancelled\":1"));
    }
}
