//! Operation counters owned by each manager instance.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Snapshot of a manager's operation counters
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpMetrics {
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    /// Running mean of operation latency in milliseconds
    pub avg_operation_ms: f64,
}

impl OpMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.total_operations == 0 {
            return 0.0;
        }
        self.successful_operations as f64 / self.total_operations as f64 * 100.0
    }
}

/// Shared, mutex-protected recorder behind [`OpMetrics`].
///
/// Cloning shares the counters; constructing a new recorder starts from zero.
#[derive(Debug, Clone, Default)]
pub struct OpRecorder {
    inner: Arc<Mutex<OpMetrics>>,
}

impl OpRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self) -> MutexGuard<'_, OpMetrics> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn record(&self, success: bool, elapsed: Duration) {
        let mut metrics = self.counters();
        metrics.total_operations += 1;
        if success {
            metrics.successful_operations += 1;
        } else {
            metrics.failed_operations += 1;
        }
        let n = metrics.total_operations as f64;
        let ms = elapsed.as_secs_f64() * 1000.0;
        metrics.avg_operation_ms += (ms - metrics.avg_operation_ms) / n;
    }

    /// Record the outcome of `result`, timed from `started`.
    pub fn observe<T, E>(&self, started: Instant, result: &Result<T, E>) {
        self.record(result.is_ok(), started.elapsed());
    }

    pub fn snapshot(&self) -> OpMetrics {
        *self.counters()
    }
}
