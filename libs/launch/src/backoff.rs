//! Backoff source.
//!
//! After launch failures a job's new attempts are suppressed until a
//! deadline. The controller never computes that deadline itself: it asks a
//! [`BackoffSource`] and treats the answer as opaque. The shipped
//! [`ExponentialBackoffSource`] derives the deadline from a per-job failure
//! count with multiplicative growth and a cap.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_id::JobId;
use tracing::debug;

use crate::clock::Clock;
use crate::model::JobSpec;

/// Asynchronous provider of launch-suppression deadlines.
#[async_trait]
pub trait BackoffSource: Send + Sync {
    /// The instant before which no new launches for this job may be
    /// attempted. `None` means launching is not suppressed.
    async fn launch_allowed_after(&self, spec: &JobSpec) -> Option<DateTime<Utc>>;
}

/// Exponential backoff keyed by per-job failure counts.
///
/// The delay for `n` recorded failures is `first × factor^(n-1)`, capped at
/// `max`. Zero failures means no window at all. The embedding scheduler
/// calls [`note_failure`](Self::note_failure) on each failed launch and
/// [`reset`](Self::reset) once the job is healthy.
pub struct ExponentialBackoffSource {
    clock: Arc<dyn Clock>,
    first: Duration,
    max: Duration,
    factor: f64,
    failures: Mutex<HashMap<JobId, u32>>,
}

impl ExponentialBackoffSource {
    /// Creates a source with the default policy: 1s first delay, 2.0
    /// growth factor, 1h cap.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_policy(clock, Duration::from_secs(1), Duration::from_secs(3600), 2.0)
    }

    pub fn with_policy(clock: Arc<dyn Clock>, first: Duration, max: Duration, factor: f64) -> Self {
        Self {
            clock,
            first,
            max,
            factor,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Records a failed launch attempt for a job.
    pub fn note_failure(&self, job_id: &JobId) {
        let mut failures = self.lock();
        let count = failures.entry(*job_id).or_insert(0);
        *count += 1;
        debug!(job_id = %job_id, failures = *count, "Recorded launch failure");
    }

    /// Clears a job's failure history, ending suppression.
    pub fn reset(&self, job_id: &JobId) {
        self.lock().remove(job_id);
    }

    /// Recorded failure count for a job.
    pub fn failure_count(&self, job_id: &JobId) -> u32 {
        self.lock().get(job_id).copied().unwrap_or(0)
    }

    fn delay_for(&self, failures: u32) -> Duration {
        // failures >= 1 here; the first failure gets the base delay.
        let exponent = failures.saturating_sub(1).min(63);
        let millis = self.first.as_millis() as f64 * self.factor.powi(exponent as i32);
        let capped = millis.min(self.max.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, u32>> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BackoffSource for ExponentialBackoffSource {
    async fn launch_allowed_after(&self, spec: &JobSpec) -> Option<DateTime<Utc>> {
        let failures = self.failure_count(&spec.id);
        if failures == 0 {
            return None;
        }
        let delay = self.delay_for(failures);
        Some(self.clock.now() + chrono::Duration::milliseconds(delay.as_millis() as i64))
    }
}
