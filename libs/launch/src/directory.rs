//! Instance directory access.
//!
//! The directory is the authoritative record of a job's instances. The
//! controller only ever reads it wholesale: a synchronous snapshot on every
//! sync or change notification. Change notifications themselves arrive
//! through the controller's mailbox, not through this trait.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use keel_id::{InstanceId, JobId};
use tracing::debug;

use crate::clock::Clock;
use crate::model::{Instance, InstanceCondition, JobSpec};

/// Read access to the authoritative instance store.
pub trait InstanceDirectory: Send + Sync {
    /// Point-in-time snapshot of all instances of a job. Must not block.
    fn snapshot(&self, job_id: &JobId) -> Vec<Instance>;
}

/// In-memory directory for embedding schedulers and tests.
///
/// Mints `Scheduled` placeholders up to a job's target count; the
/// controller itself never invents instances.
pub struct InMemoryInstanceDirectory {
    clock: Arc<dyn Clock>,
    inner: Mutex<HashMap<JobId, HashMap<InstanceId, Instance>>>,
}

impl InMemoryInstanceDirectory {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Ensures the job has `spec.target` non-terminal instances, minting
    /// `Scheduled` placeholders for the shortfall.
    pub fn ensure_scheduled(&self, spec: &JobSpec) {
        let mut inner = self.lock();
        let instances = inner.entry(spec.id).or_default();
        let existing = instances
            .values()
            .filter(|i| i.condition != InstanceCondition::Terminal)
            .count() as u32;

        for _ in existing..spec.target {
            let instance = Instance::scheduled(spec.id, self.clock.now());
            instances.insert(instance.id, instance);
        }

        debug!(
            job_id = %spec.id,
            target = spec.target,
            existing,
            "Ensured scheduled placeholders"
        );
    }

    /// Inserts or replaces an instance record.
    pub fn upsert(&self, instance: Instance) {
        self.lock()
            .entry(instance.job_id)
            .or_default()
            .insert(instance.id, instance);
    }

    /// Updates the condition of one instance, if present.
    pub fn set_condition(&self, job_id: &JobId, instance_id: &InstanceId, condition: InstanceCondition) {
        if let Some(instance) = self
            .lock()
            .get_mut(job_id)
            .and_then(|m| m.get_mut(instance_id))
        {
            instance.condition = condition;
            instance.since = self.clock.now();
        }
    }

    /// Removes an instance record.
    pub fn remove(&self, job_id: &JobId, instance_id: &InstanceId) {
        if let Some(instances) = self.lock().get_mut(job_id) {
            instances.remove(instance_id);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, HashMap<InstanceId, Instance>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl InstanceDirectory for InMemoryInstanceDirectory {
    fn snapshot(&self, job_id: &JobId) -> Vec<Instance> {
        let mut instances: Vec<Instance> = self
            .lock()
            .get(job_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        // Deterministic order for callers that iterate.
        instances.sort_by_key(|i| i.id);
        instances
    }
}
