//! Offer subscription registry.
//!
//! The registry is the one piece of shared mutable state across
//! controllers: the set of jobs currently willing to receive offers. A
//! controller only ever touches it through idempotent `add`/`remove`
//! calls; distributing offers to subscribed controllers is the fleet's
//! job.
//!
//! [`SubscriptionManager`] is the per-controller reconciliation component:
//! it tracks whether this controller is registered and converges that
//! toward the desired eligibility, issuing at most one registry call per
//! transition.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use keel_id::JobId;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Subscription key: job identity plus its resident flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegistryKey {
    pub job_id: JobId,
    pub resident: bool,
}

/// Shared fabric interface. Both operations are idempotent and must not
/// block; implementations handle their own locking.
pub trait OfferRegistry: Send + Sync {
    fn add(&self, key: &RegistryKey);
    fn remove(&self, key: &RegistryKey);
}

/// In-process shared registry backed by a mutex-protected set.
#[derive(Debug, Default)]
pub struct SharedOfferRegistry {
    subscribed: Mutex<HashSet<RegistryKey>>,
}

impl SharedOfferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a key is currently subscribed.
    pub fn contains(&self, key: &RegistryKey) -> bool {
        self.lock().contains(key)
    }

    /// All subscribed keys, sorted by job id for deterministic routing.
    pub fn subscribed(&self) -> Vec<RegistryKey> {
        let mut keys: Vec<RegistryKey> = self.lock().iter().copied().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<RegistryKey>> {
        self.subscribed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl OfferRegistry for SharedOfferRegistry {
    fn add(&self, key: &RegistryKey) {
        if self.lock().insert(*key) {
            debug!(job_id = %key.job_id, resident = key.resident, "Registered for offers");
        }
    }

    fn remove(&self, key: &RegistryKey) {
        if self.lock().remove(key) {
            debug!(job_id = %key.job_id, resident = key.resident, "Deregistered from offers");
        }
    }
}

// =============================================================================
// Subscription Manager
// =============================================================================

/// Per-controller registration state, reconciled against desired
/// eligibility after every event that can change it.
pub struct SubscriptionManager {
    key: RegistryKey,
    registry: Arc<dyn OfferRegistry>,
    registered: bool,
}

impl SubscriptionManager {
    pub fn new(key: RegistryKey, registry: Arc<dyn OfferRegistry>) -> Self {
        Self {
            key,
            registry,
            registered: false,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn key(&self) -> RegistryKey {
        self.key
    }

    /// Converges registration toward `desired`. A no-op when already in the
    /// target state, so repeated calls never issue duplicate registry
    /// traffic.
    pub fn reconcile(&mut self, desired: bool) {
        if desired && !self.registered {
            self.registry.add(&self.key);
            self.registered = true;
        } else if !desired && self.registered {
            self.registry.remove(&self.key);
            self.registered = false;
        }
    }

    /// Unconditional deregistration, used on controller stop regardless of
    /// the desired state.
    pub fn deregister(&mut self) {
        self.registry.remove(&self.key);
        self.registered = false;
    }

    /// Replaces the subscription key, deregistering the old one first if it
    /// is currently active. Used when a spec update changes the resident
    /// flag.
    pub fn set_key(&mut self, key: RegistryKey) {
        if self.key == key {
            return;
        }
        if self.registered {
            self.registry.remove(&self.key);
            self.registered = false;
        }
        self.key = key;
    }
}
