//! Launch fleet - owns one controller per job specification.
//!
//! The fleet spawns and stops controllers as job specs come and go, and is
//! the distribution point of the shared offer registry: an incoming offer
//! is delivered only to controllers whose subscription is currently up,
//! one at a time, until one of them accepts it.
//!
//! The fleet performs no restarts. A controller that dies is dropped on
//! the next touch; recovering its in-flight operations is reconciled
//! through the instance directory by the embedding scheduler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use keel_id::JobId;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::controller::{ControllerDeps, LaunchController, LauncherMessage};
use super::framework::{ActorHandle, ActorRef};
use crate::config::Config;
use crate::model::{JobSpec, LaunchDecision, Offer, ProgressReport};
use crate::registry::SharedOfferRegistry;

struct ControllerEntry {
    handle: ActorHandle<LauncherMessage>,
    actor_ref: ActorRef,
}

/// One controller per job spec, plus offer routing.
pub struct LaunchFleet {
    /// The shared fabric; must be the same registry the controllers in
    /// `deps` register with.
    registry: Arc<SharedOfferRegistry>,

    /// Collaborators handed to every spawned controller.
    deps: ControllerDeps,

    config: Config,

    /// Live controllers by job id.
    controllers: HashMap<JobId, ControllerEntry>,
}

impl LaunchFleet {
    pub fn new(deps: ControllerDeps, registry: Arc<SharedOfferRegistry>, config: Config) -> Self {
        Self {
            registry,
            deps,
            config,
            controllers: HashMap::new(),
        }
    }

    /// Spawn a controller for a new job, or forward the spec to the
    /// existing one. Returns the synced progress report when the job was
    /// already managed.
    pub async fn upsert(&mut self, spec: JobSpec) -> Option<ProgressReport> {
        if let Some(entry) = self.controllers.get(&spec.id) {
            if entry.actor_ref.is_running() {
                let (tx, rx) = oneshot::channel();
                let msg = LauncherMessage::SyncSpec {
                    spec: spec.clone(),
                    reply_to: tx,
                };
                if entry.handle.send(msg).await.is_ok() {
                    match rx.await {
                        Ok(report) => return Some(report),
                        Err(_) => warn!(job_id = %spec.id, "Sync reply channel closed"),
                    }
                    return None;
                }
                warn!(job_id = %spec.id, "Controller mailbox closed, respawning");
            }
            self.controllers.remove(&spec.id);
        }

        let job_id = spec.id;
        info!(job_id = %job_id, target = spec.target, "Spawning launch controller");
        let (handle, actor_ref) =
            LaunchController::spawn(spec, self.deps.clone(), self.config.mailbox_capacity);
        self.controllers
            .insert(job_id, ControllerEntry { handle, actor_ref });
        None
    }

    /// Deliver an offer to subscribed controllers, one at a time, until
    /// one accepts. Returns every decision collected along the way.
    pub async fn route_offer(&self, offer: &Offer) -> Vec<LaunchDecision> {
        let mut decisions = Vec::new();

        for key in self.registry.subscribed() {
            let Some(entry) = self.controllers.get(&key.job_id) else {
                debug!(job_id = %key.job_id, "Subscribed job has no live controller, skipping");
                continue;
            };

            let (tx, rx) = oneshot::channel();
            let msg = LauncherMessage::MatchOffer {
                offer: offer.clone(),
                reply_to: tx,
            };
            if entry.handle.send(msg).await.is_err() {
                warn!(job_id = %key.job_id, "Controller mailbox closed while routing offer");
                continue;
            }

            match rx.await {
                Ok(decision) => {
                    let accepted = matches!(decision, LaunchDecision::Accepted { .. });
                    decisions.push(decision);
                    if accepted {
                        // The offer is consumed by the first accepting
                        // controller.
                        break;
                    }
                }
                Err(_) => warn!(job_id = %key.job_id, "Offer response channel closed"),
            }
        }

        decisions
    }

    /// Forward a backoff deadline to a job's controller. Unknown jobs are
    /// logged and dropped.
    pub async fn forward_delay(&self, job_id: JobId, deadline: Option<DateTime<Utc>>) {
        let Some(entry) = self.controllers.get(&job_id) else {
            debug!(job_id = %job_id, "Delay update for unmanaged job, dropping");
            return;
        };
        let msg = LauncherMessage::DelayUpdate { job_id, deadline };
        if entry.handle.send(msg).await.is_err() {
            warn!(job_id = %job_id, "Controller mailbox closed while forwarding delay");
        }
    }

    /// Tell a job's controller that the instance directory changed.
    /// Returns true once the change was acknowledged.
    pub async fn notify_instances_changed(&self, job_id: JobId) -> bool {
        let Some(entry) = self.controllers.get(&job_id) else {
            debug!(job_id = %job_id, "Instance change for unmanaged job, dropping");
            return false;
        };
        let (tx, rx) = oneshot::channel();
        let msg = LauncherMessage::InstancesChanged {
            job_id,
            reply_to: tx,
        };
        if entry.handle.send(msg).await.is_err() {
            return false;
        }
        rx.await.is_ok()
    }

    /// Current launch progress for a job, if it is managed.
    pub async fn progress(&self, job_id: &JobId) -> Option<ProgressReport> {
        let entry = self.controllers.get(job_id)?;
        let (tx, rx) = oneshot::channel();
        entry
            .handle
            .send(LauncherMessage::GetProgress { reply_to: tx })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Stop a job's controller. Returns false when the job was not
    /// managed.
    pub async fn remove(&mut self, job_id: &JobId) -> bool {
        let Some(entry) = self.controllers.remove(job_id) else {
            return false;
        };
        info!(job_id = %job_id, "Stopping launch controller");
        if entry.handle.send(LauncherMessage::Stop).await.is_err() {
            // Already gone; its shutdown path deregistered it.
            debug!(job_id = %job_id, "Controller was already stopped");
        }
        true
    }

    /// Stop every controller, waiting briefly for them to drain before
    /// aborting stragglers.
    pub async fn shutdown(&mut self) {
        info!(controllers = self.controllers.len(), "Shutting down launch fleet");

        let entries: Vec<ControllerEntry> =
            self.controllers.drain().map(|(_, entry)| entry).collect();
        for entry in &entries {
            let _ = entry.handle.send(LauncherMessage::Stop).await;
        }

        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.shutdown_grace_secs);
        while tokio::time::Instant::now() < deadline {
            if entries.iter().all(|e| !e.actor_ref.is_running()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        for entry in &entries {
            if entry.actor_ref.is_running() {
                warn!(actor_id = %entry.actor_ref.actor_id, "Force aborting launch controller");
                entry.actor_ref.abort();
            }
        }

        info!("Launch fleet shutdown complete");
    }

    /// Number of managed controllers.
    pub fn controller_count(&self) -> usize {
        self.controllers.len()
    }

    /// Whether a job currently has a controller.
    pub fn is_managing(&self, job_id: &JobId) -> bool {
        self.controllers.contains_key(job_id)
    }
}

// =============================================================================
// Tests
// =============================================================================
