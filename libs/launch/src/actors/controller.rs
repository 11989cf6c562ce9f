//! Launch controller actor - drives launching for a single job spec.
//!
//! One controller exists per job specification. It owns a local copy of the
//! job's instance set, the current backoff window, and its subscription to
//! the shared offer registry, and it mutates nothing but its own state.
//!
//! ## State Machine
//!
//! ```text
//! awaiting_delay -> active -> stopped
//!       ^             |
//!       +-------------+  (material spec update: deregister, clear the
//!                         window, request a fresh delay)
//! ```
//!
//! While awaiting the initial delay, every message except the matching
//! delay response is buffered in arrival order and replayed exactly once on
//! activation. Offers are matched strictly one at a time on the mailbox, so
//! each offer's response channel resolves exactly once and never races a
//! later offer.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_id::JobId;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::framework::{self, Actor, ActorContext, ActorError, ActorHandle, ActorRef};
use crate::backoff::BackoffSource;
use crate::clock::Clock;
use crate::decision::{Decision, MatchRequest, OfferDecider};
use crate::directory::InstanceDirectory;
use crate::model::{
    Instance, InstanceCondition, JobSpec, LaunchDecision, NoMatchReason, Offer, ProgressReport,
};
use crate::outcome::{MatchOutcome, MatchOutcomeSink};
use crate::registry::{OfferRegistry, RegistryKey, SubscriptionManager};

// =============================================================================
// Messages
// =============================================================================

/// Messages handled by the launch controller.
#[derive(Debug)]
pub enum LauncherMessage {
    /// Apply a (possibly updated) job specification.
    SyncSpec {
        spec: JobSpec,
        reply_to: oneshot::Sender<ProgressReport>,
    },

    /// Read the current launch progress.
    GetProgress {
        reply_to: oneshot::Sender<ProgressReport>,
    },

    /// Backoff deadline from the backoff source. Ignored when `job_id`
    /// does not match the held spec.
    DelayUpdate {
        job_id: JobId,
        deadline: Option<DateTime<Utc>>,
    },

    /// The instance directory changed for this job.
    InstancesChanged {
        job_id: JobId,
        reply_to: oneshot::Sender<()>,
    },

    /// Match one resource offer; always resolves `reply_to` exactly once.
    MatchOffer {
        offer: Offer,
        reply_to: oneshot::Sender<LaunchDecision>,
    },

    /// Backoff recheck timer fired. Stale generations are dropped.
    RecheckBackoff { generation: u64 },

    /// Stop the controller.
    Stop,
}

impl LauncherMessage {
    fn kind(&self) -> &'static str {
        match self {
            LauncherMessage::SyncSpec { .. } => "sync-spec",
            LauncherMessage::GetProgress { .. } => "get-progress",
            LauncherMessage::DelayUpdate { .. } => "delay-update",
            LauncherMessage::InstancesChanged { .. } => "instances-changed",
            LauncherMessage::MatchOffer { .. } => "match-offer",
            LauncherMessage::RecheckBackoff { .. } => "recheck-backoff",
            LauncherMessage::Stop => "stop",
        }
    }
}

// =============================================================================
// Collaborators
// =============================================================================

/// External collaborators handed to every controller.
#[derive(Clone)]
pub struct ControllerDeps {
    pub clock: Arc<dyn Clock>,
    pub directory: Arc<dyn InstanceDirectory>,
    pub backoff: Arc<dyn BackoffSource>,
    pub decider: Arc<dyn OfferDecider>,
    pub outcomes: Arc<dyn MatchOutcomeSink>,
    pub registry: Arc<dyn OfferRegistry>,
}

// =============================================================================
// Controller State
// =============================================================================

#[derive(Debug)]
enum ControllerState {
    /// Waiting for the backoff source's answer; everything else is parked
    /// in `buffered`.
    AwaitingDelay { buffered: VecDeque<LauncherMessage> },

    /// Steady state: matching offers and reconciling the subscription.
    Active,

    /// Terminal.
    Stopped,
}

// =============================================================================
// Launch Controller
// =============================================================================

/// Actor driving launches for one job specification.
pub struct LaunchController {
    /// The job spec currently held.
    spec: JobSpec,

    /// Lifecycle state, including the init buffer.
    state: ControllerState,

    /// Local copy of the job's instances. Replaced wholesale from the
    /// directory on sync/change; the offer-accept path patches a single
    /// entry optimistically.
    instances: HashMap<keel_id::InstanceId, Instance>,

    /// Current backoff deadline; `None` means no suppression.
    back_off_until: Option<DateTime<Utc>>,

    /// When this controller started.
    started_at: DateTime<Utc>,

    /// Registration state against the shared offer registry.
    subscription: SubscriptionManager,

    /// Pending backoff recheck timer; at most one exists at a time.
    recheck_timer: Option<JoinHandle<()>>,

    /// Bumped whenever the timer is cancelled or re-armed, so a recheck
    /// from a superseded timer can be recognized and dropped.
    timer_generation: u64,

    /// Sender to this controller's own mailbox, for timer callbacks and
    /// the asynchronous delay response.
    self_tx: mpsc::Sender<LauncherMessage>,

    clock: Arc<dyn Clock>,
    directory: Arc<dyn InstanceDirectory>,
    backoff: Arc<dyn BackoffSource>,
    decider: Arc<dyn OfferDecider>,
    outcomes: Arc<dyn MatchOutcomeSink>,
}

impl LaunchController {
    /// Spawn a controller for `spec` on its own mailbox task.
    pub fn spawn(
        spec: JobSpec,
        deps: ControllerDeps,
        mailbox_capacity: usize,
    ) -> (ActorHandle<LauncherMessage>, ActorRef) {
        let (tx, rx) = mpsc::channel(mailbox_capacity);
        let controller = Self::new(spec, deps, tx.clone());
        framework::spawn_on(controller, tx, rx)
    }

    fn new(spec: JobSpec, deps: ControllerDeps, self_tx: mpsc::Sender<LauncherMessage>) -> Self {
        let key = RegistryKey {
            job_id: spec.id,
            resident: spec.resident,
        };
        let started_at = deps.clock.now();

        Self {
            spec,
            state: ControllerState::AwaitingDelay {
                buffered: VecDeque::new(),
            },
            instances: HashMap::new(),
            back_off_until: None,
            started_at,
            subscription: SubscriptionManager::new(key, deps.registry),
            recheck_timer: None,
            timer_generation: 0,
            self_tx,
            clock: deps.clock,
            directory: deps.directory,
            backoff: deps.backoff,
            decider: deps.decider,
            outcomes: deps.outcomes,
        }
    }

    // -------------------------------------------------------------------------
    // Message Handlers
    // -------------------------------------------------------------------------

    fn handle_sync(&mut self, spec: JobSpec, reply_to: oneshot::Sender<ProgressReport>) {
        if spec.id != self.spec.id {
            warn!(
                job_id = %spec.id,
                held = %self.spec.id,
                "Spec sync for another job, ignoring"
            );
            respond(reply_to, self.progress_report(), "sync");
            return;
        }

        let material = self.spec.materially_differs(&spec);
        self.spec = spec;
        self.subscription.set_key(RegistryKey {
            job_id: self.spec.id,
            resident: self.spec.resident,
        });
        self.refresh_instances();

        if material {
            info!(
                job_id = %self.spec.id,
                version = self.spec.version,
                "Material spec change, suspending matching until a fresh delay arrives"
            );
            // The old window was computed for the previous version.
            self.subscription.reconcile(false);
            self.back_off_until = None;
            self.cancel_recheck_timer();
            self.state = ControllerState::AwaitingDelay {
                buffered: VecDeque::new(),
            };
            self.request_delay();
        } else {
            self.reconcile_subscription();
        }

        respond(reply_to, self.progress_report(), "sync");
    }

    fn handle_delay_update(&mut self, job_id: JobId, deadline: Option<DateTime<Utc>>) {
        if job_id != self.spec.id {
            debug!(
                job_id = %job_id,
                held = %self.spec.id,
                "Delay update for another job, discarding"
            );
            return;
        }
        self.apply_deadline(deadline);
        self.reconcile_subscription();
    }

    fn handle_instances_changed(&mut self, job_id: JobId, reply_to: oneshot::Sender<()>) {
        if job_id != self.spec.id {
            debug!(
                job_id = %job_id,
                held = %self.spec.id,
                "Instance change for another job, dropping"
            );
            respond(reply_to, (), "instance change ack");
            return;
        }
        self.refresh_instances();
        self.reconcile_subscription();
        respond(reply_to, (), "instance change ack");
    }

    fn handle_match_offer(&mut self, offer: Offer, reply_to: oneshot::Sender<LaunchDecision>) {
        // Ineligible controllers reject outright, without consulting the
        // decision function.
        if !self.eligible() {
            debug!(
                job_id = %self.spec.id,
                offer_id = %offer.id,
                left = self.scheduled_count(),
                back_off_until = ?self.back_off_until,
                "Not accepting offers, rejecting without evaluation"
            );
            respond(
                reply_to,
                LaunchDecision::NoMatch {
                    reason: NoMatchReason::NotEligible,
                },
                "offer",
            );
            return;
        }

        let reachable: Vec<&Instance> = self
            .instances
            .values()
            .filter(|i| i.condition.is_reachable())
            .collect();
        let scheduled: Vec<&Instance> = reachable
            .iter()
            .copied()
            .filter(|i| i.condition == InstanceCondition::Scheduled)
            .collect();
        let request = MatchRequest {
            spec: &self.spec,
            offer: &offer,
            reachable,
            scheduled,
        };

        let decision = match self.decider.decide(&request) {
            Ok(decision) => decision,
            Err(e) => {
                // Scoped to this offer only; the local set stays intact and
                // the next offer is evaluated normally.
                warn!(
                    job_id = %self.spec.id,
                    offer_id = %offer.id,
                    error = %e,
                    "Offer decision failed, treating as no match"
                );
                Decision::NoMatch {
                    reason: NoMatchReason::DeciderFailed,
                }
            }
        };

        match decision {
            Decision::Launch(operation) => {
                self.outcomes.record(&MatchOutcome {
                    job_id: self.spec.id,
                    offer_id: offer.id,
                    agent_id: offer.agent_id,
                    matched: true,
                    reason: None,
                    decided_at: self.clock.now(),
                });

                // Optimistic patch: the directory confirms asynchronously,
                // and without this a second offer could be matched against
                // the same Scheduled instance.
                if let Some(instance) = self.instances.get_mut(&operation.instance_id) {
                    instance.condition = InstanceCondition::Provisioned;
                    instance.agent_id = Some(operation.agent_id);
                }
                self.reconcile_subscription();

                info!(
                    job_id = %self.spec.id,
                    instance_id = %operation.instance_id,
                    offer_id = %operation.offer_id,
                    agent_id = %operation.agent_id,
                    "Accepted offer"
                );
                respond(
                    reply_to,
                    LaunchDecision::Accepted {
                        operation,
                        origin: self.spec.id,
                    },
                    "offer",
                );
            }

            Decision::NoMatch { reason } => {
                self.outcomes.record(&MatchOutcome {
                    job_id: self.spec.id,
                    offer_id: offer.id,
                    agent_id: offer.agent_id,
                    matched: false,
                    reason: Some(reason),
                    decided_at: self.clock.now(),
                });

                debug!(
                    job_id = %self.spec.id,
                    offer_id = %offer.id,
                    reason = ?reason,
                    "No match for offer"
                );
                respond(reply_to, LaunchDecision::NoMatch { reason }, "offer");
            }
        }
    }

    fn handle_recheck(&mut self, generation: u64) {
        if generation != self.timer_generation {
            debug!(
                job_id = %self.spec.id,
                generation,
                current = self.timer_generation,
                "Stale backoff recheck, dropping"
            );
            return;
        }
        self.recheck_timer = None;
        debug!(job_id = %self.spec.id, "Backoff recheck fired");
        self.reconcile_subscription();
    }

    // -------------------------------------------------------------------------
    // State Transitions
    // -------------------------------------------------------------------------

    /// Enter the active state and drain the init buffer exactly once, in
    /// arrival order. The triggering delay response itself is consumed
    /// here and never re-buffered.
    fn activate(
        &mut self,
        deadline: Option<DateTime<Utc>>,
        buffered: VecDeque<LauncherMessage>,
    ) -> bool {
        self.apply_deadline(deadline);
        info!(
            job_id = %self.spec.id,
            buffered = buffered.len(),
            back_off_until = ?self.back_off_until,
            "Delay received, entering active state"
        );
        self.reconcile_subscription();

        for msg in buffered {
            // A material re-sync inside the replay re-opens the init
            // buffer; everything behind it belongs to the new wait.
            if matches!(self.state, ControllerState::AwaitingDelay { .. }) {
                self.push_buffered(msg);
                continue;
            }
            if !self.process(msg) {
                return false;
            }
        }
        true
    }

    /// Steady-state message processing. Returns false when the controller
    /// should stop.
    fn process(&mut self, msg: LauncherMessage) -> bool {
        match msg {
            LauncherMessage::SyncSpec { spec, reply_to } => {
                self.handle_sync(spec, reply_to);
            }
            LauncherMessage::GetProgress { reply_to } => {
                respond(reply_to, self.progress_report(), "progress");
            }
            LauncherMessage::DelayUpdate { job_id, deadline } => {
                self.handle_delay_update(job_id, deadline);
            }
            LauncherMessage::InstancesChanged { job_id, reply_to } => {
                self.handle_instances_changed(job_id, reply_to);
            }
            LauncherMessage::MatchOffer { offer, reply_to } => {
                self.handle_match_offer(offer, reply_to);
            }
            LauncherMessage::RecheckBackoff { generation } => {
                self.handle_recheck(generation);
            }
            LauncherMessage::Stop => {
                self.finalize();
                return false;
            }
        }
        true
    }

    /// Tear down on stop: resolve anything parked in the init buffer,
    /// cancel the timer, report in-flight operations, and deregister
    /// unconditionally. Does not block on in-flight launches.
    fn finalize(&mut self) {
        if matches!(self.state, ControllerState::Stopped) {
            return;
        }

        for msg in self.take_buffer() {
            self.resolve_pending(msg);
        }
        self.cancel_recheck_timer();

        let in_flight: Vec<String> = self
            .instances
            .values()
            .filter(|i| i.condition == InstanceCondition::Provisioned)
            .map(|i| i.id.to_string())
            .collect();
        if !in_flight.is_empty() {
            info!(
                job_id = %self.spec.id,
                in_flight = ?in_flight,
                "Stopping with launch operations still in flight"
            );
        }

        self.subscription.deregister();
        self.state = ControllerState::Stopped;
        info!(job_id = %self.spec.id, "Launch controller stopped");
    }

    /// Resolve a buffered message's reply channel during teardown, so no
    /// caller is left with a silently dropped response.
    fn resolve_pending(&self, msg: LauncherMessage) {
        match msg {
            LauncherMessage::SyncSpec { reply_to, .. } => {
                respond(reply_to, self.progress_report(), "sync");
            }
            LauncherMessage::GetProgress { reply_to } => {
                respond(reply_to, self.progress_report(), "progress");
            }
            LauncherMessage::InstancesChanged { reply_to, .. } => {
                respond(reply_to, (), "instance change ack");
            }
            LauncherMessage::MatchOffer { offer, reply_to } => {
                debug!(
                    job_id = %self.spec.id,
                    offer_id = %offer.id,
                    "Rejecting buffered offer on stop"
                );
                respond(
                    reply_to,
                    LaunchDecision::NoMatch {
                        reason: NoMatchReason::NotEligible,
                    },
                    "offer",
                );
            }
            LauncherMessage::DelayUpdate { .. }
            | LauncherMessage::RecheckBackoff { .. }
            | LauncherMessage::Stop => {}
        }
    }

    // -------------------------------------------------------------------------
    // Backoff Timer
    // -------------------------------------------------------------------------

    /// Replace the backoff deadline. Unchanged deadlines are a no-op; a
    /// changed one always cancels the pending recheck timer and, when the
    /// deadline lies in the future, arms a fresh one for exactly the
    /// remaining duration.
    fn apply_deadline(&mut self, deadline: Option<DateTime<Utc>>) {
        if deadline == self.back_off_until {
            debug!(job_id = %self.spec.id, deadline = ?deadline, "Backoff deadline unchanged");
            return;
        }

        self.back_off_until = deadline;
        self.cancel_recheck_timer();

        if let Some(until) = deadline {
            let remaining = until - self.clock.now();
            if remaining > chrono::Duration::zero() {
                self.arm_recheck_timer(remaining);
            }
        }
    }

    fn arm_recheck_timer(&mut self, remaining: chrono::Duration) {
        let generation = self.timer_generation;
        let delay = remaining.to_std().unwrap_or_default();
        let tx = self.self_tx.clone();
        let job_id = self.spec.id;

        debug!(
            job_id = %job_id,
            delay_ms = delay.as_millis() as u64,
            generation,
            "Arming backoff recheck timer"
        );

        self.recheck_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx
                .send(LauncherMessage::RecheckBackoff { generation })
                .await
                .is_err()
            {
                debug!(job_id = %job_id, "Controller gone before backoff recheck fired");
            }
        }));
    }

    fn cancel_recheck_timer(&mut self) {
        self.timer_generation += 1;
        if let Some(timer) = self.recheck_timer.take() {
            timer.abort();
        }
    }

    // -------------------------------------------------------------------------
    // Bookkeeping
    // -------------------------------------------------------------------------

    /// Ask the backoff source for this spec's deadline; the answer comes
    /// back through the mailbox as a `DelayUpdate`.
    fn request_delay(&self) {
        let spec = self.spec.clone();
        let backoff = Arc::clone(&self.backoff);
        let tx = self.self_tx.clone();

        tokio::spawn(async move {
            let deadline = backoff.launch_allowed_after(&spec).await;
            let msg = LauncherMessage::DelayUpdate {
                job_id: spec.id,
                deadline,
            };
            if tx.send(msg).await.is_err() {
                debug!(job_id = %spec.id, "Controller gone before delay response arrived");
            }
        });
    }

    /// Replace the local instance set with a fresh directory snapshot.
    fn refresh_instances(&mut self) {
        let snapshot = self.directory.snapshot(&self.spec.id);
        self.instances = snapshot.into_iter().map(|i| (i.id, i)).collect();
        debug!(
            job_id = %self.spec.id,
            total = self.instances.len(),
            scheduled = self.scheduled_count(),
            "Instance set refreshed"
        );
    }

    /// Eligible iff something is left to launch and no backoff window is
    /// active. This is also the subscription predicate.
    fn eligible(&self) -> bool {
        self.scheduled_count() > 0
            && self
                .back_off_until
                .map_or(true, |until| self.clock.now() >= until)
    }

    fn reconcile_subscription(&mut self) {
        let desired = self.eligible();
        self.subscription.reconcile(desired);
    }

    fn scheduled_count(&self) -> u32 {
        self.count_condition(InstanceCondition::Scheduled)
    }

    fn count_condition(&self, condition: InstanceCondition) -> u32 {
        self.instances
            .values()
            .filter(|i| i.condition == condition)
            .count() as u32
    }

    fn progress_report(&self) -> ProgressReport {
        let left = self.scheduled_count();
        let in_flight = self.count_condition(InstanceCondition::Provisioned);
        let active = self
            .instances
            .values()
            .filter(|i| i.condition.is_active())
            .count() as u32;

        ProgressReport {
            job_id: self.spec.id,
            instances_left_to_launch: left,
            instances_in_flight: in_flight,
            instances_active: active,
            final_instance_count: self.spec.target,
            back_off_until: self.back_off_until,
            started_at: self.started_at,
            in_progress: left > 0 || in_flight > 0,
        }
    }

    fn take_buffer(&mut self) -> VecDeque<LauncherMessage> {
        match &mut self.state {
            ControllerState::AwaitingDelay { buffered } => std::mem::take(buffered),
            _ => VecDeque::new(),
        }
    }

    fn push_buffered(&mut self, msg: LauncherMessage) {
        if let ControllerState::AwaitingDelay { buffered } = &mut self.state {
            buffered.push_back(msg);
        }
    }
}

#[async_trait]
impl Actor for LaunchController {
    type Message = LauncherMessage;

    fn name(&self) -> &str {
        "launch-controller"
    }

    async fn handle(
        &mut self,
        msg: LauncherMessage,
        _ctx: &mut ActorContext,
    ) -> Result<bool, ActorError> {
        if !matches!(self.state, ControllerState::AwaitingDelay { .. }) {
            return Ok(self.process(msg));
        }

        match msg {
            LauncherMessage::DelayUpdate { job_id, deadline } if job_id == self.spec.id => {
                let buffered = self.take_buffer();
                self.state = ControllerState::Active;
                Ok(self.activate(deadline, buffered))
            }
            LauncherMessage::DelayUpdate { job_id, .. } => {
                debug!(
                    job_id = %job_id,
                    held = %self.spec.id,
                    "Delay update for another job, discarding"
                );
                Ok(true)
            }
            LauncherMessage::Stop => {
                self.finalize();
                Ok(false)
            }
            other => {
                debug!(
                    job_id = %self.spec.id,
                    kind = other.kind(),
                    "Buffering message until the initial delay arrives"
                );
                self.push_buffered(other);
                Ok(true)
            }
        }
    }

    async fn on_start(&mut self, _ctx: &mut ActorContext) -> Result<(), ActorError> {
        self.refresh_instances();
        self.request_delay();
        info!(
            job_id = %self.spec.id,
            target = self.spec.target,
            instances = self.instances.len(),
            "Launch controller starting"
        );
        Ok(())
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext) {
        self.finalize();
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn respond<T: Debug>(reply_to: oneshot::Sender<T>, value: T, what: &'static str) {
    if reply_to.send(value).is_err() {
        debug!(reply = what, "Reply receiver dropped");
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::decision::{DecisionError, FirstFitDecider};
    use crate::directory::InMemoryInstanceDirectory;
    use crate::model::ResourceShape;
    use crate::outcome::InMemoryOutcomeSink;
    use crate::registry::SharedOfferRegistry;
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::watch;

    /// Backoff source that never answers; tests drive activation by
    /// sending `DelayUpdate` themselves.
    struct SilentBackoff;

    #[async_trait]
    impl BackoffSource for SilentBackoff {
        async fn launch_allowed_after(&self, _spec: &JobSpec) -> Option<DateTime<Utc>> {
            std::future::pending::<()>().await;
            None
        }
    }

    /// Decider that counts invocations before delegating to first-fit.
    #[derive(Default)]
    struct CountingDecider {
        calls: AtomicUsize,
    }

    impl OfferDecider for CountingDecider {
        fn decide(&self, request: &MatchRequest<'_>) -> Result<Decision, DecisionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            FirstFitDecider.decide(request)
        }
    }

    /// Decider that always fails.
    struct FailingDecider;

    impl OfferDecider for FailingDecider {
        fn decide(&self, _request: &MatchRequest<'_>) -> Result<Decision, DecisionError> {
            Err(DecisionError::Internal("boom".to_string()))
        }
    }

    struct Harness {
        controller: LaunchController,
        ctx: ActorContext,
        clock: ManualClock,
        registry: Arc<SharedOfferRegistry>,
        directory: Arc<InMemoryInstanceDirectory>,
        outcomes: Arc<InMemoryOutcomeSink>,
        decider_calls: Arc<CountingDecider>,
        spec: JobSpec,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn test_spec(target: u32) -> JobSpec {
        JobSpec {
            id: JobId::new(),
            version: 1,
            target,
            resources: ResourceShape {
                cpus: 1.0,
                mem_mb: 512,
                disk_mb: 0,
            },
            placement: vec![],
            resident: false,
            labels: BTreeMap::new(),
        }
    }

    fn test_offer(resources: ResourceShape) -> Offer {
        Offer {
            id: keel_id::OfferId::new(),
            agent_id: keel_id::AgentId::new(),
            hostname: "agent-1.example".to_string(),
            resources,
            attributes: BTreeMap::new(),
        }
    }

    fn fitting_offer() -> Offer {
        test_offer(ResourceShape {
            cpus: 4.0,
            mem_mb: 4096,
            disk_mb: 0,
        })
    }

    fn harness(target: u32) -> Harness {
        harness_with_decider(target, None)
    }

    fn harness_with_decider(target: u32, decider: Option<Arc<dyn OfferDecider>>) -> Harness {
        let clock = ManualClock::at(t0());
        let registry = Arc::new(SharedOfferRegistry::new());
        let directory = Arc::new(InMemoryInstanceDirectory::new(Arc::new(clock.clone())));
        let outcomes = Arc::new(InMemoryOutcomeSink::new());
        let decider_calls = Arc::new(CountingDecider::default());

        let spec = test_spec(target);
        directory.ensure_scheduled(&spec);

        let deps = ControllerDeps {
            clock: Arc::new(clock.clone()),
            directory: directory.clone(),
            backoff: Arc::new(SilentBackoff),
            decider: decider.unwrap_or_else(|| decider_calls.clone()),
            outcomes: outcomes.clone(),
            registry: registry.clone(),
        };

        let (tx, _rx) = mpsc::channel(16);
        let mut controller = LaunchController::new(spec.clone(), deps, tx);
        controller.refresh_instances();

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = ActorContext::new("test".to_string(), shutdown_rx);

        Harness {
            controller,
            ctx,
            clock,
            registry,
            directory,
            outcomes,
            decider_calls,
            spec,
        }
    }

    fn registry_key(spec: &JobSpec) -> RegistryKey {
        RegistryKey {
            job_id: spec.id,
            resident: spec.resident,
        }
    }

    async fn activate_now(h: &mut Harness) {
        let msg = LauncherMessage::DelayUpdate {
            job_id: h.spec.id,
            deadline: None,
        };
        assert!(h.controller.handle(msg, &mut h.ctx).await.unwrap());
    }

    async fn match_offer(h: &mut Harness, offer: Offer) -> LaunchDecision {
        let (tx, rx) = oneshot::channel();
        let msg = LauncherMessage::MatchOffer {
            offer,
            reply_to: tx,
        };
        assert!(h.controller.handle(msg, &mut h.ctx).await.unwrap());
        rx.await.expect("offer must resolve")
    }

    async fn progress(h: &mut Harness) -> ProgressReport {
        let (tx, rx) = oneshot::channel();
        let msg = LauncherMessage::GetProgress { reply_to: tx };
        assert!(h.controller.handle(msg, &mut h.ctx).await.unwrap());
        rx.await.expect("progress must resolve")
    }

    #[tokio::test]
    async fn test_buffers_until_delay_then_drains_once() {
        let mut h = harness(2);

        // Parked while awaiting the delay.
        let (tx, mut rx) = oneshot::channel();
        let msg = LauncherMessage::GetProgress { reply_to: tx };
        assert!(h.controller.handle(msg, &mut h.ctx).await.unwrap());
        assert!(rx.try_recv().is_err());
        assert!(!h.registry.contains(&registry_key(&h.spec)));

        // The matching delay response activates and replays the buffer.
        activate_now(&mut h).await;
        let report = rx.await.unwrap();
        assert_eq!(report.instances_left_to_launch, 2);
        assert!(report.in_progress);
        assert!(h.registry.contains(&registry_key(&h.spec)));
    }

    #[tokio::test]
    async fn test_mismatched_delay_never_activates() {
        let mut h = harness(2);

        let msg = LauncherMessage::DelayUpdate {
            job_id: JobId::new(),
            deadline: None,
        };
        assert!(h.controller.handle(msg, &mut h.ctx).await.unwrap());
        assert!(matches!(
            h.controller.state,
            ControllerState::AwaitingDelay { .. }
        ));
        assert!(!h.registry.contains(&registry_key(&h.spec)));
    }

    #[tokio::test]
    async fn test_backoff_window_blocks_offers_without_consulting_decider() {
        let mut h = harness(2);
        let deadline = t0() + chrono::Duration::seconds(5);
        let msg = LauncherMessage::DelayUpdate {
            job_id: h.spec.id,
            deadline: Some(deadline),
        };
        assert!(h.controller.handle(msg, &mut h.ctx).await.unwrap());

        // Window active: rejected outright, decider untouched.
        let decision = match_offer(&mut h, fitting_offer()).await;
        assert!(matches!(
            decision,
            LaunchDecision::NoMatch {
                reason: NoMatchReason::NotEligible
            }
        ));
        assert_eq!(h.decider_calls.calls.load(Ordering::SeqCst), 0);
        assert!(!h.registry.contains(&registry_key(&h.spec)));

        // At the deadline, offers are evaluated normally again.
        h.clock.advance(chrono::Duration::seconds(5));
        let decision = match_offer(&mut h, fitting_offer()).await;
        assert!(matches!(decision, LaunchDecision::Accepted { .. }));
        assert_eq!(h.decider_calls.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_accept_patches_instance_and_reports_progress() {
        let mut h = harness(2);
        activate_now(&mut h).await;

        let decision = match_offer(&mut h, fitting_offer()).await;
        let operation = match decision {
            LaunchDecision::Accepted { operation, origin } => {
                assert_eq!(origin, h.spec.id);
                operation
            }
            other => panic!("expected accept, got {other:?}"),
        };

        let report = progress(&mut h).await;
        assert_eq!(report.instances_left_to_launch, 1);
        assert_eq!(report.instances_in_flight, 1);
        assert_eq!(report.final_instance_count, 2);
        assert!(report.in_progress);

        // The accepted instance is Provisioned locally before the
        // directory has heard anything.
        assert_eq!(
            h.controller.instances[&operation.instance_id].condition,
            InstanceCondition::Provisioned
        );
        let outcomes = h.outcomes.recorded();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].matched);

        // One Scheduled instance remains, so the subscription stays up.
        assert!(h.registry.contains(&registry_key(&h.spec)));
    }

    #[tokio::test]
    async fn test_last_accept_deregisters_even_without_backoff() {
        let mut h = harness(1);
        activate_now(&mut h).await;
        assert!(h.registry.contains(&registry_key(&h.spec)));

        let decision = match_offer(&mut h, fitting_offer()).await;
        assert!(matches!(decision, LaunchDecision::Accepted { .. }));

        // Nothing left to launch: deregistered despite no backoff window.
        assert!(!h.registry.contains(&registry_key(&h.spec)));
        let report = progress(&mut h).await;
        assert_eq!(report.instances_left_to_launch, 0);
        assert!(report.in_progress); // one launch still in flight
    }

    #[tokio::test]
    async fn test_decider_failure_is_scoped_to_the_offer() {
        let mut h = harness_with_decider(2, Some(Arc::new(FailingDecider)));
        activate_now(&mut h).await;

        let decision = match_offer(&mut h, fitting_offer()).await;
        assert!(matches!(
            decision,
            LaunchDecision::NoMatch {
                reason: NoMatchReason::DeciderFailed
            }
        ));

        // Local set untouched, outcome recorded as no-match.
        let report = progress(&mut h).await;
        assert_eq!(report.instances_left_to_launch, 2);
        assert_eq!(report.instances_in_flight, 0);
        let outcomes = h.outcomes.recorded();
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].matched);
    }

    #[tokio::test]
    async fn test_material_sync_reenters_awaiting_delay() {
        let mut h = harness(2);
        activate_now(&mut h).await;
        assert!(h.registry.contains(&registry_key(&h.spec)));

        let mut updated = h.spec.clone();
        updated.version = 2;
        updated.resources.mem_mb = 2048;

        let (tx, rx) = oneshot::channel();
        let msg = LauncherMessage::SyncSpec {
            spec: updated.clone(),
            reply_to: tx,
        };
        assert!(h.controller.handle(msg, &mut h.ctx).await.unwrap());
        let report = rx.await.unwrap();
        assert_eq!(report.back_off_until, None);

        // Suspended: deregistered, window cleared, offers buffered again.
        assert!(!h.registry.contains(&registry_key(&h.spec)));
        assert!(matches!(
            h.controller.state,
            ControllerState::AwaitingDelay { .. }
        ));

        let (tx, mut rx) = oneshot::channel();
        let msg = LauncherMessage::MatchOffer {
            offer: fitting_offer(),
            reply_to: tx,
        };
        assert!(h.controller.handle(msg, &mut h.ctx).await.unwrap());
        assert!(rx.try_recv().is_err());

        // Fresh delay arrives: buffered offer is replayed exactly once.
        let msg = LauncherMessage::DelayUpdate {
            job_id: h.spec.id,
            deadline: None,
        };
        assert!(h.controller.handle(msg, &mut h.ctx).await.unwrap());
        assert!(matches!(rx.await.unwrap(), LaunchDecision::Accepted { .. }));
        assert!(h.registry.contains(&registry_key(&h.spec)));
    }

    #[tokio::test]
    async fn test_non_material_sync_keeps_running() {
        let mut h = harness(2);
        let deadline = t0() + chrono::Duration::seconds(30);
        let msg = LauncherMessage::DelayUpdate {
            job_id: h.spec.id,
            deadline: Some(deadline),
        };
        assert!(h.controller.handle(msg, &mut h.ctx).await.unwrap());

        let mut updated = h.spec.clone();
        updated.version = 2;
        updated
            .labels
            .insert("team".to_string(), "storage".to_string());

        let (tx, rx) = oneshot::channel();
        let msg = LauncherMessage::SyncSpec {
            spec: updated,
            reply_to: tx,
        };
        assert!(h.controller.handle(msg, &mut h.ctx).await.unwrap());
        let report = rx.await.unwrap();

        // Still active; the existing window survives a non-material bump.
        assert!(matches!(h.controller.state, ControllerState::Active));
        assert_eq!(report.back_off_until, Some(deadline));
    }

    #[tokio::test]
    async fn test_stale_recheck_generation_is_dropped() {
        let mut h = harness(2);
        let first = t0() + chrono::Duration::seconds(10);
        let msg = LauncherMessage::DelayUpdate {
            job_id: h.spec.id,
            deadline: Some(first),
        };
        assert!(h.controller.handle(msg, &mut h.ctx).await.unwrap());
        let stale_generation = h.controller.timer_generation;
        assert!(h.controller.recheck_timer.is_some());

        // Re-arm with a later deadline; the first timer is superseded.
        let second = t0() + chrono::Duration::seconds(60);
        let msg = LauncherMessage::DelayUpdate {
            job_id: h.spec.id,
            deadline: Some(second),
        };
        assert!(h.controller.handle(msg, &mut h.ctx).await.unwrap());
        assert_ne!(h.controller.timer_generation, stale_generation);

        // A recheck from the superseded timer must not clear the new one.
        h.clock.advance(chrono::Duration::seconds(60));
        let msg = LauncherMessage::RecheckBackoff {
            generation: stale_generation,
        };
        assert!(h.controller.handle(msg, &mut h.ctx).await.unwrap());
        assert!(h.controller.recheck_timer.is_some());
        assert!(!h.registry.contains(&registry_key(&h.spec)));

        // The current generation performs the re-evaluation.
        let msg = LauncherMessage::RecheckBackoff {
            generation: h.controller.timer_generation,
        };
        assert!(h.controller.handle(msg, &mut h.ctx).await.unwrap());
        assert!(h.registry.contains(&registry_key(&h.spec)));
    }

    #[tokio::test]
    async fn test_instance_change_refreshes_wholesale() {
        let mut h = harness(2);
        activate_now(&mut h).await;

        let decision = match_offer(&mut h, fitting_offer()).await;
        let operation = match decision {
            LaunchDecision::Accepted { operation, .. } => operation,
            other => panic!("expected accept, got {other:?}"),
        };

        // The directory confirms the launch as active.
        h.directory.set_condition(
            &h.spec.id,
            &operation.instance_id,
            InstanceCondition::Active,
        );

        let (tx, rx) = oneshot::channel();
        let msg = LauncherMessage::InstancesChanged {
            job_id: h.spec.id,
            reply_to: tx,
        };
        assert!(h.controller.handle(msg, &mut h.ctx).await.unwrap());
        rx.await.unwrap();

        let report = progress(&mut h).await;
        assert_eq!(report.instances_left_to_launch, 1);
        assert_eq!(report.instances_in_flight, 0);
        assert_eq!(report.instances_active, 1);
    }

    #[tokio::test]
    async fn test_stop_resolves_buffered_offers_and_deregisters() {
        let mut h = harness(2);

        let (tx, rx) = oneshot::channel();
        let msg = LauncherMessage::MatchOffer {
            offer: fitting_offer(),
            reply_to: tx,
        };
        assert!(h.controller.handle(msg, &mut h.ctx).await.unwrap());

        let stopped = h
            .controller
            .handle(LauncherMessage::Stop, &mut h.ctx)
            .await
            .unwrap();
        assert!(!stopped);
        assert!(matches!(h.controller.state, ControllerState::Stopped));

        // The parked offer still got its terminal resolution.
        assert!(matches!(
            rx.await.unwrap(),
            LaunchDecision::NoMatch {
                reason: NoMatchReason::NotEligible
            }
        ));
        assert!(!h.registry.contains(&registry_key(&h.spec)));
    }
}
