//! Data model for the launch controller.
//!
//! These are the types that cross the controller's boundary: job
//! specifications, instances and their lifecycle conditions, resource
//! offers, and the decisions/reports the controller hands back.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use keel_id::{AgentId, InstanceId, JobId, OfferId};
use serde::{Deserialize, Serialize};

// =============================================================================
// Resources and Placement
// =============================================================================

/// Resource requirements of one instance, or the capacity of one offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceShape {
    /// CPU share in cores.
    pub cpus: f64,

    /// Memory in MiB.
    pub mem_mb: u64,

    /// Disk in MiB.
    pub disk_mb: u64,
}

impl ResourceShape {
    /// Returns true if this shape can satisfy `need` on every dimension.
    pub fn covers(&self, need: &ResourceShape) -> bool {
        self.cpus >= need.cpus && self.mem_mb >= need.mem_mb && self.disk_mb >= need.disk_mb
    }
}

/// Placement constraint operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintOp {
    /// The offer attribute must equal the constraint value.
    Is,
    /// The offer attribute must not equal the constraint value.
    IsNot,
    /// No reachable launched instance of the job may already occupy the
    /// offer's agent.
    Unique,
}

/// A single placement constraint evaluated against an offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    /// Attribute name; `"hostname"` resolves to the offer's hostname,
    /// anything else is looked up in the offer's attribute map.
    pub attribute: String,

    /// Operator.
    pub op: ConstraintOp,

    /// Comparison value; unused for [`ConstraintOp::Unique`].
    pub value: Option<String>,
}

// =============================================================================
// Job Specification
// =============================================================================

/// Declarative description of a workload and its desired instance count.
///
/// Immutable per version: an update always arrives as a whole new value
/// with a bumped `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Stable job identity.
    pub id: JobId,

    /// Monotonic spec version.
    pub version: u64,

    /// Desired instance count.
    pub target: u32,

    /// Per-instance resource requirements.
    pub resources: ResourceShape,

    /// Placement constraints.
    pub placement: Vec<Constraint>,

    /// Resident jobs launch onto reserved resources and keep their
    /// subscription keyed accordingly.
    pub resident: bool,

    /// Free-form metadata; never relevant to launching.
    pub labels: BTreeMap<String, String>,
}

impl JobSpec {
    /// Whether `newer` is a material update over this spec.
    ///
    /// Material means: the version differs AND a field relevant to launching
    /// (resources, placement, resident flag) changed. A labels-only or
    /// target-only bump keeps the current backoff window valid.
    pub fn materially_differs(&self, newer: &JobSpec) -> bool {
        self.version != newer.version
            && (self.resources != newer.resources
                || self.placement != newer.placement
                || self.resident != newer.resident)
    }
}

// =============================================================================
// Instances
// =============================================================================

/// Lifecycle condition of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceCondition {
    /// Desired but not yet matched to an offer.
    Scheduled,
    /// An offer was just accepted for it; the directory update is pending.
    Provisioned,
    /// Confirmed running.
    Active,
    /// Held on reserved resources.
    Reserved,
    /// Agent unreachable; excluded from matching but still counted until
    /// the directory removes it.
    Lost,
    /// Finished or expunged.
    Terminal,
}

impl InstanceCondition {
    /// Lost instances are invisible to offer matching.
    pub fn is_reachable(&self) -> bool {
        !matches!(self, InstanceCondition::Lost)
    }

    /// Confirmed running or held.
    pub fn is_active(&self) -> bool {
        matches!(self, InstanceCondition::Active | InstanceCondition::Reserved)
    }
}

/// One runtime unit of a job specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Stable instance identity.
    pub id: InstanceId,

    /// Owning job.
    pub job_id: JobId,

    /// Current lifecycle condition.
    pub condition: InstanceCondition,

    /// Agent the instance is (or was) placed on; `None` while Scheduled.
    pub agent_id: Option<AgentId>,

    /// When the instance entered its current condition.
    pub since: DateTime<Utc>,
}

impl Instance {
    /// Mints a Scheduled placeholder for a job.
    pub fn scheduled(job_id: JobId, now: DateTime<Utc>) -> Self {
        Self {
            id: InstanceId::new(),
            job_id,
            condition: InstanceCondition::Scheduled,
            agent_id: None,
            since: now,
        }
    }
}

// =============================================================================
// Offers and Launch Decisions
// =============================================================================

/// A time-bounded resource grant from the cluster resource manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    /// Offer identity.
    pub id: OfferId,

    /// Agent the resources live on.
    pub agent_id: AgentId,

    /// Agent hostname, used by placement constraints.
    pub hostname: String,

    /// Offered capacity.
    pub resources: ResourceShape,

    /// Agent attributes, used by placement constraints.
    pub attributes: BTreeMap<String, String>,
}

/// A concrete launch carved out of an accepted offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchOperation {
    /// Instance being launched.
    pub instance_id: InstanceId,

    /// Offer being consumed.
    pub offer_id: OfferId,

    /// Target agent.
    pub agent_id: AgentId,

    /// Resources claimed from the offer.
    pub resources: ResourceShape,
}

/// Why an offer produced no launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoMatchReason {
    /// The controller was not accepting offers (nothing to launch, or an
    /// active backoff window).
    NotEligible,
    /// No Scheduled instance was available to place.
    NoScheduledInstances,
    /// The offer's resources do not cover the spec's requirements.
    InsufficientResources,
    /// A placement constraint rejected the offer.
    ConstraintViolated,
    /// The decision function itself failed; scoped to this offer only.
    DeciderFailed,
}

/// Terminal resolution for one offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LaunchDecision {
    /// Launch `operation`; `origin` routes later accept/timeout/reject
    /// notifications back to the controller that produced it.
    Accepted {
        operation: LaunchOperation,
        origin: JobId,
    },

    /// No suitable fit.
    NoMatch { reason: NoMatchReason },
}

// =============================================================================
// Progress Reporting
// =============================================================================

/// Point-in-time launch progress for one job, returned synchronously to
/// callers and computed without side effects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    /// Job this report describes.
    pub job_id: JobId,

    /// Scheduled instances still waiting for an offer.
    pub instances_left_to_launch: u32,

    /// Provisioned instances whose directory confirmation is pending.
    pub instances_in_flight: u32,

    /// Instances confirmed active or reserved.
    pub instances_active: u32,

    /// The job's desired instance count.
    pub final_instance_count: u32,

    /// Current backoff deadline, if a window is active.
    pub back_off_until: Option<DateTime<Utc>>,

    /// When the controller started.
    pub started_at: DateTime<Utc>,

    /// True while any instance is unlaunched or in flight.
    pub in_progress: bool,
}

// =============================================================================
// Tests
// =============================================================================
