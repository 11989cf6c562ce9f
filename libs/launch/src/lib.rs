//! keel Launch Controller Library
//!
//! Per-workload launch control for a cluster scheduler: one controller per
//! job specification consumes resource offers, decides launches, honors a
//! failure-driven backoff window, and reports live progress to callers.
//!
//! ## Architecture
//!
//! Each controller is an actor with a sequential mailbox; everything it
//! depends on is injected as a trait object:
//!
//! ```text
//! LaunchFleet
//! └── LaunchController(job_id)
//!     ├── InstanceDirectory      (authoritative instance snapshots)
//!     ├── BackoffSource          (launch-suppression deadlines)
//!     ├── OfferDecider           (offer -> launch operation or no-match)
//!     ├── MatchOutcomeSink       (fire-and-forget diagnostics)
//!     └── OfferRegistry          (shared offer subscription fabric)
//! ```
//!
//! A controller is subscribed to the registry exactly while it has
//! Scheduled instances left to launch and no active backoff window; the
//! fleet delivers offers only to subscribed controllers.
//!
//! ## Modules
//!
//! - `actors`: actor framework, the launch controller, and the fleet
//! - `model`: job specs, instances, offers, decisions, progress reports
//! - `registry`: shared subscription fabric and per-controller manager
//! - `backoff`, `decision`, `directory`, `outcome`: collaborator traits
//!   with in-process implementations
//! - `clock`: injectable wall clock

pub mod actors;
pub mod backoff;
pub mod clock;
pub mod config;
pub mod decision;
pub mod directory;
pub mod model;
pub mod outcome;
pub mod registry;

// Re-export commonly used types
pub use actors::{
    ActorError, ActorHandle, ControllerDeps, LaunchController, LaunchFleet, LauncherMessage,
};
pub use backoff::{BackoffSource, ExponentialBackoffSource};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use decision::{Decision, DecisionError, FirstFitDecider, MatchRequest, OfferDecider};
pub use directory::{InMemoryInstanceDirectory, InstanceDirectory};
pub use model::{
    Constraint, ConstraintOp, Instance, InstanceCondition, JobSpec, LaunchDecision,
    LaunchOperation, NoMatchReason, Offer, ProgressReport, ResourceShape,
};
pub use outcome::{InMemoryOutcomeSink, MatchOutcome, MatchOutcomeSink, TracingOutcomeSink};
pub use registry::{OfferRegistry, RegistryKey, SharedOfferRegistry, SubscriptionManager};
