//! Match outcome recording.
//!
//! Every consulted offer produces one outcome event, recorded
//! fire-and-forget for diagnostics. Sinks must never block the
//! controller's mailbox.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use keel_id::{AgentId, JobId, OfferId};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::NoMatchReason;

/// One match/no-match event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchOutcome {
    pub job_id: JobId,
    pub offer_id: OfferId,
    pub agent_id: AgentId,
    pub matched: bool,

    /// Present iff `matched` is false.
    pub reason: Option<NoMatchReason>,

    pub decided_at: DateTime<Utc>,
}

/// Fire-and-forget recorder of match outcomes.
pub trait MatchOutcomeSink: Send + Sync {
    fn record(&self, outcome: &MatchOutcome);
}

/// Sink that emits outcomes as structured log events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingOutcomeSink;

impl MatchOutcomeSink for TracingOutcomeSink {
    fn record(&self, outcome: &MatchOutcome) {
        debug!(
            job_id = %outcome.job_id,
            offer_id = %outcome.offer_id,
            agent_id = %outcome.agent_id,
            matched = outcome.matched,
            reason = ?outcome.reason,
            "Offer match outcome"
        );
    }
}

/// Sink that keeps outcomes in memory, for tests and local diagnostics.
#[derive(Debug, Default)]
pub struct InMemoryOutcomeSink {
    outcomes: Mutex<Vec<MatchOutcome>>,
}

impl InMemoryOutcomeSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All outcomes recorded so far, in arrival order.
    pub fn recorded(&self) -> Vec<MatchOutcome> {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl MatchOutcomeSink for InMemoryOutcomeSink {
    fn record(&self, outcome: &MatchOutcome) {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(outcome.clone());
    }
}
