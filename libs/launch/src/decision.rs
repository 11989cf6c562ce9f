//! Offer decision function.
//!
//! Deciding *how* to carve an offer into a launch is external to the
//! controller: it hands the decider a [`MatchRequest`] built from its local
//! view and gets back a [`Decision`]. The call must be synchronous and
//! fast; it runs inline on the controller's mailbox.
//!
//! [`FirstFitDecider`] is the shipped implementation: resource fit plus
//! placement constraints, placing the longest-waiting Scheduled instance.

use thiserror::Error;

use crate::model::{
    Constraint, ConstraintOp, Instance, JobSpec, LaunchOperation, NoMatchReason, Offer,
};

/// Outcome of evaluating one offer.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Accept the offer with this operation.
    Launch(LaunchOperation),

    /// No suitable fit.
    NoMatch { reason: NoMatchReason },
}

/// Everything a decider may look at for one offer.
pub struct MatchRequest<'a> {
    /// The job being launched.
    pub spec: &'a JobSpec,

    /// The offer under evaluation.
    pub offer: &'a Offer,

    /// Local instance set with Lost instances excluded.
    pub reachable: Vec<&'a Instance>,

    /// The subset of `reachable` that is Scheduled.
    pub scheduled: Vec<&'a Instance>,
}

/// Failure inside a decision function. Scoped to the single offer being
/// evaluated; the controller maps it to a no-match.
#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("decision function failed: {0}")]
    Internal(String),
}

/// Maps (offer, candidate instances) to a launch operation or a rejection.
pub trait OfferDecider: Send + Sync {
    fn decide(&self, request: &MatchRequest<'_>) -> Result<Decision, DecisionError>;
}

/// First-fit matching: take the longest-Scheduled instance, check the
/// resource shape, then evaluate placement constraints in order.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstFitDecider;

impl OfferDecider for FirstFitDecider {
    fn decide(&self, request: &MatchRequest<'_>) -> Result<Decision, DecisionError> {
        // Oldest first, id as the deterministic tie-break.
        let Some(instance) = request
            .scheduled
            .iter()
            .min_by_key(|i| (i.since, i.id))
        else {
            return Ok(Decision::NoMatch {
                reason: NoMatchReason::NoScheduledInstances,
            });
        };

        if !request.offer.resources.covers(&request.spec.resources) {
            return Ok(Decision::NoMatch {
                reason: NoMatchReason::InsufficientResources,
            });
        }

        for constraint in &request.spec.placement {
            if !constraint_satisfied(constraint, request.offer, &request.reachable) {
                return Ok(Decision::NoMatch {
                    reason: NoMatchReason::ConstraintViolated,
                });
            }
        }

        Ok(Decision::Launch(LaunchOperation {
            instance_id: instance.id,
            offer_id: request.offer.id,
            agent_id: request.offer.agent_id,
            resources: request.spec.resources.clone(),
        }))
    }
}

fn constraint_satisfied(constraint: &Constraint, offer: &Offer, reachable: &[&Instance]) -> bool {
    let offer_value = if constraint.attribute == "hostname" {
        Some(&offer.hostname)
    } else {
        offer.attributes.get(&constraint.attribute)
    };

    match constraint.op {
        ConstraintOp::Is => offer_value == constraint.value.as_ref(),
        ConstraintOp::IsNot => offer_value != constraint.value.as_ref(),
        // Unique spreads the job across agents: reject the offer if any
        // reachable launched instance already sits on its agent.
        ConstraintOp::Unique => !reachable
            .iter()
            .any(|i| i.agent_id == Some(offer.agent_id)),
    }
}
