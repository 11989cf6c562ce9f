//! Typed ID definitions for all scheduler resources.
//!
//! Each ID type has a unique prefix that identifies the resource type.
//! IDs are ULID-based for sortability and uniqueness.

use crate::define_id;

// =============================================================================
// Workloads
// =============================================================================

define_id!(JobId, "job");
define_id!(InstanceId, "inst");

// =============================================================================
// Cluster Resources
// =============================================================================

define_id!(AgentId, "agent");
define_id!(OfferId, "offer");

// =============================================================================
// Requests
// =============================================================================

define_id!(RequestId, "req");

// =============================================================================
// Tests
// =============================================================================
