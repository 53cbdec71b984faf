//! Destination-selection policies.
//!
//! The distributor asks a [`NodePolicy`] for a destination index per unit:
//! `0` means "process locally", a positive value names a logical remote
//! slot, and anything negative is an error surfaced by the distributor. A
//! policy that consults live load is intentionally non-deterministic across
//! calls; that is the point of load-aware routing.

use crate::membership::ClusterMembership;
use crate::wire::SLOT_DATA_MIN;
use crate::Envelope;

/// Pure routing decision: (unit, read-only load view) → destination index.
///
/// Implementations must not mutate membership state and must be cheap; the
/// policy runs on the hot path of every `process` call.
pub trait NodePolicy: Send + Sync {
    /// Destination index for the given unit.
    fn node_index(&self, unit: &Envelope, membership: &dyn ClusterMembership) -> i64;
}

/// Baseline policy: everything processes locally.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalPolicy;

impl NodePolicy for LocalPolicy {
    fn node_index(&self, _unit: &Envelope, _membership: &dyn ClusterMembership) -> i64 {
        0
    }
}

/// Routes every data-slot unit to remote slot 1; control-range slots stay
/// local.
///
/// With a single logical remote slot, all shipped traffic shares one
/// connection to whichever node the selection scan picks on first use.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleRemotePolicy;

impl NodePolicy for SingleRemotePolicy {
    fn node_index(&self, unit: &Envelope, _membership: &dyn ClusterMembership) -> i64 {
        if unit.slot >= SLOT_DATA_MIN {
            1
        } else {
            0
        }
    }
}
