//! Upline Propagator
//!
//! After an investment change at A, walk A's referrer chain and re-aggregate
//! every ancestor. The walk is capped at `max_depth` hops because referrer
//! data comes from an external ledger and may be corrupted into a loop.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use super::aggregator::VolumeAggregator;
use crate::error::{ReferralError, ReferralResult};
use crate::models::Address;
use crate::store::NodeStore;

#[derive(Debug, Clone, Serialize)]
pub struct PropagationReport {
    pub origin: Address,
    /// Ancestors in walk order, nearest first. May repeat under a cycle.
    pub visited: Vec<Address>,
    pub updated: usize,
    pub failures: Vec<(Address, String)>,
    /// The walk stopped at the hop cap with a parent still ahead.
    pub depth_cap_hit: bool,
}

#[derive(Clone)]
pub struct UplinePropagator {
    store: Arc<NodeStore>,
    aggregator: VolumeAggregator,
    max_depth: usize,
}

impl UplinePropagator {
    pub fn new(store: Arc<NodeStore>, aggregator: VolumeAggregator, max_depth: usize) -> Self {
        Self {
            store,
            aggregator,
            max_depth: max_depth.max(1),
        }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Re-aggregate every ancestor of `origin`, up to the hop cap.
    ///
    /// Only a failure to read a referrer pointer aborts the walk, since the
    /// chain cannot be followed past it. Aggregation failures are recorded
    /// and the walk moves on.
    pub fn propagate(&self, origin: &Address) -> ReferralResult<PropagationReport> {
        let mut report = PropagationReport {
            origin: origin.clone(),
            visited: Vec::new(),
            updated: 0,
            failures: Vec::new(),
            depth_cap_hit: false,
        };

        let mut current = origin.clone();
        for _hop in 0..self.max_depth {
            let Some(parent) = self.store.referrer_of(&current)? else {
                return Ok(report);
            };

            match self.aggregator.aggregate(&parent) {
                Ok(_) => report.updated += 1,
                Err(e) => {
                    warn!(
                        origin = %origin,
                        ancestor = %parent,
                        error = %e,
                        "Ancestor aggregation failed, continuing upline"
                    );
                    report.failures.push((parent.clone(), e.to_string()));
                }
            }
            report.visited.push(parent.clone());
            current = parent;
        }

        if self.store.referrer_of(&current)?.is_some() {
            report.depth_cap_hit = true;
            let integrity = ReferralError::CycleDetected {
                start: origin.clone(),
                max_depth: self.max_depth,
            };
            warn!(
                origin = %origin,
                last = %current,
                "Data integrity: {integrity}; propagation stopped at the cap"
            );
        }

        debug!(
            origin = %origin,
            ancestors = report.visited.len(),
            failures = report.failures.len(),
            "Upline propagation finished"
        );
        Ok(report)
    }

    /// Re-aggregate `start` itself and then its whole upline. Used when a
    /// subtree moved away from `start`.
    pub fn refresh_chain(&self, start: &Address) -> ReferralResult<PropagationReport> {
        let own = self.aggregator.aggregate(start);
        let mut report = self.propagate(start)?;
        match own {
            Ok(_) => report.updated += 1,
            Err(e) => report.failures.insert(0, (start.clone(), e.to_string())),
        }
        report.visited.insert(0, start.clone());
        Ok(report)
    }
}
