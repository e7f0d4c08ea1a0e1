//! Volume Aggregator
//!
//! Derives `direct_volume`, `team_volume` and `direct_referral_count` for one
//! address straight from stored `total_investment` values. The result depends
//! only on the current investments in the subtree, never on previously derived
//! volumes, so recomputation in any order converges in a single pass.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::ReferralResult;
use crate::models::{checked_add, Address};
use crate::store::NodeStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VolumeSnapshot {
    pub direct_volume: Decimal,
    pub team_volume: Decimal,
    pub direct_referral_count: u32,
}

impl VolumeSnapshot {
    pub fn zero() -> Self {
        Self {
            direct_volume: Decimal::ZERO,
            team_volume: Decimal::ZERO,
            direct_referral_count: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecomputeSummary {
    pub processed: usize,
    pub updated: usize,
    pub failed: Vec<(Address, String)>,
}

#[derive(Clone)]
pub struct VolumeAggregator {
    store: Arc<NodeStore>,
}

impl VolumeAggregator {
    pub fn new(store: Arc<NodeStore>) -> Self {
        Self { store }
    }

    /// Compute without persisting volumes. Unknown addresses get a stub.
    pub fn compute(&self, address: &Address) -> ReferralResult<VolumeSnapshot> {
        self.store.ensure_node(address)?;

        let children = self.store.children_of(address)?;
        let mut direct_volume = Decimal::ZERO;
        for child in &children {
            direct_volume = checked_add(direct_volume, child.total_investment)?;
        }

        let mut team_volume = Decimal::ZERO;
        for (member, _level) in self.store.descendants(address)? {
            team_volume = checked_add(team_volume, member.total_investment)?;
        }

        Ok(VolumeSnapshot {
            direct_volume,
            team_volume,
            direct_referral_count: children.len() as u32,
        })
    }

    /// Compute and write back the derived fields.
    pub fn aggregate(&self, address: &Address) -> ReferralResult<VolumeSnapshot> {
        let snapshot = self.compute(address)?;
        self.store.update_volumes(
            address,
            snapshot.direct_volume,
            snapshot.team_volume,
            snapshot.direct_referral_count,
        )?;
        debug!(
            %address,
            direct = %snapshot.direct_volume,
            team = %snapshot.team_volume,
            children = snapshot.direct_referral_count,
            "Volumes aggregated"
        );
        Ok(snapshot)
    }

    /// Re-aggregate every stored node; one failure does not stop the sweep.
    pub fn recompute_all(&self) -> ReferralResult<RecomputeSummary> {
        let addresses = self.store.addresses()?;
        let mut summary = RecomputeSummary::default();

        for address in addresses {
            summary.processed += 1;
            let before = self.store.get(&address).ok().flatten();
            match self.aggregate(&address) {
                Ok(after) => {
                    let changed = before.map_or(true, |n| {
                        n.direct_volume != after.direct_volume
                            || n.team_volume != after.team_volume
                            || n.direct_referral_count != after.direct_referral_count
                    });
                    if changed {
                        summary.updated += 1;
                    }
                }
                Err(e) => {
                    warn!(%address, error = %e, "Volume recompute failed");
                    summary.failed.push((address, e.to_string()));
                }
            }
        }

        info!(
            processed = summary.processed,
            updated = summary.updated,
            failed = summary.failed.len(),
            "Full volume recompute finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> Address {
        Address::parse(&format!("0x{:040x}", n)).unwrap()
    }

    fn setup() -> (Arc<NodeStore>, VolumeAggregator) {
        let store = Arc::new(NodeStore::in_memory().unwrap());
        let aggregator = VolumeAggregator::new(store.clone());
        (store, aggregator)
    }

    #[test]
    fn test_childless_node_is_zero() {
        let (store, aggregator) = setup();
        store.set_total_investment(&addr(1), Decimal::from(500)).unwrap();
        assert_eq!(aggregator.aggregate(&addr(1)).unwrap(), VolumeSnapshot::zero());
    }

    #[test]
    fn test_unknown_address_creates_stub() {
        let (store, aggregator) = setup();
        assert_eq!(aggregator.compute(&addr(42)).unwrap(), VolumeSnapshot::zero());
        assert!(store.get(&addr(42)).unwrap().is_some());
    }

    #[test]
    fn test_direct_and_team_volume() {
        let (store, aggregator) = setup();
        // 1 -> 2 -> 3, 1 -> 4
        store.set_referrer(&addr(2), Some(&addr(1))).unwrap();
        store.set_referrer(&addr(3), Some(&addr(2))).unwrap();
        store.set_referrer(&addr(4), Some(&addr(1))).unwrap();
        store.ensure_node(&addr(1)).unwrap();
        store.set_total_investment(&addr(2), Decimal::from(100)).unwrap();
        store.set_total_investment(&addr(3), Decimal::from(40)).unwrap();
        store.set_total_investment(&addr(4), Decimal::new(25, 1)).unwrap();

        let top = aggregator.aggregate(&addr(1)).unwrap();
        assert_eq!(top.direct_volume, Decimal::new(1025, 1));
        assert_eq!(top.team_volume, Decimal::new(1425, 1));
        assert_eq!(top.direct_referral_count, 2);

        let stored = store.get(&addr(1)).unwrap().unwrap();
        assert_eq!(stored.team_volume, Decimal::new(1425, 1));
    }

    #[test]
    fn test_recompute_all_reports_updates() {
        let (store, aggregator) = setup();
        store.set_referrer(&addr(2), Some(&addr(1))).unwrap();
        store.ensure_node(&addr(1)).unwrap();
        store.set_total_investment(&addr(2), Decimal::from(7)).unwrap();

        let first = aggregator.recompute_all().unwrap();
        assert_eq!(first.processed, 2);
        assert_eq!(first.updated, 1);
        assert!(first.failed.is_empty());

        let second = aggregator.recompute_all().unwrap();
        assert_eq!(second.updated, 0);
    }
}
