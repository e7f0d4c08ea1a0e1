//! Single-address reconciliation against the ledger.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{ReferralError, ReferralResult};
use crate::ledger::{LedgerReader, LedgerReferrer};
use crate::models::Address;
use crate::store::NodeStore;
use crate::volume::UplinePropagator;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// Ledger names no referrer. Nothing was written.
    Root,
    Unchanged {
        referrer: Address,
    },
    Changed {
        previous: Option<Address>,
        referrer: Address,
    },
}

impl ReconcileOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, ReconcileOutcome::Changed { .. })
    }
}

#[derive(Clone)]
pub struct Reconciler {
    reader: LedgerReader,
    store: Arc<NodeStore>,
    propagator: Option<UplinePropagator>,
    max_depth: usize,
}

impl Reconciler {
    pub fn new(reader: LedgerReader, store: Arc<NodeStore>, max_depth: usize) -> Self {
        Self {
            reader,
            store,
            propagator: None,
            max_depth: max_depth.max(1),
        }
    }

    /// Re-aggregate affected uplines whenever a referrer pointer moves.
    pub fn with_propagator(mut self, propagator: UplinePropagator) -> Self {
        self.propagator = Some(propagator);
        self
    }

    pub fn store(&self) -> &Arc<NodeStore> {
        &self.store
    }

    pub fn reader(&self) -> &LedgerReader {
        &self.reader
    }

    /// Bring `address`'s stored referrer in line with the ledger.
    ///
    /// A ledger failure leaves the last known referrer untouched.
    pub async fn reconcile(&self, address: &Address) -> ReferralResult<ReconcileOutcome> {
        if address.is_zero() {
            return Err(ReferralError::invalid_address(
                address.as_str(),
                "zero address cannot be reconciled",
            ));
        }
        self.store.ensure_node(address)?;

        let referrer = match self.reader.read(address).await? {
            LedgerReferrer::Root => {
                debug!(%address, "Ledger reports root");
                return Ok(ReconcileOutcome::Root);
            }
            LedgerReferrer::Parent(referrer) => referrer,
        };

        self.store.ensure_node(&referrer)?;

        let previous = self.store.referrer_of(address)?;
        if previous.as_ref() == Some(&referrer) {
            return Ok(ReconcileOutcome::Unchanged { referrer });
        }

        self.guard_against_cycle(address, &referrer)?;

        self.store.set_referrer(address, Some(&referrer))?;
        info!(
            %address,
            previous = ?previous.as_ref().map(Address::as_str),
            %referrer,
            "🔗 Referrer updated from ledger"
        );

        if let Some(propagator) = &self.propagator {
            self.refresh_volumes(propagator, address, previous.as_ref());
        }

        Ok(ReconcileOutcome::Changed { previous, referrer })
    }

    /// Reject `referrer` if `address` already sits in its upline.
    fn guard_against_cycle(&self, address: &Address, referrer: &Address) -> ReferralResult<()> {
        let upline = self.store.upline(referrer, self.max_depth)?;
        if upline.iter().any(|node| &node.address == address) {
            warn!(
                %address,
                %referrer,
                "Data integrity: ledger referrer would close a cycle, keeping stored pointer"
            );
            return Err(ReferralError::CycleDetected {
                start: address.clone(),
                max_depth: self.max_depth,
            });
        }
        Ok(())
    }

    fn refresh_volumes(
        &self,
        propagator: &UplinePropagator,
        address: &Address,
        previous: Option<&Address>,
    ) {
        if let Some(old_parent) = previous {
            if let Err(e) = propagator.refresh_chain(old_parent) {
                warn!(%address, old_parent = %old_parent, error = %e, "Old upline refresh failed");
            }
        }
        if let Err(e) = propagator.propagate(address) {
            warn!(%address, error = %e, "New upline refresh failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;
    use crate::ledger::SnapshotLedger;
    use crate::volume::VolumeAggregator;
    use rust_decimal::Decimal;

    fn addr(n: u8) -> Address {
        Address::parse(&format!("0x{:040x}", n)).unwrap()
    }

    fn reconciler(pairs: Vec<(Address, Address)>) -> (Arc<NodeStore>, Reconciler) {
        let store = Arc::new(NodeStore::in_memory().unwrap());
        let ledger = Arc::new(SnapshotLedger::from_pairs(pairs));
        let reader = LedgerReader::new(ledger, &LedgerConfig::default());
        let propagator =
            UplinePropagator::new(store.clone(), VolumeAggregator::new(store.clone()), 20);
        let reconciler = Reconciler::new(reader, store.clone(), 20).with_propagator(propagator);
        (store, reconciler)
    }

    #[tokio::test]
    async fn test_second_run_is_noop() {
        let (store, reconciler) = reconciler(vec![(addr(2), addr(1))]);

        let first = reconciler.reconcile(&addr(2)).await.unwrap();
        assert_eq!(
            first,
            ReconcileOutcome::Changed {
                previous: None,
                referrer: addr(1)
            }
        );
        let second = reconciler.reconcile(&addr(2)).await.unwrap();
        assert_eq!(second, ReconcileOutcome::Unchanged { referrer: addr(1) });
        assert!(!second.changed());

        // The referrer exists as a stub even though it never transacted
        assert!(store.get(&addr(1)).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_root_answer_writes_nothing() {
        let (store, reconciler) = reconciler(vec![]);
        assert_eq!(
            reconciler.reconcile(&addr(5)).await.unwrap(),
            ReconcileOutcome::Root
        );
        let node = store.get(&addr(5)).unwrap().unwrap();
        assert!(node.is_root());
        assert_eq!(store.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_self_referral_is_root() {
        let (store, reconciler) = reconciler(vec![(addr(3), addr(3))]);
        assert_eq!(
            reconciler.reconcile(&addr(3)).await.unwrap(),
            ReconcileOutcome::Root
        );
        assert_eq!(store.referrer_of(&addr(3)).unwrap(), None);
    }

    #[tokio::test]
    async fn test_cycle_is_rejected_without_mutation() {
        // Stored: 2 -> 1. Ledger claims 1 -> 2.
        let (store, reconciler) = reconciler(vec![(addr(1), addr(2))]);
        store.set_referrer(&addr(2), Some(&addr(1))).unwrap();

        let err = reconciler.reconcile(&addr(1)).await.unwrap_err();
        assert!(matches!(err, ReferralError::CycleDetected { .. }));
        assert_eq!(store.referrer_of(&addr(1)).unwrap(), None);
    }

    #[tokio::test]
    async fn test_move_refreshes_old_and_new_upline() {
        // Stored: 3 -> 1. Ledger says 3 -> 2.
        let (store, reconciler) = reconciler(vec![(addr(3), addr(2))]);
        store.set_referrer(&addr(3), Some(&addr(1))).unwrap();
        store.set_total_investment(&addr(3), Decimal::from(90)).unwrap();
        store.update_volumes(&addr(1), Decimal::from(90), Decimal::from(90), 1).unwrap();

        let outcome = reconciler.reconcile(&addr(3)).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Changed {
                previous: Some(addr(1)),
                referrer: addr(2)
            }
        );

        let old = store.get(&addr(1)).unwrap().unwrap();
        assert_eq!(old.team_volume, Decimal::ZERO);
        assert_eq!(old.direct_referral_count, 0);
        let new = store.get(&addr(2)).unwrap().unwrap();
        assert_eq!(new.direct_volume, Decimal::from(90));
        assert_eq!(new.direct_referral_count, 1);
    }
}
