//! Investment event ingestion
//!
//! "Address A invested X at T" is applied to the store exactly once per
//! event id, then A's upline is re-aggregated.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};

use super::propagator::{PropagationReport, UplinePropagator};
use crate::error::{ReferralError, ReferralResult};
use crate::models::InvestmentEvent;
use crate::store::NodeStore;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// The event id was seen before; nothing changed.
    Duplicate,
    Applied { propagation: PropagationReport },
}

#[derive(Clone)]
pub struct InvestmentIngestor {
    store: Arc<NodeStore>,
    propagator: UplinePropagator,
}

impl InvestmentIngestor {
    pub fn new(store: Arc<NodeStore>, propagator: UplinePropagator) -> Self {
        Self { store, propagator }
    }

    pub fn ingest(&self, event: &InvestmentEvent) -> ReferralResult<IngestOutcome> {
        if event.investor.is_zero() {
            return Err(ReferralError::invalid_address(
                event.investor.as_str(),
                "zero address cannot invest",
            ));
        }
        if event.amount <= Decimal::ZERO {
            return Err(ReferralError::InvalidAmount(format!(
                "investment amount must be positive, got {}",
                event.amount
            )));
        }

        if !self.store.apply_investment(event)? {
            return Ok(IngestOutcome::Duplicate);
        }

        let propagation = self.propagator.propagate(&event.investor)?;
        if !propagation.failures.is_empty() {
            warn!(
                event_id = %event.event_id,
                failed = propagation.failures.len(),
                "Some ancestors kept stale volumes; a recompute will heal them"
            );
        }
        info!(
            event_id = %event.event_id,
            investor = %event.investor,
            amount = %event.amount,
            ancestors = propagation.visited.len(),
            "💰 Investment applied"
        );
        Ok(IngestOutcome::Applied { propagation })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Address;
    use crate::volume::VolumeAggregator;
    use chrono::Utc;

    fn addr(n: u8) -> Address {
        Address::parse(&format!("0x{:040x}", n)).unwrap()
    }

    fn setup() -> (Arc<NodeStore>, InvestmentIngestor) {
        let store = Arc::new(NodeStore::in_memory().unwrap());
        let aggregator = VolumeAggregator::new(store.clone());
        let propagator = UplinePropagator::new(store.clone(), aggregator, 20);
        (store.clone(), InvestmentIngestor::new(store, propagator))
    }

    fn event(id: &str, who: Address, amount: Decimal) -> InvestmentEvent {
        InvestmentEvent {
            event_id: id.into(),
            investor: who,
            amount,
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn test_replayed_event_is_noop() {
        let (store, ingestor) = setup();
        store.set_referrer(&addr(2), Some(&addr(1))).unwrap();

        let first = ingestor
            .ingest(&event("0xtx", addr(2), Decimal::from(300)))
            .unwrap();
        assert!(matches!(first, IngestOutcome::Applied { .. }));
        let again = ingestor
            .ingest(&event("0xtx", addr(2), Decimal::from(300)))
            .unwrap();
        assert!(matches!(again, IngestOutcome::Duplicate));

        let parent = store.get(&addr(1)).unwrap().unwrap();
        assert_eq!(parent.direct_volume, Decimal::from(300));
        assert_eq!(parent.team_volume, Decimal::from(300));
    }

    #[test]
    fn test_rejects_before_mutation() {
        let (store, ingestor) = setup();
        let zero = ingestor.ingest(&event("a", Address::zero(), Decimal::ONE));
        assert!(matches!(zero, Err(ReferralError::InvalidAddress { .. })));

        let negative = ingestor.ingest(&event("b", addr(3), Decimal::from(-5)));
        assert!(matches!(negative, Err(ReferralError::InvalidAmount(_))));
        let nothing = ingestor.ingest(&event("c", addr(3), Decimal::ZERO));
        assert!(nothing.is_err());

        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_investment_reactivates_node() {
        let (store, ingestor) = setup();
        store.ensure_node(&addr(4)).unwrap();
        store.deactivate(&addr(4)).unwrap();
        ingestor
            .ingest(&event("0x1", addr(4), Decimal::from(10)))
            .unwrap();
        assert!(store.get(&addr(4)).unwrap().unwrap().is_active);
    }
}
