//! Wiring of the engine components around one shared store.

use std::sync::Arc;

use tracing::info;

use crate::config::EngineConfig;
use crate::error::ReferralResult;
use crate::ledger::{LedgerReader, LedgerSource};
use crate::reconcile::{BatchDriver, Reconciler};
use crate::rewards::RewardEngine;
use crate::store::NodeStore;
use crate::volume::{InvestmentIngestor, UplinePropagator, VolumeAggregator};

pub struct Engine {
    config: EngineConfig,
    store: Arc<NodeStore>,
    aggregator: VolumeAggregator,
    propagator: UplinePropagator,
    ingestor: InvestmentIngestor,
    rewards: RewardEngine,
}

impl Engine {
    /// Open the store at `config.database_path`.
    pub fn open(config: EngineConfig) -> ReferralResult<Self> {
        config.validate()?;
        let store = Arc::new(NodeStore::open(&config.database_path)?);
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: EngineConfig, store: Arc<NodeStore>) -> Self {
        let depth = config.max_upline_depth;
        let aggregator = VolumeAggregator::new(store.clone());
        let propagator = UplinePropagator::new(store.clone(), aggregator.clone(), depth);
        let ingestor = InvestmentIngestor::new(store.clone(), propagator.clone());
        let rewards = RewardEngine::new(store.clone(), config.rewards.clone(), depth);

        info!(
            max_upline_depth = depth,
            batch_size = config.batch.batch_size,
            "Referral engine ready"
        );
        Self {
            config,
            store,
            aggregator,
            propagator,
            ingestor,
            rewards,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<NodeStore> {
        &self.store
    }

    pub fn aggregator(&self) -> &VolumeAggregator {
        &self.aggregator
    }

    pub fn propagator(&self) -> &UplinePropagator {
        &self.propagator
    }

    pub fn ingestor(&self) -> &InvestmentIngestor {
        &self.ingestor
    }

    pub fn rewards(&self) -> &RewardEngine {
        &self.rewards
    }

    /// Reconciler over `source` that refreshes volumes when a pointer moves.
    pub fn reconciler(&self, source: Arc<dyn LedgerSource>) -> Reconciler {
        let reader = LedgerReader::new(source, &self.config.ledger);
        Reconciler::new(reader, self.store.clone(), self.config.max_upline_depth)
            .with_propagator(self.propagator.clone())
    }

    pub fn batch_driver(&self, source: Arc<dyn LedgerSource>) -> BatchDriver {
        BatchDriver::new(self.reconciler(source), self.config.batch.clone())
    }
}
