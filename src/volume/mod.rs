//! Volume Module - derived investment volumes over the referral forest
//!
//! - `VolumeAggregator`: direct and team volume for one address
//! - `UplinePropagator`: re-aggregates the ancestors of a changed node
//! - `InvestmentIngestor`: applies investment events and triggers propagation

pub mod aggregator;
pub mod ingest;
pub mod propagator;

pub use aggregator::{RecomputeSummary, VolumeAggregator, VolumeSnapshot};
pub use ingest::{IngestOutcome, InvestmentIngestor};
pub use propagator::{PropagationReport, UplinePropagator};
