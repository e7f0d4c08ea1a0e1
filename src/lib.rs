//! Referral Backend Library
//!
//! Reconciles ledger-declared referrer pointers into a local referral forest,
//! keeps subtree investment volumes consistent and derives reward
//! eligibility from them.

pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod models;
pub mod reconcile;
pub mod rewards;
pub mod store;
pub mod tree;
pub mod volume;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{ReferralError, ReferralResult};
pub use models::{Address, InvestmentEvent, Node};
