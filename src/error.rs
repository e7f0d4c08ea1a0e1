//! Error taxonomy for the referral engine.
//!
//! Every variant is scoped to a single address or operation. Batch and
//! propagation loops catch these per item and keep going.

use thiserror::Error;

use crate::models::Address;

pub type ReferralResult<T> = std::result::Result<T, ReferralError>;

#[derive(Debug, Error)]
pub enum ReferralError {
    /// Transient ledger failure that survived every retry.
    #[error("ledger unavailable for {address} after {attempts} attempt(s): {reason}")]
    LedgerUnavailable {
        address: Address,
        attempts: u32,
        reason: String,
    },

    /// Malformed, self-referential or zero address where a real one is required.
    #[error("invalid address {input:?}: {reason}")]
    InvalidAddress { input: String, reason: String },

    /// An upline walk hit the hop cap, or a referrer change would close a loop.
    #[error("referrer cycle suspected starting at {start} (cap {max_depth} hops)")]
    CycleDetected { start: Address, max_depth: usize },

    #[error("node store unavailable: {0}")]
    StoreUnavailable(#[from] rusqlite::Error),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ReferralError {
    pub fn invalid_address(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Whether a later pass over the same input may succeed. A rejected
    /// cycle can clear once the rest of the chain has been reconciled.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LedgerUnavailable { .. } | Self::StoreUnavailable(_) | Self::CycleDetected { .. }
        )
    }

    /// Stable tag persisted alongside failed addresses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LedgerUnavailable { .. } => "ledger_unavailable",
            Self::InvalidAddress { .. } => "invalid_address",
            Self::CycleDetected { .. } => "cycle_detected",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::InvalidAmount(_) => "invalid_amount",
            Self::Config(_) => "config",
        }
    }
}
