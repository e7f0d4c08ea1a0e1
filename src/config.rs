//! Engine configuration
//!
//! Loaded from an optional TOML file, then overridden by environment
//! variables (a `.env` file is honoured). Every field has a default so an
//! empty file is a valid config.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::{ReferralError, ReferralResult};
use crate::models::{Address, DEFAULT_AMOUNT_DECIMALS};
use crate::rewards::RewardSchedule;

/// Hop cap shared by every upline walk in the engine.
pub const DEFAULT_MAX_UPLINE_DEPTH: usize = 20;

/// `bytes4(keccak256("getReferrer(address)"))`
pub const GET_REFERRER_SELECTOR: &str = "0x4a9fefc7";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite file backing the node store.
    pub database_path: String,
    /// Scale of raw ledger amounts.
    pub amount_decimals: u32,
    pub max_upline_depth: usize,
    pub ledger: LedgerConfig,
    pub batch: BatchConfig,
    pub rewards: RewardSchedule,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: "./referral.db".to_string(),
            amount_decimals: DEFAULT_AMOUNT_DECIMALS,
            max_upline_depth: DEFAULT_MAX_UPLINE_DEPTH,
            ledger: LedgerConfig::default(),
            batch: BatchConfig::default(),
            rewards: RewardSchedule::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// JSON-RPC endpoint of the chain holding the referral contract.
    pub rpc_url: Option<String>,
    pub contract_address: Option<String>,
    pub referrer_selector: String,
    /// JSON `{address: referrer}` file used instead of RPC when set.
    pub snapshot_path: Option<String>,
    /// Total read attempts per address.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub call_timeout_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rpc_url: None,
            contract_address: None,
            referrer_selector: GET_REFERRER_SELECTOR.to_string(),
            snapshot_path: None,
            max_retries: 3,
            base_delay_ms: 1_000,
            call_timeout_ms: 10_000,
        }
    }
}

impl LedgerConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub inter_batch_pause_ms: u64,
    pub intra_batch_pause_ms: u64,
    /// Pause used by the retry-failed pass, both between addresses and batches.
    pub retry_pause_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            inter_batch_pause_ms: 2_000,
            intra_batch_pause_ms: 500,
            retry_pause_ms: 3_000,
        }
    }
}

impl BatchConfig {
    /// No pauses at all; used by tests and offline snapshot runs.
    pub fn unthrottled(batch_size: usize) -> Self {
        Self {
            batch_size,
            inter_batch_pause_ms: 0,
            intra_batch_pause_ms: 0,
            retry_pause_ms: 0,
        }
    }

    pub fn inter_batch_pause(&self) -> Duration {
        Duration::from_millis(self.inter_batch_pause_ms)
    }

    pub fn intra_batch_pause(&self) -> Duration {
        Duration::from_millis(self.intra_batch_pause_ms)
    }

    pub fn retry_pause(&self) -> Duration {
        Duration::from_millis(self.retry_pause_ms)
    }
}

impl EngineConfig {
    /// Load `path` (if any), apply env overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("Failed to read config {}", p.display()))?;
                toml::from_str::<EngineConfig>(&content)
                    .with_context(|| format!("Failed to parse config {}", p.display()))?
            }
            None => EngineConfig::default(),
        };

        config.apply_env();
        config.validate().context("Invalid engine configuration")?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("REFERRAL_DB_PATH") {
            if !v.trim().is_empty() {
                self.database_path = v;
            }
        }
        if let Ok(v) = std::env::var("LEDGER_RPC_URL") {
            if !v.trim().is_empty() {
                self.ledger.rpc_url = Some(v);
            }
        }
        if let Ok(v) = std::env::var("REFERRAL_CONTRACT") {
            if !v.trim().is_empty() {
                self.ledger.contract_address = Some(v);
            }
        }
        if let Ok(v) = std::env::var("LEDGER_SNAPSHOT_PATH") {
            if !v.trim().is_empty() {
                self.ledger.snapshot_path = Some(v);
            }
        }
        if let Some(n) = env_parse("LEDGER_MAX_RETRIES") {
            self.ledger.max_retries = n;
        }
        if let Some(ms) = env_parse("LEDGER_BASE_DELAY_MS") {
            self.ledger.base_delay_ms = ms;
        }
        if let Some(ms) = env_parse("LEDGER_CALL_TIMEOUT_MS") {
            self.ledger.call_timeout_ms = ms;
        }
        if let Some(n) = env_parse("BATCH_SIZE") {
            self.batch.batch_size = n;
        }
        if let Some(ms) = env_parse("BATCH_PAUSE_MS") {
            self.batch.inter_batch_pause_ms = ms;
        }
        if let Some(ms) = env_parse("BATCH_INTRA_PAUSE_MS") {
            self.batch.intra_batch_pause_ms = ms;
        }
        if let Some(ms) = env_parse("BATCH_RETRY_PAUSE_MS") {
            self.batch.retry_pause_ms = ms;
        }
        if let Some(n) = env_parse("MAX_UPLINE_DEPTH") {
            self.max_upline_depth = n;
        }
        if let Some(n) = env_parse("AMOUNT_DECIMALS") {
            self.amount_decimals = n;
        }
    }

    pub fn validate(&self) -> ReferralResult<()> {
        if self.max_upline_depth == 0 {
            return Err(ReferralError::Config(
                "max_upline_depth must be at least 1".into(),
            ));
        }
        if self.ledger.max_retries == 0 {
            return Err(ReferralError::Config(
                "ledger.max_retries must be at least 1".into(),
            ));
        }
        if self.batch.batch_size == 0 {
            return Err(ReferralError::Config(
                "batch.batch_size must be at least 1".into(),
            ));
        }
        if let Some(contract) = &self.ledger.contract_address {
            Address::parse(contract)?;
        }
        let selector = self.ledger.referrer_selector.trim_start_matches("0x");
        if selector.len() != 8 || hex::decode(selector).is_err() {
            return Err(ReferralError::Config(format!(
                "ledger.referrer_selector must be 4 hex bytes, got {:?}",
                self.ledger.referrer_selector
            )));
        }
        self.rewards.validate()?;
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}
