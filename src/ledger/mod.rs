//! Ledger Module - external source of truth for referrer pointers
//!
//! - `LedgerSource`: one raw read, no retries (RPC, snapshot file, test doubles)
//! - `LedgerReader`: bounded retry with exponential backoff around a source
//!
//! The reader is the only place that interprets the zero address and
//! self-references as "no referrer".

pub mod reader;
pub mod rpc;
pub mod snapshot;

use std::sync::Arc;

use anyhow::{bail, Result};

use crate::config::LedgerConfig;
use crate::models::Address;

pub use reader::{LedgerReader, LedgerReferrer};
pub use rpc::JsonRpcLedger;
pub use snapshot::SnapshotLedger;

#[async_trait::async_trait]
pub trait LedgerSource: Send + Sync {
    /// Single attempt at reading the declared referrer of `address`.
    /// May return the zero address or `address` itself.
    async fn fetch_referrer(&self, address: &Address) -> Result<Address>;

    fn name(&self) -> &'static str;
}

/// Pick the configured source: snapshot file first, then JSON-RPC.
pub fn source_from_config(
    config: &LedgerConfig,
    http: reqwest::Client,
) -> Result<Arc<dyn LedgerSource>> {
    if let Some(path) = &config.snapshot_path {
        return Ok(Arc::new(SnapshotLedger::from_json_file(path)?));
    }
    match (&config.rpc_url, &config.contract_address) {
        (Some(url), Some(contract)) => Ok(Arc::new(JsonRpcLedger::new(
            http,
            url.clone(),
            contract,
            &config.referrer_selector,
        )?)),
        _ => bail!(
            "No ledger configured: set ledger.snapshot_path or both ledger.rpc_url and ledger.contract_address"
        ),
    }
}
