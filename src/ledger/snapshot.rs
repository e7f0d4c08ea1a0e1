//! Offline ledger backed by a `{address: referrer}` JSON export.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use super::LedgerSource;
use crate::models::Address;

/// Addresses missing from the snapshot read as roots (zero address).
#[derive(Debug, Clone, Default)]
pub struct SnapshotLedger {
    referrers: HashMap<Address, Address>,
}

impl SnapshotLedger {
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (Address, Address)>,
    {
        Self {
            referrers: pairs.into_iter().collect(),
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read ledger snapshot {}", path.display()))?;
        let raw: HashMap<String, String> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse ledger snapshot {}", path.display()))?;

        let mut referrers = HashMap::with_capacity(raw.len());
        for (who, referrer) in raw {
            let who = Address::parse(&who)?;
            let referrer = Address::parse(&referrer)?;
            referrers.insert(who, referrer);
        }

        info!(
            "📒 Loaded ledger snapshot {} ({} entries)",
            path.display(),
            referrers.len()
        );
        Ok(Self { referrers })
    }

    /// Every address the snapshot names, as subject or referrer.
    pub fn addresses(&self) -> Vec<Address> {
        let mut all: Vec<Address> = self
            .referrers
            .iter()
            .flat_map(|(who, referrer)| [who.clone(), referrer.clone()])
            .filter(|a| !a.is_zero())
            .collect();
        all.sort();
        all.dedup();
        all
    }

    pub fn len(&self) -> usize {
        self.referrers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.referrers.is_empty()
    }
}

#[async_trait::async_trait]
impl LedgerSource for SnapshotLedger {
    async fn fetch_referrer(&self, address: &Address) -> Result<Address> {
        Ok(self
            .referrers
            .get(address)
            .cloned()
            .unwrap_or_else(Address::zero))
    }

    fn name(&self) -> &'static str {
        "snapshot"
    }
}
