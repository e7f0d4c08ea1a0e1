//! Retrying ledger reader.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use super::LedgerSource;
use crate::config::LedgerConfig;
use crate::error::{ReferralError, ReferralResult};
use crate::models::Address;

/// The ledger's view of one address's parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "referrer", rename_all = "snake_case")]
pub enum LedgerReferrer {
    /// Zero address or self: the address is a root.
    Root,
    Parent(Address),
}

#[derive(Clone)]
pub struct LedgerReader {
    source: Arc<dyn LedgerSource>,
    max_retries: u32,
    base_delay: Duration,
    call_timeout: Duration,
}

impl LedgerReader {
    pub fn new(source: Arc<dyn LedgerSource>, config: &LedgerConfig) -> Self {
        Self {
            source,
            max_retries: config.max_retries.max(1),
            base_delay: config.base_delay(),
            call_timeout: config.call_timeout(),
        }
    }

    /// Delay slept after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Worst-case wall clock for one `read`.
    pub fn max_read_time(&self) -> Duration {
        (1..=self.max_retries).fold(Duration::ZERO, |acc, attempt| {
            let backoff = if attempt < self.max_retries {
                self.backoff_delay(attempt)
            } else {
                Duration::ZERO
            };
            acc + self.call_timeout + backoff
        })
    }

    pub fn source_name(&self) -> &'static str {
        self.source.name()
    }

    pub async fn read(&self, address: &Address) -> ReferralResult<LedgerReferrer> {
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=self.max_retries {
            match timeout(self.call_timeout, self.source.fetch_referrer(address)).await {
                Ok(Ok(raw)) => return Ok(classify(address, raw)),
                Ok(Err(e)) => {
                    warn!(
                        %address,
                        source = self.source.name(),
                        attempt,
                        error = %e,
                        "Ledger read failed"
                    );
                    last_error = format!("{e:#}");
                }
                Err(_) => {
                    warn!(
                        %address,
                        source = self.source.name(),
                        attempt,
                        timeout_ms = self.call_timeout.as_millis() as u64,
                        "Ledger read timed out"
                    );
                    last_error = format!("timed out after {}ms", self.call_timeout.as_millis());
                }
            }

            if attempt < self.max_retries {
                let delay = self.backoff_delay(attempt);
                debug!(%address, "Retrying ledger read in {}ms", delay.as_millis());
                sleep(delay).await;
            }
        }

        Err(ReferralError::LedgerUnavailable {
            address: address.clone(),
            attempts: self.max_retries,
            reason: last_error,
        })
    }
}

fn classify(address: &Address, raw: Address) -> LedgerReferrer {
    if raw.is_zero() || &raw == address {
        LedgerReferrer::Root
    } else {
        LedgerReferrer::Parent(raw)
    }
}
