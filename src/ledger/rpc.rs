//! JSON-RPC ledger source
//!
//! Reads `getReferrer(address)` from the referral contract with a plain
//! `eth_call` against the `latest` block.

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use serde_json::json;

use super::LedgerSource;
use crate::models::Address;

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    pub code: Option<i64>,
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    pub result: Option<String>,
    pub error: Option<RpcErrorObject>,
}

#[derive(Clone)]
pub struct JsonRpcLedger {
    http: reqwest::Client,
    rpc_url: String,
    contract: Address,
    selector: String,
}

impl JsonRpcLedger {
    pub fn new(
        http: reqwest::Client,
        rpc_url: String,
        contract: &str,
        selector: &str,
    ) -> Result<Self> {
        let contract = Address::parse(contract).context("Invalid referral contract address")?;
        let selector = selector.trim().trim_start_matches("0x").to_ascii_lowercase();
        if selector.len() != 8 || hex::decode(&selector).is_err() {
            bail!("Invalid function selector {selector:?}");
        }
        Ok(Self {
            http,
            rpc_url,
            contract,
            selector,
        })
    }

    fn calldata(&self, address: &Address) -> String {
        format!("0x{}{:0>64}", self.selector, address.hex_body())
    }
}

#[async_trait::async_trait]
impl LedgerSource for JsonRpcLedger {
    async fn fetch_referrer(&self, address: &Address) -> Result<Address> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_call",
            "params": [
                { "to": self.contract.as_str(), "data": self.calldata(address) },
                "latest"
            ]
        });

        let resp = self
            .http
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .context("eth_call getReferrer failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("eth_call getReferrer {}: {}", status, text);
        }

        let rpc = resp
            .json::<RpcResponse>()
            .await
            .context("Failed to parse eth_call response")?;

        if let Some(err) = rpc.error {
            bail!(
                "eth_call error {}: {}",
                err.code.unwrap_or_default(),
                err.message.unwrap_or_default()
            );
        }

        let result = rpc
            .result
            .ok_or_else(|| anyhow!("eth_call returned neither result nor error"))?;
        decode_address_word(&result)
    }

    fn name(&self) -> &'static str {
        "json_rpc"
    }
}

/// Decode a `0x`-prefixed single-word return value into an address.
fn decode_address_word(result: &str) -> Result<Address> {
    let hex_str = result.trim().trim_start_matches("0x");
    if hex_str.is_empty() {
        bail!("empty eth_call result (contract missing at this block?)");
    }
    let bytes = hex::decode(hex_str).context("eth_call result is not hex")?;
    if bytes.len() < 32 {
        bail!("eth_call result too short: {} bytes", bytes.len());
    }
    Address::from_abi_word(&bytes[..32]).map_err(|e| anyhow!(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calldata_layout() {
        let ledger = JsonRpcLedger::new(
            reqwest::Client::new(),
            "http://localhost:8545".into(),
            "0x00000000000000000000000000000000000000aa",
            "0x4a9fefc7",
        )
        .unwrap();
        let who = Address::parse("0x1111111111111111111111111111111111111111").unwrap();
        let data = ledger.calldata(&who);
        assert_eq!(data.len(), 2 + 8 + 64);
        assert!(data.starts_with("0x4a9fefc7000000000000000000000000"));
        assert!(data.ends_with("1111111111111111111111111111111111111111"));
    }

    #[test]
    fn test_decode_address_word() {
        let word = format!("0x{:0>64}", "2222222222222222222222222222222222222222");
        let a = decode_address_word(&word).unwrap();
        assert_eq!(a.as_str(), "0x2222222222222222222222222222222222222222");

        let zero = format!("0x{}", "0".repeat(64));
        assert!(decode_address_word(&zero).unwrap().is_zero());

        assert!(decode_address_word("0x").is_err());
        assert!(decode_address_word("0x1234").is_err());
    }

    #[test]
    fn test_rejects_bad_selector() {
        let err = JsonRpcLedger::new(
            reqwest::Client::new(),
            "http://localhost:8545".into(),
            "0x00000000000000000000000000000000000000aa",
            "getReferrer",
        );
        assert!(err.is_err());
    }
}
