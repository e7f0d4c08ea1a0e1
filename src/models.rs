//! Shared referral-graph types
//! Mission: one canonical shape for addresses, nodes and ledger amounts

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{ReferralError, ReferralResult};

/// Ledger sentinel meaning "no referrer".
pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// Ledger amounts are integers scaled by 10^18 unless configured otherwise.
pub const DEFAULT_AMOUNT_DECIMALS: u32 = 18;

const MAX_DECIMAL_SCALE: u32 = 28;

/// Largest mantissa a `Decimal` can hold (2^96 - 1).
const MAX_DECIMAL_MANTISSA: u128 = 79_228_162_514_264_337_593_543_950_335;

/// Canonical lowercase `0x`-prefixed 20-byte address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub fn parse(raw: &str) -> ReferralResult<Self> {
        let trimmed = raw.trim();
        let Some(body) = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        else {
            return Err(ReferralError::invalid_address(raw, "missing 0x prefix"));
        };
        if body.len() != 40 {
            return Err(ReferralError::invalid_address(
                raw,
                format!("expected 40 hex characters, got {}", body.len()),
            ));
        }
        if !body.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ReferralError::invalid_address(raw, "non-hex character"));
        }
        Ok(Self(format!("0x{}", body.to_ascii_lowercase())))
    }

    /// Decode the address packed in the low 20 bytes of a 32-byte ABI word.
    pub fn from_abi_word(word: &[u8]) -> ReferralResult<Self> {
        if word.len() != 32 {
            return Err(ReferralError::invalid_address(
                hex::encode(word),
                format!("ABI word must be 32 bytes, got {}", word.len()),
            ));
        }
        if word[..12].iter().any(|b| *b != 0) {
            return Err(ReferralError::invalid_address(
                hex::encode(word),
                "dirty high bytes in ABI address word",
            ));
        }
        Ok(Self(format!("0x{}", hex::encode(&word[12..]))))
    }

    pub fn zero() -> Self {
        Self(ZERO_ADDRESS.to_string())
    }

    pub fn is_zero(&self) -> bool {
        self.0 == ZERO_ADDRESS
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hex body without the `0x` prefix, as used in calldata.
    pub fn hex_body(&self) -> &str {
        &self.0[2..]
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = ReferralError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = ReferralError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}

/// How a node first entered the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeOrigin {
    /// Seen as a transacting user.
    Registered,
    /// Seen only as somebody's referrer, or reconciled before it ever invested.
    Stub,
}

impl NodeOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeOrigin::Registered => "registered",
            NodeOrigin::Stub => "stub",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "registered" => Some(NodeOrigin::Registered),
            "stub" => Some(NodeOrigin::Stub),
            _ => None,
        }
    }
}

/// One record of the referral forest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub address: Address,
    /// `None` marks a root.
    pub referrer: Option<Address>,
    pub total_investment: Decimal,
    pub direct_volume: Decimal,
    pub team_volume: Decimal,
    pub direct_referral_count: u32,
    pub origin: NodeOrigin,
    pub is_active: bool,
    pub joined_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    pub fn is_root(&self) -> bool {
        self.referrer.is_none()
    }
}

/// "Address A invested amount X at time T", keyed for replay safety.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestmentEvent {
    /// Usually the transaction hash; replays with the same id are ignored.
    pub event_id: String,
    pub investor: Address,
    pub amount: Decimal,
    pub occurred_at: DateTime<Utc>,
}

impl InvestmentEvent {
    /// Build an event from a raw scaled ledger amount.
    pub fn from_raw(
        event_id: &str,
        investor: &str,
        raw_amount: &str,
        decimals: u32,
        occurred_at: DateTime<Utc>,
    ) -> ReferralResult<Self> {
        let event_id = event_id.trim();
        if event_id.is_empty() {
            return Err(ReferralError::InvalidAmount(
                "investment event id must not be empty".to_string(),
            ));
        }
        Ok(Self {
            event_id: event_id.to_string(),
            investor: Address::parse(investor)?,
            amount: scaled_to_decimal(raw_amount, decimals)?,
            occurred_at,
        })
    }
}

/// Convert a ledger fixed-point integer (decimal string) into a `Decimal`.
///
/// Values too wide for `Decimal` lose trailing fractional digits with
/// round-half-up; values that still do not fit at scale 0 are rejected.
pub fn scaled_to_decimal(raw: &str, decimals: u32) -> ReferralResult<Decimal> {
    let digits = raw.trim();
    let value = BigUint::parse_bytes(digits.as_bytes(), 10).ok_or_else(|| {
        ReferralError::InvalidAmount(format!("not an unsigned integer: {raw:?}"))
    })?;

    let ceiling = BigUint::from(MAX_DECIMAL_MANTISSA);
    // Fewest trailing digits to drop; each candidate rounds once from the exact value
    let mut dropped = decimals.saturating_sub(MAX_DECIMAL_SCALE);
    let value = loop {
        let rounded = round_half_up(&value, dropped);
        if rounded <= ceiling {
            break rounded;
        }
        if dropped == decimals {
            return Err(ReferralError::InvalidAmount(format!(
                "amount {digits} exceeds decimal range"
            )));
        }
        dropped += 1;
    };
    let scale = decimals - dropped;

    let mantissa = u128::try_from(&value)
        .ok()
        .and_then(|m| i128::try_from(m).ok())
        .ok_or_else(|| ReferralError::InvalidAmount(format!("amount {digits} out of range")))?;

    Decimal::try_from_i128_with_scale(mantissa, scale)
        .map(|d| d.normalize())
        .map_err(|e| ReferralError::InvalidAmount(format!("amount {digits}: {e}")))
}

/// `value / 10^digits`, rounded half up on the whole dropped remainder.
fn round_half_up(value: &BigUint, digits: u32) -> BigUint {
    if digits == 0 {
        return value.clone();
    }
    let divisor = BigUint::from(10u32).pow(digits);
    let half = &divisor / 2u32;
    let quotient = value / &divisor;
    if value % &divisor >= half {
        quotient + 1u32
    } else {
        quotient
    }
}

pub fn checked_add(a: Decimal, b: Decimal) -> ReferralResult<Decimal> {
    a.checked_add(b)
        .ok_or_else(|| ReferralError::InvalidAmount(format!("overflow adding {a} + {b}")))
}

pub fn checked_mul(a: Decimal, b: Decimal) -> ReferralResult<Decimal> {
    a.checked_mul(b)
        .ok_or_else(|| ReferralError::InvalidAmount(format!("overflow multiplying {a} * {b}")))
}
