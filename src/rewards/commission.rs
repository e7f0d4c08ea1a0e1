//! Direct commission: fixed per-level rates on an invested amount, paid to
//! the ancestor at exactly that level. No volume thresholds apply.

use rust_decimal::Decimal;
use serde::Serialize;

use super::schedule::RewardSchedule;
use super::NodeMetrics;
use crate::error::ReferralResult;
use crate::models::{checked_mul, Address};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommissionLine {
    /// 1 = F1 (the investor's referrer).
    pub level: u32,
    pub beneficiary: Address,
    pub rate: Decimal,
    pub amount: Decimal,
}

/// `upline` is nearest first; levels past the configured rates are ignored.
pub fn direct_commissions(
    amount: Decimal,
    upline: &[NodeMetrics],
    schedule: &RewardSchedule,
) -> ReferralResult<Vec<CommissionLine>> {
    schedule
        .direct_commission_rates
        .iter()
        .zip(upline)
        .enumerate()
        .map(|(idx, (rate, ancestor))| {
            Ok(CommissionLine {
                level: idx as u32 + 1,
                beneficiary: ancestor.address.clone(),
                rate: *rate,
                amount: checked_mul(amount, *rate)?,
            })
        })
        .collect()
}
