//! Profit sharing across up to ten ancestor levels.
//!
//! Each level has its own direct-referral gate. An ancestor that misses the
//! gate for the level it occupies forfeits that level's share; nothing rolls
//! up to the next ancestor.

use rust_decimal::Decimal;
use serde::Serialize;

use super::schedule::RewardSchedule;
use super::NodeMetrics;
use crate::error::ReferralResult;
use crate::models::{checked_mul, Address};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareStatus {
    Paid,
    Forfeited,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfitShareLine {
    pub level: u32,
    pub beneficiary: Address,
    pub rate: Decimal,
    pub required_direct_referrals: u32,
    pub direct_referral_count: u32,
    pub status: ShareStatus,
    /// Zero when forfeited.
    pub amount: Decimal,
}

/// `upline` is nearest first.
pub fn profit_shares(
    profit: Decimal,
    upline: &[NodeMetrics],
    schedule: &RewardSchedule,
) -> ReferralResult<Vec<ProfitShareLine>> {
    let mut lines = Vec::with_capacity(schedule.profit_share.len().min(upline.len()));

    for (idx, (level, ancestor)) in schedule.profit_share.iter().zip(upline).enumerate() {
        let qualified = ancestor.direct_referral_count >= level.min_direct_referrals;
        let (status, amount) = if qualified {
            (ShareStatus::Paid, checked_mul(profit, level.rate)?)
        } else {
            (ShareStatus::Forfeited, Decimal::ZERO)
        };
        lines.push(ProfitShareLine {
            level: idx as u32 + 1,
            beneficiary: ancestor.address.clone(),
            rate: level.rate,
            required_direct_referrals: level.min_direct_referrals,
            direct_referral_count: ancestor.direct_referral_count,
            status,
            amount,
        });
    }
    Ok(lines)
}

/// Profit-share levels a node with `direct_referral_count` referrals can
/// collect at, should it occupy them.
pub fn unlocked_levels(direct_referral_count: u32, schedule: &RewardSchedule) -> Vec<u32> {
    schedule
        .profit_share
        .iter()
        .enumerate()
        .filter(|(_, level)| direct_referral_count >= level.min_direct_referrals)
        .map(|(idx, _)| idx as u32 + 1)
        .collect()
}
