//! Leader rank qualification.

use rust_decimal::Decimal;
use serde::Serialize;

use super::schedule::{LeaderRank, RankThreshold, RewardSchedule};
use super::NodeMetrics;
use crate::error::ReferralResult;
use crate::models::{checked_mul, Address};

/// Highest rank whose team and direct thresholds are both met.
///
/// Every configured rank is checked, so a rank with a lower team threshold
/// but a higher direct threshold than its neighbour is still found.
pub fn leader_rank(metrics: &NodeMetrics, schedule: &RewardSchedule) -> Option<LeaderRank> {
    schedule
        .leader_ranks
        .iter()
        .filter(|t| qualifies(metrics, t))
        .map(|t| t.rank)
        .max()
}

pub fn bonus_rate(rank: Option<LeaderRank>, schedule: &RewardSchedule) -> Decimal {
    rank.and_then(|r| schedule.threshold(r))
        .map_or(Decimal::ZERO, |t| t.bonus_rate)
}

/// Leader bonus for one ranked ancestor, booked apart from commission and
/// profit-share lines.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankBonusLine {
    /// Ancestor level relative to the source of the amount.
    pub level: u32,
    pub beneficiary: Address,
    pub rank: LeaderRank,
    pub bonus_rate: Decimal,
    pub amount: Decimal,
}

/// Bonus lines on `base` for every ranked ancestor in `upline` (nearest first).
/// Unranked ancestors get no line.
pub fn rank_bonuses(
    base: Decimal,
    upline: &[NodeMetrics],
    schedule: &RewardSchedule,
) -> ReferralResult<Vec<RankBonusLine>> {
    let mut lines = Vec::new();
    for (idx, ancestor) in upline.iter().enumerate() {
        let Some(rank) = leader_rank(ancestor, schedule) else {
            continue;
        };
        let rate = bonus_rate(Some(rank), schedule);
        lines.push(RankBonusLine {
            level: idx as u32 + 1,
            beneficiary: ancestor.address.clone(),
            rank,
            bonus_rate: rate,
            amount: checked_mul(base, rate)?,
        });
    }
    Ok(lines)
}

fn qualifies(metrics: &NodeMetrics, threshold: &RankThreshold) -> bool {
    metrics.team_volume >= threshold.min_team_volume
        && metrics.direct_volume >= threshold.min_direct_volume
}

/// What a node still needs for the next rank up.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankGap {
    pub rank: LeaderRank,
    pub team_volume_short: Decimal,
    pub direct_volume_short: Decimal,
}

pub fn next_rank_gap(
    metrics: &NodeMetrics,
    current: Option<LeaderRank>,
    schedule: &RewardSchedule,
) -> Option<RankGap> {
    schedule
        .leader_ranks
        .iter()
        .filter(|t| current.map_or(true, |c| t.rank > c))
        .min_by_key(|t| t.rank)
        .map(|t| RankGap {
            rank: t.rank,
            team_volume_short: (t.min_team_volume - metrics.team_volume).max(Decimal::ZERO),
            direct_volume_short: (t.min_direct_volume - metrics.direct_volume).max(Decimal::ZERO),
        })
}
