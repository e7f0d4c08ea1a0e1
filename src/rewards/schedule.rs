//! Reward rates and thresholds.
//!
//! All rates are fractions (`0.06` = 6%). The defaults mirror the program's
//! published tables and can be overridden from the `[rewards]` config section.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{ReferralError, ReferralResult};

/// Profit sharing never reaches further than this many levels.
pub const MAX_PROFIT_SHARE_LEVELS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaderRank {
    Silver,
    Gold,
    Platinum,
    Diamond,
    Royal,
}

impl LeaderRank {
    pub const ALL: [LeaderRank; 5] = [
        LeaderRank::Silver,
        LeaderRank::Gold,
        LeaderRank::Platinum,
        LeaderRank::Diamond,
        LeaderRank::Royal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LeaderRank::Silver => "silver",
            LeaderRank::Gold => "gold",
            LeaderRank::Platinum => "platinum",
            LeaderRank::Diamond => "diamond",
            LeaderRank::Royal => "royal",
        }
    }
}

impl fmt::Display for LeaderRank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Both volumes must reach their minimum for the rank to apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankThreshold {
    pub rank: LeaderRank,
    pub min_team_volume: Decimal,
    pub min_direct_volume: Decimal,
    pub bonus_rate: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfitShareLevel {
    pub rate: Decimal,
    /// Direct referrals the ancestor needs to collect at this level.
    pub min_direct_referrals: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardSchedule {
    /// F1, F2, F3, ... rates on the invested amount.
    pub direct_commission_rates: Vec<Decimal>,
    /// Level 1 first.
    pub profit_share: Vec<ProfitShareLevel>,
    pub leader_ranks: Vec<RankThreshold>,
}

impl Default for RewardSchedule {
    fn default() -> Self {
        let percent = |p: i64| Decimal::new(p, 2);

        let profit_share = [20, 15, 10, 8, 6, 5, 4, 3, 2, 1]
            .into_iter()
            .enumerate()
            .map(|(idx, rate)| ProfitShareLevel {
                rate: percent(rate),
                min_direct_referrals: 2 * (idx as u32 + 1) + 1,
            })
            .collect();

        let tier = |rank: LeaderRank, team: i64, direct: i64, bonus: i64| RankThreshold {
            rank,
            min_team_volume: Decimal::from(team),
            min_direct_volume: Decimal::from(direct),
            bonus_rate: percent(bonus),
        };

        Self {
            direct_commission_rates: vec![percent(6), percent(1), percent(1)],
            profit_share,
            leader_ranks: vec![
                tier(LeaderRank::Silver, 10_000, 2_000, 1),
                tier(LeaderRank::Gold, 50_000, 5_000, 2),
                tier(LeaderRank::Platinum, 200_000, 10_000, 3),
                tier(LeaderRank::Diamond, 500_000, 20_000, 4),
                tier(LeaderRank::Royal, 1_000_000, 50_000, 5),
            ],
        }
    }
}

impl RewardSchedule {
    pub fn threshold(&self, rank: LeaderRank) -> Option<&RankThreshold> {
        self.leader_ranks.iter().find(|t| t.rank == rank)
    }

    /// Levels any reward walk needs to look up.
    pub fn max_levels(&self) -> usize {
        self.direct_commission_rates.len().max(self.profit_share.len())
    }

    pub fn validate(&self) -> ReferralResult<()> {
        let bad = |msg: String| Err(ReferralError::Config(msg));
        let in_unit_range = |r: &Decimal| !r.is_sign_negative() && *r <= Decimal::ONE;

        for (idx, rate) in self.direct_commission_rates.iter().enumerate() {
            if !in_unit_range(rate) {
                return bad(format!("direct commission F{} rate {rate} outside [0, 1]", idx + 1));
            }
        }

        if self.profit_share.len() > MAX_PROFIT_SHARE_LEVELS {
            return bad(format!(
                "profit share has {} levels, at most {MAX_PROFIT_SHARE_LEVELS} allowed",
                self.profit_share.len()
            ));
        }
        for (idx, level) in self.profit_share.iter().enumerate() {
            if !in_unit_range(&level.rate) || level.rate.is_zero() {
                return bad(format!("profit share level {} rate {} outside (0, 1]", idx + 1, level.rate));
            }
        }
        for pair in self.profit_share.windows(2) {
            if pair[1].rate >= pair[0].rate {
                return bad("profit share rates must be strictly decreasing".into());
            }
        }

        for threshold in &self.leader_ranks {
            if threshold.min_team_volume.is_sign_negative()
                || threshold.min_direct_volume.is_sign_negative()
            {
                return bad(format!("{} thresholds must be non-negative", threshold.rank));
            }
            if !in_unit_range(&threshold.bonus_rate) {
                return bad(format!("{} bonus rate outside [0, 1]", threshold.rank));
            }
        }
        for rank in LeaderRank::ALL {
            if self.leader_ranks.iter().filter(|t| t.rank == rank).count() > 1 {
                return bad(format!("{rank} is configured more than once"));
            }
        }
        Ok(())
    }
}
