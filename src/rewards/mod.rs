//! Rewards Module - tier and commission eligibility
//!
//! Three independent, additive dimensions, all re-derived on demand from
//! stored volumes:
//! - direct commission on investments (F1..F3)
//! - gated profit sharing (up to 10 levels)
//! - leader rank bonus, booked as its own lines on the same base amount
//!
//! Only rates and amounts are computed here. Payouts are booked elsewhere.

pub mod commission;
pub mod profit_share;
pub mod rank;
pub mod schedule;

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;

use crate::error::{ReferralError, ReferralResult};
use crate::models::{checked_add, checked_mul, Address, Node};
use crate::store::NodeStore;

pub use commission::{direct_commissions, CommissionLine};
pub use profit_share::{profit_shares, unlocked_levels, ProfitShareLine, ShareStatus};
pub use rank::{
    bonus_rate, leader_rank, next_rank_gap, rank_bonuses, RankBonusLine, RankGap,
};
pub use schedule::{LeaderRank, ProfitShareLevel, RankThreshold, RewardSchedule};

/// The slice of a node the reward rules look at.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeMetrics {
    pub address: Address,
    pub direct_volume: Decimal,
    pub team_volume: Decimal,
    pub direct_referral_count: u32,
    pub is_active: bool,
}

impl From<&Node> for NodeMetrics {
    fn from(node: &Node) -> Self {
        Self {
            address: node.address.clone(),
            direct_volume: node.direct_volume,
            team_volume: node.team_volume,
            direct_referral_count: node.direct_referral_count,
            is_active: node.is_active,
        }
    }
}

impl NodeMetrics {
    pub fn empty(address: Address) -> Self {
        Self {
            address,
            direct_volume: Decimal::ZERO,
            team_volume: Decimal::ZERO,
            direct_referral_count: 0,
            is_active: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InvestmentQuote {
    pub investor: Address,
    pub amount: Decimal,
    pub lines: Vec<CommissionLine>,
    pub bonuses: Vec<RankBonusLine>,
    pub total_commission: Decimal,
    pub total_bonus: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfitQuote {
    pub earner: Address,
    pub profit: Decimal,
    pub lines: Vec<ProfitShareLine>,
    pub total_paid: Decimal,
    pub total_forfeited: Decimal,
    pub bonuses: Vec<RankBonusLine>,
    pub total_bonus: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct Eligibility {
    pub metrics: NodeMetrics,
    pub rank: Option<LeaderRank>,
    pub bonus_rate: Decimal,
    pub profit_share_levels: Vec<u32>,
    pub next_rank: Option<RankGap>,
}

pub struct RewardEngine {
    store: Arc<NodeStore>,
    schedule: RewardSchedule,
    max_depth: usize,
}

impl RewardEngine {
    pub fn new(store: Arc<NodeStore>, schedule: RewardSchedule, max_depth: usize) -> Self {
        Self {
            store,
            schedule,
            max_depth: max_depth.max(1),
        }
    }

    pub fn schedule(&self) -> &RewardSchedule {
        &self.schedule
    }

    fn upline_metrics(&self, address: &Address) -> ReferralResult<Vec<NodeMetrics>> {
        let levels = self.schedule.max_levels().min(self.max_depth);
        Ok(self
            .store
            .upline(address, levels)?
            .iter()
            .map(NodeMetrics::from)
            .collect())
    }

    /// Direct commission lines for `amount` invested by `investor`, plus the
    /// leader bonus of each ranked ancestor on the F-levels.
    pub fn quote_investment(
        &self,
        investor: &Address,
        amount: Decimal,
    ) -> ReferralResult<InvestmentQuote> {
        if amount <= Decimal::ZERO {
            return Err(ReferralError::InvalidAmount(format!(
                "investment amount must be positive, got {amount}"
            )));
        }
        let upline = self.upline_metrics(investor)?;
        let lines = direct_commissions(amount, &upline, &self.schedule)?;
        let covered = lines.len();
        let bonuses = rank_bonuses(amount, &upline[..covered], &self.schedule)?;

        let total_commission = sum(lines.iter().map(|l| l.amount))?;
        let total_bonus = sum(bonuses.iter().map(|b| b.amount))?;
        debug!(
            %investor,
            %amount,
            levels = covered,
            %total_commission,
            %total_bonus,
            "Commission quote"
        );
        Ok(InvestmentQuote {
            investor: investor.clone(),
            amount,
            lines,
            bonuses,
            total_commission,
            total_bonus,
        })
    }

    /// Profit-share lines for `profit` realised by `earner`. Ranked ancestors
    /// on those levels also get their leader bonus, gate or no gate.
    pub fn quote_profit(&self, earner: &Address, profit: Decimal) -> ReferralResult<ProfitQuote> {
        if profit.is_sign_negative() {
            return Err(ReferralError::InvalidAmount(format!(
                "realised profit must be non-negative, got {profit}"
            )));
        }
        let upline = self.upline_metrics(earner)?;
        let lines = profit_shares(profit, &upline, &self.schedule)?;
        let bonuses = rank_bonuses(profit, &upline[..lines.len()], &self.schedule)?;

        let mut total_paid = Decimal::ZERO;
        let mut total_forfeited = Decimal::ZERO;
        for line in &lines {
            match line.status {
                ShareStatus::Paid => total_paid = checked_add(total_paid, line.amount)?,
                ShareStatus::Forfeited => {
                    let share = checked_mul(profit, line.rate)?;
                    total_forfeited = checked_add(total_forfeited, share)?;
                }
            }
        }
        Ok(ProfitQuote {
            earner: earner.clone(),
            profit,
            lines,
            total_paid,
            total_forfeited,
            total_bonus: sum(bonuses.iter().map(|b| b.amount))?,
            bonuses,
        })
    }

    /// Rank, bonus and unlocked profit-share levels from stored metrics.
    /// Unknown addresses read as empty and are not created.
    pub fn eligibility(&self, address: &Address) -> ReferralResult<Eligibility> {
        let metrics = match self.store.get(address)? {
            Some(node) => NodeMetrics::from(&node),
            None => NodeMetrics::empty(address.clone()),
        };
        let rank = leader_rank(&metrics, &self.schedule);
        Ok(Eligibility {
            rank,
            bonus_rate: bonus_rate(rank, &self.schedule),
            profit_share_levels: unlocked_levels(metrics.direct_referral_count, &self.schedule),
            next_rank: next_rank_gap(&metrics, rank, &self.schedule),
            metrics,
        })
    }
}

fn sum(amounts: impl Iterator<Item = Decimal>) -> ReferralResult<Decimal> {
    amounts.fold(Ok(Decimal::ZERO), |acc, amount| checked_add(acc?, amount))
}
