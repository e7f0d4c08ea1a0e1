//! Read-only queries consumed by the reporting layer.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::NodeStore;
use crate::error::ReferralResult;
use crate::models::{Address, Node};

const MAX_PAGE_LIMIT: u32 = 500;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownlineQuery {
    /// Only nodes exactly this many levels below the root.
    pub level: Option<u32>,
    /// `Some(true)`: invested nodes only; `Some(false)`: non-invested only.
    pub invested: Option<bool>,
    /// 1-based.
    pub page: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownlineEntry {
    pub level: u32,
    #[serde(flatten)]
    pub node: Node,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub total_pages: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownlinePage {
    pub nodes: Vec<DownlineEntry>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UserAggregates {
    pub direct_volume: Decimal,
    pub team_volume: Decimal,
    pub direct_referral_count: u32,
}

impl NodeStore {
    pub fn get_downline(&self, root: &Address, query: &DownlineQuery) -> ReferralResult<DownlinePage> {
        let page = query.page.max(1);
        let limit = query.limit.clamp(1, MAX_PAGE_LIMIT);

        let mut matching: Vec<(Address, u32)> = self
            .descendants(root)?
            .into_iter()
            .filter(|(_, level)| query.level.map_or(true, |wanted| *level == wanted))
            .filter(|(child, _)| {
                query
                    .invested
                    .map_or(true, |wanted| (child.total_investment > Decimal::ZERO) == wanted)
            })
            .map(|(child, level)| (child.address, level))
            .collect();
        // BFS order is already level-major; keep it stable within a level
        matching.sort_by_key(|(_, level)| *level);

        let total = matching.len() as u64;
        let total_pages = total.div_ceil(limit as u64) as u32;
        let skip = (page as usize - 1).saturating_mul(limit as usize);

        let mut nodes = Vec::with_capacity(limit as usize);
        for (address, level) in matching.into_iter().skip(skip).take(limit as usize) {
            if let Some(node) = self.get(&address)? {
                nodes.push(DownlineEntry { level, node });
            }
        }

        Ok(DownlinePage {
            nodes,
            pagination: Pagination {
                page,
                limit,
                total,
                total_pages,
            },
        })
    }

    /// Stored aggregates; unknown addresses read as zero.
    pub fn get_user_aggregates(&self, address: &Address) -> ReferralResult<UserAggregates> {
        Ok(match self.get(address)? {
            Some(node) => UserAggregates {
                direct_volume: node.direct_volume,
                team_volume: node.team_volume,
                direct_referral_count: node.direct_referral_count,
            },
            None => UserAggregates {
                direct_volume: Decimal::ZERO,
                team_volume: Decimal::ZERO,
                direct_referral_count: 0,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> Address {
        Address::parse(&format!("0x{:040x}", n)).unwrap()
    }

    /// 1 -> {2, 3}, 2 -> {4, 5}, 3 -> {6}; 2, 4 and 6 invested
    fn seeded() -> NodeStore {
        let store = NodeStore::in_memory().unwrap();
        store.ensure_node(&addr(1)).unwrap();
        for (child, parent) in [(2, 1), (3, 1), (4, 2), (5, 2), (6, 3)] {
            store.set_referrer(&addr(child), Some(&addr(parent))).unwrap();
        }
        for who in [2, 4, 6] {
            store.set_total_investment(&addr(who), Decimal::from(100)).unwrap();
        }
        store
    }

    #[test]
    fn test_downline_all_levels() {
        let store = seeded();
        let page = store
            .get_downline(
                &addr(1),
                &DownlineQuery {
                    page: 1,
                    limit: 50,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(page.pagination.total, 5);
        assert_eq!(page.pagination.total_pages, 1);
        let levels: Vec<u32> = page.nodes.iter().map(|e| e.level).collect();
        assert_eq!(levels, vec![1, 1, 2, 2, 2]);
    }

    #[test]
    fn test_downline_filters_and_paging() {
        let store = seeded();
        let level2 = store
            .get_downline(
                &addr(1),
                &DownlineQuery {
                    level: Some(2),
                    invested: Some(true),
                    page: 1,
                    limit: 10,
                },
            )
            .unwrap();
        let found: Vec<Address> = level2.nodes.iter().map(|e| e.node.address.clone()).collect();
        assert_eq!(level2.pagination.total, 2);
        assert!(found.contains(&addr(4)));
        assert!(found.contains(&addr(6)));

        let second_page = store
            .get_downline(
                &addr(1),
                &DownlineQuery {
                    page: 2,
                    limit: 2,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(second_page.nodes.len(), 2);
        assert_eq!(second_page.pagination.total_pages, 3);

        let past_end = store
            .get_downline(
                &addr(1),
                &DownlineQuery {
                    page: 9,
                    limit: 2,
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(past_end.nodes.is_empty());
    }

    #[test]
    fn test_aggregates_for_unknown_address_are_zero() {
        let store = seeded();
        let agg = store.get_user_aggregates(&addr(99)).unwrap();
        assert_eq!(agg.team_volume, Decimal::ZERO);
        assert_eq!(agg.direct_referral_count, 0);
        assert!(store.get(&addr(99)).unwrap().is_none());
    }
}
