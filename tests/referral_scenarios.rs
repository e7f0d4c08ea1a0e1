//! End-to-end scenarios through the public library API.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;

use referral_backend::config::BatchConfig;
use referral_backend::ledger::{LedgerSource, SnapshotLedger};
use referral_backend::reconcile::{BatchRun, ReconcileOutcome};
use referral_backend::rewards::{LeaderRank, ShareStatus};
use referral_backend::store::NodeStore;
use referral_backend::volume::IngestOutcome;
use referral_backend::{Address, Engine, EngineConfig, InvestmentEvent, ReferralError};

fn addr(n: u32) -> Address {
    Address::parse(&format!("0x{:040x}", n)).unwrap()
}

fn engine() -> Engine {
    engine_with(EngineConfig::default())
}

fn engine_with(config: EngineConfig) -> Engine {
    let store = Arc::new(NodeStore::in_memory().unwrap());
    Engine::with_store(config, store)
}

fn invest(engine: &Engine, id: &str, who: &Address, amount: i64) -> IngestOutcome {
    engine
        .ingestor()
        .ingest(&InvestmentEvent {
            event_id: id.to_string(),
            investor: who.clone(),
            amount: Decimal::from(amount),
            occurred_at: Utc::now(),
        })
        .unwrap()
}

/// Ledger that fails every read for the addresses in `broken` until healed.
struct FlakyLedger {
    referrers: HashMap<Address, Address>,
    broken: HashSet<Address>,
    healed: AtomicBool,
}

#[async_trait::async_trait]
impl LedgerSource for FlakyLedger {
    async fn fetch_referrer(&self, address: &Address) -> anyhow::Result<Address> {
        if self.broken.contains(address) && !self.healed.load(Ordering::SeqCst) {
            return Err(anyhow!("rpc rate limited"));
        }
        Ok(self
            .referrers
            .get(address)
            .cloned()
            .unwrap_or_else(Address::zero))
    }

    fn name(&self) -> &'static str {
        "flaky"
    }
}

#[tokio::test(start_paused = true)]
async fn scenario_a_volumes_after_propagation() {
    let engine = engine();
    let (r, a1, a2, a3) = (addr(1), addr(2), addr(3), addr(4));
    let ledger = Arc::new(SnapshotLedger::from_pairs([
        (a1.clone(), r.clone()),
        (a2.clone(), a1.clone()),
        (a3.clone(), a2.clone()),
    ]));

    let driver = engine.batch_driver(ledger);
    let mut run = BatchRun::new();
    let progress = driver
        .run(vec![a1.clone(), a2.clone(), a3.clone(), r.clone()], &mut run)
        .await;
    assert_eq!(progress.success, 4);
    assert_eq!(progress.changed, 3);

    invest(&engine, "tx-a3", &a3, 2000);
    invest(&engine, "tx-a1", &a1, 1000);
    invest(&engine, "tx-a2", &a2, 500);

    let store = engine.store();
    let a1_node = store.get(&a1).unwrap().unwrap();
    assert_eq!(a1_node.direct_volume, Decimal::from(500));
    assert_eq!(a1_node.team_volume, Decimal::from(2500));

    let root = store.get(&r).unwrap().unwrap();
    assert!(root.is_root());
    assert_eq!(root.total_investment, Decimal::ZERO);
    assert_eq!(root.direct_volume, Decimal::from(1000));
    assert_eq!(root.team_volume, Decimal::from(3500));

    let aggregates = store.get_user_aggregates(&r).unwrap();
    assert_eq!(aggregates.direct_referral_count, 1);
}

#[tokio::test]
async fn scenario_b_profit_share_gate() {
    let engine = engine();
    let store = engine.store();
    let (earner, p1, p2) = (addr(10), addr(11), addr(12));

    store.set_referrer(&earner, Some(&p1)).unwrap();
    store.set_referrer(&p1, Some(&p2)).unwrap();
    store.ensure_node(&p2).unwrap();
    // p1 has three direct referrals, p2 has four
    for n in 20..22 {
        store.set_referrer(&addr(n), Some(&p1)).unwrap();
    }
    for n in 30..33 {
        store.set_referrer(&addr(n), Some(&p2)).unwrap();
    }
    engine.aggregator().recompute_all().unwrap();
    assert_eq!(store.get(&p2).unwrap().unwrap().direct_referral_count, 4);

    let quote = engine
        .rewards()
        .quote_profit(&earner, Decimal::from(1000))
        .unwrap();
    assert_eq!(quote.lines.len(), 2);
    assert_eq!(quote.lines[0].beneficiary, p1);
    assert_eq!(quote.lines[0].status, ShareStatus::Paid);
    assert_eq!(quote.lines[0].amount, Decimal::from(200));
    assert_eq!(quote.lines[1].beneficiary, p2);
    assert_eq!(quote.lines[1].status, ShareStatus::Forfeited);
    assert_eq!(quote.total_paid, Decimal::from(200));
    assert_eq!(quote.total_forfeited, Decimal::from(150));
}

#[test]
fn upline_completeness_counts_investment_once() {
    let engine = engine();
    let store = engine.store();
    let (a, b, c, d) = (addr(1), addr(2), addr(3), addr(4));
    store.set_referrer(&a, Some(&b)).unwrap();
    store.set_referrer(&b, Some(&c)).unwrap();
    store.set_referrer(&c, Some(&d)).unwrap();

    match invest(&engine, "tx-1", &a, 750) {
        IngestOutcome::Applied { propagation } => {
            assert_eq!(propagation.visited, vec![b.clone(), c.clone(), d.clone()]);
            assert!(propagation.failures.is_empty());
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    // Replay must not double count
    assert!(matches!(
        invest(&engine, "tx-1", &a, 750),
        IngestOutcome::Duplicate
    ));

    for ancestor in [&b, &c, &d] {
        let node = store.get(ancestor).unwrap().unwrap();
        assert_eq!(node.team_volume, Decimal::from(750), "{ancestor}");
    }
}

#[test]
fn corrupted_cycle_halts_at_depth_cap() {
    let mut config = EngineConfig::default();
    config.max_upline_depth = 12;
    let engine = engine_with(config);
    let store = engine.store();

    // 1 -> 2 -> 3 -> 4 -> 1, written directly to simulate a bad import
    for (child, parent) in [(1, 2), (2, 3), (3, 4), (4, 1)] {
        store.set_referrer(&addr(child), Some(&addr(parent))).unwrap();
    }

    let IngestOutcome::Applied { propagation } = invest(&engine, "tx-loop", &addr(1), 10) else {
        panic!("event should apply");
    };
    assert_eq!(propagation.visited.len(), 12);
    assert!(propagation.depth_cap_hit);

    let downline = store
        .get_downline(
            &addr(1),
            &referral_backend::store::DownlineQuery {
                page: 1,
                limit: 100,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(downline.pagination.total, 3);
}

#[tokio::test(start_paused = true)]
async fn one_failing_address_does_not_stop_the_batch() {
    let engine = engine();
    let root = addr(100);
    let members: Vec<Address> = (1..=10).map(addr).collect();
    let bad = members[6].clone();

    let ledger = Arc::new(FlakyLedger {
        referrers: members.iter().map(|m| (m.clone(), root.clone())).collect(),
        broken: HashSet::from([bad.clone()]),
        healed: AtomicBool::new(false),
    });

    let driver = engine.batch_driver(ledger.clone());
    let mut run = BatchRun::new();
    let progress = driver.run(members.clone(), &mut run).await;

    assert_eq!(progress.processed, 10);
    assert_eq!(progress.success, 9);
    assert_eq!(progress.failed, 1);
    assert_eq!(progress.failed_addresses, vec![bad.clone()]);

    let store = engine.store();
    for member in members.iter().filter(|m| **m != bad) {
        assert_eq!(store.referrer_of(member).unwrap(), Some(root.clone()));
    }
    assert_eq!(store.referrer_of(&bad).unwrap(), None);

    let failures = store.failures().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].error_kind, "ledger_unavailable");

    ledger.healed.store(true, Ordering::SeqCst);
    let mut retry = BatchRun::new();
    let retried = driver.retry_recorded(&mut retry).await.unwrap();
    assert_eq!(retried.total, 1);
    assert_eq!(retried.success, 1);
    assert!(store.failures().unwrap().is_empty());
    assert_eq!(store.referrer_of(&bad).unwrap(), Some(root.clone()));
    assert_eq!(
        store.get(&root).unwrap().unwrap().direct_referral_count,
        10
    );
}

#[tokio::test]
async fn reconcile_is_idempotent() {
    let engine = engine();
    let ledger = Arc::new(SnapshotLedger::from_pairs([(addr(2), addr(1))]));
    let reconciler = engine.reconciler(ledger);

    assert!(reconciler.reconcile(&addr(2)).await.unwrap().changed());
    let before = engine.store().get(&addr(2)).unwrap().unwrap();

    let again = reconciler.reconcile(&addr(2)).await.unwrap();
    assert_eq!(again, ReconcileOutcome::Unchanged { referrer: addr(1) });
    let after = engine.store().get(&addr(2)).unwrap().unwrap();
    assert_eq!(before.updated_at, after.updated_at);
}

#[tokio::test]
async fn ledger_failure_keeps_last_known_referrer() {
    let mut config = EngineConfig::default();
    config.ledger.max_retries = 1;
    let engine = engine_with(config);
    engine.store().set_referrer(&addr(2), Some(&addr(1))).unwrap();

    let ledger = Arc::new(FlakyLedger {
        referrers: HashMap::from([(addr(2), addr(5))]),
        broken: HashSet::from([addr(2)]),
        healed: AtomicBool::new(false),
    });
    let err = engine
        .reconciler(ledger)
        .reconcile(&addr(2))
        .await
        .unwrap_err();
    assert!(matches!(err, ReferralError::LedgerUnavailable { .. }));
    assert_eq!(engine.store().referrer_of(&addr(2)).unwrap(), Some(addr(1)));
}

#[test]
fn aggregation_converges_in_any_order() {
    let mut rng = StdRng::seed_from_u64(7);
    let engine = engine();
    let store = engine.store();

    // Random forest: every node's parent has a smaller id, or it is a root
    let count = 60u32;
    let mut parent_of: HashMap<u32, u32> = HashMap::new();
    let mut investment: HashMap<u32, Decimal> = HashMap::new();
    for n in 1..=count {
        if n > 3 {
            let parent = rng.gen_range(1..n);
            parent_of.insert(n, parent);
            store.set_referrer(&addr(n), Some(&addr(parent))).unwrap();
        } else {
            store.ensure_node(&addr(n)).unwrap();
        }
        let amount = Decimal::new(rng.gen_range(0..1_000_000), 2);
        investment.insert(n, amount);
        store.set_total_investment(&addr(n), amount).unwrap();
    }

    let mut order: Vec<u32> = (1..=count).collect();
    for _round in 0..3 {
        order.shuffle(&mut rng);
        for n in &order {
            engine.aggregator().aggregate(&addr(*n)).unwrap();
        }

        for n in 1..=count {
            let children: Vec<u32> = parent_of
                .iter()
                .filter(|(_, p)| **p == n)
                .map(|(c, _)| *c)
                .collect();
            let node = store.get(&addr(n)).unwrap().unwrap();

            let direct: Decimal = children.iter().map(|c| investment[c]).sum();
            let team: Decimal = children
                .iter()
                .map(|c| investment[c] + store.get(&addr(*c)).unwrap().unwrap().team_volume)
                .sum();
            assert_eq!(node.direct_volume, direct, "direct volume of {n}");
            assert_eq!(node.team_volume, team, "team volume of {n}");
            assert_eq!(node.direct_referral_count as usize, children.len());
        }
    }
}

#[test]
fn rank_boundaries_from_stored_volumes() {
    let engine = engine();
    let store = engine.store();
    let (exact, short_team, short_direct) = (addr(1), addr(2), addr(3));

    store
        .update_volumes(&exact, Decimal::from(20_000), Decimal::from(500_000), 0)
        .unwrap();
    store
        .update_volumes(&short_team, Decimal::from(20_000), Decimal::from(499_999), 0)
        .unwrap();
    store
        .update_volumes(&short_direct, Decimal::from(19_999), Decimal::from(500_000), 0)
        .unwrap();

    let rewards = engine.rewards();
    assert_eq!(
        rewards.eligibility(&exact).unwrap().rank,
        Some(LeaderRank::Diamond)
    );
    assert_eq!(
        rewards.eligibility(&short_team).unwrap().rank,
        Some(LeaderRank::Platinum)
    );
    assert_eq!(
        rewards.eligibility(&short_direct).unwrap().rank,
        Some(LeaderRank::Platinum)
    );
}

#[tokio::test(start_paused = true)]
async fn stop_takes_effect_between_batches() {
    let mut config = EngineConfig::default();
    config.batch = BatchConfig {
        batch_size: 5,
        ..BatchConfig::default()
    };
    let engine = engine_with(config);
    let ledger = Arc::new(SnapshotLedger::from_pairs(
        (2..=16).map(|n| (addr(n), addr(1))),
    ));
    let driver = engine.batch_driver(ledger);

    let mut run = BatchRun::new();
    let stop = run.stop_handle();
    let mut rx = run.subscribe();
    let watcher = tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            if rx.borrow().processed >= 5 {
                stop.stop();
                break;
            }
        }
    });

    let progress = driver.run((2..=16).map(addr).collect(), &mut run).await;
    watcher.await.unwrap();

    assert!(progress.stopped);
    assert_eq!(progress.processed, 5);
    assert_eq!(progress.total, 15);
    assert_eq!(progress.remaining(), 10);

    // Resuming with a fresh run finishes the job without redoing work
    let mut resume = BatchRun::new();
    let rest = driver.run((2..=16).map(addr).collect(), &mut resume).await;
    assert_eq!(rest.processed, 15);
    assert_eq!(rest.changed, 10);
}
