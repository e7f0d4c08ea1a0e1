//! Node Store
//! Mission: durable address → node map with upsert-with-defaults semantics
//!
//! - One SQLite connection behind a mutex, WAL mode for concurrent readers
//! - Every write touches a single node row (last writer wins)
//! - Nodes are never deleted, only deactivated
//! - Amounts are stored as decimal strings so no precision is lost

pub mod reporting;

use std::collections::{HashSet, VecDeque};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::error::{ReferralError, ReferralResult};
use crate::models::{checked_add, Address, InvestmentEvent, Node, NodeOrigin};

pub use reporting::{DownlineEntry, DownlinePage, DownlineQuery, Pagination, UserAggregates};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS nodes (
    address TEXT PRIMARY KEY,
    referrer TEXT,
    total_investment TEXT NOT NULL DEFAULT '0',
    direct_volume TEXT NOT NULL DEFAULT '0',
    team_volume TEXT NOT NULL DEFAULT '0',
    direct_referral_count INTEGER NOT NULL DEFAULT 0,
    origin TEXT NOT NULL DEFAULT 'stub',
    is_active INTEGER NOT NULL DEFAULT 1,
    joined_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_nodes_referrer
    ON nodes(referrer, joined_at ASC);

-- Applied investment events; the primary key makes replays no-ops
CREATE TABLE IF NOT EXISTS investment_events (
    event_id TEXT PRIMARY KEY,
    investor TEXT NOT NULL,
    amount TEXT NOT NULL,
    occurred_at INTEGER NOT NULL,
    recorded_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_investment_events_investor
    ON investment_events(investor, occurred_at DESC);

-- Last reconcile failure per address, cleared on the next success
CREATE TABLE IF NOT EXISTS reconcile_failures (
    address TEXT PRIMARY KEY,
    error_kind TEXT NOT NULL,
    error TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 1,
    failed_at INTEGER NOT NULL
) WITHOUT ROWID;
"#;

const NODE_COLUMNS: &str = "address, referrer, total_investment, direct_volume, team_volume, \
     direct_referral_count, origin, is_active, joined_at, updated_at";

/// A child row as needed by volume aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildInvestment {
    pub address: Address,
    pub total_investment: Decimal,
}

/// Persisted reconcile failure.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct FailureRecord {
    pub address: Address,
    pub error_kind: String,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

pub struct NodeStore {
    conn: Arc<Mutex<Connection>>,
}

impl NodeStore {
    pub fn open(db_path: &str) -> ReferralResult<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking

        let conn = Connection::open_with_flags(db_path, flags)?;
        conn.execute_batch(SCHEMA_SQL)?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if db_path != ":memory:" && journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM nodes", [], |row| row.get(0))
            .unwrap_or(0);
        info!("📊 Node store opened at {} ({} nodes)", db_path, count);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> ReferralResult<Self> {
        Self::open(":memory:")
    }

    pub fn len(&self) -> ReferralResult<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM nodes", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> ReferralResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn get(&self, address: &Address) -> ReferralResult<Option<Node>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE address = ?1"
        ))?;
        Ok(stmt
            .query_row(params![address.as_str()], node_from_row)
            .optional()?)
    }

    /// Create a stub node if `address` is unknown. Returns true when created.
    pub fn ensure_node(&self, address: &Address) -> ReferralResult<bool> {
        if address.is_zero() {
            return Err(ReferralError::invalid_address(
                address.as_str(),
                "zero address cannot be stored as a node",
            ));
        }
        let now = Utc::now().timestamp_millis();
        let conn = self.conn.lock();
        let created = conn.execute(
            "INSERT OR IGNORE INTO nodes (address, joined_at, updated_at) VALUES (?1, ?2, ?2)",
            params![address.as_str(), now],
        )? == 1;
        if created {
            debug!(%address, "Stub node created");
        }
        Ok(created)
    }

    pub fn referrer_of(&self, address: &Address) -> ReferralResult<Option<Address>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT referrer FROM nodes WHERE address = ?1")?;
        let raw: Option<Option<String>> = stmt
            .query_row(params![address.as_str()], |row| row.get(0))
            .optional()?;
        raw.flatten()
            .map(|s| parse_address_column(&s, 0))
            .transpose()
            .map_err(ReferralError::from)
    }

    /// Rewrite the parent pointer. Only the reconciler should call this.
    pub fn set_referrer(
        &self,
        address: &Address,
        referrer: Option<&Address>,
    ) -> ReferralResult<()> {
        if referrer == Some(address) {
            return Err(ReferralError::invalid_address(
                address.as_str(),
                "node cannot refer itself",
            ));
        }
        if referrer.is_some_and(|r| r.is_zero()) {
            return Err(ReferralError::invalid_address(
                address.as_str(),
                "zero address is not a referrer; use None for roots",
            ));
        }
        let now = Utc::now().timestamp_millis();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO nodes (address, referrer, joined_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(address) DO UPDATE SET
                referrer = excluded.referrer,
                updated_at = excluded.updated_at",
            params![address.as_str(), referrer.map(|r| r.as_str()), now],
        )?;
        Ok(())
    }

    /// Overwrite the investment total, e.g. when syncing from an external book.
    pub fn set_total_investment(&self, address: &Address, amount: Decimal) -> ReferralResult<()> {
        if amount.is_sign_negative() {
            return Err(ReferralError::InvalidAmount(format!(
                "total investment must be non-negative, got {amount}"
            )));
        }
        let now = Utc::now().timestamp_millis();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO nodes (address, total_investment, origin, joined_at, updated_at)
             VALUES (?1, ?2, 'registered', ?3, ?3)
             ON CONFLICT(address) DO UPDATE SET
                total_investment = excluded.total_investment,
                origin = 'registered',
                updated_at = excluded.updated_at",
            params![address.as_str(), amount.to_string(), now],
        )?;
        Ok(())
    }

    /// Record an investment event and bump the investor's total atomically.
    /// Returns false when `event_id` was already applied.
    pub fn apply_investment(&self, event: &InvestmentEvent) -> ReferralResult<bool> {
        let now = Utc::now().timestamp_millis();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO investment_events (event_id, investor, amount, occurred_at, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                &event.event_id,
                event.investor.as_str(),
                event.amount.to_string(),
                event.occurred_at.timestamp_millis(),
                now,
            ],
        )?;
        if inserted == 0 {
            debug!(event_id = %event.event_id, "Investment event already applied");
            return Ok(false);
        }

        let current: Option<String> = tx
            .query_row(
                "SELECT total_investment FROM nodes WHERE address = ?1",
                params![event.investor.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let current = match current {
            Some(s) => parse_decimal_column(&s, 0)?,
            None => Decimal::ZERO,
        };
        let total = checked_add(current, event.amount)?;

        tx.execute(
            "INSERT INTO nodes (address, total_investment, origin, is_active, joined_at, updated_at)
             VALUES (?1, ?2, 'registered', 1, ?3, ?3)
             ON CONFLICT(address) DO UPDATE SET
                total_investment = excluded.total_investment,
                origin = 'registered',
                is_active = 1,
                updated_at = excluded.updated_at",
            params![event.investor.as_str(), total.to_string(), now],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Persist derived volumes. Only the aggregator should call this.
    pub fn update_volumes(
        &self,
        address: &Address,
        direct_volume: Decimal,
        team_volume: Decimal,
        direct_referral_count: u32,
    ) -> ReferralResult<()> {
        let now = Utc::now().timestamp_millis();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO nodes (address, direct_volume, team_volume, direct_referral_count, joined_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(address) DO UPDATE SET
                direct_volume = excluded.direct_volume,
                team_volume = excluded.team_volume,
                direct_referral_count = excluded.direct_referral_count,
                updated_at = excluded.updated_at",
            params![
                address.as_str(),
                direct_volume.to_string(),
                team_volume.to_string(),
                direct_referral_count,
                now,
            ],
        )?;
        Ok(())
    }

    /// Soft delete. Returns false if the node does not exist.
    pub fn deactivate(&self, address: &Address) -> ReferralResult<bool> {
        let now = Utc::now().timestamp_millis();
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE nodes SET is_active = 0, updated_at = ?2 WHERE address = ?1",
            params![address.as_str(), now],
        )?;
        if changed == 1 {
            info!(%address, "Node deactivated");
        }
        Ok(changed == 1)
    }

    pub fn children_of(&self, address: &Address) -> ReferralResult<Vec<ChildInvestment>> {
        let conn = self.conn.lock();
        query_children(&conn, address)
    }

    /// Breadth-first downline of `root` with 1-based levels. Each node is
    /// visited once, so a corrupted cycle cannot loop.
    pub fn descendants(&self, root: &Address) -> ReferralResult<Vec<(ChildInvestment, u32)>> {
        let conn = self.conn.lock();
        let mut out = Vec::new();
        let mut seen: HashSet<Address> = HashSet::from([root.clone()]);
        let mut queue: VecDeque<(Address, u32)> = VecDeque::from([(root.clone(), 0)]);

        while let Some((current, level)) = queue.pop_front() {
            for child in query_children(&conn, &current)? {
                if !seen.insert(child.address.clone()) {
                    warn!(
                        root = %root,
                        revisited = %child.address,
                        "Downline revisits a node; referrer data is not a forest"
                    );
                    continue;
                }
                queue.push_back((child.address.clone(), level + 1));
                out.push((child, level + 1));
            }
        }
        Ok(out)
    }

    /// Ancestors of `address`, nearest first, at most `max_levels` of them.
    pub fn upline(&self, address: &Address, max_levels: usize) -> ReferralResult<Vec<Node>> {
        let mut out = Vec::with_capacity(max_levels.min(32));
        let mut current = address.clone();
        for _ in 0..max_levels {
            let Some(parent) = self.referrer_of(&current)? else {
                break;
            };
            let node = match self.get(&parent)? {
                Some(node) => node,
                None => {
                    self.ensure_node(&parent)?;
                    self.get(&parent)?.ok_or_else(|| {
                        ReferralError::StoreUnavailable(rusqlite::Error::QueryReturnedNoRows)
                    })?
                }
            };
            out.push(node);
            current = parent;
        }
        Ok(out)
    }

    pub fn addresses(&self) -> ReferralResult<Vec<Address>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT address FROM nodes ORDER BY address ASC")?;
        let rows = stmt.query_map([], |row| {
            let raw: String = row.get(0)?;
            parse_address_column(&raw, 0)
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Every node, for pure downstream transforms.
    pub fn snapshot(&self) -> ReferralResult<Vec<Node>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes ORDER BY joined_at ASC, address ASC"
        ))?;
        let rows = stmt.query_map([], node_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn record_failure(&self, address: &Address, error: &ReferralError) -> ReferralResult<()> {
        let now = Utc::now().timestamp_millis();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO reconcile_failures (address, error_kind, error, attempts, failed_at)
             VALUES (?1, ?2, ?3, 1, ?4)
             ON CONFLICT(address) DO UPDATE SET
                error_kind = excluded.error_kind,
                error = excluded.error,
                attempts = reconcile_failures.attempts + 1,
                failed_at = excluded.failed_at",
            params![address.as_str(), error.kind(), error.to_string(), now],
        )?;
        Ok(())
    }

    pub fn clear_failure(&self, address: &Address) -> ReferralResult<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM reconcile_failures WHERE address = ?1",
            params![address.as_str()],
        )?;
        Ok(removed == 1)
    }

    pub fn failures(&self) -> ReferralResult<Vec<FailureRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT address, error_kind, error, attempts, failed_at
             FROM reconcile_failures ORDER BY failed_at ASC, address ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let raw: String = row.get(0)?;
            Ok(FailureRecord {
                address: parse_address_column(&raw, 0)?,
                error_kind: row.get(1)?,
                error: row.get(2)?,
                attempts: row.get(3)?,
                failed_at: millis_to_datetime(row.get(4)?),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn failed_addresses(&self) -> ReferralResult<Vec<Address>> {
        Ok(self.failures()?.into_iter().map(|f| f.address).collect())
    }
}

fn query_children(conn: &Connection, address: &Address) -> ReferralResult<Vec<ChildInvestment>> {
    let mut stmt = conn.prepare_cached(
        "SELECT address, total_investment FROM nodes
         WHERE referrer = ?1 ORDER BY joined_at ASC, address ASC",
    )?;
    let rows = stmt.query_map(params![address.as_str()], |row| {
        let raw_address: String = row.get(0)?;
        let raw_amount: String = row.get(1)?;
        Ok(ChildInvestment {
            address: parse_address_column(&raw_address, 0)?,
            total_investment: parse_decimal_column(&raw_amount, 1)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<Node> {
    let address: String = row.get(0)?;
    let referrer: Option<String> = row.get(1)?;
    let total_investment: String = row.get(2)?;
    let direct_volume: String = row.get(3)?;
    let team_volume: String = row.get(4)?;
    let origin: String = row.get(6)?;
    let is_active: i64 = row.get(7)?;

    Ok(Node {
        address: parse_address_column(&address, 0)?,
        referrer: referrer
            .map(|r| parse_address_column(&r, 1))
            .transpose()?,
        total_investment: parse_decimal_column(&total_investment, 2)?,
        direct_volume: parse_decimal_column(&direct_volume, 3)?,
        team_volume: parse_decimal_column(&team_volume, 4)?,
        direct_referral_count: row.get(5)?,
        origin: NodeOrigin::from_str(&origin).unwrap_or(NodeOrigin::Stub),
        is_active: is_active != 0,
        joined_at: millis_to_datetime(row.get(8)?),
        updated_at: millis_to_datetime(row.get(9)?),
    })
}

fn parse_address_column(raw: &str, idx: usize) -> rusqlite::Result<Address> {
    Address::parse(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_decimal_column(raw: &str, idx: usize) -> rusqlite::Result<Decimal> {
    Decimal::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
