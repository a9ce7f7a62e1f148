//! SQLite-backed persistence for positions and order history
//!
//! Single-writer embedded store. Every write runs inside a `BEGIN IMMEDIATE`
//! transaction and either commits fully or rolls back and surfaces the error,
//! so the engine can rely on what it reads after a crash. Position and order
//! payloads are JSON with decimals encoded as strings.
//!
//! The API is synchronous; async callers run writes on the blocking pool.

pub mod migrations;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::order_state::OrderState;
use crate::position::PositionState;
use crate::types::Side;

/// Classification of a persisted venue order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Entry,
    Stop,
    ForceExit,
}

/// One row per venue interaction, retained after terminal states for history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub position_id: String,
    pub kind: OrderKind,
    pub side: Side,
    pub price: Decimal,
    pub qty: Decimal,
    pub state: OrderState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderRecord {
    pub fn new(
        order_id: &str,
        position_id: &str,
        kind: OrderKind,
        side: Side,
        price: Decimal,
        qty: Decimal,
        state: OrderState,
    ) -> Self {
        let now = Utc::now();
        Self {
            order_id: order_id.to_string(),
            position_id: position_id.to_string(),
            kind,
            side,
            price,
            qty,
            state,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Embedded relational store with ACID single-writer semantics.
///
/// Cloning is cheap; clones share one connection behind a mutex, which
/// serialises all access in-process while `BEGIN IMMEDIATE` serialises
/// writers across processes.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the store at `path` and apply pending migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create state dir {}", parent.display()))?;
            }
        }

        let mut conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        migrations::apply_migrations(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migrations::apply_migrations(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Upsert the full position payload.
    pub fn save_position(&self, position_id: &str, pos: &PositionState) -> Result<()> {
        let value = serde_json::to_string(pos).context("Failed to encode position")?;
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT OR REPLACE INTO positions(position_id, value, updated_at) VALUES(?1, ?2, ?3)",
            params![position_id, value, Utc::now().to_rfc3339()],
        )?;
        tx.commit().context("Failed to commit position")?;
        debug!(
            "Position saved | position_id={} qty={} stop_order_id={:?}",
            position_id, pos.qty_filled, pos.stop_order_id
        );
        Ok(())
    }

    pub fn load_position(&self, position_id: &str) -> Result<Option<PositionState>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM positions WHERE position_id = ?1",
                params![position_id],
                |row| row.get(0),
            )
            .optional()?;
        match value {
            Some(json) => {
                let pos = serde_json::from_str(&json).context("Failed to decode position")?;
                Ok(Some(pos))
            }
            None => Ok(None),
        }
    }

    pub fn list_positions(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare("SELECT position_id FROM positions ORDER BY position_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    /// Upsert an order record. `created_at` of an existing row is preserved;
    /// `updated_at` always moves forward.
    pub fn save_order(&self, record: &OrderRecord) -> Result<()> {
        let value = serde_json::to_string(record).context("Failed to encode order")?;
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT OR REPLACE INTO orders(order_id, position_id, value, state, created_at, updated_at)
             VALUES(?1, ?2, ?3, ?4,
                    COALESCE((SELECT created_at FROM orders WHERE order_id = ?1), ?5),
                    ?6)",
            params![
                record.order_id,
                record.position_id,
                value,
                record.state.as_str(),
                record.created_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        tx.commit().context("Failed to commit order")?;
        debug!(
            "Order saved | order_id={} state={}",
            record.order_id,
            record.state.as_str()
        );
        Ok(())
    }

    pub fn get_order(&self, order_id: &str) -> Result<Option<OrderRecord>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT value, created_at FROM orders WHERE order_id = ?1",
                params![order_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((json, created_at)) => Ok(Some(Self::decode_order(&json, &created_at)?)),
            None => Ok(None),
        }
    }

    pub fn list_orders(&self, position_id: &str) -> Result<Vec<OrderRecord>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT value, created_at FROM orders WHERE position_id = ?1 ORDER BY created_at, order_id",
        )?;
        let rows = stmt
            .query_map(params![position_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<(String, String)>>>()?;

        rows.iter()
            .map(|(json, created_at)| Self::decode_order(json, created_at))
            .collect()
    }

    /// Everything the engine needs for startup reconciliation, keyed by
    /// position.
    pub fn load_all(&self) -> Result<HashMap<String, (PositionState, Vec<OrderRecord>)>> {
        let position_ids = self.list_positions()?;
        let mut out = HashMap::new();
        for position_id in position_ids {
            if let Some(pos) = self.load_position(&position_id)? {
                let orders = self.list_orders(&position_id)?;
                out.insert(position_id, (pos, orders));
            }
        }
        Ok(out)
    }

    fn decode_order(json: &str, created_at: &str) -> Result<OrderRecord> {
        let mut record: OrderRecord =
            serde_json::from_str(json).context("Failed to decode order")?;
        // the column is authoritative after upserts
        record.created_at = DateTime::parse_from_rfc3339(created_at)
            .context("Invalid created_at in orders table")?
            .with_timezone(&Utc);
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn sample_position() -> PositionState {
        let mut pos = PositionState::new(dec!(100), dec!(1));
        pos.ratchet_stop(dec!(100), dec!(0.02), dec!(0.005), Decimal::ZERO);
        pos.stop_order_id = Some("s1".to_string());
        pos
    }

    #[test]
    fn test_position_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let pos = sample_position();
        store.save_position("BTC-USD", &pos).unwrap();
        let loaded = store.load_position("BTC-USD").unwrap().unwrap();
        assert_eq!(loaded, pos);
    }

    #[test]
    fn test_position_round_trip_with_nones() {
        let store = SqliteStore::open_in_memory().unwrap();
        let pos = PositionState::new(dec!(123.456), dec!(0.5));
        store.save_position("ETH-USD", &pos).unwrap();
        let loaded = store.load_position("ETH-USD").unwrap().unwrap();
        assert_eq!(loaded, pos);
        assert!(loaded.current_stop_trigger.is_none());
        assert!(loaded.stop_order_id.is_none());
    }

    #[test]
    fn test_load_missing_position() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.load_position("nope").unwrap().is_none());
    }

    #[test]
    fn test_position_upsert_overwrites() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut pos = sample_position();
        store.save_position("BTC-USD", &pos).unwrap();

        pos.qty_filled = Decimal::ZERO;
        pos.stop_order_id = None;
        store.save_position("BTC-USD", &pos).unwrap();

        let loaded = store.load_position("BTC-USD").unwrap().unwrap();
        assert_eq!(loaded.qty_filled, Decimal::ZERO);
        assert_eq!(store.list_positions().unwrap().len(), 1);
    }

    #[test]
    fn test_order_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let record = OrderRecord::new(
            "o1",
            "BTC-USD",
            OrderKind::Entry,
            Side::Buy,
            dec!(50000),
            dec!(0.1),
            OrderState::Open,
        );
        store.save_order(&record).unwrap();
        let loaded = store.get_order("o1").unwrap().unwrap();
        assert_eq!(loaded.kind, OrderKind::Entry);
        assert_eq!(loaded.price, dec!(50000));
        assert_eq!(loaded.state, OrderState::Open);
    }

    #[test]
    fn test_order_upsert_preserves_created_at() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut record = OrderRecord::new(
            "o1",
            "BTC-USD",
            OrderKind::Stop,
            Side::Sell,
            dec!(98),
            dec!(1),
            OrderState::Open,
        );
        let original_created = record.created_at;
        store.save_order(&record).unwrap();

        // a later upsert claims a different creation time; the row keeps the first
        record.state = OrderState::Cancelled;
        record.created_at = original_created + Duration::hours(3);
        store.save_order(&record).unwrap();

        let loaded = store.get_order("o1").unwrap().unwrap();
        assert_eq!(loaded.state, OrderState::Cancelled);
        assert_eq!(
            loaded.created_at.timestamp_millis(),
            original_created.timestamp_millis()
        );
    }

    #[test]
    fn test_list_orders_by_position() {
        let store = SqliteStore::open_in_memory().unwrap();
        for (id, kind) in [("o1", OrderKind::Entry), ("o2", OrderKind::Stop)] {
            store
                .save_order(&OrderRecord::new(
                    id,
                    "BTC-USD",
                    kind,
                    Side::Buy,
                    dec!(1),
                    dec!(1),
                    OrderState::Open,
                ))
                .unwrap();
        }
        store
            .save_order(&OrderRecord::new(
                "o3",
                "ETH-USD",
                OrderKind::Entry,
                Side::Buy,
                dec!(1),
                dec!(1),
                OrderState::Open,
            ))
            .unwrap();

        let orders = store.list_orders("BTC-USD").unwrap();
        assert_eq!(orders.len(), 2);
        assert!(orders.iter().all(|o| o.position_id == "BTC-USD"));
    }

    #[test]
    fn test_load_all() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.save_position("BTC-USD", &sample_position()).unwrap();
        store
            .save_order(&OrderRecord::new(
                "o1",
                "BTC-USD",
                OrderKind::Entry,
                Side::Buy,
                dec!(100),
                dec!(1),
                OrderState::Filled,
            ))
            .unwrap();

        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 1);
        let (pos, orders) = &all["BTC-USD"];
        assert_eq!(pos.entry_price, dec!(100));
        assert_eq!(orders.len(), 1);
    }

    #[test]
    fn test_open_creates_file_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("trading.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.save_position("BTC-USD", &sample_position()).unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let loaded = store.load_position("BTC-USD").unwrap().unwrap();
        assert_eq!(loaded.stop_order_id, Some("s1".to_string()));
    }
}
