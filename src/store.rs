// =============================================================================
// Store — SQLite persistence for trades, orders, events, settings, telemetry,
// and heatmap snapshots
// =============================================================================
//
// WAL mode so the dashboard can read while the runtime writes. The store is
// the single source of truth for trade state: the scheduler is the only
// writer of new trades, the manager the only writer of mutations to its
// active trade.
// =============================================================================

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};

use crate::types::{AccountMode, OrderKind, OrderRow, Side, Trade, TradeStatus};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS trades(
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    entry REAL NOT NULL,
    sl REAL NOT NULL,
    tp1 REAL, tp2 REAL, tp3 REAL,
    qty REAL NOT NULL,
    status TEXT NOT NULL,
    created_ts INTEGER NOT NULL,
    closed_ts INTEGER,
    exit_price REAL,
    realized_pnl REAL,
    meta_json TEXT,
    account TEXT NOT NULL DEFAULT 'PAPER',
    engine TEXT NOT NULL DEFAULT 'trendscalp',
    exchange TEXT NOT NULL DEFAULT 'delta'
);
CREATE INDEX IF NOT EXISTS idx_trades_status ON trades(status);
CREATE INDEX IF NOT EXISTS idx_trades_engine_closed ON trades(engine, closed_ts);

CREATE TABLE IF NOT EXISTS orders(
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    trade_id INTEGER NOT NULL,
    order_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    side TEXT NOT NULL,
    price REAL NOT NULL,
    qty REAL NOT NULL,
    status TEXT NOT NULL,
    created_ts INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_orders_trade ON orders(trade_id);

CREATE TABLE IF NOT EXISTS events(
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    trade_id INTEGER NOT NULL,
    ts INTEGER NOT NULL,
    tag TEXT NOT NULL,
    note TEXT
);
CREATE INDEX IF NOT EXISTS idx_events_trade ON events(trade_id);

CREATE TABLE IF NOT EXISTS settings(
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    ts INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS telemetry(
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts INTEGER NOT NULL,
    component TEXT NOT NULL,
    tag TEXT NOT NULL,
    message TEXT,
    payload_json TEXT
);
CREATE INDEX IF NOT EXISTS idx_tel_ts ON telemetry(ts);
CREATE INDEX IF NOT EXISTS idx_tel_comp_tag_ts ON telemetry(component, tag, ts);

CREATE TABLE IF NOT EXISTS heatmap_levels(
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts INTEGER NOT NULL,
    tf TEXT NOT NULL,
    payload_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_hm_tf_ts ON heatmap_levels(tf, ts);
"#;

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Thread-safe handle over the runtime database.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("failed to open in-memory database")?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "temp_store", "MEMORY").ok();
        conn.execute_batch(SCHEMA_SQL).context("failed to apply schema")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    // -------------------------------------------------------------------------
    // Trades
    // -------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn new_trade(
        &self,
        symbol: &str,
        side: Side,
        entry: f64,
        sl: f64,
        tps: &[f64],
        qty: f64,
        account: AccountMode,
        engine: &str,
        exchange: &str,
        meta_json: &serde_json::Value,
    ) -> Result<i64> {
        let now = now_ms();
        let tp1 = tps.first().copied();
        let tp2 = tps.get(1).copied();
        let tp3 = tps.get(2).copied();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO trades(symbol, side, entry, sl, tp1, tp2, tp3, qty, status,
                                created_ts, meta_json, account, engine, exchange)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                symbol,
                side.as_str(),
                entry,
                sl,
                tp1,
                tp2,
                tp3,
                qty,
                TradeStatus::Open.as_str(),
                now,
                meta_json.to_string(),
                account.as_str(),
                engine,
                exchange,
            ],
        )?;
        let tid = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO events(trade_id, ts, tag, note) VALUES(?1, ?2, ?3, ?4)",
            params![
                tid,
                now,
                "NEW_TRADE",
                format!("{} @ {entry} | SL {sl} | TPs {tps:?}", side.as_str())
            ],
        )?;
        Ok(tid)
    }

    /// Singleton-position query: number of trades in a live status.
    pub fn open_trade_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM trades WHERE status IN ('OPEN','PARTIAL')",
            [],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    pub fn has_open_trade(&self) -> Result<bool> {
        Ok(self.open_trade_count()? > 0)
    }

    pub fn get_open_trade(&self) -> Result<Option<Trade>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, symbol, side, entry, sl, tp1, tp2, tp3, qty, status, created_ts,
                    closed_ts, exit_price, realized_pnl, account, engine, exchange
             FROM trades WHERE status IN ('OPEN','PARTIAL') ORDER BY id DESC LIMIT 1",
        )?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_trade(row)?)),
            None => Ok(None),
        }
    }

    pub fn list_open_trades(&self) -> Result<Vec<Trade>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, symbol, side, entry, sl, tp1, tp2, tp3, qty, status, created_ts,
                    closed_ts, exit_price, realized_pnl, account, engine, exchange
             FROM trades WHERE status IN ('OPEN','PARTIAL') ORDER BY id ASC",
        )?;
        let mut out = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            out.push(row_to_trade(row)?);
        }
        Ok(out)
    }

    pub fn get_trade(&self, id: i64) -> Result<Option<Trade>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, symbol, side, entry, sl, tp1, tp2, tp3, qty, status, created_ts,
                    closed_ts, exit_price, realized_pnl, account, engine, exchange
             FROM trades WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_trade(row)?)),
            None => Ok(None),
        }
    }

    /// Most recently closed trade, if any.
    pub fn last_closed_trade(&self) -> Result<Option<Trade>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, symbol, side, entry, sl, tp1, tp2, tp3, qty, status, created_ts,
                    closed_ts, exit_price, realized_pnl, account, engine, exchange
             FROM trades WHERE closed_ts IS NOT NULL ORDER BY id DESC LIMIT 1",
        )?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_trade(row)?)),
            None => Ok(None),
        }
    }

    /// (status, closed_ts) of the last two closed trades for an engine.
    pub fn last_closed_for_engine(&self, engine: &str, limit: usize) -> Result<Vec<(TradeStatus, i64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT status, closed_ts FROM trades
             WHERE engine = ?1 AND closed_ts IS NOT NULL
             ORDER BY id DESC LIMIT ?2",
        )?;
        let mut out = Vec::new();
        let mut rows = stmt.query(params![engine, limit as i64])?;
        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            let closed: i64 = row.get(1)?;
            if let Some(st) = TradeStatus::parse(&status) {
                out.push((st, closed));
            }
        }
        Ok(out)
    }

    pub fn close_trade(&self, id: i64, exit_px: f64, pnl: f64, status: TradeStatus) -> Result<()> {
        let now = now_ms();
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE trades SET status=?1, closed_ts=?2, exit_price=?3, realized_pnl=?4 WHERE id=?5",
            params![status.as_str(), now, exit_px, pnl, id],
        )?;
        conn.execute(
            "INSERT INTO events(trade_id, ts, tag, note) VALUES(?1, ?2, 'CLOSED', ?3)",
            params![id, now, format!("{} @ {exit_px}, PnL {pnl:.2}", status.as_str())],
        )?;
        Ok(())
    }

    pub fn update_trade_status(&self, id: i64, status: TradeStatus) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE trades SET status=?1 WHERE id=?2",
            params![status.as_str(), id],
        )?;
        Ok(())
    }

    pub fn update_trade_sl(&self, id: i64, sl: f64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("UPDATE trades SET sl=?1 WHERE id=?2", params![sl, id])?;
        Ok(())
    }

    pub fn update_trade_tps(&self, id: i64, tps: &[f64]) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE trades SET tp1=?1, tp2=?2, tp3=?3 WHERE id=?4",
            params![tps.first(), tps.get(1), tps.get(2), id],
        )?;
        Ok(())
    }

    pub fn update_trade_qty(&self, id: i64, qty: f64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("UPDATE trades SET qty=?1 WHERE id=?2", params![qty, id])?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn add_order(
        &self,
        trade_id: i64,
        order_id: &str,
        kind: OrderKind,
        side: &str,
        price: f64,
        qty: f64,
        status: &str,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO orders(trade_id, order_id, kind, side, price, qty, status, created_ts)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![trade_id, order_id, kind.as_str(), side, price, qty, status, now_ms()],
        )?;
        Ok(())
    }

    pub fn orders_for_trade(&self, trade_id: i64) -> Result<Vec<OrderRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT trade_id, order_id, kind, side, price, qty, status
             FROM orders WHERE trade_id = ?1 ORDER BY id ASC",
        )?;
        let mut out = Vec::new();
        let mut rows = stmt.query(params![trade_id])?;
        while let Some(row) = rows.next()? {
            let kind_s: String = row.get(2)?;
            let Some(kind) = OrderKind::parse(&kind_s) else {
                continue;
            };
            out.push(OrderRow {
                trade_id: row.get(0)?,
                order_id: row.get(1)?,
                kind,
                side: row.get(3)?,
                price: row.get(4)?,
                qty: row.get(5)?,
                status: row.get(6)?,
            });
        }
        Ok(out)
    }

    pub fn update_order_status(&self, order_id: &str, status: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE orders SET status=?1 WHERE order_id=?2",
            params![status, order_id],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Events / settings
    // -------------------------------------------------------------------------

    pub fn append_event(&self, trade_id: i64, tag: &str, note: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO events(trade_id, ts, tag, note) VALUES(?1, ?2, ?3, ?4)",
            params![trade_id, now_ms(), tag, note],
        )?;
        Ok(())
    }

    /// Insert a setting only when absent (boot seeding for dashboard readers).
    pub fn seed_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO settings(key, value, ts) VALUES(?1, ?2, ?3)",
            params![key, value, now_ms()],
        )?;
        Ok(())
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO settings(key, value, ts) VALUES(?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value, ts=excluded.ts",
            params![key, value, now_ms()],
        )?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT value FROM settings WHERE key=?1")?;
        let mut rows = stmt.query(params![key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    // -------------------------------------------------------------------------
    // Telemetry / heatmap snapshots
    // -------------------------------------------------------------------------

    pub fn insert_telemetry(
        &self,
        ts: i64,
        component: &str,
        tag: &str,
        message: &str,
        payload_json: &str,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO telemetry(ts, component, tag, message, payload_json)
             VALUES(?1, ?2, ?3, ?4, ?5)",
            params![ts, component, tag, message, payload_json],
        )?;
        Ok(())
    }

    pub fn save_heatmap(&self, ts: i64, tf: &str, payload_json: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO heatmap_levels(ts, tf, payload_json) VALUES(?1, ?2, ?3)",
            params![ts, tf, payload_json],
        )?;
        Ok(())
    }

    /// Delete heatmap snapshots older than `cutoff_ms`. Returns rows removed.
    pub fn purge_heatmap_before(&self, cutoff_ms: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let n = conn.execute("DELETE FROM heatmap_levels WHERE ts < ?1", params![cutoff_ms])?;
        Ok(n)
    }
}

fn row_to_trade(row: &rusqlite::Row<'_>) -> rusqlite::Result<Trade> {
    let side_s: String = row.get(2)?;
    let status_s: String = row.get(9)?;
    let account_s: String = row.get(14)?;
    Ok(Trade {
        id: row.get(0)?,
        symbol: row.get(1)?,
        side: Side::parse(&side_s).unwrap_or(Side::Long),
        entry: row.get(3)?,
        sl: row.get(4)?,
        tp1: row.get(5)?,
        tp2: row.get(6)?,
        tp3: row.get(7)?,
        qty: row.get(8)?,
        status: TradeStatus::parse(&status_s).unwrap_or(TradeStatus::Open),
        created_ts: row.get(10)?,
        closed_ts: row.get(11)?,
        exit_price: row.get(12)?,
        realized_pnl: row.get(13)?,
        account: if account_s == "LIVE" { AccountMode::Live } else { AccountMode::Paper },
        engine: row.get(15)?,
        exchange: row.get(16)?,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn make_trade(s: &Store) -> i64 {
        s.new_trade(
            "SOLUSD",
            Side::Long,
            100.0,
            99.0,
            &[100.6, 101.0, 101.5],
            5.0,
            AccountMode::Paper,
            "trendscalp",
            "delta",
            &serde_json::json!({"engine": "trendscalp"}),
        )
        .unwrap()
    }

    #[test]
    fn new_trade_roundtrip() {
        let s = store();
        let tid = make_trade(&s);
        let t = s.get_trade(tid).unwrap().unwrap();
        assert_eq!(t.symbol, "SOLUSD");
        assert_eq!(t.side, Side::Long);
        assert_eq!(t.status, TradeStatus::Open);
        assert_eq!(t.tps(), vec![100.6, 101.0, 101.5]);
        assert_eq!(t.engine, "trendscalp");
    }

    #[test]
    fn singleton_count_tracks_live_statuses() {
        let s = store();
        assert_eq!(s.open_trade_count().unwrap(), 0);
        let tid = make_trade(&s);
        assert_eq!(s.open_trade_count().unwrap(), 1);
        assert!(s.has_open_trade().unwrap());

        s.update_trade_status(tid, TradeStatus::Partial).unwrap();
        assert_eq!(s.open_trade_count().unwrap(), 1);

        s.close_trade(tid, 100.6, 3.0, TradeStatus::ClosedTp).unwrap();
        assert_eq!(s.open_trade_count().unwrap(), 0);
        assert!(!s.has_open_trade().unwrap());
    }

    #[test]
    fn close_trade_records_exit_fields() {
        let s = store();
        let tid = make_trade(&s);
        s.close_trade(tid, 99.0, -5.0, TradeStatus::ClosedSl).unwrap();
        let t = s.get_trade(tid).unwrap().unwrap();
        assert_eq!(t.status, TradeStatus::ClosedSl);
        assert_eq!(t.exit_price, Some(99.0));
        assert_eq!(t.realized_pnl, Some(-5.0));
        assert!(t.closed_ts.is_some());

        let last = s.last_closed_trade().unwrap().unwrap();
        assert_eq!(last.id, tid);
    }

    #[test]
    fn sl_and_tp_mutations_persist() {
        let s = store();
        let tid = make_trade(&s);
        s.update_trade_sl(tid, 99.5).unwrap();
        s.update_trade_tps(tid, &[100.7, 101.2]).unwrap();
        s.update_trade_qty(tid, 2.5).unwrap();
        let t = s.get_trade(tid).unwrap().unwrap();
        assert_eq!(t.sl, 99.5);
        assert_eq!(t.tps(), vec![100.7, 101.2]);
        assert_eq!(t.qty, 2.5);
        assert_eq!(t.tp3, None);
    }

    #[test]
    fn orders_roundtrip_and_status_update() {
        let s = store();
        let tid = make_trade(&s);
        s.add_order(tid, "p-1", OrderKind::MarketEntry, "buy", 100.0, 5.0, "filled").unwrap();
        s.add_order(tid, "p-2", OrderKind::StopLoss, "sell", 99.0, 5.0, "open").unwrap();
        s.add_order(tid, "p-3", OrderKind::TakeProfit1, "sell", 100.6, 2.5, "open").unwrap();

        let orders = s.orders_for_trade(tid).unwrap();
        assert_eq!(orders.len(), 3);
        assert_eq!(orders[0].kind, OrderKind::MarketEntry);
        assert_eq!(orders[1].kind, OrderKind::StopLoss);

        s.update_order_status("p-2", "canceled").unwrap();
        let orders = s.orders_for_trade(tid).unwrap();
        assert_eq!(orders[1].status, "canceled");
    }

    #[test]
    fn engine_close_history() {
        let s = store();
        let a = make_trade(&s);
        s.close_trade(a, 99.0, -5.0, TradeStatus::ClosedSl).unwrap();
        let b = make_trade(&s);
        s.close_trade(b, 99.0, -5.0, TradeStatus::ClosedSl).unwrap();

        let hist = s.last_closed_for_engine("trendscalp", 2).unwrap();
        assert_eq!(hist.len(), 2);
        assert!(hist.iter().all(|(st, _)| *st == TradeStatus::ClosedSl));
        assert!(s.last_closed_for_engine("taser", 2).unwrap().is_empty());
    }

    #[test]
    fn settings_seed_does_not_overwrite() {
        let s = store();
        s.seed_setting("AUTO_TRADING", "true").unwrap();
        s.seed_setting("AUTO_TRADING", "false").unwrap();
        assert_eq!(s.get_setting("AUTO_TRADING").unwrap().as_deref(), Some("true"));

        s.set_setting("AUTO_TRADING", "false").unwrap();
        assert_eq!(s.get_setting("AUTO_TRADING").unwrap().as_deref(), Some("false"));
        assert_eq!(s.get_setting("MISSING").unwrap(), None);
    }

    #[test]
    fn heatmap_purge_respects_cutoff() {
        let s = store();
        s.save_heatmap(1_000, "5m", "{}").unwrap();
        s.save_heatmap(2_000, "5m", "{}").unwrap();
        s.save_heatmap(3_000, "1h", "{}").unwrap();
        let removed = s.purge_heatmap_before(2_500).unwrap();
        assert_eq!(removed, 2);
        let removed = s.purge_heatmap_before(2_500).unwrap();
        assert_eq!(removed, 0);
    }

    #[test]
    fn telemetry_rows_insert() {
        let s = store();
        s.insert_telemetry(now_ms(), "scan", "NO_TRADE", "no setup", "{}").unwrap();
        // No read API needed by the runtime; presence via raw count.
        let n: i64 = s
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM telemetry", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 1);
    }
}
