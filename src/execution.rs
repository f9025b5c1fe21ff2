// =============================================================================
// Execution Adapter — paper/live brackets, partials, idempotent TP amendment
// =============================================================================
//
// Paper mode records synthetic order rows so the manager can reconcile state
// exactly as it would against the venue; live mode translates to exchange
// calls and records the returned ids. Brackets are idempotent per trade
// (a second place_bracket for the same trade id is a no-op), partial TP1
// placement is idempotent by price, and TP amendment cancels only the
// reduce-only targets that no longer match.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::exchange::DeltaClient;
use crate::guards::round4;
use crate::store::{now_ms, Store};
use crate::telemetry::Telemetry;
use crate::tp_calc::normalize_fracs;
use crate::types::{OrderKind, OrderRow, Side, Signal};

/// Relative price tolerance for idempotent TP placement.
const TP_PRICE_TOL: f64 = 0.0005;

fn paper_oid(kind: &str) -> String {
    format!("paper-{}-{}-{kind}", now_ms(), &Uuid::new_v4().to_string()[..6])
}

fn entry_exit_sides(side: Side) -> (&'static str, &'static str) {
    if side.is_long() {
        ("buy", "sell")
    } else {
        ("sell", "buy")
    }
}

pub struct ExecutionEngine {
    client: Arc<DeltaClient>,
    store: Arc<Store>,
    tel: Telemetry,
    paper: bool,
}

impl ExecutionEngine {
    pub fn new(client: Arc<DeltaClient>, store: Arc<Store>, tel: Telemetry, paper: bool) -> Self {
        Self { client, store, tel, paper }
    }

    fn open_orders(&self, trade_id: i64) -> Vec<OrderRow> {
        self.store.orders_for_trade(trade_id).unwrap_or_default()
    }

    /// True when a market entry already exists for this trade.
    fn already_bracketed(&self, trade_id: i64) -> bool {
        self.open_orders(trade_id).iter().any(|o| {
            o.kind == OrderKind::MarketEntry && (o.status == "open" || o.status == "filled")
        })
    }

    // -------------------------------------------------------------------------
    // Bracket placement
    // -------------------------------------------------------------------------

    /// Place the entry + protective stop + reduce-only TP ladder. Returns the
    /// recorded order ids; an existing bracket yields an empty list.
    pub async fn place_bracket(&self, sig: &Signal, qty: f64, trade_id: i64, cfg: &Config) -> Result<Vec<String>> {
        let side = sig.side.context("cannot place bracket for a NONE signal")?;
        anyhow::ensure!(qty > 0.0, "quantity must be > 0");

        if self.already_bracketed(trade_id) {
            self.tel.log(
                "exec",
                "BRACKET_EXISTS",
                "skipping duplicate bracket for trade",
                serde_json::json!({ "trade_id": trade_id, "engine": sig.meta.engine }),
            );
            return Ok(Vec::new());
        }

        let (entry_side, exit_side) = entry_exit_sides(side);
        let entry_px = round4(sig.entry);
        let sl_px = round4(sig.sl);

        // Per-level quantities: structured fractions when enabled, otherwise
        // an equal split across the ladder.
        let levels: Vec<(f64, f64)> = if sig.tps.is_empty() {
            Vec::new()
        } else if cfg.tp.structured {
            let fracs = normalize_fracs(&cfg.tp.fractions);
            sig.tps
                .iter()
                .enumerate()
                .map(|(i, &px)| (round4(px), qty * fracs.get(i).copied().unwrap_or(0.0)))
                .collect()
        } else {
            let share = qty / sig.tps.len() as f64;
            sig.tps.iter().map(|&px| (round4(px), share)).collect()
        };

        let mut order_ids = Vec::new();

        if self.paper {
            let eid = paper_oid("entry");
            self.store
                .add_order(trade_id, &eid, OrderKind::MarketEntry, entry_side, entry_px, qty, "filled")?;
            order_ids.push(eid);

            let sid = paper_oid("sl");
            self.store
                .add_order(trade_id, &sid, OrderKind::StopLoss, exit_side, sl_px, qty, "open")?;
            order_ids.push(sid);

            for (idx, &(px, tp_qty)) in levels.iter().enumerate() {
                if tp_qty <= 0.0 {
                    continue;
                }
                let oid = paper_oid(&format!("tp{}", idx + 1));
                self.store
                    .add_order(trade_id, &oid, OrderKind::take_profit(idx + 1), exit_side, px, tp_qty, "open")?;
                order_ids.push(oid);
            }

            self.tel.log(
                "exec",
                "PAPER_ORDERS",
                "paper bracket created",
                serde_json::json!({
                    "trade_id": trade_id,
                    "entry": entry_px,
                    "sl": sl_px,
                    "tps": sig.tps,
                    "qty": qty,
                    "engine": sig.meta.engine,
                }),
            );
            return Ok(order_ids);
        }

        // ---- live path --------------------------------------------------
        let entry_order = self
            .client
            .create_order("market", entry_side, qty, None, false, None)
            .await
            .map_err(|e| {
                self.tel.log(
                    "exec",
                    "ENTRY_ERROR",
                    &e.to_string(),
                    serde_json::json!({ "trade_id": trade_id, "engine": sig.meta.engine }),
                );
                e
            })?;
        let entry_id = entry_order
            .get("id")
            .map(json_id)
            .unwrap_or_else(|| paper_oid("entry"));
        let filled_px = entry_order
            .get("average")
            .or_else(|| entry_order.get("price"))
            .and_then(|v| v.as_f64())
            .unwrap_or(entry_px);
        self.store.add_order(
            trade_id,
            &entry_id,
            OrderKind::MarketEntry,
            entry_side,
            round4(filled_px),
            qty,
            "filled",
        )?;
        order_ids.push(entry_id);

        match self
            .client
            .create_order("stop", exit_side, qty, None, true, Some(sl_px))
            .await
        {
            Ok(sl_order) => {
                let oid = sl_order.get("id").map(json_id).unwrap_or_else(|| paper_oid("sl"));
                self.store
                    .add_order(trade_id, &oid, OrderKind::StopLoss, exit_side, sl_px, qty, "open")?;
                order_ids.push(oid);
            }
            Err(e) => {
                self.store.append_event(trade_id, "SL_ERROR", &format!("SL failed: {e}")).ok();
                self.tel.log(
                    "exec",
                    "SL_ERROR",
                    &e.to_string(),
                    serde_json::json!({ "trade_id": trade_id }),
                );
            }
        }

        for (idx, &(px, tp_qty)) in levels.iter().enumerate() {
            if tp_qty <= 0.0 {
                continue;
            }
            match self
                .client
                .create_order("limit", exit_side, tp_qty, Some(px), true, None)
                .await
            {
                Ok(tp_order) => {
                    let oid = tp_order
                        .get("id")
                        .map(json_id)
                        .unwrap_or_else(|| paper_oid("tp"));
                    self.store.add_order(
                        trade_id,
                        &oid,
                        OrderKind::take_profit(idx + 1),
                        exit_side,
                        px,
                        tp_qty,
                        "open",
                    )?;
                    order_ids.push(oid);
                }
                Err(e) => {
                    self.store
                        .append_event(trade_id, "TP_ERROR", &format!("TP{} failed: {e}", idx + 1))
                        .ok();
                    self.tel.log(
                        "exec",
                        "TP_ERROR",
                        &e.to_string(),
                        serde_json::json!({ "trade_id": trade_id, "tp_idx": idx + 1 }),
                    );
                }
            }
        }

        self.tel.log(
            "exec",
            "LIVE_ORDERS",
            "live bracket placed",
            serde_json::json!({
                "trade_id": trade_id,
                "entry": entry_px,
                "sl": sl_px,
                "tps": sig.tps,
                "qty": qty,
                "order_ids": order_ids,
            }),
        );
        Ok(order_ids)
    }

    // -------------------------------------------------------------------------
    // Partial TP1
    // -------------------------------------------------------------------------

    /// Ensure a reduce-only partial of `fraction` rests at TP1. Idempotent by
    /// price within the tolerance; returns the order id when one was placed.
    pub async fn ensure_partial_tp1(
        &self,
        trade_id: i64,
        side: Side,
        tp1: f64,
        fraction: f64,
        qty_hint: f64,
    ) -> Result<Option<String>> {
        let tp1 = round4(tp1);
        let existing = self.open_orders(trade_id);
        let already = existing.iter().any(|o| {
            o.kind == OrderKind::TakeProfit1
                && o.status == "open"
                && (o.price - tp1).abs() / tp1.abs().max(1e-9) <= TP_PRICE_TOL
        });
        if already {
            return Ok(None);
        }

        let part_qty = (qty_hint * fraction.clamp(0.0, 1.0)).max(0.0);
        if part_qty <= 0.0 {
            return Ok(None);
        }
        let (_, exit_side) = entry_exit_sides(side);

        let oid = if self.paper {
            let oid = paper_oid("tp1");
            self.store
                .add_order(trade_id, &oid, OrderKind::TakeProfit1, exit_side, tp1, part_qty, "open")?;
            oid
        } else {
            let order = self
                .client
                .create_order("limit", exit_side, part_qty, Some(tp1), true, None)
                .await?;
            let oid = order.get("id").map(json_id).unwrap_or_else(|| paper_oid("tp1"));
            self.store
                .add_order(trade_id, &oid, OrderKind::TakeProfit1, exit_side, tp1, part_qty, "open")?;
            oid
        };

        self.tel.log(
            "exec",
            "TP1_PARTIAL_PLACED",
            "reduce-only partial at TP1",
            serde_json::json!({ "trade_id": trade_id, "px": tp1, "qty": part_qty }),
        );
        Ok(Some(oid))
    }

    // -------------------------------------------------------------------------
    // Market flatten
    // -------------------------------------------------------------------------

    /// Flatten the remainder at market. In paper mode this also cancels any
    /// open protective orders so no phantom stop survives the exit.
    pub async fn exit_remainder_market(&self, trade_id: i64, side: Side, px_hint: f64, qty_hint: f64) -> Result<()> {
        let (_, exit_side) = entry_exit_sides(side);

        if self.paper {
            for o in self.open_orders(trade_id) {
                if o.status == "open" && (o.kind == OrderKind::StopLoss || o.kind.is_take_profit()) {
                    self.store.update_order_status(&o.order_id, "canceled")?;
                }
            }
            let oid = paper_oid("exit");
            self.store
                .add_order(trade_id, &oid, OrderKind::MarketExit, exit_side, round4(px_hint), qty_hint, "filled")?;
        } else {
            for o in self.open_orders(trade_id) {
                if o.status == "open" && (o.kind == OrderKind::StopLoss || o.kind.is_take_profit()) {
                    if let Err(e) = self.client.cancel_order(&o.order_id).await {
                        warn!(order_id = %o.order_id, error = %e, "protective cancel failed");
                    } else {
                        self.store.update_order_status(&o.order_id, "canceled")?;
                    }
                }
            }
            let order = self
                .client
                .create_order("market", exit_side, qty_hint, None, true, None)
                .await?;
            let oid = order.get("id").map(json_id).unwrap_or_else(|| paper_oid("exit"));
            self.store
                .add_order(trade_id, &oid, OrderKind::MarketExit, exit_side, round4(px_hint), qty_hint, "filled")?;
        }

        self.tel.log(
            "exec",
            "MARKET_FLATTEN",
            "remainder flattened",
            serde_json::json!({ "trade_id": trade_id, "qty": qty_hint, "px": px_hint }),
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Stop replacement
    // -------------------------------------------------------------------------

    /// Replace the protective stop: cancel the open stop row and record the
    /// new level. At most one open stop exists per trade.
    pub async fn replace_stop_loss(&self, trade_id: i64, side: Side, qty: f64, new_sl: f64) -> Result<()> {
        let new_sl = round4(new_sl);
        let (_, exit_side) = entry_exit_sides(side);

        for o in self.open_orders(trade_id) {
            if o.kind == OrderKind::StopLoss && o.status == "open" {
                if !self.paper {
                    if let Err(e) = self.client.cancel_order(&o.order_id).await {
                        warn!(order_id = %o.order_id, error = %e, "stop cancel failed");
                    }
                }
                self.store.update_order_status(&o.order_id, "canceled")?;
            }
        }

        let oid = if self.paper {
            paper_oid("sl")
        } else {
            let order = self
                .client
                .create_order("stop", exit_side, qty, None, true, Some(new_sl))
                .await?;
            order.get("id").map(json_id).unwrap_or_else(|| paper_oid("sl"))
        };
        self.store
            .add_order(trade_id, &oid, OrderKind::StopLoss, exit_side, new_sl, qty, "open")?;
        info!(trade_id, new_sl, "stop loss replaced");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // TP amendment
    // -------------------------------------------------------------------------

    /// Amend the resting TP ladder to `new_tps`: matching orders stay, TP1 is
    /// kept when `keep_tp1`, non-matching reduce-only targets are canceled,
    /// and missing rungs are placed with the remaining quantity split equally
    /// after reserving what the kept orders already commit.
    pub async fn amend_tps(
        &self,
        trade_id: i64,
        side: Side,
        new_tps: &[f64],
        keep_tp1: bool,
        qty_hint: f64,
    ) -> Result<()> {
        let targets: Vec<f64> = new_tps.iter().map(|x| round4(*x)).collect();
        let (_, exit_side) = entry_exit_sides(side);

        let open_tps: Vec<OrderRow> = self
            .open_orders(trade_id)
            .into_iter()
            .filter(|o| o.kind.is_take_profit() && o.status == "open")
            .collect();

        let matches_target = |price: f64| {
            targets
                .iter()
                .any(|t| (price - t).abs() / t.abs().max(1e-9) <= TP_PRICE_TOL)
        };

        let mut kept: Vec<OrderRow> = Vec::new();
        for o in open_tps {
            let keep = (keep_tp1 && o.kind == OrderKind::TakeProfit1) || matches_target(o.price);
            if keep {
                kept.push(o);
                continue;
            }
            if !self.paper {
                if let Err(e) = self.client.cancel_order(&o.order_id).await {
                    warn!(order_id = %o.order_id, error = %e, "tp cancel failed");
                    continue;
                }
            }
            self.store.update_order_status(&o.order_id, "canceled")?;
        }

        // Targets not yet covered by a kept order.
        let missing: Vec<(usize, f64)> = targets
            .iter()
            .enumerate()
            .filter(|(_, t)| {
                !kept
                    .iter()
                    .any(|o| (o.price - **t).abs() / t.abs().max(1e-9) <= TP_PRICE_TOL)
            })
            .map(|(i, t)| (i, *t))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let reserved: f64 = kept.iter().map(|o| o.qty).sum();
        let free_qty = (qty_hint - reserved).max(0.0);
        if free_qty <= 0.0 {
            return Ok(());
        }
        let share = free_qty / missing.len() as f64;

        // Ladder slots resume after the kept orders so two rungs never share
        // a take_profit kind.
        let slot_base = kept.len();
        for (j, (_, px)) in missing.into_iter().enumerate() {
            let slot = slot_base + j + 1;
            let oid = if self.paper {
                paper_oid(&format!("tp{slot}"))
            } else {
                let order = self
                    .client
                    .create_order("limit", exit_side, share, Some(px), true, None)
                    .await?;
                order.get("id").map(json_id).unwrap_or_else(|| paper_oid("tp"))
            };
            self.store
                .add_order(trade_id, &oid, OrderKind::take_profit(slot), exit_side, px, share, "open")?;
        }

        self.tel.log(
            "exec",
            "TPS_AMENDED",
            "tp ladder amended",
            serde_json::json!({ "trade_id": trade_id, "tps": targets, "keep_tp1": keep_tp1 }),
        );
        Ok(())
    }
}

fn json_id(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// =============================================================================
// Tests (paper mode, in-memory store)
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccountMode, SignalMeta};

    fn paper_engine() -> (ExecutionEngine, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let tel = Telemetry::new(store.clone());
        let client = Arc::new(DeltaClient::new("https://unused", "SOLUSD", "", ""));
        (ExecutionEngine::new(client, store.clone(), tel, true), store)
    }

    fn cfg() -> Config {
        std::env::set_var("PAIR", "SOLUSD");
        Config::from_env().unwrap()
    }

    fn long_signal() -> Signal {
        Signal {
            side: Some(Side::Long),
            entry: 100.0,
            sl: 99.0,
            tps: vec![100.6, 101.0, 101.5],
            reason: "test".into(),
            meta: SignalMeta::for_engine("trendscalp"),
        }
    }

    fn new_trade(store: &Store) -> i64 {
        store
            .new_trade(
                "SOLUSD",
                Side::Long,
                100.0,
                99.0,
                &[100.6, 101.0, 101.5],
                6.0,
                AccountMode::Paper,
                "trendscalp",
                "delta",
                &serde_json::json!({}),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn bracket_places_entry_stop_and_ladder() {
        let (exec, store) = paper_engine();
        let tid = new_trade(&store);
        let ids = exec.place_bracket(&long_signal(), 6.0, tid, &cfg()).await.unwrap();
        assert_eq!(ids.len(), 5); // entry + sl + 3 tps

        let orders = store.orders_for_trade(tid).unwrap();
        assert_eq!(orders.iter().filter(|o| o.kind == OrderKind::MarketEntry).count(), 1);
        assert_eq!(orders.iter().filter(|o| o.kind == OrderKind::StopLoss).count(), 1);
        let tp_qty: f64 = orders
            .iter()
            .filter(|o| o.kind.is_take_profit())
            .map(|o| o.qty)
            .sum();
        assert!((tp_qty - 6.0).abs() < 1e-9);
    }

    /// Seed scenario: placing the same bracket twice leaves the order book
    /// untouched and returns no new ids.
    #[tokio::test]
    async fn bracket_is_idempotent() {
        let (exec, store) = paper_engine();
        let tid = new_trade(&store);
        let first = exec.place_bracket(&long_signal(), 6.0, tid, &cfg()).await.unwrap();
        assert!(!first.is_empty());
        let before = store.orders_for_trade(tid).unwrap().len();

        let second = exec.place_bracket(&long_signal(), 6.0, tid, &cfg()).await.unwrap();
        assert!(second.is_empty());
        assert_eq!(store.orders_for_trade(tid).unwrap().len(), before);
    }

    #[tokio::test]
    async fn bracket_rejects_bad_input() {
        let (exec, store) = paper_engine();
        let tid = new_trade(&store);
        let mut none_sig = long_signal();
        none_sig.side = None;
        assert!(exec.place_bracket(&none_sig, 6.0, tid, &cfg()).await.is_err());
        assert!(exec.place_bracket(&long_signal(), 0.0, tid, &cfg()).await.is_err());
    }

    #[tokio::test]
    async fn partial_tp1_is_idempotent_by_price() {
        let (exec, store) = paper_engine();
        let tid = new_trade(&store);

        let first = exec.ensure_partial_tp1(tid, Side::Long, 100.6, 0.5, 6.0).await.unwrap();
        assert!(first.is_some());
        // Same price (within tolerance): no new order.
        let second = exec.ensure_partial_tp1(tid, Side::Long, 100.6002, 0.5, 6.0).await.unwrap();
        assert!(second.is_none());
        // Materially different price: a fresh order is placed.
        let third = exec.ensure_partial_tp1(tid, Side::Long, 101.4, 0.5, 6.0).await.unwrap();
        assert!(third.is_some());

        let count = store
            .orders_for_trade(tid)
            .unwrap()
            .iter()
            .filter(|o| o.kind == OrderKind::TakeProfit1)
            .count();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn exit_remainder_cancels_protective_orders() {
        let (exec, store) = paper_engine();
        let tid = new_trade(&store);
        exec.place_bracket(&long_signal(), 6.0, tid, &cfg()).await.unwrap();

        exec.exit_remainder_market(tid, Side::Long, 100.2, 6.0).await.unwrap();

        let orders = store.orders_for_trade(tid).unwrap();
        assert!(orders
            .iter()
            .filter(|o| o.kind == OrderKind::StopLoss || o.kind.is_take_profit())
            .all(|o| o.status == "canceled"));
        assert_eq!(orders.iter().filter(|o| o.kind == OrderKind::MarketExit).count(), 1);
    }

    #[tokio::test]
    async fn replace_stop_keeps_single_open_stop() {
        let (exec, store) = paper_engine();
        let tid = new_trade(&store);
        exec.place_bracket(&long_signal(), 6.0, tid, &cfg()).await.unwrap();

        exec.replace_stop_loss(tid, Side::Long, 6.0, 99.5).await.unwrap();
        exec.replace_stop_loss(tid, Side::Long, 6.0, 99.8).await.unwrap();

        let stops: Vec<OrderRow> = store
            .orders_for_trade(tid)
            .unwrap()
            .into_iter()
            .filter(|o| o.kind == OrderKind::StopLoss)
            .collect();
        let open: Vec<&OrderRow> = stops.iter().filter(|o| o.status == "open").collect();
        assert_eq!(open.len(), 1, "exactly one open stop expected");
        assert!((open[0].price - 99.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn amend_tps_replaces_non_matching() {
        let (exec, store) = paper_engine();
        let tid = new_trade(&store);
        exec.place_bracket(&long_signal(), 6.0, tid, &cfg()).await.unwrap();

        // Extend TP2/TP3; TP1 is kept by flag even though it is not a target.
        exec.amend_tps(tid, Side::Long, &[101.2, 101.8], true, 6.0).await.unwrap();

        let orders = store.orders_for_trade(tid).unwrap();
        let open_tps: Vec<&OrderRow> = orders
            .iter()
            .filter(|o| o.kind.is_take_profit() && o.status == "open")
            .collect();
        // Kept TP1 plus the two fresh targets.
        assert_eq!(open_tps.len(), 3);
        assert!(open_tps.iter().any(|o| (o.price - 100.6).abs() < 1e-9));
        assert!(open_tps.iter().any(|o| (o.price - 101.2).abs() < 1e-9));
        assert!(open_tps.iter().any(|o| (o.price - 101.8).abs() < 1e-9));
        // The original TP2/TP3 rows are canceled.
        assert!(orders
            .iter()
            .filter(|o| o.kind.is_take_profit() && (o.price == 101.0 || o.price == 101.5))
            .all(|o| o.status == "canceled"));
    }

    #[tokio::test]
    async fn amend_tps_noop_when_all_match() {
        let (exec, store) = paper_engine();
        let tid = new_trade(&store);
        exec.place_bracket(&long_signal(), 6.0, tid, &cfg()).await.unwrap();
        let before = store.orders_for_trade(tid).unwrap().len();

        exec.amend_tps(tid, Side::Long, &[100.6, 101.0, 101.5], true, 6.0).await.unwrap();
        assert_eq!(store.orders_for_trade(tid).unwrap().len(), before);
    }
}
