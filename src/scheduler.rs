// =============================================================================
// Scheduler — bar-gated scan loop, engine dispatch, re-entry hygiene,
// startup recovery
// =============================================================================
//
// One cycle: pull 5m/15m/1h (+1m micro data), derive prior-day levels,
// enforce the single-position rule, run pre-draft re-entry hygiene, walk the
// configured engine order, gate the winner through the multi-TF heatmap,
// re-check re-entry proximity with the final side, enforce the SL rail and
// TP sanitation, size, persist, place the bracket, and hand the trade to the
// manager as an awaited call. Transient errors skip the cycle; the loop
// never dies on a recoverable failure.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use crate::config::Config;
use crate::engines::taser::prior_day_high_low;
use crate::engines::{pseudo_delta, EngineKind, Engines, ScanCtx};
use crate::exchange::DeltaClient;
use crate::execution::ExecutionEngine;
use crate::guards::{enforce_min_sl, sanitize_tps};
use crate::heatmap::{build_multi, confluence_gate, GateParams, MultiHeatmap};
use crate::manage::run_manage;
use crate::notify::Notifier;
use crate::sizing::{calc_pnl_net, choose_size};
use crate::store::{now_ms, Store};
use crate::telemetry::Telemetry;
use crate::types::{AccountMode, Side, Signal, TfSeries, Trade, TradeStatus};

/// Process-wide scan memory, owned by the scheduler (no globals).
#[derive(Debug, Default)]
pub struct ReentryMemory {
    /// 5m bar timestamp of the last accepted entry (same-bar suppression).
    pub last_traded_bar_ts: Option<i64>,
    /// 5m bar of the last SIZE_ZERO notification (throttled once per bar).
    pub last_size_error_bar: Option<i64>,
}

/// Pre/post-draft re-entry hygiene. `side == None` applies only the bar and
/// time checks; a concrete side adds the price-proximity guard. Returns the
/// blocking reason, or None when clear.
pub fn gate_reentry(
    store: &Store,
    memory: &ReentryMemory,
    cfg: &Config,
    now_s: i64,
    now_bar_ts: i64,
    price: f64,
    side: Option<Side>,
) -> Option<String> {
    // 1) Same-bar suppression.
    if cfg.scheduler.require_new_bar {
        if let Some(last_bar) = memory.last_traded_bar_ts {
            if last_bar == now_bar_ts {
                return Some("same 5m bar (REQUIRE_NEW_BAR)".into());
            }
        }
    }

    // 2) Cool-off by time since the last closed trade.
    let last = store.last_closed_trade().ok().flatten()?;
    let closed_s = last.closed_ts? / 1000;
    let ago = (now_s - closed_s).max(0);
    if ago < cfg.scheduler.min_reentry_s {
        // 3) Price proximity on the same side during the cool-off.
        if let Some(side) = side {
            if last.side == side {
                let dist = (price - last.entry).abs() / price.abs().max(1e-9);
                if dist < cfg.scheduler.block_reentry_pct {
                    return Some("price too close to last entry (BLOCK_REENTRY_PCT)".into());
                }
            }
        }
        return Some(format!("cool-off {ago}s < MIN_REENTRY_SECONDS"));
    }
    None
}

/// Engine pause after two consecutive stop-outs: the reason string when the
/// engine is cooling down, None otherwise.
pub fn engine_on_cooldown(store: &Store, engine: &str, cooldown_min: i64, now_ms_: i64) -> Option<String> {
    if cooldown_min <= 0 {
        return None;
    }
    let rows = store.last_closed_for_engine(engine, 2).ok()?;
    if rows.len() < 2 {
        return None;
    }
    let all_sl = rows.iter().all(|(st, _)| {
        matches!(st, TradeStatus::ClosedSl | TradeStatus::ClosedSlRecovered)
    });
    if !all_sl {
        return None;
    }
    let last_closed = rows.iter().map(|(_, ts)| *ts).max().unwrap_or(0);
    let window_ms = cooldown_min * 60 * 1000;
    if now_ms_ - last_closed < window_ms {
        let remain_s = (window_ms - (now_ms_ - last_closed)) / 1000;
        Some(format!("{engine} cooldown {remain_s}s remaining after 2 SLs"))
    } else {
        None
    }
}

pub struct Scheduler {
    cfg: Arc<Config>,
    store: Arc<Store>,
    client: Arc<DeltaClient>,
    exec: ExecutionEngine,
    tel: Telemetry,
    notify: Arc<Notifier>,
    engines: Engines,
    memory: ReentryMemory,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Arc<Config>,
        store: Arc<Store>,
        client: Arc<DeltaClient>,
        exec: ExecutionEngine,
        tel: Telemetry,
        notify: Arc<Notifier>,
    ) -> Self {
        Self {
            cfg,
            store,
            client,
            exec,
            tel,
            notify,
            engines: Engines::new(),
            memory: ReentryMemory::default(),
        }
    }

    // -------------------------------------------------------------------------
    // Recovery
    // -------------------------------------------------------------------------

    /// Reconcile trades left open across a restart. A trade whose stop was
    /// pierced while offline closes at exactly the stop; a survivor is
    /// returned for resumed management.
    pub async fn recover_open_trades(&self) -> Result<Option<Trade>> {
        let opens = self.store.list_open_trades()?;
        if opens.is_empty() {
            self.tel.log("recover", "NO_OPEN", "no open trades to recover", serde_json::json!({}));
            return Ok(None);
        }

        let tf1m = match self.client.fetch_ohlcv("1m", Some(1440)).await {
            Ok(tf) if tf.is_coherent() => tf,
            _ => {
                self.tel.log(
                    "recover",
                    "NO_1M",
                    "cannot reconcile (empty/partial 1m)",
                    serde_json::json!({}),
                );
                return Ok(None);
            }
        };

        let mut to_resume = None;
        for trade in opens {
            let is_long = trade.side.is_long();
            let first_idx = tf1m.timestamp.iter().position(|&t| t >= trade.created_ts);
            let Some(idx0) = first_idx else {
                self.tel.log(
                    "recover",
                    "NO_POST_CREATE_CANDLES",
                    &format!("trade {}: resume live", trade.id),
                    serde_json::json!({ "created": trade.created_ts }),
                );
                to_resume = Some(trade);
                continue;
            };

            let hit = (idx0..tf1m.len()).any(|i| {
                if is_long {
                    tf1m.low[i] <= trade.sl
                } else {
                    tf1m.high[i] >= trade.sl
                }
            });

            if hit {
                let exit_px = trade.sl;
                let pnl = calc_pnl_net(trade.side, trade.entry, exit_px, trade.qty, &self.cfg.fees);
                self.store
                    .close_trade(trade.id, exit_px, pnl, TradeStatus::ClosedSlRecovered)?;
                self.store.append_event(
                    trade.id,
                    "RECOVERED_CLOSE",
                    &format!("SL during downtime @ {exit_px:.4} | PnL {pnl:.2}"),
                )?;
                self.tel.log(
                    "recover",
                    "CLOSED_SL",
                    &format!("trade {} closed on recovery", trade.id),
                    serde_json::json!({ "exit": exit_px, "pnl": pnl }),
                );
                self.notify
                    .send(&format!(
                        "🧹 Recovered: closed trade #{} at SL while offline.\nExit {exit_px:.4} | PnL {pnl:.2}",
                        trade.id
                    ))
                    .await;
            } else {
                to_resume = Some(trade);
            }
        }
        Ok(to_resume)
    }

    // -------------------------------------------------------------------------
    // One scan cycle
    // -------------------------------------------------------------------------

    /// Run a single scan. Returns the newly created trade when a bracket was
    /// placed, so the caller can hand off to the manager.
    pub async fn scan_once(&mut self) -> Result<Option<Trade>> {
        let cfg = self.cfg.clone();

        // 1. Market data (any gap skips the cycle).
        let tf5 = match self.client.fetch_ohlcv("5m", None).await {
            Ok(tf) if tf.is_coherent() => tf,
            _ => {
                self.tel.log("scan", "NO_DATA", "5m fetch empty", serde_json::json!({}));
                return Ok(None);
            }
        };
        let tf15 = match self.client.fetch_ohlcv("15m", None).await {
            Ok(tf) if tf.is_coherent() => tf,
            _ => {
                self.tel.log("scan", "NO_DATA", "15m fetch empty", serde_json::json!({}));
                return Ok(None);
            }
        };
        let tf1h = match self.client.fetch_ohlcv("1h", None).await {
            Ok(tf) if tf.is_coherent() => tf,
            _ => {
                self.tel.log("scan", "NO_DATA", "1h fetch empty", serde_json::json!({}));
                return Ok(None);
            }
        };
        let tf1m = self.client.fetch_ohlcv("1m", None).await.unwrap_or_default();

        let now_bar_ts = tf5.last_ts().unwrap_or(0);
        let price = tf5.last_close().unwrap_or(0.0);
        if price <= 0.0 {
            return Ok(None);
        }
        let now_s = chrono::Utc::now().timestamp();

        // 2. Daily context and flow proxies.
        let (pdh, pdl) = prior_day_high_low(&tf1h, now_bar_ts);
        let delta_pos = Some(pseudo_delta(&tf5, 30) > 0.0);
        let oi_up = Some(true); // venue OI feed is advisory; optimistic default

        // 3. Single-position discipline.
        if cfg.scheduler.single_position && self.store.has_open_trade()? {
            self.tel.log(
                "scan",
                "SKIP",
                "single-position mode (trade open)",
                serde_json::json!({}),
            );
            return Ok(None);
        }

        // 4. Pre-draft re-entry hygiene (bar/time only).
        if let Some(reason) =
            gate_reentry(&self.store, &self.memory, &cfg, now_s, now_bar_ts, price, None)
        {
            self.tel.log(
                "scan",
                "REENTRY_PRE",
                &reason,
                serde_json::json!({ "price": price }),
            );
            return Ok(None);
        }

        // 5/6. Engine order walk with the heatmap confluence gate.
        let heatmap = self.build_heatmap(&tf5, &tf15, &tf1h, now_bar_ts).await;
        let gate_params = GateParams::for_aggression(&cfg.scheduler.aggression);

        let ctx = ScanCtx {
            price,
            tf1m: &tf1m,
            tf5: &tf5,
            tf15: &tf15,
            tf1h: &tf1h,
            pdh,
            pdl,
            oi_up,
            delta_pos,
        };

        let mut chosen: Option<(Signal, Side)> = None;
        let mut heatmap_blocked = false;
        let mut last_none_reason = String::from("no setup");

        for name in &cfg.scheduler.engine_order {
            let Some(kind) = EngineKind::parse(name) else {
                continue;
            };
            if let Some(reason) = engine_on_cooldown(
                &self.store,
                kind.label(),
                cfg.scheduler.engine_cooldown_after_2_sl_min,
                now_ms(),
            ) {
                self.tel.log("scan", "COOLDOWN", &reason, serde_json::json!({ "engine": kind.label() }));
                continue;
            }

            let sig = self.engines.signal(kind, &ctx, &cfg, &self.tel);
            let Some(side) = sig.side else {
                last_none_reason = sig.reason.clone();
                continue;
            };

            let gate = confluence_gate(&heatmap, price, side, gate_params);
            if gate.block {
                heatmap_blocked = true;
                self.tel.log(
                    "scan",
                    "FILTER_HEATMAP_BLOCK",
                    &gate.why,
                    serde_json::json!({
                        "engine": kind.label(),
                        "hits_above": gate.hits_above,
                        "hits_below": gate.hits_below,
                    }),
                );
                continue;
            }

            chosen = Some((sig, side));
            break;
        }

        let Some((mut draft, side)) = chosen else {
            if heatmap_blocked {
                self.notify
                    .send(&format!("No trade — heatmap confluence block @ {price:.4}"))
                    .await;
            } else {
                self.tel.log(
                    "scan",
                    "NO_TRADE",
                    &last_none_reason,
                    serde_json::json!({ "price": price }),
                );
            }
            return Ok(None);
        };

        // 7. Post-draft re-entry proximity with the final side.
        if let Some(reason) =
            gate_reentry(&self.store, &self.memory, &cfg, now_s, now_bar_ts, price, Some(side))
        {
            if reason.contains("BLOCK_REENTRY_PCT") {
                self.tel.log(
                    "scan",
                    "REENTRY_BLOCK",
                    &reason,
                    serde_json::json!({ "price": price, "side": side.as_str() }),
                );
                return Ok(None);
            }
        }

        // 8. Last-mile rails and TP sanitation.
        let padded = enforce_min_sl(draft.entry, draft.sl, side, cfg.sl.min_sl_pct);
        if (padded - draft.sl).abs() > 1e-12 {
            self.tel.log(
                "scan",
                "SL_PADDED",
                "SL too tight; padded to rail from entry",
                serde_json::json!({ "old": draft.sl, "new": padded, "entry": draft.entry }),
            );
            draft.sl = padded;
        }
        draft.tps = sanitize_tps(side, draft.entry, &draft.tps, &cfg.fees);

        self.tel.log(
            "scan",
            "RULE_APPROVED",
            &format!("{} — {}", side, draft.reason),
            serde_json::json!({
                "side": side.as_str(),
                "entry": draft.entry,
                "sl": draft.sl,
                "tps": draft.tps,
                "engine": draft.meta.engine,
            }),
        );

        // Remember the traded bar for same-bar suppression.
        self.memory.last_traded_bar_ts = Some(now_bar_ts);

        // 9. Sizing.
        let balance = match self.client.fetch_balance_quote().await {
            Ok(b) => b,
            Err(e) => {
                if cfg.dry_run {
                    cfg.sizing.paper_start_balance
                } else {
                    self.tel.log("scan", "ERROR", &format!("balance fetch failed: {e}"), serde_json::json!({}));
                    return Ok(None);
                }
            }
        };
        let qty = choose_size(balance, draft.entry, draft.sl, &cfg.sizing, cfg.dry_run);
        if qty <= 0.0 {
            if self.memory.last_size_error_bar != Some(now_bar_ts) {
                self.memory.last_size_error_bar = Some(now_bar_ts);
                self.tel.log(
                    "scan",
                    "SIZE_ZERO",
                    "qty <= 0 after sizing",
                    serde_json::json!({
                        "entry": draft.entry,
                        "sl": draft.sl,
                        "balance": balance,
                        "engine": draft.meta.engine,
                    }),
                );
                self.notify.send("Cannot size position (check balance/SL).").await;
            }
            return Ok(None);
        }

        // 10. Persist the trade.
        let account = if cfg.dry_run { AccountMode::Paper } else { AccountMode::Live };
        let meta_json = serde_json::to_value(&draft.meta).unwrap_or_default();
        let trade_id = self.store.new_trade(
            &cfg.pair,
            side,
            draft.entry,
            draft.sl,
            &draft.tps,
            qty,
            account,
            &draft.meta.engine,
            &cfg.exchange_id,
            &meta_json,
        )?;

        self.tel.log(
            "exec",
            "APPROVED",
            &format!("{} — {}", side, draft.reason),
            serde_json::json!({
                "tid": trade_id,
                "side": side.as_str(),
                "entry": draft.entry,
                "sl": draft.sl,
                "tps": draft.tps,
                "qty": qty,
                "engine": draft.meta.engine,
            }),
        );
        self.notify
            .send(&format!(
                "✅ {} {} — {}\nEntry {:.4} | SL {:.4} | TPs {:?} | qty {}",
                side, cfg.pair, draft.reason, draft.entry, draft.sl, draft.tps, qty
            ))
            .await;

        // 11. Place the bracket. Placement failure is critical for this
        // cycle: log, leave the row for startup recovery, skip.
        if let Err(e) = self.exec.place_bracket(&draft, qty, trade_id, &cfg).await {
            self.tel.log(
                "exec",
                "ENTRY_ERROR",
                &e.to_string(),
                serde_json::json!({ "tid": trade_id }),
            );
            return Ok(None);
        }

        Ok(self.store.get_trade(trade_id)?)
    }

    /// Build the multi-TF heatmap (5m/15m/1h/1d plus a 30d synthesized from
    /// 1h) and persist each frame.
    async fn build_heatmap(
        &self,
        tf5: &TfSeries,
        tf15: &TfSeries,
        tf1h: &TfSeries,
        now_ts: i64,
    ) -> MultiHeatmap {
        let tf1d = self.client.fetch_ohlcv("1d", None).await.ok().filter(|t| t.is_coherent());
        let tf30d = (tf1h.len() >= 48).then(|| tf1h.tail(720));

        let hm = build_multi(
            Some(tf5),
            Some(tf15),
            Some(tf1h),
            tf1d.as_ref(),
            tf30d.as_ref(),
            &self.cfg.heatmap,
        );

        for (label, frame) in hm.frames() {
            if let Ok(payload) = serde_json::to_string(frame) {
                if let Err(e) = self.store.save_heatmap(now_ts, label, &payload) {
                    error!(error = %e, tf = label, "heatmap persist failed");
                }
            }
        }
        hm
    }

    // -------------------------------------------------------------------------
    // Main loop
    // -------------------------------------------------------------------------

    /// Run forever: recover, then scan/manage until cancelled.
    pub async fn run(&mut self) -> Result<()> {
        // Boot housekeeping: settings seed + heatmap retention purge.
        self.store.seed_setting("AUTO_TRADING", "true")?;
        self.store
            .seed_setting("DRY_RUN", if self.cfg.dry_run { "true" } else { "false" })?;
        self.store.seed_setting(
            "SCAN_INTERVAL_SECONDS",
            &self.cfg.scheduler.scan_interval_s.to_string(),
        )?;
        let cutoff = now_ms() - self.cfg.heatmap.retention_days * 86_400_000;
        let purged = self.store.purge_heatmap_before(cutoff)?;
        if purged > 0 {
            info!(purged, "heatmap snapshots purged");
        }

        self.tel.log_engine_order(&self.cfg.scheduler.engine_order);
        self.tel.log(
            "run",
            "START",
            "scheduler started",
            serde_json::json!({
                "pair": self.cfg.pair,
                "mode": if self.cfg.dry_run { "PAPER" } else { "LIVE" },
            }),
        );
        self.notify.send("Trading runtime: starting up ✅").await;

        // Startup recovery; a surviving trade resumes management first.
        match self.recover_open_trades().await {
            Ok(Some(trade)) => {
                self.notify
                    .send(&format!(
                        "Resuming management of open trade #{} — {} @ {:.4}",
                        trade.id, trade.side, trade.entry
                    ))
                    .await;
                if let Err(e) = run_manage(
                    &self.cfg,
                    &self.store,
                    &self.client,
                    &self.exec,
                    &self.tel,
                    &self.notify,
                    trade,
                )
                .await
                {
                    error!(error = %e, "resumed manage loop failed");
                }
            }
            Ok(None) => {}
            Err(e) => {
                self.tel.log("recover", "ERROR", &e.to_string(), serde_json::json!({}));
            }
        }

        loop {
            match self.scan_once().await {
                Ok(Some(trade)) => {
                    // Entry into the manager is an awaited call, never a
                    // detached task: the singleton invariant needs exactly
                    // one manager at a time.
                    if let Err(e) = run_manage(
                        &self.cfg,
                        &self.store,
                        &self.client,
                        &self.exec,
                        &self.tel,
                        &self.notify,
                        trade,
                    )
                    .await
                    {
                        error!(error = %e, "manage loop failed");
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    self.tel.log("run", "ERROR", &e.to_string(), serde_json::json!({}));
                    self.notify.send(&format!("[RUN] Error: {e}")).await;
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                }
            }
            tokio::time::sleep(std::time::Duration::from_secs_f64(
                self.cfg.scheduler.scan_interval_s,
            ))
            .await;
        }
    }
}
