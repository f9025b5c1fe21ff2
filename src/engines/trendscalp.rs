// =============================================================================
// TrendScalp engine — Lorentzian k-NN bias + trendline breaks behind a
// filter stack
// =============================================================================
//
// Trigger: LONG when the classifier votes long AND structure agrees (upper
// break or EMA trend up), mirrored for SHORT; TS_REQUIRE_BOTH forces the
// conjunction. Before the trigger is even consulted, the side must clear:
//
//   - volatility floor        ATR14(5m)/price >= TS_VOL_FLOOR_PCT
//   - ADX gate                slope-bonused minimum, or the EMA+RSI soft
//                             override above TS_ADX_SOFT
//   - regime width            TL channel width >= adaptive_mult * ATR14
//   - 200-EMA alignment       5m with a tolerance band; optionally 15m too
//   - RSI15 side bias         outside the neutral band, right side of 50;
//                             overheat forces k-NN AND structure agreement
//   - pullback               price within an ATR-adapted band of EMA fast
//   - WAI absorption          directional momentum proxy over ~12 bars
//
// The engine keeps local re-entry memory (same-bar and price-proximity
// gates) so a fresh fill is never immediately re-attempted.
// =============================================================================

use tracing::debug;

use crate::config::Config;
use crate::engines::taser::{sl_pad, structural_sl, wai_momentum};
use crate::engines::ScanCtx;
use crate::guards::round4;
use crate::indicators::atr::atr;
use crate::indicators::adx::{adx, adx_slope};
use crate::indicators::ema::{ema, slope};
use crate::indicators::rsi::rsi;
use crate::indicators::trendline::{trendlines, SlopeMethod};
use crate::indicators::vwap::vwap;
use crate::ml::{self, Bias};
use crate::telemetry::Telemetry;
use crate::tp_calc::compute_tps;
use crate::types::{Side, Signal, SignalMeta};

const ENGINE: &str = "trendscalp";

/// Local re-entry memory, reset only by process restart.
pub struct TrendScalpEngine {
    last_entry_px: Option<f64>,
    last_entry_side: Option<Side>,
    last_entry_bar_ts: Option<i64>,
}

impl TrendScalpEngine {
    pub fn new() -> Self {
        Self { last_entry_px: None, last_entry_side: None, last_entry_bar_ts: None }
    }

    #[cfg(test)]
    fn with_memory(px: f64, side: Side, bar_ts: i64) -> Self {
        Self {
            last_entry_px: Some(px),
            last_entry_side: Some(side),
            last_entry_bar_ts: Some(bar_ts),
        }
    }

    /// Bars elapsed on the 5m series since `last_ts`, when it is still in
    /// the window.
    fn bars_since(ts5: &[i64], last_ts: Option<i64>) -> Option<usize> {
        let last = last_ts?;
        ts5.iter().rposition(|&t| t == last).map(|idx| ts5.len() - 1 - idx)
    }

    pub fn signal(&mut self, ctx: &ScanCtx<'_>, cfg: &Config, tel: &Telemetry) -> Signal {
        let sc = &cfg.scalp;
        if !sc.enabled {
            return Signal::none(ENGINE, "trendscalp disabled");
        }

        let price = ctx.price;
        let closes = &ctx.tf5.close;
        let highs = &ctx.tf5.high;
        let lows = &ctx.tf5.low;
        let ts5 = &ctx.tf5.timestamp;
        let curr_bar_ts = ts5.last().copied();

        let need_bars = sc.tl_lookback.max(sc.ema_slow).max(20) + 10;
        if closes.len() < need_bars {
            return Signal::none(ENGINE, "trendscalp: insufficient data");
        }

        // A) Same-bar guard: reconfirm on the next 5m bar before retrying.
        if cfg.scheduler.require_new_bar
            && self.last_entry_bar_ts.is_some()
            && curr_bar_ts.is_some()
            && self.last_entry_bar_ts == curr_bar_ts
        {
            tel.log(
                "scan",
                "REENTRY_PRE",
                "same 5m bar (REQUIRE_NEW_BAR)",
                serde_json::json!({ "price": price, "engine": ENGINE }),
            );
            return Signal::none(ENGINE, "trendscalp: same 5m bar");
        }

        // k-NN Lorentzian bias; cold classifier stays neutral.
        let ml_sig = ml::predict(ctx.tf5, sc);

        // Trendline breaks.
        let tl = trendlines(
            highs,
            lows,
            closes,
            sc.tl_lookback,
            SlopeMethod::parse(&sc.tl_slope_method),
            sc.tl_slope_mult,
        );
        let upper_break = tl.upper_break_now();
        let lower_break = tl.lower_break_now();

        // EMA trend & slope.
        let ema_fast = ema(closes, sc.ema_fast);
        let ema_slow = ema(closes, sc.ema_slow);
        let fast_last = *ema_fast.last().unwrap_or(&price);
        let slow_last = *ema_slow.last().unwrap_or(&price);
        let fast_slope = slope(&ema_fast, sc.trend_slope_len);
        let ema_up = fast_last > slow_last && fast_slope >= sc.trend_slope_min;
        let ema_dn = fast_last < slow_last && fast_slope <= -sc.trend_slope_min;

        // 1) Volatility floor.
        let atr14_series = atr(highs, lows, closes, 14);
        let atr14_last = *atr14_series.last().unwrap_or(&0.0);
        let vol_ok = atr14_last / price.max(1e-9) >= sc.vol_floor_pct;

        // 3) 200-EMA bias on 5m (and optionally 15m).
        let ema200_5 = *ema(closes, 200).last().unwrap_or(&price);
        let ema200_15 = if ctx.tf15.close.len() >= 200 {
            ema(&ctx.tf15.close, 200).last().copied()
        } else {
            None
        };
        let buf_long = ema200_5 * (1.0 - sc.ma_buffer_pct);
        let buf_short = ema200_5 * (1.0 + sc.ma_buffer_pct);
        let (ma_long_ok, ma_short_ok) = if sc.ma_require_15m {
            (
                price >= buf_long.max(ema200_15.unwrap_or(f64::NEG_INFINITY)),
                price <= buf_short.min(ema200_15.unwrap_or(f64::INFINITY)),
            )
        } else {
            (price >= buf_long && ema_up, price <= buf_short && ema_dn)
        };

        // 4) 15m RSI side bias with the neutral dead band.
        let rsi15 = if ctx.tf15.close.len() >= 15 {
            rsi(&ctx.tf15.close, 14).last().copied()
        } else {
            None
        };
        let mut allow_long_side = true;
        let mut allow_short_side = true;
        let mut rsi_block = false;
        if let Some(r) = rsi15 {
            if r >= sc.rsi15_neutral_lo && r <= sc.rsi15_neutral_hi {
                rsi_block = true;
                allow_long_side = false;
                allow_short_side = false;
            } else {
                allow_long_side = r > 50.0;
                allow_short_side = r < 50.0;
            }
        }
        let rsi_gate_long = !sc.use_rsi_filter || (!rsi_block && allow_long_side);
        let rsi_gate_short = !sc.use_rsi_filter || (!rsi_block && allow_short_side);

        // Overheat: stretched RSI demands classifier AND structure agreement.
        let force_struct_long = rsi15.map_or(false, |r| r >= sc.rsi_overheat_hi);
        let force_struct_short = rsi15.map_or(false, |r| r <= sc.rsi_overheat_lo);

        // 2) ADX gate with the slope bonus and optional soft override.
        let adx_series = adx(highs, lows, closes, 14);
        let adx_last = *adx_series.last().unwrap_or(&0.0);
        let slope3 = adx_slope(&adx_series, 3);
        let adx_min_eff = sc.adx_min - if slope3 > 0.0 { sc.adx_slope_bonus } else { 0.0 };
        let adx_ok_strict = adx_last >= adx_min_eff;
        let long_soft_ok = sc.override_ema_rsi
            && ma_long_ok
            && rsi15.map_or(false, |r| r > 55.0)
            && adx_last >= sc.adx_soft;
        let short_soft_ok = sc.override_ema_rsi
            && ma_short_ok
            && rsi15.map_or(false, |r| r < 45.0)
            && adx_last >= sc.adx_soft;
        let adx_ok = adx_ok_strict || long_soft_ok || short_soft_ok;

        // 5) Regime width with the ADX-stepped adaptive multiplier.
        let mut regime_mult = sc.tl_width_atr_mult;
        if sc.adapt_regime {
            if adx_last >= sc.adapt_adx2 {
                regime_mult = regime_mult.min(sc.adapt_mult2);
            } else if adx_last >= sc.adapt_adx1 {
                regime_mult = regime_mult.min(sc.adapt_mult1);
            }
        }
        let tl_width = tl.width_now();
        let regime_ok = tl_width >= regime_mult * atr14_last;
        let regime_gate = !sc.use_regime_filter || regime_ok;

        let pre_long_gate = vol_ok && adx_ok && regime_gate && ma_long_ok && rsi_gate_long;
        let pre_short_gate = vol_ok && adx_ok && regime_gate && ma_short_ok && rsi_gate_short;

        // Pullback: price near EMA fast, tolerance widened by ATR%.
        let adapt_pb = sc.pullback_pct.max(0.5 * atr14_last / price.max(1e-9));
        let near_fast = (price - fast_last).abs() / fast_last.max(1e-9) <= adapt_pb;

        // Absorption proxy.
        let wai_long = wai_momentum(closes, highs, lows, true);
        let wai_short = wai_momentum(closes, highs, lows, false);

        // Flow vetoes.
        let not_bearish =
            ctx.delta_pos != Some(false) && matches!(ctx.oi_up, Some(true) | None);
        let not_bullish = ctx.delta_pos != Some(true) || ctx.oi_up == Some(false);

        let require_both_long = sc.require_both || force_struct_long;
        let require_both_short = sc.require_both || force_struct_short;

        let long_trigger = if require_both_long {
            ml_sig.bias == Bias::Long && (upper_break || ema_up)
        } else {
            ml_sig.bias == Bias::Long || upper_break || ema_up
        };
        let short_trigger = if require_both_short {
            ml_sig.bias == Bias::Short && (lower_break || ema_dn)
        } else {
            ml_sig.bias == Bias::Short || lower_break || ema_dn
        };

        let long_ok =
            pre_long_gate && near_fast && wai_long >= sc.wai_min && not_bearish && long_trigger;
        let short_ok =
            pre_short_gate && near_fast && wai_short >= sc.wai_min && not_bullish && short_trigger;

        // Tentative side for the re-entry distance gate.
        let tentative = if long_ok && !short_ok {
            Some(Side::Long)
        } else if short_ok && !long_ok {
            Some(Side::Short)
        } else if ema_up {
            Some(Side::Long)
        } else if ema_dn {
            Some(Side::Short)
        } else {
            None
        };

        // B) Price-distance re-entry guard inside the bar cooldown window.
        if let Some(side) = tentative {
            if let (Some(last_px), Some(last_side)) = (self.last_entry_px, self.last_entry_side) {
                if last_side == side {
                    let bars_ago = Self::bars_since(ts5, self.last_entry_bar_ts);
                    let in_window =
                        bars_ago.map_or(true, |b| b <= sc.reentry_cooldown_bars_5m);
                    let dist = (price - last_px).abs() / last_px.abs().max(1e-9);
                    if in_window && dist < cfg.scheduler.block_reentry_pct {
                        tel.log(
                            "scan",
                            "REENTRY_BLOCK",
                            "price too close to last entry (BLOCK_REENTRY_PCT)",
                            serde_json::json!({
                                "price": price,
                                "side": side.as_str(),
                                "last_entry": last_px,
                                "engine": ENGINE,
                            }),
                        );
                        return Signal::none(ENGINE, "trendscalp: reentry distance block");
                    }
                }
            }
        }

        let filter_state = serde_json::json!({
            "vol_ok": vol_ok,
            "adx_ok": adx_ok,
            "adx_ok_strict": adx_ok_strict,
            "adx_ok_soft": long_soft_ok || short_soft_ok,
            "regime_ok": regime_ok,
            "ma_long_ok": ma_long_ok,
            "ma_short_ok": ma_short_ok,
            "rsi_block": rsi_block,
            "atr14_last": atr14_last,
            "adx_last": adx_last,
            "adx_slope3": slope3,
            "adx_min_eff": adx_min_eff,
            "rsi15": rsi15,
            "ema200_5": ema200_5,
            "ema200_15": ema200_15,
            "tl_width": tl_width,
            "tl_width_mult_effective": regime_mult,
            "upper_break": upper_break,
            "lower_break": lower_break,
            "ema_up": ema_up,
            "ema_dn": ema_dn,
            "near_fast": near_fast,
            "wai_long": wai_long,
            "wai_short": wai_short,
            "ml_bias": ml_sig.bias.as_str(),
            "ml_conf": ml_sig.conf,
            "ml_warm": ml_sig.warm,
            "rsi_overheat_long": force_struct_long,
            "rsi_overheat_short": force_struct_short,
        });

        let mut meta = SignalMeta::for_engine(ENGINE);
        meta.pdh = ctx.pdh;
        meta.pdl = ctx.pdl;
        meta.atr = atr14_last;
        meta.adx = adx_last;
        meta.ema200_5m = Some(ema200_5);
        meta.ema200_15m = ema200_15;
        meta.extra = filter_state;

        if !long_ok && !short_ok {
            tel.log(
                "scan",
                "FILTER_BLOCK",
                "trendscalp filter block",
                meta.extra.clone(),
            );
            return Signal {
                side: None,
                entry: 0.0,
                sl: 0.0,
                tps: Vec::new(),
                reason: "trendscalp: filter block or no setup".into(),
                meta,
            };
        }

        let side = if long_ok && !short_ok {
            Side::Long
        } else if short_ok && !long_ok {
            Side::Short
        } else if ema_up {
            Side::Long
        } else {
            Side::Short
        };

        // Record entry context for the re-entry gates on subsequent scans.
        self.last_entry_px = Some(price);
        self.last_entry_side = Some(side);
        if let Some(ts) = curr_bar_ts {
            self.last_entry_bar_ts = Some(ts);
        }

        // SL construction.
        let sl = if sc.stop_mode == "trendline" {
            let pad = sl_pad(price, atr14_last, Some(ctx.tf1m), cfg);
            let raw = if side.is_long() {
                (price - pad).min(tl.lower.last().copied().unwrap_or(price) - pad)
            } else {
                (price + pad).max(tl.upper.last().copied().unwrap_or(price) + pad)
            };
            let (lo, hi) = if side.is_long() {
                (price - price * cfg.sl.max_sl_pct, price - price * cfg.sl.min_sl_pct)
            } else {
                (price + price * cfg.sl.min_sl_pct, price + price * cfg.sl.max_sl_pct)
            };
            round4(raw.clamp(lo.min(hi), lo.max(hi)))
        } else {
            let atr30 = atr(highs, lows, closes, 30).last().copied().unwrap_or(0.0);
            let vwp = vwap(highs, lows, closes, &ctx.tf5.volume).last().copied();
            structural_sl(
                side,
                price,
                vwp,
                None,
                None,
                ctx.pdh,
                ctx.pdl,
                atr30,
                Some(ctx.tf1m),
                cfg,
            )
        };

        // TP ladder from the 30-bar ATR reference.
        let atr30 = atr(highs, lows, closes, 30).last().copied().unwrap_or(atr14_last);
        let tps = compute_tps(price, sl, side, atr30, adx_last, &cfg.tp);

        let reason = format!(
            "TrendScalp {}{}{}{}",
            ml_sig.bias.as_str().to_uppercase(),
            if upper_break { " UPBRK" } else { "" },
            if lower_break { " DNBRK" } else { "" },
            if ema_up {
                " EMAUP"
            } else if ema_dn {
                " EMADN"
            } else {
                ""
            },
        );

        debug!(side = side.as_str(), sl, ?tps, "trendscalp signal assembled");

        Signal { side: Some(side), entry: round4(price), sl, tps, reason, meta }
    }
}

impl Default for TrendScalpEngine {
    fn default() -> Self {
        Self::new()
    }
}
