// =============================================================================
// Shared types used across the Helix trading runtime
// =============================================================================

use serde::{Deserialize, Serialize};

/// Display via `as_str` for the enums in this module.
macro_rules! fmt_as_str {
    ($ty:ty) => {
        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// Trade direction. A scan that produces no edge yields `side: None` on the
/// signal rather than a third variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn is_long(self) -> bool {
        matches!(self, Self::Long)
    }

    /// +1.0 for long, -1.0 for short. Used in PnL and excursion math.
    pub fn direction(self) -> f64 {
        if self.is_long() {
            1.0
        } else {
            -1.0
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "LONG" | "BUY" => Some(Self::Long),
            "SHORT" | "SELL" => Some(Self::Short),
            _ => None,
        }
    }
}

fmt_as_str!(Side);

// ---------------------------------------------------------------------------
// Timeframed OHLCV bundle
// ---------------------------------------------------------------------------

/// Column-oriented OHLCV series for one timeframe. All six vectors are equal
/// length and timestamps are epoch milliseconds, non-decreasing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TfSeries {
    pub timestamp: Vec<i64>,
    pub open: Vec<f64>,
    pub high: Vec<f64>,
    pub low: Vec<f64>,
    pub close: Vec<f64>,
    pub volume: Vec<f64>,
}

impl TfSeries {
    pub fn len(&self) -> usize {
        self.close.len()
    }

    pub fn is_empty(&self) -> bool {
        self.close.is_empty()
    }

    /// True when the series is non-empty and every column has the same length.
    pub fn is_coherent(&self) -> bool {
        let n = self.timestamp.len();
        n > 0
            && self.open.len() == n
            && self.high.len() == n
            && self.low.len() == n
            && self.close.len() == n
            && self.volume.len() == n
    }

    pub fn last_close(&self) -> Option<f64> {
        self.close.last().copied()
    }

    pub fn last_ts(&self) -> Option<i64> {
        self.timestamp.last().copied()
    }

    /// Append one bar. Normalization and test helper.
    pub fn push_bar(&mut self, ts: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) {
        self.timestamp.push(ts);
        self.open.push(open);
        self.high.push(high);
        self.low.push(low);
        self.close.push(close);
        self.volume.push(volume);
    }

    /// A view of the last `n` bars (or fewer when not enough history).
    pub fn tail(&self, n: usize) -> TfSeries {
        let k = self.len().saturating_sub(n);
        TfSeries {
            timestamp: self.timestamp[k..].to_vec(),
            open: self.open[k..].to_vec(),
            high: self.high[k..].to_vec(),
            low: self.low[k..].to_vec(),
            close: self.close[k..].to_vec(),
            volume: self.volume[k..].to_vec(),
        }
    }
}

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

/// Structured, contract-bearing signal metadata. Diagnostics that only feed
/// telemetry go into the opaque `extra` side-map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalMeta {
    /// Engine label ("trendscalp" | "taser").
    pub engine: String,
    pub pdh: Option<f64>,
    pub pdl: Option<f64>,
    /// ATR in price units at signal time (5m basis).
    #[serde(default)]
    pub atr: f64,
    #[serde(default)]
    pub adx: f64,
    pub ema200_5m: Option<f64>,
    pub ema200_15m: Option<f64>,
    /// Entry-validity snapshot, captured at fill time by the manager.
    pub entry_validity: Option<EntrySnapshot>,
    /// Telemetry-only diagnostics (filter states, thresholds, heatmap slices).
    #[serde(default)]
    pub extra: serde_json::Value,
}

impl SignalMeta {
    pub fn for_engine(engine: &str) -> Self {
        Self {
            engine: engine.to_string(),
            ..Self::default()
        }
    }
}

/// Immutable record produced per scan. `side == None` means no trade; entry
/// and sl are zero in that case and `reason` explains why.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub side: Option<Side>,
    pub entry: f64,
    pub sl: f64,
    /// Up to 3 targets, strictly monotonic away from entry.
    pub tps: Vec<f64>,
    pub reason: String,
    pub meta: SignalMeta,
}

impl Signal {
    pub fn none(engine: &str, reason: impl Into<String>) -> Self {
        Self {
            side: None,
            entry: 0.0,
            sl: 0.0,
            tps: Vec::new(),
            reason: reason.into(),
            meta: SignalMeta::for_engine(engine),
        }
    }

    pub fn is_actionable(&self) -> bool {
        self.side.is_some() && self.entry > 0.0 && self.sl > 0.0
    }
}

// ---------------------------------------------------------------------------
// Entry-validity snapshot
// ---------------------------------------------------------------------------

/// Which side of the 200-EMA price sat on at fill time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmaSide {
    Above,
    Below,
    Na,
}

impl EmaSide {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Above => "above",
            Self::Below => "below",
            Self::Na => "na",
        }
    }
}

fmt_as_str!(EmaSide);

/// Structure assessment at fill time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StructureFlag {
    Ok,
    Fail,
    Na,
}

impl StructureFlag {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Fail => "fail",
            Self::Na => "na",
        }
    }
}

fmt_as_str!(StructureFlag);

/// Reasons-for-entry captured when the position fills. The post-entry
/// validity guard compares live conditions against this snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntrySnapshot {
    pub side: Side,
    pub adx_at_entry: f64,
    pub atr_pct_at_entry: f64,
    pub ema200_side: EmaSide,
    pub structure: StructureFlag,
    pub ts_at_entry: i64,
}

// ---------------------------------------------------------------------------
// Regime
// ---------------------------------------------------------------------------

/// Momentum regime label used by the manager FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Regime {
    Chop,
    Runner,
}

impl Regime {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chop => "CHOP",
            Self::Runner => "RUNNER",
        }
    }
}

fmt_as_str!(Regime);

// ---------------------------------------------------------------------------
// Trade status / account mode / order kinds
// ---------------------------------------------------------------------------

/// Persistent trade status. `Open` and `Partial` are the only live states;
/// everything else is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    Open,
    Partial,
    ClosedSl,
    ClosedSlRecovered,
    ClosedPev,
    ClosedVenueFlat,
    ClosedTp,
}

impl TradeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Partial => "PARTIAL",
            Self::ClosedSl => "CLOSED_SL",
            Self::ClosedSlRecovered => "CLOSED_SL_RECOVERED",
            Self::ClosedPev => "CLOSED_PEV",
            Self::ClosedVenueFlat => "CLOSED_VENUE_FLAT",
            Self::ClosedTp => "CLOSED_TP",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "OPEN" => Some(Self::Open),
            "PARTIAL" => Some(Self::Partial),
            "CLOSED_SL" => Some(Self::ClosedSl),
            "CLOSED_SL_RECOVERED" => Some(Self::ClosedSlRecovered),
            "CLOSED_PEV" => Some(Self::ClosedPev),
            "CLOSED_VENUE_FLAT" => Some(Self::ClosedVenueFlat),
            "CLOSED_TP" => Some(Self::ClosedTp),
            _ => None,
        }
    }

    pub fn is_live(self) -> bool {
        matches!(self, Self::Open | Self::Partial)
    }
}

fmt_as_str!(TradeStatus);

/// Whether trades are simulated or routed to the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountMode {
    Paper,
    Live,
}

impl AccountMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Paper => "PAPER",
            Self::Live => "LIVE",
        }
    }
}

fmt_as_str!(AccountMode);

/// Order legs of a bracket. Stored as strings in the orders table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    MarketEntry,
    StopLoss,
    TakeProfit1,
    TakeProfit2,
    TakeProfit3,
    TakeProfitFinal,
    MarketExit,
}

impl OrderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MarketEntry => "market_entry",
            Self::StopLoss => "stop_loss",
            Self::TakeProfit1 => "take_profit_1",
            Self::TakeProfit2 => "take_profit_2",
            Self::TakeProfit3 => "take_profit_3",
            Self::TakeProfitFinal => "take_profit_final",
            Self::MarketExit => "market_exit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "market_entry" => Some(Self::MarketEntry),
            "stop_loss" => Some(Self::StopLoss),
            "take_profit_1" => Some(Self::TakeProfit1),
            "take_profit_2" => Some(Self::TakeProfit2),
            "take_profit_3" => Some(Self::TakeProfit3),
            "take_profit_final" => Some(Self::TakeProfitFinal),
            "market_exit" => Some(Self::MarketExit),
            _ => None,
        }
    }

    pub fn take_profit(idx: usize) -> Self {
        match idx {
            1 => Self::TakeProfit1,
            2 => Self::TakeProfit2,
            _ => Self::TakeProfit3,
        }
    }

    pub fn is_take_profit(self) -> bool {
        matches!(
            self,
            Self::TakeProfit1 | Self::TakeProfit2 | Self::TakeProfit3 | Self::TakeProfitFinal
        )
    }
}

fmt_as_str!(OrderKind);

// ---------------------------------------------------------------------------
// Trade record
// ---------------------------------------------------------------------------

/// A persisted trade row. Mirrors the `trades` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
    pub symbol: String,
    pub side: Side,
    pub entry: f64,
    pub sl: f64,
    pub tp1: Option<f64>,
    pub tp2: Option<f64>,
    pub tp3: Option<f64>,
    pub qty: f64,
    pub status: TradeStatus,
    pub created_ts: i64,
    pub closed_ts: Option<i64>,
    pub exit_price: Option<f64>,
    pub realized_pnl: Option<f64>,
    pub account: AccountMode,
    pub engine: String,
    pub exchange: String,
}

impl Trade {
    pub fn tps(&self) -> Vec<f64> {
        [self.tp1, self.tp2, self.tp3].into_iter().flatten().collect()
    }
}

/// A persisted order row. Mirrors the `orders` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRow {
    pub trade_id: i64,
    pub order_id: String,
    pub kind: OrderKind,
    pub side: String,
    pub price: f64,
    pub qty: f64,
    pub status: String,
}
