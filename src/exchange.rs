// =============================================================================
// Delta Exchange REST client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: the secret never appears in logs or Debug output. Signed
// requests carry `api-key`, `timestamp`, and `signature` headers where the
// signature covers method + timestamp + path + query + body.
//
// OHLCV fetches run with a 10s timeout and up to 3 attempts with a 500ms
// backoff; timestamps are normalized to milliseconds and returned strictly
// ascending.
// =============================================================================

use anyhow::{bail, Context, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::types::TfSeries;

type HmacSha256 = Hmac<Sha256>;

/// Attempts per OHLCV fetch.
const FETCH_RETRIES: usize = 3;
/// Backoff between attempts.
const FETCH_BACKOFF_MS: u64 = 500;
/// Hard cap on candles per request.
const MAX_CANDLES: usize = 2000;

/// Seconds per supported timeframe.
pub fn timeframe_seconds(tf: &str) -> Option<i64> {
    Some(match tf {
        "1m" => 60,
        "3m" => 180,
        "5m" => 300,
        "15m" => 900,
        "30m" => 1800,
        "1h" => 3600,
        "2h" => 7200,
        "4h" => 14400,
        "1d" => 86400,
        _ => return None,
    })
}

/// Suggested minimum bars per timeframe when the caller does not specify.
pub fn min_bars_for(tf: &str) -> usize {
    match tf {
        "1m" => 300,
        "3m" => 300,
        "5m" => 240,
        "15m" => 240,
        "30m" => 240,
        "1h" => 240,
        _ => 240,
    }
}

/// Quote asset of a pair like "SOL/USDT", "SOLUSD", "BTCPERP".
pub fn quote_from_pair(pair: &str) -> String {
    if let Some((_, quote)) = pair.split_once('/') {
        return quote.to_uppercase();
    }
    let upper = pair.to_uppercase();
    for suffix in ["USDT", "USDC", "USD", "BTC", "ETH"] {
        if upper.ends_with(suffix) {
            return suffix.to_string();
        }
    }
    if upper.ends_with("PERP") {
        return "USD".to_string();
    }
    upper.chars().rev().take(3).collect::<String>().chars().rev().collect()
}

/// Venue position snapshot.
#[derive(Debug, Clone)]
pub struct VenuePosition {
    pub side: String,
    pub contracts: f64,
    pub entry_price: f64,
}

#[derive(Clone)]
pub struct DeltaClient {
    api_key: String,
    secret: String,
    base_url: String,
    pair: String,
    client: reqwest::Client,
}

impl DeltaClient {
    pub fn new(base_url: impl Into<String>, pair: impl Into<String>, api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            pair: pair.into(),
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Signing
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature over the canonical request string.
    pub fn sign(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_headers(&self, method: &str, path: &str, query: &str, body: &str) -> Vec<(String, String)> {
        let ts = chrono::Utc::now().timestamp().to_string();
        let canonical = format!("{method}{ts}{path}{query}{body}");
        vec![
            ("api-key".to_string(), self.api_key.clone()),
            ("timestamp".to_string(), ts),
            ("signature".to_string(), self.sign(&canonical)),
        ]
    }

    // -------------------------------------------------------------------------
    // OHLCV
    // -------------------------------------------------------------------------

    /// Fetch one timeframe of candles, `limit` bars back from now. Retries
    /// transient failures; an exhausted retry budget is an error the caller
    /// treats as a skipped cycle.
    pub async fn fetch_ohlcv(&self, tf: &str, limit: Option<usize>) -> Result<TfSeries> {
        let Some(sec) = timeframe_seconds(tf) else {
            bail!("unsupported timeframe: {tf}");
        };
        let limit = limit.unwrap_or_else(|| min_bars_for(tf)).clamp(1, MAX_CANDLES);

        let now_s = chrono::Utc::now().timestamp();
        let start_s = now_s - limit as i64 * sec;
        let end_s = now_s.max(start_s + sec);
        let url = format!(
            "{}/v2/history/candles?resolution={}&symbol={}&start={}&end={}",
            self.base_url, tf, self.pair, start_s, end_s
        );

        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 1..=FETCH_RETRIES {
            match self.fetch_ohlcv_once(&url).await {
                Ok(series) => return Ok(series),
                Err(e) => {
                    debug!(tf, attempt, error = %e, "ohlcv fetch attempt failed");
                    last_err = Some(e);
                    tokio::time::sleep(std::time::Duration::from_millis(FETCH_BACKOFF_MS)).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("ohlcv fetch failed")))
    }

    async fn fetch_ohlcv_once(&self, url: &str) -> Result<TfSeries> {
        let resp = self.client.get(url).send().await.context("candles request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("candles response not json")?;
        if !status.is_success() {
            bail!("candles endpoint returned {status}: {body}");
        }
        let rows = body
            .get("result")
            .or_else(|| body.get("candles"))
            .or_else(|| body.get("data"))
            .unwrap_or(&body);
        parse_candles(rows)
    }

    // -------------------------------------------------------------------------
    // Balance / positions
    // -------------------------------------------------------------------------

    /// Free quote-asset balance for the configured pair.
    pub async fn fetch_balance_quote(&self) -> Result<f64> {
        let path = "/v2/wallet/balances";
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.get(&url);
        for (k, v) in self.signed_headers("GET", path, "", "") {
            req = req.header(k, v);
        }
        let resp = req.send().await.context("balance request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("balance response not json")?;
        if !status.is_success() {
            bail!("balance endpoint returned {status}: {body}");
        }

        let quote = quote_from_pair(&self.pair);
        let rows = body.get("result").and_then(|v| v.as_array()).cloned().unwrap_or_default();
        for row in rows {
            let asset = row
                .get("asset_symbol")
                .or_else(|| row.get("asset"))
                .and_then(|v| v.as_str())
                .unwrap_or("");
            if asset.eq_ignore_ascii_case(&quote) {
                return Ok(json_f64(
                    row.get("available_balance").or_else(|| row.get("balance")),
                ));
            }
        }
        warn!(quote, "quote asset not found in wallet balances — returning 0.0");
        Ok(0.0)
    }

    /// Positions for the configured pair. Flat positions are filtered out.
    pub async fn fetch_positions(&self) -> Result<Vec<VenuePosition>> {
        let path = "/v2/positions";
        let query = format!("?product_symbol={}", self.pair);
        let url = format!("{}{}{}", self.base_url, path, query);
        let mut req = self.client.get(&url);
        for (k, v) in self.signed_headers("GET", path, &query, "") {
            req = req.header(k, v);
        }
        let resp = req.send().await.context("positions request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("positions response not json")?;
        if !status.is_success() {
            bail!("positions endpoint returned {status}: {body}");
        }

        let rows = match body.get("result") {
            Some(serde_json::Value::Array(a)) => a.clone(),
            Some(v) if v.is_object() => vec![v.clone()],
            _ => Vec::new(),
        };
        let mut out = Vec::new();
        for row in rows {
            let contracts = json_f64(
                row.get("size")
                    .or_else(|| row.get("contracts"))
                    .or_else(|| row.get("positionAmt")),
            );
            if contracts.abs() <= 1e-9 {
                continue;
            }
            out.push(VenuePosition {
                side: if contracts >= 0.0 { "buy".into() } else { "sell".into() },
                contracts: contracts.abs(),
                entry_price: json_f64(row.get("entry_price").or_else(|| row.get("entryPrice"))),
            });
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// Submit an order. `order_type` is "market", "limit", or "stop"; stops
    /// carry a trigger price and exits should be reduce-only.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_order(
        &self,
        order_type: &str,
        side: &str,
        amount: f64,
        price: Option<f64>,
        reduce_only: bool,
        trigger_price: Option<f64>,
    ) -> Result<serde_json::Value> {
        let path = "/v2/orders";
        let mut body = serde_json::json!({
            "product_symbol": self.pair,
            "size": amount,
            "side": side,
            "order_type": match order_type {
                "limit" => "limit_order",
                "stop" => "stop_order",
                _ => "market_order",
            },
        });
        if let Some(p) = price {
            body["limit_price"] = serde_json::json!(p.to_string());
        }
        if reduce_only {
            body["reduce_only"] = serde_json::json!(true);
        }
        if let Some(tp) = trigger_price {
            body["stop_price"] = serde_json::json!(tp.to_string());
        }
        let body_str = body.to_string();

        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.post(&url).body(body_str.clone());
        req = req.header("content-type", "application/json");
        for (k, v) in self.signed_headers("POST", path, "", &body_str) {
            req = req.header(k, v);
        }

        debug!(order_type, side, amount, ?price, reduce_only, "submitting order");
        let resp = req.send().await.context("order request failed")?;
        let status = resp.status();
        let out: serde_json::Value = resp.json().await.context("order response not json")?;
        if !status.is_success() {
            bail!("order endpoint returned {status}: {out}");
        }
        Ok(out.get("result").cloned().unwrap_or(out))
    }

    /// Open orders for the configured pair.
    pub async fn fetch_open_orders(&self) -> Result<Vec<serde_json::Value>> {
        let path = "/v2/orders";
        let query = format!("?product_symbol={}&state=open", self.pair);
        let url = format!("{}{}{}", self.base_url, path, query);
        let mut req = self.client.get(&url);
        for (k, v) in self.signed_headers("GET", path, &query, "") {
            req = req.header(k, v);
        }
        let resp = req.send().await.context("open-orders request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("open-orders response not json")?;
        if !status.is_success() {
            bail!("open-orders endpoint returned {status}: {body}");
        }
        Ok(body
            .get("result")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default())
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let path = "/v2/orders";
        let body = serde_json::json!({ "id": order_id, "product_symbol": self.pair }).to_string();
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.delete(&url).body(body.clone());
        req = req.header("content-type", "application/json");
        for (k, v) in self.signed_headers("DELETE", path, "", &body) {
            req = req.header(k, v);
        }
        let resp = req.send().await.context("cancel request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let body: serde_json::Value = resp.json().await.unwrap_or_default();
            bail!("cancel endpoint returned {status}: {body}");
        }
        Ok(())
    }
}

impl std::fmt::Debug for DeltaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("pair", &self.pair)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

fn json_f64(v: Option<&serde_json::Value>) -> f64 {
    match v {
        Some(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(serde_json::Value::String(s)) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Parse candle rows (array-of-arrays or array-of-objects) into a TfSeries.
/// Timestamps normalize to milliseconds; output is sorted ascending.
pub fn parse_candles(rows: &serde_json::Value) -> Result<TfSeries> {
    let arr = rows.as_array().context("candle payload is not an array")?;
    let mut bars: Vec<(i64, f64, f64, f64, f64, f64)> = Vec::with_capacity(arr.len());

    for row in arr {
        let bar = if let Some(cells) = row.as_array() {
            if cells.len() < 5 {
                continue;
            }
            (
                json_i64(&cells[0]),
                json_f64(Some(&cells[1])),
                json_f64(Some(&cells[2])),
                json_f64(Some(&cells[3])),
                json_f64(Some(&cells[4])),
                cells.get(5).map(|v| json_f64(Some(v))).unwrap_or(0.0),
            )
        } else if row.is_object() {
            let t = row
                .get("time")
                .or_else(|| row.get("timestamp"))
                .or_else(|| row.get("ts"))
                .or_else(|| row.get("t"));
            let Some(t) = t else { continue };
            (
                json_i64(t),
                json_f64(row.get("open").or_else(|| row.get("o"))),
                json_f64(row.get("high").or_else(|| row.get("h"))),
                json_f64(row.get("low").or_else(|| row.get("l"))),
                json_f64(row.get("close").or_else(|| row.get("c"))),
                json_f64(row.get("volume").or_else(|| row.get("v"))),
            )
        } else {
            continue;
        };
        let ts_ms = if bar.0 >= 1_000_000_000_000 { bar.0 } else { bar.0 * 1000 };
        bars.push((ts_ms, bar.1, bar.2, bar.3, bar.4, bar.5));
    }

    bars.sort_by_key(|b| b.0);

    let mut out = TfSeries::default();
    for (ts, o, h, l, c, v) in bars {
        out.push_bar(ts, o, h, l, c, v);
    }
    Ok(out)
}

fn json_i64(v: &serde_json::Value) -> i64 {
    match v {
        serde_json::Value::Number(n) => n.as_i64().unwrap_or(0),
        serde_json::Value::String(s) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_table() {
        assert_eq!(timeframe_seconds("5m"), Some(300));
        assert_eq!(timeframe_seconds("1h"), Some(3600));
        assert_eq!(timeframe_seconds("1d"), Some(86400));
        assert_eq!(timeframe_seconds("7w"), None);
    }

    #[test]
    fn quote_extraction() {
        assert_eq!(quote_from_pair("SOL/USDT"), "USDT");
        assert_eq!(quote_from_pair("SOLUSD"), "USD");
        assert_eq!(quote_from_pair("BTCUSDT"), "USDT");
        assert_eq!(quote_from_pair("ETHPERP"), "USD");
    }

    #[test]
    fn parse_array_rows_normalizes_seconds_to_ms() {
        let rows = serde_json::json!([
            [1_700_000_060, 101.0, 102.0, 100.0, 101.5, 5.0],
            [1_700_000_000, "100.0", "101.0", "99.0", "100.5", "4.0"]
        ]);
        let tf = parse_candles(&rows).unwrap();
        assert_eq!(tf.len(), 2);
        // Sorted ascending and normalized to milliseconds.
        assert_eq!(tf.timestamp, vec![1_700_000_000_000, 1_700_000_060_000]);
        assert_eq!(tf.close, vec![100.5, 101.5]);
        assert!(tf.is_coherent());
    }

    #[test]
    fn parse_object_rows() {
        let rows = serde_json::json!([
            { "time": 1_700_000_000, "open": 1.0, "high": 2.0, "low": 0.5, "close": 1.5, "volume": 3.0 },
            { "t": 1_700_000_300_000_i64, "o": "1.5", "h": "2.5", "l": "1.0", "c": "2.0", "v": "6.0" }
        ]);
        let tf = parse_candles(&rows).unwrap();
        assert_eq!(tf.len(), 2);
        assert_eq!(tf.timestamp[1], 1_700_000_300_000);
        assert_eq!(tf.volume, vec![3.0, 6.0]);
    }

    #[test]
    fn parse_skips_malformed_rows() {
        let rows = serde_json::json!([
            [1_700_000_000, 1.0], // too short
            "garbage",
            [1_700_000_060, 1.0, 2.0, 0.5, 1.5]
        ]);
        let tf = parse_candles(&rows).unwrap();
        assert_eq!(tf.len(), 1);
        assert_eq!(tf.volume, vec![0.0]);
    }

    #[test]
    fn parse_non_array_payload_errors() {
        assert!(parse_candles(&serde_json::json!({"nope": true})).is_err());
    }

    #[test]
    fn signature_is_deterministic_hex() {
        let c = DeltaClient::new("https://x", "SOLUSD", "key", "secret");
        let a = c.sign("GET1700000000/v2/positions");
        let b = c.sign("GET1700000000/v2/positions");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn debug_redacts_credentials() {
        let c = DeltaClient::new("https://x", "SOLUSD", "key-123", "secret-456");
        let dbg = format!("{c:?}");
        assert!(!dbg.contains("key-123"));
        assert!(!dbg.contains("secret-456"));
    }
}
