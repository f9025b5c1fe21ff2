// =============================================================================
// Notifier — best-effort Telegram messages with per-(key, trade) throttling
// =============================================================================
//
// Sends are fire-and-forget from the caller's perspective: any failure is
// logged and swallowed. The throttle map suppresses repeats of the same
// notification key for the same trade inside TG_MIN_INTERVAL_S.
// =============================================================================

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Throttle state: last send time (epoch seconds) per (key, trade).
#[derive(Default)]
struct ThrottleMap {
    last_sent: HashMap<(String, i64), i64>,
}

impl ThrottleMap {
    /// Whether a (key, trade) may send now; records the send when allowed.
    fn allow(&mut self, key: &str, trade_id: i64, now_s: i64, min_interval_s: i64) -> bool {
        match self.last_sent.get(&(key.to_string(), trade_id)) {
            Some(&last) if now_s - last < min_interval_s => false,
            _ => {
                self.last_sent.insert((key.to_string(), trade_id), now_s);
                true
            }
        }
    }

    fn forget_trade(&mut self, trade_id: i64) {
        self.last_sent.retain(|(_, tid), _| *tid != trade_id);
    }
}

pub struct Notifier {
    client: reqwest::Client,
    bot_token: String,
    chat_id: String,
    min_interval_s: i64,
    throttle: Mutex<ThrottleMap>,
}

impl Notifier {
    pub fn new(bot_token: String, chat_id: String, min_interval_s: i64) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            bot_token,
            chat_id,
            min_interval_s,
            throttle: Mutex::new(ThrottleMap::default()),
        }
    }

    pub fn enabled(&self) -> bool {
        !self.bot_token.is_empty() && !self.chat_id.is_empty()
    }

    /// Best-effort send. Disabled configuration degrades to a debug log.
    pub async fn send(&self, text: &str) {
        if !self.enabled() {
            debug!(text, "telegram disabled — notification skipped");
            return;
        }
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let body = serde_json::json!({ "chat_id": self.chat_id, "text": text });
        match self.client.post(&url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!(status = %resp.status(), "telegram send rejected"),
            Err(e) => warn!(error = %e, "telegram send failed"),
        }
    }

    /// Throttled variant: at most one message per (key, trade) inside the
    /// configured interval.
    pub async fn send_throttled(&self, key: &str, trade_id: i64, text: &str) {
        let now_s = chrono::Utc::now().timestamp();
        let allowed = self
            .throttle
            .lock()
            .allow(key, trade_id, now_s, self.min_interval_s);
        if allowed {
            self.send(text).await;
        } else {
            debug!(key, trade_id, "notification throttled");
        }
    }

    /// Drop throttle state for a finished trade.
    pub fn clear_trade(&self, trade_id: i64) {
        self.throttle.lock().forget_trade(trade_id);
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_blocks_within_interval() {
        let mut tm = ThrottleMap::default();
        assert!(tm.allow("SL_MOVE", 1, 100, 20));
        assert!(!tm.allow("SL_MOVE", 1, 110, 20));
        assert!(tm.allow("SL_MOVE", 1, 121, 20));
    }

    #[test]
    fn throttle_is_scoped_per_key_and_trade() {
        let mut tm = ThrottleMap::default();
        assert!(tm.allow("SL_MOVE", 1, 100, 20));
        // Different key, same trade: allowed.
        assert!(tm.allow("TP_HIT", 1, 100, 20));
        // Same key, different trade: allowed.
        assert!(tm.allow("SL_MOVE", 2, 100, 20));
    }

    #[test]
    fn forget_trade_resets_state() {
        let mut tm = ThrottleMap::default();
        assert!(tm.allow("SL_MOVE", 1, 100, 20));
        tm.forget_trade(1);
        assert!(tm.allow("SL_MOVE", 1, 101, 20));
    }

    #[test]
    fn notifier_disabled_without_credentials() {
        let n = Notifier::new(String::new(), String::new(), 20);
        assert!(!n.enabled());
        let n = Notifier::new("token".into(), "chat".into(), 20);
        assert!(n.enabled());
    }
}
