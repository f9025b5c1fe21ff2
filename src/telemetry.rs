// =============================================================================
// Telemetry — structured event sink (tracing + telemetry table)
// =============================================================================
//
// Every component emits through `log`: the event lands in the tracing
// subscriber for the console and, best effort, in the telemetry table for
// the dashboard. Failures to persist never propagate into the loops.
// =============================================================================

use std::sync::Arc;

use tracing::info;

use crate::store::{now_ms, Store};

/// Append-ordered, write-only sink over the telemetry table.
#[derive(Clone)]
pub struct Telemetry {
    store: Arc<Store>,
}

impl Telemetry {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Emit one structured event.
    pub fn log(&self, component: &str, tag: &str, message: &str, payload: serde_json::Value) {
        info!(component, tag, payload = %payload, "{message}");
        let payload_str = payload.to_string();
        if let Err(e) = self
            .store
            .insert_telemetry(now_ms(), component, tag, message, &payload_str)
        {
            tracing::warn!(error = %e, component, tag, "telemetry insert failed");
        }
    }

    /// Startup heartbeat with the normalized engine order.
    pub fn log_engine_order(&self, order: &[String]) {
        self.log(
            "runtime",
            "STARTUP",
            "engine order",
            serde_json::json!({ "engine_order": order }),
        );
    }
}
