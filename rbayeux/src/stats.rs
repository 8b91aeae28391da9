//! Runtime counters for diagnostics.

use serde::{Deserialize, Serialize};
use serde_json::json;

use rbayeux_utils::{Counter, Total};

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Stats {
    pub sessions: Counter,
    pub channels: Counter,
    pub subscriptions: Counter,
    pub handlers: Counter,

    pub handshakes: Total,
    pub handshakes_denied: Total,
    pub publishes: Total,
    pub publishes_denied: Total,
    pub deliveries: Total,
    pub deliveries_dropped: Total,
    pub vetoes: Total,
    pub handler_faults: Total,
    pub expired: Total,
}

impl Stats {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "sessions.count": self.sessions.count(),
            "sessions.max": self.sessions.max(),
            "channels.count": self.channels.count(),
            "channels.max": self.channels.max(),
            "subscriptions.count": self.subscriptions.count(),
            "subscriptions.max": self.subscriptions.max(),
            "handlers.count": self.handlers.count(),
            "handlers.max": self.handlers.max(),

            "handshakes": self.handshakes.get(),
            "handshakes.denied": self.handshakes_denied.get(),
            "publishes": self.publishes.get(),
            "publishes.denied": self.publishes_denied.get(),
            "deliveries": self.deliveries.get(),
            "deliveries.dropped": self.deliveries_dropped.get(),
            "vetoes": self.vetoes.get(),
            "handler.faults": self.handler_faults.get(),
            "sessions.expired": self.expired.get(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_json() {
        let stats = Stats::new();
        stats.sessions.inc();
        stats.sessions.inc();
        stats.sessions.dec();
        stats.deliveries.add(3);
        let v = stats.to_json();
        assert_eq!(v["sessions.count"], json!(1));
        assert_eq!(v["sessions.max"], json!(2));
        assert_eq!(v["deliveries"], json!(3));
        assert_eq!(v["vetoes"], json!(0));
    }
}
