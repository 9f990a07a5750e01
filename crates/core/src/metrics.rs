use std::time::Duration;

use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntGauge, IntGaugeVec, Opts, Registry,
};

// Timer label values. These are stable for scraping.
pub const LATEST_BLOCK_NUMBER: &str = "latestBlockNumber";
pub const SEND_TX: &str = "sendTx";
pub const SIGN_TX: &str = "signTx";
pub const SUGGEST_GAS_PRICE: &str = "suggestGasPrice";
pub const PENDING_BALANCE_AT: &str = "pendingBalanceAt";
pub const PENDING_NONCE_AT: &str = "pendingNonceAt";

pub const SEEDER: &str = "seeder";
pub const SENDER: &str = "sender";

/// Process-wide metric registry. Timers are series of `rpc_latency_seconds`
/// labelled by method name; worker states are series of `worker_state`
/// labelled by worker kind and state name.
pub struct Metrics {
    registry: Registry,
    rpc_latency: HistogramVec,
    send_tx_errors: IntCounter,
    worker_state: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let rpc_latency = HistogramVec::new(
            HistogramOpts::new("rpc_latency_seconds", "Latency of RPC calls in seconds"),
            &["method"],
        )
        .expect("rpc_latency");
        registry
            .register(Box::new(rpc_latency.clone()))
            .expect("rpc_latency registered");

        let send_tx_errors = IntCounter::new("send_tx_errors_total", "Failed tx submissions")
            .expect("send_tx_errors");
        registry
            .register(Box::new(send_tx_errors.clone()))
            .expect("send_tx_errors registered");

        let worker_state = IntGaugeVec::new(
            Opts::new("worker_state", "Workers currently in each state"),
            &["worker", "state"],
        )
        .expect("worker_state");
        registry
            .register(Box::new(worker_state.clone()))
            .expect("worker_state registered");

        Self {
            registry,
            rpc_latency,
            send_tx_errors,
            worker_state,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn timer(&self, method: &str) -> Histogram {
        self.rpc_latency.with_label_values(&[method])
    }

    pub fn observe(&self, method: &str, elapsed: Duration) {
        self.timer(method).observe(elapsed.as_secs_f64());
    }

    pub fn mark_send_error(&self) {
        self.send_tx_errors.inc();
    }

    /// Successful transaction submissions since startup.
    pub fn sent_count(&self) -> u64 {
        self.timer(SEND_TX).get_sample_count()
    }

    /// Failed transaction submissions since startup.
    pub fn error_count(&self) -> u64 {
        self.send_tx_errors.get()
    }

    pub fn state(&self, worker: &str, state: &str) -> IntGauge {
        self.worker_state.with_label_values(&[worker, state])
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Cursor over the named-state gauges for a single worker. Moving to a new
/// state decrements the gauge being left and increments the one entered, so
/// each gauge counts the workers currently in that state.
#[derive(Default)]
pub struct StateTracker {
    current: Option<IntGauge>,
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the state being left. `None` clears the cursor (worker exit).
    pub fn transition(&mut self, to: Option<IntGauge>) -> Option<IntGauge> {
        if let Some(cur) = &self.current {
            cur.dec();
        }
        let last = self.current.take();
        if let Some(next) = &to {
            next.inc();
        }
        self.current = to;
        last
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{Metrics, StateTracker, SEEDER, SEND_TX};

    #[test]
    fn tracks_state_transitions() {
        let metrics = Metrics::new();
        let seed = metrics.state(SEEDER, "seed");
        let collect = metrics.state(SEEDER, "collect");

        let mut tracker = StateTracker::new();
        assert!(tracker.transition(Some(seed.clone())).is_none());
        assert_eq!(seed.get(), 1);

        let last = tracker.transition(Some(collect.clone()));
        assert_eq!(seed.get(), 0);
        assert_eq!(collect.get(), 1);

        // A second worker in the same state stacks on the same gauge.
        let mut other = StateTracker::new();
        other.transition(Some(collect.clone()));
        assert_eq!(collect.get(), 2);

        tracker.transition(last);
        assert_eq!(collect.get(), 1);
        assert_eq!(seed.get(), 1);

        tracker.transition(None);
        assert_eq!(seed.get(), 0);
    }

    #[test]
    fn counts_sends_and_errors() {
        let metrics = Metrics::new();
        assert_eq!(metrics.sent_count(), 0);
        metrics.observe(SEND_TX, Duration::from_millis(5));
        metrics.observe(SEND_TX, Duration::from_millis(7));
        metrics.mark_send_error();
        assert_eq!(metrics.sent_count(), 2);
        assert_eq!(metrics.error_count(), 1);
    }
}
