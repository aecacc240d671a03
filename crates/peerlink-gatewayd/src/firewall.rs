//! Firewall Enforcement Loop.
//!
//! Every interval the top-level chains, their hooks and the baseline accept
//! rules are asserted again, undoing whatever a restarted CNI or an operator
//! flushed. On cancellation the loop runs the final teardown and exits.

use peerlink_common::PeerlinkResult;
use peerlink_netfilter::{Baseline, RuleEngine};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct FirewallEnforcer {
    engine: Arc<RuleEngine>,
    baseline: Baseline,
    interval: Duration,
}

impl FirewallEnforcer {
    pub fn new(engine: Arc<RuleEngine>, baseline: Baseline, interval: Duration) -> Self {
        Self {
            engine,
            baseline,
            interval,
        }
    }

    /// One enforcement pass. Returns the number of baseline rules that had
    /// gone missing.
    pub async fn enforce_once(&self) -> PeerlinkResult<usize> {
        self.engine.init().await?;
        self.engine.ensure_baseline(&self.baseline).await
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(interval = ?self.interval, "Firewall enforcement started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match self.enforce_once().await {
                    Ok(0) => debug!("Firewall baseline intact"),
                    Ok(restored) => info!(restored, "Firewall baseline restored"),
                    Err(e) => warn!(error = %e, "Firewall enforcement failed, retrying next tick"),
                },
            }
        }

        info!("Firewall enforcement stopping, removing rules");
        if let Err(e) = self.engine.terminate(&self.baseline).await {
            error!(error = %e, "Firewall teardown failed");
        }
    }
}
