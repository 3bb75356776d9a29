//! What starts a run.
//!
//! The runner does not schedule itself: an external timer invokes the binary
//! once per cycle (`OnceTrigger`). `IntervalTrigger` drives repeated runs from
//! inside one process for setups without an external scheduler.

use std::future::Future;
use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub trait Trigger {
    /// Wait for the next run. `false` means no more runs.
    fn fire(&mut self) -> impl Future<Output = bool>;
}

/// Fires exactly once.
#[derive(Debug, Default)]
pub struct OnceTrigger {
    fired: bool,
}

impl OnceTrigger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Trigger for OnceTrigger {
    async fn fire(&mut self) -> bool {
        !std::mem::replace(&mut self.fired, true)
    }
}

/// Fires immediately, then every `period` until cancelled.
#[derive(Debug)]
pub struct IntervalTrigger {
    ticker: Interval,
    cancel: CancellationToken,
}

impl IntervalTrigger {
    pub fn new(period: Duration, cancel: CancellationToken) -> Self {
        let mut ticker = interval(period);
        // A long run must not cause a burst of catch-up runs
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { ticker, cancel }
    }
}

impl Trigger for IntervalTrigger {
    async fn fire(&mut self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = self.ticker.tick() => !self.cancel.is_cancelled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_once_trigger_fires_once() {
        let mut trigger = OnceTrigger::new();
        assert!(trigger.fire().await);
        assert!(!trigger.fire().await);
        assert!(!trigger.fire().await);
    }

    #[tokio::test]
    async fn test_interval_trigger_stops_when_cancelled() {
        let cancel = CancellationToken::new();
        let mut trigger = IntervalTrigger::new(Duration::from_millis(10), cancel.clone());

        assert!(trigger.fire().await);
        assert!(trigger.fire().await);

        cancel.cancel();
        assert!(!trigger.fire().await);
    }
}
