//! Keep-alive timer for the open channel.

use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Periodic ping timer. Owns its interval; stopping drops it, so no tick can
/// fire for a channel that is gone.
#[derive(Debug)]
pub(crate) struct Heartbeat {
    period: Duration,
    interval: Option<Interval>,
}

impl Heartbeat {
    pub(crate) fn new(period: Duration) -> Self {
        Self {
            period,
            interval: None,
        }
    }

    /// (Re)arm the timer. The first tick fires one full period from now.
    pub(crate) fn start(&mut self) {
        let mut interval = tokio::time::interval_at(Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.interval = Some(interval);
    }

    pub(crate) fn stop(&mut self) {
        self.interval = None;
    }

    /// Resolves on the next tick; pending forever while stopped.
    pub(crate) async fn tick(&mut self) {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending().await,
        }
    }
}
