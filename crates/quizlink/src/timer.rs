// Optional timers for use as `tokio::select!` branches.
//
// A disarmed timer never completes, so a select branch over it simply never
// fires. Dropping the inner `Interval`/`Sleep` cancels it.

use std::future::pending;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior, Sleep};

/// A fixed-period timer that can be started and stopped.
#[derive(Debug, Default)]
pub struct RepeatingTimer {
    interval: Option<Interval>,
}

impl RepeatingTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start ticking. With `immediate`, the first tick completes right away;
    /// otherwise after one full period. Restarts a running timer.
    pub fn start(&mut self, period: Duration, immediate: bool) {
        let first = if immediate {
            Instant::now()
        } else {
            Instant::now() + period
        };
        let mut interval = interval_at(first, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.interval = Some(interval);
    }

    pub fn stop(&mut self) {
        self.interval = None;
    }

    pub fn is_running(&self) -> bool {
        self.interval.is_some()
    }

    /// Wait for the next tick. Pends forever while stopped.
    pub async fn tick(&mut self) {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => pending::<()>().await,
        }
    }
}

/// A single delayed wakeup that can be armed and cancelled.
#[derive(Debug, Default)]
pub struct OneShot {
    sleep: Option<Pin<Box<Sleep>>>,
}

impl OneShot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, delay: Duration) {
        self.sleep = Some(Box::pin(tokio::time::sleep(delay)));
    }

    pub fn cancel(&mut self) {
        self.sleep = None;
    }

    pub fn is_armed(&self) -> bool {
        self.sleep.is_some()
    }

    /// Wait until the timer fires, then disarm it. Pends forever while
    /// disarmed.
    pub async fn fired(&mut self) {
        match self.sleep.as_mut() {
            Some(sleep) => {
                sleep.as_mut().await;
                self.sleep = None;
            }
            None => pending::<()>().await,
        }
    }
}
