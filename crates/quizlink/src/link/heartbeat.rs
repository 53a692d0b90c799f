// Liveness signal for the active match.

use std::time::Duration;

use tracing::{debug, info};

use crate::timer::RepeatingTimer;

/// Periodic heartbeat for one match.
///
/// Starts only on request (after a successful join), sends immediately and
/// then every `period`. Once `finish` is called the scheduler refuses to
/// start again for the rest of the match.
#[derive(Debug)]
pub struct HeartbeatScheduler {
    period: Duration,
    timer: RepeatingTimer,
    finished: bool,
}

impl HeartbeatScheduler {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            timer: RepeatingTimer::new(),
            finished: false,
        }
    }

    /// Start the timer. Returns `false` when one is already running or the
    /// match is over.
    pub fn start(&mut self) -> bool {
        if self.finished {
            debug!("heartbeat not started: match finished");
            return false;
        }
        if self.timer.is_running() {
            debug!("heartbeat already running");
            return false;
        }
        info!("Heartbeat started every {:?}", self.period);
        self.timer.start(self.period, true);
        true
    }

    /// Stop sending. A later `start` is allowed (e.g. after a rejoin).
    pub fn stop(&mut self) {
        if self.timer.is_running() {
            info!("Heartbeat stopped");
        }
        self.timer.stop();
    }

    /// Stop for good: the match finished.
    pub fn finish(&mut self) {
        self.stop();
        self.finished = true;
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_running()
    }

    /// Resolves when the next heartbeat is due. Pends forever while stopped.
    pub async fn tick(&mut self) {
        self.timer.tick().await;
    }
}
