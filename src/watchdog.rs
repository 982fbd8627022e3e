//! Liveness watchdog.
//!
//! The main loop touches a [`WatchdogTimer`] after every successful telemetry publish.
//! A separate task checks the timer periodically and hard reboots the device once the
//! time since the last touch exceeds the limit. It knows nothing else about the agent,
//! so it still fires when the main loop is wedged inside a retry loop.

use crate::platform::PowerControl;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Timestamp of the last successful publish, shared between the main loop (writer)
/// and the watchdog task (reader).
#[derive(Debug, Clone)]
pub struct WatchdogTimer {
    origin: Instant,
    // milliseconds since `origin`
    last_touch: Arc<AtomicU64>,
}

impl WatchdogTimer {
    /// A fresh timer counts as touched at creation.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_touch: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_touch.store(now, Ordering::Relaxed);
    }

    pub fn since_last_touch(&self) -> Duration {
        let last = Duration::from_millis(self.last_touch.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }
}

impl Default for WatchdogTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct Watchdog {
    timer: WatchdogTimer,
    limit: Duration,
    check_period: Duration,
}

impl Watchdog {
    /// Limit for a given publish interval, `None` when publishing is disabled.
    pub fn limit_for(publish_interval: Duration, multiplier: u32) -> Option<Duration> {
        if publish_interval.is_zero() || multiplier == 0 {
            None
        } else {
            Some(publish_interval * multiplier)
        }
    }

    pub fn new(timer: WatchdogTimer, limit: Duration, check_period: Duration) -> Self {
        Self {
            timer,
            limit,
            check_period,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.timer.since_last_touch() > self.limit
    }

    pub fn spawn(self, power: Arc<dyn PowerControl>, cancel: CancellationToken) -> JoinHandle<()> {
        info!(
            "Watchdog armed: limit {:?}, checked every {:?}",
            self.limit, self.check_period
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.check_period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Watchdog stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if self.is_expired() {
                            error!(
                                "No successful publish for {:?}, rebooting",
                                self.timer.since_last_touch()
                            );
                            power.hard_reboot();
                            break;
                        }
                    }
                }
            }
        })
    }
}
