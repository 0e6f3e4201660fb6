// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Owned handle for one fixed-rate repeating task.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Smallest period a timer will run at.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Ownership token for a repeating task spawned by [`TimerHandle::every`].
///
/// The task stops when the handle is released, dropped, or when the parent
/// scope token is cancelled, whichever comes first.
pub struct TimerHandle {
    cancel: CancellationToken,
    period: Duration,
}

impl TimerHandle {
    /// Spawn a task that calls `tick` once per `period`, starting one period
    /// from now.
    ///
    /// Ticks are scheduled from the previous tick, not from when `tick`
    /// returns, so `tick` must not block. Work that takes time belongs in a
    /// task spawned by `tick` itself.
    pub fn every<F>(period: Duration, parent: &CancellationToken, mut tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let period = if period < MIN_PERIOD {
            tracing::warn!(?period, "timer period below minimum, clamping to {MIN_PERIOD:?}");
            MIN_PERIOD
        } else {
            period
        };
        let cancel = parent.child_token();
        let start = tokio::time::Instant::now() + period;

        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval_at(start, period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => {}
                    }
                    if cancel.is_cancelled() {
                        break;
                    }
                    tick();
                }
            });
        }

        Self { cancel, period }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_released(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop the repeating task. Safe to call more than once.
    pub fn release(&self) {
        self.cancel.cancel();
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
#[path = "timer_tests.rs"]
mod tests;
