// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Polling synchronizer: drives one fetcher on a fixed cadence and publishes
//! the resulting [`SyncState`].
//!
//! Fetches are issued at activation and then once per interval, measured
//! from the previous issuance. Overlapping fetches are allowed and the last
//! one to complete wins. Every issued fetch is bound to the activation scope
//! it was issued in; once that scope is deactivated its completion is
//! discarded instead of written.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::fetch::{describe_failure, Fetcher};
use crate::state::{SyncEvent, SyncState};
use crate::timer::TimerHandle;

/// Cadence used when a caller does not pick one.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(30_000);

/// Scheduling options for a [`Poller`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    pub interval: Duration,
    /// When false the poller issues no fetches and owns no timer.
    pub enabled: bool,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self { interval: DEFAULT_INTERVAL, enabled: true }
    }
}

impl PollOptions {
    pub fn every(interval: Duration) -> Self {
        Self { interval, ..Self::default() }
    }
}

/// Fixed-rate poller for a single data source.
///
/// Must be created inside a Tokio runtime. Dropping the poller disposes it.
pub struct Poller {
    inner: Arc<Inner>,
}

struct Inner {
    key: Option<String>,
    fetcher: Mutex<Arc<dyn Fetcher>>,
    state_tx: watch::Sender<SyncState>,
    events: Option<broadcast::Sender<SyncEvent>>,
    control: Mutex<Control>,
}

struct Control {
    options: PollOptions,
    /// Activation scope. Replaced with a fresh token on every deactivation.
    scope: CancellationToken,
    timer: Option<TimerHandle>,
    /// Bumped whenever the timer is replaced or released. Ticks carrying an
    /// older value are ignored.
    timer_generation: u64,
    /// Fetches issued under `scope` that have not settled yet.
    in_flight: usize,
    disposed: bool,
}

impl Poller {
    /// Create a poller and, if enabled, issue the first fetch immediately.
    pub fn spawn(fetcher: impl Fetcher, options: PollOptions) -> Self {
        Self::build(None, Arc::new(fetcher), options, None)
    }

    /// Create a poller whose state changes are also published as
    /// [`SyncEvent::Updated`] under `key`.
    pub(crate) fn spawn_keyed(
        key: String,
        fetcher: Arc<dyn Fetcher>,
        options: PollOptions,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        Self::build(Some(key), fetcher, options, Some(events))
    }

    fn build(
        key: Option<String>,
        fetcher: Arc<dyn Fetcher>,
        options: PollOptions,
        events: Option<broadcast::Sender<SyncEvent>>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SyncState::default());
        let inner = Arc::new(Inner {
            key,
            fetcher: Mutex::new(fetcher),
            state_tx,
            events,
            control: Mutex::new(Control {
                options,
                scope: CancellationToken::new(),
                timer: None,
                timer_generation: 0,
                in_flight: 0,
                disposed: false,
            }),
        });
        if options.enabled {
            let mut control = inner.control.lock();
            start_timer(&inner, &mut control);
        }
        Self { inner }
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> SyncState {
        self.inner.state_tx.borrow().clone()
    }

    /// Watch the state for changes.
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.inner.state_tx.subscribe()
    }

    pub fn options(&self) -> PollOptions {
        self.inner.control.lock().options
    }

    pub fn is_enabled(&self) -> bool {
        let control = self.inner.control.lock();
        control.options.enabled && !control.disposed
    }

    /// Whether a repeating timer is currently owned.
    pub fn has_timer(&self) -> bool {
        self.inner.control.lock().timer.as_ref().is_some_and(|t| !t.is_released())
    }

    /// Force an out-of-band fetch.
    ///
    /// `loading` is set before this returns. The returned future settles once
    /// the fetch has completed and its result has been applied; dropping the
    /// future does not cancel the fetch. A disabled or disposed poller issues
    /// nothing and the future resolves immediately.
    pub fn refresh(&self) -> impl Future<Output = ()> + Send + 'static {
        let issued = issue(&self.inner);
        async move {
            if let Some(handle) = issued {
                let _ = handle.await;
            }
        }
    }

    /// Turn scheduling on or off.
    ///
    /// Disabling releases the timer and discards the results of fetches
    /// still in flight. Enabling starts a fresh timer, which fetches
    /// immediately.
    pub fn set_enabled(&self, enabled: bool) {
        let mut control = self.inner.control.lock();
        if control.disposed || control.options.enabled == enabled {
            return;
        }
        control.options.enabled = enabled;
        if enabled {
            start_timer(&self.inner, &mut control);
        } else {
            deactivate(&self.inner, &mut control);
        }
    }

    /// Change the cadence. The old timer is released and, when enabled, a
    /// new one starts with an immediate fetch. Fetches already in flight
    /// still apply.
    pub fn set_interval(&self, interval: Duration) {
        let mut control = self.inner.control.lock();
        if control.options.interval == interval {
            return;
        }
        control.options.interval = interval;
        if control.options.enabled && !control.disposed {
            if let Some(timer) = control.timer.take() {
                timer.release();
            }
            start_timer(&self.inner, &mut control);
        }
    }

    /// Swap the fetch operation. Takes effect from the next issuance.
    pub fn set_fetcher(&self, fetcher: Arc<dyn Fetcher>) {
        *self.inner.fetcher.lock() = fetcher;
    }

    /// Release the timer and stop applying results. Idempotent.
    pub fn dispose(&self) {
        let mut control = self.inner.control.lock();
        if control.disposed {
            return;
        }
        control.disposed = true;
        deactivate(&self.inner, &mut control);
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl Inner {
    fn key(&self) -> &str {
        self.key.as_deref().unwrap_or("-")
    }

    /// Mutate the published state and fan the result out to event listeners.
    fn update(&self, f: impl FnOnce(&mut SyncState)) {
        self.state_tx.send_modify(f);
        if let (Some(events), Some(key)) = (&self.events, &self.key) {
            let state = self.state_tx.borrow().clone();
            let _ = events.send(SyncEvent::Updated { key: key.clone(), state });
        }
    }

    /// Apply a fetch result, unless its scope has been deactivated since.
    fn settle(&self, scope: &CancellationToken, result: anyhow::Result<Value>) {
        let mut control = self.control.lock();
        if scope.is_cancelled() {
            tracing::debug!(key = %self.key(), "discarding fetch result from inactive scope");
            return;
        }
        control.in_flight = control.in_flight.saturating_sub(1);
        let loading = control.in_flight > 0;
        match result {
            Ok(payload) => self.update(|s| {
                s.succeed(payload);
                s.loading = loading;
            }),
            Err(e) => {
                tracing::debug!(key = %self.key(), err = %e, "fetch failed");
                let message = describe_failure(&e);
                self.update(|s| {
                    s.fail(message);
                    s.loading = loading;
                });
            }
        }
    }
}

/// Issue one fetch under the current scope. Returns `None` when the poller
/// is disabled or disposed.
fn issue(inner: &Arc<Inner>) -> Option<JoinHandle<()>> {
    let scope = {
        let mut control = inner.control.lock();
        begin_fetch(inner, &mut control)?
    };
    Some(spawn_fetch(inner, scope))
}

/// Issue one scheduled fetch, unless the timer that fired has been replaced
/// or released since.
fn issue_scheduled(inner: &Arc<Inner>, generation: u64) -> Option<JoinHandle<()>> {
    let scope = {
        let mut control = inner.control.lock();
        if control.timer_generation != generation {
            tracing::debug!(key = %inner.key(), "ignoring tick from a released timer");
            return None;
        }
        begin_fetch(inner, &mut control)?
    };
    Some(spawn_fetch(inner, scope))
}

/// Account for a new fetch and mark the state loading. Returns the scope the
/// fetch belongs to.
fn begin_fetch(inner: &Inner, control: &mut Control) -> Option<CancellationToken> {
    if control.disposed || !control.options.enabled {
        tracing::debug!(key = %inner.key(), "poller inactive, fetch not issued");
        return None;
    }
    control.in_flight += 1;
    if !inner.state_tx.borrow().loading {
        inner.update(|s| s.loading = true);
    }
    Some(control.scope.clone())
}

fn spawn_fetch(inner: &Arc<Inner>, scope: CancellationToken) -> JoinHandle<()> {
    let fetch = inner.fetcher.lock().fetch();
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        let result = fetch.await;
        inner.settle(&scope, result);
    })
}

/// Issue the activation fetch and start the repeating timer.
fn start_timer(inner: &Arc<Inner>, control: &mut Control) {
    if let Some(scope) = begin_fetch(inner, control) {
        spawn_fetch(inner, scope);
    }
    control.timer_generation += 1;
    let generation = control.timer_generation;
    let weak = Arc::downgrade(inner);
    let timer = TimerHandle::every(control.options.interval, &control.scope, move || {
        if let Some(inner) = weak.upgrade() {
            let _ = issue_scheduled(&inner, generation);
        }
    });
    control.timer = Some(timer);
}

fn deactivate(inner: &Inner, control: &mut Control) {
    if let Some(timer) = control.timer.take() {
        timer.release();
    }
    control.timer_generation += 1;
    control.scope.cancel();
    control.scope = CancellationToken::new();
    control.in_flight = 0;
    if inner.state_tx.borrow().loading {
        inner.update(|s| s.loading = false);
    }
}

#[cfg(test)]
#[path = "poller_tests.rs"]
mod tests;
