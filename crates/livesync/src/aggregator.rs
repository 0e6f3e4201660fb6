// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Multi-source aggregator: one [`Poller`] per keyed source, merged into
//! keyed payload / loading / error views.
//!
//! The descriptor set can be replaced at any time. Each replacement is
//! diffed against the running set: removed keys are disposed and their
//! entries deleted, keys whose cadence changed get a fresh timer, and new
//! keys get a new poller. A key's entry is written only by its own poller.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::{ErrorCode, SyncError};
use crate::fetch::Fetcher;
use crate::poller::{PollOptions, Poller, DEFAULT_INTERVAL};
use crate::state::{SyncEvent, SyncState};

/// Caller-supplied description of one data source.
#[derive(Clone)]
pub struct SourceDescriptor {
    pub key: String,
    pub fetcher: Arc<dyn Fetcher>,
    /// Cadence for this source. Falls back to the aggregator default.
    pub interval: Option<Duration>,
}

impl SourceDescriptor {
    pub fn new(key: impl Into<String>, fetcher: impl Fetcher) -> Self {
        Self { key: key.into(), fetcher: Arc::new(fetcher), interval: None }
    }

    pub fn every(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }
}

impl fmt::Debug for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceDescriptor")
            .field("key", &self.key)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

/// Options shared by every source of one [`Aggregator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorOptions {
    pub default_interval: Duration,
    pub enabled: bool,
}

impl Default for AggregatorOptions {
    fn default() -> Self {
        Self { default_interval: DEFAULT_INTERVAL, enabled: true }
    }
}

/// Supervises a keyed set of independently scheduled sources.
///
/// Must be created inside a Tokio runtime. Dropping the aggregator disposes
/// every source.
pub struct Aggregator {
    sources: Mutex<HashMap<String, Poller>>,
    options: Mutex<AggregatorOptions>,
    disposed: Mutex<bool>,
    events: broadcast::Sender<SyncEvent>,
}

impl Aggregator {
    pub fn new(
        sources: Vec<SourceDescriptor>,
        options: AggregatorOptions,
    ) -> Result<Self, SyncError> {
        let (events, _) = broadcast::channel(256);
        let aggregator = Self {
            sources: Mutex::new(HashMap::new()),
            options: Mutex::new(options),
            disposed: Mutex::new(false),
            events,
        };
        aggregator.set_sources(sources)?;
        Ok(aggregator)
    }

    /// Subscribe to per-source change events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Replace the descriptor set.
    ///
    /// A set with duplicate keys is rejected and the running set is left
    /// untouched.
    pub fn set_sources(&self, descriptors: Vec<SourceDescriptor>) -> Result<(), SyncError> {
        let mut seen = HashSet::new();
        for desc in &descriptors {
            if !seen.insert(desc.key.as_str()) {
                tracing::warn!(key = %desc.key, "rejecting descriptor set with duplicate key");
                return Err(SyncError::duplicate_source(&desc.key));
            }
        }

        if *self.disposed.lock() {
            return Err(ErrorCode::InvalidConfig.to_error("aggregator has been disposed"));
        }
        let options = *self.options.lock();
        let mut sources = self.sources.lock();

        let removed: Vec<String> =
            sources.keys().filter(|k| !seen.contains(k.as_str())).cloned().collect();
        for key in removed {
            if let Some(poller) = sources.remove(&key) {
                poller.dispose();
            }
            tracing::debug!(key = %key, "source removed");
            let _ = self.events.send(SyncEvent::Removed { key });
        }

        for desc in descriptors {
            let interval = desc.interval.unwrap_or(options.default_interval);
            match sources.get(&desc.key) {
                Some(poller) => {
                    poller.set_fetcher(desc.fetcher);
                    if poller.options().interval != interval {
                        tracing::debug!(key = %desc.key, ?interval, "source cadence changed");
                        poller.set_interval(interval);
                    }
                }
                None => {
                    tracing::debug!(key = %desc.key, ?interval, "source added");
                    let _ = self.events.send(SyncEvent::Added { key: desc.key.clone() });
                    let poll = PollOptions { interval, enabled: options.enabled };
                    let poller =
                        Poller::spawn_keyed(desc.key.clone(), desc.fetcher, poll, self.events.clone());
                    sources.insert(desc.key, poller);
                }
            }
        }
        Ok(())
    }

    /// Current source keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.sources.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn state(&self, key: &str) -> Option<SyncState> {
        self.sources.lock().get(key).map(Poller::state)
    }

    /// Full state for every source.
    pub fn snapshot(&self) -> HashMap<String, SyncState> {
        self.sources.lock().iter().map(|(k, p)| (k.clone(), p.state())).collect()
    }

    /// Latest payload per key, for keys that have fetched successfully.
    pub fn payloads(&self) -> HashMap<String, Value> {
        self.sources
            .lock()
            .iter()
            .filter_map(|(k, p)| p.state().payload.map(|v| (k.clone(), v)))
            .collect()
    }

    /// Loading flag per key.
    pub fn loading(&self) -> HashMap<String, bool> {
        self.sources.lock().iter().map(|(k, p)| (k.clone(), p.state().loading)).collect()
    }

    /// Latest failure per key, for keys whose last fetch failed.
    pub fn errors(&self) -> HashMap<String, String> {
        self.sources
            .lock()
            .iter()
            .filter_map(|(k, p)| p.state().error.map(|e| (k.clone(), e)))
            .collect()
    }

    /// Force a fetch of one source.
    ///
    /// The fetch is issued before this returns; the future settles with it.
    /// An unknown key resolves to [`ErrorCode::UnknownSource`].
    pub fn refresh(&self, key: &str) -> impl Future<Output = Result<(), SyncError>> + Send + 'static {
        let issued = self.sources.lock().get(key).map(Poller::refresh);
        if issued.is_none() {
            tracing::warn!(key = %key, "refresh requested for unknown source");
        }
        let key = key.to_owned();
        async move {
            match issued {
                Some(pending) => {
                    pending.await;
                    Ok(())
                }
                None => Err(SyncError::unknown_source(&key)),
            }
        }
    }

    /// Force a fetch of every source concurrently. Settles once all of them
    /// have, whatever their outcome.
    pub fn refresh_all(&self) -> impl Future<Output = ()> + Send + 'static {
        let pending: Vec<_> = self.sources.lock().values().map(Poller::refresh).collect();
        async move {
            futures_util::future::join_all(pending).await;
        }
    }

    /// Turn scheduling on or off for every source, present and future.
    pub fn set_enabled(&self, enabled: bool) {
        self.options.lock().enabled = enabled;
        for poller in self.sources.lock().values() {
            poller.set_enabled(enabled);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.options.lock().enabled && !*self.disposed.lock()
    }

    /// Dispose every source and drop all entries. Idempotent.
    pub fn dispose(&self) {
        {
            let mut disposed = self.disposed.lock();
            if *disposed {
                return;
            }
            *disposed = true;
        }
        let drained: Vec<Poller> = self.sources.lock().drain().map(|(_, p)| p).collect();
        for poller in &drained {
            poller.dispose();
        }
    }
}

impl Drop for Aggregator {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
#[path = "aggregator_tests.rs"]
mod tests;
