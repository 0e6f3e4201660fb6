// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test infrastructure: scripted fetchers, an in-memory connector,
//! and assertion helpers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::connection::{ConnectFuture, Connection, Connector, Outbound, TransportEvent};
use crate::fetch::{FetchFuture, Fetcher};

/// One scripted fetch outcome.
#[derive(Debug, Clone)]
struct Step {
    delay: Option<Duration>,
    result: Result<Value, String>,
}

/// A fetcher that plays back a script of results and counts its calls.
///
/// Once the script is exhausted the last step repeats. An empty script
/// yields `null`.
#[derive(Clone, Default)]
pub struct ScriptedFetcher {
    steps: Arc<Mutex<VecDeque<Step>>>,
    last: Arc<Mutex<Option<Step>>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fetcher that always succeeds with `value`.
    pub fn always(value: Value) -> Self {
        Self::new().then_ok(value)
    }

    /// A fetcher that always fails with `message`.
    pub fn failing(message: &str) -> Self {
        Self::new().then_err(message)
    }

    pub fn then_ok(self, value: Value) -> Self {
        self.push(None, Ok(value))
    }

    pub fn then_err(self, message: &str) -> Self {
        self.push(None, Err(message.to_owned()))
    }

    /// Succeed with `value` after `delay`.
    pub fn then_ok_after(self, delay: Duration, value: Value) -> Self {
        self.push(Some(delay), Ok(value))
    }

    /// Fail with `message` after `delay`.
    pub fn then_err_after(self, delay: Duration, message: &str) -> Self {
        self.push(Some(delay), Err(message.to_owned()))
    }

    fn push(self, delay: Option<Duration>, result: Result<Value, String>) -> Self {
        self.steps.lock().push_back(Step { delay, result });
        self
    }

    /// Number of times `fetch` has been called.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Step {
        let mut last = self.last.lock();
        match self.steps.lock().pop_front() {
            Some(step) => {
                *last = Some(step.clone());
                step
            }
            None => last.clone().unwrap_or(Step { delay: None, result: Ok(Value::Null) }),
        }
    }
}

impl Fetcher for ScriptedFetcher {
    fn fetch(&self) -> FetchFuture {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.next_step();
        Box::pin(async move {
            if let Some(delay) = step.delay {
                tokio::time::sleep(delay).await;
            }
            step.result.map_err(|msg| anyhow::anyhow!(msg))
        })
    }
}

/// The far side of an in-memory connection handed out by
/// [`ChannelConnector`].
pub struct RemoteEnd {
    /// Events delivered to the connection manager.
    pub events: mpsc::Sender<TransportEvent>,
    /// Frames and close requests sent by the connection manager.
    pub outbound: mpsc::Receiver<Outbound>,
}

impl RemoteEnd {
    pub async fn frame(&self, text: &str) -> anyhow::Result<()> {
        self.events.send(TransportEvent::Frame(text.to_owned())).await?;
        Ok(())
    }

    pub async fn error(&self, message: &str) -> anyhow::Result<()> {
        self.events.send(TransportEvent::Error(message.to_owned())).await?;
        Ok(())
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        self.events.send(TransportEvent::Closed).await?;
        Ok(())
    }

    /// Next outbound item, waiting at most `timeout`.
    pub async fn next_outbound(&mut self, timeout: Duration) -> anyhow::Result<Outbound> {
        tokio::time::timeout(timeout, self.outbound.recv())
            .await
            .map_err(|_| anyhow::anyhow!("outbound recv timeout"))?
            .ok_or_else(|| anyhow::anyhow!("outbound channel closed"))
    }
}

/// In-memory connector. Each successful connect hands the far end to the
/// test through [`ChannelConnector::accept`].
#[derive(Clone)]
pub struct ChannelConnector {
    accepted_tx: mpsc::UnboundedSender<(String, RemoteEnd)>,
    accepted_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<(String, RemoteEnd)>>>,
    refuse: Arc<Mutex<Option<String>>>,
    hold_open: Arc<Mutex<bool>>,
    attempts: Arc<AtomicUsize>,
}

impl Default for ChannelConnector {
    fn default() -> Self {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        Self {
            accepted_tx,
            accepted_rx: Arc::new(tokio::sync::Mutex::new(accepted_rx)),
            refuse: Arc::new(Mutex::new(None)),
            hold_open: Arc::new(Mutex::new(false)),
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl ChannelConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent connects fail with `message`.
    pub fn refuse_with(&self, message: &str) {
        *self.refuse.lock() = Some(message.to_owned());
    }

    /// Make subsequent connects hang until cancelled.
    pub fn hang(&self) {
        *self.hold_open.lock() = true;
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Wait for the next accepted connection, returning its target and far end.
    pub async fn accept(&self, timeout: Duration) -> anyhow::Result<(String, RemoteEnd)> {
        let mut rx = self.accepted_rx.lock().await;
        tokio::time::timeout(timeout, rx.recv())
            .await
            .map_err(|_| anyhow::anyhow!("accept timeout"))?
            .ok_or_else(|| anyhow::anyhow!("connector dropped"))
    }
}

impl Connector for ChannelConnector {
    fn connect(&self, target: &str) -> ConnectFuture {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refuse = self.refuse.lock().clone();
        let hang = *self.hold_open.lock();
        let accepted_tx = self.accepted_tx.clone();
        let target = target.to_owned();
        Box::pin(async move {
            if hang {
                return std::future::pending().await;
            }
            if let Some(message) = refuse {
                anyhow::bail!("{message}");
            }
            let (event_tx, event_rx) = mpsc::channel(64);
            let (out_tx, out_rx) = mpsc::channel(64);
            let remote = RemoteEnd { events: event_tx, outbound: out_rx };
            accepted_tx
                .send((target, remote))
                .map_err(|_| anyhow::anyhow!("test dropped the connector"))?;
            Ok(Connection { outbound: out_tx, inbound: event_rx })
        })
    }
}

/// Assert that a `Result` is `Err` and its message contains a substring.
#[macro_export]
macro_rules! assert_err_contains {
    ($expr:expr, $substr:expr) => {{
        let result = $expr;
        let err = result.expect_err(concat!("expected Err for: ", stringify!($expr)));
        let msg = err.to_string();
        assert!(msg.contains($substr), "expected error containing {:?}, got: {msg:?}", $substr);
    }};
}
