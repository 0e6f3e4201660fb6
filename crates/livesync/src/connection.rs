// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Push connection manager: owns one persistent bidirectional connection at
//! a time and drives the Disconnected → Connecting → Connected → Disconnected
//! lifecycle, dispatching parsed inbound frames to caller handlers.
//!
//! There is no reconnect policy. A caller that wants one can
//! call [`PushConnection::activate`] from its `on_disconnect` handler.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::fetch::describe_failure;
use crate::state::ConnectionStatus;

/// Lifecycle signal emitted by an open connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One inbound frame, unparsed.
    Frame(String),
    /// A transport-level error. Does not close the connection by itself.
    Error(String),
    /// The connection is gone.
    Closed,
}

/// Item sent from the manager to an open connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(String),
    Close,
}

/// Channel pair for one open connection.
///
/// Dropping the `outbound` sender is equivalent to requesting close.
pub struct Connection {
    pub outbound: mpsc::Sender<Outbound>,
    pub inbound: mpsc::Receiver<TransportEvent>,
}

/// Boxed future returned by [`Connector::connect`].
pub type ConnectFuture = Pin<Box<dyn Future<Output = anyhow::Result<Connection>> + Send>>;

/// Opens bidirectional message channels to a target address.
///
/// Object-safe for use as `Arc<dyn Connector>`.
pub trait Connector: Send + Sync + 'static {
    /// Resolves once the connection is open.
    fn connect(&self, target: &str) -> ConnectFuture;
}

type Callback = Box<dyn Fn() + Send + Sync>;
type MessageCallback = Box<dyn Fn(Value) + Send + Sync>;
type ErrorCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Lifecycle callbacks for one [`PushConnection`].
///
/// Every callback runs synchronously on the session task, outside any
/// internal lock, so it may call back into the manager.
#[derive(Default)]
pub struct ConnectionHandlers {
    on_connect: Option<Callback>,
    on_message: Option<MessageCallback>,
    on_error: Option<ErrorCallback>,
    on_disconnect: Option<Callback>,
}

impl ConnectionHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Box::new(f));
        self
    }

    pub fn on_message(mut self, f: impl Fn(Value) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_disconnect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Box::new(f));
        self
    }
}

/// Options for a [`PushConnection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub target: String,
    /// When false no connection is opened until enabled.
    pub enabled: bool,
}

impl ConnectOptions {
    pub fn new(target: impl Into<String>) -> Self {
        Self { target: target.into(), enabled: true }
    }
}

/// Manager for one logical push session at a time.
///
/// Must be created inside a Tokio runtime. Dropping the manager closes any
/// open connection.
pub struct PushConnection {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    handlers: ConnectionHandlers,
    status_tx: watch::Sender<ConnectionStatus>,
    control: Mutex<Control>,
}

struct Control {
    target: String,
    enabled: bool,
    disposed: bool,
    next_id: u64,
    session: Option<Arc<Session>>,
}

struct Session {
    id: u64,
    target: String,
    cancel: CancellationToken,
    /// Present only while the session is connected.
    outbound: Mutex<Option<mpsc::Sender<Outbound>>>,
    phase: Mutex<Phase>,
}

/// Callback progress of one session. Keeps `on_connect` strictly before
/// `on_disconnect`, each at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Opening,
    /// `on_connect` is running.
    Announcing,
    /// Finished while `on_connect` was running; `on_disconnect` is owed.
    FinishDeferred,
    Open,
    Finished,
}

impl PushConnection {
    /// Create a manager and, if enabled, open the first session.
    pub fn new(
        connector: impl Connector,
        handlers: ConnectionHandlers,
        options: ConnectOptions,
    ) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        let inner = Arc::new(Inner {
            connector: Arc::new(connector),
            handlers,
            status_tx,
            control: Mutex::new(Control {
                target: options.target,
                enabled: options.enabled,
                disposed: false,
                next_id: 0,
                session: None,
            }),
        });
        if options.enabled {
            let mut control = inner.control.lock();
            start_session(&inner, &mut control);
        }
        Self { inner }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Watch the connection status for changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn target(&self) -> String {
        self.inner.control.lock().target.clone()
    }

    /// Open a new session. Only valid from `Disconnected`; otherwise a no-op
    /// that returns false.
    pub fn activate(&self) -> bool {
        let mut control = self.inner.control.lock();
        if control.disposed || !control.enabled {
            tracing::debug!(url = %control.target, "connection disabled, not activating");
            return false;
        }
        if control.session.is_some() {
            tracing::debug!(url = %control.target, "session already active");
            return false;
        }
        start_session(&self.inner, &mut control);
        true
    }

    /// Serialize and transmit `payload` on the open connection.
    ///
    /// Returns false without side effects when not connected. Nothing is
    /// queued for later delivery.
    pub fn send<T: Serialize + ?Sized>(&self, payload: &T) -> bool {
        let text = match serde_json::to_string(payload) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(err = %e, "outbound payload not serializable, dropping");
                return false;
            }
        };

        let outbound = {
            let control = self.inner.control.lock();
            control.session.as_ref().and_then(|s| s.outbound.lock().clone())
        };
        let Some(outbound) = outbound else {
            tracing::warn!(status = %self.status(), "send while not connected, dropping");
            return false;
        };
        match outbound.try_send(Outbound::Frame(text)) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(err = %e, "outbound channel unavailable, dropping");
                false
            }
        }
    }

    /// Tear down the current session. Idempotent when already disconnected.
    ///
    /// The status is `Disconnected` by the time this returns, and so is
    /// `on_disconnect` unless the session's `on_connect` is still running;
    /// then it runs as soon as `on_connect` returns.
    pub fn close(&self) {
        let session = self.inner.control.lock().session.clone();
        if let Some(session) = session {
            self.inner.retire(&session);
        }
    }

    /// Retire the current session and, when enabled, start a fresh one
    /// against `target`.
    pub fn set_target(&self, target: impl Into<String>) {
        let target = target.into();
        let old = {
            let mut control = self.inner.control.lock();
            if control.target == target {
                return;
            }
            control.target = target;
            control.session.clone()
        };
        if let Some(session) = old {
            self.inner.retire(&session);
        }
        self.activate();
    }

    /// Disabling closes the connection; enabling opens a fresh session.
    pub fn set_enabled(&self, enabled: bool) {
        {
            let mut control = self.inner.control.lock();
            if control.disposed || control.enabled == enabled {
                return;
            }
            control.enabled = enabled;
        }
        if enabled {
            self.activate();
        } else {
            self.close();
        }
    }

    /// Close the connection permanently. Idempotent.
    pub fn dispose(&self) {
        {
            let mut control = self.inner.control.lock();
            if control.disposed {
                return;
            }
            control.disposed = true;
        }
        self.close();
    }
}

impl Drop for PushConnection {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl Inner {
    fn is_current(&self, session: &Session) -> bool {
        !session.cancel.is_cancelled()
            && self.control.lock().session.as_ref().is_some_and(|s| s.id == session.id)
    }

    /// Connecting → Connected. Returns false if the session was retired
    /// while the connection was opening or during `on_connect`.
    fn opened(&self, session: &Session, outbound: mpsc::Sender<Outbound>) -> bool {
        {
            let control = self.control.lock();
            let current = control.session.as_ref().is_some_and(|s| s.id == session.id);
            let mut phase = session.phase.lock();
            if !current || session.cancel.is_cancelled() || *phase != Phase::Opening {
                return false;
            }
            *phase = Phase::Announcing;
            *session.outbound.lock() = Some(outbound);
            self.status_tx.send_replace(ConnectionStatus::Connected);
        }
        tracing::debug!(url = %session.target, "connected");
        if let Some(ref f) = self.handlers.on_connect {
            f();
        }

        let deferred = {
            let mut phase = session.phase.lock();
            if *phase == Phase::FinishDeferred {
                *phase = Phase::Finished;
                true
            } else {
                *phase = Phase::Open;
                false
            }
        };
        if deferred {
            self.disconnected(session);
            return false;
        }
        true
    }

    /// Parse one inbound frame and hand it to `on_message`. Malformed frames
    /// are logged and dropped.
    fn dispatch(&self, session: &Session, text: &str) {
        if !self.is_current(session) {
            return;
        }
        match serde_json::from_str::<Value>(text) {
            Ok(value) => {
                if let Some(ref f) = self.handlers.on_message {
                    f(value);
                }
            }
            Err(e) => {
                tracing::warn!(url = %session.target, err = %e, "dropping malformed frame");
            }
        }
    }

    fn report_error(&self, session: &Session, message: &str) {
        if !self.is_current(session) {
            return;
        }
        tracing::debug!(url = %session.target, err = %message, "connection error");
        if let Some(ref f) = self.handlers.on_error {
            f(message);
        }
    }

    /// Cancel a session and ask its transport to close.
    fn retire(&self, session: &Session) {
        session.cancel.cancel();
        if let Some(tx) = session.outbound.lock().as_ref() {
            let _ = tx.try_send(Outbound::Close);
        }
        self.finish(session);
    }

    /// Any state → Disconnected. Runs `on_disconnect` at most once per
    /// session, and never before that session's `on_connect` has returned.
    fn finish(&self, session: &Session) {
        let owed = {
            let mut phase = session.phase.lock();
            match *phase {
                Phase::Finished | Phase::FinishDeferred => return,
                Phase::Announcing => {
                    *phase = Phase::FinishDeferred;
                    false
                }
                Phase::Opening | Phase::Open => {
                    *phase = Phase::Finished;
                    true
                }
            }
        };
        {
            let mut control = self.control.lock();
            session.outbound.lock().take();
            if control.session.as_ref().is_some_and(|s| s.id == session.id) {
                control.session = None;
                self.status_tx.send_replace(ConnectionStatus::Disconnected);
            }
        }
        if owed {
            self.disconnected(session);
        }
    }

    fn disconnected(&self, session: &Session) {
        tracing::debug!(url = %session.target, "disconnected");
        if let Some(ref f) = self.handlers.on_disconnect {
            f();
        }
    }
}

fn start_session(inner: &Arc<Inner>, control: &mut Control) {
    control.next_id += 1;
    let session = Arc::new(Session {
        id: control.next_id,
        target: control.target.clone(),
        cancel: CancellationToken::new(),
        outbound: Mutex::new(None),
        phase: Mutex::new(Phase::Opening),
    });
    control.session = Some(Arc::clone(&session));
    inner.status_tx.send_replace(ConnectionStatus::Connecting);
    tracing::debug!(url = %session.target, "connecting");

    tokio::spawn(run_session(Arc::clone(inner), session));
}

/// Drive one session from Connecting until the transport closes or the
/// session is retired.
async fn run_session(inner: Arc<Inner>, session: Arc<Session>) {
    let connect = inner.connector.connect(&session.target);
    let result = tokio::select! {
        biased;
        _ = session.cancel.cancelled() => return,
        result = connect => result,
    };

    let mut conn = match result {
        Ok(conn) => conn,
        Err(e) => {
            inner.report_error(&session, &describe_failure(&e));
            inner.finish(&session);
            return;
        }
    };

    if !inner.opened(&session, conn.outbound.clone()) {
        let _ = conn.outbound.try_send(Outbound::Close);
        return;
    }

    loop {
        tokio::select! {
            biased;
            _ = session.cancel.cancelled() => break,
            event = conn.inbound.recv() => match event {
                Some(TransportEvent::Frame(text)) => inner.dispatch(&session, &text),
                Some(TransportEvent::Error(message)) => inner.report_error(&session, &message),
                Some(TransportEvent::Closed) | None => break,
            }
        }
    }

    inner.finish(&session);
}

// -- WebSocket transport ------------------------------------------------------

/// [`Connector`] over WebSocket text frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, target: &str) -> ConnectFuture {
        let url = to_ws_url(target);
        Box::pin(async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(&url).await?;
            let (mut write, mut read) = ws_stream.split();
            let (event_tx, event_rx) = mpsc::channel(256);
            let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(256);

            {
                let url = url.clone();
                tokio::spawn(async move {
                    loop {
                        let event = match read.next().await {
                            Some(Ok(Message::Text(text))) => TransportEvent::Frame(text.to_string()),
                            Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                                Ok(text) => TransportEvent::Frame(text.to_owned()),
                                Err(e) => {
                                    tracing::warn!(url = %url, err = %e, "dropping non-UTF-8 binary frame");
                                    continue;
                                }
                            },
                            Some(Ok(Message::Close(_))) | None => {
                                let _ = event_tx.send(TransportEvent::Closed).await;
                                break;
                            }
                            Some(Ok(_)) => continue, // ping/pong
                            Some(Err(e)) => {
                                tracing::debug!(url = %url, err = %e, "ws read error");
                                let _ = event_tx.send(TransportEvent::Error(e.to_string())).await;
                                let _ = event_tx.send(TransportEvent::Closed).await;
                                break;
                            }
                        };
                        if event_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                });
            }

            tokio::spawn(async move {
                while let Some(item) = out_rx.recv().await {
                    match item {
                        Outbound::Frame(text) => {
                            if let Err(e) = write.send(Message::Text(text.into())).await {
                                tracing::debug!(url = %url, err = %e, "ws write error");
                                break;
                            }
                        }
                        Outbound::Close => break,
                    }
                }
                let _ = write.close().await;
            });

            Ok(Connection { outbound: out_tx, inbound: event_rx })
        })
    }
}

/// Rewrite an HTTP base URL to its WebSocket equivalent. Other schemes pass
/// through unchanged.
pub fn to_ws_url(target: &str) -> String {
    if let Some(rest) = target.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = target.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        target.to_owned()
    }
}

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;
