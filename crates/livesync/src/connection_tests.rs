// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::{to_ws_url, ConnectOptions, ConnectionHandlers, Outbound, PushConnection};
use crate::state::ConnectionStatus;
use crate::test_support::ChannelConnector;

const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
enum Seen {
    Connect,
    Message(Value),
    Error(String),
    Disconnect,
}

fn recording_handlers() -> (ConnectionHandlers, mpsc::UnboundedReceiver<Seen>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (c, m, e, d) = (tx.clone(), tx.clone(), tx.clone(), tx);
    let handlers = ConnectionHandlers::new()
        .on_connect(move || {
            let _ = c.send(Seen::Connect);
        })
        .on_message(move |v| {
            let _ = m.send(Seen::Message(v));
        })
        .on_error(move |msg| {
            let _ = e.send(Seen::Error(msg.to_owned()));
        })
        .on_disconnect(move || {
            let _ = d.send(Seen::Disconnect);
        });
    (handlers, rx)
}

async fn next_seen(rx: &mut mpsc::UnboundedReceiver<Seen>) -> anyhow::Result<Seen> {
    tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .map_err(|_| anyhow::anyhow!("handler timeout"))?
        .ok_or_else(|| anyhow::anyhow!("handlers dropped"))
}

async fn wait_status(conn: &PushConnection, want: ConnectionStatus) -> anyhow::Result<()> {
    let mut rx = conn.subscribe();
    tokio::time::timeout(TIMEOUT, rx.wait_for(|s| *s == want))
        .await
        .map_err(|_| anyhow::anyhow!("timed out waiting for {want}"))??;
    Ok(())
}

// ── lifecycle ─────────────────────────────────────────────────────────

#[tokio::test]
async fn opens_then_reports_connected() -> anyhow::Result<()> {
    let connector = ChannelConnector::new();
    let (handlers, mut seen) = recording_handlers();
    let conn = PushConnection::new(connector.clone(), handlers, ConnectOptions::new("ws://feed"));

    assert_eq!(conn.status(), ConnectionStatus::Connecting);
    assert!(!conn.is_connected());

    let (target, _remote) = connector.accept(TIMEOUT).await?;
    assert_eq!(target, "ws://feed");
    assert_eq!(next_seen(&mut seen).await?, Seen::Connect);
    assert!(conn.is_connected());
    Ok(())
}

#[tokio::test]
async fn frames_dispatch_in_arrival_order_then_remote_close() -> anyhow::Result<()> {
    let connector = ChannelConnector::new();
    let (handlers, mut seen) = recording_handlers();
    let conn = PushConnection::new(connector.clone(), handlers, ConnectOptions::new("ws://feed"));
    let (_, remote) = connector.accept(TIMEOUT).await?;
    assert_eq!(next_seen(&mut seen).await?, Seen::Connect);

    for n in 1..=3 {
        remote.frame(&json!({"n": n}).to_string()).await?;
    }
    remote.close().await?;

    for n in 1..=3 {
        assert_eq!(next_seen(&mut seen).await?, Seen::Message(json!({"n": n})));
    }
    assert_eq!(next_seen(&mut seen).await?, Seen::Disconnect);
    assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    assert!(seen.try_recv().is_err(), "on_disconnect fires once");
    Ok(())
}

#[tokio::test]
async fn malformed_frame_is_dropped_without_state_change() -> anyhow::Result<()> {
    let connector = ChannelConnector::new();
    let (handlers, mut seen) = recording_handlers();
    let conn = PushConnection::new(connector.clone(), handlers, ConnectOptions::new("ws://feed"));
    let (_, remote) = connector.accept(TIMEOUT).await?;
    assert_eq!(next_seen(&mut seen).await?, Seen::Connect);

    remote.frame("{not json").await?;
    remote.frame(r#"{"ok":true}"#).await?;

    assert_eq!(next_seen(&mut seen).await?, Seen::Message(json!({"ok": true})));
    assert!(conn.is_connected());
    Ok(())
}

#[tokio::test]
async fn transport_error_does_not_close() -> anyhow::Result<()> {
    let connector = ChannelConnector::new();
    let (handlers, mut seen) = recording_handlers();
    let conn = PushConnection::new(connector.clone(), handlers, ConnectOptions::new("ws://feed"));
    let (_, remote) = connector.accept(TIMEOUT).await?;
    assert_eq!(next_seen(&mut seen).await?, Seen::Connect);

    remote.error("read timed out").await?;
    remote.frame("1").await?;

    assert_eq!(next_seen(&mut seen).await?, Seen::Error("read timed out".to_owned()));
    assert_eq!(next_seen(&mut seen).await?, Seen::Message(json!(1)));
    assert!(conn.is_connected());
    Ok(())
}

#[tokio::test]
async fn refused_connect_reports_error_then_disconnect() -> anyhow::Result<()> {
    let connector = ChannelConnector::new();
    connector.refuse_with("connection refused");
    let (handlers, mut seen) = recording_handlers();
    let conn = PushConnection::new(connector.clone(), handlers, ConnectOptions::new("ws://down"));

    assert_eq!(next_seen(&mut seen).await?, Seen::Error("connection refused".to_owned()));
    assert_eq!(next_seen(&mut seen).await?, Seen::Disconnect);
    assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    assert_eq!(connector.attempts(), 1, "no automatic reconnect");
    Ok(())
}

// ── send ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn send_while_disconnected_is_a_noop() {
    let connector = ChannelConnector::new();
    let (handlers, _seen) = recording_handlers();
    let options = ConnectOptions { target: "ws://feed".to_owned(), enabled: false };
    let conn = PushConnection::new(connector.clone(), handlers, options);

    assert!(!conn.send(&json!({"hello": "world"})));
    assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    assert_eq!(connector.attempts(), 0);
}

#[tokio::test]
async fn send_while_connecting_is_a_noop() {
    let connector = ChannelConnector::new();
    connector.hang();
    let (handlers, _seen) = recording_handlers();
    let conn = PushConnection::new(connector, handlers, ConnectOptions::new("ws://slow"));

    assert!(!conn.send(&json!("early")));
    assert_eq!(conn.status(), ConnectionStatus::Connecting);
}

#[tokio::test]
async fn send_while_connected_serializes_payload() -> anyhow::Result<()> {
    let connector = ChannelConnector::new();
    let (handlers, mut seen) = recording_handlers();
    let conn = PushConnection::new(connector.clone(), handlers, ConnectOptions::new("ws://feed"));
    let (_, mut remote) = connector.accept(TIMEOUT).await?;
    assert_eq!(next_seen(&mut seen).await?, Seen::Connect);

    assert!(conn.send(&json!({"op": "subscribe", "topic": "prices"})));
    match remote.next_outbound(TIMEOUT).await? {
        Outbound::Frame(text) => {
            let parsed: Value = serde_json::from_str(&text)?;
            assert_eq!(parsed, json!({"op": "subscribe", "topic": "prices"}));
        }
        other => anyhow::bail!("expected frame, got {other:?}"),
    }
    Ok(())
}

// ── teardown ──────────────────────────────────────────────────────────

#[tokio::test]
async fn close_is_synchronous_and_idempotent() -> anyhow::Result<()> {
    let connector = ChannelConnector::new();
    let (handlers, mut seen) = recording_handlers();
    let conn = PushConnection::new(connector.clone(), handlers, ConnectOptions::new("ws://feed"));
    let (_, mut remote) = connector.accept(TIMEOUT).await?;
    assert_eq!(next_seen(&mut seen).await?, Seen::Connect);

    conn.close();
    assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    assert_eq!(seen.try_recv().ok(), Some(Seen::Disconnect));
    assert_eq!(remote.next_outbound(TIMEOUT).await?, Outbound::Close);

    conn.close();
    assert!(seen.try_recv().is_err());
    assert!(!conn.send(&json!("late")));

    // Frames racing the close are not delivered.
    let _ = remote.frame("1").await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(seen.try_recv().is_err());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_during_on_connect_keeps_callback_order() -> anyhow::Result<()> {
    let connector = ChannelConnector::new();
    let (tx, mut seen) = mpsc::unbounded_channel();
    let (started_tx, mut started) = mpsc::unbounded_channel();
    let (c, d) = (tx.clone(), tx);
    let handlers = ConnectionHandlers::new()
        .on_connect(move || {
            let _ = started_tx.send(());
            std::thread::sleep(Duration::from_millis(100));
            let _ = c.send(Seen::Connect);
        })
        .on_disconnect(move || {
            let _ = d.send(Seen::Disconnect);
        });
    let conn = PushConnection::new(connector.clone(), handlers, ConnectOptions::new("ws://feed"));
    let (_, _remote) = connector.accept(TIMEOUT).await?;
    tokio::time::timeout(TIMEOUT, started.recv()).await?;

    conn.close();
    assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    assert_eq!(next_seen(&mut seen).await?, Seen::Connect);
    assert_eq!(next_seen(&mut seen).await?, Seen::Disconnect);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(seen.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn activate_only_from_disconnected() -> anyhow::Result<()> {
    let connector = ChannelConnector::new();
    let (handlers, mut seen) = recording_handlers();
    let conn = PushConnection::new(connector.clone(), handlers, ConnectOptions::new("ws://feed"));
    assert!(!conn.activate(), "already connecting");

    let _first = connector.accept(TIMEOUT).await?;
    assert_eq!(next_seen(&mut seen).await?, Seen::Connect);
    assert!(!conn.activate(), "already connected");

    conn.close();
    assert_eq!(next_seen(&mut seen).await?, Seen::Disconnect);
    assert!(conn.activate());
    let _second = connector.accept(TIMEOUT).await?;
    assert_eq!(next_seen(&mut seen).await?, Seen::Connect);
    assert_eq!(connector.attempts(), 2);
    Ok(())
}

#[tokio::test]
async fn set_target_retires_old_session() -> anyhow::Result<()> {
    let connector = ChannelConnector::new();
    let (handlers, mut seen) = recording_handlers();
    let conn = PushConnection::new(connector.clone(), handlers, ConnectOptions::new("ws://one"));
    let (_, mut old_remote) = connector.accept(TIMEOUT).await?;
    assert_eq!(next_seen(&mut seen).await?, Seen::Connect);

    conn.set_target("ws://two");
    assert_eq!(next_seen(&mut seen).await?, Seen::Disconnect);
    assert_eq!(old_remote.next_outbound(TIMEOUT).await?, Outbound::Close);

    let (target, new_remote) = connector.accept(TIMEOUT).await?;
    assert_eq!(target, "ws://two");
    assert_eq!(next_seen(&mut seen).await?, Seen::Connect);
    assert_eq!(conn.target(), "ws://two");

    // Events from the retired transport are ignored.
    let _ = old_remote.events.send(super::TransportEvent::Frame("\"stale\"".to_owned())).await;
    new_remote.frame("\"fresh\"").await?;
    assert_eq!(next_seen(&mut seen).await?, Seen::Message(json!("fresh")));
    Ok(())
}

#[tokio::test]
async fn disabling_while_connecting_disconnects() -> anyhow::Result<()> {
    let connector = ChannelConnector::new();
    connector.hang();
    let (handlers, mut seen) = recording_handlers();
    let conn = PushConnection::new(connector, handlers, ConnectOptions::new("ws://slow"));
    assert_eq!(conn.status(), ConnectionStatus::Connecting);

    conn.set_enabled(false);
    assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    assert_eq!(next_seen(&mut seen).await?, Seen::Disconnect);
    assert!(!conn.activate(), "disabled managers do not activate");
    Ok(())
}

#[tokio::test]
async fn drop_closes_connection() -> anyhow::Result<()> {
    let connector = ChannelConnector::new();
    let (handlers, mut seen) = recording_handlers();
    let conn = PushConnection::new(connector.clone(), handlers, ConnectOptions::new("ws://feed"));
    let (_, mut remote) = connector.accept(TIMEOUT).await?;
    assert_eq!(next_seen(&mut seen).await?, Seen::Connect);

    drop(conn);
    assert_eq!(next_seen(&mut seen).await?, Seen::Disconnect);
    assert_eq!(remote.next_outbound(TIMEOUT).await?, Outbound::Close);
    Ok(())
}

#[tokio::test]
async fn never_connected_outside_open_window() -> anyhow::Result<()> {
    let connector = ChannelConnector::new();
    let (handlers, _seen) = recording_handlers();
    let conn = PushConnection::new(connector.clone(), handlers, ConnectOptions::new("ws://feed"));
    let mut statuses = conn.subscribe();
    assert_eq!(*statuses.borrow_and_update(), ConnectionStatus::Connecting);

    let (_, remote) = connector.accept(TIMEOUT).await?;
    wait_status(&conn, ConnectionStatus::Connected).await?;
    remote.close().await?;
    wait_status(&conn, ConnectionStatus::Disconnected).await?;

    assert!(!conn.is_connected());
    assert!(!conn.send(&json!("after close")));
    assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    Ok(())
}

// ── to_ws_url ─────────────────────────────────────────────────────────

#[yare::parameterized(
    http_to_ws   = { "http://localhost:3000/feed", "ws://localhost:3000/feed" },
    https_to_wss = { "https://example.com/live", "wss://example.com/live" },
    ws_unchanged = { "ws://127.0.0.1:9/x", "ws://127.0.0.1:9/x" },
    wss_unchanged = { "wss://example.com", "wss://example.com" },
)]
fn ws_url_rewrites_http_schemes(input: &str, expected: &str) {
    assert_eq!(to_ws_url(input), expected);
}
