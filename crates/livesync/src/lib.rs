// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Livesync: keep client-side copies of remote data fresh.
//!
//! Three cooperating pieces: a [`Poller`] that re-fetches one source on a
//! fixed cadence, a [`PushConnection`] that owns one server-push session at
//! a time, and an [`Aggregator`] that runs a keyed set of pollers and merges
//! their state.

pub mod aggregator;
pub mod config;
pub mod connection;
pub mod error;
pub mod fetch;
pub mod poller;
pub mod state;
pub mod test_support;
pub mod timer;

use std::io::Write;

use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

pub use crate::aggregator::{Aggregator, AggregatorOptions, SourceDescriptor};
pub use crate::config::WatchConfig;
pub use crate::connection::{ConnectOptions, ConnectionHandlers, Connector, PushConnection, WsConnector};
pub use crate::error::{ErrorCode, SyncError};
pub use crate::fetch::{Fetcher, HttpFetcher};
pub use crate::poller::{PollOptions, Poller};
pub use crate::state::{ConnectionStatus, SyncEvent, SyncState};

/// Watch until Ctrl-C, printing JSON lines to stdout.
pub async fn run(config: WatchConfig) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted, shutting down");
            }
            shutdown.cancel();
        });
    }
    let mut stdout = std::io::stdout().lock();
    run_until(&config, &mut stdout, shutdown).await
}

/// Watch until `shutdown` fires, writing one JSON object per line to `out`.
///
/// With `--once`, the activation fetch of every source is awaited and the
/// keyed snapshot is written instead.
pub async fn run_until<W: Write>(
    config: &WatchConfig,
    out: &mut W,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    config.validate()?;

    let aggregator = Aggregator::new(config.descriptors(), config.aggregator_options())?;
    let mut events = aggregator.subscribe();
    if config.once {
        // Activation already issued one fetch per source.
        while aggregator.loading().values().any(|l| *l) {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => {
                    if let Err(broadcast::error::RecvError::Closed) = event {
                        break;
                    }
                }
            }
        }
        let snapshot: std::collections::BTreeMap<_, _> = aggregator.snapshot().into_iter().collect();
        writeln!(out, "{}", serde_json::to_string(&snapshot)?)?;
        aggregator.dispose();
        return Ok(());
    }

    let (msg_tx, mut messages) = mpsc::unbounded_channel::<Value>();
    let push = config.connect.as_ref().map(|target| {
        let error_target = target.clone();
        let handlers = ConnectionHandlers::new()
            .on_connect(|| tracing::info!("push connection open"))
            .on_message(move |payload| {
                let _ = msg_tx.send(payload);
            })
            .on_error(move |err| tracing::warn!(url = %error_target, err, "push connection error"))
            .on_disconnect(|| tracing::info!("push connection closed"));
        PushConnection::new(
            WsConnector,
            handlers,
            ConnectOptions { target: target.clone(), enabled: !config.disabled },
        )
    });

    tracing::info!(sources = aggregator.keys().len(), push = push.is_some(), "watching");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Ok(event) => writeln!(out, "{}", serde_json::to_string(&event)?)?,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!(skipped = n, "event output lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            Some(payload) = messages.recv() => {
                writeln!(out, "{}", json!({ "type": "message", "payload": payload }))?;
            }
        }
        out.flush()?;
    }

    if let Some(push) = push {
        push.dispose();
    }
    aggregator.dispose();
    Ok(())
}
