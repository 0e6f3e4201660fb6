// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Observable state shapes shared by the poller, connection manager, and
//! aggregator.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Freshness triple for one data source.
///
/// A failed fetch only touches `error`; the last good `payload` stays
/// visible until a later fetch succeeds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub payload: Option<Value>,
    pub loading: bool,
    pub error: Option<String>,
    /// Epoch millis of the last settled fetch, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<u64>,
}

impl SyncState {
    pub(crate) fn succeed(&mut self, payload: Value) {
        self.payload = Some(payload);
        self.error = None;
        self.updated_at = Some(epoch_ms());
    }

    pub(crate) fn fail(&mut self, message: String) {
        self.error = Some(message);
        self.updated_at = Some(epoch_ms());
    }
}

/// Lifecycle of one push connection session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Change notifications emitted by the aggregator, keyed by source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A source's state changed (fetch issued or settled).
    Updated { key: String, state: SyncState },
    /// A source joined the descriptor set.
    Added { key: String },
    /// A source left the descriptor set; its entries are gone.
    Removed { key: String },
}

impl SyncEvent {
    /// Return the source key for this event.
    pub fn key(&self) -> &str {
        match self {
            Self::Updated { key, .. } | Self::Added { key } | Self::Removed { key } => key,
        }
    }
}

/// Return current epoch millis.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
