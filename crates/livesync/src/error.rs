// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes for local misuse of the synchronization layer.
///
/// Capability failures (network, status, malformed bodies) never surface
/// through these codes; they are recorded into a source's `error` slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    UnknownSource,
    DuplicateSource,
    InvalidConfig,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownSource => "UNKNOWN_SOURCE",
            Self::DuplicateSource => "DUPLICATE_SOURCE",
            Self::InvalidConfig => "INVALID_CONFIG",
        }
    }

    pub fn to_error(&self, message: impl Into<String>) -> SyncError {
        SyncError { code: *self, message: message.into() }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A descriptive local failure with a machine-readable code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncError {
    pub code: ErrorCode,
    pub message: String,
}

impl SyncError {
    pub fn unknown_source(key: &str) -> Self {
        ErrorCode::UnknownSource.to_error(format!("no source registered under key {key:?}"))
    }

    pub fn duplicate_source(key: &str) -> Self {
        ErrorCode::DuplicateSource.to_error(format!("source key {key:?} appears more than once"))
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for SyncError {}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
