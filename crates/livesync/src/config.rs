// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::HashSet;
use std::time::Duration;

use clap::Parser;

use crate::aggregator::{AggregatorOptions, SourceDescriptor};
use crate::fetch::HttpFetcher;

/// One polled HTTP source given on the command line as `key=url[@ms]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub key: String,
    pub url: String,
    pub interval_ms: Option<u64>,
}

impl std::str::FromStr for SourceSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, rest) = s
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("invalid source {s:?}: expected KEY=URL[@MS]"))?;
        let key = key.trim();
        if key.is_empty() {
            anyhow::bail!("invalid source {s:?}: empty key");
        }

        // Only a purely numeric suffix is a cadence; URLs may carry '@' in
        // their userinfo.
        let (url, interval_ms) = match rest.rsplit_once('@') {
            Some((url, ms)) if !ms.is_empty() && ms.bytes().all(|b| b.is_ascii_digit()) => {
                let ms: u64 = ms.parse()?;
                if ms == 0 {
                    anyhow::bail!("invalid source {s:?}: interval must be positive");
                }
                (url, Some(ms))
            }
            _ => (rest, None),
        };
        if url.is_empty() {
            anyhow::bail!("invalid source {s:?}: empty url");
        }
        Ok(Self { key: key.to_owned(), url: url.to_owned(), interval_ms })
    }
}

/// Keep remote data fresh and print every change as a JSON line.
#[derive(Debug, Clone, Parser)]
#[command(name = "livesync", version, about)]
pub struct WatchConfig {
    /// Polled source as `KEY=URL` or `KEY=URL@MS`. Repeatable.
    #[arg(long = "source", value_name = "KEY=URL[@MS]", env = "LIVESYNC_SOURCES", value_delimiter = ',')]
    pub sources: Vec<SourceSpec>,

    /// Default poll interval in milliseconds.
    #[arg(long, default_value_t = 30000, env = "LIVESYNC_INTERVAL_MS")]
    pub interval_ms: u64,

    /// Push connection target (ws://, wss://, or an http(s) base URL).
    #[arg(long, env = "LIVESYNC_CONNECT")]
    pub connect: Option<String>,

    /// Start with all network activity disabled.
    #[arg(long, env = "LIVESYNC_DISABLED")]
    pub disabled: bool,

    /// Refresh every source once, print a snapshot, and exit.
    #[arg(long)]
    pub once: bool,
}

impl WatchConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sources.is_empty() && self.connect.is_none() {
            anyhow::bail!("nothing to watch: pass --source or --connect");
        }
        if self.interval_ms == 0 {
            anyhow::bail!("--interval-ms must be positive");
        }
        if self.once && self.sources.is_empty() {
            anyhow::bail!("--once requires at least one --source");
        }
        if self.once && self.disabled {
            anyhow::bail!("--once cannot fetch anything with --disabled");
        }
        let mut seen = HashSet::new();
        for spec in &self.sources {
            if !seen.insert(spec.key.as_str()) {
                anyhow::bail!("duplicate source key {:?}", spec.key);
            }
        }
        Ok(())
    }

    pub fn default_interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn aggregator_options(&self) -> AggregatorOptions {
        AggregatorOptions { default_interval: self.default_interval(), enabled: !self.disabled }
    }

    /// Build one HTTP-backed descriptor per `--source`.
    pub fn descriptors(&self) -> Vec<SourceDescriptor> {
        self.sources
            .iter()
            .map(|spec| {
                let desc = SourceDescriptor::new(spec.key.clone(), HttpFetcher::new(spec.url.clone()));
                match spec.interval_ms {
                    Some(ms) => desc.every(Duration::from_millis(ms)),
                    None => desc,
                }
            })
            .collect()
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
