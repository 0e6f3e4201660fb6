// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fetch capability: the one-shot "get me the latest payload" operation a
//! poller drives, plus an HTTP implementation.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::Client;
use serde_json::Value;

/// Boxed future returned by [`Fetcher::fetch`].
pub type FetchFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

/// An operation producing the latest payload of one data source.
///
/// Object-safe for use as `Arc<dyn Fetcher>`. Any
/// `Fn() -> impl Future<Output = anyhow::Result<Value>>` closure is a fetcher.
pub trait Fetcher: Send + Sync + 'static {
    fn fetch(&self) -> FetchFuture;
}

impl<F, Fut> Fetcher for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    fn fetch(&self) -> FetchFuture {
        Box::pin(self())
    }
}

/// Render a fetch failure for the `error` slot, including its cause chain.
pub fn describe_failure(err: &anyhow::Error) -> String {
    format!("{err:#}")
}

/// Default per-request timeout for [`HttpFetcher`].
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Fetcher that GETs a JSON document from one endpoint.
#[derive(Clone)]
pub struct HttpFetcher {
    url: String,
    client: Client,
}

impl HttpFetcher {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_timeout(url, DEFAULT_HTTP_TIMEOUT)
    }

    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Self {
        install_crypto_provider();
        let client = Client::builder().timeout(timeout).build().unwrap_or_default();
        Self { url: url.into(), client }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self) -> FetchFuture {
        let client = self.client.clone();
        let url = self.url.clone();
        Box::pin(async move { get_json(&client, &url).await })
    }
}

/// GET `url` and decode the body as JSON.
///
/// Non-success statuses fail with `HTTP <code> <reason>`. An empty body
/// decodes as `null`.
pub async fn get_json(client: &Client, url: &str) -> anyhow::Result<Value> {
    let resp = client.get(url).send().await?;
    let status = resp.status();
    if !status.is_success() {
        anyhow::bail!("HTTP {} {}", status.as_u16(), status.canonical_reason().unwrap_or("Unknown"));
    }
    let bytes = resp.bytes().await?;
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&bytes).map_err(|e| anyhow::anyhow!("malformed body from {url}: {e}"))
}

/// Install the process-wide rustls provider used by reqwest. Later calls are
/// no-ops.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}
