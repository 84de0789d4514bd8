//! HTTP batch sink.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use transit_types::{Batch, Record};

use crate::traits::{BatchSink, SinkError};

/// Longest response body excerpt kept in an error message.
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Clone)]
pub struct HttpSinkConfig {
    /// Full URL batches are POSTed to
    pub endpoint: String,
    /// Target table name sent with every request
    pub table: String,
    /// Optional bearer token
    pub token: Option<String>,
    pub request_timeout: Duration,
}

#[derive(Serialize)]
struct InsertRequest<'a> {
    table: &'a str,
    channel: usize,
    batch_id: String,
    rows: &'a [Record],
}

/// Delivers batches to an HTTP ingestion endpoint.
///
/// The endpoint is expected to answer 2xx once the rows are durable.
/// Timeouts, connection failures, 401, 408, 429 and 5xx are treated as
/// transient; every other status means the batch itself was refused.
pub struct HttpSink {
    client: Client,
    config: HttpSinkConfig,
}

impl HttpSink {
    pub fn new(config: HttpSinkConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {e}"))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &HttpSinkConfig {
        &self.config
    }
}

/// Map a non-success status to a sink error.
fn classify_status(status: StatusCode, body: &str) -> SinkError {
    let excerpt: String = body.chars().take(MAX_ERROR_BODY).collect();
    let reason = format!("HTTP {status}: {excerpt}");
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            SinkError::Retryable(reason)
        }
        s if s.is_server_error() => SinkError::Retryable(reason),
        _ => SinkError::Fatal(reason),
    }
}

fn classify_transport(err: reqwest::Error) -> SinkError {
    if err.is_builder() {
        SinkError::Fatal(format!("Invalid request: {err}"))
    } else {
        SinkError::Retryable(format!("Transport error: {err}"))
    }
}

#[async_trait]
impl BatchSink for HttpSink {
    async fn commit(&self, batch: &Batch) -> Result<(), SinkError> {
        let body = InsertRequest {
            table: &self.config.table,
            channel: batch.channel,
            batch_id: batch.id.to_string(),
            rows: &batch.records,
        };

        let mut request = self.client.post(&self.config.endpoint).json(&body);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();
        if status.is_success() {
            tracing::debug!(
                batch_id = %batch.id,
                rows = batch.len(),
                "HTTP sink accepted batch"
            );
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        Err(classify_status(status, &text))
    }

    fn name(&self) -> &str {
        "http"
    }
}
