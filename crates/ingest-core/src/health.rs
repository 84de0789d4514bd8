//! Health snapshot and HTTP health endpoint.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::ledger::{OffsetLedger, PartitionSnapshot};
use crate::metrics::{process_memory_mb, ChannelSnapshot, IngestMetrics, QualitySnapshot, Totals};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Stopping,
}

/// Point-in-time view of the engine, computed on request from live counters.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    /// Why the status is not healthy
    pub reasons: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: f64,
    pub broker_connected: bool,
    pub sink_connected: bool,
    pub throughput_records_per_sec: f64,
    pub totals: Totals,
    pub quality: QualitySnapshot,
    pub channels: Vec<ChannelSnapshot>,
    pub partitions: Vec<PartitionSnapshot>,
    pub memory_usage_mb: u64,
}

/// Builds health snapshots from the metrics and the offset ledger.
#[derive(Clone)]
pub struct HealthReporter {
    metrics: IngestMetrics,
    ledger: Arc<OffsetLedger>,
}

impl HealthReporter {
    pub fn new(metrics: IngestMetrics, ledger: Arc<OffsetLedger>) -> Self {
        Self { metrics, ledger }
    }

    pub fn metrics(&self) -> &IngestMetrics {
        &self.metrics
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let m = self.metrics.snapshot();
        let partitions = self.ledger.snapshot();

        let mut reasons = Vec::new();
        if !m.broker_connected {
            reasons.push("broker disconnected".to_string());
        }
        if !m.sink_healthy {
            reasons.push("last sink call failed".to_string());
        }
        let retrying: Vec<usize> = m
            .channels
            .iter()
            .filter(|c| c.retrying)
            .map(|c| c.channel)
            .collect();
        if !retrying.is_empty() {
            reasons.push(format!("channels retrying: {retrying:?}"));
        }
        for p in partitions.iter().filter(|p| p.fenced_at.is_some()) {
            reasons.push(format!(
                "partition {}/{} commits held at dead-lettered offset {}",
                p.topic,
                p.partition,
                p.fenced_at.unwrap_or_default()
            ));
        }

        let status = if m.stopping {
            HealthStatus::Stopping
        } else if reasons.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        let uptime_secs = m.uptime.as_secs_f64();
        let throughput = if uptime_secs > 0.0 {
            m.totals.records_committed as f64 / uptime_secs
        } else {
            0.0
        };

        HealthSnapshot {
            status,
            reasons,
            timestamp: Utc::now(),
            started_at: m.started_at,
            uptime_secs,
            broker_connected: m.broker_connected,
            sink_connected: m.sink_healthy,
            throughput_records_per_sec: throughput,
            totals: m.totals,
            quality: m.quality,
            channels: m.channels,
            partitions,
            memory_usage_mb: process_memory_mb(),
        }
    }

    /// Periodically append the snapshot as a JSON line to `path`, until `shutdown`.
    pub fn start_emission_task(
        &self,
        path: PathBuf,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<Result<()>> {
        let reporter = self.clone();

        tokio::spawn(async move {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;

            let mut interval_timer = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval_timer.tick() => {}
                }

                let json_line = serde_json::to_string(&reporter.snapshot())?;
                file.write_all(json_line.as_bytes()).await?;
                file.write_all(b"\n").await?;
                file.flush().await?;
            }
            Ok(())
        })
    }
}

async fn health(State(reporter): State<HealthReporter>) -> (StatusCode, Json<HealthSnapshot>) {
    let snapshot = reporter.snapshot();
    let code = match snapshot.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Stopping => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(snapshot))
}

pub fn health_router(reporter: HealthReporter) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(reporter)
}

/// Bind the health endpoint's listener.
pub async fn bind_health(addr: SocketAddr) -> std::result::Result<TcpListener, EngineError> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| EngineError::HealthServer(format!("Failed to bind {addr}: {e}")))
}

/// Serve `GET /health` on `listener` until `shutdown` is cancelled.
pub async fn serve_health(
    listener: TcpListener,
    reporter: HealthReporter,
    shutdown: CancellationToken,
) -> std::result::Result<(), EngineError> {
    if let Ok(addr) = listener.local_addr() {
        info!("Health endpoint listening on http://{addr}/health");
    }

    axum::serve(listener, health_router(reporter))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| {
            warn!("Health server stopped: {e}");
            EngineError::HealthServer(e.to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;
    use transit_types::{FlushTrigger, SourcePosition, TopicPartition};

    fn reporter() -> HealthReporter {
        HealthReporter::new(IngestMetrics::new(2), Arc::new(OffsetLedger::new()))
    }

    async fn get_health(reporter: HealthReporter) -> (StatusCode, serde_json::Value) {
        let response = health_router(reporter)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_endpoint_healthy() {
        let reporter = reporter();
        reporter.metrics().record_routed(1);

        let (status, body) = get_health(reporter).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["totals"]["records_in"], 1);
        assert_eq!(body["channels"].as_array().unwrap().len(), 2);
        assert_eq!(body["channels"][1]["records_buffered"], 1);
        assert!(body["memory_usage_mb"].is_u64());
    }

    #[tokio::test]
    async fn test_health_endpoint_degraded_while_retrying() {
        let reporter = reporter();
        reporter.metrics().sink_failed();
        reporter.metrics().set_retrying(0, true);

        let (status, body) = get_health(reporter).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["sink_connected"], false);
        assert_eq!(body["reasons"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_health_endpoint_stopping() {
        let reporter = reporter();
        reporter.metrics().set_stopping();

        let (status, body) = get_health(reporter).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "stopping");
    }

    #[test]
    fn test_fenced_partition_degrades_health() {
        let ledger = Arc::new(OffsetLedger::new());
        ledger.admit(&SourcePosition::new("mta", 0, 9), 1);
        ledger.fence([(TopicPartition::new("mta", 0), 9)]);
        let reporter = HealthReporter::new(IngestMetrics::new(1), ledger);

        let snapshot = reporter.snapshot();
        assert_eq!(snapshot.status, HealthStatus::Degraded);
        assert_eq!(snapshot.partitions[0].fenced_at, Some(9));
        assert!(snapshot.reasons[0].contains("mta/0"));
    }

    #[tokio::test]
    async fn test_serve_health_on_bound_listener() {
        use tokio::io::AsyncReadExt;

        let listener = bind_health("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve_health(listener, reporter(), shutdown.clone()));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.contains("\"status\":\"healthy\""));

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_health_reports_address_in_use() {
        let taken = bind_health("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = taken.local_addr().unwrap();

        let err = bind_health(addr).await.unwrap_err();
        assert!(matches!(err, EngineError::HealthServer(_)));
        assert!(err.to_string().contains(&addr.to_string()));
    }

    #[tokio::test]
    async fn test_emission_task_appends_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");
        let reporter = reporter();
        reporter.metrics().record_routed(0);
        reporter.metrics().batch_sealed(0, 1, FlushTrigger::Size);

        let shutdown = CancellationToken::new();
        let handle =
            reporter.start_emission_task(path.clone(), Duration::from_millis(20), shutdown.clone());
        tokio::time::sleep(Duration::from_millis(70)).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert!(lines.len() >= 2, "got {} lines", lines.len());
        assert_eq!(lines[0]["totals"]["records_in_flight"], 1);
    }
}
