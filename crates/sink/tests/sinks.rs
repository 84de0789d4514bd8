//! Integration tests for the concrete sinks and dead-letter storage.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::HeaderMap, http::StatusCode, routing::post, Json, Router};
use chrono::Utc;
use tokio::net::TcpListener;
use transit_sink::{
    BatchSink, DeadLetterEntry, DeadLetterReason, DeadLetterStore, FilesystemDeadLetterStore,
    HttpSink, HttpSinkConfig, JsonlFileSink, MemoryDeadLetterStore, RejectedEntry,
    RejectedRecordLog, SinkError,
};
use transit_types::{
    Batch, BatchId, FlushTrigger, PayloadError, RawMessage, Record, RecordRejected, RecordSource,
    SourcePosition,
};

fn batch(channel: usize, offsets: &[i64]) -> Batch {
    let records = offsets
        .iter()
        .map(|&offset| {
            let mut record = Record::minimal(
                format!("MTA_{offset}"),
                RecordSource {
                    topic: "mta".to_string(),
                    partition: 0,
                    offset,
                    index: 0,
                    broker_timestamp: None,
                },
                Utc::now(),
            );
            record.latitude = Some(40.75);
            record
        })
        .collect();
    Batch::seal(
        BatchId {
            channel,
            sequence: 1,
        },
        records,
        FlushTrigger::Size,
    )
}

#[tokio::test]
async fn test_jsonl_sink_appends_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out").join("rows.jsonl");
    let sink = JsonlFileSink::new(&path);

    sink.commit(&batch(0, &[1, 2, 3])).await.unwrap();
    sink.commit(&batch(1, &[4])).await.unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    let rows: Vec<serde_json::Value> = content
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[0]["vehicle_id"], "MTA_1");
    assert_eq!(rows[3]["record_id"], "mta:0:4:0");
    assert_eq!(rows[0]["latitude"], 40.75);
    assert!(rows[0]["longitude"].is_null());
}

#[tokio::test]
async fn test_filesystem_dead_letter_store_appends_entries() {
    let dir = tempfile::tempdir().unwrap();
    let store = FilesystemDeadLetterStore::new(dir.path().join("dlq"));

    let failed = batch(2, &[10, 11]);
    store
        .append(&DeadLetterEntry::new(
            &failed,
            &DeadLetterReason::Fatal("HTTP 400 Bad Request: bad schema".to_string()),
            1,
        ))
        .await
        .unwrap();
    store
        .append(&DeadLetterEntry::new(
            &failed,
            &DeadLetterReason::ShutdownTimeout,
            0,
        ))
        .await
        .unwrap();

    let content = std::fs::read_to_string(store.file_path()).unwrap();
    let entries: Vec<serde_json::Value> = content
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["reason_kind"], "fatal");
    assert_eq!(entries[0]["batch_id"], "2-1");
    assert_eq!(entries[0]["record_count"], 2);
    assert_eq!(entries[0]["records"].as_array().unwrap().len(), 2);
    assert_eq!(entries[0]["offsets"][0]["offset"], 11);
    assert_eq!(entries[1]["reason_kind"], "shutdown_timeout");
    assert_eq!(entries[1]["attempts"], 0);
}

#[tokio::test]
async fn test_memory_dead_letter_store() {
    let store = MemoryDeadLetterStore::new();
    assert!(store.is_empty());
    store
        .append(&DeadLetterEntry::new(
            &batch(0, &[1]),
            &DeadLetterReason::RetriesExhausted {
                last_error: "timeout".to_string(),
            },
            5,
        ))
        .await
        .unwrap();
    let entries = store.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].reason_kind, "retries_exhausted");
    assert_eq!(entries[0].reason, "timeout");
}

#[tokio::test]
async fn test_rejected_record_log() {
    let dir = tempfile::tempdir().unwrap();
    let log = RejectedRecordLog::new(dir.path());

    let position = SourcePosition::new("mta", 1, 77);
    let raw = RawMessage::new(position.clone(), 2, [("LineRef", "M15")]);
    let error = RecordRejected::MissingField {
        field: "vehicleref",
        position: position.clone(),
    };
    log.append(&RejectedEntry::from_record(&raw, &error))
        .await
        .unwrap();
    log.append(&RejectedEntry::from_payload(
        &position,
        &PayloadError::InvalidJson("eof".to_string()),
    ))
    .await
    .unwrap();

    let content = std::fs::read_to_string(log.file_path()).unwrap();
    let lines: Vec<serde_json::Value> = content
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["index"], 2);
    assert_eq!(lines[0]["fields"]["lineref"], "M15");
    assert!(lines[1]["index"].is_null());
    assert!(lines[1]["error"].as_str().unwrap().contains("eof"));
}

#[derive(Clone)]
struct EndpointState {
    calls: Arc<AtomicUsize>,
    status: StatusCode,
}

async fn ingest(
    State(state): State<EndpointState>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> (StatusCode, String) {
    state.calls.fetch_add(1, Ordering::SeqCst);
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        == Some("Bearer secret");
    if !authorized {
        return (StatusCode::UNAUTHORIZED, "missing token".to_string());
    }
    if body["table"] != "vehicle_positions" || body["rows"].as_array().is_none() {
        return (StatusCode::BAD_REQUEST, "bad body".to_string());
    }
    (state.status, "done".to_string())
}

/// Start a test endpoint answering every request with `status`.
async fn start_endpoint(status: StatusCode) -> (String, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/insert", post(ingest))
        .with_state(EndpointState {
            calls: calls.clone(),
            status,
        });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}/insert"), calls)
}

fn http_sink(endpoint: String, token: Option<&str>) -> HttpSink {
    HttpSink::new(HttpSinkConfig {
        endpoint,
        table: "vehicle_positions".to_string(),
        token: token.map(str::to_string),
        request_timeout: Duration::from_secs(5),
    })
    .unwrap()
}

#[tokio::test]
async fn test_http_sink_success() {
    let (endpoint, calls) = start_endpoint(StatusCode::OK).await;
    let sink = http_sink(endpoint, Some("secret"));

    sink.commit(&batch(0, &[1, 2])).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_http_sink_classifies_failures() {
    let (endpoint, _) = start_endpoint(StatusCode::SERVICE_UNAVAILABLE).await;
    let err = http_sink(endpoint.clone(), Some("secret"))
        .commit(&batch(0, &[1]))
        .await
        .unwrap_err();
    assert!(matches!(err, SinkError::Retryable(_)));

    // Missing token is reported as 401, which is retried
    let err = http_sink(endpoint, None)
        .commit(&batch(0, &[1]))
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    let (endpoint, _) = start_endpoint(StatusCode::UNPROCESSABLE_ENTITY).await;
    let err = http_sink(endpoint, Some("secret"))
        .commit(&batch(0, &[1]))
        .await
        .unwrap_err();
    assert!(matches!(err, SinkError::Fatal(_)));
    assert!(err.reason().contains("422"));
}

#[tokio::test]
async fn test_http_sink_connection_refused_is_retryable() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = http_sink(format!("http://{addr}/insert"), None)
        .commit(&batch(0, &[1]))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
}
