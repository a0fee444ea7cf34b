//! Client for the legacy KVS partition controller.
//!
//! The source side of the migration exposes a small HTTP surface on the
//! partition primary: sequence-number queries, key enumeration over a
//! sequence range, and the admission-control switch. This module owns
//! the requests the core issues against it, with retry/backoff for
//! transient faults. `4xx` responses are surfaced, never retried.
//!
//! Enumeration responses are newline-delimited JSON objects
//! `{"sn": <i64>, "key": "<string>", "value": "<base64>"}` streamed in
//! chunked HTTP; the client tolerates records split across chunk
//! boundaries.

use crate::config::MigrationSettings;
use crate::error::{Error, Result, SourceError};
use crate::types::{KeyValueRecord, SeqNum};
use async_trait::async_trait;
use base64::Engine;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

/// Channel depth between the enumeration reader task and the consuming
/// worker.
const ENUMERATION_CHANNEL_DEPTH: usize = 64;

/// The source partition primary, as seen by the migration core.
#[async_trait]
pub trait SourceService: Send + Sync + std::fmt::Debug {
    /// First sequence number retained by the source store.
    async fn get_start_sn(&self) -> Result<SeqNum>;

    /// Highest sequence number assigned by the source store.
    async fn get_end_sn(&self) -> Result<SeqNum>;

    /// Stream records with sequence numbers in `[from, to]`, ascending.
    /// A stream error is delivered in-band and ends the stream.
    async fn enumerate(
        &self,
        from: SeqNum,
        to: SeqNum,
    ) -> Result<mpsc::Receiver<Result<KeyValueRecord>>>;

    /// Flip the source into write-rejection mode. Once this returns,
    /// the source's end sequence number is stable.
    async fn reject_writes(&self) -> Result<()>;

    /// Re-admit writes on the source (abort path).
    async fn resume_writes(&self) -> Result<()>;
}

/// One record on the enumeration wire.
#[derive(Debug, Serialize, Deserialize)]
struct WireRecord {
    sn: SeqNum,
    key: String,
    value: String,
}

/// Render a record as one enumeration wire line (without newline).
pub fn encode_record_line(record: &KeyValueRecord) -> String {
    let wire = WireRecord {
        sn: record.seq_num,
        key: record.key.clone(),
        value: base64::engine::general_purpose::STANDARD.encode(&record.value),
    };
    serde_json::to_string(&wire).expect("wire record serializes")
}

/// Parse one enumeration wire line.
pub fn parse_record_line(line: &str) -> Result<KeyValueRecord> {
    let wire: WireRecord = serde_json::from_str(line).map_err(|e| SourceError::InvalidBody {
        endpoint: "EnumerateKeys".into(),
        reason: e.to_string(),
    })?;
    let value = base64::engine::general_purpose::STANDARD
        .decode(&wire.value)
        .map_err(|e| SourceError::InvalidBody {
            endpoint: "EnumerateKeys".into(),
            reason: format!("bad base64 value: {}", e),
        })?;
    Ok(KeyValueRecord {
        seq_num: wire.sn,
        key: wire.key,
        value,
    })
}

/// Pooled HTTP client to the source partition primary.
#[derive(Debug, Clone)]
pub struct HttpSourceClient {
    client: reqwest::Client,
    base: String,
    retry: crate::config::RetryPolicy,
    request_timeout: Duration,
}

impl HttpSourceClient {
    /// Build a client from migration settings.
    pub fn new(settings: &MigrationSettings) -> Result<Self> {
        if settings.source_service_uri.is_empty() {
            return Err(Error::Config("source service URI is required".into()));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base: settings.source_service_uri.trim_end_matches('/').to_string(),
            retry: settings.retry.clone(),
            request_timeout: settings.request_timeout,
        })
    }

    fn url(&self, operation: &str) -> String {
        format!("{}/{}", self.base, operation)
    }

    /// Issue one request with retry on transient failures.
    async fn send_with_retry(
        &self,
        method: Method,
        operation: &str,
        query: Option<[(&str, String); 2]>,
    ) -> Result<reqwest::Response> {
        let url = self.url(operation);
        let mut retry_index = 0u32;

        loop {
            let mut request = self
                .client
                .request(method.clone(), &url)
                .timeout(self.request_timeout);
            if let Some(ref q) = query {
                request = request.query(q);
            }

            let error: Error = match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if status.is_server_error() {
                        SourceError::ServerError {
                            endpoint: operation.to_string(),
                            status: status.as_u16(),
                        }
                        .into()
                    } else {
                        let body = response.text().await.unwrap_or_default();
                        return Err(SourceError::Rejected {
                            endpoint: operation.to_string(),
                            status: status.as_u16(),
                            body,
                        }
                        .into());
                    }
                }
                Err(e) if e.is_timeout() => SourceError::RequestTimeout {
                    endpoint: operation.to_string(),
                }
                .into(),
                Err(e) => SourceError::ConnectionFailed {
                    endpoint: operation.to_string(),
                    reason: e.to_string(),
                }
                .into(),
            };

            if retry_index + 1 >= self.retry.max_attempts {
                return Err(error);
            }
            let backoff = self.retry.jittered_backoff_for(retry_index);
            tracing::warn!(
                operation,
                retry = retry_index + 1,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "Transient source failure, retrying"
            );
            tokio::time::sleep(backoff).await;
            retry_index += 1;
        }
    }

    async fn get_sn(&self, operation: &str) -> Result<SeqNum> {
        let response = self.send_with_retry(Method::GET, operation, None).await?;
        let body = response.text().await.map_err(|e| SourceError::Stream(e.to_string()))?;
        body.trim()
            .parse::<i64>()
            .map_err(|e| {
                SourceError::InvalidBody {
                    endpoint: operation.to_string(),
                    reason: format!("expected base-10 long, got {:?}: {}", body.trim(), e),
                }
                .into()
            })
    }
}

#[async_trait]
impl SourceService for HttpSourceClient {
    async fn get_start_sn(&self) -> Result<SeqNum> {
        self.get_sn("GetStartSN").await
    }

    async fn get_end_sn(&self) -> Result<SeqNum> {
        self.get_sn("GetEndSN").await
    }

    async fn enumerate(
        &self,
        from: SeqNum,
        to: SeqNum,
    ) -> Result<mpsc::Receiver<Result<KeyValueRecord>>> {
        let query = Some([("from", from.to_string()), ("to", to.to_string())]);
        let mut response = self
            .send_with_retry(Method::GET, "EnumerateKeys", query)
            .await?;

        let (tx, rx) = mpsc::channel(ENUMERATION_CHANNEL_DEPTH);
        tokio::spawn(async move {
            let mut buf: Vec<u8> = Vec::new();
            loop {
                match response.chunk().await {
                    Ok(Some(chunk)) => {
                        buf.extend_from_slice(&chunk);
                        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                            let line_bytes: Vec<u8> = buf.drain(..=pos).collect();
                            let line = String::from_utf8_lossy(&line_bytes);
                            let line = line.trim();
                            if line.is_empty() {
                                continue;
                            }
                            match parse_record_line(line) {
                                Ok(record) => {
                                    if tx.send(Ok(record)).await.is_err() {
                                        return;
                                    }
                                }
                                Err(e) => {
                                    let _ = tx.send(Err(e)).await;
                                    return;
                                }
                            }
                        }
                    }
                    Ok(None) => {
                        let tail = String::from_utf8_lossy(&buf);
                        let tail = tail.trim();
                        if !tail.is_empty() {
                            let _ = tx.send(parse_record_line(tail)).await;
                        }
                        return;
                    }
                    Err(e) => {
                        let _ = tx
                            .send(Err(SourceError::Stream(e.to_string()).into()))
                            .await;
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn reject_writes(&self) -> Result<()> {
        self.send_with_retry(Method::PUT, "RejectWrites", None)
            .await?;
        tracing::info!("Source is now rejecting writes");
        Ok(())
    }

    async fn resume_writes(&self) -> Result<()> {
        self.send_with_retry(Method::PUT, "ResumeWrites", None)
            .await?;
        tracing::info!("Source is accepting writes again");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Query, State};
    use axum::http::StatusCode;
    use axum::routing::{get, put};
    use axum::Router;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Default)]
    struct FakeKvs {
        start_sn: SeqNum,
        end_sn: SeqNum,
        records: Vec<KeyValueRecord>,
        end_sn_failures: AtomicU32,
        end_sn_calls: AtomicU32,
        reject_calls: AtomicU32,
    }

    #[derive(Debug, Deserialize)]
    struct RangeQuery {
        from: SeqNum,
        to: SeqNum,
    }

    fn fake_router(kvs: Arc<FakeKvs>) -> Router {
        Router::new()
            .route(
                "/KvsMigration/GetStartSN",
                get(|State(kvs): State<Arc<FakeKvs>>| async move { kvs.start_sn.to_string() }),
            )
            .route(
                "/KvsMigration/GetEndSN",
                get(|State(kvs): State<Arc<FakeKvs>>| async move {
                    kvs.end_sn_calls.fetch_add(1, Ordering::SeqCst);
                    let failures = kvs.end_sn_failures.load(Ordering::SeqCst);
                    if failures > 0 {
                        kvs.end_sn_failures.fetch_sub(1, Ordering::SeqCst);
                        return (StatusCode::SERVICE_UNAVAILABLE, String::new());
                    }
                    (StatusCode::OK, kvs.end_sn.to_string())
                }),
            )
            .route(
                "/KvsMigration/EnumerateKeys",
                get(
                    |State(kvs): State<Arc<FakeKvs>>, Query(range): Query<RangeQuery>| async move {
                        let mut body = String::new();
                        for record in &kvs.records {
                            if record.seq_num >= range.from && record.seq_num <= range.to {
                                body.push_str(&encode_record_line(record));
                                body.push('\n');
                            }
                        }
                        body
                    },
                ),
            )
            .route(
                "/KvsMigration/RejectWrites",
                put(|State(kvs): State<Arc<FakeKvs>>| async move {
                    kvs.reject_calls.fetch_add(1, Ordering::SeqCst);
                    StatusCode::NO_CONTENT
                }),
            )
            .route(
                "/KvsMigration/ResumeWrites",
                put(|| async { StatusCode::NO_CONTENT }),
            )
            .with_state(kvs)
    }

    async fn spawn_fake_source(kvs: Arc<FakeKvs>) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, fake_router(kvs)).await.unwrap();
        });
        addr
    }

    fn client_for(addr: SocketAddr) -> HttpSourceClient {
        let settings = MigrationSettings::new(format!("http://{}/KvsMigration", addr))
            .with_retry(crate::config::RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(20),
            });
        HttpSourceClient::new(&settings).unwrap()
    }

    #[test]
    fn test_record_line_round_trip() {
        let record = KeyValueRecord::new(42, "actor:7", b"payload".to_vec());
        let line = encode_record_line(&record);
        assert_eq!(parse_record_line(&line).unwrap(), record);
    }

    #[test]
    fn test_parse_record_line_rejects_garbage() {
        assert!(parse_record_line("not json").is_err());
        assert!(parse_record_line(r#"{"sn":1,"key":"k","value":"!!!"}"#).is_err());
    }

    #[tokio::test]
    async fn test_get_sn_endpoints() {
        let kvs = Arc::new(FakeKvs {
            start_sn: 1,
            end_sn: 1000,
            ..Default::default()
        });
        let addr = spawn_fake_source(Arc::clone(&kvs)).await;
        let client = client_for(addr);

        assert_eq!(client.get_start_sn().await.unwrap(), 1);
        assert_eq!(client.get_end_sn().await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn test_transient_5xx_is_retried() {
        let kvs = Arc::new(FakeKvs {
            end_sn: 77,
            ..Default::default()
        });
        kvs.end_sn_failures.store(2, Ordering::SeqCst);
        let addr = spawn_fake_source(Arc::clone(&kvs)).await;
        let client = client_for(addr);

        assert_eq!(client.get_end_sn().await.unwrap(), 77);
        assert_eq!(kvs.end_sn_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted_surface_server_error() {
        let kvs = Arc::new(FakeKvs::default());
        kvs.end_sn_failures.store(10, Ordering::SeqCst);
        let addr = spawn_fake_source(Arc::clone(&kvs)).await;
        let client = client_for(addr);

        let err = client.get_end_sn().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Source(SourceError::ServerError { status: 503, .. })
        ));
        assert_eq!(kvs.end_sn_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_4xx_is_surfaced_without_retry() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_route = Arc::clone(&calls);
        let app = Router::new().route(
            "/KvsMigration/GetStartSN",
            get(move || {
                let calls = Arc::clone(&calls_in_route);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    (StatusCode::BAD_REQUEST, "unknown partition")
                }
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = client_for(addr);
        let err = client.get_start_sn().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Source(SourceError::Rejected { status: 400, .. })
        ));
        assert!(!err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_enumerate_streams_requested_range() {
        let records: Vec<KeyValueRecord> = (1..=20)
            .map(|sn| KeyValueRecord::new(sn, format!("key-{}", sn), vec![sn as u8]))
            .collect();
        let kvs = Arc::new(FakeKvs {
            start_sn: 1,
            end_sn: 20,
            records,
            ..Default::default()
        });
        let addr = spawn_fake_source(Arc::clone(&kvs)).await;
        let client = client_for(addr);

        let mut rx = client.enumerate(5, 12).await.unwrap();
        let mut received = Vec::new();
        while let Some(record) = rx.recv().await {
            received.push(record.unwrap());
        }

        assert_eq!(received.len(), 8);
        assert_eq!(received.first().unwrap().seq_num, 5);
        assert_eq!(received.last().unwrap().seq_num, 12);
        assert!(received.windows(2).all(|w| w[0].seq_num < w[1].seq_num));
    }

    #[tokio::test]
    async fn test_reject_writes_round_trip() {
        let kvs = Arc::new(FakeKvs::default());
        let addr = spawn_fake_source(Arc::clone(&kvs)).await;
        let client = client_for(addr);

        client.reject_writes().await.unwrap();
        client.resume_writes().await.unwrap();
        assert_eq!(kvs.reject_calls.load(Ordering::SeqCst), 1);
    }
}
