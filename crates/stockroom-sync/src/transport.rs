//! # Cloud Transport
//!
//! PostgREST client for the cloud side of sync.
//!
//! ## Upsert Protocol
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      upsert(spec, record_id, data)                      │
//! │                                                                         │
//! │  record_id UUID shaped?                                                 │
//! │     yes ──► PATCH /{table}?id=eq.{record_id}                            │
//! │     no  ──► natural key set? PATCH /{table}?{key}=eq.{value}            │
//! │             else skip PATCH                                             │
//! │                                                                         │
//! │  PATCH returned a row        ──► Updated(row.id)                        │
//! │  PATCH [] / 404 / PGRST116   ──► POST /{table}                          │
//! │                                   (id sent only when UUID shaped)       │
//! │                                   ──► Inserted(row.id)                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Change Enumeration
//! Per table, parents first:
//! - `{ts}=gt.{since}&deleted_at=is.null` (live rows changed since)
//! - `deleted_at=gt.{since}` (rows soft-deleted since)
//!
//! or a single full scan when there is no checkpoint. Pages of
//! `limit`/`offset` are fetched until a short page comes back. A table the
//! server does not know (404) is skipped.
//!
//! ## Retries
//! 408, 429, 5xx and network failures are retried with exponential backoff
//! (`Retry-After` wins when present). Every other status is handed back to
//! the caller on the first attempt.

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use stockroom_core::ids::{is_remote_id, value_as_id};
use stockroom_core::payload::{from_remote, remote_name, to_remote};
use stockroom_core::tables::sync_order;
use stockroom_core::time::{format_ts, format_ts_micros, parse_json_ts};
use stockroom_core::{
    ChangeType, ProviderConfig, Record, RemoteChange, TableSpec, CREATED_AT, DELETED_AT,
    UPDATED_AT,
};

use crate::config::HttpSettings;
use crate::error::{SyncError, SyncResult};

/// PostgREST: the request matched no rows.
const PGRST_NO_ROWS: &str = "PGRST116";

/// Longest `Retry-After` we are willing to sleep for.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

const MAX_LOG_BODY_CHARS: usize = 500;

// =============================================================================
// Backend Trait
// =============================================================================

/// Which write the upsert ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOperation {
    Updated,
    Inserted,
}

/// Result of an upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// Server id of the written row.
    pub remote_id: String,
    pub operation: UpsertOperation,
}

/// The cloud side of sync.
#[async_trait]
pub trait CloudBackend: Send + Sync {
    /// Updates the matching remote row, or inserts it.
    ///
    /// ## Arguments
    /// * `spec` - Target table
    /// * `record_id` - Mapped remote id, or the local id when unmapped
    /// * `data` - Local record with foreign keys already translated
    async fn upsert(
        &self,
        spec: &'static TableSpec,
        record_id: &str,
        data: &Record,
    ) -> SyncResult<UpsertOutcome>;

    /// Marks a remote row deleted. A row that does not exist counts as done.
    async fn soft_delete(
        &self,
        spec: &'static TableSpec,
        remote_id: &str,
        at: DateTime<Utc>,
    ) -> SyncResult<()>;

    /// Every change since `since` (everything when `None`), parents first.
    async fn get_changes(&self, since: Option<DateTime<Utc>>) -> SyncResult<Vec<RemoteChange>>;

    /// Replaces the connection details. Backends without any ignore it.
    fn configure(&self, _provider: &ProviderConfig) {}
}

// =============================================================================
// Responses
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct PostgrestError {
    code: Option<String>,
    message: Option<String>,
    details: Option<String>,
}

/// Status and body of a finished request.
#[derive(Debug)]
struct Reply {
    status: StatusCode,
    body: String,
}

impl Reply {
    fn is_success(&self) -> bool {
        self.status.is_success()
    }

    fn error_body(&self) -> PostgrestError {
        serde_json::from_str(&self.body).unwrap_or_default()
    }

    /// 404 or `PGRST116`: the filter matched nothing.
    fn is_no_match(&self) -> bool {
        self.status == StatusCode::NOT_FOUND
            || self.error_body().code.as_deref() == Some(PGRST_NO_ROWS)
    }

    fn rows(&self) -> SyncResult<Vec<Record>> {
        if self.body.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&self.body)
            .map_err(|e| SyncError::InvalidResponse(format!("expected an array of rows: {e}")))
    }

    fn into_error(self) -> SyncError {
        let parsed = self.error_body();
        let message = match (parsed.message, parsed.details) {
            (Some(message), Some(details)) => format!("{message} ({details})"),
            (Some(message), None) => message,
            _ => preview(&self.body),
        };
        SyncError::http(self.status.as_u16(), parsed.code, message)
    }
}

fn preview(body: &str) -> String {
    let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
    if body.chars().count() > MAX_LOG_BODY_CHARS {
        preview.push_str("...");
    }
    preview
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|secs| Duration::from_secs(secs).min(MAX_RETRY_AFTER))
}

fn row_id(row: &Record) -> Option<String> {
    row.get("id").and_then(value_as_id)
}

// =============================================================================
// REST Transport
// =============================================================================

/// [`CloudBackend`] over PostgREST.
#[derive(Debug)]
pub struct RestTransport {
    client: reqwest::Client,
    provider: RwLock<ProviderConfig>,
    http: HttpSettings,
}

impl RestTransport {
    /// Creates a transport. The provider may be unconfigured; requests then
    /// fail with [`SyncError::NotConfigured`] until [`CloudBackend::configure`]
    /// supplies one.
    pub fn new(provider: ProviderConfig, http: HttpSettings) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| SyncError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(RestTransport {
            client,
            provider: RwLock::new(provider),
            http,
        })
    }

    fn provider(&self) -> ProviderConfig {
        match self.provider.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Current provider, or [`SyncError::NotConfigured`] before one is set.
    fn configured_provider(&self) -> SyncResult<ProviderConfig> {
        let provider = self.provider();
        if !provider.is_configured() {
            return Err(SyncError::NotConfigured);
        }
        Ok(provider)
    }

    fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.http.read_timeout_secs)
    }

    fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.http.write_timeout_secs)
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        let initial = Duration::from_millis(self.http.initial_backoff_ms);
        ExponentialBackoff {
            current_interval: initial,
            initial_interval: initial,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: MAX_RETRY_AFTER,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    fn headers(provider: &ProviderConfig) -> SyncResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        let api_key = HeaderValue::from_str(provider.api_key.trim())
            .map_err(|_| SyncError::InvalidConfig("API key is not a valid header value".into()))?;
        headers.insert("apikey", api_key);

        let bearer = HeaderValue::from_str(&format!("Bearer {}", provider.bearer().trim()))
            .map_err(|_| SyncError::InvalidConfig("access token is not a valid header value".into()))?;
        headers.insert(AUTHORIZATION, bearer);

        headers.insert("prefer", HeaderValue::from_static("return=representation"));
        Ok(headers)
    }

    fn table_url(provider: &ProviderConfig, spec: &TableSpec) -> SyncResult<Url> {
        let base = Url::parse(&format!("{}/", provider.base_url.trim().trim_end_matches('/')))?;
        Ok(base.join(spec.name)?)
    }

    /// Sends one request, retrying transient failures.
    ///
    /// ## Returns
    /// The final reply, successful or not. Only network errors that survive
    /// every attempt come back as `Err`.
    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
        timeout: Duration,
    ) -> SyncResult<Reply> {
        let provider = self.configured_provider()?;
        let headers = Self::headers(&provider)?;
        let max_attempts = self.http.max_attempts.max(1);
        let mut backoff = self.create_backoff();
        let mut attempt = 1u32;

        loop {
            debug!(method = %method, url = %url, attempt, "Cloud request");
            let mut request = self
                .client
                .request(method.clone(), url.clone())
                .headers(headers.clone())
                .timeout(timeout);
            if let Some(body) = body {
                request = request.json(body);
            }

            let (reason, hint) = match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if !is_retryable_status(status) || attempt >= max_attempts {
                        let body = response.text().await?;
                        if !status.is_success() {
                            debug!(status = %status, body = %preview(&body), "Cloud request failed");
                        }
                        return Ok(Reply { status, body });
                    }
                    (format!("HTTP {status}"), retry_after(response.headers()))
                }
                Err(err) => {
                    let err = SyncError::from(err);
                    if !err.is_retryable() || attempt >= max_attempts {
                        return Err(err);
                    }
                    (err.to_string(), None)
                }
            };

            let delay = hint
                .or_else(|| backoff.next_backoff())
                .unwrap_or(MAX_RETRY_AFTER);
            warn!(
                method = %method,
                url = %url,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                reason = %reason,
                "Cloud request failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Fetches every page of one filtered query.
    ///
    /// ## Returns
    /// `None` when the server does not know the table.
    async fn fetch_all(
        &self,
        spec: &TableSpec,
        filters: &[(String, String)],
    ) -> SyncResult<Option<Vec<Record>>> {
        let provider = self.configured_provider()?;
        let page_size = self.http.page_size.max(1);
        let order = format!("{}.asc,id.asc", spec.change_timestamp_column());
        let mut rows = Vec::new();
        let mut offset = 0u64;

        loop {
            let mut url = Self::table_url(&provider, spec)?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("select", "*");
                for (column, filter) in filters {
                    query.append_pair(column, filter);
                }
                query.append_pair("order", &order);
                query.append_pair("limit", &page_size.to_string());
                query.append_pair("offset", &offset.to_string());
            }

            let reply = self.send(Method::GET, url, None, self.read_timeout()).await?;
            if reply.status == StatusCode::NOT_FOUND {
                debug!(table = %spec.kind, "Table unknown to the server, skipped");
                return Ok(None);
            }
            if !reply.is_success() {
                return Err(reply.into_error());
            }

            let page = reply.rows()?;
            let fetched = page.len();
            rows.extend(page);
            if fetched < page_size as usize {
                return Ok(Some(rows));
            }
            offset += fetched as u64;
        }
    }
}

/// Turns one server row into a change.
fn to_change(
    spec: &'static TableSpec,
    row: &Record,
    since: Option<DateTime<Utc>>,
) -> Option<RemoteChange> {
    let record_id = row_id(row)?;
    let deleted_at = parse_json_ts(row.get(DELETED_AT));
    let change_type = if row.get(DELETED_AT).map(|v| !v.is_null()).unwrap_or(false) {
        ChangeType::Delete
    } else {
        match (since, parse_json_ts(row.get(CREATED_AT))) {
            (Some(since), Some(created)) if created <= since => ChangeType::Update,
            _ => ChangeType::Create,
        }
    };
    let server_timestamp = match change_type {
        ChangeType::Delete => deleted_at,
        _ => parse_json_ts(row.get(spec.change_timestamp_column())),
    };

    Some(RemoteChange {
        table: spec.kind,
        record_id,
        change_type,
        data: from_remote(spec, row),
        server_timestamp,
    })
}

#[async_trait]
impl CloudBackend for RestTransport {
    async fn upsert(
        &self,
        spec: &'static TableSpec,
        record_id: &str,
        data: &Record,
    ) -> SyncResult<UpsertOutcome> {
        let provider = self.configured_provider()?;
        let mut body = to_remote(spec, data);
        body.remove("id");

        let remote_id = is_remote_id(record_id).then(|| record_id.to_string());
        let filter = match &remote_id {
            Some(id) => Some(("id".to_string(), id.clone())),
            None => spec.natural_key.and_then(|column| {
                data.get(column)
                    .and_then(value_as_id)
                    .map(|value| (remote_name(spec, column).to_string(), value))
            }),
        };

        if let Some((column, value)) = filter {
            let mut url = Self::table_url(&provider, spec)?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair(&column, &format!("eq.{value}"));
                if remote_id.is_none() {
                    // natural keys are not unique server-side: touch one row at most
                    query.append_pair("order", "id.asc");
                    query.append_pair("limit", "1");
                }
            }
            let reply = self
                .send(
                    Method::PATCH,
                    url,
                    Some(&Value::Object(body.clone())),
                    self.write_timeout(),
                )
                .await?;

            if reply.is_success() {
                let rows = reply.rows()?;
                if rows.len() > 1 {
                    warn!(table = %spec.kind, filter = %column, matched = rows.len(), "Several remote rows updated, keeping the first");
                }
                if let Some(row) = rows.first() {
                    let remote_id = row_id(row).ok_or_else(|| {
                        SyncError::InvalidResponse(format!("{} row without id", spec.name))
                    })?;
                    debug!(table = %spec.kind, record_id = %record_id, remote_id = %remote_id, "Remote row updated");
                    return Ok(UpsertOutcome {
                        remote_id,
                        operation: UpsertOperation::Updated,
                    });
                }
            } else if !reply.is_no_match() {
                return Err(reply.into_error());
            }
            debug!(table = %spec.kind, filter = %column, "No remote match, inserting");
        }

        if let Some(id) = &remote_id {
            body.insert("id".to_string(), Value::String(id.clone()));
        }
        let url = Self::table_url(&provider, spec)?;
        let reply = self
            .send(Method::POST, url, Some(&Value::Object(body)), self.write_timeout())
            .await?;
        if !reply.is_success() {
            return Err(reply.into_error());
        }

        let rows = reply.rows()?;
        let remote_id = rows.first().and_then(row_id).ok_or_else(|| {
            SyncError::InvalidResponse(format!("insert into {} returned no id", spec.name))
        })?;
        debug!(table = %spec.kind, record_id = %record_id, remote_id = %remote_id, "Remote row inserted");
        Ok(UpsertOutcome {
            remote_id,
            operation: UpsertOperation::Inserted,
        })
    }

    async fn soft_delete(
        &self,
        spec: &'static TableSpec,
        remote_id: &str,
        at: DateTime<Utc>,
    ) -> SyncResult<()> {
        let provider = self.configured_provider()?;
        let mut body = Record::new();
        body.insert(DELETED_AT.to_string(), Value::String(format_ts(at)));
        if spec.has_updated_at {
            body.insert(UPDATED_AT.to_string(), Value::String(format_ts(at)));
        }

        let mut url = Self::table_url(&provider, spec)?;
        url.query_pairs_mut()
            .append_pair("id", &format!("eq.{remote_id}"));
        let reply = self
            .send(Method::PATCH, url, Some(&Value::Object(body)), self.write_timeout())
            .await?;

        if reply.is_success() || reply.is_no_match() {
            debug!(table = %spec.kind, remote_id = %remote_id, "Remote row soft-deleted");
            return Ok(());
        }
        Err(reply.into_error())
    }

    async fn get_changes(&self, since: Option<DateTime<Utc>>) -> SyncResult<Vec<RemoteChange>> {
        let mut changes = Vec::new();

        for kind in sync_order() {
            let spec = kind.spec();
            let queries: Vec<Vec<(String, String)>> = match since {
                None => vec![Vec::new()],
                Some(since) => {
                    let since = format_ts_micros(since);
                    vec![
                        vec![
                            (spec.change_timestamp_column().to_string(), format!("gt.{since}")),
                            (DELETED_AT.to_string(), "is.null".to_string()),
                        ],
                        vec![(DELETED_AT.to_string(), format!("gt.{since}"))],
                    ]
                }
            };

            let mut fetched = 0usize;
            for filters in &queries {
                let Some(rows) = self.fetch_all(spec, filters).await? else {
                    break;
                };
                fetched += rows.len();
                for row in &rows {
                    match to_change(spec, row, since) {
                        Some(change) => changes.push(change),
                        None => warn!(table = %kind, "Remote row without id skipped"),
                    }
                }
            }
            if fetched > 0 {
                debug!(table = %kind, rows = fetched, "Fetched remote changes");
            }
        }

        changes.sort_by(|a, b| {
            a.table
                .level()
                .cmp(&b.table.level())
                .then(a.server_timestamp.cmp(&b.server_timestamp))
        });
        Ok(changes)
    }

    fn configure(&self, provider: &ProviderConfig) {
        match self.provider.write() {
            Ok(mut guard) => *guard = provider.clone(),
            Err(poisoned) => *poisoned.into_inner() = provider.clone(),
        }
        debug!(base_url = %provider.base_url, "Cloud provider configured");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use stockroom_core::EntityKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const REMOTE_C1: &str = "11111111-1111-1111-1111-111111111111";

    #[derive(Debug, Clone)]
    struct Captured {
        method: String,
        path: String,
        query: HashMap<String, String>,
        headers: HashMap<String, String>,
        body: Option<Value>,
    }

    #[derive(Debug, Clone)]
    struct MockReply {
        status: u16,
        body: String,
    }

    fn reply(status: u16, body: Value) -> MockReply {
        MockReply {
            status,
            body: body.to_string(),
        }
    }

    fn header_end_offset(buffer: &[u8]) -> Option<usize> {
        buffer.windows(4).position(|window| window == b"\r\n\r\n")
    }

    async fn read_http_request(stream: &mut tokio::net::TcpStream) -> Option<Captured> {
        let mut buffer = Vec::new();
        loop {
            let mut chunk = [0_u8; 2048];
            let read = stream.read(&mut chunk).await.ok()?;
            if read == 0 {
                return None;
            }
            buffer.extend_from_slice(&chunk[..read]);
            if header_end_offset(&buffer).is_some() {
                break;
            }
        }

        let header_end = header_end_offset(&buffer)?;
        let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
        let mut lines = head.lines();
        let mut request_line = lines.next()?.split_whitespace();
        let method = request_line.next()?.to_string();
        let target = request_line.next()?.to_string();

        let mut headers = HashMap::new();
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        let content_length = headers
            .get("content-length")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        let mut body = buffer[header_end + 4..].to_vec();
        while body.len() < content_length {
            let mut chunk = [0_u8; 2048];
            let read = stream.read(&mut chunk).await.ok()?;
            if read == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..read]);
        }

        let url = Url::parse(&format!("http://mock{target}")).ok()?;
        Some(Captured {
            method,
            path: url.path().to_string(),
            query: url.query_pairs().into_owned().collect(),
            headers,
            body: serde_json::from_slice(&body).ok(),
        })
    }

    async fn write_http_response(
        stream: &mut tokio::net::TcpStream,
        reply: &MockReply,
    ) -> std::io::Result<()> {
        let response = format!(
            "HTTP/1.1 {} Mock\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            reply.status,
            reply.body.len(),
            reply.body
        );
        stream.write_all(response.as_bytes()).await?;
        stream.flush().await
    }

    async fn start_mock_server<F>(router: F) -> (String, Arc<Mutex<Vec<Captured>>>)
    where
        F: Fn(&Captured, usize) -> MockReply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let captured = Arc::new(Mutex::new(Vec::<Captured>::new()));
        let captured_clone = Arc::clone(&captured);

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let Some(request) = read_http_request(&mut stream).await else {
                    continue;
                };
                let index = {
                    let mut log = captured_clone.lock().unwrap();
                    log.push(request.clone());
                    log.len() - 1
                };
                let response = router(&request, index);
                let _ = write_http_response(&mut stream, &response).await;
            }
        });

        (format!("http://{addr}/rest/v1"), captured)
    }

    fn transport(base_url: &str) -> RestTransport {
        let provider = ProviderConfig {
            base_url: base_url.to_string(),
            api_key: "anon-key".to_string(),
            access_token: Some("user-jwt".to_string()),
        };
        let http = HttpSettings {
            max_attempts: 3,
            initial_backoff_ms: 5,
            ..Default::default()
        };
        RestTransport::new(provider, http).unwrap()
    }

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_upsert_patches_by_remote_id() {
        let (base, captured) = start_mock_server(|_, _| {
            reply(200, json!([{"id": REMOTE_C1, "name": "Ana"}]))
        })
        .await;
        let t = transport(&base);

        let outcome = t
            .upsert(
                EntityKind::Customer.spec(),
                REMOTE_C1,
                &record(json!({"id": "C1", "name": "Ana", "legacy": 1})),
            )
            .await
            .unwrap();
        assert_eq!(outcome.remote_id, REMOTE_C1);
        assert_eq!(outcome.operation, UpsertOperation::Updated);

        let requests = captured.lock().unwrap().clone();
        assert_eq!(requests.len(), 1);
        let patch = &requests[0];
        assert_eq!(patch.method, "PATCH");
        assert_eq!(patch.path, "/rest/v1/customers");
        assert_eq!(patch.query["id"], format!("eq.{REMOTE_C1}"));
        assert_eq!(patch.headers["apikey"], "anon-key");
        assert_eq!(patch.headers["authorization"], "Bearer user-jwt");
        assert_eq!(patch.headers["prefer"], "return=representation");
        // the local id never overwrites the server id; unknown columns stay home
        let body = patch.body.as_ref().unwrap();
        assert_eq!(body, &json!({"name": "Ana"}));
    }

    #[tokio::test]
    async fn test_upsert_falls_back_to_post_when_natural_key_misses() {
        let (base, captured) = start_mock_server(|request, _| match request.method.as_str() {
            "PATCH" => reply(200, json!([])),
            _ => reply(201, json!([{"id": REMOTE_C1, "name": "Drinks"}])),
        })
        .await;
        let t = transport(&base);

        let outcome = t
            .upsert(
                EntityKind::Category.spec(),
                "K1",
                &record(json!({"id": "K1", "name": "Drinks"})),
            )
            .await
            .unwrap();
        assert_eq!(outcome.operation, UpsertOperation::Inserted);
        assert_eq!(outcome.remote_id, REMOTE_C1);

        let requests = captured.lock().unwrap().clone();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].query["name"], "eq.Drinks");
        assert_eq!(requests[0].query["order"], "id.asc");
        assert_eq!(requests[0].query["limit"], "1");
        assert_eq!(requests[1].method, "POST");
        assert!(requests[1].query.is_empty());
        // a local-shaped id is left for the server to mint
        assert_eq!(requests[1].body, Some(json!({"name": "Drinks"})));
    }

    #[tokio::test]
    async fn test_natural_key_update_touches_a_single_row() {
        let (base, captured) = start_mock_server(|request, _| {
            if request.query.contains_key("limit") {
                reply(200, json!([{"id": REMOTE_C1, "name": "Drinks"}]))
            } else {
                reply(
                    200,
                    json!([
                        {"id": "22222222-2222-2222-2222-222222222222", "name": "Drinks"},
                        {"id": REMOTE_C1, "name": "Drinks"}
                    ]),
                )
            }
        })
        .await;
        let t = transport(&base);

        let outcome = t
            .upsert(
                EntityKind::Category.spec(),
                "K1",
                &record(json!({"id": "K1", "name": "Drinks"})),
            )
            .await
            .unwrap();
        assert_eq!(outcome.operation, UpsertOperation::Updated);
        assert_eq!(outcome.remote_id, REMOTE_C1);

        // by remote id the filter is already unique
        t.upsert(EntityKind::Category.spec(), REMOTE_C1, &record(json!({"name": "Drinks"})))
            .await
            .unwrap();

        let requests = captured.lock().unwrap().clone();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].query["name"], "eq.Drinks");
        assert_eq!(requests[0].query["limit"], "1");
        assert_eq!(requests[0].query["order"], "id.asc");
        assert_eq!(requests[1].query["id"], format!("eq.{REMOTE_C1}"));
        assert!(!requests[1].query.contains_key("limit"));
    }

    #[tokio::test]
    async fn test_upsert_without_key_posts_directly_and_shapes_body() {
        let (base, captured) = start_mock_server(|request, _| match request.method.as_str() {
            "POST" => reply(201, json!([{"id": REMOTE_C1}])),
            _ => reply(500, json!({"message": "unexpected"})),
        })
        .await;
        let t = transport(&base);

        let outcome = t
            .upsert(
                EntityKind::User.spec(),
                REMOTE_C1,
                &record(json!({
                    "id": REMOTE_C1,
                    "username": "ana",
                    "full_name": "Ana B",
                    "is_active": 1,
                    "permissions": "[\"sales\"]"
                })),
            )
            .await;
        // PATCH by id hits the 500 path and exhausts its attempts
        assert!(outcome.is_err());

        let customer = t
            .upsert(
                EntityKind::Customer.spec(),
                "C1",
                &record(json!({"id": "C1", "name": "Ana"})),
            )
            .await
            .unwrap();
        assert_eq!(customer.operation, UpsertOperation::Inserted);

        let requests = captured.lock().unwrap().clone();
        let patches = requests.iter().filter(|r| r.method == "PATCH").count();
        assert_eq!(patches, 3);
        let users_patch = &requests[0];
        assert_eq!(
            users_patch.body,
            Some(json!({
                "username": "ana",
                "display_name": "Ana B",
                "is_active": true,
                "permissions": ["sales"]
            }))
        );
        let post = requests.last().unwrap();
        assert_eq!(post.path, "/rest/v1/customers");
        assert_eq!(post.body, Some(json!({"name": "Ana"})));
    }

    #[tokio::test]
    async fn test_transient_status_is_retried_then_succeeds() {
        let (base, captured) = start_mock_server(|_, index| match index {
            0 => reply(503, json!({"message": "unavailable"})),
            _ => reply(200, json!([{"id": REMOTE_C1}])),
        })
        .await;
        let t = transport(&base);

        let outcome = t
            .upsert(EntityKind::Customer.spec(), REMOTE_C1, &record(json!({"name": "Ana"})))
            .await
            .unwrap();
        assert_eq!(outcome.operation, UpsertOperation::Updated);
        assert_eq!(captured.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_validation_error_is_not_retried() {
        let (base, captured) = start_mock_server(|_, _| {
            reply(
                400,
                json!({"code": "22P02", "message": "invalid input syntax for type uuid", "details": null}),
            )
        })
        .await;
        let t = transport(&base);

        let err = t
            .upsert(EntityKind::Customer.spec(), REMOTE_C1, &record(json!({"name": "Ana"})))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(matches!(err, SyncError::Http { status: 400, ref code, .. } if code.as_deref() == Some("22P02")));
        assert_eq!(captured.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_soft_delete_treats_missing_row_as_done() {
        let (base, captured) = start_mock_server(|_, _| reply(404, json!({}))).await;
        let t = transport(&base);
        let at = Utc::now();

        t.soft_delete(EntityKind::SaleItem.spec(), REMOTE_C1, at)
            .await
            .unwrap();

        let requests = captured.lock().unwrap().clone();
        let body = requests[0].body.clone().unwrap();
        assert_eq!(body, json!({"deleted_at": format_ts(at)}));
        assert_eq!(requests[0].query["id"], format!("eq.{REMOTE_C1}"));
    }

    #[tokio::test]
    async fn test_full_scan_enumerates_all_tables_parents_first() {
        let (base, captured) = start_mock_server(|request, _| {
            match request.path.as_str() {
                "/rest/v1/sales" => reply(
                    200,
                    json!([{"id": "33333333-3333-3333-3333-333333333333", "receipt_number": "R-1",
                            "customer_id": REMOTE_C1, "updated_at": "2024-01-02T00:00:00.000Z",
                            "deleted_at": null}]),
                ),
                "/rest/v1/users" => reply(
                    200,
                    json!([{"id": REMOTE_C1, "username": "ana", "display_name": "Ana",
                            "is_active": true, "updated_at": "2024-01-01T00:00:00.000Z"}]),
                ),
                "/rest/v1/expenses" => reply(404, json!({"code": "42P01", "message": "no table"})),
                _ => reply(200, json!([])),
            }
        })
        .await;
        let t = transport(&base);

        let changes = t.get_changes(None).await.unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].table, EntityKind::User);
        assert_eq!(changes[0].change_type, ChangeType::Create);
        assert_eq!(changes[0].data["full_name"], json!("Ana"));
        assert_eq!(changes[0].data["is_active"], json!(1));
        assert_eq!(changes[1].table, EntityKind::Sale);

        let requests = captured.lock().unwrap().clone();
        assert_eq!(requests.len(), EntityKind::ALL.len());
        let sales = requests.iter().find(|r| r.path == "/rest/v1/sales").unwrap();
        assert_eq!(sales.query["order"], "updated_at.asc,id.asc");
        assert_eq!(sales.query["limit"], "1000");
        let items = requests.iter().find(|r| r.path == "/rest/v1/sale_items").unwrap();
        assert_eq!(items.query["order"], "created_at.asc,id.asc");
    }

    #[tokio::test]
    async fn test_incremental_scan_classifies_changes_and_pages() {
        let since: DateTime<Utc> = "2024-01-01T00:00:00Z".parse().unwrap();
        let (base, captured) = start_mock_server(|request, _| {
            if request.path != "/rest/v1/customers" {
                return reply(200, json!([]));
            }
            if request.query.contains_key("updated_at") {
                match request.query["offset"].as_str() {
                    "0" => reply(
                        200,
                        json!([
                            {"id": "c-old", "name": "A", "created_at": "2023-06-01T00:00:00Z",
                             "updated_at": "2024-01-03T00:00:00Z"},
                            {"id": "c-new", "name": "B", "created_at": "2024-01-02T00:00:00Z",
                             "updated_at": "2024-01-02T00:00:00Z"}
                        ]),
                    ),
                    _ => reply(200, json!([])),
                }
            } else {
                reply(
                    200,
                    json!([{"id": "c-gone", "name": "C", "created_at": "2023-01-01T00:00:00Z",
                            "deleted_at": "2024-01-04T00:00:00Z"}]),
                )
            }
        })
        .await;
        let mut t = transport(&base);
        t.http.page_size = 2;

        let changes = t.get_changes(Some(since)).await.unwrap();
        let kinds: Vec<(&str, ChangeType)> = changes
            .iter()
            .map(|c| (c.record_id.as_str(), c.change_type))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("c-new", ChangeType::Create),
                ("c-old", ChangeType::Update),
                ("c-gone", ChangeType::Delete),
            ]
        );

        let requests = captured.lock().unwrap().clone();
        let customers: Vec<&Captured> = requests
            .iter()
            .filter(|r| r.path == "/rest/v1/customers")
            .collect();
        // two pages of the live query, one of the deleted query
        assert_eq!(customers.len(), 3);
        assert_eq!(customers[0].query["updated_at"], "gt.2024-01-01T00:00:00.000000Z");
        assert_eq!(customers[0].query["deleted_at"], "is.null");
        assert_eq!(customers[1].query["offset"], "2");
        assert_eq!(customers[2].query["deleted_at"], "gt.2024-01-01T00:00:00.000000Z");
    }

    #[tokio::test]
    async fn test_unconfigured_provider_fails_until_configured() {
        let t = RestTransport::new(ProviderConfig::default(), HttpSettings::default()).unwrap();
        let err = t.get_changes(None).await.unwrap_err();
        assert!(matches!(err, SyncError::NotConfigured));
        let err = t
            .upsert(EntityKind::Customer.spec(), "C1", &record(json!({"name": "Ana"})))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotConfigured));
        let err = t
            .soft_delete(EntityKind::Customer.spec(), REMOTE_C1, Utc::now())
            .await
            .unwrap_err();
        assert!(err.is_config_error());

        let (base, _captured) = start_mock_server(|_, _| reply(200, json!([]))).await;
        t.configure(&ProviderConfig {
            base_url: base,
            api_key: "anon-key".into(),
            access_token: None,
        });
        assert!(t.get_changes(None).await.unwrap().is_empty());
    }
}
