//! REST remote client.
//!
//! Talks to a PostgREST-style backend: one table per record type, rows
//! filtered with `column=op.value` query parameters. The HTTP client is
//! abstracted via a trait so any HTTP library can be plugged in.
//!
//! Each table needs a `modified_at timestamptz` column that the database
//! sets to `now()` on every insert and update (a column default plus an
//! update trigger). Downloads page on that column rather than on the
//! device-set `updated_at`.

use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteClient;
use async_trait::async_trait;
use chrono::SecondsFormat;
use cupnote_sync_protocol::{RecordType, RemoteRecord, Timestamp, VenueKind};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET.
    Get,
    /// POST.
    Post,
}

/// An outgoing HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Method.
    pub method: Method,
    /// Absolute URL, query string included.
    pub url: String,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    /// Returns the first value of a header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A received HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The request never produced a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFailure {
    /// Connection refused, DNS failure, reset...
    Connection(String),
    /// The client gave up waiting.
    Timeout(Duration),
}

impl From<TransportFailure> for SyncError {
    fn from(failure: TransportFailure) -> Self {
        match failure {
            TransportFailure::Connection(message) => SyncError::Network(message),
            TransportFailure::Timeout(after) => SyncError::Timeout(after),
        }
    }
}

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a request and returns the response, whatever its status.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportFailure>;
}

/// Remote client for a PostgREST-style backend.
///
/// Rows are JSON objects with the record header as columns and the domain
/// fields in a `payload` column.
pub struct RestRemote<C: HttpClient> {
    /// Project URL (e.g., "https://abc.supabase.co").
    base_url: String,
    api_key: String,
    access_token: RwLock<Option<String>>,
    client: C,
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> RestRemote<C> {
    /// Creates a new REST remote.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, client: C) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            access_token: RwLock::new(None),
            client,
            last_error: RwLock::new(None),
        }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Sets the signed-in user's session token. Without one the API key
    /// is sent as the bearer token.
    pub fn set_access_token(&self, token: Option<String>) {
        *self.access_token.write() = token;
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    fn table_url(&self, record_type: RecordType) -> String {
        format!("{}/rest/v1/{}", self.base_url, record_type.table_name())
    }

    fn headers(&self) -> Vec<(String, String)> {
        let bearer = self
            .access_token
            .read()
            .clone()
            .unwrap_or_else(|| self.api_key.clone());
        vec![
            ("apikey".into(), self.api_key.clone()),
            ("Authorization".into(), format!("Bearer {bearer}")),
            ("Accept".into(), "application/json".into()),
        ]
    }

    async fn execute<Res: DeserializeOwned>(&self, request: HttpRequest) -> SyncResult<Res> {
        let result = self.send_checked(request).await.and_then(|body| {
            serde_json::from_slice(&body)
                .map_err(|e| SyncError::Codec(format!("failed to decode response: {e}")))
        });
        self.record_outcome(&result);
        result
    }

    async fn execute_unit(&self, request: HttpRequest) -> SyncResult<()> {
        let result = self.send_checked(request).await.map(|_| ());
        self.record_outcome(&result);
        result
    }

    async fn send_checked(&self, request: HttpRequest) -> SyncResult<Vec<u8>> {
        let response = self.client.send(request).await?;

        if !response.is_success() {
            let message = String::from_utf8_lossy(&response.body).into_owned();
            return Err(SyncError::from_status(response.status, message));
        }
        Ok(response.body)
    }

    fn record_outcome<Res>(&self, result: &SyncResult<Res>) {
        *self.last_error.write() = result.as_ref().err().map(|e| e.to_string());
    }
}

#[async_trait]
impl<C, T> RemoteClient<T> for RestRemote<C>
where
    C: HttpClient,
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn upsert(
        &self,
        record_type: RecordType,
        record: RemoteRecord<T>,
    ) -> SyncResult<RemoteRecord<T>> {
        let body = serde_json::to_vec(&[&record])
            .map_err(|e| SyncError::Codec(format!("failed to encode row: {e}")))?;

        let mut headers = self.headers();
        headers.push(("Content-Type".into(), "application/json".into()));
        headers.push((
            "Prefer".into(),
            "resolution=merge-duplicates,return=representation".into(),
        ));

        let request = HttpRequest {
            method: Method::Post,
            url: format!("{}?on_conflict=id", self.table_url(record_type)),
            headers,
            body: Some(body),
        };

        let rows: Vec<RemoteRecord<T>> = self.execute(request).await?;
        match rows.into_iter().next() {
            Some(row) => Ok(row),
            // Backend accepted the row but echoed nothing back.
            None => Ok(record),
        }
    }

    async fn fetch_since(
        &self,
        record_type: RecordType,
        user_id: &str,
        since: Option<Timestamp>,
    ) -> SyncResult<Vec<RemoteRecord<T>>> {
        let mut url = format!(
            "{}?user_id=eq.{}&order=modified_at.asc",
            self.table_url(record_type),
            urlencoding::encode(user_id)
        );
        if let Some(since) = since {
            url.push_str("&modified_at=gte.");
            url.push_str(&urlencoding::encode(
                &since.to_rfc3339_opts(SecondsFormat::Micros, true),
            ));
        }

        let request = HttpRequest {
            method: Method::Get,
            url,
            headers: self.headers(),
            body: None,
        };

        self.execute(request).await
    }

    async fn increment_venue_visit(
        &self,
        user_id: &str,
        kind: VenueKind,
        name: &str,
    ) -> SyncResult<()> {
        let mut args = serde_json::Map::new();
        args.insert("user_uuid".into(), user_id.into());
        args.insert(kind.name_param().into(), name.into());
        let body = serde_json::to_vec(&args)
            .map_err(|e| SyncError::Codec(format!("failed to encode arguments: {e}")))?;

        let mut headers = self.headers();
        headers.push(("Content-Type".into(), "application/json".into()));

        let request = HttpRequest {
            method: Method::Post,
            url: format!("{}/rest/v1/rpc/{}", self.base_url, kind.procedure()),
            headers,
            body: Some(body),
        };

        self.execute_unit(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use cupnote_sync_protocol::SyncRecord;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct TestClient {
        requests: Mutex<Vec<HttpRequest>>,
        responses: Mutex<VecDeque<Result<HttpResponse, TransportFailure>>>,
    }

    impl TestClient {
        fn respond(&self, status: u16, body: impl Into<Vec<u8>>) {
            self.responses.lock().push_back(Ok(HttpResponse {
                status,
                body: body.into(),
            }));
        }

        fn fail(&self, failure: TransportFailure) {
            self.responses.lock().push_back(Err(failure));
        }

        fn last_request(&self) -> HttpRequest {
            self.requests.lock().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl HttpClient for TestClient {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportFailure> {
            self.requests.lock().push(request);
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(TransportFailure::Connection("no response set".into())))
        }
    }

    fn remote() -> RestRemote<TestClient> {
        RestRemote::new("https://cupnote.example.com/", "anon-key", TestClient::default())
    }

    fn row(payload: u32) -> RemoteRecord<u32> {
        let local = SyncRecord::new_at(payload, Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        RemoteRecord::from_local("user-1", &local)
    }

    #[tokio::test]
    async fn upsert_request_shape() {
        let remote = remote();
        let record = row(7);
        remote
            .client
            .respond(201, serde_json::to_vec(&[&record]).unwrap());

        let stored = remote.upsert(RecordType::Tasting, record.clone()).await.unwrap();
        assert_eq!(stored, record);

        let request = remote.client.last_request();
        assert_eq!(request.method, Method::Post);
        assert_eq!(
            request.url,
            "https://cupnote.example.com/rest/v1/tasting_records?on_conflict=id"
        );
        assert_eq!(request.header("apikey"), Some("anon-key"));
        assert_eq!(request.header("authorization"), Some("Bearer anon-key"));
        assert_eq!(
            request.header("Prefer"),
            Some("resolution=merge-duplicates,return=representation")
        );

        let sent: Vec<RemoteRecord<u32>> =
            serde_json::from_slice(request.body.as_deref().unwrap()).unwrap();
        assert_eq!(sent, vec![record]);
    }

    #[tokio::test]
    async fn fetch_request_shape() {
        let remote = remote();
        remote.set_access_token(Some("session".into()));
        remote.client.respond(200, "[]");

        let since = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let rows: Vec<RemoteRecord<u32>> = remote
            .fetch_since(RecordType::LearningProgress, "user-1", Some(since))
            .await
            .unwrap();
        assert!(rows.is_empty());

        let request = remote.client.last_request();
        assert_eq!(request.method, Method::Get);
        assert_eq!(
            request.url,
            "https://cupnote.example.com/rest/v1/flavor_learning_progress\
             ?user_id=eq.user-1&order=modified_at.asc&modified_at=gte.2023-11-14T22%3A13%3A20.000000Z"
        );
        assert_eq!(request.header("Authorization"), Some("Bearer session"));
        assert!(request.body.is_none());
    }

    #[tokio::test]
    async fn fetch_escapes_user_id() {
        let remote = remote();
        remote.client.respond(200, "[]");

        let _: Vec<RemoteRecord<u32>> = remote
            .fetch_since(RecordType::Tasting, "a&b=c d", None)
            .await
            .unwrap();

        let url = remote.client.last_request().url;
        assert!(url.contains("?user_id=eq.a%26b%3Dc%20d&order="), "{url}");
    }

    #[tokio::test]
    async fn venue_visit_calls_procedure() {
        let remote = remote();
        remote.client.respond(204, "");

        RemoteClient::<u32>::increment_venue_visit(&remote, "user-1", VenueKind::Roaster, "Momos")
            .await
            .unwrap();

        let request = remote.client.last_request();
        assert_eq!(request.method, Method::Post);
        assert_eq!(
            request.url,
            "https://cupnote.example.com/rest/v1/rpc/increment_roaster_visit"
        );
        let args: serde_json::Value =
            serde_json::from_slice(request.body.as_deref().unwrap()).unwrap();
        assert_eq!(
            args,
            serde_json::json!({"user_uuid": "user-1", "roaster_name_param": "Momos"})
        );
        assert!(remote.last_error().is_none());

        remote.client.respond(404, "function not found");
        let err = RemoteClient::<u32>::increment_venue_visit(&remote, "user-1", VenueKind::Cafe, "Fritz")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Rejected { status: 404, .. }));
    }

    #[tokio::test]
    async fn echoed_row_keeps_backend_stamp() {
        let remote = remote();
        let record = row(7);
        let mut echoed = serde_json::to_value([&record]).unwrap();
        echoed[0]["modified_at"] = "2024-05-01T08:00:00.000001Z".into();
        remote.client.respond(201, echoed.to_string());

        let stored = remote.upsert(RecordType::Tasting, record.clone()).await.unwrap();
        assert_eq!(stored.version(), record.version());
        assert!(stored.modified_at.is_some());
    }

    #[tokio::test]
    async fn status_classification() {
        let remote = remote();
        remote.client.respond(401, "JWT expired");
        remote.client.respond(409, "duplicate key");
        remote.client.respond(503, "unavailable");

        let first = remote.upsert(RecordType::Tasting, row(1)).await.unwrap_err();
        assert!(matches!(first, SyncError::Unauthorized(ref m) if m == "JWT expired"));

        let second = remote.upsert(RecordType::Tasting, row(2)).await.unwrap_err();
        assert!(matches!(second, SyncError::Rejected { status: 409, .. }));
        assert!(!second.is_retryable());

        let third = remote.upsert(RecordType::Tasting, row(3)).await.unwrap_err();
        assert!(matches!(third, SyncError::Server { status: 503, .. }));
        assert!(third.is_retryable());
        assert!(remote.last_error().unwrap().contains("503"));
    }

    #[tokio::test]
    async fn transport_failures_are_retryable() {
        let remote = remote();
        remote.client.fail(TransportFailure::Connection("dns".into()));
        remote.client.fail(TransportFailure::Timeout(Duration::from_secs(5)));

        let first: SyncResult<Vec<RemoteRecord<u32>>> =
            remote.fetch_since(RecordType::Tasting, "user-1", None).await;
        assert!(matches!(first, Err(SyncError::Network(_))));

        let second: SyncResult<Vec<RemoteRecord<u32>>> =
            remote.fetch_since(RecordType::Tasting, "user-1", None).await;
        assert!(matches!(second, Err(SyncError::Timeout(_))));
    }

    #[tokio::test]
    async fn malformed_body_is_a_codec_error() {
        let remote = remote();
        remote.client.respond(200, "not json");

        let result: SyncResult<Vec<RemoteRecord<u32>>> =
            remote.fetch_since(RecordType::Tasting, "user-1", None).await;
        assert!(matches!(result, Err(SyncError::Codec(_))));
        assert!(remote.last_error().is_some());
    }
}
