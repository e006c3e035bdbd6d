use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    error::Error,
    lifecycle::{
        ConsumeResult, Created, DecryptedPayload, ExpiryRule, Revealed, Vault, DEFAULT_MIME,
    },
    AppState,
};

/// Same body for unknown, expired and burned links.
const GONE_MESSAGE: &str = "this link is no longer available";

pub const VIEWS_REMAINING_HEADER: &str = "x-burnlink-views-remaining";

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health(State(state): State<AppState>) -> Response {
    match run_blocking(&state, |vault| Ok(vault.store().count()?)).await {
        Ok(secrets) => Json(json!({"status": "ok", "secrets": secrets})).into_response(),
        Err(response) => response,
    }
}

// ── Create ────────────────────────────────────────────────────────────────────

/// Limits as accepted on the wire. `ttl_seconds` wins over the
/// `expiry_value` + `expiry_unit` pair.
#[derive(Debug, Default, Deserialize)]
pub struct ExpiryParams {
    pub ttl_seconds: Option<u64>,
    pub expiry_value: Option<u64>,
    pub expiry_unit: Option<String>,
    pub max_views: Option<u32>,
}

impl ExpiryParams {
    fn rule(&self) -> crate::Result<ExpiryRule> {
        let ttl_seconds = match (self.ttl_seconds, self.expiry_value) {
            (Some(ttl), _) => Some(ttl),
            (None, Some(value)) => {
                ExpiryRule::ttl_from_value_unit(value, self.expiry_unit.as_deref())?
            }
            (None, None) => None,
        };
        Ok(ExpiryRule::new(ttl_seconds, self.max_views))
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    /// Missing and empty are both rejected with 400.
    #[serde(default)]
    pub content: String,
    #[serde(flatten)]
    pub expiry: ExpiryParams,
}

#[derive(Debug, Serialize)]
pub struct CreateResponse {
    #[serde(flatten)]
    pub created: Created,
    pub url: String,
}

pub async fn create_secret(
    State(state): State<AppState>,
    Json(body): Json<CreateRequest>,
) -> Response {
    if body.content.is_empty() {
        return bad_request("content required");
    }
    let rule = match body.expiry.rule() {
        Ok(rule) => rule,
        Err(e) => return engine_error(e),
    };
    let content = body.content;
    match run_blocking(&state, move |vault| vault.create_text_secret(&content, rule)).await {
        Ok(created) => created_response(&state, created),
        Err(response) => response,
    }
}

/// Query string of an upload. Kept flat: numbers do not survive
/// `#[serde(flatten)]` in urlencoded input.
#[derive(Debug, Deserialize)]
pub struct UploadParams {
    pub filename: Option<String>,
    pub ttl_seconds: Option<u64>,
    pub expiry_value: Option<u64>,
    pub expiry_unit: Option<String>,
    pub max_views: Option<u32>,
}

impl UploadParams {
    fn expiry(&self) -> ExpiryParams {
        ExpiryParams {
            ttl_seconds: self.ttl_seconds,
            expiry_value: self.expiry_value,
            expiry_unit: self.expiry_unit.clone(),
            max_views: self.max_views,
        }
    }
}

/// Raw request body is the file; `Content-Type` is kept as its MIME type.
pub async fn upload_file(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if body.is_empty() {
        return bad_request("file body required");
    }
    let rule = match params.expiry().rule() {
        Ok(rule) => rule,
        Err(e) => return engine_error(e),
    };
    let mime_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let filename = params.filename.unwrap_or_default();

    let created = run_blocking(&state, move |vault| {
        vault.create_file_secret(&body, &filename, mime_type.as_deref(), rule)
    })
    .await;
    match created {
        Ok(created) => created_response(&state, created),
        Err(response) => response,
    }
}

fn created_response(state: &AppState, created: Created) -> Response {
    let url = format!("{}/api/secrets/{}", state.public_url, created.id);
    (
        StatusCode::CREATED,
        Json(CreateResponse { created, url }),
    )
        .into_response()
}

// ── Open ──────────────────────────────────────────────────────────────────────

/// Counts a view. Text comes back as JSON, files as a download.
pub async fn open_secret(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match run_blocking(&state, move |vault| vault.consume(&id)).await {
        Ok(ConsumeResult::Revealed(revealed)) => reveal_response(revealed),
        Ok(ConsumeResult::Expired(_) | ConsumeResult::NotFound) => gone(),
        Err(response) => response,
    }
}

fn reveal_response(revealed: Revealed) -> Response {
    let Revealed {
        payload,
        views_remaining,
    } = revealed;

    let mut response = match payload {
        DecryptedPayload::Text(text) => Json(json!({
            "kind": "text",
            "content": text.as_str(),
            "views_remaining": views_remaining,
        }))
        .into_response(),
        DecryptedPayload::File {
            mut bytes,
            filename,
            mime_type,
        } => {
            let content_type = HeaderValue::from_str(&mime_type)
                .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_MIME));
            // Moved without a copy; the body buffer is not zeroized once handed off.
            let mut response = Response::new(Body::from(std::mem::take(&mut *bytes)));
            let headers = response.headers_mut();
            headers.insert(header::CONTENT_TYPE, content_type);
            if let Ok(disposition) =
                HeaderValue::from_str(&format!("attachment; filename=\"{filename}\""))
            {
                headers.insert(header::CONTENT_DISPOSITION, disposition);
            }
            if let Some(remaining) = views_remaining {
                headers.insert(VIEWS_REMAINING_HEADER, HeaderValue::from(remaining));
            }
            response
        }
    };
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

// ── Sweep ─────────────────────────────────────────────────────────────────────

pub async fn sweep(State(state): State<AppState>) -> Response {
    match run_blocking(&state, |vault| vault.run_sweep()).await {
        Ok(report) => Json(report).into_response(),
        Err(response) => response,
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Run a vault call on the blocking pool; storage and blob I/O are synchronous.
async fn run_blocking<T, F>(state: &AppState, f: F) -> Result<T, Response>
where
    F: FnOnce(Vault) -> crate::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let vault = state.vault.clone();
    match tokio::task::spawn_blocking(move || f(vault)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(engine_error(e)),
        Err(e) => Err(internal_error(anyhow::Error::new(e).context("vault task failed"))),
    }
}

fn gone() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({"error": GONE_MESSAGE}))).into_response()
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": message.into()})),
    )
        .into_response()
}

fn engine_error(e: Error) -> Response {
    match e {
        Error::InvalidExpiryRule(message) => bad_request(message),
        other => internal_error(other.into()),
    }
}

fn internal_error(e: anyhow::Error) -> Response {
    tracing::error!(error = %e, "internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal server error"})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{lifecycle::Vault, server::router, store::crypto, store::Store};
    use axum::{http::Request, Router};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    fn app() -> (Router, TempDir) {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let state = AppState {
            vault: Vault::new(store, crypto::generate_key()),
            public_url: "http://links.test".into(),
        };
        (router(state, 1024), dir)
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, headers, body)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn json_body(bytes: &Bytes) -> Value {
        serde_json::from_slice(bytes).unwrap()
    }

    async fn create(app: &Router, body: Value) -> Value {
        let (status, _, bytes) = send(app, post_json("/api/secrets", body)).await;
        assert_eq!(status, StatusCode::CREATED);
        json_body(&bytes)
    }

    #[tokio::test]
    async fn health_reports_count() {
        let (app, _dir) = app();
        create(&app, json!({"content": "x", "max_views": 1})).await;
        let (status, _, body) = send(&app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(&body), json!({"status": "ok", "secrets": 1}));
    }

    #[tokio::test]
    async fn text_secret_reads_once() {
        let (app, _dir) = app();
        let created = create(&app, json!({"content": "hello", "max_views": 1})).await;
        let id = created["id"].as_str().unwrap();
        assert_eq!(created["kind"], "text");
        assert_eq!(created["url"], format!("http://links.test/api/secrets/{id}"));

        let (status, headers, body) = send(&app, get(&format!("/api/secrets/{id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CACHE_CONTROL], "no-store");
        assert_eq!(
            json_body(&body),
            json!({"kind": "text", "content": "hello", "views_remaining": 0})
        );

        let (status, _, body) = send(&app, get(&format!("/api/secrets/{id}"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json_body(&body), json!({"error": GONE_MESSAGE}));
    }

    #[tokio::test]
    async fn expired_and_unknown_look_identical() {
        let (app, _dir) = app();
        let created = create(&app, json!({"content": "short-lived", "ttl_seconds": 0})).await;
        let uri = format!("/api/secrets/{}", created["id"].as_str().unwrap());
        let expired = send(&app, get(&uri)).await;
        let unknown = send(&app, get("/api/secrets/AAAAAAAAAAAAAAAAAAAAAA")).await;
        let malformed = send(&app, get("/api/secrets/nope")).await;

        for (status, _, body) in [&expired, &unknown, &malformed] {
            assert_eq!(*status, StatusCode::NOT_FOUND);
            assert_eq!(body, &expired.2);
        }
    }

    #[tokio::test]
    async fn value_and_unit_become_a_ttl() {
        let (app, _dir) = app();
        let created = create(
            &app,
            json!({"content": "x", "expiry_value": 2, "expiry_unit": "hours"}),
        )
        .await;
        let created_at = created["created_at"].as_i64().unwrap();
        assert_eq!(created["expires_at"].as_i64().unwrap(), created_at + 7_200_000);
        assert_eq!(created["max_views"], Value::Null);
    }

    #[tokio::test]
    async fn bad_requests() {
        let (app, _dir) = app();
        for body in [
            json!({"content": "no limits"}),
            json!({"content": "x", "max_views": 0}),
            json!({"content": "x", "ttl_seconds": 400 * 24 * 3600}),
            json!({"content": "", "max_views": 1}),
        ] {
            let (status, _, bytes) = send(&app, post_json("/api/secrets", body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert!(json_body(&bytes)["error"].is_string());
        }
    }

    #[tokio::test]
    async fn missing_content_is_a_bad_request() {
        let (app, _dir) = app();
        let (status, _, bytes) =
            send(&app, post_json("/api/secrets", json!({"max_views": 1}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json_body(&bytes), json!({"error": "content required"}));
    }

    #[tokio::test]
    async fn file_upload_downloads_once() {
        let (app, _dir) = app();
        let req = Request::builder()
            .method("POST")
            .uri("/api/files?filename=..%2Fquarterly%20report.pdf&max_views=2")
            .header(header::CONTENT_TYPE, "application/pdf")
            .body(Body::from(&b"%PDF-1.7 fake"[..]))
            .unwrap();
        let (status, _, bytes) = send(&app, req).await;
        assert_eq!(status, StatusCode::CREATED);
        let created = json_body(&bytes);
        assert_eq!(created["kind"], "file");
        let uri = format!("/api/secrets/{}", created["id"].as_str().unwrap());

        let (status, headers, body) = send(&app, get(&uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"%PDF-1.7 fake");
        assert_eq!(headers[header::CONTENT_TYPE], "application/pdf");
        assert_eq!(
            headers[header::CONTENT_DISPOSITION],
            "attachment; filename=\"quarterly_report.pdf\""
        );
        assert_eq!(headers[VIEWS_REMAINING_HEADER], "1");

        let (status, headers, body) = send(&app, get(&uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"%PDF-1.7 fake");
        assert_eq!(headers[VIEWS_REMAINING_HEADER], "0");

        let (status, _, _) = send(&app, get(&uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn upload_without_type_or_name_gets_defaults() {
        let (app, _dir) = app();
        let req = Request::builder()
            .method("POST")
            .uri("/api/files?ttl_seconds=60")
            .body(Body::from(vec![1u8, 2, 3]))
            .unwrap();
        let (status, _, bytes) = send(&app, req).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = json_body(&bytes)["id"].as_str().unwrap().to_owned();

        let (_, headers, body) = send(&app, get(&format!("/api/secrets/{id}"))).await;
        assert_eq!(&body[..], &[1u8, 2, 3]);
        assert_eq!(headers[header::CONTENT_TYPE], DEFAULT_MIME);
        assert_eq!(
            headers[header::CONTENT_DISPOSITION],
            format!("attachment; filename=\"{id}.bin\"").as_str()
        );
        assert!(headers.get(VIEWS_REMAINING_HEADER).is_none());
    }

    #[tokio::test]
    async fn oversized_and_empty_uploads_are_rejected() {
        let (app, _dir) = app();
        let big = Request::builder()
            .method("POST")
            .uri("/api/files?max_views=1")
            .body(Body::from(vec![0u8; 4096]))
            .unwrap();
        let (status, _, _) = send(&app, big).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);

        let empty = Request::builder()
            .method("POST")
            .uri("/api/files?max_views=1")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(&app, empty).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn sweep_reports_counts() {
        let (app, _dir) = app();
        create(&app, json!({"content": "dead", "ttl_seconds": 0})).await;
        create(&app, json!({"content": "alive", "ttl_seconds": 600})).await;

        let req = Request::builder()
            .method("POST")
            .uri("/api/sweep")
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        let report = json_body(&body);
        assert_eq!(report["deleted"], 1);
        assert_eq!(report["orphaned_blobs"], 0);

        let (_, _, body) = send(&app, get("/health")).await;
        assert_eq!(json_body(&body)["secrets"], 1);
    }
}
