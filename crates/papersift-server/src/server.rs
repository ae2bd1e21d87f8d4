//! Axum adapter: maps the HTTP surface onto controller operations.

use std::{
    convert::Infallible,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use axum::{
    Json, Router,
    body::Body,
    extract::{
        ConnectInfo, DefaultBodyLimit, MatchedPath, Multipart, Path, Query, State,
        multipart::MultipartError,
    },
    http::{HeaderName, HeaderValue, Method, Request, StatusCode, header},
    middleware::{self, Next},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{delete, get, post},
};
use futures_util::StreamExt;
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota};
use serde::{Deserialize, Serialize, de::Deserializer};
use thiserror::Error;
use tokio::{net::TcpListener, sync::watch};
use tower_http::{
    classify::ServerErrorsFailureClass,
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use papersift_app::config::{CorsConfig, RateLimitConfig, ServerConfig};
use papersift_app::controller::{Controller, ControllerError, LIST_LIMIT_DEFAULT};
use papersift_app::document::{Document, DocumentStatus, StatusSnapshot};
use papersift_app::schema::Schema;
use papersift_app::services::{Services, VisionError};
use papersift_app::worker;

const API_PREFIX: &str = "/api/v1";
const HEALTH_STATUS: &str = "healthy";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_ID_HEADER: &str = "x-request-id";
const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
/// Slack on top of the upload ceiling for multipart framing.
const UPLOAD_BODY_SLACK: usize = 64 * 1024;

const ERROR_INVALID_FILE: &str = "invalid_file";
const ERROR_UPLOAD_TOO_LARGE: &str = "upload_too_large";
const ERROR_NOT_FOUND: &str = "not_found";
const ERROR_INVALID_STATE: &str = "invalid_state";
const ERROR_VALIDATION: &str = "validation_error";
const ERROR_RATE_LIMITED: &str = "rate_limited";
const ERROR_INTERNAL: &str = "internal_server_error";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("listen address may not be empty")]
    EmptyListenAddr,
    #[error("invalid listen address `{address}`: {source}")]
    InvalidListenAddr {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to determine local address: {source}")]
    LocalAddr {
        #[source]
        source: std::io::Error,
    },
    #[error("axum server error: {source}")]
    Serve {
        #[source]
        source: std::io::Error,
    },
    #[error("invalid CORS configuration: {reason}")]
    CorsConfig { reason: String },
}

#[derive(Clone)]
pub struct ApiState {
    pub controller: Controller,
}

type ApiStateHandle = Arc<ApiState>;

#[derive(Debug, Serialize, Copy, Clone, PartialEq, Eq)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct ApiErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_ms: Option<u64>,
}

#[derive(Debug, Clone)]
struct ApiError {
    status: StatusCode,
    body: ApiErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, error: &'static str, message: impl Into<String>) -> Self {
        ApiError {
            status,
            body: ApiErrorBody {
                error,
                message: message.into(),
                retry_after_ms: None,
            },
        }
    }

    fn validation(message: impl Into<String>) -> Self {
        ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, ERROR_VALIDATION, message)
    }

    fn bad_request(message: impl Into<String>) -> Self {
        ApiError::new(StatusCode::BAD_REQUEST, ERROR_VALIDATION, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        ApiError::new(StatusCode::NOT_FOUND, ERROR_NOT_FOUND, message)
    }

    fn internal() -> Self {
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ERROR_INTERNAL,
            "internal server error",
        )
    }

    fn rate_limited(retry_after_ms: u64) -> Self {
        let mut err = ApiError::new(
            StatusCode::TOO_MANY_REQUESTS,
            ERROR_RATE_LIMITED,
            "rate limit exceeded; retry after backoff",
        );
        err.body.retry_after_ms = Some(retry_after_ms);
        err
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<ControllerError> for ApiError {
    fn from(err: ControllerError) -> Self {
        match err {
            ControllerError::InvalidFile(message) => {
                ApiError::new(StatusCode::BAD_REQUEST, ERROR_INVALID_FILE, message)
            }
            ControllerError::UploadTooLarge { size, limit } => ApiError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                ERROR_UPLOAD_TOO_LARGE,
                format!("upload of {size} bytes exceeds the {limit} byte ceiling"),
            ),
            ControllerError::NotFound(id) => {
                ApiError::not_found(format!("document `{id}` not found"))
            }
            ControllerError::NoCompletedDocuments => {
                ApiError::not_found("none of the requested documents are completed")
            }
            ControllerError::InvalidState { id, status, reason } => ApiError::new(
                StatusCode::CONFLICT,
                ERROR_INVALID_STATE,
                format!("document `{id}` is {status}: {reason}"),
            ),
            ControllerError::UnknownSchema(name) => {
                ApiError::validation(format!("unknown schema `{name}`"))
            }
            ControllerError::Validation(message) => ApiError::validation(message),
            ControllerError::Vision(VisionError::RateLimited) => ApiError::rate_limited(1_000),
            other => {
                tracing::error!(error = %other, "controller operation failed");
                ApiError::internal()
            }
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        ApiError::bad_request(format!("malformed multipart body: {err}"))
    }
}

// ---------------------------------------------------------------------------
// Wire types

#[derive(Debug, Serialize)]
struct DocumentResponse {
    id: i64,
    original_filename: String,
    filename: String,
    file_size: u64,
    status: DocumentStatus,
    progress: f64,
    page_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    schema_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    created_at_ms: i64,
    updated_at_ms: i64,
}

impl From<&Document> for DocumentResponse {
    fn from(document: &Document) -> Self {
        Self {
            id: document.id,
            original_filename: document.original_filename.clone(),
            filename: document.stored_filename.clone(),
            file_size: document.file_size,
            status: document.status,
            progress: document.progress,
            page_count: document.page_count,
            schema_used: document.schema_used.clone(),
            error_message: document.error_message.clone(),
            created_at_ms: document.created_at_ms,
            updated_at_ms: document.updated_at_ms,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ProcessBody {
    #[serde(default)]
    schema: Option<String>,
    #[serde(default)]
    template_mode: bool,
}

#[derive(Debug, Serialize)]
struct ProcessReceipt {
    job_id: String,
    document_id: i64,
    status: &'static str,
    enqueued_at_ms: i64,
    message: &'static str,
}

#[derive(Debug, Deserialize)]
struct BatchProcessBody {
    document_ids: Vec<i64>,
    #[serde(default)]
    schema: Option<String>,
}

#[derive(Debug, Serialize)]
struct BatchProcessReceipt {
    status: &'static str,
    job_ids: Vec<String>,
    document_ids: Vec<i64>,
    skipped: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    skip: usize,
    limit: Option<usize>,
    status: Option<String>,
}

#[derive(Debug, Serialize)]
struct ListResponse {
    total: usize,
    skip: usize,
    limit: usize,
    documents: Vec<DocumentResponse>,
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    #[serde(default = "default_true")]
    include_metadata: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct IdsQuery {
    #[serde(default, deserialize_with = "deserialize_string_list")]
    document_ids: Vec<String>,
}

impl IdsQuery {
    fn parsed_ids(&self) -> Result<Vec<i64>, ApiError> {
        let expanded = expand_csv(&self.document_ids);
        if expanded.is_empty() {
            return Err(ApiError::bad_request("document_ids is required"));
        }
        expanded
            .iter()
            .map(|raw| {
                raw.parse::<i64>().map_err(|_| {
                    ApiError::bad_request(format!("invalid document id `{raw}`"))
                })
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct DetectBody {
    sample_image_base64: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Serialize)]
struct DetectResponse {
    detected_type: String,
    confidence: f64,
    suggested_fields: Vec<String>,
    resolved_schema: &'static Schema,
}

// ---------------------------------------------------------------------------
// Router

pub fn build_router(
    config: &ServerConfig,
    state: ApiStateHandle,
    max_upload_bytes: u64,
) -> Result<Router, ServerError> {
    let api = Router::new()
        .route("/documents/upload", post(upload_document))
        .route("/documents/process/{id}", post(process_document))
        .route("/documents/batch/process", post(batch_process))
        .route("/documents/batch/download/excel", get(batch_download))
        .route("/documents/template/download/excel", get(template_download))
        .route("/documents/{id}/status", get(document_status))
        .route("/documents/{id}/stream", get(stream_document))
        .route("/documents/{id}/download/excel", get(download_excel))
        .route("/documents/{id}", delete(delete_document))
        .route("/documents", get(list_documents))
        .route("/documents/", get(list_documents))
        .route("/schemas", get(list_schemas))
        .route("/schemas/", get(list_schemas))
        .route("/schemas/detect", post(detect_schema))
        .route("/schemas/{name}", get(get_schema))
        .route("/health", get(health));

    let mut router = Router::new()
        .nest(API_PREFIX, api)
        .route("/health", get(health))
        .fallback(not_found_handler)
        .layer(DefaultBodyLimit::max(
            max_upload_bytes as usize + UPLOAD_BODY_SLACK,
        ));

    if config.rate_limit.enabled {
        let limiter_state = RateLimitState::new(&config.rate_limit);
        router = router.layer(middleware::from_fn_with_state(
            limiter_state,
            rate_limit_middleware,
        ));
    }

    if config.cors.enabled {
        router = router.layer(build_cors_layer(&config.cors)?);
    }

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            let path = matched_path_or_uri(request);
            let request_id = request
                .headers()
                .get(REQUEST_ID_HEADER)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("-")
                .to_string();
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                path = %path,
                request_id = %request_id
            )
        })
        .on_response(
            |response: &Response, latency: Duration, span: &tracing::Span| {
                let status = response.status().as_u16();
                let latency_ms = latency.as_millis().min(u128::from(u64::MAX)) as u64;
                tracing::info!(parent: span, status, latency_ms, "request completed");
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, span: &tracing::Span| {
                let latency_ms = latency.as_millis().min(u128::from(u64::MAX)) as u64;
                tracing::error!(parent: span, latency_ms, error = %error, "request failed");
            },
        );
    router = router.layer(trace_layer);

    let request_id_header = HeaderName::from_static(REQUEST_ID_HEADER);
    router = router
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(SetRequestIdLayer::new(
            request_id_header,
            MakeRequestUuid,
        ));

    Ok(router.with_state(state))
}

fn matched_path_or_uri(request: &Request<Body>) -> String {
    request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string())
}

fn build_cors_layer(cors: &CorsConfig) -> Result<CorsLayer, ServerError> {
    let origins = cors
        .allow_origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin).map_err(|_| ServerError::CorsConfig {
                reason: format!("origin `{origin}` is not a valid header value"),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let methods = cors
        .allow_methods
        .iter()
        .map(|method| {
            Method::from_bytes(method.as_bytes()).map_err(|_| ServerError::CorsConfig {
                reason: format!("invalid method `{method}`"),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let headers = cors
        .allow_headers
        .iter()
        .map(|name| {
            HeaderName::from_bytes(name.as_bytes()).map_err(|_| ServerError::CorsConfig {
                reason: format!("invalid header `{name}`"),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(AllowMethods::list(methods))
        .allow_headers(AllowHeaders::list(headers))
        .max_age(Duration::from_secs(cors.max_age_secs)))
}

// ---------------------------------------------------------------------------
// Request rate limiting (per client IP, one bucket for the whole API)

#[derive(Clone)]
struct RateLimitState {
    limiter: Arc<DefaultKeyedRateLimiter<IpAddr>>,
}

impl RateLimitState {
    fn new(config: &RateLimitConfig) -> Arc<Self> {
        let quota = Quota::per_second(config.per_second).allow_burst(config.burst);
        Arc::new(Self {
            limiter: Arc::new(DefaultKeyedRateLimiter::keyed(quota)),
        })
    }
}

async fn rate_limit_middleware(
    State(state): State<Arc<RateLimitState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path();
    if path.ends_with("/health") {
        return next.run(request).await;
    }
    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
        .unwrap_or_else(|| IpAddr::from([0, 0, 0, 0]));

    match state.limiter.check_key(&ip) {
        Ok(()) => next.run(request).await,
        Err(negative) => {
            let now = DefaultClock::default().now();
            let wait = negative.wait_time_from(now);
            let mut response =
                ApiError::rate_limited(wait.as_millis() as u64).into_response();
            let secs = std::cmp::max(1u64, wait.as_millis() as u64 / 1_000);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
            response
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: HEALTH_STATUS,
    })
}

async fn not_found_handler(request: Request<Body>) -> ApiError {
    ApiError::not_found(format!("resource `{}` not found", request.uri().path()))
}

async fn upload_document(
    State(state): State<ApiStateHandle>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut payload: Option<(Vec<u8>, String)> = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or("upload.pdf").to_string();
        let bytes = field.bytes().await?;
        payload = Some((bytes.to_vec(), filename));
        break;
    }
    let Some((bytes, filename)) = payload else {
        return Err(ApiError::bad_request("multipart field `file` is required"));
    };

    let document = state.controller.upload(bytes, &filename).await?;
    Ok((
        StatusCode::CREATED,
        Json(DocumentResponse::from(&document)),
    )
        .into_response())
}

async fn process_document(
    State(state): State<ApiStateHandle>,
    Path(id): Path<i64>,
    body: Option<Json<ProcessBody>>,
) -> Result<Response, ApiError> {
    let Json(body) = body.unwrap_or_default();
    let receipt = state
        .controller
        .start_processing(id, body.schema, body.template_mode)?;
    let message = if receipt.already_queued {
        "document is already queued"
    } else {
        "document processing queued"
    };
    Ok((
        StatusCode::ACCEPTED,
        Json(ProcessReceipt {
            job_id: receipt.job_id,
            document_id: receipt.document_id,
            status: "queued",
            enqueued_at_ms: receipt.enqueued_at_ms,
            message,
        }),
    )
        .into_response())
}

async fn batch_process(
    State(state): State<ApiStateHandle>,
    Json(body): Json<BatchProcessBody>,
) -> Result<Response, ApiError> {
    let receipt = state
        .controller
        .batch_process(&body.document_ids, body.schema)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(BatchProcessReceipt {
            status: "queued",
            job_ids: receipt.job_ids,
            document_ids: receipt.accepted,
            skipped: receipt.skipped,
        }),
    )
        .into_response())
}

async fn document_status(
    State(state): State<ApiStateHandle>,
    Path(id): Path<i64>,
) -> Result<Json<StatusSnapshot>, ApiError> {
    Ok(Json(state.controller.get_status(id)?))
}

async fn stream_document(
    State(state): State<ApiStateHandle>,
    Path(id): Path<i64>,
) -> Result<Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let snapshots = state.controller.stream_status(id)?;
    let events = snapshots.map(|snapshot| {
        let event = Event::default()
            .event("status")
            .json_data(&snapshot)
            .unwrap_or_else(|_| Event::default().event("status").data("{}"));
        Ok::<Event, Infallible>(event)
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn list_documents(
    State(state): State<ApiStateHandle>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>, ApiError> {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(raw.parse::<DocumentStatus>().map_err(|_| {
            ApiError::bad_request(format!("unknown status filter `{raw}`"))
        })?),
    };
    let limit = query.limit.unwrap_or(LIST_LIMIT_DEFAULT);
    let page = state.controller.list(query.skip, limit, status)?;
    Ok(Json(ListResponse {
        total: page.total,
        skip: page.skip,
        limit: page.limit,
        documents: page.documents.iter().map(DocumentResponse::from).collect(),
    }))
}

async fn delete_document(
    State(state): State<ApiStateHandle>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.controller.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn download_excel(
    State(state): State<ApiStateHandle>,
    Path(id): Path<i64>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    let download = state.controller.download_single(id, query.include_metadata)?;
    Ok(workbook_response(download.bytes, &download.filename))
}

async fn batch_download(
    State(state): State<ApiStateHandle>,
    Query(query): Query<IdsQuery>,
) -> Result<Response, ApiError> {
    let ids = query.parsed_ids()?;
    let download = state.controller.download_batch(&ids)?;
    Ok(workbook_response(download.bytes, &download.filename))
}

async fn template_download(
    State(state): State<ApiStateHandle>,
    Query(query): Query<IdsQuery>,
) -> Result<Response, ApiError> {
    let ids = query.parsed_ids()?;
    let download = state.controller.download_template(&ids)?;
    Ok(workbook_response(download.bytes, &download.filename))
}

async fn list_schemas(State(state): State<ApiStateHandle>) -> Json<&'static [Schema]> {
    Json(state.controller.list_schemas())
}

async fn get_schema(
    State(state): State<ApiStateHandle>,
    Path(name): Path<String>,
) -> Result<Json<&'static Schema>, ApiError> {
    match state.controller.get_schema(&name) {
        Ok(schema) => Ok(Json(schema)),
        Err(ControllerError::UnknownSchema(name)) => {
            Err(ApiError::not_found(format!("schema `{name}` not found")))
        }
        Err(other) => Err(other.into()),
    }
}

async fn detect_schema(
    State(state): State<ApiStateHandle>,
    Json(body): Json<DetectBody>,
) -> Result<Json<DetectResponse>, ApiError> {
    use base64::Engine;
    let image = base64::engine::general_purpose::STANDARD
        .decode(body.sample_image_base64.trim())
        .map_err(|_| ApiError::validation("sample_image_base64 is not valid base64"))?;
    let outcome = state
        .controller
        .detect_schema(image, body.description.as_deref())
        .await?;
    Ok(Json(DetectResponse {
        detected_type: outcome.detection.schema_name,
        confidence: outcome.detection.confidence,
        suggested_fields: outcome.detection.suggested_fields,
        resolved_schema: outcome.resolved,
    }))
}

fn workbook_response(bytes: Vec<u8>, filename: &str) -> Response {
    let disposition = format!("attachment; filename={filename}");
    (
        [
            (header::CONTENT_TYPE, XLSX_CONTENT_TYPE.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response()
}

fn deserialize_string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => Ok(vec![value]),
        OneOrMany::Many(values) => Ok(values),
    }
}

fn expand_csv(values: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    for value in values {
        for part in value.split(',') {
            let trimmed = part.trim();
            if trimmed.is_empty() {
                continue;
            }
            out.push(trimmed.to_string());
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Serving and shutdown

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ShutdownEvent {
    CtrlC,
    SigTerm,
    ListenerFailed,
}

pub async fn serve(services: Arc<Services>, with_worker: bool) -> Result<(), ServerError> {
    let listen_addr = parse_listen_addr(&services.config.server.listen_addr)?;
    let listener = bind_listener(listen_addr).await?;
    let local_addr = listener
        .local_addr()
        .map_err(|source| ServerError::LocalAddr { source })?;
    tracing::info!(%local_addr, with_worker, "papersift server listening");

    let state = Arc::new(ApiState {
        controller: Controller::new(services.clone()),
    });
    let router = build_router(
        &services.config.server,
        state,
        services.config.upload.max_upload_bytes,
    )?;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        let event = wait_for_shutdown().await;
        tracing::info!(?event, "shutdown signal received; draining connections");
        let _ = stop_tx.send(true);
    });

    let worker_handle = if with_worker {
        Some(tokio::spawn(worker::run_pool(
            services.clone(),
            stop_rx.clone(),
        )))
    } else {
        None
    };

    let mut graceful_rx = stop_rx.clone();
    let server_future = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = graceful_rx.changed().await;
    });

    let mut drain_rx = stop_rx.clone();
    tokio::select! {
        result = server_future => {
            if let Err(source) = result {
                return Err(ServerError::Serve { source });
            }
        }
        _ = async {
            let _ = drain_rx.changed().await;
            tokio::time::sleep(DRAIN_TIMEOUT).await;
        } => {
            tracing::warn!(
                seconds = DRAIN_TIMEOUT.as_secs(),
                "graceful shutdown timed out; continuing shutdown"
            );
        }
    }

    if let Some(handle) = worker_handle {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "worker pool task failed");
        }
    }
    tracing::info!("server shutdown complete");
    Ok(())
}

pub async fn wait_for_shutdown() -> impl std::fmt::Debug {
    shutdown_event().await
}

async fn shutdown_event() -> ShutdownEvent {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => ShutdownEvent::CtrlC,
            Err(error) => {
                tracing::warn!(%error, "failed to capture Ctrl+C signal");
                ShutdownEvent::ListenerFailed
            }
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => match term.recv().await {
                Some(_) => ShutdownEvent::SigTerm,
                None => ShutdownEvent::ListenerFailed,
            },
            Err(error) => {
                tracing::warn!(%error, "failed to capture SIGTERM");
                ShutdownEvent::ListenerFailed
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending();

    tokio::select! {
        event = ctrl_c => event,
        event = sigterm => event,
    }
}

fn parse_listen_addr(addr: &str) -> Result<SocketAddr, ServerError> {
    let trimmed = addr.trim();
    if trimmed.is_empty() {
        return Err(ServerError::EmptyListenAddr);
    }
    trimmed
        .parse()
        .map_err(|source| ServerError::InvalidListenAddr {
            address: trimmed.to_string(),
            source,
        })
}

async fn bind_listener(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            address: addr.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use std::num::NonZeroU32;
    use papersift_app::config::{
        AppConfig, BlobBackend, ProcessingConfig, StorageConfig, UploadConfig, VisionConfig,
    };
    use papersift_app::paths::AppPaths;
    use papersift_app::services::build_services;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_config() -> AppConfig {
        AppConfig {
            server: ServerConfig {
                listen_addr: "127.0.0.1:0".to_string(),
                cors: CorsConfig::default(),
                rate_limit: RateLimitConfig::default(),
            },
            storage: StorageConfig {
                backend: BlobBackend::Local,
                path: None,
                s3: None,
            },
            upload: UploadConfig {
                max_upload_bytes: 1_048_576,
            },
            processing: ProcessingConfig {
                max_pages: 100,
                worker_concurrency: 1,
                timeout_seconds: 3_600,
                page_call_timeout_seconds: 5,
                render_width: 512,
            },
            vision: VisionConfig {
                base_url: "http://127.0.0.1:9".to_string(),
                model: "test-model".to_string(),
                api_key: Some("test-key".to_string()),
                ocr_model: None,
                rate_limit_per_minute: NonZeroU32::new(600).expect("non-zero"),
            },
        }
    }

    fn test_router(temp: &TempDir) -> Router {
        let paths = AppPaths::new(temp.path()).expect("paths");
        let services = build_services(test_config(), &paths).expect("services");
        let state = Arc::new(ApiState {
            controller: Controller::new(services.clone()),
        });
        build_router(
            &services.config.server,
            state,
            services.config.upload.max_upload_bytes,
        )
        .expect("router builds")
    }

    fn multipart_pdf(filename: &str, content: &[u8]) -> (String, Vec<u8>) {
        let boundary = "X-PAPERSIFT-TEST";
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: application/pdf\r\n\r\n");
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
        (format!("multipart/form-data; boundary={boundary}"), body)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body collects")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("body is json")
    }

    async fn upload(router: &Router, filename: &str, content: &[u8]) -> Response {
        let (content_type, body) = multipart_pdf(filename, content);
        router
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/api/v1/documents/upload")
                    .header(header::CONTENT_TYPE, content_type)
                    .body(Body::from(body))
                    .expect("request builds"),
            )
            .await
            .expect("request succeeds")
    }

    #[tokio::test]
    async fn health_reports_healthy() {
        let temp = TempDir::new().expect("temp dir");
        let router = test_router(&temp);
        for uri in ["/health", "/api/v1/health"] {
            let response = router
                .clone()
                .oneshot(
                    Request::builder()
                        .uri(uri)
                        .body(Body::empty())
                        .expect("request builds"),
                )
                .await
                .expect("request succeeds");
            assert_eq!(response.status(), StatusCode::OK);
            let json = body_json(response).await;
            assert_eq!(json["status"], "healthy");
        }
    }

    #[tokio::test]
    async fn upload_then_status_round_trip() {
        let temp = TempDir::new().expect("temp dir");
        let router = test_router(&temp);

        let response = upload(&router, "invoice.pdf", b"%PDF-1.4 test payload").await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let json = body_json(response).await;
        assert_eq!(json["status"], "pending");
        assert_eq!(json["original_filename"], "invoice.pdf");
        let id = json["id"].as_i64().expect("id");

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/v1/documents/{id}/status"))
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("request succeeds");
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["document_id"].as_i64(), Some(id));
        assert_eq!(json["status"], "pending");
        assert_eq!(json["progress"].as_f64(), Some(0.0));
    }

    #[tokio::test]
    async fn duplicate_upload_returns_same_id() {
        let temp = TempDir::new().expect("temp dir");
        let router = test_router(&temp);

        let first = body_json(upload(&router, "a.pdf", b"%PDF-1.4 same").await).await;
        let second = body_json(upload(&router, "b.pdf", b"%PDF-1.4 same").await).await;
        assert_eq!(first["id"], second["id"]);
    }

    #[tokio::test]
    async fn non_pdf_upload_is_rejected() {
        let temp = TempDir::new().expect("temp dir");
        let router = test_router(&temp);
        let response = upload(&router, "notes.txt", b"plain text").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"], "invalid_file");
    }

    #[tokio::test]
    async fn oversize_upload_yields_413() {
        let temp = TempDir::new().expect("temp dir");
        let router = test_router(&temp);
        let mut content = b"%PDF-1.4 ".to_vec();
        content.resize(1_048_577, b'x');
        let response = upload(&router, "big.pdf", &content).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn process_queues_and_second_request_is_idempotent() {
        let temp = TempDir::new().expect("temp dir");
        let router = test_router(&temp);
        let uploaded = body_json(upload(&router, "doc.pdf", b"%PDF-1.4 queue me").await).await;
        let id = uploaded["id"].as_i64().expect("id");

        let request = || {
            Request::builder()
                .method(Method::POST)
                .uri(format!("/api/v1/documents/process/{id}"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"schema": "invoice"}"#))
                .expect("request builds")
        };

        let first = router.clone().oneshot(request()).await.expect("request");
        assert_eq!(first.status(), StatusCode::ACCEPTED);
        let first_json = body_json(first).await;
        assert_eq!(first_json["status"], "queued");

        let second = router.clone().oneshot(request()).await.expect("request");
        assert_eq!(second.status(), StatusCode::ACCEPTED);
        let second_json = body_json(second).await;
        assert_eq!(second_json["job_id"], first_json["job_id"]);
    }

    #[tokio::test]
    async fn unknown_schema_fails_validation() {
        let temp = TempDir::new().expect("temp dir");
        let router = test_router(&temp);
        let uploaded = body_json(upload(&router, "doc.pdf", b"%PDF-1.4 schema").await).await;
        let id = uploaded["id"].as_i64().expect("id");

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri(format!("/api/v1/documents/process/{id}"))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"schema": "ledger"}"#))
                    .expect("request builds"),
            )
            .await
            .expect("request succeeds");
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn unknown_document_is_404() {
        let temp = TempDir::new().expect("temp dir");
        let router = test_router(&temp);
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/documents/999/status")
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("request succeeds");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn download_before_completion_conflicts() {
        let temp = TempDir::new().expect("temp dir");
        let router = test_router(&temp);
        let uploaded = body_json(upload(&router, "doc.pdf", b"%PDF-1.4 early").await).await;
        let id = uploaded["id"].as_i64().expect("id");

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/v1/documents/{id}/download/excel"))
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("request succeeds");
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let json = body_json(response).await;
        assert_eq!(json["error"], "invalid_state");
    }

    #[tokio::test]
    async fn listing_paginates_and_filters() {
        let temp = TempDir::new().expect("temp dir");
        let router = test_router(&temp);
        for idx in 0..3 {
            upload(
                &router,
                &format!("doc{idx}.pdf"),
                format!("%PDF-1.4 doc {idx}").as_bytes(),
            )
            .await;
        }

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/documents/?skip=1&limit=1&status=pending")
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("request succeeds");
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["total"].as_u64(), Some(3));
        assert_eq!(json["documents"].as_array().expect("array").len(), 1);
        assert_eq!(json["documents"][0]["id"].as_i64(), Some(2));
    }

    #[tokio::test]
    async fn invalid_status_filter_is_400() {
        let temp = TempDir::new().expect("temp dir");
        let router = test_router(&temp);
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/documents/?status=bogus")
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("request succeeds");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn delete_removes_document() {
        let temp = TempDir::new().expect("temp dir");
        let router = test_router(&temp);
        let uploaded = body_json(upload(&router, "doc.pdf", b"%PDF-1.4 delete me").await).await;
        let id = uploaded["id"].as_i64().expect("id");

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::DELETE)
                    .uri(format!("/api/v1/documents/{id}"))
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("request succeeds");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/v1/documents/{id}/status"))
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("request succeeds");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn schemas_are_listed_and_fetched() {
        let temp = TempDir::new().expect("temp dir");
        let router = test_router(&temp);

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/schemas/")
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("request succeeds");
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let names: Vec<&str> = json
            .as_array()
            .expect("array")
            .iter()
            .filter_map(|schema| schema["name"].as_str())
            .collect();
        assert!(names.contains(&"invoice"));
        assert!(names.contains(&"receipt"));
        assert!(names.contains(&"generic"));

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/schemas/invoice")
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("request succeeds");
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/schemas/ledger")
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("request succeeds");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn batch_download_requires_ids() {
        let temp = TempDir::new().expect("temp dir");
        let router = test_router(&temp);
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/documents/batch/download/excel")
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("request succeeds");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn csv_ids_expand() {
        let query = IdsQuery {
            document_ids: vec!["1,2".to_string(), "3".to_string()],
        };
        assert_eq!(query.parsed_ids().expect("parses"), vec![1, 2, 3]);

        let bad = IdsQuery {
            document_ids: vec!["1,abc".to_string()],
        };
        assert!(bad.parsed_ids().is_err());
    }
}
