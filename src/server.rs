use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::logging::SharedAccessLog;
use crate::providers::Dialect;
use crate::relay::relay;
use crate::session::ProxySession;
use crate::transform::ChatRequest;
use crate::upstream::{UpstreamClient, UpstreamResponse};

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

const SERVICE_NAME: &str = "prompt-cache-proxy";

/// Long-context requests easily exceed axum's 2 MiB default.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

pub struct AppState {
    pub config: ProxyConfig,
    pub upstream: UpstreamClient,
    pub access_log: SharedAccessLog,
    /// Cancelled on server shutdown; every session token is a child of it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: ProxyConfig, upstream: UpstreamClient, access_log: SharedAccessLog) -> Self {
        Self {
            config,
            upstream,
            access_log,
            shutdown: CancellationToken::new(),
        }
    }

    fn dialect(&self) -> Dialect {
        self.upstream.target().dialect
    }

    fn open_session(&self) -> ProxySession {
        ProxySession::new(
            self.dialect(),
            self.shutdown.child_token(),
            self.upstream.pool().clone(),
            self.access_log.clone(),
        )
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(state.dialect().chat_path(), post(handle_chat))
        .route("/v1/models", get(handle_models))
        .route("/health", get(handle_health))
        .route("/", get(handle_root))
        .fallback(handle_not_found)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut session = state.open_session();

    let request = match parse_request(&headers, &body) {
        Ok(r) => r,
        Err(e) => return session.fail(e),
    };

    let streaming = request.is_streaming();
    session.describe(request.model(), streaming);

    tracing::info!(
        session = %session.id(),
        model = request.model().unwrap_or("-"),
        streaming,
        messages = request.messages().len(),
        inbound_auth = headers.contains_key("authorization") || headers.contains_key("x-api-key"),
        "Chat request"
    );

    let upstream_body = prepare_upstream_body(request, &state);

    match state.upstream.send(&upstream_body, streaming, &headers).await {
        Ok(UpstreamResponse::Buffered {
            status,
            headers,
            body,
        }) => {
            session.finish_buffered(status, body.len());
            buffered_response(status, headers, body)
        }
        Ok(UpstreamResponse::Streaming(frames)) => streaming_response(relay(frames, session)),
        Err(e) => session.fail(e),
    }
}

/// Decode the inbound body, rejecting anything the pipeline cannot rewrite.
fn parse_request(headers: &HeaderMap, body: &[u8]) -> Result<ChatRequest> {
    if let Some(content_type) = headers.get(CONTENT_TYPE) {
        let content_type = content_type.to_str().unwrap_or_default().to_ascii_lowercase();
        if !content_type.starts_with("application/json") {
            return Err(ProxyError::malformed(
                "Content-Type must be application/json",
            ));
        }
    }

    let request = ChatRequest::parse(body)?;
    if request.messages().is_empty() {
        return Err(ProxyError::malformed("messages must be a non-empty array"));
    }
    Ok(request)
}

fn prepare_upstream_body(mut request: ChatRequest, state: &AppState) -> serde_json::Value {
    let dropped = request.drop_params(&state.config.params.drop);
    if !dropped.is_empty() {
        tracing::debug!(?dropped, "Dropped request parameters");
    }
    request.apply_cache_control(&state.upstream.target().cache_control);
    request.into_value()
}

fn buffered_response(status: u16, headers: HeaderMap, body: Bytes) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    *response.headers_mut() = headers;
    response
        .headers_mut()
        .entry(CONTENT_TYPE)
        .or_insert(HeaderValue::from_static("application/json"));
    response
}

fn streaming_response(
    body: impl futures::Stream<Item = std::result::Result<Bytes, std::convert::Infallible>>
        + Send
        + 'static,
) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn handle_models(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let provider = &state.upstream.target().provider;
    let models = &state.config.models;

    let body = match state.dialect() {
        Dialect::Anthropic => {
            let data: Vec<serde_json::Value> = models
                .iter()
                .map(|id| {
                    serde_json::json!({
                        "type": "model",
                        "id": id,
                        "display_name": id,
                    })
                })
                .collect();
            serde_json::json!({
                "data": data,
                "has_more": false,
                "first_id": models.first(),
                "last_id": models.last(),
            })
        }
        Dialect::OpenAi => {
            let data: Vec<serde_json::Value> = models
                .iter()
                .map(|id| {
                    serde_json::json!({
                        "id": id,
                        "object": "model",
                        "owned_by": provider,
                    })
                })
                .collect();
            serde_json::json!({ "object": "list", "data": data })
        }
    };

    Json(body)
}

async fn handle_root(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let target = state.upstream.target();
    let chat_path = target.dialect.chat_path();

    let mut endpoints = serde_json::Map::new();
    endpoints.insert("/".into(), "Service information".into());
    endpoints.insert(
        chat_path.into(),
        format!("{} compatible chat endpoint (POST)", target.dialect).into(),
    );
    endpoints.insert("/v1/models".into(), "Configured models (GET)".into());
    endpoints.insert("/health".into(), "Health check".into());

    Json(serde_json::json!({
        "service": SERVICE_NAME,
        "status": "running",
        "provider": target.provider,
        "dialect": target.dialect,
        "endpoints": endpoints,
        "cache_control": target.cache_control.to_value(),
    }))
}

async fn handle_not_found(uri: Uri) -> ProxyError {
    ProxyError::not_found(uri.path())
}
