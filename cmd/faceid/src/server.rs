//! HTTP and WebSocket transport.
//!
//! API endpoints:
//! - GET  /livez                     - process is up
//! - GET  /readyz                    - 503 once shutdown has begun
//! - POST /enroll?identity=ID        - body: image bytes
//! - POST /verify[?threshold=T]      - body: image bytes
//! - POST /remove?identity=ID
//! - POST /clear                     - remove every identity
//! - POST /represent                 - body: image bytes, returns the embedding
//! - GET  /faces/count
//! - GET  /ws/{client_id}[?threshold=T] - one verification per binary frame
//!
//! Every route except the health checks requires `Authorization: Bearer <token>`
//! when tokens are configured.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, Path, Query, Request, State,
    },
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use faceid_service::{ServiceError, Verdict, VerificationService};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

/// Largest accepted image upload.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone)]
struct AppState {
    service: Arc<VerificationService>,
    tokens: Arc<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct IdentityQuery {
    identity: String,
}

#[derive(Debug, Deserialize)]
struct VerifyQuery {
    threshold: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "result", rename_all = "snake_case")]
enum VerifyResponse {
    Match { identity: String, score: f32 },
    NoMatch,
}

impl From<Verdict> for VerifyResponse {
    fn from(v: Verdict) -> Self {
        match v {
            Verdict::Match(m) => VerifyResponse::Match {
                identity: m.identity,
                score: m.score,
            },
            Verdict::NoMatch => VerifyResponse::NoMatch,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct OkResponse {
    ok: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct CountResponse {
    count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorBody {
    error: String,
    message: String,
}

impl From<&ServiceError> for ErrorBody {
    fn from(e: &ServiceError) -> Self {
        Self {
            error: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

/// A service error rendered as a JSON response.
struct ApiError(ServiceError);

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_of(&self.0);
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        } else {
            debug!(error = %self.0, "request rejected");
        }
        (status, Json(ErrorBody::from(&self.0))).into_response()
    }
}

fn status_of(e: &ServiceError) -> StatusCode {
    match e.code() {
        "duplicate_identity" => StatusCode::CONFLICT,
        "not_found" => StatusCode::NOT_FOUND,
        "dimension_mismatch" | "invalid_identity" | "invalid_input" => StatusCode::BAD_REQUEST,
        "no_face_detected"
        | "alignment_failed"
        | "invalid_image"
        | "model_error"
        | "invalid_embedding" => StatusCode::UNPROCESSABLE_ENTITY,
        "timeout" => StatusCode::GATEWAY_TIMEOUT,
        "unavailable" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Build the router. Split from [`serve`] for tests.
fn router(service: Arc<VerificationService>, tokens: Vec<String>) -> Router {
    let state = AppState {
        service,
        tokens: Arc::new(tokens),
    };

    let api = Router::new()
        .route("/enroll", post(enroll))
        .route("/verify", post(verify))
        .route("/remove", post(remove))
        .route("/clear", post(clear))
        .route("/represent", post(represent))
        .route("/faces/count", get(count))
        .route("/ws/{client_id}", get(ws_verify))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/livez", get(livez))
        .route("/readyz", get(readyz))
        .merge(api)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves, then stop accepting connections and
/// let in-flight requests finish.
pub async fn serve(
    service: Arc<VerificationService>,
    tokens: Vec<String>,
    addr: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = parse_addr(addr)?;
    let app = router(service, tokens);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "server: listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("server: stopped accepting requests");
    Ok(())
}

fn parse_addr(addr: &str) -> Result<SocketAddr> {
    let addr = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    Ok(addr.parse()?)
}

async fn require_token(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if state.tokens.is_empty() {
        return next.run(req).await;
    }

    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match presented {
        Some(token) if state.tokens.iter().any(|t| t == token) => next.run(req).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(ErrorBody {
                error: "unauthorized".into(),
                message: "missing or invalid bearer token".into(),
            }),
        )
            .into_response(),
    }
}

async fn livez() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    if state.service.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting down")
    }
}

async fn enroll(
    State(state): State<AppState>,
    Query(q): Query<IdentityQuery>,
    body: Bytes,
) -> Result<Json<OkResponse>, ApiError> {
    state.service.enroll(&q.identity, body.to_vec()).await?;
    Ok(Json(OkResponse { ok: true }))
}

async fn verify(
    State(state): State<AppState>,
    Query(q): Query<VerifyQuery>,
    body: Bytes,
) -> Result<Json<VerifyResponse>, ApiError> {
    let verdict = state.service.verify(body.to_vec(), q.threshold).await?;
    Ok(Json(verdict.into()))
}

async fn remove(
    State(state): State<AppState>,
    Query(q): Query<IdentityQuery>,
) -> Result<Json<OkResponse>, ApiError> {
    state.service.remove(&q.identity).await?;
    Ok(Json(OkResponse { ok: true }))
}

async fn clear(State(state): State<AppState>) -> Result<Json<OkResponse>, ApiError> {
    state.service.clear().await?;
    Ok(Json(OkResponse { ok: true }))
}

async fn represent(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<EmbeddingResponse>, ApiError> {
    let embedding = state.service.represent(body.to_vec()).await?;
    Ok(Json(EmbeddingResponse { embedding }))
}

async fn count(State(state): State<AppState>) -> Json<CountResponse> {
    Json(CountResponse {
        count: state.service.count(),
    })
}

async fn ws_verify(
    ws: WebSocketUpgrade,
    Path(client_id): Path<String>,
    Query(q): Query<VerifyQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| verify_socket(socket, client_id, q.threshold, state.service))
}

async fn verify_socket(
    mut socket: WebSocket,
    client_id: String,
    threshold: Option<f32>,
    service: Arc<VerificationService>,
) {
    info!(client_id = %client_id, "ws: connected");
    while let Some(msg) = socket.recv().await {
        let image = match msg {
            Ok(Message::Binary(data)) => data.to_vec(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(client_id = %client_id, error = %e, "ws: receive failed");
                break;
            }
        };

        let reply = match service.verify(image, threshold).await {
            Ok(verdict) => serde_json::to_string(&VerifyResponse::from(verdict)),
            Err(e) => serde_json::to_string(&ErrorBody::from(&e)),
        }
        .unwrap_or_default();

        if socket.send(Message::Text(reply.into())).await.is_err() {
            break;
        }
    }
    info!(client_id = %client_id, "ws: disconnected");
}
