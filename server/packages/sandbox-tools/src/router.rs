use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::Json;
use axum::Router;
use base64::Engine;
use sandbox_tools_error::{ErrorType, OrchestratorError, ProblemDetails};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{Modify, OpenApi, ToSchema};

use crate::sandbox::{SandboxKind, SessionInfo};
use crate::service::{
    ChatRequest, ChatResponse, ChatService, ResetResponse, SERVICE_NAME,
};
use crate::tools::{ToolCategory, ToolInfo};

const SERVER_INFO: &str = "\
This is a sandbox-tools chat server.

Endpoints:
  POST   /api/chat           send a chat message
  GET    /api/chat/tools     list available tools
  DELETE /api/chat/reset     release all sandbox sessions
  GET    /api/chat/health    service health
  GET    /api/openapi.json   OpenAPI document
";

#[derive(Debug)]
pub struct AppState {
    auth: AuthConfig,
    service: Arc<ChatService>,
}

impl AppState {
    pub fn new(auth: AuthConfig, service: ChatService) -> Self {
        Self {
            auth,
            service: Arc::new(service),
        }
    }

    pub fn service(&self) -> Arc<ChatService> {
        self.service.clone()
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub token: Option<String>,
}

impl AuthConfig {
    pub fn disabled() -> Self {
        Self { token: None }
    }

    pub fn with_token(token: String) -> Self {
        Self { token: Some(token) }
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let mut api_router = Router::new()
        .route("/api/chat", post(post_chat))
        .route("/api/chat/tools", get(list_tools))
        .route("/api/chat/reset", delete(reset))
        .route("/api/chat/health", get(get_health))
        .route("/api/chat/sandboxes", get(list_sandboxes))
        .with_state(shared.clone());

    if shared.auth.token.is_some() {
        api_router = api_router.layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_token,
        ));
    }

    let mut router = Router::new()
        .route("/", get(get_root))
        .route("/api/openapi.json", get(get_openapi))
        .merge(api_router)
        .fallback(not_found);

    let http_logging = match std::env::var("SANDBOX_TOOLS_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %req.method(),
                    uri = %req.uri()
                )
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

#[derive(OpenApi)]
#[openapi(
    paths(post_chat, list_tools, reset, get_health, list_sandboxes),
    components(
        schemas(
            ChatRequest,
            ChatResponse,
            ResetResponse,
            HealthResponse,
            ToolInfo,
            ToolCategory,
            SessionInfo,
            SandboxKind,
            ProblemDetails,
            ErrorType
        )
    ),
    tags(
        (name = "chat", description = "Chat with tool-using agent"),
        (name = "meta", description = "Service metadata")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://localhost:8080")]);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Orchestrator(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    /// Sandbox availability: `ready`, `unreachable`, `not_started`,
    /// `stopped` or `disabled`.
    pub sandbox: String,
}

async fn get_root() -> &'static str {
    SERVER_INFO
}

async fn not_found() -> (StatusCode, String) {
    (
        StatusCode::NOT_FOUND,
        format!("404 Not Found\n\n{SERVER_INFO}"),
    )
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    post,
    path = "/api/chat",
    request_body = ChatRequest,
    responses(
        (status = 200, body = ChatResponse),
        (status = 400, body = ProblemDetails),
        (status = 500, description = "Processing failed", body = ChatResponse)
    ),
    tag = "chat"
)]
async fn post_chat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Result<(StatusCode, Json<ChatResponse>), ApiError> {
    let result = state.service.chat(request).await?;
    let status = if result.succeeded {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    Ok((status, Json(ChatResponse::from_result(result))))
}

#[utoipa::path(
    get,
    path = "/api/chat/tools",
    responses((status = 200, body = [ToolInfo])),
    tag = "chat"
)]
async fn list_tools(State(state): State<Arc<AppState>>) -> Json<Vec<ToolInfo>> {
    Json(state.service.list_tools())
}

#[utoipa::path(
    delete,
    path = "/api/chat/reset",
    responses((status = 200, body = ResetResponse)),
    tag = "chat"
)]
async fn reset(State(state): State<Arc<AppState>>) -> Json<ResetResponse> {
    Json(state.service.reset().await)
}

#[utoipa::path(
    get,
    path = "/api/chat/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "UP".to_string(),
        service: SERVICE_NAME.to_string(),
        sandbox: state.service.sandbox_status().await.to_string(),
    })
}

#[utoipa::path(
    get,
    path = "/api/chat/sandboxes",
    responses((status = 200, body = [SessionInfo])),
    tag = "meta"
)]
async fn list_sandboxes(State(state): State<Arc<AppState>>) -> Json<Vec<SessionInfo>> {
    Json(state.service.list_sandboxes().await)
}

async fn require_token(
    State(state): State<Arc<AppState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    if req.uri().path() == "/api/chat/health" {
        return Ok(next.run(req).await);
    }

    let expected = match &state.auth.token {
        Some(token) => token.as_str(),
        None => return Ok(next.run(req).await),
    };

    let provided = extract_token(req.headers());
    if provided.as_deref() == Some(expected) {
        Ok(next.run(req).await)
    } else {
        Err(OrchestratorError::TokenInvalid {
            message: Some("missing or invalid token".to_string()),
        }
        .into())
    }
}

fn extract_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, rest) = value.trim().split_once(' ')?;
    let rest = rest.trim();
    match scheme.to_ascii_lowercase().as_str() {
        "bearer" | "token" => Some(rest.to_string()),
        "basic" => {
            let engines = [
                base64::engine::general_purpose::STANDARD,
                base64::engine::general_purpose::STANDARD_NO_PAD,
                base64::engine::general_purpose::URL_SAFE,
                base64::engine::general_purpose::URL_SAFE_NO_PAD,
            ];
            engines.iter().find_map(|engine| {
                let decoded = String::from_utf8(engine.decode(rest).ok()?).ok()?;
                match decoded.split_once(':') {
                    Some((_, password)) => Some(password.to_string()),
                    None if !decoded.is_empty() => Some(decoded),
                    None => None,
                }
            })
        }
        _ => None,
    }
}
