use std::future::Future;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Json, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use futures::StreamExt;
use serde::Serialize;

use crate::config::Config;
use crate::domains::roles::{AssistantRole, RoleDescriptor};
use crate::error::{Result, TutorRelayError};
use crate::interfaces::providers::ChatProvider;
use crate::providers::OpenAiProvider;
use crate::services::relay::{ChatStreamRequest, RelayService};
use crate::stream::ErrorBody;

#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<RelayService>,
}

impl AppState {
    pub fn new(relay: RelayService) -> Self {
        Self {
            relay: Arc::new(relay),
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct RolesResponse {
    default: &'static str,
    roles: Vec<RoleDescriptor>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/roles", get(roles))
        .route("/chat-stream", post(chat_stream))
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn roles(State(state): State<AppState>) -> Json<RolesResponse> {
    Json(RolesResponse {
        default: AssistantRole::General.as_str(),
        roles: state.relay.prompts().descriptors(),
    })
}

fn status_for(err: &TutorRelayError) -> StatusCode {
    match err {
        TutorRelayError::Validation(_) => StatusCode::BAD_REQUEST,
        TutorRelayError::Upstream(_) => StatusCode::BAD_GATEWAY,
        TutorRelayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        TutorRelayError::TurnInProgress => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(status: StatusCode, details: String) -> Response {
    (status, Json(ErrorBody::new(details))).into_response()
}

async fn chat_stream(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ChatStreamRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            tracing::debug!(error = %rejection.body_text(), "rejected chat-stream body");
            return error_response(StatusCode::BAD_REQUEST, rejection.body_text());
        }
    };

    let frames = match state.relay.handle_chat_stream(request).await {
        Ok(frames) => frames,
        Err(err) => {
            let status = status_for(&err);
            if status.is_server_error() {
                tracing::error!(
                    status = %status,
                    error = %err,
                    "chat-stream failed before streaming"
                );
            } else {
                tracing::debug!(status = %status, error = %err, "chat-stream request refused");
            }
            return error_response(status, err.details());
        }
    };

    let body = Body::from_stream(frames.map(Ok::<Bytes, std::convert::Infallible>));
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        body,
    )
        .into_response()
}

/// Wires the OpenAI-compatible provider described by `config` into a router.
pub fn app_from_config(config: &Config) -> Result<Router> {
    let openai = config.openai();
    if openai.api_key.is_none() {
        tracing::warn!("no OpenAI API key configured; upstream calls will likely be refused");
    }
    let provider: Arc<dyn ChatProvider> = Arc::new(OpenAiProvider::from_config(&openai));
    let relay = RelayService::from_config(config, provider)?;
    Ok(build_router(AppState::new(relay)))
}

pub async fn run(config: Config) -> Result<()> {
    run_with_shutdown(config, futures::future::pending::<()>()).await
}

pub async fn run_with_shutdown<F>(config: Config, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = app_from_config(&config)?;

    let addr = format!("{}:{}", config.host(), config.port());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| TutorRelayError::Runtime(format!("failed to bind {addr}: {e}")))?;
    let model = config
        .openai()
        .model
        .unwrap_or_else(|| crate::providers::openai::DEFAULT_MODEL.to_string());
    tracing::info!(
        addr = %addr,
        model = %model,
        turn_timeout_secs = config.turn_timeout().as_secs(),
        "tutor relay listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| TutorRelayError::Runtime(e.to_string()))?;

    tracing::info!("tutor relay stopped");
    Ok(())
}
