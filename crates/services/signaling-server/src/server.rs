//! HTTP mailbox relay
//!
//! Provides HTTP endpoints for signaling delivery:
//! - POST /v1/messages - Queue a message for its recipient
//! - POST /v1/participants/:participant/poll - Drain queued messages
//! - GET /health - Health check

use crate::error::{Error, Result};
use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use campuscare_webrtc::signaling::http::{AcceptedResponse, ErrorResponse, PollResponse};
use campuscare_webrtc::signaling::Mailbox;
use campuscare_webrtc::{ParticipantId, SignalingMessage};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Largest request body accepted; comfortably above the SDP limit
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// Batch size used when a poll does not ask for one
pub const DEFAULT_POLL_LIMIT: usize = 50;

/// Upper bound on one poll's batch
pub const MAX_POLL_LIMIT: usize = 200;

#[derive(Clone)]
struct RelayState {
    mailbox: Arc<dyn Mailbox>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Default, Deserialize)]
struct PollParams {
    limit: Option<usize>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
}

/// Relay server in front of a mailbox store
pub struct RelayServer {
    bind_address: String,
    mailbox: Arc<dyn Mailbox>,
}

impl RelayServer {
    /// Create a relay for `mailbox` that will listen on `bind_address`
    /// (e.g. "127.0.0.1:8080")
    pub fn new(bind_address: impl Into<String>, mailbox: Arc<dyn Mailbox>) -> Self {
        Self {
            bind_address: bind_address.into(),
            mailbox,
        }
    }

    pub fn router(&self) -> Router {
        build_router(Arc::clone(&self.mailbox))
    }

    /// Bind and serve until `shutdown` completes
    pub async fn serve(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address)
            .await
            .map_err(|e| Error::ServerError(format!("Failed to bind {}: {}", self.bind_address, e)))?;
        self.serve_on(listener, shutdown).await
    }

    /// Serve on an already bound listener
    pub async fn serve_on(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let addr = listener.local_addr()?;
        info!("Signaling relay listening on {}", addr);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::ServerError(format!("Server error: {}", e)))?;

        info!("Signaling relay on {} stopped", addr);
        Ok(())
    }
}

/// Build the relay routes over `mailbox`
pub fn build_router(mailbox: Arc<dyn Mailbox>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/messages", post(post_message_handler))
        .route("/v1/participants/:participant/poll", post(poll_handler))
        .with_state(RelayState { mailbox })
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(
            tower::ServiceBuilder::new()
                .layer(tower_http::trace::TraceLayer::new_for_http())
                .layer(tower_http::cors::CorsLayer::permissive()),
        )
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

fn map_mailbox_error(e: campuscare_webrtc::Error) -> ApiError {
    match e {
        campuscare_webrtc::Error::ProtocolError(detail) => {
            api_error(StatusCode::BAD_REQUEST, detail)
        }
        other => {
            warn!("Mailbox unavailable: {}", other);
            api_error(StatusCode::SERVICE_UNAVAILABLE, other.to_string())
        }
    }
}

async fn post_message_handler(
    State(state): State<RelayState>,
    body: std::result::Result<Json<SignalingMessage>, JsonRejection>,
) -> std::result::Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let Json(message) = body.map_err(|rejection| {
        debug!("Rejected message body: {}", rejection.body_text());
        api_error(rejection.status(), rejection.body_text())
    })?;
    message
        .validate()
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;

    let id = message.id;
    debug!(
        "Relaying {} {} from {} to {}",
        message.kind(),
        id,
        message.sender,
        message.recipient
    );
    state.mailbox.push(message).await.map_err(map_mailbox_error)?;
    Ok((StatusCode::ACCEPTED, Json(AcceptedResponse { id })))
}

async fn poll_handler(
    State(state): State<RelayState>,
    Path(participant): Path<String>,
    Query(params): Query<PollParams>,
) -> std::result::Result<Json<PollResponse>, ApiError> {
    let participant = ParticipantId::new(participant);
    if participant.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "participant id is empty"));
    }
    let limit = params
        .limit
        .unwrap_or(DEFAULT_POLL_LIMIT)
        .clamp(1, MAX_POLL_LIMIT);

    let messages = state
        .mailbox
        .drain(&participant, limit)
        .await
        .map_err(map_mailbox_error)?;
    if !messages.is_empty() {
        debug!("Delivered {} message(s) to {}", messages.len(), participant);
    }
    Ok(Json(PollResponse { messages }))
}
