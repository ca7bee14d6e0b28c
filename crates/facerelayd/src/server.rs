use crate::config::Config;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use facerelay_core::{ErrorKind, FacesResponse, HttpTransport, Relay, RelayError};
use serde::Deserialize;
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

/// Shared, read-only state behind every request.
pub struct AppState {
    relay: Relay<HttpTransport>,
    config: Config,
}

impl AppState {
    pub fn new(relay: Relay<HttpTransport>, config: Config) -> Self {
        Self { relay, config }
    }
}

/// Inbound body: `{"image": "<base64>"}`. Extra fields are ignored.
#[derive(Deserialize)]
struct RelayRequest {
    image: String,
}

/// Error body: `{"error": "<message>", "kind": "<kind>"}`.
struct ApiError(RelayError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.0.message,
            "kind": self.0.kind,
        });
        (status_for(self.0.kind), Json(body)).into_response()
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::BackendTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::UnsupportedValueType => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorKind::BackendUnreachable
        | ErrorKind::BackendRejected
        | ErrorKind::MalformedEnvelope
        | ErrorKind::TagResolution
        | ErrorKind::MissingField
        | ErrorKind::UnsupportedResultFormat => StatusCode::BAD_GATEWAY,
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.max_body_bytes;
    Router::new()
        .route("/", post(relay_image))
        .route("/status", get(status))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

async fn relay_image(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RelayRequest>, JsonRejection>,
) -> Result<Json<FacesResponse>, ApiError> {
    let request_id = Uuid::new_v4();
    let span = tracing::info_span!("relay", %request_id);

    async move {
        let Json(request) = payload.map_err(|rejection| {
            tracing::warn!(error = %rejection.body_text(), "rejected request body");
            ApiError(RelayError::new(ErrorKind::InvalidRequest, rejection.body_text()))
        })?;

        tracing::debug!(image_b64_len = request.image.len(), "relay requested");

        match state.relay.relay_base64(&request.image).await {
            Ok(faces) => Ok(Json(FacesResponse { faces })),
            Err(err) => {
                tracing::error!(kind = err.kind.as_str(), error = %err, "relay failed");
                Err(ApiError(err))
            }
        }
    }
    .instrument(span)
    .await
}

/// Reports the settings the live relay is running with.
async fn status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let options = state.relay.options();
    Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "backend_url": state.relay.transport().url(),
        "timeout_secs": options.timeout.as_secs(),
        "result_key": options.result_key,
    }))
}
