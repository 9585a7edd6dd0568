use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use shared::types::{DeviceDescriptor, DeviceRecord};
use crate::discovery::prober::ProbeReport;
use crate::engine::Engine;
use crate::error::EngineError;

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub hash_rx: watch::Receiver<String>,
}

#[derive(Deserialize)]
pub struct RenameRequest {
    pub display_name: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match &self {
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            EngineError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Store(e) => {
                tracing::error!("Store request failed: {:#}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/devices", get(get_devices))
        .route("/api/devices/live", get(get_live_devices))
        .route("/api/devices/hash", get(get_hash))
        .route("/api/devices/probe", post(force_probe))
        .route("/api/devices/:identity_key/name", put(rename_device))
        .route(
            "/api/devices/:identity_key",
            get(get_device).delete(delete_device),
        )
        .with_state(state)
}

async fn get_devices(State(state): State<AppState>) -> Json<Vec<DeviceRecord>> {
    Json(state.engine.reconcile_and_list().await)
}

async fn get_live_devices(State(state): State<AppState>) -> Json<Vec<DeviceDescriptor>> {
    Json(state.engine.list_live_devices())
}

async fn get_hash(State(state): State<AppState>) -> String {
    state.hash_rx.borrow().clone()
}

async fn get_device(
    State(state): State<AppState>,
    Path(identity_key): Path<String>,
) -> Result<Json<DeviceRecord>, EngineError> {
    state.engine.get_device(&identity_key).await.map(Json)
}

async fn force_probe(State(state): State<AppState>) -> Result<Json<ProbeReport>, EngineError> {
    state.engine.force_probe().await.map(Json)
}

async fn rename_device(
    State(state): State<AppState>,
    Path(identity_key): Path<String>,
    Json(body): Json<RenameRequest>,
) -> Result<StatusCode, EngineError> {
    state.engine.rename(&identity_key, &body.display_name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_device(
    State(state): State<AppState>,
    Path(identity_key): Path<String>,
) -> Result<StatusCode, EngineError> {
    state.engine.delete(&identity_key).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (EngineError::NotFound("1".to_string()), StatusCode::NOT_FOUND),
            (EngineError::InvalidInput("x".to_string()), StatusCode::BAD_REQUEST),
            (EngineError::Unavailable("x".to_string()), StatusCode::SERVICE_UNAVAILABLE),
            (EngineError::Store(anyhow::anyhow!("boom")), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }
}
