use std::sync::Arc;

use axum::{extract::State, routing::post, Form, Json, Router};
use data_model::{Container, Environment};
use tower_http::trace::TraceLayer;

use super::MachineState;
use crate::http_objects::{ApiError, UuidParams};

pub fn create_routes(state: Arc<MachineState>) -> Router {
    Router::new()
        .route("/allocate", post(allocate).with_state(state.clone()))
        .route("/deallocate", post(deallocate).with_state(state.clone()))
        .layer(TraceLayer::new_for_http())
}

async fn allocate(
    State(state): State<Arc<MachineState>>,
    Json(environment): Json<Environment>,
) -> Result<Json<Container>, ApiError> {
    let container = state
        .allocate(environment)
        .await
        .map_err(ApiError::internal_error)?;
    Ok(Json(container))
}

async fn deallocate(
    State(state): State<Arc<MachineState>>,
    Form(params): Form<UuidParams>,
) -> Result<(), ApiError> {
    let found = state
        .deallocate(&params.uuid)
        .await
        .map_err(ApiError::internal_error)?;
    if !found {
        return Err(ApiError::not_found(&format!(
            "no container {}",
            params.uuid
        )));
    }
    Ok(())
}
