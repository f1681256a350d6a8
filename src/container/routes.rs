use std::{collections::HashMap, sync::Arc};

use axum::{
    body::Body,
    extract::{Query, State},
    response::{IntoResponse, Response},
    routing::post,
    Json,
    Router,
};
use data_model::{NodeId, StatsSample};
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::debug;

use super::ContainerState;
use crate::{
    exec::ExecContext,
    http_objects::{ApiError, NodeIdParams, UuidParams},
};

pub fn create_routes(state: Arc<ContainerState>) -> Router {
    Router::new()
        .route("/query/start", post(query_start).with_state(state.clone()))
        .route("/query/finish", post(query_finish).with_state(state.clone()))
        .route("/stats", post(node_stats).with_state(state.clone()))
        .route("/allstats", post(all_stats).with_state(state.clone()))
        .layer(TraceLayer::new_for_http())
}

/// Streams the output of a node in the framed wire format.
async fn query_start(
    State(state): State<Arc<ContainerState>>,
    Query(params): Query<NodeIdParams>,
    Json(ctx): Json<ExecContext>,
) -> Result<Response, ApiError> {
    if !ctx.nodes.contains_key(&params.node_id) {
        return Err(ApiError::not_found(&format!(
            "node {} is not part of run {}",
            params.node_id, ctx.uuid
        )));
    }
    let uuid = ctx.uuid.clone();
    let buf = state
        .get_buffer(ctx, params.node_id)
        .await
        .map_err(ApiError::internal_error)?;

    let (mut tx, rx) = tokio::io::duplex(64 * 1024);
    let node_id = params.node_id;
    tokio::spawn(async move {
        if let Err(err) = buf.to_writer(&mut tx).await {
            debug!(uuid, node_id = %node_id, "node output stream ended: {}", err);
        }
    });
    Ok(Body::from_stream(ReaderStream::new(rx)).into_response())
}

async fn query_finish(
    State(state): State<Arc<ContainerState>>,
    Query(params): Query<UuidParams>,
) -> Result<(), ApiError> {
    state.finish(&params.uuid);
    Ok(())
}

async fn node_stats(
    State(state): State<Arc<ContainerState>>,
    Query(params): Query<NodeIdParams>,
) -> Result<Json<StatsSample>, ApiError> {
    let stats = state
        .node_stats(params.node_id)
        .ok_or_else(|| ApiError::not_found(&format!("no stats for node {}", params.node_id)))?;
    Ok(Json(stats))
}

async fn all_stats(State(state): State<Arc<ContainerState>>) -> Json<HashMap<NodeId, StatsSample>> {
    Json(state.all_stats())
}
