//! HTTP surface over [`MeshContextService`].
//!
//! - `GET  /v1/mesh/graph`    serialized graph
//! - `POST /v1/mesh/policies` `{namespace, name, spec}` where `spec` is a
//!   JSON document encoded as a string
//! - `GET  /healthz`
//!
//! Policy rejections, including request bodies that do not decode, are
//! reported in the body with status 200; only a graph serialization failure
//! maps to a 5xx.

use std::net::SocketAddr;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::service::{ApplyPolicyOutcome, MeshContextService};

#[derive(Debug, Deserialize)]
pub struct ApplyPolicyRequest {
    pub namespace: String,
    pub name: String,
    pub spec: String,
}

pub fn mesh_routes(service: MeshContextService) -> Router {
    Router::new()
        .route("/v1/mesh/graph", get(get_graph))
        .route("/v1/mesh/policies", post(apply_policy))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(service)
}

async fn get_graph(State(service): State<MeshContextService>) -> Response {
    match service.get_graph() {
        Ok(body) => ([(CONTENT_TYPE, "application/json")], body).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to serialize mesh graph");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to serialize mesh graph: {e}"),
            )
                .into_response()
        }
    }
}

async fn apply_policy(
    State(service): State<MeshContextService>,
    request: Result<Json<ApplyPolicyRequest>, JsonRejection>,
) -> Json<ApplyPolicyOutcome> {
    let Json(request) = match request {
        Ok(request) => request,
        Err(rejection) => {
            warn!(status = %rejection.status(), error = %rejection.body_text(), "Rejected undecodable policy request");
            return Json(ApplyPolicyOutcome::rejected(format!(
                "Invalid request: {}",
                rejection.body_text()
            )));
        }
    };
    Json(
        service
            .apply_policy(&request.namespace, &request.name, &request.spec)
            .await,
    )
}

/// Serve until `cancel` fires. Bind failures are returned to the caller.
pub async fn serve(
    service: MeshContextService,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Mesh API listening");
    axum::serve(listener, mesh_routes(service))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    info!("Mesh API stopped");
    Ok(())
}
