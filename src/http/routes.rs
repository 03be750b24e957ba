//! HTTP routes for the public resource endpoints.

use std::sync::Arc;

use axum::extract::Path;
use axum::routing::get;
use axum::{middleware, Json, Router};
use serde_json::{json, Value};
use tracing::warn;

use super::middleware::admission_middleware;
use crate::ratelimit::{AdmissionController, PolicySet, PUBLIC_ACCESS, PUBLIC_DOWNLOAD};

/// Build the application router.
///
/// `/public/{token}` is guarded by the `public_access` policy and
/// `/public/{token}/download` by `public_download`. A route whose policy is
/// not configured is served without limits.
pub fn router(policies: &PolicySet) -> Router {
    let access_routes = limited(
        Router::new().route("/public/{token}", get(resource)),
        PUBLIC_ACCESS,
        policies.get(PUBLIC_ACCESS),
    );
    let download_routes = limited(
        Router::new().route("/public/{token}/download", get(download_resource)),
        PUBLIC_DOWNLOAD,
        policies.get(PUBLIC_DOWNLOAD),
    );

    Router::new()
        .route("/health", get(health))
        .merge(access_routes)
        .merge(download_routes)
}

fn limited(routes: Router, name: &str, controller: Option<Arc<AdmissionController>>) -> Router {
    match controller {
        Some(controller) => routes.route_layer(middleware::from_fn_with_state(
            controller,
            admission_middleware,
        )),
        None => {
            warn!(policy = %name, "Policy not configured, route is not rate limited");
            routes
        }
    }
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn resource(Path(token): Path<String>) -> Json<Value> {
    Json(json!({
        "token": token,
        "status": "available"
    }))
}

async fn download_resource(Path(token): Path<String>) -> Json<Value> {
    Json(json!({
        "token": token,
        "download": "ready"
    }))
}
