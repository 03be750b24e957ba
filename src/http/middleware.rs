//! Axum middleware applying an admission policy to a route.
//!
//! Install with [`axum::Router::route_layer`] so that path parameters have
//! been matched by the time the middleware runs:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use axum::{middleware, routing::get, Router};
//! # use turnstile::http::admission_middleware;
//! # use turnstile::ratelimit::AdmissionController;
//! # fn app(controller: Arc<AdmissionController>) -> Router {
//! Router::new()
//!     .route("/public/{token}", get(|| async { "ok" }))
//!     .route_layer(middleware::from_fn_with_state(controller, admission_middleware))
//! # }
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, FromRequestParts, Query, RawPathParams, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::debug;

use crate::ratelimit::{AdmissionController, AdmissionResult, RequestAttributes};

/// Proxy forwarding header.
pub const FORWARDED_FOR: &str = "x-forwarded-for";
/// Client address header set by the fronting proxy.
///
/// Like [`FORWARDED_FOR`] this arrives from the client, so it only
/// identifies the caller when a proxy in front overwrites it. It feeds key
/// derivation only; skip lists match the socket peer.
pub const REAL_IP: &str = "x-real-ip";

/// Collect the identifying attributes of a request.
///
/// Path parameters win over query parameters of the same name.
pub async fn request_attributes(parts: &mut Parts) -> RequestAttributes {
    let mut params = HashMap::new();

    if let Ok(Query(query)) = Query::<HashMap<String, String>>::try_from_uri(&parts.uri) {
        params.extend(query);
    }

    if let Ok(path) = RawPathParams::from_request_parts(parts, &()).await {
        for (name, value) in &path {
            params.insert(name.to_string(), value.to_string());
        }
    }

    RequestAttributes {
        forwarded_for: header_value(&parts.headers, FORWARDED_FOR),
        client_addr: header_value(&parts.headers, REAL_IP),
        peer_addr: parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr),
        params,
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Admit or reject the request according to the controller's policy.
pub async fn admission_middleware(
    State(controller): State<Arc<AdmissionController>>,
    request: Request,
    next: Next,
) -> Response {
    let (mut parts, body) = request.into_parts();
    let attributes = request_attributes(&mut parts).await;
    let request = Request::from_parts(parts, body);

    let result = controller.decide(&attributes);

    let mut response = if result.allowed {
        next.run(request).await
    } else {
        (StatusCode::TOO_MANY_REQUESTS, Json(controller.rejection(&result))).into_response()
    };

    apply_headers(response.headers_mut(), &result);
    response
}

/// Attach rate limit headers, if the result carries any.
///
/// A header that cannot be encoded is skipped; the decision stands either way.
pub fn apply_headers(headers: &mut HeaderMap, result: &AdmissionResult) {
    let Some(rate) = result.headers else {
        return;
    };

    for (name, value) in rate.pairs() {
        insert_header(headers, name, &value);
    }
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) -> bool {
    match (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        (Ok(name), Ok(value)) => {
            headers.insert(name, value);
            true
        }
        _ => {
            debug!(header = name, "Skipping unencodable rate limit header");
            false
        }
    }
}
