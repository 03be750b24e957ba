//! HTTP binding: axum middleware, routes, and server.

mod middleware;
mod routes;
mod server;

pub use middleware::{admission_middleware, apply_headers, request_attributes, FORWARDED_FOR, REAL_IP};
pub use routes::router;
pub use server::HttpServer;
