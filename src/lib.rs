//! Turnstile - per-key fixed-window admission control
//!
//! This crate decides, for every inbound request, whether a derived client
//! identity has exceeded its quota within the current window. Counters live in
//! an in-process store shared by all policies, with expired windows reclaimed
//! in the background. An axum middleware exposes the decisions over HTTP.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
