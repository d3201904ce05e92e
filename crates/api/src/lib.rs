//! HTTP API: print-worker endpoints, the payment webhook, admin tooling.

pub mod app;
pub mod middleware;
