//! HTTP API: routes, handlers and request parsing

pub mod handlers;
pub mod requests;
pub mod routes;
