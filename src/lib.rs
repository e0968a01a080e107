//! Authorizing reverse proxy for Prometheus.
//!
//! Incoming clients authenticate with a bearer token; the proxy derives
//! the namespaces that token may observe from watched RBAC resources and
//! rewrites every query so the backend can only answer inside them.

pub mod auth;
pub mod cache;
pub mod config;
pub mod data;
pub mod errors;
pub mod grpc;
pub mod metrics;
pub mod proxy;
pub mod rbac;
pub mod routes;
