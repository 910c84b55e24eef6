//! Keel API: REST handlers, validation and the HTTP surface.
//!
//! `ResourceRest` is the per-kind storage contract the router is generic over;
//! `ConfigurationRest` is the one wired kind.

#![forbid(unsafe_code)]

pub mod http;
pub mod rest;
pub mod validation;

use std::sync::Arc;

use axum::Router;
use keel_store::KvStore;

pub use http::{resource_routes, serve, with_health, ApiConfig, HttpError, QueryParams};
pub use rest::{check_kind, get_attrs, new_registry, ConfigurationRest, ResourceRest, CONFIGURATION_PREFIX};
pub use validation::validate_configuration;

/// Full application router over `store`: Configuration routes plus `/healthz`.
pub fn app(store: Arc<dyn KvStore>, config: ApiConfig) -> Router {
    with_health(resource_routes(Arc::new(ConfigurationRest::from_store(store)), config))
}
