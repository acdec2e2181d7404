//! Namespace Lister HTTP surface
//!
//! Exposes the access cache as the Kubernetes `GET /api/v1/namespaces` endpoint. Callers are
//! identified either by a trusted username header, set by an authenticating proxy, or by
//! reviewing their bearer token with the API server.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod authn;
pub mod metrics;
mod service;


pub use self::{
    authn::{Authenticate, Authenticator, AuthnError, TokenReviewer},
    metrics::HttpMetrics,
    service::{Body, Error, NamespacesService, NAMESPACES_PATH, READY_PATH},
};
