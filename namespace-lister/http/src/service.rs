use crate::{metrics::HttpMetrics, Authenticate};
use futures::future;
use http::{header, HeaderMap, Method, Request, Response, StatusCode};
use namespace_lister_core::{ListNamespaces, Namespace};
use namespace_lister_k8s_api as k8s;
use std::{
    sync::Arc,
    task::{Context, Poll},
};
use thiserror::Error;
use tracing::{debug, error, trace};

/// The Kubernetes core API path for listing namespaces.
pub const NAMESPACES_PATH: &str = "/api/v1/namespaces";

/// Reports whether listings are being served.
pub const READY_PATH: &str = "/readyz";

const JSON_CONTENT_TYPE: &str = "application/json;charset=utf-8";
const TEXT_CONTENT_TYPE: &str = "text/plain;charset=utf-8";

const NOT_SYNCHRONIZED: &str = "access cache is not synchronized";

pub type Body = http_body_util::Full<bytes::Bytes>;

/// Serves `GET /api/v1/namespaces` with the namespaces visible to the authenticated caller.
///
/// Listings are refused with a 503 until the lister is synchronized; `GET /readyz` reports the same
/// state without authentication.
#[derive(Clone, Debug)]
pub struct NamespacesService<L, A> {
    lister: L,
    authn: A,
    metrics: HttpMetrics,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

// === impl NamespacesService ===

impl<L, A> NamespacesService<L, A> {
    pub fn new(lister: L, authn: A, metrics: HttpMetrics) -> Self {
        Self {
            lister,
            authn,
            metrics,
        }
    }
}

impl<L, A, B> tower::Service<Request<B>> for NamespacesService<L, A>
where
    L: ListNamespaces + Clone + Send + Sync + 'static,
    A: Authenticate + Clone + Send + Sync + 'static,
{
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let observer = self.metrics.start(req.method());
        trace!(method = %req.method(), path = req.uri().path());

        let path = req.uri().path();
        if path == READY_PATH && req.method() == Method::GET {
            let (rsp, size) = self.readiness();
            observer.end(rsp.status(), size);
            return Box::pin(future::ok(rsp));
        }

        if path != NAMESPACES_PATH {
            let rsp = empty_response(StatusCode::NOT_FOUND);
            observer.end(rsp.status(), 0);
            return Box::pin(future::ok(rsp));
        }

        if req.method() != Method::GET {
            let rsp = Response::builder()
                .status(StatusCode::METHOD_NOT_ALLOWED)
                .header(header::ALLOW, "GET")
                .body(Body::default())
                .expect("method not allowed response must be valid");
            observer.end(rsp.status(), 0);
            return Box::pin(future::ok(rsp));
        }

        // Until the first synchronization completes, an empty listing would be indistinguishable
        // from a lack of access.
        if !self.lister.is_synchronized() {
            debug!("Access cache is not synchronized");
            let (rsp, size) = text_response(StatusCode::SERVICE_UNAVAILABLE, NOT_SYNCHRONIZED);
            observer.end(rsp.status(), size);
            return Box::pin(future::ok(rsp));
        }

        // The request body is not read; only the headers carry credentials.
        let headers = req.headers().clone();
        let svc = self.clone();
        Box::pin(async move {
            let (rsp, size) = svc.list(&headers).await?;
            observer.end(rsp.status(), size);
            Ok(rsp)
        })
    }
}

impl<L, A> NamespacesService<L, A>
where
    L: ListNamespaces,
    A: Authenticate,
{
    fn readiness(&self) -> (Response<Body>, usize) {
        if self.lister.is_synchronized() {
            text_response(StatusCode::OK, "ready")
        } else {
            text_response(StatusCode::SERVICE_UNAVAILABLE, NOT_SYNCHRONIZED)
        }
    }

    async fn list(&self, headers: &HeaderMap) -> Result<(Response<Body>, usize), Error> {
        let identity = match self.authn.authenticate(headers).await {
            Ok(identity) => identity,
            Err(error) if error.is_review_failure() => {
                error!(%error, "Failed to authenticate request");
                return Ok((empty_response(StatusCode::UNAUTHORIZED), 0));
            }
            Err(error) => {
                debug!(%error, "Unauthenticated request");
                return Ok((empty_response(StatusCode::UNAUTHORIZED), 0));
            }
        };

        let namespaces = match self.lister.list_namespaces(&identity).await {
            Ok(namespaces) => namespaces,
            Err(error) => {
                error!(%identity, %error, "Failed to list namespaces");
                return Ok(text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    error.to_string(),
                ));
            }
        };
        debug!(%identity, namespaces = namespaces.len(), "Listed namespaces");

        json_response(&namespace_list(&namespaces))
    }
}

fn namespace_list(namespaces: &[Arc<Namespace>]) -> k8s::List<k8s::Namespace> {
    k8s::List {
        items: namespaces
            .iter()
            .map(|ns| k8s::Namespace {
                metadata: k8s::ObjectMeta {
                    name: Some(ns.name.clone()),
                    labels: (!ns.labels.is_empty()).then(|| ns.labels.clone()),
                    ..Default::default()
                },
                ..Default::default()
            })
            .collect(),
        metadata: k8s::ListMeta::default(),
    }
}

fn json_response(list: &k8s::List<k8s::Namespace>) -> Result<(Response<Body>, usize), Error> {
    let bytes = serde_json::to_vec(list)?;
    let size = bytes.len();
    let rsp = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, JSON_CONTENT_TYPE)
        .body(Body::from(bytes))
        .expect("namespace list response must be valid");
    Ok((rsp, size))
}

fn empty_response(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::default())
        .expect("empty response must be valid")
}

fn text_response(status: StatusCode, msg: impl Into<String>) -> (Response<Body>, usize) {
    let msg = msg.into();
    let size = msg.len();
    let rsp = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, TEXT_CONTENT_TYPE)
        .body(Body::from(msg))
        .expect("text response must be valid");
    (rsp, size)
}
