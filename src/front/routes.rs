use std::sync::Arc;

use axum::{
    Router,
    http::{HeaderValue, Request, header},
    routing::{get, post},
};
use http::HeaderName;
use tower::{Layer, ServiceBuilder};
use tower_http::{
    normalize_path::{NormalizePath, NormalizePathLayer},
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    sensitive_headers::SetSensitiveRequestHeadersLayer,
    set_header::SetRequestHeaderLayer,
    timeout::TimeoutLayer,
    trace::{DefaultOnResponse, TraceLayer},
};
use tracing::{Level, Span, info_span};
use uuid::Uuid;

use crate::{
    check_run::CiJob,
    front::handlers::{AppState, health_check, webhook},
    github_client::GithubClient,
    github_token::TokenFetcher,
    github_verifier::DefaultVerifier,
};

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Redacted from the request traces.
const SENSITIVE_HEADERS: [&str; 4] = [
    "authorization",
    "cookie",
    "x-hub-signature",
    "x-hub-signature-256",
];

const HEALTH_CHECK_PATH: &str = "/hc";
const WEBHOOK_PATH: &str = "/github/events";

/// `state` is shared so that the caller can wait for running jobs after the server stops.
pub fn build_app<GH, F, J>(state: Arc<AppState<GH, F, J>>) -> NormalizePath<Router>
where
    GH: GithubClient + 'static,
    F: TokenFetcher + 'static,
    J: CiJob + 'static,
{
    let middleware = ServiceBuilder::new()
        .layer(SetSensitiveRequestHeadersLayer::new(
            SENSITIVE_HEADERS.map(HeaderName::from_static),
        ))
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static(REQUEST_ID_HEADER),
            UuidRequestId,
        ))
        .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
            REQUEST_ID_HEADER,
        )))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(request_span)
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(SetRequestHeaderLayer::if_not_present(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        ))
        .layer(TimeoutLayer::new(state.config.server_timeout.into()));

    let router = Router::new()
        .route(HEALTH_CHECK_PATH, get(health_check))
        .route(WEBHOOK_PATH, post(webhook::<_, _, _, DefaultVerifier>))
        .with_state(state)
        .layer(middleware);
    NormalizePathLayer::trim_trailing_slash().layer(router)
}

fn request_span<B>(req: &Request<B>) -> Span {
    // Set by SetRequestIdLayer, which runs first.
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .and_then(|id| id.header_value().to_str().ok())
        .unwrap_or_default();
    info_span!(
        "request",
        method = %req.method(),
        path = req.uri().path(),
        request_id,
    )
}

/// Only used when the caller did not send `x-request-id`.
#[derive(Debug, Clone)]
struct UuidRequestId;

impl MakeRequestId for UuidRequestId {
    fn make_request_id<B>(&mut self, _req: &Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&Uuid::new_v4().to_string())
            .map(RequestId::new)
            .ok()
    }
}
