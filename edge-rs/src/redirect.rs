//! Plain HTTP listener
//!
//! In serving mode it answers ACME challenges and sends everything else to
//! HTTPS. In manual renewal mode it only answers challenges.

use axum::{
    body::Body,
    extract::State,
    http::{header, Request, Response, StatusCode},
    response::IntoResponse,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::acme::ChallengeResponder;
use crate::error::Result;
use crate::proxy::request_host;

/// Intermediaries may cache the redirect for one hour
pub const REDIRECT_CACHE_CONTROL: &str = "max-age=3600";

/// Challenge serving plus HTTPS redirect for everything else
pub fn redirect_router(responder: ChallengeResponder) -> Router {
    Router::new()
        .fallback(redirect_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(responder))
}

/// Challenge serving only
pub fn challenge_router(responder: ChallengeResponder) -> Router {
    Router::new()
        .fallback(challenge_only_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(responder))
}

/// Serve a plain HTTP router on an already bound listener
pub async fn serve_http(listener: TcpListener, router: Router) -> Result<()> {
    info!(addr = %listener.local_addr()?, "http server is live");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn redirect_handler(
    State(responder): State<Arc<ChallengeResponder>>,
    req: Request<Body>,
) -> Response<Body> {
    let path = req.uri().path();
    if ChallengeResponder::is_challenge_path(path) {
        return responder.serve(path).await;
    }
    https_redirect(&req)
}

async fn challenge_only_handler(
    State(responder): State<Arc<ChallengeResponder>>,
    req: Request<Body>,
) -> Response<Body> {
    debug!(method = %req.method(), uri = %req.uri(), "HTTP request");
    let path = req.uri().path();
    if ChallengeResponder::is_challenge_path(path) {
        return responder.serve(path).await;
    }

    warn!(uri = %req.uri(), "Unexpected request while renewing certificates");
    StatusCode::NOT_FOUND.into_response()
}

/// 301 to the HTTPS form of the same host and path
pub fn https_redirect<B>(req: &Request<B>) -> Response<Body> {
    let host = request_host(req);
    if host.is_empty() {
        return (StatusCode::BAD_REQUEST, "Missing Host header").into_response();
    }

    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let location = format!("https://{}{}", host, path);

    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(header::LOCATION, &location)
        .header(header::CACHE_CONTROL, REDIRECT_CACHE_CONTROL)
        .body(Body::empty())
        .unwrap_or_else(|_| (StatusCode::BAD_REQUEST, "Invalid redirect target").into_response())
}
