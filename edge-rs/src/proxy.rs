//! HTTPS edge server and forwarding engine
//!
//! Every request is routed on its `Host` header. Plain requests are rewritten
//! onto the target URL and forwarded through a pooled HTTP client. Upgrade
//! requests (WebSocket) are replayed over a fresh HTTP/1.1 connection to the
//! target's `host:port`, and once both sides switch protocols the two
//! connections are spliced byte for byte.

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri, Version},
    response::IntoResponse,
    Router,
};
use http_body_util::Empty;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tower::ServiceExt;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::router::{RoutingTable, Target};
use crate::tls::TlsManager;

/// HTTP client type for forwarding requests
type HttpClient = Client<HttpConnector, Body>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Headers that only make sense for a single hop
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Why a request could not be proxied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorKind {
    /// Plain request for a host with no rule
    RoutingMiss,
    /// Upgrade request for a host with no rule
    UpgradeRoutingMiss,
    /// Upstream refused, reset, timed out or answered garbage
    Upstream,
}

/// A failed request, reported to its caller only
#[derive(Debug)]
pub struct ProxyError {
    pub kind: ProxyErrorKind,
    pub method: Method,
    pub uri: Uri,
    pub host: String,
    pub detail: String,
}

impl ProxyError {
    fn new(kind: ProxyErrorKind, parts: &RequestInfo, detail: impl Into<String>) -> Self {
        Self {
            kind,
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            host: parts.host.clone(),
            detail: detail.into(),
        }
    }

    /// Status code returned to the caller
    ///
    /// An unknown host on a TLS-terminating edge is a configuration problem,
    /// so plain requests fail loudly with 500 rather than 404.
    pub fn status(&self) -> StatusCode {
        match self.kind {
            ProxyErrorKind::RoutingMiss => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorKind::UpgradeRoutingMiss => StatusCode::BAD_REQUEST,
            ProxyErrorKind::Upstream => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> axum::response::Response {
        match self.kind {
            ProxyErrorKind::RoutingMiss => {
                warn!(host = %self.host, method = %self.method, uri = %self.uri, "Unknown domain");
                (
                    self.status(),
                    format!("ERROR: Unknown domain '{}'", self.host),
                )
                    .into_response()
            }
            ProxyErrorKind::UpgradeRoutingMiss => {
                error!(host = %self.host, uri = %self.uri, "Bad websocket upgrade. No proxy rule for host");
                (self.status(), [(header::CONNECTION, "close")]).into_response()
            }
            ProxyErrorKind::Upstream => {
                error!(
                    host = %self.host,
                    method = %self.method,
                    uri = %self.uri,
                    error = %self.detail,
                    "Failed to proxy request"
                );
                (
                    self.status(),
                    [(header::CONTENT_TYPE, "text/plain")],
                    "ERROR: Failed to proxy request.",
                )
                    .into_response()
            }
        }
    }
}

/// Request fields kept for error reporting after the request is consumed
struct RequestInfo {
    method: Method,
    uri: Uri,
    host: String,
}

impl RequestInfo {
    fn of<B>(req: &Request<B>) -> Self {
        Self {
            method: req.method().clone(),
            uri: req.uri().clone(),
            host: request_host(req).to_string(),
        }
    }
}

/// `Host` header as received, falling back to the URI authority
pub fn request_host<B>(req: &Request<B>) -> &str {
    req.headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
        .unwrap_or("")
}

/// Whether a request asks to switch protocols
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(header::UPGRADE)
}

/// Forwarding engine
#[derive(Clone)]
pub struct Forwarder {
    client: HttpClient,
}

impl Forwarder {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(CONNECT_TIMEOUT));

        let client: HttpClient = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build(connector);

        Self { client }
    }

    /// Forward a plain request and stream the upstream response back
    pub async fn forward_http(
        &self,
        req: Request<Body>,
        target: &Target,
        client_addr: Option<SocketAddr>,
    ) -> std::result::Result<axum::response::Response, ProxyError> {
        let info = RequestInfo::of(&req);

        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let forward_uri = target.forward_uri(path_and_query);
        let uri: Uri = forward_uri.parse().map_err(|e| {
            ProxyError::new(
                ProxyErrorKind::Upstream,
                &info,
                format!("invalid forward URI '{}': {}", forward_uri, e),
            )
        })?;

        debug!(host = %info.host, %uri, "Forwarding request");

        let (mut parts, body) = req.into_parts();
        parts.uri = uri;
        parts.version = Version::HTTP_11;

        // The client's Host header is kept, only per-hop headers are dropped
        for name in HOP_BY_HOP {
            parts.headers.remove(name);
        }
        add_forwarded_headers(&mut parts.headers, &info.host, client_addr);

        match self.client.request(Request::from_parts(parts, body)).await {
            Ok(response) => Ok(response.map(Body::new)),
            Err(e) => Err(ProxyError::new(ProxyErrorKind::Upstream, &info, e.to_string())),
        }
    }

    /// Forward an upgrade request to the target's `host:port`
    ///
    /// A non-101 answer from upstream is relayed unchanged. On 101 the
    /// response is relayed and both connections are spliced in a background
    /// task once the client side has switched too.
    pub async fn forward_upgrade(
        &self,
        mut req: Request<Body>,
        target: &Target,
        client_addr: Option<SocketAddr>,
    ) -> std::result::Result<axum::response::Response, ProxyError> {
        let info = RequestInfo::of(&req);
        let authority = target.authority().to_string();
        let upgrade_type = req
            .headers()
            .get(header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_ascii_lowercase();

        debug!(host = %info.host, %authority, %upgrade_type, "Handling upgrade request");

        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&authority))
            .await
            .map_err(|_| {
                ProxyError::new(ProxyErrorKind::Upstream, &info, format!("connect to {} timed out", authority))
            })?
            .map_err(|e| {
                ProxyError::new(ProxyErrorKind::Upstream, &info, format!("connect to {}: {}", authority, e))
            })?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake::<_, Empty<Bytes>>(TokioIo::new(stream))
            .await
            .map_err(|e| ProxyError::new(ProxyErrorKind::Upstream, &info, e.to_string()))?;

        let conn_host = info.host.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!(host = %conn_host, error = %e, "Upstream upgrade connection closed with error");
            }
        });

        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let mut upstream_req = Request::new(Empty::<Bytes>::new());
        *upstream_req.method_mut() = req.method().clone();
        *upstream_req.uri_mut() = path_and_query
            .parse()
            .map_err(|_| ProxyError::new(ProxyErrorKind::Upstream, &info, "invalid request path"))?;
        *upstream_req.headers_mut() = req.headers().clone();
        add_forwarded_headers(upstream_req.headers_mut(), &info.host, client_addr);

        let client_upgrade = hyper::upgrade::on(&mut req);

        let response = sender
            .send_request(upstream_req)
            .await
            .map_err(|e| ProxyError::new(ProxyErrorKind::Upstream, &info, e.to_string()))?;

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            warn!(host = %info.host, status = %response.status(), "Upstream rejected upgrade request");
            return Ok(response.map(Body::new));
        }

        info!(host = %info.host, %authority, %upgrade_type, "Upgrade accepted by upstream");

        let mut client_response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
        for (name, value) in response.headers() {
            if name == header::CONTENT_LENGTH || name == header::TRANSFER_ENCODING {
                continue;
            }
            client_response = client_response.header(name, value);
        }
        let client_response = client_response
            .body(Body::empty())
            .map_err(|e| ProxyError::new(ProxyErrorKind::Upstream, &info, e.to_string()))?;

        let upstream_upgrade = hyper::upgrade::on(response);
        let host = info.host.clone();
        tokio::spawn(async move {
            match tokio::try_join!(client_upgrade, upstream_upgrade) {
                Ok((client, upstream)) => {
                    let mut client_io = TokioIo::new(client);
                    let mut upstream_io = TokioIo::new(upstream);
                    match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
                        Ok((to_upstream, to_client)) => {
                            debug!(%host, to_upstream, to_client, "Upgraded connection closed");
                        }
                        Err(e) => {
                            debug!(%host, error = %e, "Upgraded connection closed with error");
                        }
                    }
                }
                Err(e) => {
                    error!(%host, error = %e, "Failed to complete protocol upgrade");
                }
            }
        });

        Ok(client_response)
    }
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new()
    }
}

fn add_forwarded_headers(headers: &mut HeaderMap, host: &str, client_addr: Option<SocketAddr>) {
    headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
    if let Ok(value) = HeaderValue::from_str(host) {
        headers.insert("x-forwarded-host", value);
    }
    if let Some(addr) = client_addr {
        if let Ok(value) = HeaderValue::from_str(&addr.ip().to_string()) {
            headers.insert("x-forwarded-for", value);
        }
    }
}

/// Shared edge state
pub struct EdgeState {
    pub routes: Arc<RoutingTable>,
    pub forwarder: Forwarder,
}

/// Build the host-routed proxy router
pub fn edge_router(routes: Arc<RoutingTable>) -> Router {
    let state = Arc::new(EdgeState {
        routes,
        forwarder: Forwarder::new(),
    });

    Router::new()
        .fallback(proxy_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Route on `Host` and hand over to the forwarding engine
async fn proxy_handler(
    State(state): State<Arc<EdgeState>>,
    req: Request<Body>,
) -> axum::response::Response {
    let client_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let host = request_host(&req).to_string();

    if is_upgrade_request(&req) {
        let target = match state.routes.resolve(&host) {
            Ok(target) => target,
            Err(_) => {
                let info = RequestInfo::of(&req);
                return ProxyError::new(ProxyErrorKind::UpgradeRoutingMiss, &info, "no rule")
                    .into_response();
            }
        };

        return match state.forwarder.forward_upgrade(req, target, client_addr).await {
            Ok(response) => response,
            Err(e) => e.into_response(),
        };
    }

    let target = match state.routes.resolve(&host) {
        Ok(target) => target,
        Err(_) => {
            let info = RequestInfo::of(&req);
            return ProxyError::new(ProxyErrorKind::RoutingMiss, &info, "no rule").into_response();
        }
    };

    match state.forwarder.forward_http(req, target, client_addr).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

/// HTTPS edge server
pub struct EdgeServer {
    routes: Arc<RoutingTable>,
    tls: Arc<TlsManager>,
}

impl EdgeServer {
    pub fn new(routes: Arc<RoutingTable>, tls: Arc<TlsManager>) -> Self {
        Self { routes, tls }
    }

    /// Build the Axum router
    pub fn router(&self) -> Router {
        edge_router(self.routes.clone())
    }

    /// Bind the secure port and serve
    pub async fn run(&self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Accept TLS connections on an already bound listener
    ///
    /// Each connection is handshaken with the acceptor current at accept
    /// time, so a certificate reload only affects new connections.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let router = self.router();

        info!(addr = %listener.local_addr()?, "https proxy server live");
        for (host, target) in self.routes.iter() {
            info!("  {} -> {}", host, target.url());
        }

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };
            let acceptor = self.tls.acceptor().await;
            let router = router.clone();

            tokio::spawn(async move {
                let tls_stream = match acceptor.accept(stream).await {
                    Ok(tls_stream) => tls_stream,
                    Err(e) => {
                        debug!(%addr, error = %e, "TLS handshake failed");
                        return;
                    }
                };

                let io = TokioIo::new(tls_stream);
                let service = service_fn(move |mut req: Request<Incoming>| {
                    req.extensions_mut().insert(ConnectInfo(addr));
                    router.clone().oneshot(req)
                });

                if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                    .serve_connection_with_upgrades(io, service)
                    .await
                {
                    debug!(%addr, error = %e, "Error serving connection");
                }
            });
        }
    }
}
