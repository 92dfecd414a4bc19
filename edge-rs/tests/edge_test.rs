//! End-to-end tests against real sockets

use async_trait::async_trait;
use axum::{
    extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::IntoResponse,
    routing::get,
    Router,
};
use edge_rs::renewal::{CertificateIssuer, IssuerOutput, RenewalJob};
use edge_rs::{edge_router, EdgeConfig, EdgeError, Layout, RoutingTable, ServingMode};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::client::TlsStream;
use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest, Message};

async fn echo_request(method: Method, uri: Uri, headers: HeaderMap) -> impl IntoResponse {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string()
    };
    (
        StatusCode::CREATED,
        [("x-upstream", "yes")],
        format!(
            "{} {} host={} proto={} fwd={}",
            method,
            uri,
            header("host"),
            header("x-forwarded-proto"),
            header("x-forwarded-for"),
        ),
    )
}

async fn echo_socket(mut socket: WebSocket) {
    while let Some(Ok(msg)) = socket.recv().await {
        match msg {
            AxumMessage::Text(text) => {
                if socket.send(AxumMessage::Text(format!("echo: {}", text))).await.is_err() {
                    break;
                }
            }
            AxumMessage::Close(_) => break,
            _ => {}
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(echo_socket)
}

/// Plain HTTP upstream with an echo endpoint and a WebSocket echo
async fn start_upstream() -> SocketAddr {
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .fallback(echo_request);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Upstream that only counts accepted connections
async fn start_counting_upstream() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            drop(stream);
        }
    });
    (addr, accepted)
}

/// Edge router over plain TCP, so tests can focus on routing and forwarding
async fn start_edge(routes: RoutingTable) -> SocketAddr {
    let app = edge_router(Arc::new(routes));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

async fn get_with_host(edge: SocketAddr, host: &str, path: &str) -> reqwest::Response {
    reqwest::Client::new()
        .get(format!("http://{}{}", edge, path))
        .header("host", host)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_request_is_forwarded_by_host() {
    let upstream = start_upstream().await;
    let routes = RoutingTable::new([
        ("app.test", format!("http://{}", upstream)),
        ("other.test", "http://127.0.0.1:9".to_string()),
    ])
    .unwrap();
    let edge = start_edge(routes).await;

    let response = get_with_host(edge, "app.test", "/hello/world?x=1&y=%20").await;

    assert_eq!(response.status(), reqwest::StatusCode::CREATED);
    assert_eq!(response.headers()["x-upstream"], "yes");
    let body = response.text().await.unwrap();
    assert_eq!(
        body,
        "GET /hello/world?x=1&y=%20 host=app.test proto=https fwd=127.0.0.1"
    );
}

#[tokio::test]
async fn test_unknown_host_is_500() {
    let (upstream, accepted) = start_counting_upstream().await;
    let routes = RoutingTable::new([("app.test", format!("http://{}", upstream))]).unwrap();
    let edge = start_edge(routes).await;

    let response = get_with_host(edge, "nope.test", "/").await;

    assert_eq!(response.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        response.text().await.unwrap(),
        "ERROR: Unknown domain 'nope.test'"
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_dead_upstream_is_500() {
    let dead = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let routes = RoutingTable::new([("app.test", format!("http://{}", dead))]).unwrap();
    let edge = start_edge(routes).await;

    let response = get_with_host(edge, "app.test", "/").await;

    assert_eq!(response.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        response.text().await.unwrap(),
        "ERROR: Failed to proxy request."
    );
}

#[tokio::test]
async fn test_websocket_is_spliced() {
    let upstream = start_upstream().await;
    let routes = RoutingTable::new([("app.test", format!("http://{}", upstream))]).unwrap();
    let edge = start_edge(routes).await;

    let mut request = format!("ws://{}/ws", edge).into_client_request().unwrap();
    request
        .headers_mut()
        .insert("host", "app.test".parse().unwrap());

    let (mut socket, response) = tokio_tungstenite::connect_async(request).await.unwrap();
    assert_eq!(response.status(), 101);

    socket.send(Message::Text("ping".into())).await.unwrap();
    let reply = socket.next().await.unwrap().unwrap();
    assert_eq!(reply, Message::Text("echo: ping".into()));

    socket.send(Message::Text("again".into())).await.unwrap();
    let reply = socket.next().await.unwrap().unwrap();
    assert_eq!(reply, Message::Text("echo: again".into()));

    socket.close(None).await.unwrap();
}

#[tokio::test]
async fn test_websocket_unknown_host_is_400() {
    let (upstream, accepted) = start_counting_upstream().await;
    let routes = RoutingTable::new([("app.test", format!("http://{}", upstream))]).unwrap();
    let edge = start_edge(routes).await;

    let mut request = format!("ws://{}/ws", edge).into_client_request().unwrap();
    request
        .headers_mut()
        .insert("host", "nope.test".parse().unwrap());

    match tokio_tungstenite::connect_async(request).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 400),
        other => panic!("expected HTTP 400, got {:?}", other.map(|(_, r)| r.status())),
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 0);
}

/// Issuer that always fails and counts attempts
struct FailingIssuer {
    calls: AtomicUsize,
}

#[async_trait]
impl CertificateIssuer for FailingIssuer {
    async fn issue(&self, _job: &RenewalJob) -> edge_rs::Result<IssuerOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(EdgeError::Renewal("certbot: not found".to_string()))
    }
}

/// Self-signed bundle for `localhost`; returns the certificate DER
fn write_localhost_bundle(live_dir: &Path) -> Vec<u8> {
    let dir = live_dir.join("localhost");
    std::fs::create_dir_all(&dir).unwrap();

    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    std::fs::write(dir.join("fullchain.pem"), cert.cert.pem()).unwrap();
    std::fs::write(dir.join("privkey.pem"), cert.key_pair.serialize_pem()).unwrap();
    cert.cert.der().to_vec()
}

fn serving_config(base: &Path) -> EdgeConfig {
    EdgeConfig {
        rules_path: base.join("rules.toml"),
        email: "admin@example.com".to_string(),
        manual_renewal: false,
        layout: Layout::new(base),
        http_addr: "127.0.0.1:0".parse().unwrap(),
        https_addr: "127.0.0.1:0".parse().unwrap(),
        certbot: PathBuf::from("certbot"),
        renew_interval: Duration::from_millis(50),
    }
}

async fn tls_connect(addr: SocketAddr, cert_der: Vec<u8>) -> TlsStream<TcpStream> {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(&rustls::Certificate(cert_der)).unwrap();
    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

    let stream = TcpStream::connect(addr).await.unwrap();
    let server_name = rustls::ServerName::try_from("localhost").unwrap();
    connector.connect(server_name, stream).await.unwrap()
}

async fn https_get(addr: SocketAddr, cert_der: Vec<u8>, path: &str) -> String {
    let mut tls = tls_connect(addr, cert_der).await;

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        path
    );
    tls.write_all(request.as_bytes()).await.unwrap();

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match tls.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[tokio::test]
async fn test_serving_mode_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let config = serving_config(dir.path());
    let cert_der = write_localhost_bundle(&config.layout.live_dir());

    let upstream = start_upstream().await;
    let routes = Arc::new(RoutingTable::new([("localhost", format!("http://{}", upstream))]).unwrap());
    let issuer = Arc::new(FailingIssuer {
        calls: AtomicUsize::new(0),
    });

    let serving = ServingMode::prepare(&config, routes, issuer.clone()).unwrap();
    let https = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let https_addr = https.local_addr().unwrap();
    let http_addr = http.local_addr().unwrap();
    let server = tokio::spawn(serving.run(https, http));

    let response = https_get(https_addr, cert_der.clone(), "/over/tls?q=1").await;
    assert!(response.starts_with("HTTP/1.1 201"), "{}", response);
    assert!(response.contains("GET /over/tls?q=1 host=localhost proto=https"));

    // WebSocket over the TLS listener
    let tls = tls_connect(https_addr, cert_der.clone()).await;
    let request = "wss://localhost/ws".into_client_request().unwrap();
    let (mut socket, response) = tokio_tungstenite::client_async(request, tls).await.unwrap();
    assert_eq!(response.status(), 101);
    socket.send(Message::Text("over tls".into())).await.unwrap();
    let reply = socket.next().await.unwrap().unwrap();
    assert_eq!(reply, Message::Text("echo: over tls".into()));
    socket.close(None).await.unwrap();

    // Plain HTTP goes to HTTPS on the same host and path
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();
    let redirect = client
        .get(format!("http://{}/some/page?a=b", http_addr))
        .header("host", "localhost")
        .send()
        .await
        .unwrap();
    assert_eq!(redirect.status(), reqwest::StatusCode::MOVED_PERMANENTLY);
    assert_eq!(redirect.headers()["location"], "https://localhost/some/page?a=b");
    assert_eq!(redirect.headers()["cache-control"], "max-age=3600");

    // Failed scheduled renewals leave the server running
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(issuer.calls.load(Ordering::SeqCst) >= 2);
    assert!(!server.is_finished());

    let response = https_get(https_addr, cert_der, "/still/up").await;
    assert!(response.starts_with("HTTP/1.1 201"), "{}", response);

    server.abort();
}

#[tokio::test]
async fn test_serving_mode_requires_certificate() {
    let dir = tempfile::tempdir().unwrap();
    let config = serving_config(dir.path());
    let routes = Arc::new(RoutingTable::new([("localhost", "http://127.0.0.1:3000")]).unwrap());
    let issuer = Arc::new(FailingIssuer {
        calls: AtomicUsize::new(0),
    });

    let result = ServingMode::prepare(&config, routes, issuer.clone());
    assert!(matches!(result, Err(EdgeError::NoCertificate(_))));
    assert_eq!(issuer.calls.load(Ordering::SeqCst), 0);
}
