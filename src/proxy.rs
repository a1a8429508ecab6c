use crate::bridge;
use crate::context::AppContext;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::router::Lease;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Largest upgrade response head accepted from a backend
const MAX_UPGRADE_RESPONSE_HEAD: usize = 16 * 1024;

/// The ingress: routes `/<route>/<rest>` to the route's live backend
pub struct ProxyServer {
    bind_addr: SocketAddr,
    ctx: Arc<AppContext>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, ctx: Arc<AppContext>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            ctx,
            shutdown_rx,
            tls_acceptor: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %listener.local_addr()?, protocol, "Ingress listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let ctx = Arc::clone(&self.ctx);
                            let tls_acceptor = self.tls_acceptor.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = handle_connection(tls_stream, addr, ctx, true).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, addr, ctx, false).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Ingress shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    ctx: Arc<AppContext>,
    is_tls: bool,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = Arc::clone(&ctx);
        async move { handle_request(req, ctx, addr, is_tls).await }
    });

    // HTTP/1.1 connections can still be upgraded (WebSocket)
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    ctx: Arc<AppContext>,
    client_addr: SocketAddr,
    is_tls: bool,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // Overwrite rather than append: this proxy is the first trusted hop
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    let proto = if is_tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

    debug!(method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    if is_upgrade_request(&req) {
        return handle_upgrade(req, ctx, request_id).await;
    }

    let req = req.map(|body| body.boxed());
    Ok(ctx.router.dispatch(req, &ctx.pool, ctx.request_timeout).await)
}

/// Check if a request is a WebSocket upgrade request
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let has_upgrade_header = req.headers().contains_key(hyper::header::UPGRADE);

    has_upgrade_connection && has_upgrade_header
}

/// Get the value of the Upgrade header
fn get_upgrade_type<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
}

/// Build the raw HTTP upgrade request to send to the backend
fn build_upgrade_request<B>(req: &Request<B>, path: &str, authority: &str) -> Vec<u8> {
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("Host: {}\r\n", authority));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Parse the status line and headers of the backend's upgrade response
fn parse_upgrade_response(head: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(head).ok()?;
    let mut lines = response_str.lines();

    // HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }

    let status_code: u16 = parts[1].parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Read the response head; returns it plus any bytes the backend already
/// sent past it
async fn read_upgrade_response(stream: &mut TcpStream) -> std::io::Result<Option<(Vec<u8>, Vec<u8>)>> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = find_head_end(&buf) {
            let rest = buf.split_off(end);
            return Ok(Some((buf, rest)));
        }
        if buf.len() > MAX_UPGRADE_RESPONSE_HEAD {
            return Ok(None);
        }
    }
}

fn empty_body() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Bridge an upgrade request to the route's backend.
///
/// The lease's in-flight guard moves into the bridging task, so an upgraded
/// connection keeps its route from draining until it closes.
async fn handle_upgrade(
    req: Request<Incoming>,
    ctx: Arc<AppContext>,
    request_id: String,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let lease = match ctx.router.resolve(req.uri()) {
        Ok(lease) => lease,
        Err(ProxyErrorCode::MissingRoute) => {
            return Ok(json_error_response(
                ProxyErrorCode::MissingRoute,
                "Request path has no route segment",
            ));
        }
        Err(code) => return Ok(json_error_response(code, "Unknown route")),
    };
    let Lease {
        route_name,
        route,
        path,
        guard,
    } = lease;

    let upgrade_type = get_upgrade_type(&req).unwrap_or_else(|| "unknown".to_string());
    debug!(route = %route_name, request_id, upgrade_type, "Handling upgrade request");

    let Some(authority) = route.target.authority().map(|a| a.to_string()) else {
        return Ok(json_error_response(
            ProxyErrorCode::InternalError,
            "Invalid upstream target",
        ));
    };
    let upstream_path = match route.upstream_uri(&path) {
        Ok(uri) => uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string()),
        Err(e) => {
            error!(route = %route_name, error = %e, "Failed to build upstream URI");
            return Ok(json_error_response(ProxyErrorCode::InternalError, "Invalid upstream path"));
        }
    };

    let raw_request = build_upgrade_request(&req, &upstream_path, &authority);

    // The handshake runs under the same deadline as a forwarded request; a
    // backend that accepts and then stays silent must not pin the lease.
    let handshake = async {
        let mut backend_stream = match TcpStream::connect(&authority).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(route = %route_name, backing_id = %route.backing_id, error = %e, "Failed to connect to backend for upgrade");
                return Err(json_error_response(
                    ProxyErrorCode::ConnectionFailed,
                    "Failed to connect to backend",
                ));
            }
        };

        if let Err(e) = backend_stream.write_all(&raw_request).await {
            error!(route = %route_name, error = %e, "Failed to send upgrade request to backend");
            return Err(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to send upgrade request",
            ));
        }

        match read_upgrade_response(&mut backend_stream).await {
            Ok(Some((head, early_data))) => Ok((backend_stream, head, early_data)),
            Ok(None) => {
                error!(route = %route_name, "Backend closed or overflowed before completing the upgrade response");
                Err(json_error_response(
                    ProxyErrorCode::ConnectionFailed,
                    "Backend closed connection",
                ))
            }
            Err(e) => {
                error!(route = %route_name, error = %e, "Failed to read upgrade response from backend");
                Err(json_error_response(
                    ProxyErrorCode::ConnectionFailed,
                    "Failed to read backend response",
                ))
            }
        }
    };

    let (mut backend_stream, head, early_data) =
        match tokio::time::timeout(ctx.request_timeout, handshake).await {
            Ok(Ok(parts)) => parts,
            Ok(Err(response)) => return Ok(response),
            Err(_) => {
                warn!(
                    route = %route_name,
                    backing_id = %route.backing_id,
                    timeout_secs = ctx.request_timeout.as_secs(),
                    "Backend did not complete the upgrade handshake in time"
                );
                return Ok(json_error_response(
                    ProxyErrorCode::RequestTimeout,
                    format!(
                        "Upgrade handshake timed out after {} seconds",
                        ctx.request_timeout.as_secs()
                    ),
                ));
            }
        };

    let (status, response_headers) = match parse_upgrade_response(&head) {
        Some(parsed) => parsed,
        None => {
            error!(route = %route_name, "Failed to parse backend upgrade response");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Invalid upgrade response from backend",
            ));
        }
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(route = %route_name, status = %status, "Backend rejected upgrade request");
        let mut response = Response::builder().status(status);
        for (name, value) in &response_headers {
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        return Ok(response
            .body(empty_body())
            .expect("valid response builder"));
    }

    info!(route = %route_name, request_id, upgrade_type, "Upgrade successful");

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_headers {
        // hop-by-hop framing is hyper's business
        let name_lower = name.to_lowercase();
        if name_lower == "content-length" || name_lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }

    let response = response
        .body(empty_body())
        .expect("valid response builder");

    tokio::spawn(async move {
        let _guard = guard;
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let mut client_io = TokioIo::new(upgraded);
                if !early_data.is_empty() {
                    if let Err(e) = client_io.write_all(&early_data).await {
                        debug!(route = %route_name, request_id, error = %e, "Failed to relay early backend data");
                        return;
                    }
                }
                if let Err(e) = bridge::connect(&mut client_io, &mut backend_stream).await {
                    debug!(route = %route_name, request_id, error = %e, "Upgraded connection closed with error");
                }
            }
            Err(e) => {
                error!(route = %route_name, error = %e, "Failed to upgrade client connection");
            }
        }
        debug!(route = %route_name, request_id, "Upgraded connection closed");
    });

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(headers: &[(&str, &str)]) -> Request<()> {
        let mut builder = Request::builder().uri("/svc/ws?room=1");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_is_upgrade_request() {
        assert!(is_upgrade_request(&request(&[
            ("connection", "keep-alive, Upgrade"),
            ("upgrade", "websocket"),
        ])));
        assert!(!is_upgrade_request(&request(&[("upgrade", "websocket")])));
        assert!(!is_upgrade_request(&request(&[("connection", "upgrade")])));
        assert_eq!(
            get_upgrade_type(&request(&[("upgrade", "WebSocket")])).as_deref(),
            Some("websocket")
        );
    }

    #[test]
    fn test_build_upgrade_request_rewrites_host_and_path() {
        let req = request(&[
            ("host", "public.example.com"),
            ("connection", "Upgrade"),
            ("upgrade", "websocket"),
        ]);
        let raw = String::from_utf8(build_upgrade_request(&req, "/ws?room=1", "127.0.0.1:49152")).unwrap();

        assert!(raw.starts_with("GET /ws?room=1 HTTP/1.1\r\n"));
        assert!(raw.contains("Host: 127.0.0.1:49152\r\n"));
        assert!(!raw.contains("public.example.com"));
        assert!(raw.contains("upgrade: websocket\r\n"));
        assert!(raw.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_parse_upgrade_response() {
        let head = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let (status, headers) = parse_upgrade_response(head).unwrap();
        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0], ("Upgrade".to_string(), "websocket".to_string()));

        assert!(parse_upgrade_response(b"garbage").is_none());
    }

    #[test]
    fn test_find_head_end() {
        let data = b"HTTP/1.1 101 OK\r\nA: b\r\n\r\nframe";
        let end = find_head_end(data).unwrap();
        assert_eq!(&data[end..], b"frame");
        assert!(find_head_end(b"HTTP/1.1 101 OK\r\n").is_none());
    }
}
