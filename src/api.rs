use crate::context::AppContext;
use crate::error::Error;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

fn json_ok<T: Serialize>(value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_string(value) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => {
            error!(error = %e, "Failed to serialize API response");
            response(StatusCode::INTERNAL_SERVER_ERROR, "serialization failed")
        }
    }
}

fn error_response(err: &Error) -> Response<Full<Bytes>> {
    response(err.status_code(), err.to_string())
}

/// Registration and inspection API
pub struct ApiServer {
    bind_addr: SocketAddr,
    ctx: Arc<AppContext>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl ApiServer {
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

    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %listener.local_addr()?, protocol, "API server listening");

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
                                            if let Err(e) = serve_api_connection(tls_stream, ctx).await {
                                                debug!(addr = %addr, error = %e, "API TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "API TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = serve_api_connection(stream, ctx).await {
                                    debug!(addr = %addr, error = %e, "API connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept API connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("API server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_api_connection<S>(stream: S, ctx: Arc<AppContext>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let ctx = Arc::clone(&ctx);
        async move { handle_api_request(req, ctx).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("API connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

/// Everything after `prefix`, if the path starts with it
fn path_param<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    path.strip_prefix(prefix)
}

async fn handle_api_request(
    req: Request<Incoming>,
    ctx: Arc<AppContext>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "API request");

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        (&Method::POST, path) if path.starts_with("/register/") => {
            let authorized = ctx
                .api_token
                .as_deref()
                .map_or(true, |token| check_auth(&req, token));
            if !authorized {
                warn!(path, "Unauthorized API request");
                response(StatusCode::UNAUTHORIZED, "unauthorized")
            } else {
                let route = path_param(path, "/register/").unwrap_or_default().to_string();
                register(req, &ctx, &route).await
            }
        }

        (&Method::GET, path) if path.starts_with("/register/") => {
            let name = path_param(path, "/register/").unwrap_or_default();
            match ctx.router.route_status(name) {
                Ok(status) => json_ok(&status),
                Err(e) => error_response(&e),
            }
        }

        (&Method::GET, path) if path.starts_with("/config/") => {
            let name = path_param(path, "/config/").unwrap_or_default();
            inspect_route(&ctx, name).await
        }

        (&Method::GET, "/routes") => {
            let routes = ctx.router.list_routes();
            let body = serde_json::json!({
                "count": routes.len(),
                "routes": routes,
                "pending_teardowns": ctx.deployer.pending_teardowns(),
                "allocated_ports": ctx.ports.allocated_count(),
                "upstream": ctx.pool.snapshot(),
            });
            json_response(StatusCode::OK, body.to_string())
        }

        (&Method::GET, path) if path.starts_with("/vm/") => {
            let name = path_param(path, "/vm/").unwrap_or_default();
            match &ctx.vm {
                None => response(StatusCode::NOT_FOUND, "vm support is disabled"),
                Some(vm) => match vm.info(name).await {
                    Ok(info) => json_ok(&info),
                    Err(e) => {
                        warn!(vm = name, error = %e, "VM info failed");
                        error_response(&e)
                    }
                },
            }
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

async fn register(req: Request<Incoming>, ctx: &AppContext, route: &str) -> Response<Full<Bytes>> {
    let archive = match Limited::new(req.into_body(), ctx.max_upload_bytes).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            warn!(route, limit = ctx.max_upload_bytes, "Image upload too large");
            return response(StatusCode::PAYLOAD_TOO_LARGE, "image archive too large");
        }
        Err(e) => {
            warn!(route, error = %e, "Failed to read image upload");
            return response(StatusCode::BAD_REQUEST, "failed to read request body");
        }
    };

    info!(route, bytes = archive.len(), "Registration received");
    match ctx.deployer.register(route, archive).await {
        Ok(deployment) => {
            info!(
                route,
                instance_id = %deployment.instance_id,
                port = deployment.port,
                "Registration enabled"
            );
            response(StatusCode::OK, "enabled")
        }
        Err(e) => {
            error!(route, error = %e, "Registration failed");
            registration_error(&e)
        }
    }
}

/// A lookup miss while provisioning is a server-side failure, not an absent
/// resource the registrant asked for.
fn registration_error(err: &Error) -> Response<Full<Bytes>> {
    match err {
        Error::NotFound(_) => response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        _ => error_response(err),
    }
}

async fn inspect_route(ctx: &AppContext, name: &str) -> Response<Full<Bytes>> {
    let route = match ctx.router.get_route(name) {
        Ok(route) => route,
        Err(e) => return error_response(&e),
    };
    match ctx.backend.inspect(&route.backing_id).await {
        Ok(runtime) => json_ok(&serde_json::json!({
            "route": name,
            "instance_id": route.backing_id,
            "backend": ctx.backend.kind(),
            "runtime": runtime,
        })),
        Err(e) => {
            warn!(route = name, error = %e, "Inspection failed");
            error_response(&e)
        }
    }
}
