//! Shared harness: a fake backend that serves each instance from an
//! in-process HTTP server, plus raw HTTP/1.1 helpers

#![allow(dead_code)]

use async_trait::async_trait;
use compositor::api::ApiServer;
use compositor::backend::{Backend, ExitStatus, ExitWaiter, ImageSource, InstanceSpec};
use compositor::config::Config;
use compositor::context::AppContext;
use compositor::error::{Error, Result};
use compositor::proxy::ProxyServer;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Archive contents the fake refuses to import
pub const BAD_ARCHIVE: &[u8] = b"not-an-image";

struct FakeInstance {
    version: String,
    active: Arc<AtomicUsize>,
    server: JoinHandle<()>,
}

/// One `destroy` call as the fake saw it
#[derive(Debug, Clone)]
pub struct DestroyRecord {
    pub instance_id: String,
    pub version: String,
    /// Requests the instance's server was still handling at destroy time
    pub active_requests: usize,
}

/// Backend whose instances are hyper servers answering `"<version> <path>"`.
///
/// The image archive's bytes are the version string.
#[derive(Default)]
pub struct FakeBackend {
    instances: Mutex<HashMap<String, FakeInstance>>,
    destroyed: Mutex<Vec<DestroyRecord>>,
}

impl FakeBackend {
    pub fn destroyed(&self) -> Vec<DestroyRecord> {
        self.destroyed.lock().clone()
    }

    pub fn live_versions(&self) -> Vec<String> {
        let mut versions: Vec<String> = self
            .instances
            .lock()
            .values()
            .map(|i| i.version.clone())
            .collect();
        versions.sort();
        versions
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn serve_instance(
    req: Request<Incoming>,
    version: Arc<String>,
    active: Arc<AtomicUsize>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let _active = ActiveGuard::enter(&active);

    if req.headers().contains_key(hyper::header::UPGRADE) {
        tokio::spawn(async move {
            if let Ok(upgraded) = hyper::upgrade::on(req).await {
                let mut io = TokioIo::new(upgraded);
                let mut buf = [0u8; 1024];
                loop {
                    match io.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if io.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });
        return Ok(Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(hyper::header::CONNECTION, "upgrade")
            .header(hyper::header::UPGRADE, "echo")
            .body(Full::new(Bytes::new()))
            .unwrap());
    }

    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_default();

    if req.uri().path() == "/slow" {
        let ms = req
            .uri()
            .query()
            .and_then(|q| q.strip_prefix("ms="))
            .and_then(|v| v.parse().ok())
            .unwrap_or(500);
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    let echo = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string()
    };

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("x-echo-request-id", echo("x-request-id"))
        .header("x-echo-forwarded-proto", echo("x-forwarded-proto"))
        .header("x-echo-forwarded-for", echo("x-forwarded-for"))
        .body(Full::new(Bytes::from(format!("{} {}", version, path))))
        .unwrap())
}

#[async_trait]
impl Backend for FakeBackend {
    fn kind(&self) -> &'static str {
        "fake"
    }

    async fn import_image(&self, archive: Bytes) -> Result<String> {
        if archive.as_ref() == BAD_ARCHIVE {
            return Err(Error::MalformedInput("image archive rejected".to_string()));
        }
        Ok(String::from_utf8_lossy(&archive).to_string())
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<()> {
        let version = match &spec.image {
            ImageSource::Archive(archive) => self.import_image(archive.clone()).await?,
            ImageSource::Reference(name) => name.clone(),
        };
        if self.instances.lock().contains_key(&spec.id) {
            return Err(Error::AlreadyExists(format!("instance '{}'", spec.id)));
        }

        let listener = TcpListener::bind(("127.0.0.1", spec.host_port))
            .await
            .map_err(|e| Error::backend(format!("bind port {}", spec.host_port), e))?;

        let active = Arc::new(AtomicUsize::new(0));
        let shared_version = Arc::new(version.clone());
        let server_active = Arc::clone(&active);
        let server = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let version = Arc::clone(&shared_version);
                let active = Arc::clone(&server_active);
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        serve_instance(req, Arc::clone(&version), Arc::clone(&active))
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .with_upgrades()
                        .await;
                });
            }
        });

        self.instances.lock().insert(
            spec.id.clone(),
            FakeInstance {
                version,
                active,
                server,
            },
        );
        Ok(())
    }

    async fn execute(
        &self,
        instance_id: &str,
        _task: &str,
        _cwd: &str,
        _args: &[String],
    ) -> Result<ExitWaiter> {
        if !self.instances.lock().contains_key(instance_id) {
            return Err(Error::NotFound(format!("instance '{}'", instance_id)));
        }
        Ok(ExitWaiter::ready(ExitStatus::new(0)))
    }

    async fn destroy(&self, instance_id: &str) -> Result<()> {
        let instance = self
            .instances
            .lock()
            .remove(instance_id)
            .ok_or_else(|| Error::NotFound(format!("instance '{}'", instance_id)))?;
        instance.server.abort();
        self.destroyed.lock().push(DestroyRecord {
            instance_id: instance_id.to_string(),
            version: instance.version,
            active_requests: instance.active.load(Ordering::SeqCst),
        });
        Ok(())
    }

    async fn inspect(&self, instance_id: &str) -> Result<serde_json::Value> {
        let instances = self.instances.lock();
        let instance = instances
            .get(instance_id)
            .ok_or_else(|| Error::NotFound(format!("instance '{}'", instance_id)))?;
        Ok(serde_json::json!({
            "id": instance_id,
            "version": instance.version,
        }))
    }

    async fn close(&self) -> Vec<Error> {
        let drained: Vec<(String, FakeInstance)> = self.instances.lock().drain().collect();
        for (_, instance) in drained {
            instance.server.abort();
        }
        Vec::new()
    }
}

/// Each environment gets its own slice of host ports so tests can run in
/// parallel
fn next_port_range() -> (u16, u16) {
    static NEXT: AtomicU16 = AtomicU16::new(0);
    let slot = NEXT.fetch_add(1, Ordering::SeqCst);
    let start = 42000 + slot * 20;
    (start, start + 19)
}

pub struct TestEnv {
    pub ctx: Arc<AppContext>,
    pub backend: Arc<FakeBackend>,
    pub proxy_addr: SocketAddr,
    pub api_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
}

impl TestEnv {
    pub async fn start() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(customize: impl FnOnce(&mut Config)) -> Self {
        let (start, end) = next_port_range();
        let mut config = Config::default();
        config.ports.start = start;
        config.ports.end = end;
        config.deploy.ready_timeout_secs = 2;
        config.deploy.teardown_backoff_ms = 10;
        config.deploy.shutdown_timeout_secs = 2;
        config.server.request_timeout_secs = 5;
        customize(&mut config);

        let backend = Arc::new(FakeBackend::default());
        let ctx = Arc::new(AppContext::new(backend.clone() as Arc<dyn Backend>, &config));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy_listener.local_addr().unwrap();
        let proxy = ProxyServer::new(proxy_addr, Arc::clone(&ctx), shutdown_rx.clone());
        tokio::spawn(proxy.serve(proxy_listener));

        let api_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let api_addr = api_listener.local_addr().unwrap();
        let api = ApiServer::new(api_addr, Arc::clone(&ctx), shutdown_rx);
        tokio::spawn(api.serve(api_listener));

        Self {
            ctx,
            backend,
            proxy_addr,
            api_addr,
            shutdown_tx,
        }
    }

    pub async fn get(&self, path: &str) -> HttpResponse {
        get(self.proxy_addr, path, &[]).await
    }

    pub async fn api_get(&self, path: &str) -> HttpResponse {
        get(self.api_addr, path, &[]).await
    }

    pub async fn register(&self, route: &str, archive: &[u8]) -> HttpResponse {
        post(self.api_addr, &format!("/register/{}", route), archive, &[]).await
    }
}

impl Drop for TestEnv {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub fn parse_response(raw: &[u8]) -> HttpResponse {
    let text = String::from_utf8_lossy(raw);
    let (head, body) = text.split_once("\r\n\r\n").unwrap_or((&text, ""));
    let mut lines = head.lines();
    let status = lines
        .next()
        .and_then(|line| line.split(' ').nth(1))
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
        .collect();
    HttpResponse {
        status,
        headers,
        body: body.to_string(),
    }
}

pub async fn send_raw(addr: SocketAddr, request: &[u8]) -> HttpResponse {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut raw = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut raw))
        .await
        .expect("response timed out")
        .unwrap();
    parse_response(&raw)
}

pub async fn get(addr: SocketAddr, path: &str, headers: &[(&str, &str)]) -> HttpResponse {
    let mut request = format!("GET {} HTTP/1.1\r\nHost: test.local\r\nConnection: close\r\n", path);
    for (name, value) in headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("\r\n");
    send_raw(addr, request.as_bytes()).await
}

pub async fn post(
    addr: SocketAddr,
    path: &str,
    body: &[u8],
    headers: &[(&str, &str)],
) -> HttpResponse {
    let mut request = format!(
        "POST {} HTTP/1.1\r\nHost: test.local\r\nConnection: close\r\nContent-Length: {}\r\n",
        path,
        body.len()
    );
    for (name, value) in headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("\r\n");
    let mut raw = request.into_bytes();
    raw.extend_from_slice(body);
    send_raw(addr, &raw).await
}

/// Poll `check` until it holds or five seconds pass
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never became true");
}
