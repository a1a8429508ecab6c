//! Shared upstream client
//!
//! Every routed request goes through one keep-alive client, so connections
//! to a live instance are reused across requests. Connections to a retired
//! instance simply age out of the idle pool.

use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("upstream request failed: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
}

/// Tuning for the upstream client
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Point-in-time forwarding counters, reported by the routes listing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub forwarded: u64,
    pub failed: u64,
}

pub struct ConnectionPool {
    client: Client<HttpConnector, BoxBody<Bytes, hyper::Error>>,
    forwarded: AtomicU64,
    failed: AtomicU64,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Upstream client ready"
        );

        Self {
            client,
            forwarded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Send `req` to `upstream` with its method, headers and body intact.
    ///
    /// The inbound Host header is dropped; the client derives it from the
    /// instance address.
    pub async fn send_request(
        &self,
        req: Request<BoxBody<Bytes, hyper::Error>>,
        upstream: Uri,
    ) -> Result<Response<Incoming>, PoolError> {
        let (mut parts, body) = req.into_parts();
        parts.uri = upstream;
        parts.headers.remove(hyper::header::HOST);

        self.forwarded.fetch_add(1, Ordering::Relaxed);
        self.client
            .request(Request::from_parts(parts, body))
            .await
            .map_err(|e| {
                self.failed.fetch_add(1, Ordering::Relaxed);
                PoolError::from(e)
            })
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}
