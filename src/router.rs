//! Route table for the ingress: route name to live upstream plus its
//! in-flight counter.
//!
//! The table is a single [`Registry`]. Dispatch enters a route's counter while
//! the table lock is held, so once [`Router::remove_route`] returns no new
//! request can reach the detached upstream and the caller can wait for the
//! detached counter to drain.

use crate::drain::{InFlight, InFlightGuard};
use crate::error::{json_error_response, Error, ProxyErrorCode, Result};
use crate::pool::ConnectionPool;
use crate::registry::Registry;
use chrono::{DateTime, Utc};
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame, SizeHint};
use hyper::{Request, Response, Uri};
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::{debug, error, warn};

/// One live route entry
#[derive(Debug)]
pub struct ProxyRoute {
    pub backing_id: String,
    pub target: Uri,
    pub created_at: DateTime<Utc>,
    in_flight: Arc<InFlight>,
}

impl ProxyRoute {
    pub fn in_flight(&self) -> usize {
        self.in_flight.current()
    }

    /// Upstream URI for a rewritten request path (path plus optional query)
    pub fn upstream_uri(&self, path_and_query: &str) -> Result<Uri> {
        upstream_uri(&self.target, path_and_query)
    }
}

/// A route entry that has been removed from the table.
///
/// Owns the only remaining handle to the route's counter besides the guards
/// of requests still in flight.
#[derive(Debug, Clone)]
pub struct DetachedRoute {
    pub backing_id: String,
    pub target: Uri,
    pub in_flight: Arc<InFlight>,
}

impl DetachedRoute {
    /// Host port of the detached upstream
    pub fn port(&self) -> Option<u16> {
        self.target.port_u16()
    }

    pub async fn wait_drained(&self) {
        self.in_flight.wait_idle().await
    }
}

/// Serializable view of a route
#[derive(Debug, Clone, Serialize)]
pub struct RouteStatus {
    pub name: String,
    pub backing_id: String,
    pub target: String,
    pub in_flight: usize,
    pub created_at: DateTime<Utc>,
}

/// A resolved request: the route it maps to, the rewritten upstream path
/// and the in-flight guard taken for it
pub struct Lease {
    pub route_name: String,
    pub route: Arc<ProxyRoute>,
    pub path: String,
    pub guard: InFlightGuard,
}

pub struct Router {
    routes: Registry<String, Arc<ProxyRoute>>,
    route_prefix: Option<String>,
}

impl Router {
    /// `route_prefix` is an optional mount point stripped before the route
    /// segment is read, e.g. `/apps` makes `/apps/svc/health` resolve `svc`.
    pub fn new(route_prefix: Option<String>) -> Self {
        let route_prefix = route_prefix
            .map(|p| p.trim_end_matches('/').to_string())
            .filter(|p| !p.is_empty());
        Self {
            routes: Registry::new("route"),
            route_prefix,
        }
    }

    /// Install `name` pointing at `target` with a fresh zero counter
    pub fn add_route(&self, name: &str, backing_id: &str, target: &str) -> Result<()> {
        let target = parse_target(target)?;
        let route = Arc::new(ProxyRoute {
            backing_id: backing_id.to_string(),
            target,
            created_at: Utc::now(),
            in_flight: InFlight::new(),
        });
        self.routes.create(name.to_string(), route)?;
        debug!(route = name, backing_id, "Route added");
        Ok(())
    }

    pub fn get_route(&self, name: &str) -> Result<Arc<ProxyRoute>> {
        self.routes.get(name)
    }

    /// Detach `name` and hand its counter to the caller
    pub fn remove_route(&self, name: &str) -> Result<DetachedRoute> {
        let route = self.routes.delete(name)?;
        debug!(
            route = name,
            backing_id = %route.backing_id,
            in_flight = route.in_flight(),
            "Route removed"
        );
        Ok(DetachedRoute {
            backing_id: route.backing_id.clone(),
            target: route.target.clone(),
            in_flight: Arc::clone(&route.in_flight),
        })
    }

    /// Detach every route (process teardown)
    pub fn detach_all(&self) -> Vec<(String, DetachedRoute)> {
        self.routes
            .drain()
            .into_iter()
            .map(|(name, route)| {
                let detached = DetachedRoute {
                    backing_id: route.backing_id.clone(),
                    target: route.target.clone(),
                    in_flight: Arc::clone(&route.in_flight),
                };
                (name, detached)
            })
            .collect()
    }

    pub fn route_status(&self, name: &str) -> Result<RouteStatus> {
        let route = self.routes.get(name)?;
        Ok(status_of(name, &route))
    }

    /// Every route, sorted by name
    pub fn list_routes(&self) -> Vec<RouteStatus> {
        let mut routes: Vec<RouteStatus> = self
            .routes
            .entries()
            .iter()
            .map(|(name, route)| status_of(name, route))
            .collect();
        routes.sort_by(|a, b| a.name.cmp(&b.name));
        routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Split the request URI into route name and rewritten path
    pub fn split<'a>(&self, uri: &'a Uri) -> Option<(&'a str, String)> {
        let mut path = uri.path();
        if let Some(prefix) = &self.route_prefix {
            path = path.strip_prefix(prefix.as_str())?;
            if !path.is_empty() && !path.starts_with('/') {
                return None;
            }
        }
        let (name, rest) = split_route_path(path)?;
        let rewritten = match uri.query() {
            Some(query) => format!("{}?{}", rest, query),
            None => rest,
        };
        Some((name, rewritten))
    }

    /// Resolve a request to its route and enter the route's counter.
    ///
    /// The counter is entered under the table lock: a concurrent
    /// `remove_route` either happens before (404) or after (the detached
    /// counter already accounts for this request).
    pub fn resolve(&self, uri: &Uri) -> std::result::Result<Lease, ProxyErrorCode> {
        let (name, path) = self.split(uri).ok_or(ProxyErrorCode::MissingRoute)?;
        let (route, guard) = self
            .routes
            .with(name, |route| (Arc::clone(route), route.in_flight.enter()))
            .map_err(|_| ProxyErrorCode::UnknownRoute)?;
        Ok(Lease {
            route_name: name.to_string(),
            route,
            path,
            guard,
        })
    }

    /// Forward a request to the route named by its first path segment.
    ///
    /// Never fails: lookup and upstream errors become JSON error responses.
    /// The returned body holds the in-flight guard until it is fully
    /// streamed or dropped.
    pub async fn dispatch(
        &self,
        req: Request<BoxBody<Bytes, hyper::Error>>,
        pool: &ConnectionPool,
        timeout: Duration,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let lease = match self.resolve(req.uri()) {
            Ok(lease) => lease,
            Err(ProxyErrorCode::MissingRoute) => {
                return json_error_response(
                    ProxyErrorCode::MissingRoute,
                    "Request path has no route segment",
                );
            }
            Err(code) => {
                // Don't echo the requested name back
                return json_error_response(code, "Unknown route");
            }
        };
        forward(req, lease, pool, timeout).await
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Send a leased request upstream and wrap the response body with the
/// lease's guard
pub async fn forward(
    req: Request<BoxBody<Bytes, hyper::Error>>,
    lease: Lease,
    pool: &ConnectionPool,
    timeout: Duration,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let Lease {
        route_name,
        route,
        path,
        guard,
    } = lease;

    let upstream = match route.upstream_uri(&path) {
        Ok(uri) => uri,
        Err(e) => {
            error!(route = %route_name, error = %e, "Failed to build upstream URI");
            return json_error_response(ProxyErrorCode::InternalError, "Invalid upstream path");
        }
    };

    debug!(route = %route_name, upstream = %upstream, "Forwarding request");

    match tokio::time::timeout(timeout, pool.send_request(req, upstream)).await {
        Ok(Ok(response)) => response.map(|body| GuardedBody::new(body.boxed(), guard).boxed()),
        Ok(Err(e)) => {
            error!(route = %route_name, backing_id = %route.backing_id, error = %e, "Failed to forward request");
            json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to backend")
        }
        Err(_) => {
            warn!(
                route = %route_name,
                backing_id = %route.backing_id,
                timeout_secs = timeout.as_secs(),
                "Request timed out"
            );
            json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!("Request timed out after {} seconds", timeout.as_secs()),
            )
        }
    }
}

/// Split `/<route>/<rest...>` into the route name and `/<rest...>`.
///
/// Returns `None` when the first segment is empty.
pub fn split_route_path(path: &str) -> Option<(&str, String)> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let (name, rest) = match trimmed.split_once('/') {
        Some((name, rest)) => (name, rest),
        None => (trimmed, ""),
    };
    if name.is_empty() {
        return None;
    }
    Some((name, format!("/{}", rest)))
}

/// Parse and check a route target: plain http with a host
pub fn parse_target(target: &str) -> Result<Uri> {
    let uri: Uri = target
        .parse()
        .map_err(|e| Error::MalformedInput(format!("target '{}': {}", target, e)))?;
    if uri.scheme_str() != Some("http") {
        return Err(Error::MalformedInput(format!(
            "target '{}': only http targets are supported",
            target
        )));
    }
    if uri.authority().is_none() {
        return Err(Error::MalformedInput(format!(
            "target '{}': missing host",
            target
        )));
    }
    Ok(uri)
}

fn upstream_uri(target: &Uri, path_and_query: &str) -> Result<Uri> {
    let authority = target
        .authority()
        .ok_or_else(|| Error::MalformedInput(format!("target '{}': missing host", target)))?;
    let base = target.path().trim_end_matches('/');
    format!("http://{}{}{}", authority, base, path_and_query)
        .parse()
        .map_err(|e| Error::MalformedInput(format!("upstream path '{}': {}", path_and_query, e)))
}

fn status_of(name: &str, route: &ProxyRoute) -> RouteStatus {
    RouteStatus {
        name: name.to_string(),
        backing_id: route.backing_id.clone(),
        target: route.target.to_string(),
        in_flight: route.in_flight(),
        created_at: route.created_at,
    }
}

/// Response body that keeps a request counted as in flight until the body
/// reaches its end or is dropped
pub struct GuardedBody {
    inner: BoxBody<Bytes, hyper::Error>,
    guard: Option<InFlightGuard>,
}

impl GuardedBody {
    pub fn new(inner: BoxBody<Bytes, hyper::Error>, guard: InFlightGuard) -> Self {
        Self {
            inner,
            guard: Some(guard),
        }
    }
}

impl Body for GuardedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        if let Poll::Ready(None) = polled {
            this.guard.take();
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
