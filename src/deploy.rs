//! Zero-downtime deployment swap
//!
//! A registration provisions a new instance, points the route at it and
//! retires whatever the route pointed at before. Retirement runs in the
//! background: wait for the detached route's in-flight counter to reach
//! zero, destroy the instance (retrying with linear backoff), release its
//! host port.

use crate::backend::{Backend, ImageSource, InstanceSpec};
use crate::error::{Error, Result};
use crate::ports::PortAllocator;
use crate::router::{DetachedRoute, Router};
use hyper::body::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Host the backend instances publish their ports on
pub const UPSTREAM_HOST: &str = "127.0.0.1";

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);
const MAX_ROUTE_NAME_LEN: usize = 63;

/// When the old route is detached relative to provisioning the new instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SwapOrder {
    /// Provision first; the old version keeps serving until the swap
    #[default]
    CreateThenSwap,
    /// Detach the old route first; requests get 404 while provisioning
    DetachThenCreate,
}

#[derive(Debug, Clone)]
pub struct DeployPolicy {
    pub order: SwapOrder,
    /// Zero skips the readiness check
    pub ready_timeout: Duration,
    /// Teardown attempt `n` waits `n * backoff_step` before the next one
    pub backoff_step: Duration,
    /// Zero retries forever
    pub max_teardown_attempts: u32,
}

impl Default for DeployPolicy {
    fn default() -> Self {
        Self {
            order: SwapOrder::CreateThenSwap,
            ready_timeout: Duration::from_secs(30),
            backoff_step: Duration::from_secs(1),
            max_teardown_attempts: 0,
        }
    }
}

/// Outcome of a successful registration
#[derive(Debug, Clone, Serialize)]
pub struct Deployment {
    pub route: String,
    pub instance_id: String,
    pub port: u16,
    pub target: String,
    /// Instances this registration detached and queued for teardown
    pub replaced: Vec<String>,
}

/// Route names become a URL path segment and part of the instance id
pub fn validate_route_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_ROUTE_NAME_LEN {
        return Err(Error::MalformedInput(format!(
            "route name must be 1 to {} characters",
            MAX_ROUTE_NAME_LEN
        )));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(Error::MalformedInput(format!(
            "route name '{}' contains invalid character '{}'",
            name, c
        )));
    }
    if name.starts_with('.') {
        return Err(Error::MalformedInput(format!(
            "route name '{}' must not start with '.'",
            name
        )));
    }
    Ok(())
}

/// What a background teardown needs, detached from the deployer's lifetime
#[derive(Clone)]
struct Retirer {
    backend: Arc<dyn Backend>,
    ports: Arc<PortAllocator>,
    backoff_step: Duration,
    max_attempts: u32,
}

impl Retirer {
    async fn retire(self, route: String, old: DetachedRoute) {
        let pending = old.in_flight.current();
        if pending > 0 {
            debug!(route = %route, instance_id = %old.backing_id, in_flight = pending, "Waiting for drain");
        }
        old.wait_drained().await;

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.backend.destroy(&old.backing_id).await {
                Ok(()) => break,
                Err(e) if e.is_not_found() => {
                    debug!(instance_id = %old.backing_id, "Instance already gone");
                    break;
                }
                Err(e) => {
                    if self.max_attempts != 0 && attempt >= self.max_attempts {
                        error!(
                            route = %route,
                            instance_id = %old.backing_id,
                            attempts = attempt,
                            error = %e,
                            "Giving up on tearing down old instance; its port stays reserved"
                        );
                        return;
                    }
                    let delay = self.backoff_step * attempt;
                    warn!(
                        route = %route,
                        instance_id = %old.backing_id,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Teardown of old instance failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        if let Some(port) = old.port() {
            if let Err(e) = self.ports.release(port) {
                warn!(port, error = %e, "Port of retired instance was not allocated");
            }
        }
        info!(route = %route, instance_id = %old.backing_id, "Old instance retired");
    }
}

pub struct Deployer {
    backend: Arc<dyn Backend>,
    router: Arc<Router>,
    ports: Arc<PortAllocator>,
    policy: DeployPolicy,
    /// `None` once shutdown has started
    teardowns: Mutex<Option<JoinSet<()>>>,
}

impl Deployer {
    pub fn new(
        backend: Arc<dyn Backend>,
        router: Arc<Router>,
        ports: Arc<PortAllocator>,
        policy: DeployPolicy,
    ) -> Self {
        Self {
            backend,
            router,
            ports,
            policy,
            teardowns: Mutex::new(Some(JoinSet::new())),
        }
    }

    pub fn policy(&self) -> &DeployPolicy {
        &self.policy
    }

    /// Teardowns still waiting for drain or retrying
    pub fn pending_teardowns(&self) -> usize {
        let mut teardowns = self.teardowns.lock();
        let Some(set) = teardowns.as_mut() else {
            return 0;
        };
        while set.try_join_next().is_some() {}
        set.len()
    }

    pub fn is_closed(&self) -> bool {
        self.teardowns.lock().is_none()
    }

    /// Deploy an uploaded image archive under `route`
    pub async fn register(&self, route: &str, archive: Bytes) -> Result<Deployment> {
        validate_route_name(route)?;
        if archive.is_empty() {
            return Err(Error::MalformedInput("image archive is empty".to_string()));
        }
        self.deploy(route, ImageSource::Archive(archive)).await
    }

    /// Provision an instance from `image` and make it the live target of
    /// `route`.
    ///
    /// A failure before the swap leaves the live route as it was (under
    /// [`SwapOrder::CreateThenSwap`]) and cleans up the new instance.
    pub async fn deploy(&self, route: &str, image: ImageSource) -> Result<Deployment> {
        if self.is_closed() {
            return Err(Error::Backend(format!(
                "cannot deploy route '{}': shutting down",
                route
            )));
        }
        let instance_id = format!("{}-{}", route, Uuid::new_v4().simple());
        let mut replaced = Vec::new();

        if self.policy.order == SwapOrder::DetachThenCreate {
            if let Some(old) = self.detach(route) {
                replaced.push(old.backing_id.clone());
            }
        }

        let port = self.ports.allocate()?;
        let spec = InstanceSpec::new(instance_id.clone(), image, port);

        if let Err(e) = self.backend.create_instance(&spec).await {
            error!(route, instance_id = %instance_id, error = %e, "Failed to create instance");
            self.release_port(port);
            return Err(e);
        }

        if let Err(e) = self.wait_ready(&instance_id, port).await {
            error!(route, instance_id = %instance_id, port, error = %e, "Instance never became ready");
            self.abandon(&instance_id, port).await;
            return Err(e);
        }

        let target = format!("http://{}:{}", UPSTREAM_HOST, port);
        loop {
            if let Some(old) = self.detach(route) {
                replaced.push(old.backing_id.clone());
            }
            match self.router.add_route(route, &instance_id, &target) {
                Ok(()) => break,
                // another registration slipped in between detach and add
                Err(e) if e.is_already_exists() => continue,
                Err(e) => {
                    error!(route, instance_id = %instance_id, error = %e, "Failed to install route");
                    self.abandon(&instance_id, port).await;
                    return Err(e);
                }
            }
        }

        info!(
            route,
            instance_id = %instance_id,
            port,
            replaced = replaced.len(),
            "Route live"
        );
        Ok(Deployment {
            route: route.to_string(),
            instance_id,
            port,
            target,
            replaced,
        })
    }

    /// Detach `route` if present and queue its instance for retirement
    fn detach(&self, route: &str) -> Option<DetachedRoute> {
        let old = self.router.remove_route(route).ok()?;
        self.spawn_retire(route, old.clone());
        Some(old)
    }

    fn spawn_retire(&self, route: &str, old: DetachedRoute) {
        let retirer = Retirer {
            backend: Arc::clone(&self.backend),
            ports: Arc::clone(&self.ports),
            backoff_step: self.policy.backoff_step,
            max_attempts: self.policy.max_teardown_attempts,
        };
        let mut teardowns = self.teardowns.lock();
        match teardowns.as_mut() {
            Some(set) => {
                while set.try_join_next().is_some() {}
                set.spawn(retirer.retire(route.to_string(), old));
            }
            // the shutdown teardown pass closes the backend after this
            None => warn!(
                route,
                instance_id = %old.backing_id,
                "Shutting down; leaving detached instance to backend close"
            ),
        }
    }

    async fn wait_ready(&self, instance_id: &str, port: u16) -> Result<()> {
        let timeout = self.policy.ready_timeout;
        if timeout.is_zero() {
            return Ok(());
        }
        let probe = async {
            loop {
                if TcpStream::connect((UPSTREAM_HOST, port)).await.is_ok() {
                    return;
                }
                tokio::time::sleep(READY_POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(timeout, probe).await.map_err(|_| {
            Error::Backend(format!(
                "instance '{}' did not accept connections on port {} within {}s",
                instance_id,
                port,
                timeout.as_secs_f32()
            ))
        })?;
        debug!(instance_id, port, "Instance accepting connections");
        Ok(())
    }

    /// Compensate for an instance that never went live
    async fn abandon(&self, instance_id: &str, port: u16) {
        match self.backend.destroy(instance_id).await {
            Ok(()) => self.release_port(port),
            Err(e) => {
                warn!(instance_id, port, error = %e, "Failed to destroy abandoned instance; keeping its port reserved");
            }
        }
    }

    fn release_port(&self, port: u16) {
        if let Err(e) = self.ports.release(port) {
            warn!(port, error = %e, "Failed to release port");
        }
    }

    /// Stop accepting work, then wait for queued teardowns, aborting
    /// whatever is still running after `timeout`. Returns how many were
    /// aborted.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        let Some(mut set) = self.teardowns.lock().take() else {
            return 0;
        };
        if set.is_empty() {
            return 0;
        }
        info!(pending = set.len(), "Waiting for pending teardowns");
        let finished = tokio::time::timeout(timeout, async {
            while set.join_next().await.is_some() {}
        })
        .await;
        if finished.is_ok() {
            return 0;
        }
        let aborted = set.len();
        warn!(aborted, "Pending teardowns did not finish in time");
        set.shutdown().await;
        aborted
    }
}
