//! Process-lifetime state shared by the ingress, the API and the swap engine

use crate::backend::{Backend, NamespacedClient, SingleContainerBackend};
use crate::config::{BackendKind, Config};
use crate::deploy::Deployer;
use crate::docker::DockerManager;
use crate::pool::ConnectionPool;
use crate::ports::PortAllocator;
use crate::router::Router;
use crate::vm::Multipass;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// What the shutdown teardown pass got done
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// Background retirements cut short by the timeout
    pub aborted_teardowns: usize,
    pub detached_routes: usize,
    /// Routes whose in-flight requests outlived the timeout
    pub undrained_routes: Vec<String>,
    pub backend_errors: Vec<String>,
    pub released_ports: usize,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.aborted_teardowns == 0
            && self.undrained_routes.is_empty()
            && self.backend_errors.is_empty()
    }
}

pub struct AppContext {
    pub router: Arc<Router>,
    pub ports: Arc<PortAllocator>,
    pub backend: Arc<dyn Backend>,
    pub deployer: Deployer,
    pub pool: ConnectionPool,
    pub vm: Option<Multipass>,
    pub request_timeout: Duration,
    pub max_upload_bytes: usize,
    pub api_token: Option<String>,
    shutdown_timeout: Duration,
}

impl AppContext {
    /// Wire every component around an already constructed backend
    pub fn new(backend: Arc<dyn Backend>, config: &Config) -> Self {
        let router = Arc::new(Router::new(config.server.route_prefix.clone()));
        let ports = Arc::new(PortAllocator::new(config.ports.start, config.ports.end));
        let deployer = Deployer::new(
            Arc::clone(&backend),
            Arc::clone(&router),
            Arc::clone(&ports),
            config.deploy.policy(),
        );
        let vm = config
            .vm
            .enabled
            .then(|| Multipass::new(config.vm.program.clone()));

        Self {
            router,
            ports,
            backend,
            deployer,
            pool: ConnectionPool::new(config.server.pool_config()),
            vm,
            request_timeout: config.server.request_timeout(),
            max_upload_bytes: config.server.max_upload_bytes,
            api_token: config.server.api_token.clone(),
            shutdown_timeout: config.deploy.shutdown_timeout(),
        }
    }

    /// Connect to Docker and build the backend variant the config selects
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let docker = Arc::new(
            DockerManager::connect(
                config.backend.docker_host.as_deref(),
                config.backend.container_settings(),
            )
            .await?,
        );

        let namespace = config.backend.namespace.clone();
        let backend: Arc<dyn Backend> = match config.backend.kind {
            BackendKind::Single => Arc::new(SingleContainerBackend::new(namespace, docker)),
            BackendKind::Namespaced => Arc::new(NamespacedClient::new(namespace, docker)),
        };
        info!(backend = backend.kind(), "Backend ready");

        Ok(Self::new(backend, config))
    }

    /// Best-effort teardown of everything this process created.
    ///
    /// Each stage runs regardless of failures in the previous one; failures
    /// are logged and collected into the report.
    pub async fn shutdown(&self) -> TeardownReport {
        let timeout = self.shutdown_timeout;
        let mut report = TeardownReport {
            aborted_teardowns: self.deployer.shutdown(timeout).await,
            ..TeardownReport::default()
        };

        let detached = self.router.detach_all();
        report.detached_routes = detached.len();
        let drained = join_all(detached.iter().map(|(_, route)| route.in_flight.wait_idle_timeout(timeout))).await;
        for ((name, route), idle) in detached.iter().zip(drained) {
            if !idle {
                warn!(
                    route = %name,
                    instance_id = %route.backing_id,
                    in_flight = route.in_flight.current(),
                    "Route still had requests in flight at shutdown"
                );
                report.undrained_routes.push(name.clone());
            }
        }

        for e in self.backend.close().await {
            error!(error = %e, "Teardown failure");
            report.backend_errors.push(e.to_string());
        }

        report.released_ports = self.ports.release_all().len();

        info!(
            routes = report.detached_routes,
            aborted_teardowns = report.aborted_teardowns,
            failures = report.backend_errors.len(),
            ports = report.released_ports,
            "Teardown complete"
        );
        report
    }
}
