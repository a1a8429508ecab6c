//! Backend lifecycle management
//!
//! [`Backend`] is the one contract the swap protocol depends on: import an
//! image, instantiate an instance from it, run a command inside an
//! instance, tear an instance down. Two implementations exist:
//!
//! - [`NamespacedClient`]: namespace-scoped, tracks images, containers,
//!   tasks and snapshots in its own registries and rolls back partial
//!   creations.
//! - [`SingleContainerBackend`]: one container per instance bound to a single
//!   host port, tracked in a flat list for bulk shutdown.
//!
//! Both sit on a [`RuntimeDriver`], the low-level runtime surface. The
//! production driver is the Docker Engine ([`crate::docker::DockerManager`]).

pub mod driver;
pub mod namespaced;
pub mod single;

#[cfg(test)]
pub(crate) mod fake;

pub use driver::{ContainerRequest, ProcessSpec, RuntimeDriver, TaskHandle};
pub use namespaced::NamespacedClient;
pub use single::SingleContainerBackend;

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hyper::body::Bytes;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Name of the task that runs a container's entrypoint
pub const MAIN_TASK: &str = "main";

/// Where an instance's image comes from
#[derive(Debug, Clone)]
pub enum ImageSource {
    /// An uploaded image archive (`docker save` format)
    Archive(Bytes),
    /// An image already known to the runtime, or pullable by reference
    Reference(String),
}

/// Everything needed to instantiate one backend instance
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub id: String,
    pub image: ImageSource,
    pub host_port: u16,
}

impl InstanceSpec {
    pub fn new(id: impl Into<String>, image: ImageSource, host_port: u16) -> Self {
        Self {
            id: id.into(),
            image,
            host_port,
        }
    }

    /// Id of the writable layer bound to this instance
    pub fn snapshot_id(&self) -> String {
        snapshot_id_for(&self.id)
    }
}

pub fn snapshot_id_for(instance_id: &str) -> String {
    format!("{}-snapshot", instance_id)
}

/// How a task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitStatus {
    pub code: i64,
    pub exited_at: DateTime<Utc>,
}

impl ExitStatus {
    pub fn new(code: i64) -> Self {
        Self {
            code,
            exited_at: Utc::now(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Resolves once, when the task it was created for terminates.
///
/// Dropping the waiter only stops listening; the task itself is unaffected
/// and can still be killed and deleted through its backend.
#[derive(Debug)]
pub struct ExitWaiter {
    rx: oneshot::Receiver<Result<ExitStatus>>,
}

/// Sending half of an [`ExitWaiter`]
pub type ExitSender = oneshot::Sender<Result<ExitStatus>>;

impl ExitWaiter {
    pub fn channel() -> (ExitSender, ExitWaiter) {
        let (tx, rx) = oneshot::channel();
        (tx, ExitWaiter { rx })
    }

    /// A waiter that is already resolved
    pub fn ready(status: ExitStatus) -> Self {
        let (tx, waiter) = Self::channel();
        let _ = tx.send(Ok(status));
        waiter
    }
}

impl Future for ExitWaiter {
    type Output = Result<ExitStatus>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(Error::Backend(
                    "exit status channel closed before the task exited".to_string(),
                ))
            })
        })
    }
}

/// The lifecycle contract shared by every backend variant
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short variant name for logs and the API
    fn kind(&self) -> &'static str;

    /// Import an image archive and return the name of the first image in it
    async fn import_image(&self, archive: Bytes) -> Result<String>;

    /// Create and start an instance.
    ///
    /// Fails with [`Error::AlreadyExists`] if the instance's snapshot is
    /// already registered. On failure nothing created by this call is left
    /// behind.
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<()>;

    /// Run `args` inside an instance as task `task`
    async fn execute(
        &self,
        instance_id: &str,
        task: &str,
        cwd: &str,
        args: &[String],
    ) -> Result<ExitWaiter>;

    /// Tear an instance down: its tasks, the instance itself, and its image
    /// when nothing else references it
    async fn destroy(&self, instance_id: &str) -> Result<()>;

    /// Runtime view of an instance
    async fn inspect(&self, instance_id: &str) -> Result<serde_json::Value>;

    /// Best-effort teardown of everything this backend owns.
    ///
    /// Keeps going past individual failures and returns all of them.
    async fn close(&self) -> Vec<Error>;
}
