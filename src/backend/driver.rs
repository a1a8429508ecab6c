//! Low-level runtime surface the backend variants are built on

use super::ExitWaiter;
use crate::error::Result;
use async_trait::async_trait;
use hyper::body::Bytes;

/// Parameters for creating one container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRequest {
    pub id: String,
    pub image: String,
    pub snapshot_id: String,
    pub host_port: u16,
}

/// A process to run inside a container.
///
/// An empty `args` means the container's own entrypoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSpec {
    pub cwd: Option<String>,
    pub args: Vec<String>,
}

impl ProcessSpec {
    pub fn entrypoint() -> Self {
        Self::default()
    }

    pub fn command(cwd: &str, args: &[String]) -> Self {
        Self {
            cwd: if cwd.is_empty() { None } else { Some(cwd.to_string()) },
            args: args.to_vec(),
        }
    }

    pub fn is_entrypoint(&self) -> bool {
        self.args.is_empty()
    }
}

/// Runtime handle for a created task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    pub container: String,
    /// Exec id for a command task; `None` for the entrypoint
    pub exec_id: Option<String>,
}

impl TaskHandle {
    pub fn entrypoint(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            exec_id: None,
        }
    }
}

/// Namespaced container runtime operations.
///
/// Every call carries the namespace it acts in so several clients can share
/// one runtime without seeing each other's resources. Implementations do no
/// bookkeeping of their own beyond what the runtime keeps.
#[async_trait]
pub trait RuntimeDriver: Send + Sync + 'static {
    /// Load an image archive; returns the names of the images it contained
    async fn import(&self, namespace: &str, archive: Bytes) -> Result<Vec<String>>;

    /// Fetch an image by reference; returns its name
    async fn pull(&self, namespace: &str, reference: &str) -> Result<String>;

    async fn delete_image(&self, namespace: &str, name: &str) -> Result<()>;

    /// Create (but do not start) a container with a fresh writable layer
    async fn create_container(&self, namespace: &str, request: &ContainerRequest) -> Result<()>;

    /// Delete a container together with its writable layer
    async fn delete_container(&self, namespace: &str, id: &str) -> Result<()>;

    async fn create_task(
        &self,
        namespace: &str,
        container: &str,
        process: &ProcessSpec,
    ) -> Result<TaskHandle>;

    async fn start_task(&self, namespace: &str, task: &TaskHandle) -> Result<()>;

    /// Subscribe to the task's exit
    async fn wait_task(&self, namespace: &str, task: &TaskHandle) -> Result<ExitWaiter>;

    /// Force-kill a task; succeeds if it has already exited
    async fn kill_task(&self, namespace: &str, task: &TaskHandle) -> Result<()>;

    async fn delete_task(&self, namespace: &str, task: &TaskHandle) -> Result<()>;

    async fn inspect_container(&self, namespace: &str, id: &str) -> Result<serde_json::Value>;
}
