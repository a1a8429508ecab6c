//! Namespace-scoped backend client
//!
//! A [`NamespacedClient`] owns its own image, container, task and snapshot
//! registries, so several clients over one runtime never see each other's
//! resources. No registry lock is held across a driver call: each step reads
//! what it needs, releases, calls the runtime, then commits.

use super::driver::{ContainerRequest, ProcessSpec, RuntimeDriver, TaskHandle};
use super::{Backend, ExitWaiter, ImageSource, InstanceSpec, MAIN_TASK};
use crate::error::{Error, Result};
use crate::registry::{NestedRegistry, Registry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hyper::body::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct ImageRecord {
    pub name: String,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainerRecord {
    pub id: String,
    pub image: String,
    pub snapshot_id: String,
    pub host_port: u16,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub handle: TaskHandle,
    pub process: ProcessSpec,
    pub started_at: DateTime<Utc>,
}

pub struct NamespacedClient<D> {
    namespace: String,
    driver: Arc<D>,
    tasks: NestedRegistry<String, String, TaskRecord>,
    containers: Registry<String, ContainerRecord>,
    images: Registry<String, ImageRecord>,
    snapshots: NestedRegistry<String, String, ()>,
}

impl<D: RuntimeDriver> NamespacedClient<D> {
    pub fn new(namespace: impl Into<String>, driver: Arc<D>) -> Self {
        Self {
            namespace: namespace.into(),
            driver,
            tasks: NestedRegistry::new("task"),
            containers: Registry::new("container"),
            images: Registry::new("image"),
            snapshots: NestedRegistry::new("snapshot"),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn get_image(&self, name: &str) -> Result<ImageRecord> {
        self.images.get(name)
    }

    pub fn get_container(&self, id: &str) -> Result<ContainerRecord> {
        self.containers.get(id)
    }

    pub fn get_task(&self, container_id: &str, task: &str) -> Result<TaskRecord> {
        self.tasks.get(container_id, task)
    }

    pub fn snapshot_exists(&self, container_id: &str, snapshot_id: &str) -> bool {
        self.snapshots.contains(container_id, snapshot_id)
    }

    /// Load every image in an archive and register the ones not yet known.
    ///
    /// Returns all image names in archive order.
    pub async fn import_images(&self, archive: Bytes) -> Result<Vec<String>> {
        let (names, _) = self.import_tracked(archive).await?;
        Ok(names)
    }

    pub async fn pull_image(&self, reference: &str) -> Result<String> {
        let name = self.driver.pull(&self.namespace, reference).await?;
        self.register_image(&name);
        info!(namespace = %self.namespace, image = %name, "Pulled image");
        Ok(name)
    }

    /// Delete an image no container references
    pub async fn delete_image(&self, name: &str) -> Result<()> {
        self.images.get(name)?;
        if self.containers.any(|c| c.image == name) {
            return Err(Error::StillBusy(format!("image '{}'", name)));
        }
        self.driver.delete_image(&self.namespace, name).await?;
        // a concurrent delete may have won; the runtime side is gone either way
        let _ = self.images.delete(name);
        debug!(namespace = %self.namespace, image = name, "Deleted image");
        Ok(())
    }

    /// Force-kill and delete one task
    pub async fn delete_task(&self, container_id: &str, task: &str) -> Result<()> {
        let record = self.tasks.get(container_id, task)?;
        self.teardown_task(&record.handle).await?;
        self.tasks.delete(container_id, task)?;
        debug!(namespace = %self.namespace, container = container_id, task, "Deleted task");
        Ok(())
    }

    /// Import and register, reporting which names this call registered
    async fn import_tracked(&self, archive: Bytes) -> Result<(Vec<String>, Vec<String>)> {
        let names = self
            .driver
            .import(&self.namespace, archive)
            .await
            .map_err(|e| match e {
                Error::Backend(msg) => Error::MalformedInput(format!("image archive rejected: {}", msg)),
                other => other,
            })?;
        if names.is_empty() {
            return Err(Error::MalformedInput(
                "image archive contains no images".to_string(),
            ));
        }
        let fresh = names
            .iter()
            .filter(|name| self.register_image(name))
            .cloned()
            .collect();
        info!(namespace = %self.namespace, images = ?names, "Imported image archive");
        Ok((names, fresh))
    }

    /// Returns whether the name was newly registered
    fn register_image(&self, name: &str) -> bool {
        self.images
            .create(
                name.to_string(),
                ImageRecord {
                    name: name.to_string(),
                    registered_at: Utc::now(),
                },
            )
            .is_ok()
    }

    /// Resolve the instance image, reporting which names this call registered
    async fn resolve_image(&self, source: &ImageSource) -> Result<(String, Vec<String>)> {
        match source {
            ImageSource::Archive(archive) => {
                let (names, fresh) = self.import_tracked(archive.clone()).await?;
                Ok((names[0].clone(), fresh))
            }
            ImageSource::Reference(name) if self.images.contains(name.as_str()) => {
                Ok((name.clone(), Vec::new()))
            }
            ImageSource::Reference(reference) => {
                let name = self.driver.pull(&self.namespace, reference).await?;
                let fresh = if self.register_image(&name) {
                    vec![name.clone()]
                } else {
                    Vec::new()
                };
                Ok((name, fresh))
            }
        }
    }

    /// Undo image registrations made by a failed creation
    async fn rollback_images(&self, fresh: &[String]) {
        for name in fresh.iter().rev() {
            if self.containers.any(|c| &c.image == name) {
                continue;
            }
            match self.driver.delete_image(&self.namespace, name).await {
                Ok(()) => {
                    let _ = self.images.delete(name.as_str());
                    debug!(namespace = %self.namespace, image = %name, "Rolled back image");
                }
                Err(e) => {
                    warn!(namespace = %self.namespace, image = %name, error = %e, "Failed to roll back image");
                }
            }
        }
    }

    /// Kill then delete a task at the runtime. Killing a task that already
    /// exited succeeds.
    async fn teardown_task(&self, task: &TaskHandle) -> Result<()> {
        self.driver.kill_task(&self.namespace, task).await?;
        self.driver.delete_task(&self.namespace, task).await
    }

    /// Best-effort kill and delete after a failed step
    async fn abandon_task(&self, task: &TaskHandle) {
        if let Err(e) = self.teardown_task(task).await {
            warn!(namespace = %self.namespace, container = %task.container, error = %e, "Failed to clean up task");
        }
    }

    /// Start a task and register it under `name`; any failure after the
    /// runtime task exists kills and deletes it
    async fn spawn_task(
        &self,
        container_id: &str,
        name: &str,
        process: ProcessSpec,
    ) -> Result<ExitWaiter> {
        if self.tasks.contains(container_id, name) {
            return Err(Error::AlreadyExists(format!(
                "task '{}' of '{}'",
                name, container_id
            )));
        }

        let handle = self
            .driver
            .create_task(&self.namespace, container_id, &process)
            .await?;

        let waiter = match self.driver.wait_task(&self.namespace, &handle).await {
            Ok(waiter) => waiter,
            Err(e) => {
                self.abandon_task(&handle).await;
                return Err(e);
            }
        };

        if let Err(e) = self.driver.start_task(&self.namespace, &handle).await {
            self.abandon_task(&handle).await;
            return Err(e);
        }

        let record = TaskRecord {
            handle: handle.clone(),
            process,
            started_at: Utc::now(),
        };
        if let Err(e) = self
            .tasks
            .create(container_id.to_string(), name.to_string(), record)
        {
            self.abandon_task(&handle).await;
            return Err(e);
        }

        Ok(waiter)
    }

    /// Delete a container whose creation did not complete
    async fn abandon_container(&self, spec: &InstanceSpec, fresh: &[String]) {
        if let Err(e) = self.driver.delete_container(&self.namespace, &spec.id).await {
            warn!(namespace = %self.namespace, container = %spec.id, error = %e, "Failed to clean up container");
        }
        let _ = self.containers.delete(spec.id.as_str());
        let _ = self.snapshots.delete(spec.id.as_str(), spec.snapshot_id().as_str());
        self.rollback_images(fresh).await;
    }
}

/// A runtime object that is already gone counts as removed
fn tolerate_missing(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

#[async_trait]
impl<D: RuntimeDriver> Backend for NamespacedClient<D> {
    fn kind(&self) -> &'static str {
        "namespaced"
    }

    async fn import_image(&self, archive: Bytes) -> Result<String> {
        let (names, _) = self.import_tracked(archive).await?;
        Ok(names[0].clone())
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<()> {
        let snapshot_id = spec.snapshot_id();
        if self.snapshots.contains(spec.id.as_str(), snapshot_id.as_str()) {
            return Err(Error::AlreadyExists(format!(
                "snapshot '{}' of '{}'",
                snapshot_id, spec.id
            )));
        }

        let (image, fresh) = self.resolve_image(&spec.image).await?;

        // reserve the snapshot before the runtime call so a concurrent
        // creation of the same id fails instead of colliding
        if let Err(e) = self
            .snapshots
            .create(spec.id.clone(), snapshot_id.clone(), ())
        {
            self.rollback_images(&fresh).await;
            return Err(e);
        }

        let request = ContainerRequest {
            id: spec.id.clone(),
            image: image.clone(),
            snapshot_id: snapshot_id.clone(),
            host_port: spec.host_port,
        };
        if let Err(e) = self.driver.create_container(&self.namespace, &request).await {
            let _ = self.snapshots.delete(spec.id.as_str(), snapshot_id.as_str());
            self.rollback_images(&fresh).await;
            return Err(e);
        }

        let record = ContainerRecord {
            id: spec.id.clone(),
            image: image.clone(),
            snapshot_id,
            host_port: spec.host_port,
            created_at: Utc::now(),
        };
        if let Err(e) = self.containers.create(spec.id.clone(), record) {
            self.abandon_container(spec, &fresh).await;
            return Err(e);
        }

        if let Err(e) = self
            .spawn_task(&spec.id, MAIN_TASK, ProcessSpec::entrypoint())
            .await
        {
            self.abandon_container(spec, &fresh).await;
            return Err(e);
        }

        info!(
            namespace = %self.namespace,
            instance_id = %spec.id,
            image = %image,
            port = spec.host_port,
            "Instance created"
        );
        Ok(())
    }

    async fn execute(
        &self,
        instance_id: &str,
        task: &str,
        cwd: &str,
        args: &[String],
    ) -> Result<ExitWaiter> {
        self.containers.get(instance_id)?;
        if args.is_empty() {
            return Err(Error::MalformedInput(format!(
                "task '{}' has no command",
                task
            )));
        }
        let waiter = self
            .spawn_task(instance_id, task, ProcessSpec::command(cwd, args))
            .await?;
        debug!(namespace = %self.namespace, instance_id, task, "Task started");
        Ok(waiter)
    }

    async fn destroy(&self, instance_id: &str) -> Result<()> {
        let record = self.containers.get(instance_id)?;

        let mut failed = Vec::new();
        for (name, task) in self.tasks.list(instance_id) {
            match self.teardown_task(&task.handle).await {
                Ok(()) => {
                    let _ = self.tasks.delete(instance_id, name.as_str());
                }
                Err(e) => failed.push(format!("{}: {}", name, e)),
            }
        }
        if !failed.is_empty() {
            return Err(Error::StillBusy(format!(
                "container '{}' (tasks not removed: {})",
                instance_id,
                failed.join("; ")
            )));
        }

        // The container record stays until every runtime step is done, so a
        // failed destroy can be called again and resume where it stopped.
        tolerate_missing(
            self.driver
                .delete_container(&self.namespace, instance_id)
                .await,
        )?;

        let shared = self
            .containers
            .any(|c| c.id != instance_id && c.image == record.image);
        if !shared {
            tolerate_missing(
                self.driver
                    .delete_image(&self.namespace, &record.image)
                    .await,
            )?;
            let _ = self.images.delete(record.image.as_str());
        }

        let _ = self.containers.delete(instance_id);
        let _ = self
            .snapshots
            .delete(instance_id, record.snapshot_id.as_str());

        info!(namespace = %self.namespace, instance_id, "Instance destroyed");
        Ok(())
    }

    async fn inspect(&self, instance_id: &str) -> Result<serde_json::Value> {
        let record = self.containers.get(instance_id)?;
        let runtime = self
            .driver
            .inspect_container(&self.namespace, instance_id)
            .await?;
        let tasks: Vec<String> = self
            .tasks
            .list(instance_id)
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        Ok(serde_json::json!({
            "namespace": self.namespace,
            "container": record,
            "tasks": tasks,
            "runtime": runtime,
        }))
    }

    async fn close(&self) -> Vec<Error> {
        let mut errors = Vec::new();

        for (container, name, task) in self.tasks.drain() {
            if let Err(e) = self.teardown_task(&task.handle).await {
                warn!(namespace = %self.namespace, container = %container, task = %name, error = %e, "Failed to remove task");
                errors.push(e);
            }
        }

        for (id, _) in self.containers.drain() {
            if let Err(e) = self.driver.delete_container(&self.namespace, &id).await {
                warn!(namespace = %self.namespace, container = %id, error = %e, "Failed to remove container");
                errors.push(e);
            }
        }
        self.snapshots.drain();

        for (name, _) in self.images.drain() {
            if let Err(e) = self.driver.delete_image(&self.namespace, &name).await {
                warn!(namespace = %self.namespace, image = %name, error = %e, "Failed to remove image");
                errors.push(e);
            }
        }

        info!(namespace = %self.namespace, failures = errors.len(), "Client closed");
        errors
    }
}
