//! Single-host backend: one container per instance, bound to one host port

use super::driver::{ContainerRequest, ProcessSpec, RuntimeDriver, TaskHandle};
use super::{Backend, ExitWaiter, ImageSource, InstanceSpec};
use crate::error::{Error, Result};
use crate::registry::Registry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hyper::body::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One tracked container
#[derive(Debug, Clone, Serialize)]
pub struct InstanceRecord {
    pub id: String,
    pub image: String,
    pub host_port: u16,
    pub created_at: DateTime<Utc>,
}

pub struct SingleContainerBackend<D> {
    namespace: String,
    driver: Arc<D>,
    instances: Registry<String, InstanceRecord>,
}

impl<D: RuntimeDriver> SingleContainerBackend<D> {
    pub fn new(namespace: impl Into<String>, driver: Arc<D>) -> Self {
        Self {
            namespace: namespace.into(),
            driver,
            instances: Registry::new("instance"),
        }
    }

    pub fn instances(&self) -> Vec<InstanceRecord> {
        self.instances
            .entries()
            .into_iter()
            .map(|(_, record)| record)
            .collect()
    }

    async fn load(&self, archive: Bytes) -> Result<String> {
        let names = self
            .driver
            .import(&self.namespace, archive)
            .await
            .map_err(|e| match e {
                Error::Backend(msg) => Error::MalformedInput(format!("image archive rejected: {}", msg)),
                other => other,
            })?;
        names
            .into_iter()
            .next()
            .ok_or_else(|| Error::MalformedInput("image archive contains no images".to_string()))
    }

    fn image_in_use(&self, image: &str) -> bool {
        self.instances.any(|record| record.image == image)
    }

    /// Delete an image this backend loaded once no instance uses it
    async fn release_image(&self, image: &str) -> Result<()> {
        if self.image_in_use(image) {
            return Ok(());
        }
        self.driver.delete_image(&self.namespace, image).await
    }

    /// Compensate for an image loaded by a creation that failed
    async fn undo_load(&self, image: &str, loaded: bool) {
        if !loaded {
            return;
        }
        if let Err(e) = self.release_image(image).await {
            warn!(image, error = %e, "Failed to remove image after failed create");
        }
    }
}

#[async_trait]
impl<D: RuntimeDriver> Backend for SingleContainerBackend<D> {
    fn kind(&self) -> &'static str {
        "single"
    }

    async fn import_image(&self, archive: Bytes) -> Result<String> {
        let name = self.load(archive).await?;
        info!(image = %name, "Loaded image");
        Ok(name)
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<()> {
        if self.instances.contains(spec.id.as_str()) {
            return Err(Error::AlreadyExists(format!("instance '{}'", spec.id)));
        }

        let (image, loaded) = match &spec.image {
            ImageSource::Archive(archive) => (self.load(archive.clone()).await?, true),
            ImageSource::Reference(name) => (name.clone(), false),
        };

        let request = ContainerRequest {
            id: spec.id.clone(),
            image: image.clone(),
            snapshot_id: spec.snapshot_id(),
            host_port: spec.host_port,
        };

        if let Err(e) = self.driver.create_container(&self.namespace, &request).await {
            self.undo_load(&image, loaded).await;
            return Err(e);
        }

        let main = TaskHandle::entrypoint(spec.id.as_str());
        if let Err(e) = self.driver.start_task(&self.namespace, &main).await {
            if let Err(cleanup) = self.driver.delete_container(&self.namespace, &spec.id).await {
                warn!(instance_id = %spec.id, error = %cleanup, "Failed to remove container after failed start");
            }
            self.undo_load(&image, loaded).await;
            return Err(e);
        }

        let record = InstanceRecord {
            id: spec.id.clone(),
            image: image.clone(),
            host_port: spec.host_port,
            created_at: Utc::now(),
        };
        if let Err(e) = self.instances.create(spec.id.clone(), record) {
            let _ = self.driver.kill_task(&self.namespace, &main).await;
            let _ = self.driver.delete_container(&self.namespace, &spec.id).await;
            self.undo_load(&image, loaded).await;
            return Err(e);
        }

        info!(instance_id = %spec.id, image = %image, port = spec.host_port, "Container started");
        Ok(())
    }

    async fn execute(
        &self,
        instance_id: &str,
        task: &str,
        cwd: &str,
        args: &[String],
    ) -> Result<ExitWaiter> {
        self.instances.get(instance_id)?;
        if args.is_empty() {
            return Err(Error::MalformedInput(format!(
                "task '{}' has no command",
                task
            )));
        }

        let handle = self
            .driver
            .create_task(&self.namespace, instance_id, &ProcessSpec::command(cwd, args))
            .await?;

        let started = async {
            let waiter = self.driver.wait_task(&self.namespace, &handle).await?;
            self.driver.start_task(&self.namespace, &handle).await?;
            Ok::<_, Error>(waiter)
        }
        .await;

        match started {
            Ok(waiter) => {
                debug!(instance_id, task, "Command started");
                Ok(waiter)
            }
            Err(e) => {
                let _ = self.driver.kill_task(&self.namespace, &handle).await;
                let _ = self.driver.delete_task(&self.namespace, &handle).await;
                Err(e)
            }
        }
    }

    async fn destroy(&self, instance_id: &str) -> Result<()> {
        let record = self.instances.get(instance_id)?;

        // stop the entrypoint gracefully before removing the container
        let main = TaskHandle::entrypoint(instance_id);
        self.driver.delete_task(&self.namespace, &main).await?;
        match self.driver.delete_container(&self.namespace, instance_id).await {
            Err(e) if !e.is_not_found() => return Err(e),
            _ => {}
        }

        // keep the record until the image is gone too, so a retry resumes here
        let shared = self
            .instances
            .any(|r| r.id != instance_id && r.image == record.image);
        if !shared {
            match self.driver.delete_image(&self.namespace, &record.image).await {
                Err(e) if !e.is_not_found() => return Err(e),
                _ => {}
            }
        }
        let _ = self.instances.delete(instance_id);
        info!(instance_id, "Container removed");
        Ok(())
    }

    async fn inspect(&self, instance_id: &str) -> Result<serde_json::Value> {
        let record = self.instances.get(instance_id)?;
        let runtime = self
            .driver
            .inspect_container(&self.namespace, instance_id)
            .await?;
        Ok(serde_json::json!({
            "instance": record,
            "runtime": runtime,
        }))
    }

    async fn close(&self) -> Vec<Error> {
        let mut errors = Vec::new();
        let records = self.instances.drain();

        for (id, _) in &records {
            let main = TaskHandle::entrypoint(id.as_str());
            if let Err(e) = self.driver.delete_task(&self.namespace, &main).await {
                warn!(instance_id = %id, error = %e, "Failed to stop container");
                errors.push(e);
            }
            if let Err(e) = self.driver.delete_container(&self.namespace, id).await {
                warn!(instance_id = %id, error = %e, "Failed to remove container");
                errors.push(e);
            }
        }

        let mut images: Vec<&str> = records.iter().map(|(_, r)| r.image.as_str()).collect();
        images.sort_unstable();
        images.dedup();
        for image in images {
            if let Err(e) = self.driver.delete_image(&self.namespace, image).await {
                warn!(image, error = %e, "Failed to remove image");
                errors.push(e);
            }
        }

        info!(instances = records.len(), failures = errors.len(), "Single-container backend closed");
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeDriver;

    fn backend() -> (Arc<FakeDriver>, SingleContainerBackend<FakeDriver>) {
        let driver = Arc::new(FakeDriver::new());
        (Arc::clone(&driver), SingleContainerBackend::new("test", driver))
    }

    fn spec(id: &str, image: &str, port: u16) -> InstanceSpec {
        InstanceSpec::new(id, ImageSource::Archive(Bytes::from(image.to_string())), port)
    }

    #[tokio::test]
    async fn test_create_binds_port_and_starts() {
        let (driver, backend) = backend();
        backend.create_instance(&spec("svc-1", "img-x", 49152)).await.unwrap();

        let container = driver.container("svc-1").unwrap();
        assert_eq!(container.host_port, 49152);
        assert_eq!(container.image, "img-x");
        assert!(driver.calls().contains(&"start_task svc-1/main".to_string()));
        assert_eq!(backend.instances().len(), 1);
    }

    #[tokio::test]
    async fn test_start_failure_removes_container_and_image() {
        let (driver, backend) = backend();
        driver.fail_on("start_task");

        assert!(backend.create_instance(&spec("svc-1", "img-x", 1)).await.is_err());
        assert!(!driver.has_container("svc-1"));
        assert!(!driver.has_image("img-x"));
        assert!(backend.instances().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_instance_id() {
        let (_driver, backend) = backend();
        backend.create_instance(&spec("svc-1", "img-x", 1)).await.unwrap();
        let err = backend
            .create_instance(&spec("svc-1", "img-y", 2))
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_destroy_stops_removes_and_cleans_image() {
        let (driver, backend) = backend();
        backend.create_instance(&spec("svc-1", "img-x", 1)).await.unwrap();

        backend.destroy("svc-1").await.unwrap();
        let calls = driver.calls();
        let stop = calls.iter().position(|c| c == "delete_task svc-1/main").unwrap();
        let remove = calls.iter().position(|c| c == "delete_container svc-1").unwrap();
        assert!(stop < remove);
        assert!(!driver.has_image("img-x"));
        assert!(backend.destroy("svc-1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_destroy_failure_keeps_instance_tracked() {
        let (driver, backend) = backend();
        backend.create_instance(&spec("svc-1", "img-x", 1)).await.unwrap();

        driver.fail_on("delete_container");
        assert!(backend.destroy("svc-1").await.is_err());
        assert_eq!(backend.instances().len(), 1);

        driver.recover("delete_container");
        backend.destroy("svc-1").await.unwrap();
        assert!(backend.instances().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_retry_finishes_image_cleanup() {
        let (driver, backend) = backend();
        backend.create_instance(&spec("svc-1", "img-x", 1)).await.unwrap();

        driver.fail_on("delete_image");
        assert!(backend.destroy("svc-1").await.is_err());
        assert!(!driver.has_container("svc-1"));
        assert!(driver.has_image("img-x"));
        assert_eq!(backend.instances().len(), 1);

        driver.recover("delete_image");
        backend.destroy("svc-1").await.unwrap();
        assert!(!driver.has_image("img-x"));
        assert!(backend.instances().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_keeps_image_shared_with_another_instance() {
        let (driver, backend) = backend();
        backend.create_instance(&spec("a", "img-x", 1)).await.unwrap();
        backend
            .create_instance(&InstanceSpec::new("b", ImageSource::Reference("img-x".to_string()), 2))
            .await
            .unwrap();

        backend.destroy("a").await.unwrap();
        assert!(driver.has_image("img-x"));
        backend.destroy("b").await.unwrap();
        assert!(!driver.has_image("img-x"));
    }

    #[tokio::test]
    async fn test_execute_resolves_exit() {
        let (driver, backend) = backend();
        backend.create_instance(&spec("svc-1", "img-x", 1)).await.unwrap();

        let args = vec!["echo".to_string(), "hi".to_string()];
        let waiter = backend.execute("svc-1", "echo", "/", &args).await.unwrap();
        driver.finish(
            &TaskHandle {
                container: "svc-1".to_string(),
                exec_id: Some("exec-1".to_string()),
            },
            0,
        );
        assert!(waiter.await.unwrap().success());
    }

    #[tokio::test]
    async fn test_close_stops_everything_and_reports_failures() {
        let (driver, backend) = backend();
        backend.create_instance(&spec("a", "img-a", 1)).await.unwrap();
        backend.create_instance(&spec("b", "img-b", 2)).await.unwrap();

        driver.fail_on("delete_image");
        let errors = backend.close().await;

        assert_eq!(errors.len(), 2);
        assert!(!driver.has_container("a"));
        assert!(!driver.has_container("b"));
        assert!(backend.instances().is_empty());
    }
}
