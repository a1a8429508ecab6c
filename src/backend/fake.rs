//! In-memory runtime driver with failure injection for backend tests

use super::driver::{ContainerRequest, ProcessSpec, RuntimeDriver, TaskHandle};
use super::{ExitSender, ExitStatus, ExitWaiter};
use crate::error::{Error, Result};
use async_trait::async_trait;
use hyper::body::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

#[derive(Default)]
struct State {
    images: HashSet<String>,
    containers: HashMap<String, ContainerRequest>,
    running: HashSet<String>,
    waiters: HashMap<String, ExitSender>,
    failing: HashSet<&'static str>,
    calls: Vec<String>,
    next_exec: u32,
}

#[derive(Default)]
pub struct FakeDriver {
    state: Mutex<State>,
}

fn task_key(task: &TaskHandle) -> String {
    format!(
        "{}/{}",
        task.container,
        task.exec_id.as_deref().unwrap_or(super::MAIN_TASK)
    )
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later call to `op` fail with a backend error
    pub fn fail_on(&self, op: &'static str) {
        self.state.lock().failing.insert(op);
    }

    pub fn recover(&self, op: &'static str) {
        self.state.lock().failing.remove(op);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn has_image(&self, name: &str) -> bool {
        self.state.lock().images.contains(name)
    }

    pub fn has_container(&self, id: &str) -> bool {
        self.state.lock().containers.contains_key(id)
    }

    pub fn container(&self, id: &str) -> Option<ContainerRequest> {
        self.state.lock().containers.get(id).cloned()
    }

    pub fn running_tasks(&self) -> usize {
        self.state.lock().running.len()
    }

    /// Simulate a task exiting on its own
    pub fn finish(&self, task: &TaskHandle, code: i64) {
        let key = task_key(task);
        let mut state = self.state.lock();
        state.running.remove(&key);
        if let Some(tx) = state.waiters.remove(&key) {
            let _ = tx.send(Ok(ExitStatus::new(code)));
        }
    }

    fn record(&self, op: &'static str, arg: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("{} {}", op, arg));
        if state.failing.contains(op) {
            return Err(Error::backend(op, "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl RuntimeDriver for FakeDriver {
    async fn import(&self, _namespace: &str, archive: Bytes) -> Result<Vec<String>> {
        self.record("import", &format!("{} bytes", archive.len()))?;
        let text = String::from_utf8_lossy(&archive).to_string();
        let names: Vec<String> = text
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(String::from)
            .collect();
        let mut state = self.state.lock();
        state.images.extend(names.iter().cloned());
        Ok(names)
    }

    async fn pull(&self, _namespace: &str, reference: &str) -> Result<String> {
        self.record("pull", reference)?;
        self.state.lock().images.insert(reference.to_string());
        Ok(reference.to_string())
    }

    async fn delete_image(&self, _namespace: &str, name: &str) -> Result<()> {
        self.record("delete_image", name)?;
        if !self.state.lock().images.remove(name) {
            return Err(Error::NotFound(format!("image '{}'", name)));
        }
        Ok(())
    }

    async fn create_container(&self, _namespace: &str, request: &ContainerRequest) -> Result<()> {
        self.record("create_container", &request.id)?;
        let mut state = self.state.lock();
        if !state.images.contains(&request.image) {
            return Err(Error::NotFound(format!("image '{}'", request.image)));
        }
        if state.containers.contains_key(&request.id) {
            return Err(Error::AlreadyExists(format!("container '{}'", request.id)));
        }
        state.containers.insert(request.id.clone(), request.clone());
        Ok(())
    }

    async fn delete_container(&self, _namespace: &str, id: &str) -> Result<()> {
        self.record("delete_container", id)?;
        if self.state.lock().containers.remove(id).is_none() {
            return Err(Error::NotFound(format!("container '{}'", id)));
        }
        Ok(())
    }

    async fn create_task(
        &self,
        _namespace: &str,
        container: &str,
        process: &ProcessSpec,
    ) -> Result<TaskHandle> {
        self.record("create_task", container)?;
        let mut state = self.state.lock();
        if !state.containers.contains_key(container) {
            return Err(Error::NotFound(format!("container '{}'", container)));
        }
        if process.is_entrypoint() {
            return Ok(TaskHandle::entrypoint(container));
        }
        state.next_exec += 1;
        Ok(TaskHandle {
            container: container.to_string(),
            exec_id: Some(format!("exec-{}", state.next_exec)),
        })
    }

    async fn start_task(&self, _namespace: &str, task: &TaskHandle) -> Result<()> {
        self.record("start_task", &task_key(task))?;
        self.state.lock().running.insert(task_key(task));
        Ok(())
    }

    async fn wait_task(&self, _namespace: &str, task: &TaskHandle) -> Result<ExitWaiter> {
        self.record("wait_task", &task_key(task))?;
        let (tx, waiter) = ExitWaiter::channel();
        self.state.lock().waiters.insert(task_key(task), tx);
        Ok(waiter)
    }

    async fn kill_task(&self, _namespace: &str, task: &TaskHandle) -> Result<()> {
        self.record("kill_task", &task_key(task))?;
        let key = task_key(task);
        let mut state = self.state.lock();
        state.running.remove(&key);
        if let Some(tx) = state.waiters.remove(&key) {
            let _ = tx.send(Ok(ExitStatus::new(137)));
        }
        Ok(())
    }

    async fn delete_task(&self, _namespace: &str, task: &TaskHandle) -> Result<()> {
        self.record("delete_task", &task_key(task))?;
        self.state.lock().running.remove(&task_key(task));
        Ok(())
    }

    async fn inspect_container(&self, _namespace: &str, id: &str) -> Result<serde_json::Value> {
        self.record("inspect_container", id)?;
        let state = self.state.lock();
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("container '{}'", id)))?;
        Ok(serde_json::json!({
            "id": container.id,
            "image": container.image,
            "snapshot": container.snapshot_id,
            "host_port": container.host_port,
        }))
    }
}
