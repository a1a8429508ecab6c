//! Docker Engine runtime driver
//!
//! Namespaces are expressed as container labels; images are shared by the
//! daemon. Entrypoint tasks map onto the container itself, command tasks
//! onto execs.

use crate::backend::driver::{ContainerRequest, ProcessSpec, RuntimeDriver, TaskHandle};
use crate::backend::{ExitStatus, ExitWaiter};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecOptions};
use bollard::image::{CreateImageOptions, ImportImageOptions, RemoveImageOptions};
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use hyper::body::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Label carrying the owning client's namespace
pub const NAMESPACE_LABEL: &str = "compositor.namespace";
/// Label carrying the instance's snapshot id
pub const SNAPSHOT_LABEL: &str = "compositor.snapshot";

const EXEC_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// How every container created by this driver is configured
#[derive(Debug, Clone)]
pub struct ContainerSettings {
    /// Port the application listens on inside the container
    pub container_port: u16,
    pub network: Option<String>,
    pub memory: Option<String>,
    pub cpus: Option<String>,
    pub env: HashMap<String, String>,
    pub stop_timeout: Duration,
    /// Forward container output into tracing
    pub stream_logs: bool,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            container_port: 80,
            network: None,
            memory: None,
            cpus: None,
            env: HashMap::new(),
            stop_timeout: Duration::from_secs(10),
            stream_logs: true,
        }
    }
}

/// Docker Engine client
pub struct DockerManager {
    client: Docker,
    settings: ContainerSettings,
    log_streams: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl DockerManager {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths
    pub async fn connect(
        docker_host: Option<&str>,
        settings: ContainerSettings,
    ) -> anyhow::Result<Self> {
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker at '{}': {}. \
                     Ensure Docker is running and the socket path is correct.",
                    host, e
                )
            })?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker via DOCKER_HOST='{}': {}",
                    host, e
                )
            })?
        } else {
            Self::connect_with_defaults().await?
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. Ensure dockerd is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self {
            client,
            settings,
            log_streams: Mutex::new(HashMap::new()),
        })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    async fn connect_with_defaults() -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();
        let socket_paths = [
            "/var/run/docker.sock".to_string(),
            format!("{}/.docker/run/docker.sock", home),
        ];

        for path in socket_paths.iter().filter(|p| std::path::Path::new(p).exists()) {
            debug!(path, "Found Docker socket");
            if let Ok(client) = Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION) {
                if client.ping().await.is_ok() {
                    return Ok(client);
                }
            }
        }

        Docker::connect_with_socket_defaults().map_err(|e| {
            anyhow::anyhow!(
                "Cannot connect to Docker daemon. Start dockerd, set DOCKER_HOST \
                 or set backend.docker_host. Underlying error: {}",
                e
            )
        })
    }

    pub fn settings(&self) -> &ContainerSettings {
        &self.settings
    }

    /// Stop a container gracefully
    pub async fn stop_container(&self, container_id: &str) -> Result<()> {
        let options = StopContainerOptions {
            t: self.settings.stop_timeout.as_secs() as i64,
        };

        match self.client.stop_container(container_id, Some(options)).await {
            Ok(_) => {
                info!(container_id, "Stopped Docker container");
                Ok(())
            }
            Err(DockerError::DockerResponseServerError { status_code: 304, .. }) => {
                debug!(container_id, "Container was already stopped");
                Ok(())
            }
            Err(DockerError::DockerResponseServerError { status_code: 404, .. }) => {
                debug!(container_id, "Container not found");
                Ok(())
            }
            Err(e) => Err(Error::backend(format!("stop container '{}'", container_id), e)),
        }
    }

    /// Force kill a container
    pub async fn kill_container(&self, container_id: &str) -> Result<()> {
        match self.client.kill_container::<String>(container_id, None).await {
            Ok(_) => {
                info!(container_id, "Killed Docker container");
                Ok(())
            }
            Err(DockerError::DockerResponseServerError { status_code: 404, .. }) => {
                debug!(container_id, "Container not found");
                Ok(())
            }
            Err(DockerError::DockerResponseServerError { status_code: 409, .. }) => {
                debug!(container_id, "Container not running");
                Ok(())
            }
            Err(e) => Err(Error::backend(format!("kill container '{}'", container_id), e)),
        }
    }

    /// Remove a container and its anonymous volumes
    pub async fn remove_container(&self, container_id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.client.remove_container(container_id, Some(options)).await {
            Ok(_) => {
                debug!(container_id, "Removed Docker container");
                Ok(())
            }
            Err(DockerError::DockerResponseServerError { status_code: 404, .. }) => {
                debug!(container_id, "Container not found");
                Ok(())
            }
            Err(DockerError::DockerResponseServerError { status_code: 409, message }) => {
                Err(Error::StillBusy(format!("container '{}': {}", container_id, message)))
            }
            Err(e) => Err(Error::backend(format!("remove container '{}'", container_id), e)),
        }
    }

    /// Stream container logs and forward them to tracing.
    ///
    /// The stream stops when the container is removed through this manager.
    pub fn stream_logs(&self, container_id: &str) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let client = self.client.clone();
        let container_id = container_id.to_string();

        if let Some(previous) = self
            .log_streams
            .lock()
            .insert(container_id.clone(), shutdown_tx)
        {
            let _ = previous.send(true);
        }

        tokio::spawn(async move {
            let options = LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                timestamps: false,
                ..Default::default()
            };

            let mut log_stream = client.logs(&container_id, Some(options));

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        debug!(container_id, "Log streaming stopped");
                        break;
                    }
                    log_result = log_stream.next() => {
                        match log_result {
                            Some(Ok(output)) => log_line(&container_id, output),
                            Some(Err(e)) => {
                                warn!(container_id, error = %e, "Error reading container logs");
                                break;
                            }
                            None => {
                                debug!(container_id, "Container log stream ended");
                                break;
                            }
                        }
                    }
                }
            }
        });
    }

    fn stop_log_stream(&self, container_id: &str) {
        if let Some(tx) = self.log_streams.lock().remove(container_id) {
            let _ = tx.send(true);
        }
    }

    fn container_config(&self, namespace: &str, request: &ContainerRequest) -> Result<Config<String>> {
        let port_key = format!("{}/tcp", self.settings.container_port);
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(request.host_port.to_string()),
            }]),
        );

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        let mut host_config = HostConfig {
            port_bindings: Some(port_bindings),
            network_mode: self.settings.network.clone(),
            ..Default::default()
        };
        if let Some(ref memory) = self.settings.memory {
            host_config.memory = Some(parse_memory_limit(memory)?);
        }
        if let Some(ref cpus) = self.settings.cpus {
            host_config.nano_cpus = Some(parse_cpu_limit(cpus)?);
        }

        let mut env: Vec<String> = self
            .settings
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        env.push(format!("PORT={}", self.settings.container_port));

        let labels = HashMap::from([
            (NAMESPACE_LABEL.to_string(), namespace.to_string()),
            (SNAPSHOT_LABEL.to_string(), request.snapshot_id.clone()),
        ]);

        Ok(Config {
            image: Some(request.image.clone()),
            env: Some(env),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        })
    }

    fn wait_container(&self, container_id: &str) -> ExitWaiter {
        let (mut tx, waiter) = ExitWaiter::channel();
        let client = self.client.clone();
        let container_id = container_id.to_string();

        tokio::spawn(async move {
            let options = WaitContainerOptions {
                condition: "next-exit",
            };
            let mut stream = client.wait_container(&container_id, Some(options));
            let status = tokio::select! {
                _ = tx.closed() => return,
                next = stream.next() => match next {
                    Some(Ok(response)) => Ok(ExitStatus::new(response.status_code)),
                    Some(Err(DockerError::DockerContainerWaitError { code, .. })) => {
                        Ok(ExitStatus::new(code))
                    }
                    Some(Err(e)) => Err(Error::backend(format!("wait container '{}'", container_id), e)),
                    None => Err(Error::Backend(format!("wait on container '{}' ended without a status", container_id))),
                },
            };
            let _ = tx.send(status);
        });

        waiter
    }

    fn wait_exec(&self, exec_id: &str) -> ExitWaiter {
        let (mut tx, waiter) = ExitWaiter::channel();
        let client = self.client.clone();
        let exec_id = exec_id.to_string();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(EXEC_POLL_INTERVAL);
            let status = loop {
                tokio::select! {
                    _ = tx.closed() => return,
                    _ = interval.tick() => {}
                }
                match client.inspect_exec(&exec_id).await {
                    Ok(exec) => {
                        if exec.running == Some(true) {
                            continue;
                        }
                        if let Some(code) = exec.exit_code {
                            break Ok(ExitStatus::new(code));
                        }
                    }
                    Err(e) => break Err(Error::backend(format!("inspect exec '{}'", exec_id), e)),
                }
            };
            let _ = tx.send(status);
        });

        waiter
    }

    /// The engine has no kill endpoint for execs, and the pid it reports
    /// lives in the daemon's pid namespace, so a running exec is left to
    /// die with its container (`remove_container` forces that).
    async fn kill_exec(&self, exec_id: &str) -> Result<()> {
        match self.client.inspect_exec(exec_id).await {
            Ok(exec) if exec.running == Some(true) => {
                debug!(
                    exec_id,
                    container_id = exec.container_id.as_deref().unwrap_or(""),
                    "Exec still running; it is reaped when its container is removed"
                );
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(DockerError::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(Error::backend(format!("inspect exec '{}'", exec_id), e)),
        }
    }
}

fn log_line(container_id: &str, output: LogOutput) {
    let (stream, message) = match output {
        LogOutput::StdOut { message } => ("stdout", message),
        LogOutput::StdErr { message } => ("stderr", message),
        LogOutput::Console { message } => ("console", message),
        LogOutput::StdIn { .. } => return,
    };
    let text = String::from_utf8_lossy(&message);
    let line = text.trim_end();
    if line.is_empty() {
        return;
    }
    if stream == "stderr" {
        warn!(target: "container", instance_id = container_id, stream, "{}", line);
    } else {
        info!(target: "container", instance_id = container_id, stream, "{}", line);
    }
}

#[async_trait]
impl RuntimeDriver for DockerManager {
    async fn import(&self, namespace: &str, archive: Bytes) -> Result<Vec<String>> {
        let mut stream = self
            .client
            .import_image(ImportImageOptions { quiet: true }, archive, None);

        let mut lines = Vec::new();
        while let Some(result) = stream.next().await {
            let info = result.map_err(|e| Error::backend("load image archive", e))?;
            if let Some(error) = info.error {
                return Err(Error::MalformedInput(format!("image archive rejected: {}", error)));
            }
            if let Some(line) = info.stream {
                lines.push(line);
            }
        }

        let names = parse_loaded_images(lines.iter().map(String::as_str));
        info!(namespace, images = ?names, "Loaded image archive");
        Ok(names)
    }

    async fn pull(&self, namespace: &str, reference: &str) -> Result<String> {
        info!(namespace, image = reference, "Pulling Docker image");
        let options = CreateImageOptions {
            from_image: reference,
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            let info = result.map_err(|e| {
                let err_str = e.to_string();
                if err_str.contains("manifest unknown") || err_str.contains("not found") {
                    Error::NotFound(format!("image '{}' in registry", reference))
                } else {
                    Error::backend(format!("pull image '{}'", reference), e)
                }
            })?;
            if let Some(error) = info.error {
                return Err(Error::backend(format!("pull image '{}'", reference), error));
            }
            if let Some(status) = info.status {
                debug!(image = reference, status, "Pull progress");
            }
        }

        Ok(reference.to_string())
    }

    async fn delete_image(&self, namespace: &str, name: &str) -> Result<()> {
        let options = RemoveImageOptions {
            force: false,
            noprune: false,
        };
        match self.client.remove_image(name, Some(options), None).await {
            Ok(_) => {
                debug!(namespace, image = name, "Removed image");
                Ok(())
            }
            Err(DockerError::DockerResponseServerError { status_code: 404, .. }) => {
                debug!(namespace, image = name, "Image not found");
                Ok(())
            }
            Err(DockerError::DockerResponseServerError { status_code: 409, message }) => {
                Err(Error::StillBusy(format!("image '{}': {}", name, message)))
            }
            Err(e) => Err(Error::backend(format!("remove image '{}'", name), e)),
        }
    }

    async fn create_container(&self, namespace: &str, request: &ContainerRequest) -> Result<()> {
        let config = self.container_config(namespace, request)?;
        let options = CreateContainerOptions {
            name: request.id.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(options), config)
            .await
            .map_err(|e| {
                let err_str = e.to_string();
                if err_str.contains("Conflict") {
                    Error::AlreadyExists(format!("container '{}'", request.id))
                } else if err_str.contains("No such image") {
                    Error::NotFound(format!("image '{}'", request.image))
                } else {
                    Error::backend(
                        format!("create container '{}' from image '{}'", request.id, request.image),
                        e,
                    )
                }
            })?;

        info!(
            namespace,
            instance_id = %request.id,
            container_id = %response.id,
            image = %request.image,
            port = request.host_port,
            "Created Docker container"
        );
        Ok(())
    }

    async fn delete_container(&self, _namespace: &str, id: &str) -> Result<()> {
        self.stop_log_stream(id);
        self.remove_container(id).await
    }

    async fn create_task(
        &self,
        _namespace: &str,
        container: &str,
        process: &ProcessSpec,
    ) -> Result<TaskHandle> {
        if process.is_entrypoint() {
            return Ok(TaskHandle::entrypoint(container));
        }

        let options = CreateExecOptions {
            cmd: Some(process.args.clone()),
            working_dir: process.cwd.clone(),
            attach_stdout: Some(false),
            attach_stderr: Some(false),
            ..Default::default()
        };
        let exec = self
            .client
            .create_exec(container, options)
            .await
            .map_err(|e| match e {
                DockerError::DockerResponseServerError { status_code: 404, .. } => {
                    Error::NotFound(format!("container '{}'", container))
                }
                DockerError::DockerResponseServerError { status_code: 409, .. } => {
                    Error::Backend(format!("container '{}' is not running", container))
                }
                other => Error::backend(format!("create exec in '{}'", container), other),
            })?;

        Ok(TaskHandle {
            container: container.to_string(),
            exec_id: Some(exec.id),
        })
    }

    async fn start_task(&self, _namespace: &str, task: &TaskHandle) -> Result<()> {
        match &task.exec_id {
            None => {
                self.client
                    .start_container(&task.container, None::<StartContainerOptions<String>>)
                    .await
                    .map_err(|e| {
                        let err_str = e.to_string();
                        if err_str.contains("port is already allocated")
                            || err_str.contains("address already in use")
                        {
                            Error::backend(
                                format!("start container '{}'", task.container),
                                "host port is already in use",
                            )
                        } else {
                            Error::backend(format!("start container '{}'", task.container), e)
                        }
                    })?;
                if self.settings.stream_logs {
                    self.stream_logs(&task.container);
                }
                info!(instance_id = %task.container, "Started Docker container");
                Ok(())
            }
            Some(exec_id) => {
                let options = StartExecOptions {
                    detach: true,
                    ..Default::default()
                };
                self.client
                    .start_exec(exec_id, Some(options))
                    .await
                    .map_err(|e| Error::backend(format!("start exec '{}'", exec_id), e))?;
                Ok(())
            }
        }
    }

    async fn wait_task(&self, _namespace: &str, task: &TaskHandle) -> Result<ExitWaiter> {
        Ok(match &task.exec_id {
            None => self.wait_container(&task.container),
            Some(exec_id) => self.wait_exec(exec_id),
        })
    }

    async fn kill_task(&self, _namespace: &str, task: &TaskHandle) -> Result<()> {
        match &task.exec_id {
            None => self.kill_container(&task.container).await,
            Some(exec_id) => self.kill_exec(exec_id).await,
        }
    }

    async fn delete_task(&self, _namespace: &str, task: &TaskHandle) -> Result<()> {
        match &task.exec_id {
            None => self.stop_container(&task.container).await,
            // the daemon drops finished execs with their container
            Some(_) => Ok(()),
        }
    }

    async fn inspect_container(&self, _namespace: &str, id: &str) -> Result<serde_json::Value> {
        let info = self
            .client
            .inspect_container(id, None)
            .await
            .map_err(|e| match e {
                DockerError::DockerResponseServerError { status_code: 404, .. } => {
                    Error::NotFound(format!("container '{}'", id))
                }
                other => Error::backend(format!("inspect container '{}'", id), other),
            })?;
        serde_json::to_value(info).map_err(|e| Error::backend("encode container info", e))
    }
}

/// Extract image names from the progress lines of an image load.
///
/// Tagged images report `Loaded image: <name>`; untagged ones report
/// `Loaded image ID: <id>`.
pub fn parse_loaded_images<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    lines
        .into_iter()
        .flat_map(str::lines)
        .filter_map(|line| {
            let line = line.trim();
            line.strip_prefix("Loaded image ID:")
                .or_else(|| line.strip_prefix("Loaded image:"))
                .map(|name| name.trim().to_string())
        })
        .filter(|name| !name.is_empty())
        .collect()
}

/// Parse memory limit string (e.g., "512m", "1g") to bytes
pub fn parse_memory_limit(limit: &str) -> Result<i64> {
    let limit = limit.trim().to_lowercase();
    let (num_str, multiplier) = if limit.ends_with('g') || limit.ends_with("gb") {
        let num = limit.trim_end_matches("gb").trim_end_matches('g');
        (num, 1024 * 1024 * 1024i64)
    } else if limit.ends_with('m') || limit.ends_with("mb") {
        let num = limit.trim_end_matches("mb").trim_end_matches('m');
        (num, 1024 * 1024i64)
    } else if limit.ends_with('k') || limit.ends_with("kb") {
        let num = limit.trim_end_matches("kb").trim_end_matches('k');
        (num, 1024i64)
    } else {
        (limit.as_str(), 1i64)
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| Error::MalformedInput(format!("invalid memory limit: {}", limit)))?;

    Ok((num * multiplier as f64) as i64)
}

/// Parse a CPU count (e.g. "0.5") into nano-CPUs
pub fn parse_cpu_limit(cpus: &str) -> Result<i64> {
    let count: f64 = cpus
        .trim()
        .parse()
        .map_err(|_| Error::MalformedInput(format!("invalid CPU limit: {}", cpus)))?;
    if count <= 0.0 {
        return Err(Error::MalformedInput(format!("invalid CPU limit: {}", cpus)));
    }
    Ok((count * 1_000_000_000.0) as i64)
}
