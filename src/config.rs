use crate::deploy::{DeployPolicy, SwapOrder};
use crate::docker::ContainerSettings;
use crate::pool::PoolConfig;
use crate::ports::{DEFAULT_PORT_RANGE_END, DEFAULT_PORT_RANGE_START};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the compositor
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    /// Host port range handed to backend instances
    #[serde(default)]
    pub ports: PortRangeConfig,

    #[serde(default)]
    pub backend: BackendConfig,

    /// Swap protocol tuning
    #[serde(default)]
    pub deploy: DeployConfig,

    #[serde(default)]
    pub vm: VmSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Ingress HTTP port (default: 80, set to 0 to disable)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Ingress HTTPS port (default: 443 when TLS enabled, set to 0 to disable)
    pub tls_port: Option<u16>,

    /// Bind address for the ingress (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the registration API
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Bind address for the registration API (default: 127.0.0.1)
    #[serde(default = "default_api_bind")]
    pub api_bind: String,

    /// Bearer token required for registrations. Open when unset.
    pub api_token: Option<String>,

    /// Enable TLS (default: false). If true without cert/key, generates self-signed.
    #[serde(default)]
    pub tls: bool,

    /// Path to TLS certificate file (PEM format)
    pub tls_cert: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub tls_key: Option<String>,

    /// Deadline for a backend round trip in seconds (default: 10)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Largest accepted image upload in bytes (default: 1 GiB)
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,

    /// Mount point stripped from request paths before route resolution
    pub route_prefix: Option<String>,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl ServerConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls || self.has_tls_files()
    }

    pub fn has_tls_files(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    /// Get HTTP port (0 means disabled)
    pub fn http_port(&self) -> u16 {
        self.port
    }

    /// Get HTTPS port (0 means disabled)
    pub fn https_port(&self) -> u16 {
        if !self.tls_enabled() {
            return 0;
        }
        self.tls_port.unwrap_or(443)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_idle_per_host: self.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            tls_port: None,
            bind: default_bind_address(),
            api_port: default_api_port(),
            api_bind: default_api_bind(),
            api_token: None,
            tls: false,
            tls_cert: None,
            tls_key: None,
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            max_upload_bytes: default_max_upload_bytes(),
            route_prefix: None,
            pid_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PortRangeConfig {
    #[serde(default = "default_port_start")]
    pub start: u16,
    #[serde(default = "default_port_end")]
    pub end: u16,
}

impl Default for PortRangeConfig {
    fn default() -> Self {
        Self {
            start: default_port_start(),
            end: default_port_end(),
        }
    }
}

/// Which backend variant manages instances
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// One container per instance bound to one host port
    #[default]
    Single,
    /// Namespace-scoped registries for images, containers, tasks and snapshots
    Namespaced,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,

    /// Namespace label put on every container and image this process owns
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Docker daemon address (default: local socket)
    pub docker_host: Option<String>,

    /// Port the application listens on inside its container (default: 80)
    #[serde(default = "default_container_port")]
    pub container_port: u16,

    /// Docker network to attach containers to
    pub network: Option<String>,

    /// Memory limit (e.g. "512m", "1g")
    pub memory: Option<String>,

    /// CPU limit (e.g. "0.5", "2")
    pub cpus: Option<String>,

    /// Seconds Docker waits between SIGTERM and SIGKILL when stopping (default: 10)
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Extra environment variables for every container
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl BackendConfig {
    pub fn container_settings(&self) -> ContainerSettings {
        ContainerSettings {
            container_port: self.container_port,
            network: self.network.clone(),
            memory: self.memory.clone(),
            cpus: self.cpus.clone(),
            env: self.env.clone(),
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
            ..ContainerSettings::default()
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            namespace: default_namespace(),
            docker_host: None,
            container_port: default_container_port(),
            network: None,
            memory: None,
            cpus: None,
            stop_timeout_secs: default_stop_timeout(),
            env: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeployConfig {
    #[serde(default)]
    pub order: SwapOrder,

    /// Seconds to wait for a new instance to accept TCP (0 disables)
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,

    /// Linear backoff step between teardown retries in milliseconds
    #[serde(default = "default_teardown_backoff")]
    pub teardown_backoff_ms: u64,

    /// Give up on an old instance after this many attempts (0 = never)
    #[serde(default)]
    pub max_teardown_attempts: u32,

    /// Upper bound for each stage of the shutdown teardown pass
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl DeployConfig {
    pub fn policy(&self) -> DeployPolicy {
        DeployPolicy {
            order: self.order,
            ready_timeout: Duration::from_secs(self.ready_timeout_secs),
            backoff_step: Duration::from_millis(self.teardown_backoff_ms),
            max_teardown_attempts: self.max_teardown_attempts,
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            order: SwapOrder::default(),
            ready_timeout_secs: default_ready_timeout(),
            teardown_backoff_ms: default_teardown_backoff(),
            max_teardown_attempts: 0,
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct VmSettings {
    #[serde(default)]
    pub enabled: bool,

    /// Path or name of the multipass executable
    #[serde(default = "default_vm_program")]
    pub program: String,
}

impl Default for VmSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            program: default_vm_program(),
        }
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    80
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8888
}

fn default_api_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_pool_max_idle_per_host() -> usize {
    10 // Keep up to 10 idle connections per backend
}

fn default_pool_idle_timeout() -> u64 {
    90 // Close idle connections after 90 seconds
}

fn default_max_upload_bytes() -> usize {
    1 << 30
}

fn default_port_start() -> u16 {
    DEFAULT_PORT_RANGE_START
}

fn default_port_end() -> u16 {
    DEFAULT_PORT_RANGE_END
}

fn default_namespace() -> String {
    "compositor".to_string()
}

fn default_container_port() -> u16 {
    80
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_ready_timeout() -> u64 {
    30
}

fn default_teardown_backoff() -> u64 {
    1000 // 1s, 2s, 3s, ...
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_vm_program() -> String {
    "multipass".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.ports.start == 0 {
            errors.push("ports.start must be greater than 0".to_string());
        }
        if self.ports.start > self.ports.end {
            errors.push(format!(
                "ports: start ({}) is greater than end ({})",
                self.ports.start, self.ports.end
            ));
        }

        if self.backend.container_port == 0 {
            errors.push("backend.container_port must be greater than 0".to_string());
        }

        match (&self.server.tls_cert, &self.server.tls_key) {
            (Some(_), None) => errors.push("server.tls_cert is set without server.tls_key".to_string()),
            (None, Some(_)) => errors.push("server.tls_key is set without server.tls_cert".to_string()),
            _ => {}
        }

        if let Some(prefix) = &self.server.route_prefix {
            if !prefix.starts_with('/') || prefix.contains(['?', '#']) || prefix.contains("//") {
                errors.push(format!(
                    "server.route_prefix '{}' must be an absolute path without query or fragment",
                    prefix
                ));
            }
        }

        if self.server.max_upload_bytes == 0 {
            errors.push("server.max_upload_bytes must be greater than 0".to_string());
        }

        if let Some(memory) = &self.backend.memory {
            if let Err(e) = crate::docker::parse_memory_limit(memory) {
                errors.push(format!("backend.memory: {}", e));
            }
        }
        if let Some(cpus) = &self.backend.cpus {
            if let Err(e) = crate::docker::parse_cpu_limit(cpus) {
                errors.push(format!("backend.cpus: {}", e));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 8080
bind = "127.0.0.1"
api_port = 9000
api_token = "secret"
request_timeout_secs = 5
route_prefix = "/apps"

[ports]
start = 50000
end = 50100

[backend]
kind = "namespaced"
namespace = "staging"
container_port = 3000
memory = "512m"
cpus = "0.5"
env = { RUST_LOG = "info" }

[deploy]
order = "detach-then-create"
ready_timeout_secs = 0
teardown_backoff_ms = 250
max_teardown_attempts = 20

[vm]
enabled = true
program = "/usr/local/bin/multipass"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.api_port, 9000);
        assert_eq!(config.server.api_token.as_deref(), Some("secret"));
        assert_eq!(config.server.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.server.route_prefix.as_deref(), Some("/apps"));
        assert_eq!(config.ports.start, 50000);
        assert_eq!(config.backend.kind, BackendKind::Namespaced);
        assert_eq!(config.backend.namespace, "staging");
        assert_eq!(config.backend.env["RUST_LOG"], "info");
        assert_eq!(config.deploy.order, SwapOrder::DetachThenCreate);
        assert!(config.vm.enabled);

        let policy = config.deploy.policy();
        assert_eq!(policy.ready_timeout, Duration::ZERO);
        assert_eq!(policy.backoff_step, Duration::from_millis(250));
        assert_eq!(policy.max_teardown_attempts, 20);

        let settings = config.backend.container_settings();
        assert_eq!(settings.container_port, 3000);
        assert_eq!(settings.memory.as_deref(), Some("512m"));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.port, 80);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.api_port, 8888);
        assert_eq!(config.server.api_bind, "127.0.0.1");
        assert_eq!(config.server.max_upload_bytes, 1073741824);
        assert_eq!(config.server.pool_max_idle_per_host, 10);
        assert_eq!(config.ports.start, 49152);
        assert_eq!(config.ports.end, 65535);
        assert_eq!(config.backend.kind, BackendKind::Single);
        assert_eq!(config.backend.namespace, "compositor");
        assert_eq!(config.backend.container_port, 80);
        assert_eq!(config.deploy.order, SwapOrder::CreateThenSwap);
        assert_eq!(config.deploy.ready_timeout_secs, 30);
        assert_eq!(config.deploy.teardown_backoff_ms, 1000);
        assert_eq!(config.deploy.max_teardown_attempts, 0);
        assert_eq!(config.deploy.shutdown_timeout(), Duration::from_secs(30));
        assert!(!config.vm.enabled);
        assert_eq!(config.vm.program, "multipass");
    }

    #[test]
    fn test_tls_ports() {
        let mut server = ServerConfig::default();
        assert!(!server.tls_enabled());
        assert_eq!(server.https_port(), 0);

        server.tls = true;
        assert_eq!(server.https_port(), 443);

        server.tls_port = Some(8443);
        assert_eq!(server.https_port(), 8443);

        let server = ServerConfig {
            tls_cert: Some("cert.pem".to_string()),
            tls_key: Some("key.pem".to_string()),
            ..ServerConfig::default()
        };
        assert!(server.tls_enabled());
        assert!(server.has_tls_files());
    }

    #[test]
    fn test_validate_rejects_bad_port_range() {
        let config: Config = toml::from_str("[ports]\nstart = 60000\nend = 50000\n").unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("start (60000) is greater than end (50000)"));

        let config: Config = toml::from_str("[ports]\nstart = 0\nend = 10\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_single_port_range_is_fine() {
        let config: Config = toml::from_str("[ports]\nstart = 50000\nend = 50000\n").unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_container_port() {
        let config: Config = toml::from_str("[backend]\ncontainer_port = 0\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_half_tls_files() {
        let config: Config = toml::from_str("[server]\ntls_cert = \"cert.pem\"\n").unwrap();
        assert!(config.validate().unwrap_err().to_string().contains("tls_key"));

        let config: Config = toml::from_str("[server]\ntls_key = \"key.pem\"\n").unwrap();
        assert!(config.validate().unwrap_err().to_string().contains("tls_cert"));
    }

    #[test]
    fn test_validate_rejects_bad_route_prefix() {
        for prefix in ["apps", "/apps?x=1", "/a//b"] {
            let toml = format!("[server]\nroute_prefix = \"{}\"\n", prefix);
            let config: Config = toml::from_str(&toml).unwrap();
            assert!(config.validate().is_err(), "{}", prefix);
        }
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let toml = r#"
[ports]
start = 10
end = 5

[backend]
container_port = 0
memory = "lots"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("ports"));
        assert!(err.contains("container_port"));
        assert!(err.contains("backend.memory"));
    }

    #[test]
    fn test_unknown_order_rejected() {
        let result: Result<Config, _> = toml::from_str("[deploy]\norder = \"sideways\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("compositor.toml");
        std::fs::write(&path, "[server]\nport = 8080\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.port, 8080);

        assert!(Config::load(dir.path().join("missing.toml")).is_err());
    }
}
