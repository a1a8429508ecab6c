//! Multipass VM lifecycle through its command-line tool
//!
//! Every call runs the executable once and checks its exit status; list and
//! info use `--format json`. Calls that change VM state are serialized.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::Path;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Resources for a new VM
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    pub name: String,
    pub cpus: u32,
    /// e.g. "1G"
    pub memory: String,
    /// e.g. "5G"
    pub disk: String,
}

/// One row of `multipass list`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSummary {
    pub name: String,
    pub state: String,
    #[serde(default)]
    pub ipv4: Vec<String>,
    #[serde(default)]
    pub release: String,
}

impl VmSummary {
    pub fn is_running(&self) -> bool {
        self.state.eq_ignore_ascii_case("running")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskUsage {
    #[serde(default, deserialize_with = "lenient_u64")]
    pub used: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub total: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MountInfo {
    #[serde(default)]
    pub source_path: String,
    #[serde(default)]
    pub uid_mappings: Vec<String>,
    #[serde(default)]
    pub gid_mappings: Vec<String>,
}

/// Details of one VM from `multipass info`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmInfo {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub release: String,
    #[serde(default)]
    pub image_hash: String,
    #[serde(default)]
    pub image_release: String,
    #[serde(default)]
    pub ipv4: Vec<String>,
    #[serde(default)]
    pub load: Vec<f64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub cpu_count: Option<u64>,
    #[serde(default)]
    pub disks: HashMap<String, DiskUsage>,
    #[serde(default)]
    pub mounts: HashMap<String, MountInfo>,
}

#[derive(Deserialize)]
struct ListOutput {
    list: Vec<VmSummary>,
}

#[derive(Deserialize)]
struct InfoOutput {
    #[serde(default)]
    errors: Vec<serde_json::Value>,
    #[serde(default)]
    info: HashMap<String, VmInfo>,
}

/// The tool prints some counters as strings and others as numbers
fn lenient_u64<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

pub struct Multipass {
    program: OsString,
    leading_args: Vec<OsString>,
    lock: Mutex<()>,
}

impl Multipass {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self::with_command(program, Vec::<OsString>::new())
    }

    /// Run `program` with `leading_args` placed before every subcommand,
    /// e.g. an interpreter and a script path
    pub fn with_command<I, S>(program: impl Into<OsString>, leading_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            leading_args: leading_args.into_iter().map(Into::into).collect(),
            lock: Mutex::new(()),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<Vec<u8>> {
        debug!(program = ?self.program, ?args, "Running VM command");
        let output = Command::new(&self.program)
            .args(&self.leading_args)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::backend(format!("run {:?}", self.program), e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Backend(format!(
                "multipass {} failed ({}): {}",
                args.first().copied().unwrap_or_default(),
                output.status,
                stderr.trim()
            )));
        }
        Ok(output.stdout)
    }

    async fn run_locked(&self, args: &[&str]) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.run(args).await.map(|_| ())
    }

    pub async fn launch(&self, config: &VmConfig) -> Result<()> {
        let cpus = config.cpus.to_string();
        self.run_locked(&[
            "launch",
            "--name",
            &config.name,
            "--cpus",
            &cpus,
            "--memory",
            &config.memory,
            "--disk",
            &config.disk,
        ])
        .await?;
        info!(vm = %config.name, cpus = config.cpus, memory = %config.memory, disk = %config.disk, "VM launched");
        Ok(())
    }

    /// Mount host directory `source` at `target` inside VM `name`
    pub async fn mount(&self, source: &Path, name: &str, target: &str) -> Result<()> {
        let source = source.to_string_lossy();
        let destination = format!("{}:{}", name, target);
        self.run_locked(&["mount", &source, &destination]).await
    }

    pub async fn unmount(&self, name: &str, target: &str) -> Result<()> {
        let destination = format!("{}:{}", name, target);
        self.run_locked(&["unmount", &destination]).await
    }

    pub async fn start(&self, name: &str) -> Result<()> {
        self.run_locked(&["start", name]).await
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        self.run_locked(&["stop", name]).await
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        self.run_locked(&["delete", name]).await?;
        info!(vm = name, "VM deleted");
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<VmSummary>> {
        let stdout = self.run(&["list", "--format", "json"]).await?;
        let parsed: ListOutput = serde_json::from_slice(&stdout)
            .map_err(|e| Error::MalformedInput(format!("multipass list output: {}", e)))?;
        Ok(parsed.list)
    }

    pub async fn info(&self, name: &str) -> Result<VmInfo> {
        let stdout = self.run(&["info", name, "--format", "json"]).await?;
        let mut parsed: InfoOutput = serde_json::from_slice(&stdout)
            .map_err(|e| Error::MalformedInput(format!("multipass info output: {}", e)))?;
        if !parsed.errors.is_empty() {
            return Err(Error::Backend(format!(
                "multipass info {}: {}",
                name,
                serde_json::Value::Array(parsed.errors)
            )));
        }
        parsed
            .info
            .remove(name)
            .ok_or_else(|| Error::NotFound(format!("vm '{}'", name)))
    }

    pub async fn is_running(&self, name: &str) -> Result<bool> {
        Ok(self
            .list()
            .await?
            .iter()
            .any(|vm| vm.name == name && vm.is_running()))
    }

    pub async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.list().await?.iter().any(|vm| vm.name == name))
    }
}

impl Default for Multipass {
    fn default() -> Self {
        Self::new("multipass")
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    const LIST_JSON: &str = r#"{"list":[{"ipv4":["10.0.0.5"],"name":"web","release":"22.04 LTS","state":"Running"},{"ipv4":[],"name":"idle","release":"22.04 LTS","state":"Stopped"}]}"#;

    const INFO_JSON: &str = r#"{"errors":[],"info":{"web":{"cpu_count":"2","disks":{"sda1":{"total":"5116440064","used":"1731129856"}},"image_hash":"abc123","image_release":"22.04 LTS","ipv4":["10.0.0.5"],"load":[0.1,0.05,0.01],"memory":{"total":1023,"used":200},"mounts":{"/home/ubuntu/app":{"gid_mappings":["1000:default"],"source_path":"/srv/app","uid_mappings":["1000:default"]}},"release":"Ubuntu 22.04.3 LTS","state":"Running"}}}"#;

    /// A stand-in for the multipass executable, run through /bin/sh.
    /// It logs its arguments and answers list/info with canned JSON.
    fn fake_cli(dir: &TempDir, list: &str, info: &str) -> Multipass {
        let script = dir.path().join("multipass.sh");
        let log = dir.path().join("calls.log");
        let mut file = std::fs::File::create(&script).unwrap();
        write!(
            file,
            r#"echo "$@" >> '{log}'
case "$1" in
  list) printf '%s' '{list}' ;;
  info) printf '%s' '{info}' ;;
  fail) echo "launch failed: boom" >&2; exit 2 ;;
  *) ;;
esac
"#,
            log = log.display(),
            list = list,
            info = info,
        )
        .unwrap();
        Multipass::with_command("/bin/sh", [script])
    }

    fn calls(dir: &TempDir) -> Vec<String> {
        std::fs::read_to_string(dir.path().join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(String::from)
            .collect()
    }

    #[tokio::test]
    async fn test_list_parses_json() {
        let dir = TempDir::new().unwrap();
        let vm = fake_cli(&dir, LIST_JSON, INFO_JSON);

        let list = vm.list().await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name, "web");
        assert_eq!(list[0].ipv4, vec!["10.0.0.5"]);
        assert_eq!(calls(&dir), vec!["list --format json"]);
    }

    #[tokio::test]
    async fn test_is_running_and_exists() {
        let dir = TempDir::new().unwrap();
        let vm = fake_cli(&dir, LIST_JSON, INFO_JSON);

        assert!(vm.is_running("web").await.unwrap());
        assert!(!vm.is_running("idle").await.unwrap());
        assert!(!vm.is_running("ghost").await.unwrap());
        assert!(vm.exists("idle").await.unwrap());
        assert!(!vm.exists("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn test_info_parses_string_and_number_fields() {
        let dir = TempDir::new().unwrap();
        let vm = fake_cli(&dir, LIST_JSON, INFO_JSON);

        let info = vm.info("web").await.unwrap();
        assert_eq!(info.state, "Running");
        assert_eq!(info.cpu_count, Some(2));
        assert_eq!(info.disks["sda1"].total, Some(5116440064));
        assert_eq!(info.mounts["/home/ubuntu/app"].source_path, "/srv/app");
        assert_eq!(info.load.len(), 3);

        let err = vm.info("other").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_info_reports_cli_errors() {
        let dir = TempDir::new().unwrap();
        let vm = fake_cli(&dir, LIST_JSON, r#"{"errors":["instance does not exist"],"info":{}}"#);

        let err = vm.info("web").await.unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
    }

    #[tokio::test]
    async fn test_malformed_output_is_reported() {
        let dir = TempDir::new().unwrap();
        let vm = fake_cli(&dir, "name state\nweb Running", INFO_JSON);

        let err = vm.list().await.unwrap_err();
        assert!(matches!(err, Error::MalformedInput(_)));
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_stderr() {
        let dir = TempDir::new().unwrap();
        let vm = fake_cli(&dir, LIST_JSON, INFO_JSON);

        let err = vm.run(&["fail"]).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("boom"), "{}", message);
    }

    #[tokio::test]
    async fn test_lifecycle_commands() {
        let dir = TempDir::new().unwrap();
        let vm = fake_cli(&dir, LIST_JSON, INFO_JSON);

        vm.launch(&VmConfig {
            name: "web".to_string(),
            cpus: 2,
            memory: "1G".to_string(),
            disk: "5G".to_string(),
        })
        .await
        .unwrap();
        vm.mount(Path::new("/srv/app"), "web", "/home/ubuntu/app")
            .await
            .unwrap();
        vm.unmount("web", "/home/ubuntu/app").await.unwrap();
        vm.stop("web").await.unwrap();
        vm.start("web").await.unwrap();
        vm.delete("web").await.unwrap();

        assert_eq!(
            calls(&dir),
            vec![
                "launch --name web --cpus 2 --memory 1G --disk 5G",
                "mount /srv/app web:/home/ubuntu/app",
                "unmount web:/home/ubuntu/app",
                "stop web",
                "start web",
                "delete web",
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_program() {
        let vm = Multipass::new("/nonexistent/multipass-binary");
        assert!(matches!(vm.list().await, Err(Error::Backend(_))));
    }
}
