//! Runtime configuration
//!
//! Everything the lifecycle manager needs to build an instance. Values come
//! from `Default`, an optional TOML/JSON document (all fields default), and
//! finally the environment overrides applied by [`RuntimeConfig::from_env`].

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Executable override.
pub const ENV_EXECUTABLE: &str = "APPTAINER_EXECUTABLE";
/// Directory receiving one `<session>.log` per sandbox.
pub const ENV_LOG_DIR: &str = "APPTAINER_RUNTIME_LOG_DIR";
/// Directory holding the cross-process port lock files.
pub const ENV_LOCK_DIR: &str = "SANDBOX_PORT_LOCK_DIR";

/// Inclusive TCP port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub const fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.min..=self.max).contains(&port)
    }

    pub fn len(&self) -> usize {
        if self.max < self.min {
            0
        } else {
            usize::from(self.max - self.min) + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.min..=self.max
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

/// Port ranges for every port an instance reserves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortRanges {
    /// Action-execution server (host port == container port)
    pub execution_server: PortRange,
    /// VS Code server
    pub vscode: PortRange,
    /// First application port
    pub app_1: PortRange,
    /// Second application port
    pub app_2: PortRange,
}

impl Default for PortRanges {
    fn default() -> Self {
        Self {
            execution_server: PortRange::new(30000, 39999),
            vscode: PortRange::new(40000, 49999),
            app_1: PortRange::new(50000, 54999),
            app_2: PortRange::new(55000, 59999),
        }
    }
}

/// How runtime parameters are exported to the sandboxed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvPrefixMode {
    /// Export under both `APPTAINERENV_` and `SINGULARITYENV_`, whichever
    /// binary ends up running.
    #[default]
    Dual,
    /// Export only under the prefix of the resolved tool flavor.
    Resolved,
}

/// Startup command of the in-container action-execution server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerLaunch {
    /// Interpreter prefix, e.g. `python -u -m`
    pub program: Vec<String>,
    /// Module (or script) launched by `program`
    pub main_module: String,
    /// Working directory inside the sandbox
    pub working_dir: String,
    /// Plugins to enable
    pub plugins: Vec<String>,
    /// User the server runs commands as
    pub username: String,
    /// Numeric id of that user
    pub user_id: u32,
    /// Appended verbatim
    pub extra_args: Vec<String>,
}

impl Default for ServerLaunch {
    fn default() -> Self {
        Self {
            program: vec!["python".into(), "-u".into(), "-m".into()],
            main_module: "openhands.runtime.action_execution_server".into(),
            working_dir: "/workspace".into(),
            plugins: Vec::new(),
            username: "openhands".into(),
            user_id: 1000,
            extra_args: Vec::new(),
        }
    }
}

impl ServerLaunch {
    /// Full argv for the server listening on `port`.
    pub fn argv(&self, port: u16) -> Vec<String> {
        let mut argv = self.program.clone();
        argv.push(self.main_module.clone());
        argv.push(port.to_string());
        argv.push("--working-dir".into());
        argv.push(self.working_dir.clone());
        if !self.plugins.is_empty() {
            argv.push("--plugins".into());
            argv.extend(self.plugins.iter().cloned());
        }
        argv.push("--username".into());
        argv.push(self.username.clone());
        argv.push("--user-id".into());
        argv.push(self.user_id.to_string());
        argv.extend(self.extra_args.iter().cloned());
        argv
    }
}

/// Configuration for an Apptainer-backed sandbox runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Image the sandbox runs (takes priority)
    pub runtime_container_image: Option<String>,
    /// Fallback image
    pub base_container_image: Option<String>,
    /// Scheme and host of the advertised URL; the port is appended
    pub local_runtime_url: String,
    /// Pass `--nv` for GPU access
    pub enable_gpu: bool,
    /// Comma-separated `host:container[:mode]` binds
    pub volumes: Option<String>,
    /// Host side of the default workspace bind
    pub workspace_mount_path: Option<PathBuf>,
    /// Sandbox side of the default workspace bind
    pub workspace_mount_path_in_sandbox: Option<String>,
    /// Readiness deadline, milliseconds
    pub init_timeout_ms: u64,
    /// Attach to an already-running sandbox instead of spawning one
    pub attach_to_existing: bool,
    /// Directory for per-session log files
    pub log_dir: Option<PathBuf>,
    /// Container tool override (name on PATH or a path)
    pub executable: Option<String>,
    /// Directory for port lock files
    pub lock_dir: Option<PathBuf>,
    /// Port ranges
    pub port_ranges: PortRanges,
    /// Address used to test port availability
    pub bind_address: String,
    /// Budget for the lock-backed allocation path, milliseconds
    pub lock_timeout_ms: u64,
    /// SIGTERM grace period, seconds
    pub graceful_timeout_secs: u64,
    /// Wait after SIGKILL, seconds
    pub kill_timeout_secs: u64,
    /// Pause between liveness checks, milliseconds
    pub probe_interval_ms: u64,
    /// Environment prefix policy
    pub env_prefix_mode: EnvPrefixMode,
    /// In-container server startup command
    pub server: ServerLaunch,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            runtime_container_image: None,
            base_container_image: None,
            local_runtime_url: "http://localhost".to_string(),
            enable_gpu: false,
            volumes: None,
            workspace_mount_path: None,
            workspace_mount_path_in_sandbox: None,
            init_timeout_ms: 180_000,
            attach_to_existing: false,
            log_dir: None,
            executable: None,
            lock_dir: None,
            port_ranges: PortRanges::default(),
            bind_address: "0.0.0.0".to_string(),
            lock_timeout_ms: 1_000,
            graceful_timeout_secs: 10,
            kill_timeout_secs: 5,
            probe_interval_ms: 1_000,
            env_prefix_mode: EnvPrefixMode::Dual,
            server: ServerLaunch::default(),
        }
    }
}

impl RuntimeConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `APPTAINER_EXECUTABLE`, `APPTAINER_RUNTIME_LOG_DIR` and
    /// `SANDBOX_PORT_LOCK_DIR` when they are set and non-empty.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(exe) = non_empty_env(ENV_EXECUTABLE) {
            self.executable = Some(exe);
        }
        if let Some(dir) = non_empty_env(ENV_LOG_DIR) {
            self.log_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = non_empty_env(ENV_LOCK_DIR) {
            self.lock_dir = Some(PathBuf::from(dir));
        }
        self
    }

    /// Set the runtime image
    pub fn with_image(mut self, image: &str) -> Self {
        self.runtime_container_image = Some(image.to_string());
        self
    }

    /// Set bind-mount volumes
    pub fn with_volumes(mut self, volumes: &str) -> Self {
        self.volumes = Some(volumes.to_string());
        self
    }

    /// Enable or disable GPU passthrough
    pub fn with_gpu(mut self, enable: bool) -> Self {
        self.enable_gpu = enable;
        self
    }

    /// Set the readiness deadline
    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the port lock directory
    pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = Some(dir.into());
        self
    }

    /// Set the container tool executable
    pub fn with_executable(mut self, exe: impl Into<String>) -> Self {
        self.executable = Some(exe.into());
        self
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_timeout_secs)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.kill_timeout_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    /// Lock directory, falling back to a fixed directory under the system temp dir.
    pub fn resolved_lock_dir(&self) -> PathBuf {
        self.lock_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("sandbox-runtime-port-locks"))
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_config_default() {
        let config = RuntimeConfig::default();
        assert_eq!(config.local_runtime_url, "http://localhost");
        assert_eq!(config.init_timeout(), Duration::from_secs(180));
        assert_eq!(config.graceful_timeout(), Duration::from_secs(10));
        assert_eq!(config.kill_timeout(), Duration::from_secs(5));
        assert_eq!(config.probe_interval(), Duration::from_secs(1));
        assert_eq!(config.env_prefix_mode, EnvPrefixMode::Dual);
        assert_eq!(config.port_ranges.execution_server, PortRange::new(30000, 39999));
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let json = r#"{"runtime_container_image": "org/img:1", "enable_gpu": true,
                       "port_ranges": {"vscode": {"min": 41000, "max": 41010}}}"#;
        let config: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.runtime_container_image.as_deref(), Some("org/img:1"));
        assert!(config.enable_gpu);
        assert_eq!(config.port_ranges.vscode, PortRange::new(41000, 41010));
        assert_eq!(config.port_ranges.app_1, PortRange::new(50000, 54999));
        assert_eq!(config.bind_address, "0.0.0.0");
    }

    #[test]
    fn test_port_range_len() {
        assert_eq!(PortRange::new(30000, 30002).len(), 3);
        assert!(PortRange::new(5, 4).is_empty());
        assert!(PortRange::new(30000, 30002).contains(30001));
        assert!(!PortRange::new(30000, 30002).contains(30003));
        assert_eq!(PortRange::new(1, 2).to_string(), "1-2");
    }

    #[test]
    fn test_server_launch_argv() {
        let launch = ServerLaunch {
            plugins: vec!["jupyter".into(), "agent_skills".into()],
            ..ServerLaunch::default()
        };
        let argv = launch.argv(30123);
        assert_eq!(
            argv,
            vec![
                "python",
                "-u",
                "-m",
                "openhands.runtime.action_execution_server",
                "30123",
                "--working-dir",
                "/workspace",
                "--plugins",
                "jupyter",
                "agent_skills",
                "--username",
                "openhands",
                "--user-id",
                "1000",
            ]
        );
    }

    #[test]
    fn test_server_launch_without_plugins() {
        let argv = ServerLaunch::default().argv(1);
        assert!(!argv.contains(&"--plugins".to_string()));
    }

    #[test]
    fn test_init_timeout_keeps_sub_second_precision() {
        let config = RuntimeConfig::default().with_init_timeout(Duration::from_millis(1500));
        assert_eq!(config.init_timeout(), Duration::from_millis(1500));

        let short = RuntimeConfig::default().with_init_timeout(Duration::from_millis(500));
        assert_eq!(short.init_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_builders() {
        let config = RuntimeConfig::default()
            .with_image("a/b")
            .with_volumes("/x:/y")
            .with_gpu(true)
            .with_init_timeout(Duration::from_secs(7))
            .with_lock_dir("/tmp/locks")
            .with_executable("singularity");
        assert_eq!(config.runtime_container_image.as_deref(), Some("a/b"));
        assert_eq!(config.volumes.as_deref(), Some("/x:/y"));
        assert!(config.enable_gpu);
        assert_eq!(config.init_timeout_ms, 7_000);
        assert_eq!(config.resolved_lock_dir(), PathBuf::from("/tmp/locks"));
        assert_eq!(config.executable.as_deref(), Some("singularity"));
    }
}
