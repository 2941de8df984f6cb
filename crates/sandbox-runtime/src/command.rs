//! `apptainer exec` invocation
//!
//! Resolves which container tool is installed and assembles the argument
//! list and environment for one sandbox process:
//!
//! ```text
//! <tool> exec --cleanenv [--bind host:container:mode]... [--nv] --pwd / <image> <server argv...>
//! ```

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{EnvPrefixMode, RuntimeConfig};
use crate::error::RuntimeError;
use crate::Result;

/// Binaries probed on `PATH`, in order.
pub const KNOWN_BINARIES: &[&str] = &["apptainer", "singularity"];

/// Which of the two compatible tools is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFlavor {
    Apptainer,
    Singularity,
}

impl ToolFlavor {
    /// Prefix the tool strips when forwarding variables into the sandbox.
    pub fn env_prefix(&self) -> &'static str {
        match self {
            ToolFlavor::Apptainer => "APPTAINERENV_",
            ToolFlavor::Singularity => "SINGULARITYENV_",
        }
    }

    pub fn all() -> [ToolFlavor; 2] {
        [ToolFlavor::Apptainer, ToolFlavor::Singularity]
    }

    /// Guess the flavor from the binary name; anything unrecognised is
    /// treated as Apptainer.
    pub fn from_executable(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if name.contains("singularity") {
            ToolFlavor::Singularity
        } else {
            ToolFlavor::Apptainer
        }
    }
}

impl std::fmt::Display for ToolFlavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolFlavor::Apptainer => write!(f, "apptainer"),
            ToolFlavor::Singularity => write!(f, "singularity"),
        }
    }
}

/// The resolved container tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerTool {
    executable: PathBuf,
    flavor: ToolFlavor,
}

impl ContainerTool {
    pub fn new(executable: impl Into<PathBuf>, flavor: ToolFlavor) -> Self {
        let executable = executable.into();
        ContainerTool { executable, flavor }
    }

    /// Resolve against the process `PATH`.
    pub fn resolve(override_exe: Option<&str>) -> Result<Self> {
        Self::resolve_in(override_exe, std::env::var_os("PATH"))
    }

    /// Resolve against an explicit search path.
    ///
    /// The override wins when it names an executable; otherwise the known
    /// binaries are probed in order.
    pub fn resolve_in(override_exe: Option<&str>, search_path: Option<OsString>) -> Result<Self> {
        if let Some(candidate) = override_exe.filter(|c| !c.is_empty()) {
            match find_executable(candidate, search_path.as_deref()) {
                Some(path) => {
                    let flavor = ToolFlavor::from_executable(&path);
                    debug!(executable = ?path, %flavor, "Using container tool override");
                    return Ok(Self::new(path, flavor));
                }
                None => {
                    warn!(candidate, "Container tool override not found; probing PATH");
                }
            }
        }

        for (binary, flavor) in KNOWN_BINARIES.iter().zip(ToolFlavor::all()) {
            if let Some(path) = find_executable(binary, search_path.as_deref()) {
                debug!(executable = ?path, %flavor, "Resolved container tool");
                return Ok(Self::new(path, flavor));
            }
        }

        Err(RuntimeError::Configuration(
            "Apptainer runtime requires either \"apptainer\" or \"singularity\" executable in PATH"
                .to_string(),
        ))
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn flavor(&self) -> ToolFlavor {
        self.flavor
    }
}

/// Look up `name` like a shell would: paths are checked directly, bare names
/// are searched in each `PATH` entry.
fn find_executable(name: &str, search_path: Option<&std::ffi::OsStr>) -> Option<PathBuf> {
    let as_path = Path::new(name);
    if as_path.components().count() > 1 || as_path.is_absolute() {
        return is_executable(as_path).then(|| as_path.to_path_buf());
    }

    let search_path = search_path?;
    std::env::split_paths(search_path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// One `--bind` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BindMount {
    pub host: PathBuf,
    pub container: String,
    pub mode: String,
}

impl BindMount {
    /// `host:container:mode` as accepted by `--bind`.
    pub fn to_arg(&self) -> String {
        format!("{}:{}:{}", self.host.display(), self.container, self.mode)
    }
}

/// Parse comma-separated `host:container[:mode]` tuples.
///
/// Entries with fewer than two fields are dropped. Overlay modes cannot be
/// expressed as a bind and are skipped with a warning.
pub fn parse_volumes(volumes: &str) -> Vec<BindMount> {
    let mut binds = Vec::new();
    for mount in volumes.split(',').map(str::trim).filter(|m| !m.is_empty()) {
        let parts: Vec<&str> = mount.split(':').collect();
        if parts.len() < 2 {
            debug!(mount, "Ignoring malformed volume entry");
            continue;
        }
        let mode = parts.get(2).copied().unwrap_or("rw");
        if mode.contains("overlay") {
            warn!(
                mount,
                "Overlay mount is not supported in Apptainer runtime; skipping"
            );
            continue;
        }
        binds.push(BindMount {
            host: absolutize(Path::new(parts[0])),
            container: parts[1].to_string(),
            mode: mode.to_string(),
        });
    }
    binds
}

/// Binds for a configuration: explicit volumes, else the workspace bind,
/// else none.
pub fn resolve_bind_mounts(config: &RuntimeConfig) -> Vec<BindMount> {
    if let Some(volumes) = config.volumes.as_deref().filter(|v| !v.trim().is_empty()) {
        return parse_volumes(volumes);
    }
    match (
        &config.workspace_mount_path,
        &config.workspace_mount_path_in_sandbox,
    ) {
        (Some(host), Some(container)) => vec![BindMount {
            host: absolutize(host),
            container: container.clone(),
            mode: "rw".to_string(),
        }],
        _ => Vec::new(),
    }
}

fn absolutize(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Ports handed to the sandboxed server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServicePorts {
    /// Action-execution server port (same on host and in the container)
    pub container_port: u16,
    pub vscode_port: Option<u16>,
    pub app_ports: Vec<u16>,
}

impl ServicePorts {
    /// Runtime parameters exported to the sandbox, unprefixed.
    pub fn runtime_parameters(&self) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("port".to_string(), self.container_port.to_string());
        params.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
        if let Some(vscode) = self.vscode_port {
            params.insert("VSCODE_PORT".to_string(), vscode.to_string());
        }
        if let [app_1, app_2, ..] = self.app_ports[..] {
            params.insert("APP_PORT_1".to_string(), app_1.to_string());
            params.insert("APP_PORT_2".to_string(), app_2.to_string());
        }
        params
    }
}

/// Fully resolved argv and environment for one sandbox process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvocationCommand {
    argv: Vec<String>,
    env: BTreeMap<String, String>,
}

impl InvocationCommand {
    /// Wrap an already-resolved argv and environment.
    ///
    /// Fails with [`RuntimeError::Configuration`] when `argv` has no program.
    pub fn from_parts(argv: Vec<String>, env: BTreeMap<String, String>) -> Result<Self> {
        if argv.first().map_or(true, |program| program.is_empty()) {
            return Err(RuntimeError::Configuration(
                "invocation needs a program".to_string(),
            ));
        }
        Ok(InvocationCommand { argv, env })
    }

    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    pub fn args(&self) -> &[String] {
        &self.argv[1..]
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }
}

/// Builds [`InvocationCommand`]s for one instance.
#[derive(Debug, Clone)]
pub struct CommandBuilder<'a> {
    tool: &'a ContainerTool,
    config: &'a RuntimeConfig,
}

impl<'a> CommandBuilder<'a> {
    pub fn new(tool: &'a ContainerTool, config: &'a RuntimeConfig) -> Self {
        CommandBuilder { tool, config }
    }

    /// Build against the current process environment.
    pub fn build(&self, image: &str, ports: &ServicePorts) -> InvocationCommand {
        let host_env = std::env::vars_os().map(|(k, v)| {
            (
                k.to_string_lossy().into_owned(),
                v.to_string_lossy().into_owned(),
            )
        });
        self.build_with_env(image, ports, host_env)
    }

    /// Build with an explicit host environment as the base.
    pub fn build_with_env(
        &self,
        image: &str,
        ports: &ServicePorts,
        host_env: impl IntoIterator<Item = (String, String)>,
    ) -> InvocationCommand {
        let mut argv = vec![
            self.tool.executable().to_string_lossy().into_owned(),
            "exec".to_string(),
            "--cleanenv".to_string(),
        ];

        for bind in resolve_bind_mounts(self.config) {
            argv.push("--bind".to_string());
            argv.push(bind.to_arg());
        }

        if self.config.enable_gpu {
            argv.push("--nv".to_string());
        }

        argv.push("--pwd".to_string());
        argv.push("/".to_string());
        argv.push(image.to_string());
        argv.extend(self.config.server.argv(ports.container_port));

        let mut env: BTreeMap<String, String> = host_env.into_iter().collect();
        let prefixes: Vec<&str> = match self.config.env_prefix_mode {
            EnvPrefixMode::Dual => ToolFlavor::all().iter().map(|f| f.env_prefix()).collect(),
            EnvPrefixMode::Resolved => vec![self.tool.flavor().env_prefix()],
        };
        for (key, value) in ports.runtime_parameters() {
            for prefix in &prefixes {
                env.insert(format!("{prefix}{key}"), value.clone());
            }
        }

        debug!(command = ?argv, "Apptainer exec command");
        InvocationCommand { argv, env }
    }
}
