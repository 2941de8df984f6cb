//! Sandbox Runtime: Apptainer/Singularity-backed sandboxes
//!
//! Launches the action-execution server inside `apptainer exec`, supervises
//! the process, waits for it to answer on `/alive` and tears it down again.
//!
//! ## Layers
//!
//! - [`ports`]: cross-process port reservation
//! - [`image`] and [`command`]: what to run
//! - [`supervisor`] and [`probe`]: running it
//! - [`runtime`]: the lifecycle tying it together

pub mod command;
pub mod config;
pub mod error;
pub mod image;
pub mod ports;
pub mod probe;
pub mod runtime;
pub mod supervisor;
pub mod telemetry;

pub use command::{
    parse_volumes, BindMount, CommandBuilder, ContainerTool, InvocationCommand, ServicePorts,
    ToolFlavor,
};
pub use config::{EnvPrefixMode, PortRange, PortRanges, RuntimeConfig, ServerLaunch};
pub use error::{LivenessError, RuntimeError};
pub use image::{normalize_image_reference, select_image};
pub use ports::{PortAllocator, PortLock, PortReservation};
pub use probe::{HttpLivenessCheck, LivenessCheck, ReadinessProbe};
pub use runtime::{PostStartHook, RuntimeInstance, RuntimeStatus, RuntimeSummary, SandboxRuntime};
pub use supervisor::{ProcessSupervisor, SupervisedProcess};

/// Result alias for sandbox runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;
