//! Container-runtime driver seam.
//!
//! The reconciler only speaks [`ContainerRuntime`]; the production
//! implementation is the bollard-backed [`DockerRuntime`], and integration
//! tests substitute an in-memory fake. The engine never looks inside the
//! HTTP transport.

mod docker;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

pub use docker::DockerRuntime;

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors surfaced by the container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Could not reach the runtime socket.
    #[error("container runtime connection failed: {reason}")]
    Connection {
        /// Reason for failure.
        reason: String,
    },

    /// The runtime rejected or failed an API call.
    #[error("container runtime {operation} failed: {reason}")]
    Api {
        /// Which driver operation failed.
        operation: &'static str,
        /// Reason for failure.
        reason: String,
    },
}

/// One container from the runtime's list view.
#[derive(Debug, Clone, Default)]
pub struct ContainerSummary {
    /// Opaque container identity.
    pub id: String,
    /// Coarse lifecycle state (`running`, `exited`, ...).
    pub state: String,
    /// Label key/value pairs.
    pub labels: HashMap<String, String>,
}

/// The richer inspect form of a container.
#[derive(Debug, Clone, Default)]
pub struct ContainerDetails {
    /// Opaque container identity.
    pub id: String,
    /// Display name; the runtime reports it with a leading `/`.
    pub name: String,
    /// Label key/value pairs.
    pub labels: HashMap<String, String>,
    /// IP addresses across the container's networks, ordered by network
    /// name for determinism.
    pub network_ips: Vec<String>,
    /// The container's own healthcheck spec, when it declares one.
    pub healthcheck: Option<HealthcheckSpec>,
}

/// Healthcheck settings a container image declares for itself.
#[derive(Debug, Clone, Default)]
pub struct HealthcheckSpec {
    /// Probe interval in nanoseconds.
    pub interval_ns: i64,
    /// Probe timeout in nanoseconds.
    pub timeout_ns: i64,
    /// Consecutive failures before unhealthy.
    pub retries: i64,
}

/// Everything needed to create a container.
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    /// Deterministic container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Entrypoint override.
    pub entrypoint: Vec<String>,
    /// Command line.
    pub cmd: Vec<String>,
    /// `NAME=value` environment entries.
    pub env: Vec<String>,
    /// Labels to stamp on the container.
    pub labels: HashMap<String, String>,
    /// Network mode, e.g. `container:<id>`.
    pub network_mode: String,
    /// Restart policy name, e.g. `unless-stopped`.
    pub restart_policy: String,
    /// Linux capabilities to grant.
    pub cap_add: Vec<String>,
    /// Security options, e.g. `no-new-privileges`.
    pub security_opt: Vec<String>,
}

/// Outcome of a create call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// A new container was created.
    Created(String),
    /// A container with that name already exists; callers treat this as
    /// idempotent success and ensure it is running.
    AlreadyExists,
}

/// Capability set the engine consumes from the container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List all containers, running or not.
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>>;

    /// Inspect one container.
    async fn inspect(&self, id: &str) -> Result<ContainerDetails>;

    /// Whether a container exists at all.
    async fn exists(&self, id: &str) -> Result<bool>;

    /// Start a container by id or name. Already-started is success.
    async fn start(&self, id_or_name: &str) -> Result<()>;

    /// Create a container. A name collision reports
    /// [`CreateOutcome::AlreadyExists`] instead of an error.
    async fn create(&self, request: &CreateRequest) -> Result<CreateOutcome>;

    /// Force-remove a container.
    async fn remove(&self, id: &str) -> Result<()>;
}
