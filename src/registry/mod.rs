//! Service-registry driver seam.
//!
//! Mirrors the shape of [`crate::runtime`]: the reconciler speaks
//! [`RegistryAgent`], production uses the reqwest-backed [`ConsulAgent`],
//! tests use a fake. Errors are surfaced as-is and handled by the caller's
//! propagation policy.

mod consul;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

pub use consul::ConsulAgent;

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors surfaced by the registry agent.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The request never completed.
    #[error("registry request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The agent answered with a non-success status.
    #[error("registry {operation} failed: {status}: {body}")]
    Status {
        /// Which driver operation failed.
        operation: &'static str,
        /// HTTP status returned.
        status: u16,
        /// Response body, trimmed.
        body: String,
    },
}

/// A service as reported by the agent's service listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceInfo {
    /// Registered service id.
    #[serde(rename = "ID", default)]
    pub id: String,
    /// Service name.
    #[serde(rename = "Service", default)]
    pub service: String,
    /// Enterprise namespace, when present.
    #[serde(rename = "Namespace", default)]
    pub namespace: String,
    /// Enterprise partition, when present.
    #[serde(rename = "Partition", default)]
    pub partition: String,
    /// Service metadata.
    #[serde(rename = "Meta", default)]
    pub meta: HashMap<String, String>,
}

/// Capability set the engine consumes from the registry agent.
#[async_trait]
pub trait RegistryAgent: Send + Sync {
    /// Register (or re-register) a service definition, replacing any
    /// existing checks for the same id.
    async fn register(&self, definition: &Map<String, Value>) -> Result<()>;

    /// Deregister a service by id. Namespace and partition are forwarded
    /// when non-empty.
    async fn deregister(&self, id: &str, namespace: &str, partition: &str) -> Result<()>;

    /// Mark a TTL check as passing.
    async fn pass_check(&self, check_id: &str, note: &str) -> Result<()>;

    /// All services known to the local agent, keyed by id.
    async fn services(&self) -> Result<HashMap<String, ServiceInfo>>;
}
