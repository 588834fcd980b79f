//! Runtime configuration resolved from environment variables.
//!
//! `.env` loading happens early in `main` via dotenvy, so every section here
//! only reads the process environment. Sections resolve independently;
//! [`Config::from_env`] aggregates them and is the single place a missing
//! required setting can abort startup.

mod helpers;
mod sidecar;

use std::time::Duration;

use crate::config::helpers::{env_flag, optional_env, parse_optional_env};
use crate::error::ConfigError;

pub use sidecar::SidecarConfig;

/// Service metadata value marking a registration as engine-owned.
/// The clean pass only touches services carrying this tag.
pub const MANAGED_BY: &str = "dockconsul";

/// Top-level daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Consul agent HTTP base URL.
    pub consul_addr: String,
    /// Bearer token added to Consul requests when non-empty.
    pub consul_token: String,
    /// Docker unix socket path.
    pub docker_socket: String,
    /// State crib file path.
    pub state_path: String,
    /// Metrics HTTP bind address.
    pub metrics_addr: String,
    /// Period of the registry clean pass. `None` disables it.
    pub clean_interval: Option<Duration>,
    /// Short-circuit all registry mutations.
    pub dry_run: bool,
    /// Identity stamped into `managed-by` / `agent-id` service metadata.
    pub agent_id: String,
    /// Sidecar launch settings.
    pub sidecar: SidecarConfig,
}

impl Config {
    /// Resolve the full configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let consul_addr = optional_env("CONSUL_HTTP_ADDR")?
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "CONSUL_HTTP_ADDR".to_string(),
                hint: "set it to the Consul agent HTTP base URL, e.g. http://localhost:8500"
                    .to_string(),
            })?;

        // DOCKER_SOCK wins over the legacy DOCKER_SOCKET spelling.
        let docker_socket = optional_env("DOCKER_SOCK")?
            .or(optional_env("DOCKER_SOCKET")?)
            .unwrap_or_else(|| "/var/run/docker.sock".to_string());

        let clean_interval = match parse_optional_env::<u64>("CLEAN_INTERVAL", 0)? {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Ok(Self {
            consul_addr: consul_addr.trim_end_matches('/').to_string(),
            consul_token: optional_env("CONSUL_HTTP_TOKEN")?.unwrap_or_default(),
            docker_socket,
            state_path: optional_env("STATE_PATH")?
                .unwrap_or_else(|| "/tmp/registrator-state.json".to_string()),
            metrics_addr: normalize_bind_addr(
                &optional_env("METRICS_ADDR")?.unwrap_or_else(|| ":9090".to_string()),
            ),
            clean_interval,
            dry_run: env_flag("DRY_RUN")?,
            agent_id: optional_env("AGENT_ID")?
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| MANAGED_BY.to_string()),
            sidecar: SidecarConfig::resolve()?,
        })
    }
}

/// Accept a bare `:9090` shorthand for a bind address.
fn normalize_bind_addr(addr: &str) -> String {
    let addr = addr.trim();
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr.to_string()
    }
}
