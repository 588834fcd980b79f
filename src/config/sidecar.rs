//! Sidecar launch configuration.

use crate::config::helpers::{env_flag, optional_env};
use crate::error::ConfigError;

/// Strings that disable prometheus bind-address injection entirely.
const PROMETHEUS_DISABLE_TOKENS: &[&str] = &["", "0", "off", "false", "disabled"];

/// Configuration for Envoy sidecar launching.
///
/// `enabled` only opts the engine in; a launch additionally requires
/// `image`, `consul_http_addr`, and `consul_grpc_addr` to be set. A service
/// that requests a sidecar while those are missing stays registered and the
/// engine logs the reason instead of creating a container.
#[derive(Debug, Clone, Default)]
pub struct SidecarConfig {
    /// Whether sidecar launching is enabled at all.
    pub enabled: bool,
    /// Image the sidecar container runs.
    pub image: String,
    /// Consul HTTP endpoint the sidecar proxies against.
    pub consul_http_addr: String,
    /// Consul gRPC (xDS) endpoint the sidecar proxies against.
    pub consul_grpc_addr: String,
    /// Whether the gRPC connection uses TLS.
    pub grpc_tls: bool,
    /// CA bundle path handed to the sidecar when TLS is on.
    pub grpc_ca_file: String,
    /// Envoy prometheus bind address injected into `proxy.config`.
    /// Empty means injection is disabled.
    pub prometheus_bind_addr: String,
}

impl SidecarConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let prometheus_bind_addr = optional_env("SIDECAR_PROMETHEUS_BIND_ADDR")?
            .map(|raw| {
                let trimmed = raw.trim().to_string();
                if PROMETHEUS_DISABLE_TOKENS.contains(&trimmed.to_lowercase().as_str()) {
                    String::new()
                } else {
                    trimmed
                }
            })
            .unwrap_or_default();

        Ok(Self {
            enabled: env_flag("SIDECAR_ENABLED")?,
            image: optional_env("SIDECAR_IMAGE")?.unwrap_or_default(),
            consul_http_addr: optional_env("SIDECAR_CONSUL_HTTP")?.unwrap_or_default(),
            consul_grpc_addr: optional_env("SIDECAR_CONSUL_GRPC")?.unwrap_or_default(),
            grpc_tls: env_flag("SIDECAR_GRPC_TLS")?,
            grpc_ca_file: optional_env("SIDECAR_GRPC_CA_FILE")?.unwrap_or_default(),
            prometheus_bind_addr,
        })
    }

    /// Whether the engine has everything it needs to actually launch.
    pub fn launchable(&self) -> bool {
        self.enabled
            && !self.image.is_empty()
            && !self.consul_http_addr.is_empty()
            && !self.consul_grpc_addr.is_empty()
    }
}
