//! Payload normalization: raw parsed label → registry-ready definition.
//!
//! The registry accepts many optional fields and the engine forwards
//! anything it does not recognize, so the payload stays a loosely-typed
//! [`serde_json::Value`] tree end to end. Normalization is a fixed pipeline
//! of idempotent passes:
//!
//! 1. bind the service name to the label suffix and assign the identity
//! 2. resolve a fallback `address`
//! 3. stamp engine ownership metadata
//! 4. normalize the `connect.sidecar_service` block (auto checks,
//!    transparent proxy, prometheus)
//! 5. append the service-level TCP check
//!
//! Running the pipeline over its own output produces the same payload;
//! the change detector depends on that.

mod checks;
mod proxy;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::{SidecarConfig, MANAGED_BY};

pub use proxy::needs_transparent_proxy;

/// Ports the mesh proxy claims for itself; never valid as a check target.
pub const RESERVED_SIDECAR_PORTS: &[u16] = &[15000, 15001, 15002, 15090, 19000, 19100];

/// Errors that reject a single service definition.
#[derive(Debug, Error)]
pub enum NormalizeError {
    /// `name` is absent or not a non-empty string.
    #[error("service definition has no usable 'name'")]
    MissingName,

    /// `name` does not match the label suffix that produced the definition.
    #[error("service name '{name}' does not match label suffix '{suffix}'")]
    NameMismatch {
        /// The `name` field from the definition.
        name: String,
        /// The `<name>` portion of the `consul.service.<name>` label key.
        suffix: String,
    },
}

/// Container facts and engine settings the normalizer needs.
#[derive(Debug, Clone)]
pub struct NormalizeContext<'a> {
    /// Full container identity from the runtime.
    pub container_id: &'a str,
    /// Container display name, possibly with a leading `/`.
    pub container_name: &'a str,
    /// IP addresses across the container's networks, in table order.
    pub network_ips: &'a [String],
    /// The `<name>` portion of the label key.
    pub label_suffix: &'a str,
    /// Whether a `consul.sidecar.<name>` label is present.
    pub sidecar_requested: bool,
    /// Engine sidecar settings (prometheus bind address lives here).
    pub sidecar: &'a SidecarConfig,
    /// Identity stamped into `agent-id` metadata.
    pub agent_id: &'a str,
}

/// A definition that passed normalization.
#[derive(Debug, Clone)]
pub struct NormalizedService {
    /// `<container-id>:<service-name>` — the durable key everywhere.
    pub identity: String,
    /// The validated service name.
    pub name: String,
    /// Whether the definition opts into transparent proxying.
    pub transparent_proxy: bool,
    /// The payload to send to the registry.
    pub payload: Map<String, Value>,
}

/// Run the full normalization pipeline over one parsed definition.
pub fn normalize(
    mut payload: Map<String, Value>,
    ctx: &NormalizeContext<'_>,
) -> Result<NormalizedService, NormalizeError> {
    let name = match payload.get("name") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        _ => return Err(NormalizeError::MissingName),
    };
    if name != ctx.label_suffix {
        return Err(NormalizeError::NameMismatch {
            name,
            suffix: ctx.label_suffix.to_string(),
        });
    }

    let identity = format!("{}:{}", ctx.container_id, name);
    payload.insert("id".to_string(), Value::String(identity.clone()));

    if !payload.contains_key("address") && !payload.contains_key("Address") {
        if let Some(addr) = resolve_address(ctx, &name) {
            payload.insert("address".to_string(), Value::String(addr));
        }
    }

    stamp_ownership(&mut payload, ctx.agent_id);

    checks::normalize_sidecar_block(&mut payload, &name, &identity, ctx);
    checks::apply_service_tcp_check(&mut payload, &name);

    let transparent_proxy = needs_transparent_proxy(&payload);

    Ok(NormalizedService {
        identity,
        name,
        transparent_proxy,
        payload,
    })
}

/// Fallback address: display name without the leading slash, else the
/// service name, else the first non-empty network IP.
fn resolve_address(ctx: &NormalizeContext<'_>, name: &str) -> Option<String> {
    let display = ctx.container_name.trim().trim_start_matches('/');
    if !display.is_empty() {
        return Some(display.to_string());
    }
    if !name.is_empty() {
        return Some(name.to_string());
    }
    ctx.network_ips.iter().find(|ip| !ip.is_empty()).cloned()
}

/// Tag the registration as engine-owned without clobbering caller metadata.
fn stamp_ownership(payload: &mut Map<String, Value>, agent_id: &str) {
    let meta_key = if payload.contains_key("Meta") { "Meta" } else { "meta" };
    let meta = payload
        .entry(meta_key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(meta) = meta {
        meta.entry("managed-by".to_string())
            .or_insert_with(|| Value::String(MANAGED_BY.to_string()));
        meta.entry("agent-id".to_string())
            .or_insert_with(|| Value::String(agent_id.to_string()));
    }
}

/// Coerce the custom `auto` directive: native booleans plus a small set of
/// truthy strings; everything else is false.
pub(crate) fn bool_from_value(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "on"
        ),
        _ => false,
    }
}

/// Coerce a port-ish value to an integer; anything unusable becomes 0.
pub(crate) fn int_from_value(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                i
            } else {
                n.as_f64().map(|f| f as i64).unwrap_or(0)
            }
        }
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

pub(crate) fn is_valid_port(port: i64) -> bool {
    (1..=65535).contains(&port)
}

pub(crate) fn is_reserved_sidecar_port(port: i64) -> bool {
    u16::try_from(port).is_ok_and(|p| RESERVED_SIDECAR_PORTS.contains(&p))
}

pub(crate) fn is_loopback_host(host: &str) -> bool {
    matches!(
        host.trim().to_lowercase().as_str(),
        "127.0.0.1" | "localhost" | "::1"
    )
}

/// Split `host:port`, tolerating bracketed IPv6 hosts and an empty host
/// (which binds everywhere and reports as `0.0.0.0`).
pub(crate) fn parse_host_port(addr: &str) -> Result<(String, i64), String> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Err("empty bind addr".to_string());
    }
    let (host, port_str) = addr
        .rsplit_once(':')
        .ok_or_else(|| format!("'{addr}' is not host:port"))?;
    let port: i64 = port_str
        .parse()
        .map_err(|_| format!("invalid port '{port_str}'"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let host = if host.is_empty() { "0.0.0.0" } else { host };
    Ok((host.to_string(), port))
}
