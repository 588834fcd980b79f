//! Sidecar container identification and launch requests.

use std::collections::HashMap;

use crate::config::SidecarConfig;
use crate::runtime::{ContainerSummary, CreateRequest};

/// Label marking a container as engine-owned.
pub const OWNER_LABEL: &str = "consul-registrator";
/// Value of [`OWNER_LABEL`] on sidecars.
pub const OWNER_VALUE: &str = "sidecar";
/// Label carrying the proxied service identity.
pub const SERVICE_ID_LABEL: &str = "service-id";

/// Whether a label set marks an engine-owned sidecar.
pub fn is_sidecar(labels: &HashMap<String, String>) -> bool {
    labels.get(OWNER_LABEL).map(String::as_str) == Some(OWNER_VALUE)
}

/// Deterministic container name for a service identity's sidecar.
pub fn container_name(identity: &str) -> String {
    format!("consul-sidecar-{}", identity.replace(':', "_"))
}

/// Index the engine-owned sidecars among the listed containers by the
/// service identity they proxy.
pub fn index(containers: &[ContainerSummary]) -> HashMap<String, ContainerSummary> {
    let mut out = HashMap::new();
    for container in containers {
        if !is_sidecar(&container.labels) {
            continue;
        }
        if let Some(identity) = container.labels.get(SERVICE_ID_LABEL) {
            if !identity.is_empty() {
                out.insert(identity.clone(), container.clone());
            }
        }
    }
    out
}

/// Strip a URL scheme down to `host:port`; gRPC dialing wants a bare
/// authority.
fn strip_scheme(addr: &str) -> String {
    let addr = addr.trim();
    match addr.split_once("://") {
        Some((_, rest)) => rest.split('/').next().unwrap_or_default().to_string(),
        None => addr.to_string(),
    }
}

/// Build the create request for one service identity's sidecar.
///
/// The container shares the parent's network namespace so Envoy binds next
/// to the workload. The image entrypoint is overridden: the stock image's
/// entrypoint script would ignore `-sidecar-for`. The admin interface stays
/// on loopback; the readiness endpoint binds `0.0.0.0:19100` so the
/// registry can probe it over the container network. Transparent-proxy
/// services additionally get `NET_ADMIN` and `no-new-privileges` so the
/// in-container redirect step can install its rules before Envoy starts.
pub fn launch_request(
    parent_id: &str,
    service_name: &str,
    identity: &str,
    config: &SidecarConfig,
    transparent_proxy: bool,
) -> CreateRequest {
    let grpc_addr = strip_scheme(&config.consul_grpc_addr);
    let http_addr = config.consul_http_addr.trim().to_string();

    let mut cmd = vec![
        "connect".to_string(),
        "envoy".to_string(),
        "-sidecar-for".to_string(),
        identity.to_string(),
        "-admin-bind".to_string(),
        "127.0.0.1:19000".to_string(),
        "-envoy-ready-bind-address".to_string(),
        "0.0.0.0".to_string(),
        "-envoy-ready-bind-port".to_string(),
        "19100".to_string(),
        "-grpc-addr".to_string(),
        grpc_addr.clone(),
        "-http-addr".to_string(),
        http_addr.clone(),
    ];
    if config.grpc_tls && !config.grpc_ca_file.is_empty() {
        cmd.push("-grpc-ca-file".to_string());
        cmd.push(config.grpc_ca_file.clone());
    }

    CreateRequest {
        name: container_name(identity),
        image: config.image.clone(),
        entrypoint: vec!["/bin/consul".to_string()],
        cmd,
        env: vec![
            format!("SERVICE_NAME={service_name}"),
            format!("CONSUL_HTTP_ADDR={http_addr}"),
            format!("CONSUL_GRPC_ADDR={grpc_addr}"),
        ],
        labels: HashMap::from([
            (OWNER_LABEL.to_string(), OWNER_VALUE.to_string()),
            (SERVICE_ID_LABEL.to_string(), identity.to_string()),
        ]),
        network_mode: format!("container:{parent_id}"),
        restart_policy: "unless-stopped".to_string(),
        cap_add: if transparent_proxy {
            vec!["NET_ADMIN".to_string()]
        } else {
            Vec::new()
        },
        security_opt: if transparent_proxy {
            vec!["no-new-privileges".to_string()]
        } else {
            Vec::new()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SidecarConfig {
        SidecarConfig {
            enabled: true,
            image: "consul-envoy:1.18".to_string(),
            consul_http_addr: "http://consul:8500".to_string(),
            consul_grpc_addr: "https://consul:8502".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_container_name_substitutes_identity() {
        assert_eq!(container_name("abc123:api"), "consul-sidecar-abc123_api");
    }

    #[test]
    fn test_index_skips_unlabeled_containers() {
        let containers = vec![
            ContainerSummary {
                id: "s1".to_string(),
                state: "running".to_string(),
                labels: HashMap::from([
                    (OWNER_LABEL.to_string(), OWNER_VALUE.to_string()),
                    (SERVICE_ID_LABEL.to_string(), "abc:api".to_string()),
                ]),
            },
            ContainerSummary {
                id: "plain".to_string(),
                ..Default::default()
            },
            // owner label without a service id is ignored
            ContainerSummary {
                id: "s2".to_string(),
                labels: HashMap::from([(OWNER_LABEL.to_string(), OWNER_VALUE.to_string())]),
                ..Default::default()
            },
        ];

        let indexed = index(&containers);
        assert_eq!(indexed.len(), 1);
        assert_eq!(indexed["abc:api"].id, "s1");
    }

    #[test]
    fn test_launch_request_shape() {
        let request = launch_request("parent1", "api", "abc:api", &config(), false);

        assert_eq!(request.name, "consul-sidecar-abc_api");
        assert_eq!(request.entrypoint, vec!["/bin/consul"]);
        assert_eq!(request.network_mode, "container:parent1");
        assert_eq!(request.restart_policy, "unless-stopped");
        assert!(request.cap_add.is_empty());
        assert!(request.security_opt.is_empty());

        let cmd = request.cmd.join(" ");
        assert!(cmd.starts_with("connect envoy -sidecar-for abc:api"));
        assert!(cmd.contains("-admin-bind 127.0.0.1:19000"));
        assert!(cmd.contains("-envoy-ready-bind-address 0.0.0.0"));
        assert!(cmd.contains("-envoy-ready-bind-port 19100"));
        assert!(cmd.contains("-grpc-addr consul:8502"));
        assert!(cmd.contains("-http-addr http://consul:8500"));
        assert!(!cmd.contains("-grpc-ca-file"));

        assert_eq!(request.labels[OWNER_LABEL], OWNER_VALUE);
        assert_eq!(request.labels[SERVICE_ID_LABEL], "abc:api");
        assert!(request.env.contains(&"SERVICE_NAME=api".to_string()));
    }

    #[test]
    fn test_transparent_proxy_grants_net_admin() {
        let request = launch_request("parent1", "api", "abc:api", &config(), true);
        assert_eq!(request.cap_add, vec!["NET_ADMIN"]);
        assert_eq!(request.security_opt, vec!["no-new-privileges"]);
    }

    #[test]
    fn test_ca_file_flag_requires_tls() {
        let mut cfg = config();
        cfg.grpc_ca_file = "/certs/ca.pem".to_string();
        let request = launch_request("p", "api", "a:api", &cfg, false);
        assert!(!request.cmd.join(" ").contains("-grpc-ca-file"));

        cfg.grpc_tls = true;
        let request = launch_request("p", "api", "a:api", &cfg, false);
        assert!(request
            .cmd
            .join(" ")
            .contains("-grpc-ca-file /certs/ca.pem"));
    }
}
