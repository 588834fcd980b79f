//! Check normalization and synthesis.
//!
//! Checks arrive in the registry's snake-case label spelling and leave in
//! its title-case wire spelling. The engine synthesizes readiness, metrics,
//! and alias checks for `auto` sidecars and a plain TCP check for every
//! service, skipping anything the caller already declared.

use serde_json::{json, Map, Value};

use crate::payload::{
    bool_from_value, int_from_value, is_loopback_host, is_reserved_sidecar_port, is_valid_port,
    needs_transparent_proxy, parse_host_port, proxy, NormalizeContext,
};

/// snake-case → registry title-case key spellings.
const KEY_RENAMES: &[(&str, &str)] = &[
    ("name", "Name"),
    ("http", "HTTP"),
    ("tcp", "TCP"),
    ("udp", "UDP"),
    ("interval", "Interval"),
    ("timeout", "Timeout"),
    ("alias_service", "AliasService"),
    ("alias_node", "AliasNode"),
];

/// Placeholders a caller may use where the engine-assigned identity belongs.
const IDENTITY_PLACEHOLDERS: &[&str] = &["$SERVICE_ID", "${SERVICE_ID}"];

/// Retitle known snake-case keys in place. An already-present title-case key
/// wins; the snake-case twin is dropped either way.
pub(crate) fn normalize_check_keys(check: &mut Map<String, Value>) {
    for (old, new) in KEY_RENAMES {
        if let Some(value) = check.remove(*old) {
            if !check.contains_key(*new) {
                check.insert((*new).to_string(), value);
            }
        }
    }
}

/// Rewrite alias targets that point at the bare service name, a placeholder,
/// or nothing at all, to the engine-assigned identity.
pub(crate) fn rewrite_alias_service(check: &mut Map<String, Value>, name: &str, identity: &str) {
    for key in ["AliasService", "alias_service"] {
        if let Some(Value::String(alias)) = check.get(key) {
            if alias.is_empty() || alias == name || IDENTITY_PLACEHOLDERS.contains(&alias.as_str())
            {
                check.insert(key.to_string(), Value::String(identity.to_string()));
            }
        }
    }
}

/// The host registry probes reach the service at.
fn check_host(payload: &Map<String, Value>, name: &str) -> String {
    for key in ["Address", "address"] {
        if let Some(Value::String(addr)) = payload.get(key) {
            if !addr.is_empty() {
                return addr.clone();
            }
        }
    }
    name.to_string()
}

/// Validate the configured prometheus bind address for use as a check or
/// proxy-config target. Returns the port or a reason to skip.
fn validate_metrics_bind(bind_addr: &str) -> Result<i64, String> {
    let (host, port) = parse_host_port(bind_addr)?;
    if !is_valid_port(port) {
        return Err(format!("invalid port {port}"));
    }
    if is_loopback_host(&host) {
        return Err("loopback bind address is not reachable by the registry".to_string());
    }
    if is_reserved_sidecar_port(port) {
        return Err(format!("port {port} collides with a reserved sidecar port"));
    }
    Ok(port)
}

/// Normalize the `connect.sidecar_service` block: consume the `auto`
/// directive, retitle and rewrite declared checks, synthesize the Ready /
/// Metrics / Alias checks, ensure transparent-proxy defaults, and inject the
/// envoy prometheus bind address. No-op when the block is absent.
pub(crate) fn normalize_sidecar_block(
    payload: &mut Map<String, Value>,
    name: &str,
    identity: &str,
    ctx: &NormalizeContext<'_>,
) {
    let host = check_host(payload, name);

    let Some(Value::Object(connect)) = payload.get_mut("connect") else {
        return;
    };
    let Some(Value::Object(sidecar)) = connect.get_mut("sidecar_service") else {
        return;
    };

    // `auto` is an engine directive, accepted under either spelling and
    // never forwarded to the registry.
    let mut auto = false;
    if let Some(v) = sidecar.remove("auto") {
        auto = bool_from_value(&v);
    }
    if let Some(v) = sidecar.remove("Auto") {
        auto = bool_from_value(&v);
    }

    let mut checks: Vec<Value> = match sidecar.get("checks") {
        Some(Value::Array(items)) => items.clone(),
        _ => match sidecar.get("check") {
            Some(Value::Object(single)) => vec![Value::Object(single.clone())],
            _ => Vec::new(),
        },
    };

    let mut has_ready = false;
    let mut has_alias = false;
    let mut tcp_targets: Vec<String> = Vec::new();
    let mut check_names: Vec<String> = Vec::new();

    for item in checks.iter_mut() {
        let Value::Object(check) = item else { continue };
        normalize_check_keys(check);
        rewrite_alias_service(check, name, identity);

        if let Some(Value::String(url)) = check.get("HTTP") {
            if url.contains("/ready") {
                has_ready = true;
            }
        }
        if let Some(Value::String(target)) = check.get("TCP") {
            tcp_targets.push(target.clone());
        }
        if let Some(Value::String(check_name)) = check.get("Name") {
            check_names.push(check_name.trim().to_lowercase());
        }
        if let Some(Value::String(alias)) = check.get("AliasService") {
            if !alias.is_empty() {
                has_alias = true;
            }
        }
    }

    if auto {
        if !has_ready {
            checks.push(json!({
                "Name": "Envoy Ready",
                "HTTP": format!("http://{host}:19100/ready"),
                "Interval": "10s",
                "Timeout": "2s",
            }));
        }

        if ctx.sidecar_requested && !ctx.sidecar.prometheus_bind_addr.is_empty() {
            match validate_metrics_bind(&ctx.sidecar.prometheus_bind_addr) {
                Ok(port) => {
                    let target = format!("{host}:{port}");
                    let exists = tcp_targets.contains(&target)
                        || check_names.iter().any(|n| n == "envoy metrics");
                    if !exists {
                        checks.push(json!({
                            "Name": "Envoy Metrics",
                            "TCP": target,
                            "Interval": "30s",
                            "Timeout": "2s",
                        }));
                    }
                }
                Err(reason) => tracing::warn!(
                    service = %name,
                    bind_addr = %ctx.sidecar.prometheus_bind_addr,
                    "skipping Envoy Metrics check: {reason}"
                ),
            }
        }

        if !has_alias {
            checks.push(json!({
                "Name": format!("Connect Sidecar Aliasing {name}"),
                "AliasService": identity,
            }));
        }

        proxy::ensure_transparent_proxy(sidecar);
    }

    if !checks.is_empty() {
        sidecar.remove("check");
        sidecar.insert("checks".to_string(), Value::Array(checks));
    }

    // Second, independent validation checkpoint: the proxy-config injection
    // can be skipped on its own even when the metrics check went through.
    if ctx.sidecar_requested && !ctx.sidecar.prometheus_bind_addr.is_empty() {
        match validate_metrics_bind(&ctx.sidecar.prometheus_bind_addr) {
            Ok(_) => proxy::ensure_envoy_prometheus(sidecar, &ctx.sidecar.prometheus_bind_addr),
            Err(reason) => tracing::warn!(
                service = %name,
                bind_addr = %ctx.sidecar.prometheus_bind_addr,
                "skipping envoy_prometheus_bind_addr injection: {reason}"
            ),
        }
    }
}

fn new_tcp_check(host: &str, port: i64, name: &str) -> Value {
    json!({
        "Name": name,
        "TCP": format!("{host}:{port}"),
        "Interval": "10s",
        "Timeout": "2s",
        "Status": "passing",
        "FailuresBeforeCritical": 6,
        "SuccessBeforePassing": 1,
    })
}

fn matches_existing(check: &Map<String, Value>, target_suffix: &str, wanted_name: &str) -> bool {
    if let Some(Value::String(target)) = check.get("TCP") {
        if target.ends_with(target_suffix) {
            return true;
        }
    }
    if let Some(Value::String(name)) = check.get("Name") {
        if name.trim().eq_ignore_ascii_case(wanted_name) {
            return true;
        }
    }
    false
}

/// Append the service-level TCP check: the transparent-proxy listener when
/// the sidecar redirects traffic, the declared service port otherwise.
/// Skips entirely on an unusable or reserved port, and when an equivalent
/// check is already declared. A singleton `check` collapses into `checks`
/// only when something is appended.
pub(crate) fn apply_service_tcp_check(payload: &mut Map<String, Value>, name: &str) {
    let host = check_host(payload, name);

    let (check_port, check_name) = if needs_transparent_proxy(payload) {
        (15000, format!("Envoy TP Listener {name}"))
    } else {
        let mut port = int_from_value(payload.get("port"));
        if port == 0 {
            port = int_from_value(payload.get("Port"));
        }
        if !is_valid_port(port) || is_reserved_sidecar_port(port) {
            return;
        }
        (port, format!("Service TCP {name}"))
    };

    let target_suffix = format!(":{check_port}");

    if let Some(Value::Array(items)) = payload.get_mut("checks") {
        for item in items.iter_mut() {
            if let Value::Object(check) = item {
                normalize_check_keys(check);
                if matches_existing(check, &target_suffix, &check_name) {
                    return;
                }
            }
        }
        items.push(new_tcp_check(&host, check_port, &check_name));
        payload.remove("check");
        return;
    }

    if let Some(Value::Object(check)) = payload.get_mut("check") {
        normalize_check_keys(check);
        if matches_existing(check, &target_suffix, &check_name) {
            return;
        }
        let single = payload.remove("check").expect("checked above");
        payload.insert(
            "checks".to_string(),
            Value::Array(vec![single, new_tcp_check(&host, check_port, &check_name)]),
        );
        return;
    }

    payload.insert(
        "checks".to_string(),
        Value::Array(vec![new_tcp_check(&host, check_port, &check_name)]),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SidecarConfig;

    fn test_ctx<'a>(sidecar: &'a SidecarConfig, requested: bool) -> NormalizeContext<'a> {
        NormalizeContext {
            container_id: "abc123",
            container_name: "/api-1",
            network_ips: &[],
            label_suffix: "api",
            sidecar_requested: requested,
            sidecar,
            agent_id: "agent-1",
        }
    }

    fn sidecar_block(payload: &Map<String, Value>) -> &Map<String, Value> {
        payload["connect"]["sidecar_service"]
            .as_object()
            .expect("sidecar block")
    }

    #[test]
    fn test_key_retitling_prefers_existing_title_case() {
        let mut check = json!({"name": "a", "Name": "b", "http": "url"})
            .as_object()
            .unwrap()
            .clone();
        normalize_check_keys(&mut check);
        assert_eq!(check.get("Name"), Some(&json!("b")));
        assert_eq!(check.get("HTTP"), Some(&json!("url")));
        assert!(!check.contains_key("name"));
        assert!(!check.contains_key("http"));
    }

    #[test]
    fn test_alias_placeholder_rewrite() {
        for alias in ["", "api", "$SERVICE_ID", "${SERVICE_ID}"] {
            let mut check = json!({"AliasService": alias}).as_object().unwrap().clone();
            rewrite_alias_service(&mut check, "api", "abc123:api");
            assert_eq!(check.get("AliasService"), Some(&json!("abc123:api")));
        }

        let mut check = json!({"AliasService": "other-svc"})
            .as_object()
            .unwrap()
            .clone();
        rewrite_alias_service(&mut check, "api", "abc123:api");
        assert_eq!(check.get("AliasService"), Some(&json!("other-svc")));
    }

    #[test]
    fn test_auto_synthesizes_ready_and_alias() {
        let sidecar_cfg = SidecarConfig::default();
        let ctx = test_ctx(&sidecar_cfg, false);
        let mut payload = json!({
            "address": "api-1",
            "connect": {"sidecar_service": {"auto": true}},
        })
        .as_object()
        .unwrap()
        .clone();

        normalize_sidecar_block(&mut payload, "api", "abc123:api", &ctx);

        let block = sidecar_block(&payload);
        assert!(!block.contains_key("auto"));
        let checks = block["checks"].as_array().unwrap();
        assert_eq!(checks.len(), 2);
        assert_eq!(checks[0]["Name"], json!("Envoy Ready"));
        assert_eq!(checks[0]["HTTP"], json!("http://api-1:19100/ready"));
        assert_eq!(checks[1]["AliasService"], json!("abc123:api"));
        // auto also forces the transparent-proxy defaults
        assert_eq!(
            block["proxy"]["config"]["bind_address"],
            json!("0.0.0.0")
        );
        assert!(block["proxy"]["transparent_proxy"].is_object());
    }

    #[test]
    fn test_existing_ready_and_alias_suppress_synthesis() {
        let sidecar_cfg = SidecarConfig::default();
        let ctx = test_ctx(&sidecar_cfg, false);
        let mut payload = json!({
            "connect": {"sidecar_service": {
                "auto": "yes",
                "checks": [
                    {"name": "custom ready", "http": "http://api:9000/ready"},
                    {"alias_service": "other"},
                ],
            }},
        })
        .as_object()
        .unwrap()
        .clone();

        normalize_sidecar_block(&mut payload, "api", "abc123:api", &ctx);

        let checks = sidecar_block(&payload)["checks"].as_array().unwrap();
        assert_eq!(checks.len(), 2, "nothing synthesized: {checks:?}");
        assert_eq!(checks[0]["Name"], json!("custom ready"));
        assert_eq!(checks[1]["AliasService"], json!("other"));
    }

    #[test]
    fn test_metrics_check_requires_request_and_valid_bind() {
        let sidecar_cfg = SidecarConfig {
            prometheus_bind_addr: "0.0.0.0:9102".to_string(),
            ..Default::default()
        };

        let mut payload = json!({
            "connect": {"sidecar_service": {"auto": true}},
        })
        .as_object()
        .unwrap()
        .clone();
        let ctx = test_ctx(&sidecar_cfg, true);
        normalize_sidecar_block(&mut payload, "api", "abc123:api", &ctx);

        let checks = sidecar_block(&payload)["checks"].as_array().unwrap();
        let metrics: Vec<_> = checks
            .iter()
            .filter(|c| c["Name"] == json!("Envoy Metrics"))
            .collect();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0]["TCP"], json!("api:9102"));
        assert_eq!(
            sidecar_block(&payload)["proxy"]["config"]["envoy_prometheus_bind_addr"],
            json!("0.0.0.0:9102")
        );
    }

    #[test]
    fn test_loopback_and_reserved_bind_skip_injection() {
        for bad in ["127.0.0.1:9102", "localhost:9102", "0.0.0.0:19000", "0.0.0.0:70000"] {
            let sidecar_cfg = SidecarConfig {
                prometheus_bind_addr: bad.to_string(),
                ..Default::default()
            };
            let mut payload = json!({
                "connect": {"sidecar_service": {"auto": true}},
            })
            .as_object()
            .unwrap()
            .clone();
            let ctx = test_ctx(&sidecar_cfg, true);
            normalize_sidecar_block(&mut payload, "api", "abc123:api", &ctx);

            let block = sidecar_block(&payload);
            let checks = block["checks"].as_array().unwrap();
            assert!(
                checks.iter().all(|c| c["Name"] != json!("Envoy Metrics")),
                "bind {bad} must not produce a metrics check"
            );
            assert!(
                block["proxy"]["config"].get("envoy_prometheus_bind_addr").is_none(),
                "bind {bad} must not be injected"
            );
        }
    }

    #[test]
    fn test_singleton_check_collapses_into_checks() {
        let sidecar_cfg = SidecarConfig::default();
        let ctx = test_ctx(&sidecar_cfg, false);
        let mut payload = json!({
            "connect": {"sidecar_service": {
                "auto": true,
                "check": {"name": "mine", "tcp": "api:9000"},
            }},
        })
        .as_object()
        .unwrap()
        .clone();

        normalize_sidecar_block(&mut payload, "api", "abc123:api", &ctx);

        let block = sidecar_block(&payload);
        assert!(!block.contains_key("check"));
        let checks = block["checks"].as_array().unwrap();
        assert_eq!(checks[0]["Name"], json!("mine"));
        assert_eq!(checks[0]["TCP"], json!("api:9000"));
    }

    #[test]
    fn test_service_tcp_check_from_port() {
        let mut payload = json!({"address": "api-1", "port": 8080})
            .as_object()
            .unwrap()
            .clone();
        apply_service_tcp_check(&mut payload, "api");

        let checks = payload["checks"].as_array().unwrap();
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0]["Name"], json!("Service TCP api"));
        assert_eq!(checks[0]["TCP"], json!("api-1:8080"));
        assert_eq!(checks[0]["Status"], json!("passing"));
        assert_eq!(checks[0]["FailuresBeforeCritical"], json!(6));
        assert_eq!(checks[0]["SuccessBeforePassing"], json!(1));
    }

    #[test]
    fn test_service_tcp_check_port_coercions() {
        for port in [json!("8080"), json!(8080.2)] {
            let mut payload = Map::new();
            payload.insert("port".to_string(), port);
            apply_service_tcp_check(&mut payload, "api");
            assert_eq!(
                payload["checks"][0]["TCP"],
                json!("api:8080"),
                "port variant must coerce"
            );
        }
    }

    #[test]
    fn test_service_tcp_check_skips_bad_and_reserved_ports() {
        for port in [json!(0), json!(65536), json!(19100), json!("nope")] {
            let mut payload = Map::new();
            payload.insert("port".to_string(), port.clone());
            apply_service_tcp_check(&mut payload, "api");
            assert!(
                !payload.contains_key("checks"),
                "port {port} must not produce a check"
            );
        }
    }

    #[test]
    fn test_service_tcp_check_respects_existing_target() {
        let mut payload = json!({
            "port": 8080,
            "checks": [{"tcp": "elsewhere:8080"}],
        })
        .as_object()
        .unwrap()
        .clone();
        apply_service_tcp_check(&mut payload, "api");

        let checks = payload["checks"].as_array().unwrap();
        assert_eq!(checks.len(), 1);
        // the scan still retitled the existing check
        assert_eq!(checks[0]["TCP"], json!("elsewhere:8080"));
    }

    #[test]
    fn test_service_tcp_check_uses_tp_listener_when_redirected() {
        let mut payload = json!({
            "port": 8080,
            "connect": {"sidecar_service": {"proxy": {"transparent_proxy": {}}}},
        })
        .as_object()
        .unwrap()
        .clone();
        apply_service_tcp_check(&mut payload, "api");

        let checks = payload["checks"].as_array().unwrap();
        assert_eq!(checks[0]["Name"], json!("Envoy TP Listener api"));
        assert_eq!(checks[0]["TCP"], json!("api:15000"));
    }
}
