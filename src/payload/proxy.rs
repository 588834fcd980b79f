//! Transparent-proxy and prometheus defaults inside the sidecar block.

use serde_json::{Map, Value};

/// Whether the definition opts into transparent proxying, under either the
/// canonical or the legacy key spelling.
pub fn needs_transparent_proxy(payload: &Map<String, Value>) -> bool {
    let Some(Value::Object(connect)) = payload.get("connect") else {
        return false;
    };
    let Some(Value::Object(sidecar)) = connect.get("sidecar_service") else {
        return false;
    };
    let Some(Value::Object(proxy)) = sidecar.get("proxy") else {
        return false;
    };
    proxy.contains_key("transparent_proxy") || proxy.contains_key("TransparentProxy")
}

/// Get-or-create a nested object key. A present non-object value is
/// replaced.
fn ensure_object<'a>(parent: &'a mut Map<String, Value>, key: &str) -> &'a mut Map<String, Value> {
    if !matches!(parent.get(key), Some(Value::Object(_))) {
        parent.insert(key.to_string(), Value::Object(Map::new()));
    }
    match parent.get_mut(key) {
        Some(Value::Object(obj)) => obj,
        _ => unreachable!("just inserted"),
    }
}

/// Ensure transparent-proxy defaults on the sidecar block:
/// migrate the legacy `TransparentProxy` key, materialize the mapping,
/// strip caller-pinned listener ports, and default `proxy.config.bind_address`.
pub(crate) fn ensure_transparent_proxy(sidecar: &mut Map<String, Value>) {
    let proxy = ensure_object(sidecar, "proxy");

    if let Some(legacy) = proxy.remove("TransparentProxy") {
        if !proxy.contains_key("transparent_proxy") {
            proxy.insert("transparent_proxy".to_string(), legacy);
        }
    }

    if !proxy.contains_key("transparent_proxy") {
        proxy.insert("transparent_proxy".to_string(), Value::Object(Map::new()));
    }

    // Listener ports belong to the engine; users may not pin them.
    if let Some(Value::Object(tp)) = proxy.get_mut("transparent_proxy") {
        for key in [
            "inbound_listener_port",
            "outbound_listener_port",
            "InboundListenerPort",
            "OutboundListenerPort",
        ] {
            tp.remove(key);
        }
    }

    let config = ensure_object(proxy, "config");
    let blank = match config.get("bind_address") {
        None => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    };
    if blank {
        config.insert("bind_address".to_string(), Value::String("0.0.0.0".to_string()));
    }
}

/// Inject `proxy.config.envoy_prometheus_bind_addr` unless already set.
pub(crate) fn ensure_envoy_prometheus(sidecar: &mut Map<String, Value>, bind_addr: &str) {
    let proxy = ensure_object(sidecar, "proxy");
    let config = ensure_object(proxy, "config");
    config
        .entry("envoy_prometheus_bind_addr".to_string())
        .or_insert_with(|| Value::String(bind_addr.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_materializes_empty_mapping_and_bind_address() {
        let mut sidecar = Map::new();
        ensure_transparent_proxy(&mut sidecar);
        assert_eq!(
            Value::Object(sidecar),
            json!({"proxy": {"transparent_proxy": {}, "config": {"bind_address": "0.0.0.0"}}})
        );
    }

    #[test]
    fn test_legacy_key_migrates_without_clobbering() {
        let mut sidecar = obj(json!({"proxy": {"TransparentProxy": {"dialed_directly": true}}}));
        ensure_transparent_proxy(&mut sidecar);
        let proxy = sidecar["proxy"].as_object().unwrap();
        assert!(!proxy.contains_key("TransparentProxy"));
        assert_eq!(
            proxy["transparent_proxy"],
            json!({"dialed_directly": true})
        );

        // canonical key already present: legacy is dropped, canonical kept
        let mut sidecar = obj(json!({"proxy": {
            "transparent_proxy": {"a": 1},
            "TransparentProxy": {"b": 2},
        }}));
        ensure_transparent_proxy(&mut sidecar);
        let proxy = sidecar["proxy"].as_object().unwrap();
        assert_eq!(proxy["transparent_proxy"], json!({"a": 1}));
        assert!(!proxy.contains_key("TransparentProxy"));
    }

    #[test]
    fn test_listener_ports_are_stripped() {
        let mut sidecar = obj(json!({"proxy": {"transparent_proxy": {
            "inbound_listener_port": 15001,
            "OutboundListenerPort": 15002,
            "dialed_directly": true,
        }}}));
        ensure_transparent_proxy(&mut sidecar);
        assert_eq!(
            sidecar["proxy"]["transparent_proxy"],
            json!({"dialed_directly": true})
        );
    }

    #[test]
    fn test_existing_bind_address_is_kept() {
        let mut sidecar = obj(json!({"proxy": {"config": {"bind_address": "10.1.2.3"}}}));
        ensure_transparent_proxy(&mut sidecar);
        assert_eq!(
            sidecar["proxy"]["config"]["bind_address"],
            json!("10.1.2.3")
        );

        let mut sidecar = obj(json!({"proxy": {"config": {"bind_address": "  "}}}));
        ensure_transparent_proxy(&mut sidecar);
        assert_eq!(
            sidecar["proxy"]["config"]["bind_address"],
            json!("0.0.0.0")
        );
    }

    #[test]
    fn test_prometheus_injection_is_write_once() {
        let mut sidecar = Map::new();
        ensure_envoy_prometheus(&mut sidecar, "0.0.0.0:9102");
        ensure_envoy_prometheus(&mut sidecar, "0.0.0.0:9999");
        assert_eq!(
            sidecar["proxy"]["config"]["envoy_prometheus_bind_addr"],
            json!("0.0.0.0:9102")
        );
    }

    #[test]
    fn test_needs_transparent_proxy() {
        let on = obj(json!({"connect": {"sidecar_service": {"proxy": {"transparent_proxy": {}}}}}));
        assert!(needs_transparent_proxy(&on));

        let legacy =
            obj(json!({"connect": {"sidecar_service": {"proxy": {"TransparentProxy": {}}}}}));
        assert!(needs_transparent_proxy(&legacy));

        let off = obj(json!({"connect": {"sidecar_service": {"proxy": {}}}}));
        assert!(!needs_transparent_proxy(&off));
        assert!(!needs_transparent_proxy(&Map::new()));
    }
}
