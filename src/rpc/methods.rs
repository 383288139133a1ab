//! Method routing table (§4.6/§6). Only the core control-plane surface is
//! fully implemented; the peripheral families `spec.md` §6 names
//! (workflow/HITL/budget/platform/matrix/recovery/device/push/webrtc/
//! plugin/license/profile/pii/qr/compliance/appservice) are registered so
//! `MethodNotFound` is never returned for a name the spec lists, but each
//! responds with a typed `NotImplemented` instead of pretending to act.

use serde_json::{json, Value};

use crate::error::{ErrorKind, TracedError};
use crate::health;
use crate::registry::Registry;
use crate::trust::TrustRequest;

fn param_str(params: &Value, key: &str) -> Result<String, TracedError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| TracedError::new(ErrorKind::InvalidParams, format!("missing or invalid '{key}'")))
}

fn not_implemented(method: &str) -> Result<Value, TracedError> {
    Err(TracedError::new(
        ErrorKind::NotImplemented,
        format!("method '{method}' is recognized but not implemented"),
    ))
}

const PERIPHERAL_PREFIXES: &[&str] = &[
    "workflow.", "hitl.", "budget.", "platform.", "matrix.", "recovery.",
    "device.", "push.", "webrtc.", "plugin.", "license.", "profile.", "pii.",
];

const PERIPHERAL_EXACT: &[&str] = &[
    "qr.config",
    "compliance.status",
    "appservice.status",
    "attach_config",
    "list_configs",
    "bridge.capabilities",
    "bridge.discover",
    "bridge.get_local_info",
    "secret.list",
    "get_errors",
    "resolve_error",
    "system.health",
    "system.config",
    "system.info",
    "system.time",
];

fn is_peripheral(method: &str) -> bool {
    PERIPHERAL_EXACT.contains(&method) || PERIPHERAL_PREFIXES.iter().any(|p| method.starts_with(p))
}

pub(crate) fn dispatch(registry: &Registry, method: &str, params: &Value) -> Result<Value, TracedError> {
    match method {
        "status" | "health" | "bridge.health" => {
            let snapshot = health::snapshot(&registry.queue);
            Ok(serde_json::to_value(snapshot).unwrap_or(Value::Null))
        }
        "start" | "container.create" | "container.start" | "agent.start" => {
            let key_id = param_str(params, "key_id")?;
            let agent_type = params.get("agent_type").and_then(|v| v.as_str()).unwrap_or("claude").to_string();
            let image = param_str(params, "image")?;

            let decision = registry.trust.evaluate(&TrustRequest {
                operation: method.to_string(),
                user_id: params.get("user_id").and_then(|v| v.as_str()).unwrap_or("unknown").to_string(),
                ip: params.get("ip").and_then(|v| v.as_str()).unwrap_or("unknown").to_string(),
                device_fingerprint: params.get("device_fingerprint").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                action: "container.start".to_string(),
            });
            if !decision.allowed {
                return Err(TracedError::new(
                    ErrorKind::InvalidRequest,
                    decision.denial_reason.unwrap_or_else(|| "container start denied by trust policy".to_string()),
                ));
            }

            let record = registry.orchestrator.start(&key_id, &agent_type, &image)?;
            Ok(serde_json::to_value(record).unwrap_or(Value::Null))
        }
        "stop" | "container.stop" | "agent.stop" => {
            let container_id = param_str(params, "container_id")?;
            registry.orchestrator.stop(&container_id)?;
            Ok(json!({ "stopped": true }))
        }
        "container.list" | "agent.list" => {
            let records = registry.tracker.list();
            Ok(serde_json::to_value(records).unwrap_or(Value::Null))
        }
        "container.status" | "agent.status" => {
            let container_id = param_str(params, "container_id")?;
            let record = registry.tracker.get(&container_id).ok_or_else(|| {
                TracedError::new(ErrorKind::ContainerNotFound, format!("container {container_id} not found"))
            })?;
            Ok(serde_json::to_value(record).unwrap_or(Value::Null))
        }
        "send_secret" => {
            let container_id = param_str(params, "container_id")?;
            let key_id = param_str(params, "key_id")?;
            let path = registry.orchestrator.send_secret(&container_id, &key_id)?;
            Ok(json!({ "path": path.to_string_lossy() }))
        }
        "list_keys" => Ok(json!(registry.keystore.list_keys())),
        "get_key" => {
            let key_id = param_str(params, "key_id")?;
            let cred = registry.keystore.get_key(&key_id)?;
            Ok(serde_json::to_value(cred).unwrap_or(Value::Null))
        }
        "store_key" => {
            let provider = param_str(params, "provider")?;
            let secret = param_str(params, "secret")?;
            let cred = registry.keystore.store_key(&provider, &secret)?;
            Ok(serde_json::to_value(cred).unwrap_or(Value::Null))
        }
        method if is_peripheral(method) => not_implemented(method),
        _ => Err(TracedError::new(ErrorKind::MethodNotFound, format!("unknown method '{method}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_registry() -> (tempfile::TempDir, Registry) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.runtime_dir = dir.path().join("run");
        config.socket_path = config.runtime_dir.join("bridge.sock");
        config.db_path = dir.path().join("bridge.db");
        let registry = Registry::build(&config).unwrap();
        (dir, registry)
    }

    #[test]
    fn health_returns_a_snapshot() {
        let (_dir, registry) = test_registry();
        let result = dispatch(&registry, "health", &json!({})).unwrap();
        assert_eq!(result["state"], "healthy");
    }

    #[test]
    fn store_key_then_get_key_round_trips() {
        let (_dir, registry) = test_registry();
        dispatch(&registry, "store_key", &json!({"provider": "anthropic", "secret": "sk-ant-x"})).unwrap();
        let fetched = dispatch(&registry, "get_key", &json!({"key_id": "anthropic-default"})).unwrap();
        assert_eq!(fetched["secret"], "sk-ant-x");
    }

    #[test]
    fn unknown_method_is_method_not_found() {
        let (_dir, registry) = test_registry();
        let err = dispatch(&registry, "totally.unknown", &json!({})).unwrap_err();
        assert_eq!(err.kind_code(), ErrorKind::MethodNotFound.rpc_code());
    }

    #[test]
    fn peripheral_family_is_not_implemented_not_method_not_found() {
        let (_dir, registry) = test_registry();
        let err = dispatch(&registry, "workflow.start", &json!({})).unwrap_err();
        assert_eq!(err.kind_code(), ErrorKind::NotImplemented.rpc_code());
    }

    #[test]
    fn start_requires_key_id_and_image() {
        let (_dir, registry) = test_registry();
        let err = dispatch(&registry, "start", &json!({})).unwrap_err();
        assert_eq!(err.kind_code(), ErrorKind::InvalidParams.rpc_code());
    }
}
