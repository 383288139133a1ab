//! C8: control-plane dispatcher (§4.6). A Unix-domain socket accepts
//! line-delimited JSON-RPC 2.0 requests, one OS thread per connection; an
//! optional `tiny_http` HTTP entry accepts one JSON-RPC body per request
//! for remote bridges. Both funnel into the same `methods::dispatch`.

mod methods;
mod types;

use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::error::ErrorKind;
use crate::registry::Registry;
use crate::util::unlink_tolerant;
use types::{RpcRequest, RpcResponse};

const RATE_LIMIT_PER_MINUTE: u32 = 10;

struct RateLimiter {
    buckets: Mutex<std::collections::HashMap<String, (u32, Instant)>>,
}

impl RateLimiter {
    fn new() -> Self {
        RateLimiter {
            buckets: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Fixed-window limiter: `RATE_LIMIT_PER_MINUTE` requests per client id
    /// per rolling 60s window, reset wholesale once the window elapses.
    fn allow(&self, client_id: &str) -> bool {
        let mut buckets = self.buckets.lock().unwrap_or_else(|p| p.into_inner());
        let entry = buckets.entry(client_id.to_string()).or_insert((0, Instant::now()));
        if entry.1.elapsed() >= Duration::from_secs(60) {
            *entry = (0, Instant::now());
        }
        if entry.0 >= RATE_LIMIT_PER_MINUTE {
            return false;
        }
        entry.0 += 1;
        true
    }
}

fn is_public_prelogin(method: &str) -> bool {
    method.starts_with("system.") || method == "device.validate"
}

fn handle_request(registry: &Registry, limiter: &RateLimiter, client_id: &str, raw: &str) -> Option<Value> {
    let parsed: Result<RpcRequest, _> = serde_json::from_str(raw);
    let request = match parsed {
        Ok(r) => r,
        Err(_) => {
            return Some(serde_json::to_value(RpcResponse::err(Value::Null, ErrorKind::ParseError.rpc_code(), "malformed json")).unwrap());
        }
    };

    let id = request.id.clone().unwrap_or(Value::Null);
    let is_notification = request.id.is_none();

    if request.jsonrpc.as_deref() != Some("2.0") {
        let resp = RpcResponse::err(id, ErrorKind::InvalidRequest.rpc_code(), "missing or invalid jsonrpc field");
        return if is_notification { None } else { Some(serde_json::to_value(resp).unwrap()) };
    }
    let Some(method) = request.method.as_deref() else {
        let resp = RpcResponse::err(id, ErrorKind::InvalidRequest.rpc_code(), "missing method");
        return if is_notification { None } else { Some(serde_json::to_value(resp).unwrap()) };
    };

    if is_public_prelogin(method) && !limiter.allow(client_id) {
        let resp = RpcResponse::err(id, ErrorKind::InternalError.rpc_code(), "rate limit exceeded");
        return if is_notification { None } else { Some(serde_json::to_value(resp).unwrap()) };
    }

    let start = Instant::now();
    let result = methods::dispatch(registry, method, &request.params);
    let elapsed_us = start.elapsed().as_micros();

    let response = match &result {
        Ok(value) => {
            tracing::info!(method, elapsed_us, "rpc call completed");
            RpcResponse::ok(id, value.clone())
        }
        Err(err) => {
            tracing::warn!(method, code = err.code, elapsed_us, "rpc call failed");
            RpcResponse::from_traced(id, err)
        }
    };

    if is_notification {
        None
    } else {
        Some(serde_json::to_value(response).unwrap())
    }
}

fn handle_unix_connection(stream: UnixStream, registry: Arc<Registry>, limiter: Arc<RateLimiter>, client_id: String) {
    let mut writer = match stream.try_clone() {
        Ok(w) => w,
        Err(_) => return,
    };
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        if let Some(response) = handle_request(&registry, &limiter, &client_id, &line) {
            let mut out = serde_json::to_vec(&response).unwrap_or_default();
            out.push(b'\n');
            if writer.write_all(&out).is_err() {
                break;
            }
        }
    }
}

/// Bind the control socket, create its parent directory if missing, and
/// accept connections until `shutdown` flips — one OS thread per
/// connection, matching the teacher's per-listener/per-worker thread model
/// generalized from HTTP to a Unix accept loop.
pub(crate) fn serve_unix(
    registry: Arc<Registry>,
    socket_path: &std::path::Path,
    shutdown: Arc<AtomicBool>,
) -> std::io::Result<()> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    unlink_tolerant(socket_path);
    let listener = UnixListener::bind(socket_path)?;
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o660))?;
    listener.set_nonblocking(true)?;

    let limiter = Arc::new(RateLimiter::new());
    let mut next_client_id: u64 = 0;

    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _addr)) => {
                next_client_id += 1;
                let client_id = format!("unix-{next_client_id}");
                let registry = registry.clone();
                let limiter = limiter.clone();
                thread::spawn(move || handle_unix_connection(stream, registry, limiter, client_id));
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(20));
            }
            Err(_) => thread::sleep(Duration::from_millis(20)),
        }
    }
    unlink_tolerant(socket_path);
    Ok(())
}

/// HTTP entry point for remote bridges: one JSON-RPC body per request,
/// built directly on `tiny_http` the way the teacher's
/// `bridges/webhook.rs::run_webhook_bridge` does.
pub(crate) fn serve_http(registry: Arc<Registry>, bind: &str, shutdown: Arc<AtomicBool>) -> std::io::Result<()> {
    let server = tiny_http::Server::http(bind)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, format!("http bind failed: {e}")))?;
    let limiter = Arc::new(RateLimiter::new());

    while !shutdown.load(Ordering::SeqCst) {
        match server.recv_timeout(Duration::from_millis(200)) {
            Ok(Some(mut request)) => {
                let mut body = String::new();
                let _ = std::io::Read::read_to_string(request.as_reader(), &mut body);
                let client_id = request
                    .remote_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "http-unknown".to_string());
                let response_value = handle_request(&registry, &limiter, &client_id, &body)
                    .unwrap_or_else(|| serde_json::json!({"jsonrpc": "2.0", "id": Value::Null, "result": null}));
                let body = serde_json::to_string(&response_value).unwrap_or_default();
                let response = tiny_http::Response::from_string(body).with_header(
                    tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).unwrap(),
                );
                let _ = request.respond(response);
            }
            Ok(None) => continue,
            Err(_) => break,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_registry() -> (tempfile::TempDir, Arc<Registry>) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.runtime_dir = dir.path().join("run");
        config.socket_path = config.runtime_dir.join("bridge.sock");
        config.db_path = dir.path().join("bridge.db");
        let registry = Arc::new(Registry::build(&config).unwrap());
        (dir, registry)
    }

    #[test]
    fn malformed_json_returns_parse_error() {
        let (_dir, registry) = test_registry();
        let limiter = RateLimiter::new();
        let response = handle_request(&registry, &limiter, "c1", "{not json").unwrap();
        assert_eq!(response["error"]["code"], ErrorKind::ParseError.rpc_code());
    }

    #[test]
    fn missing_jsonrpc_field_is_invalid_request() {
        let (_dir, registry) = test_registry();
        let limiter = RateLimiter::new();
        let response = handle_request(&registry, &limiter, "c1", r#"{"id":1,"method":"health"}"#).unwrap();
        assert_eq!(response["error"]["code"], ErrorKind::InvalidRequest.rpc_code());
    }

    #[test]
    fn notification_without_id_gets_no_response() {
        let (_dir, registry) = test_registry();
        let limiter = RateLimiter::new();
        let response = handle_request(&registry, &limiter, "c1", r#"{"jsonrpc":"2.0","method":"health"}"#);
        assert!(response.is_none());
    }

    #[test]
    fn valid_health_call_returns_result() {
        let (_dir, registry) = test_registry();
        let limiter = RateLimiter::new();
        let response = handle_request(&registry, &limiter, "c1", r#"{"jsonrpc":"2.0","id":1,"method":"health"}"#).unwrap();
        assert_eq!(response["result"]["state"], "healthy");
    }

    #[test]
    fn rate_limiter_blocks_after_threshold() {
        let limiter = RateLimiter::new();
        for _ in 0..RATE_LIMIT_PER_MINUTE {
            assert!(limiter.allow("client-a"));
        }
        assert!(!limiter.allow("client-a"));
        assert!(limiter.allow("client-b"));
    }
}
