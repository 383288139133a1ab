//! C7: orchestrator — the `start`/`stop` flow from §4.5, wired through the
//! keystore, the secret injector, and the container tracker.
//!
//! The container runtime itself (the engine's HTTP API) is out of scope;
//! `ContainerRuntime` is the seam, with a process-spawn implementation
//! grounded in the teacher's `config.rs::run_hook_command` bounded-wait
//! loop and a fake used by tests.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::containers::{container_name, started_at_now, ContainerRecord, ContainerTracker};
use crate::error::{ErrorKind, TracedError};
use crate::keystore::KeystoreClient;
use crate::secrets::SecretInjector;
use crate::util::{isolated_command, kill_process_tree, unlink_tolerant};

pub(crate) struct ContainerSpec {
    pub(crate) name: String,
    pub(crate) image: String,
    pub(crate) env: BTreeMap<String, String>,
    pub(crate) secret_socket_host_path: PathBuf,
    pub(crate) auto_remove: bool,
}

pub(crate) trait ContainerRuntime: Send + Sync {
    fn create_and_start(&self, spec: &ContainerSpec, deadline: Duration) -> Result<String, TracedError>;
    fn remove(&self, container_id: &str, force: bool) -> Result<(), TracedError>;
}

/// Shells out to a configurable launcher (e.g. `docker run ...` or an
/// internal wrapper script) the way `run_hook_command` shells out to
/// expansion/rerank hooks: spawn, poll with `try_wait` against a deadline,
/// kill-and-fail on timeout.
pub(crate) struct ProcessContainerRuntime {
    launcher: Vec<String>,
}

impl ProcessContainerRuntime {
    pub(crate) fn new(launcher: Vec<String>) -> Self {
        ProcessContainerRuntime { launcher }
    }
}

impl ContainerRuntime for ProcessContainerRuntime {
    fn create_and_start(&self, spec: &ContainerSpec, deadline: Duration) -> Result<String, TracedError> {
        if self.launcher.is_empty() {
            return Err(TracedError::new(ErrorKind::StartFailed, "no container launcher configured"));
        }
        let mut cmd = isolated_command(&self.launcher[0], &self.launcher[1..].to_vec());
        cmd.arg(&spec.name).arg(&spec.image);
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }
        let mut child = cmd
            .spawn()
            .map_err(|e| TracedError::new(ErrorKind::StartFailed, "spawn container launcher failed").with_cause(e))?;

        let start = Instant::now();
        loop {
            if start.elapsed() >= deadline {
                kill_process_tree(&mut child);
                return Err(TracedError::new(ErrorKind::StartFailed, "container start deadline exceeded"));
            }
            match child.try_wait() {
                Ok(Some(status)) => {
                    if status.success() {
                        return Ok(spec.name.clone());
                    }
                    return Err(TracedError::new(ErrorKind::StartFailed, format!("launcher exited with {status}")));
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(20)),
                Err(e) => return Err(TracedError::new(ErrorKind::StartFailed, "launcher wait failed").with_cause(e)),
            }
        }
    }

    fn remove(&self, _container_id: &str, _force: bool) -> Result<(), TracedError> {
        Ok(())
    }
}

/// In-memory double used by orchestrator tests: records calls, lets the
/// test force a failure to exercise the rollback path.
pub(crate) struct FakeContainerRuntime {
    pub(crate) fail_create: bool,
}

impl ContainerRuntime for FakeContainerRuntime {
    fn create_and_start(&self, spec: &ContainerSpec, _deadline: Duration) -> Result<String, TracedError> {
        if self.fail_create {
            return Err(TracedError::new(ErrorKind::StartFailed, "fake runtime forced failure"));
        }
        Ok(format!("cid-{}", spec.name))
    }

    fn remove(&self, _container_id: &str, _force: bool) -> Result<(), TracedError> {
        Ok(())
    }
}

pub(crate) struct Orchestrator {
    keystore: Arc<dyn KeystoreClient>,
    injector: SecretInjector,
    tracker: Arc<ContainerTracker>,
    runtime: Box<dyn ContainerRuntime>,
    control_socket_dir: PathBuf,
    endpoint: String,
    http_proxy: Option<String>,
    start_deadline: Duration,
}

impl Orchestrator {
    pub(crate) fn new(
        keystore: Arc<dyn KeystoreClient>,
        injector: SecretInjector,
        tracker: Arc<ContainerTracker>,
        runtime: Box<dyn ContainerRuntime>,
        control_socket_dir: PathBuf,
        endpoint: String,
        http_proxy: Option<String>,
        start_deadline: Duration,
    ) -> Self {
        Orchestrator {
            keystore,
            injector,
            tracker,
            runtime,
            control_socket_dir,
            endpoint,
            http_proxy,
            start_deadline,
        }
    }

    fn control_socket_path(&self, name: &str) -> PathBuf {
        self.control_socket_dir.join(format!("{name}.control.sock"))
    }

    pub(crate) fn start(&self, key_id: &str, agent_type: &str, image: &str) -> Result<ContainerRecord, TracedError> {
        let cred = match self.keystore.get_key(key_id) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(event = "secret_access", key_id, status = "failed", "key lookup failed");
                return Err(e);
            }
        };

        let name = container_name(key_id);
        if self.tracker.name_in_use(&name) {
            return Err(TracedError::new(ErrorKind::NameCollision, format!("container name {name} in use")));
        }

        let control_socket = self.control_socket_path(&name);
        let secret_path = self.injector.inject_secrets(&name, &cred)?;
        tracing::info!(event = "secret_access", key_id, status = "ok", "credential injected");

        let mut env = BTreeMap::new();
        env.insert("ARMORCLAW_KEY_ID".to_string(), key_id.to_string());
        env.insert("ARMORCLAW_ENDPOINT".to_string(), self.endpoint.clone());
        env.insert(
            "ARMORCLAW_SECRET_SOCKET".to_string(),
            secret_path.to_string_lossy().to_string(),
        );
        if let Some(proxy) = &self.http_proxy {
            env.insert("HTTP_PROXY".to_string(), proxy.clone());
        }

        let spec = ContainerSpec {
            name: name.clone(),
            image: image.to_string(),
            env,
            secret_socket_host_path: secret_path.clone(),
            auto_remove: true,
        };

        match self.runtime.create_and_start(&spec, self.start_deadline) {
            Ok(container_id) => {
                let record = ContainerRecord {
                    container_id: container_id.clone(),
                    container_name: name,
                    key_id: key_id.to_string(),
                    agent_type: agent_type.to_string(),
                    image: image.to_string(),
                    secret_socket_path: secret_path.to_string_lossy().to_string(),
                    started_at: started_at_now(),
                };
                self.tracker.insert(record.clone());
                tracing::info!(event = "container_start", container_id = %record.container_id, "container started");
                Ok(record)
            }
            Err(e) => {
                self.injector.cleanup(&spec.name);
                unlink_tolerant(&control_socket);
                let classification = if e.message.contains("deadline") { "timeout" } else { "start_failed" };
                tracing::warn!(event = "container_error", classification, "container start failed, rolled back");
                Err(TracedError::new(ErrorKind::StartFailed, "container start failed").with_cause(e))
            }
        }
    }

    /// `send_secret(container_id, key_id)`: replace a running container's
    /// secret socket with a freshly fetched credential via `UpdateSecrets`.
    pub(crate) fn send_secret(&self, container_id: &str, key_id: &str) -> Result<PathBuf, TracedError> {
        let record = self.tracker.get(container_id).ok_or_else(|| {
            TracedError::new(ErrorKind::ContainerNotFound, format!("container {container_id} not found"))
        })?;
        let cred = match self.keystore.get_key(key_id) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(event = "secret_access", key_id, status = "failed", "key lookup failed");
                return Err(e);
            }
        };
        let path = self.injector.update_secrets(&record.container_name, &cred)?;
        tracing::info!(event = "secret_access", key_id, status = "ok", "credential updated");
        Ok(path)
    }

    pub(crate) fn stop(&self, container_id: &str) -> Result<(), TracedError> {
        let record = self.tracker.get(container_id).ok_or_else(|| {
            TracedError::new(ErrorKind::ContainerNotFound, format!("container {container_id} not found"))
        })?;
        self.runtime.remove(container_id, true)?;
        unlink_tolerant(&self.control_socket_path(&record.container_name));
        self.injector.cleanup(&record.container_name);
        self.tracker.remove(container_id)?;
        tracing::info!(event = "container_stop", reason = "user_requested", container_id, "container stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::InMemoryKeystore;

    fn orchestrator(fail: bool) -> (tempfile::TempDir, Orchestrator) {
        let dir = tempfile::tempdir().unwrap();
        let keystore: Arc<dyn KeystoreClient> = Arc::new(InMemoryKeystore::new());
        keystore.store_key("anthropic", "sk-ant-abc").unwrap();
        let injector = SecretInjector::new(dir.path().join("containers"));
        let tracker = Arc::new(ContainerTracker::new());
        let runtime: Box<dyn ContainerRuntime> = Box::new(FakeContainerRuntime { fail_create: fail });
        let orch = Orchestrator::new(
            keystore,
            injector,
            tracker,
            runtime,
            dir.path().join("containers"),
            "unix:///run/armorclaw/bridge.sock".to_string(),
            None,
            Duration::from_millis(500),
        );
        (dir, orch)
    }

    #[test]
    fn start_then_stop_round_trips() {
        let (_dir, orch) = orchestrator(false);
        let record = orch.start("anthropic-default", "claude", "armorclaw/agent:latest").unwrap();
        assert!(!record.container_id.is_empty());
        orch.stop(&record.container_id).unwrap();
        assert!(orch.tracker.get(&record.container_id).is_none());
    }

    #[test]
    fn send_secret_rotates_running_container_credential() {
        let (_dir, orch) = orchestrator(false);
        let record = orch.start("anthropic-default", "claude", "armorclaw/agent:latest").unwrap();
        let path = orch.send_secret(&record.container_id, "anthropic-default").unwrap();
        assert!(path.to_string_lossy().ends_with(".secret.sock"));
    }

    #[test]
    fn missing_key_fails_before_touching_tracker() {
        let (_dir, orch) = orchestrator(false);
        let err = orch.start("nonexistent-key", "claude", "x").unwrap_err();
        assert_eq!(err.kind_code(), ErrorKind::KeyNotFound.rpc_code());
        assert!(orch.tracker.list().is_empty());
    }

    #[test]
    fn failed_create_rolls_back_and_leaves_no_tracker_entry() {
        let (_dir, orch) = orchestrator(true);
        let err = orch.start("anthropic-default", "claude", "x").unwrap_err();
        assert_eq!(err.kind_code(), ErrorKind::StartFailed.rpc_code());
        assert!(orch.tracker.list().is_empty());
    }

    #[test]
    fn stop_missing_container_is_not_found() {
        let (_dir, orch) = orchestrator(false);
        let err = orch.stop("nope").unwrap_err();
        assert_eq!(err.kind_code(), ErrorKind::ContainerNotFound.rpc_code());
    }
}
