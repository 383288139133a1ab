//! The Registry aggregate (§4.9, ambient per `spec.md` §9 Design Notes):
//! a single owned struct replacing the process-wide maps the source
//! relied on. Built once at startup and handed to every dispatcher
//! connection thread behind an `Arc`; no method here or downstream reads
//! a process-global `static`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::breaker::CircuitBreaker;
use crate::config::Config;
use crate::containers::ContainerTracker;
use crate::error::TracedError;
use crate::keystore::{InMemoryKeystore, KeystoreClient};
use crate::metrics::Metrics;
use crate::orchestrator::{Orchestrator, ProcessContainerRuntime};
use crate::queue::{Queue, QueueConfig};
use crate::secrets::SecretInjector;
use crate::store::MessageStore;
use crate::trust::{AllowAllTrustHook, TrustHook};

pub(crate) struct Registry {
    pub(crate) queue: Queue,
    pub(crate) keystore: Arc<dyn KeystoreClient>,
    pub(crate) orchestrator: Orchestrator,
    pub(crate) tracker: Arc<ContainerTracker>,
    pub(crate) trust: Arc<dyn TrustHook>,
}

impl Registry {
    pub(crate) fn build(config: &Config) -> Result<Self, TracedError> {
        std::fs::create_dir_all(&config.runtime_dir).map_err(|e| {
            TracedError::new(crate::error::ErrorKind::InternalError, "cannot create runtime dir").with_cause(e)
        })?;
        let containers_dir = config.runtime_dir.join("containers");
        std::fs::create_dir_all(&containers_dir).map_err(|e| {
            TracedError::new(crate::error::ErrorKind::InternalError, "cannot create containers dir").with_cause(e)
        })?;

        let store = MessageStore::open_or_create(&config.db_path)?;
        let breaker = CircuitBreaker::load(
            &store,
            config.breaker_threshold,
            config.breaker_timeout_ms,
            config.breaker_half_open_success_required,
        );
        let metrics = Metrics::new();
        let queue_config = QueueConfig {
            default_priority: config.default_priority,
            default_max_attempts: config.default_max_attempts,
            max_queue_depth: config.max_queue_depth,
            batch_max_size: config.batch_max_size,
            retry_base_delay_ms: config.retry_base_delay_ms,
            retry_max_delay_ms: config.retry_max_delay_ms,
        };
        let queue = Queue::new(store, breaker, metrics, queue_config, 64);

        let keystore: Arc<dyn KeystoreClient> = Arc::new(InMemoryKeystore::new());
        let tracker = Arc::new(ContainerTracker::new());
        let injector = SecretInjector::new(containers_dir.clone());
        let runtime = Box::new(ProcessContainerRuntime::new(launcher_command()));
        let orchestrator = Orchestrator::new(
            keystore.clone(),
            injector,
            tracker.clone(),
            runtime,
            containers_dir,
            socket_endpoint(&config.socket_path),
            config.http_proxy.clone(),
            Duration::from_millis(config.container_start_deadline_ms),
        );
        let trust: Arc<dyn TrustHook> = Arc::new(AllowAllTrustHook::new_logged());

        Ok(Registry {
            queue,
            keystore,
            orchestrator,
            tracker,
            trust,
        })
    }

    pub(crate) fn shutdown(&self) {
        self.queue.shutdown();
    }
}

fn launcher_command() -> Vec<String> {
    match crate::util::env_optional("ARMORCLAW_CONTAINER_LAUNCHER") {
        Some(cmd) => shlex::split(&cmd).unwrap_or_else(|| vec![cmd]),
        None => vec!["true".to_string()],
    }
}

fn socket_endpoint(path: &PathBuf) -> String {
    format!("unix://{}", path.display())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_creates_runtime_and_container_directories() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.runtime_dir = dir.path().join("run");
        config.socket_path = config.runtime_dir.join("bridge.sock");
        config.db_path = dir.path().join("bridge.db");
        let registry = Registry::build(&config).unwrap();
        assert!(config.runtime_dir.join("containers").is_dir());
        assert!(registry.tracker.list().is_empty());
    }
}
