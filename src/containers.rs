//! C6: container tracker — the in-memory record of agent containers the
//! orchestrator has started, keyed by the runtime-assigned container id.
//! A single `RwLock`-guarded map, per `spec.md` §9's explicit carve-out for
//! fine-grained locks alongside the breaker snapshot.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;

use crate::error::{ErrorKind, TracedError};
use crate::util::now_ms;

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ContainerRecord {
    pub(crate) container_id: String,
    pub(crate) container_name: String,
    pub(crate) key_id: String,
    pub(crate) agent_type: String,
    pub(crate) image: String,
    pub(crate) secret_socket_path: String,
    pub(crate) started_at: i64,
}

#[derive(Default)]
pub(crate) struct ContainerTracker {
    by_id: RwLock<HashMap<String, ContainerRecord>>,
}

impl ContainerTracker {
    pub(crate) fn new() -> Self {
        ContainerTracker::default()
    }

    pub(crate) fn name_in_use(&self, container_name: &str) -> bool {
        self.by_id.read().values().any(|r| r.container_name == container_name)
    }

    pub(crate) fn insert(&self, record: ContainerRecord) {
        self.by_id.write().insert(record.container_id.clone(), record);
    }

    pub(crate) fn get(&self, container_id: &str) -> Option<ContainerRecord> {
        self.by_id.read().get(container_id).cloned()
    }

    pub(crate) fn remove(&self, container_id: &str) -> Result<ContainerRecord, TracedError> {
        self.by_id
            .write()
            .remove(container_id)
            .ok_or_else(|| TracedError::new(ErrorKind::ContainerNotFound, format!("container {container_id} not found")))
    }

    pub(crate) fn list(&self) -> Vec<ContainerRecord> {
        self.by_id.read().values().cloned().collect()
    }
}

pub(crate) fn container_name(key_id: &str) -> String {
    format!("armorclaw-{key_id}-{}", crate::util::nanos_suffix())
}

pub(crate) fn started_at_now() -> i64 {
    now_ms()
}
