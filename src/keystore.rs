//! Keystore client interface (§4.4). The encrypted-at-rest keystore
//! implementation is out of scope; this module only owns the CRUD contract
//! every other component consumes, plus an in-memory reference
//! implementation exercised by tests and suitable for a single-host
//! deployment with no external secrets manager configured.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, TracedError};
use crate::util::now_ms;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Credential {
    pub(crate) key_id: String,
    pub(crate) provider: String,
    pub(crate) secret: String,
    pub(crate) created_at: i64,
}

pub(crate) trait KeystoreClient: Send + Sync {
    fn list_keys(&self) -> Vec<String>;
    fn get_key(&self, key_id: &str) -> Result<Credential, TracedError>;
    fn store_key(&self, provider: &str, secret: &str) -> Result<Credential, TracedError>;
    fn delete_key(&self, key_id: &str) -> Result<(), TracedError>;
}

#[derive(Default)]
pub(crate) struct InMemoryKeystore {
    entries: RwLock<HashMap<String, Credential>>,
}

impl InMemoryKeystore {
    pub(crate) fn new() -> Self {
        InMemoryKeystore::default()
    }
}

impl KeystoreClient for InMemoryKeystore {
    fn list_keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    fn get_key(&self, key_id: &str) -> Result<Credential, TracedError> {
        self.entries
            .read()
            .get(key_id)
            .cloned()
            .ok_or_else(|| TracedError::new(ErrorKind::KeyNotFound, format!("key {key_id} not found")))
    }

    fn store_key(&self, provider: &str, secret: &str) -> Result<Credential, TracedError> {
        let key_id = format!("{provider}-default");
        let credential = Credential {
            key_id: key_id.clone(),
            provider: provider.to_string(),
            secret: secret.to_string(),
            created_at: now_ms(),
        };
        self.entries.write().insert(key_id, credential.clone());
        Ok(credential)
    }

    fn delete_key(&self, key_id: &str) -> Result<(), TracedError> {
        if self.entries.write().remove(key_id).is_none() {
            return Err(TracedError::new(ErrorKind::KeyNotFound, format!("key {key_id} not found")));
        }
        Ok(())
    }
}
