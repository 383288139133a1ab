//! C5: per-container memory-only secret socket (§4.4).
//!
//! Each injected credential is handed to a container over a Unix-domain
//! socket that never touches a regular file; the prior `<secrets_dir>/
//! <name>.json` design is intentionally not reachable from here.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};

use crate::error::{ErrorKind, TracedError};
use crate::keystore::Credential;
use crate::util::unlink_tolerant;

pub(crate) struct SecretInjector {
    container_dir: PathBuf,
}

impl SecretInjector {
    pub(crate) fn new(container_dir: PathBuf) -> Self {
        SecretInjector { container_dir }
    }

    fn socket_path(&self, container_name: &str) -> PathBuf {
        self.container_dir.join(format!("{container_name}.secret.sock"))
    }

    /// Create the socket and return its path immediately; the first
    /// connection is accepted and written to on a dedicated background
    /// thread that owns the listener, since the container that connects
    /// is only launched by the orchestrator *after* this call returns.
    /// Accepting on the calling thread would deadlock every `start` — the
    /// container process doesn't exist yet to dial in.
    pub(crate) fn inject_secrets(
        &self,
        container_name: &str,
        cred: &Credential,
    ) -> Result<PathBuf, TracedError> {
        let path = self.socket_path(container_name);
        unlink_tolerant(&path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| TracedError::new(ErrorKind::InternalError, "cannot create container dir").with_cause(e))?;
        }
        let listener = UnixListener::bind(&path)
            .map_err(|e| TracedError::new(ErrorKind::InternalError, "bind secret socket failed").with_cause(e))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| TracedError::new(ErrorKind::InternalError, "chmod secret socket failed").with_cause(e))?;

        let cred = cred.clone();
        let accept_path = path.clone();
        std::thread::spawn(move || {
            if let Err(e) = write_record(&listener, &cred) {
                tracing::warn!(error = %e, path = %accept_path.display(), "secret socket accept/write failed");
            }
        });

        Ok(path)
    }

    /// Replaces the socket contents for a container whose process is
    /// already running, by unlinking and re-creating it.
    pub(crate) fn update_secrets(
        &self,
        container_name: &str,
        cred: &Credential,
    ) -> Result<PathBuf, TracedError> {
        self.cleanup(container_name);
        self.inject_secrets(container_name, cred)
    }

    /// Unlink the socket file. Tolerant of the file already being gone
    /// (double-unlink from both a normal `Cleanup` and a `rollback` path).
    pub(crate) fn cleanup(&self, container_name: &str) {
        unlink_tolerant(&self.socket_path(container_name));
    }
}

fn write_record(listener: &UnixListener, cred: &Credential) -> Result<(), TracedError> {
    let payload = serde_json::to_vec(cred)
        .map_err(|e| TracedError::new(ErrorKind::InternalError, "encode credential failed").with_cause(e))?;
    let (mut stream, _addr) = listener
        .accept()
        .map_err(|e| TracedError::new(ErrorKind::InternalError, "accept on secret socket failed").with_cause(e))?;
    stream
        .write_all(&(payload.len() as u32).to_be_bytes())
        .and_then(|_| stream.write_all(&payload))
        .map_err(|e| TracedError::new(ErrorKind::InternalError, "write secret record failed").with_cause(e))?;
    Ok(())
}

pub(crate) fn is_memory_only(path: &Path) -> bool {
    path.extension().map(|e| e == "sock").unwrap_or(false)
}
