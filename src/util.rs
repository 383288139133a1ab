//! Small stand-alone helpers shared across components: environment reads,
//! timestamps, id/checksum generation, and process-group lifecycle for
//! spawned container processes.

use std::env;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in Unix-epoch milliseconds.
///
/// Stored instants are plain `i64` millis rather than `SystemTime` so that
/// the embedded store's columns stay simple, sortable integers (see
/// `store.rs`).
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub(crate) fn env_optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

pub(crate) fn env_u64(name: &str, default: u64) -> u64 {
    env_optional(name)
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

pub(crate) fn env_u32(name: &str, default: u32) -> u32 {
    env_optional(name)
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(default)
}

pub(crate) fn blake3_hex(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// A short, process-unique suffix derived from the monotonic nanosecond
/// clock. Used to build deterministic-but-unique container names
/// (`armorclaw-<key_id>-<nanos>`) per the orchestrator spec.
pub(crate) fn nanos_suffix() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

/// Kill a child process and its entire process group: SIGTERM first, then
/// SIGKILL after a short grace period if it hasn't exited.
#[cfg(unix)]
pub(crate) fn kill_process_tree(child: &mut std::process::Child) {
    let pid = child.id() as i32;
    unsafe {
        libc::kill(-pid, libc::SIGTERM);
    }
    std::thread::sleep(std::time::Duration::from_millis(300));
    match child.try_wait() {
        Ok(Some(_)) => {}
        _ => unsafe {
            libc::killpg(pid, libc::SIGKILL);
        },
    }
    let _ = child.wait();
}

#[cfg(not(unix))]
pub(crate) fn kill_process_tree(child: &mut std::process::Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Build a `std::process::Command` that becomes the leader of its own
/// process group on Unix, so the whole tree can be torn down on `stop`
/// without affecting the bridge process.
#[cfg(unix)]
pub(crate) fn isolated_command(program: &str, args: &[String]) -> std::process::Command {
    use std::os::unix::process::CommandExt;
    let mut cmd = std::process::Command::new(program);
    cmd.args(args);
    cmd.process_group(0);
    cmd
}

#[cfg(not(unix))]
pub(crate) fn isolated_command(program: &str, args: &[String]) -> std::process::Command {
    let mut cmd = std::process::Command::new(program);
    cmd.args(args);
    cmd
}

/// Remove a path, tolerating "already gone" (per the spec's "double-unlink
/// is tolerated" rule for secret/control sockets).
pub(crate) fn unlink_tolerant(path: &std::path::Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to unlink socket"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_is_monotonic_enough() {
        let a = now_ms();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = now_ms();
        assert!(b >= a);
    }

    #[test]
    fn env_optional_treats_blank_as_absent() {
        unsafe {
            std::env::set_var("ARMORCLAW_TEST_BLANK", "   ");
        }
        assert_eq!(env_optional("ARMORCLAW_TEST_BLANK"), None);
        unsafe {
            std::env::remove_var("ARMORCLAW_TEST_BLANK");
        }
    }

    #[test]
    fn blake3_hex_is_deterministic() {
        assert_eq!(blake3_hex(b"hello"), blake3_hex(b"hello"));
        assert_ne!(blake3_hex(b"hello"), blake3_hex(b"world"));
    }
}
