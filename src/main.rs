mod breaker;
mod config;
mod containers;
mod error;
mod health;
mod keystore;
mod metrics;
mod orchestrator;
mod platform;
mod queue;
mod registry;
mod rpc;
mod secrets;
mod store;
mod trust;
mod util;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use config::{classify_api_key, Config};
use registry::Registry;

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("ARMORCLAW_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Background sweeper loop running `ProcessRetryQueue`/`CleanupExpired` on
/// a fixed cadence until `shutdown` flips, per spec §5's "background
/// sweepers use no deadline but observe the shutdown signal".
fn spawn_sweepers(registry: Arc<Registry>, shutdown: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while !shutdown.load(Ordering::SeqCst) {
            match registry.queue.process_retry_queue() {
                Ok(n) if n > 0 => tracing::debug!(touched = n, "retry sweep cleared due next_retry values"),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "retry sweep failed"),
            }
            match registry.queue.cleanup_expired() {
                Ok(n) if n > 0 => tracing::debug!(deleted = n, "expired messages purged"),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "expiry cleanup failed"),
            }
            thread::sleep(Duration::from_secs(5));
        }
    })
}

fn seed_api_key_from_env(registry: &Registry) {
    let Some(raw) = util::env_optional("ARMORCLAW_API_KEY") else {
        return;
    };
    match classify_api_key(&raw) {
        Some(provider) => match registry.keystore.store_key(provider, &raw) {
            Ok(cred) => tracing::info!(key_id = %cred.key_id, "seeded api key from environment"),
            Err(e) => tracing::warn!(error = %e, "failed to seed api key from environment"),
        },
        None => tracing::warn!("ARMORCLAW_API_KEY set but prefix unrecognized; not stored"),
    }
}

fn main() {
    init_tracing();

    let (config, config_file_override) = Config::load();
    if let Some(path) = &config_file_override {
        tracing::info!(path = %path.display(), "ARMORCLAW_CONFIG set; external loader owns parsing it");
    }

    let registry = match Registry::build(&config) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            tracing::error!(error = %e, "failed to build registry; exiting");
            std::process::exit(1);
        }
    };
    seed_api_key_from_env(&registry);

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        let registry = registry.clone();
        ctrlc_handler(move || {
            tracing::info!("shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
            registry.shutdown();
        });
    }

    let sweeper_handle = spawn_sweepers(registry.clone(), shutdown.clone());

    let http_handle = config.http_bind.clone().map(|bind| {
        let registry = registry.clone();
        let shutdown = shutdown.clone();
        thread::spawn(move || {
            if let Err(e) = rpc::serve_http(registry, &bind, shutdown) {
                tracing::error!(error = %e, "http listener exited");
            }
        })
    });

    tracing::info!(socket = %config.socket_path.display(), "armorclaw-bridged starting");
    if let Err(e) = rpc::serve_unix(registry.clone(), &config.socket_path, shutdown.clone()) {
        tracing::error!(error = %e, "unix socket listener exited");
    }

    // Grace period for in-flight transactions to commit or roll back (§5).
    thread::sleep(Duration::from_millis(100));
    shutdown.store(true, Ordering::SeqCst);
    registry.shutdown();

    let _ = sweeper_handle.join();
    if let Some(handle) = http_handle {
        let _ = handle.join();
    }
    tracing::info!("armorclaw-bridged stopped");
}

/// Minimal SIGINT/SIGTERM handler: installs a libc signal handler that
/// flips an `AtomicBool`, polled by a dedicated thread so the callback
/// itself stays async-signal-safe (no allocation, no locking).
fn ctrlc_handler(on_signal: impl Fn() + Send + 'static) {
    static FLAG: AtomicBool = AtomicBool::new(false);

    extern "C" fn handle(_: libc::c_int) {
        FLAG.store(true, Ordering::SeqCst);
    }

    unsafe {
        libc::signal(libc::SIGINT, handle as usize);
        libc::signal(libc::SIGTERM, handle as usize);
    }

    thread::spawn(move || loop {
        if FLAG.load(Ordering::SeqCst) {
            on_signal();
            break;
        }
        thread::sleep(Duration::from_millis(100));
    });
}
