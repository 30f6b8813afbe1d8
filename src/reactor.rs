//! Reactor lifecycle.
//!
//! The reactor owns the worker pool that drives all asynchronous I/O in the
//! library. It is a process-wide singleton: [`start`] brings up a pool of
//! worker threads, [`stop`] cancels all outstanding operations, joins the
//! workers and releases the pool. Starting and stopping repeatedly over the
//! process lifetime is legal.
//!
//! Every socket, listener and channel spawns its driver tasks onto this
//! pool. A driver task holds only a weak reference to its resource, so a
//! resource dropped by the application makes the pending work a no-op.
//! Serialization per resource (the "strand" guarantee) comes from each
//! resource's own state mutex: callbacks for one resource never overlap,
//! while different resources proceed in parallel across the pool.
//!
//! [`start`] also performs the process-wide TLS initialization (installing
//! the rustls crypto provider). That part is deliberately never torn down;
//! [`stop`] only dismantles the worker pool.

use std::future::Future;
use std::sync::{OnceLock, RwLock};
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};

static REACTOR: OnceLock<RwLock<Option<Runtime>>> = OnceLock::new();

fn cell() -> &'static RwLock<Option<Runtime>> {
    REACTOR.get_or_init(|| RwLock::new(None))
}

/// Start the reactor with `workers` threads (at least one).
///
/// Idempotent: if the reactor is already running the call is a no-op and the
/// existing pool (with its original thread count) keeps serving.
pub fn start(workers: usize) {
    install_crypto_provider();

    let mut guard = cell().write().unwrap();

    if guard.is_some() {
        tracing::debug!("reactor already running");
        return;
    }

    let workers = workers.max(1);

    match Builder::new_multi_thread()
        .worker_threads(workers)
        .thread_name("multilink-io")
        .enable_io()
        .enable_time()
        .build()
    {
        Ok(runtime) => {
            tracing::info!(workers, "reactor started");
            *guard = Some(runtime);
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start reactor");
        }
    }
}

/// Stop the reactor.
///
/// Cancels all outstanding I/O on all resources, drains and joins the worker
/// pool. Queued application data is not silently dropped by this call itself;
/// resources report their own warnings when closed with undrained buffers.
///
/// Must not be called from a reactor worker thread.
pub fn stop() {
    let runtime = cell().write().unwrap().take();

    if let Some(runtime) = runtime {
        runtime.shutdown_timeout(Duration::from_secs(5));
        tracing::info!("reactor stopped");
    }
}

/// Whether the reactor is currently running.
pub fn is_running() -> bool {
    cell().read().unwrap().is_some()
}

/// Handle to the running pool, if any.
pub(crate) fn handle() -> Option<Handle> {
    cell().read().unwrap().as_ref().map(|rt| rt.handle().clone())
}

/// Spawn a driver task onto the pool.
///
/// Returns false (and logs) when the reactor is not running.
pub(crate) fn spawn<F>(future: F) -> bool
where
    F: Future<Output = ()> + Send + 'static,
{
    match handle() {
        Some(handle) => {
            handle.spawn(future);
            true
        }
        None => {
            tracing::warn!("reactor is not running, call reactor::start first");
            false
        }
    }
}

fn install_crypto_provider() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        // Err means another provider won the race process-wide, which is fine.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_stop_cycle() {
        assert!(!is_running());

        start(2);
        assert!(is_running());
        let first = handle().expect("running");

        // Idempotent start keeps the existing pool.
        start(8);
        assert!(is_running());

        // The pool accepts and completes work.
        let (tx, rx) = std::sync::mpsc::channel();
        assert!(spawn(async move {
            let _ = tx.send(1u8);
        }));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        drop(first);

        stop();
        assert!(!is_running());
        assert!(handle().is_none());

        // Restart after stop is legal.
        start(1);
        assert!(is_running());
        stop();
    }
}
