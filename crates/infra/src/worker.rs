use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::cache::InventoryCache;
use crate::event_store::EventStore;
use crate::reconciler::LedgerReconciler;

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Periodic reconcile loop.
///
/// Replays the ledgers into the cache on a fixed interval, so drift from
/// missed adjustments or out-of-band history edits self-heals without anyone
/// calling a forced reconcile. Each pass is idempotent; overlapping with
/// manual reconciles is harmless.
#[derive(Debug)]
pub struct ReconcileWorker;

impl ReconcileWorker {
    /// Spawn a worker thread that reconciles every `interval`.
    pub fn spawn<S, C>(
        reconciler: LedgerReconciler<S>,
        cache: C,
        interval: Duration,
    ) -> WorkerHandle
    where
        S: EventStore + 'static,
        C: InventoryCache + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join = thread::Builder::new()
            .name("reconcile-worker".to_string())
            .spawn(move || worker_loop(reconciler, cache, shutdown_rx, interval))
            .expect("failed to spawn reconcile worker thread");

        WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}

fn worker_loop<S, C>(
    reconciler: LedgerReconciler<S>,
    cache: C,
    shutdown_rx: mpsc::Receiver<()>,
    interval: Duration,
) where
    S: EventStore,
    C: InventoryCache,
{
    loop {
        // The shutdown channel doubles as the tick: waking early on shutdown,
        // reconciling on timeout.
        match shutdown_rx.recv_timeout(interval) {
            Ok(()) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if let Err(err) = reconciler.reconcile_and_replace(&cache) {
                    warn!(error = %err, "periodic reconcile pass failed");
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}
