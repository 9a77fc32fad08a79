// Copyright (C) 2023 QuerentAI LLC.
// This file is part of Querent.

// The Licensed Work is licensed under the Business Source License 1.1 (BSL 1.1).
// You may use this file in compliance with the BSL 1.1, subject to the following restrictions:
// 1. You may not use the Licensed Work for AI-related services, database services,
//    or any service or product offering that provides database, big data, or analytics
//    services to third parties unless explicitly authorized by QuerentAI LLC.
// 2. For more details, see the LICENSE file or visit https://mariadb.com/bsl11/.

// For inquiries about alternative licensing arrangements, please contact contact@querent.xyz.

// The Licensed Work is provided "AS IS", WITHOUT WARRANTY OF ANY KIND, express or implied,
// including but not limited to the warranties of merchantability, fitness for a particular purpose,
// and non-infringement. See the Business Source License for more details.

// This software includes code developed by QuerentAI LLC (https://querent.ai).

//! The supervisor: a single event reader that dispatches `max_requests`,
//! `exception`, `missing_pid`, and `exit` events to policy handlers. Ports
//! `multipipes.manager.Manager2`.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use uuid::Uuid;

use crate::worker::WorkerControl;

/// Optional collaborator for the debug-escalation behavior the source
/// installs via a process-wide `SIGUSR1` handler
/// (`PYTHONMULTIPIPESDEBUG`/`manager.exception_handler`). A no-op by
/// default; `Manager::set_debug` installs [`TracingDebugHooks`].
pub trait DebugHooks: Send + Sync {
    fn on_exception(&self, error: &anyhow::Error);
}

struct NoopDebugHooks;

impl DebugHooks for NoopDebugHooks {
    fn on_exception(&self, _error: &anyhow::Error) {}
}

/// Logs the exception and its cause chain at `error` level in place of the
/// source's `traceback.format_exc()` print-to-stderr-and-exit.
pub struct TracingDebugHooks;

impl DebugHooks for TracingDebugHooks {
    fn on_exception(&self, error: &anyhow::Error) {
        tracing::error!(error = %error, chain = ?error.chain().collect::<Vec<_>>(), "pipeline target raised an exception");
    }
}

#[derive(Debug)]
pub enum EventKind {
    MaxRequests,
    Exception(anyhow::Error),
    MissingPid,
    Exit,
}

pub struct Event {
    pub uuid: Uuid,
    pub kind: EventKind,
}

struct Inner {
    workers: Mutex<HashMap<Uuid, Arc<dyn WorkerControl>>>,
    errors: Mutex<Vec<anyhow::Error>>,
    events_tx: flume::Sender<Event>,
    restart_on_error: bool,
    restart_on_max_requests: bool,
    debug_hooks: Mutex<Arc<dyn DebugHooks>>,
    restart_pipeline: Mutex<Option<PipelineRestart>>,
}

type PipelineRestart = Box<dyn Fn() -> futures::future::BoxFuture<'static, ()> + Send + Sync>;

/// Owns the events channel and the worker registry. Cheap to clone (an
/// `Arc` around the shared state), matching how a `Node`'s workers and a
/// `Pipeline` all need their own handle to the same `Manager`.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

/// A non-owning handle a `Worker` can hold to report events without
/// keeping the `Manager` alive — ports the source's "Worker does not own
/// Manager" relation (spec §9, back-reference note).
#[derive(Clone)]
pub struct WeakManagerHandle {
    inner: Weak<Inner>,
}

impl WeakManagerHandle {
    pub fn upgrade(&self) -> Option<Manager> {
        self.inner.upgrade().map(|inner| Manager { inner })
    }
}

pub struct ManagerBuilder {
    restart_on_error: bool,
    restart_on_max_requests: bool,
}

impl Default for ManagerBuilder {
    fn default() -> Self {
        Self { restart_on_error: false, restart_on_max_requests: true }
    }
}

impl ManagerBuilder {
    pub fn restart_on_error(mut self, enabled: bool) -> Self {
        self.restart_on_error = enabled;
        self
    }

    pub fn restart_on_max_requests(mut self, enabled: bool) -> Self {
        self.restart_on_max_requests = enabled;
        self
    }

    pub fn build(self) -> Manager {
        let (events_tx, events_rx) = flume::unbounded();
        // Mirrors the source's module-level `DEBUG = bool(int(os.environ.get(
        // 'PYTHONMULTIPIPESDEBUG', 0)))`, read once and applied without
        // requiring a separate opt-in call.
        let debug_hooks: Arc<dyn DebugHooks> = if Manager::debug_enabled_from_env() {
            Arc::new(TracingDebugHooks)
        } else {
            Arc::new(NoopDebugHooks)
        };
        let inner = Arc::new(Inner {
            workers: Mutex::new(HashMap::new()),
            errors: Mutex::new(Vec::new()),
            events_tx,
            restart_on_error: self.restart_on_error,
            restart_on_max_requests: self.restart_on_max_requests,
            debug_hooks: Mutex::new(debug_hooks),
            restart_pipeline: Mutex::new(None),
        });
        let manager = Manager { inner };
        manager.clone().spawn_reader(events_rx);
        manager
    }
}

impl Manager {
    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::default()
    }

    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn downgrade(&self) -> WeakManagerHandle {
        WeakManagerHandle { inner: Arc::downgrade(&self.inner) }
    }

    /// `QW_PIPES_DEBUG` (renamed from `PYTHONMULTIPIPESDEBUG`; non-zero
    /// enables debug escalation). Ports `set_debug`.
    pub fn debug_enabled_from_env() -> bool {
        std::env::var("QW_PIPES_DEBUG")
            .ok()
            .and_then(|value| value.parse::<i64>().ok())
            .map(|value| value != 0)
            .unwrap_or(false)
    }

    pub fn set_debug(&self, enabled: bool) {
        let hooks: Arc<dyn DebugHooks> =
            if enabled { Arc::new(TracingDebugHooks) } else { Arc::new(NoopDebugHooks) };
        *self.inner.debug_hooks.lock().unwrap() = hooks;
    }

    /// Lets `Pipeline` register its own `restart()` for the
    /// `restart_on_error` policy without the Manager owning a `Pipeline`.
    pub fn set_pipeline_restart(
        &self,
        restart: impl Fn() -> futures::future::BoxFuture<'static, ()> + Send + Sync + 'static,
    ) {
        *self.inner.restart_pipeline.lock().unwrap() = Some(Box::new(restart));
    }

    pub fn register_worker(&self, uuid: Uuid, worker: Arc<dyn WorkerControl>) {
        self.inner.workers.lock().unwrap().insert(uuid, worker);
    }

    pub fn unregister_worker(&self, uuid: Uuid) {
        self.inner.workers.lock().unwrap().remove(&uuid);
    }

    pub fn send_event(&self, event: Event) {
        let _ = self.inner.events_tx.send(event);
    }

    pub fn errors(&self) -> Vec<String> {
        self.inner.errors.lock().unwrap().iter().map(|error| error.to_string()).collect()
    }

    pub fn error_count(&self) -> usize {
        self.inner.errors.lock().unwrap().len()
    }

    pub fn stop(&self) {
        self.send_event(Event { uuid: Uuid::nil(), kind: EventKind::Exit });
    }

    fn spawn_reader(self, events_rx: flume::Receiver<Event>) {
        tokio::spawn(async move {
            while let Ok(event) = events_rx.recv_async().await {
                match event.kind {
                    EventKind::Exit => break,
                    other => self.handle_event(event.uuid, other).await,
                }
            }
            tracing::debug!("manager event reader exiting");
        });
    }

    #[tracing::instrument(skip(self, kind), fields(worker_id = %uuid))]
    async fn handle_event(&self, uuid: Uuid, kind: EventKind) {
        match kind {
            EventKind::MaxRequests => self.handle_max_requests(uuid).await,
            EventKind::Exception(error) => self.handle_exception(error).await,
            EventKind::MissingPid => {
                tracing::warn!("missing_pid event received; no handling policy is implemented");
            }
            EventKind::Exit => unreachable!("handled by the reader loop"),
        }
    }

    /// Ports `Manager2.handle_max_requests`: look the worker up by its
    /// uuid and restart it in place. Pool size is unaffected because
    /// `restart` replaces the worker's execution unit, not its slot.
    async fn handle_max_requests(&self, uuid: Uuid) {
        let worker = self.inner.workers.lock().unwrap().get(&uuid).cloned();
        let Some(worker) = worker else {
            tracing::warn!("max_requests event for unknown worker {uuid}");
            return;
        };
        if self.inner.restart_on_max_requests {
            if let Err(error) = worker.restart().await {
                tracing::warn!(%error, "failed to restart worker after max_requests");
            } else {
                crate::metrics::PIPES_METRICS.worker_restarts_total.inc();
            }
        }
    }

    /// Ports `Manager2.handle_exception`.
    async fn handle_exception(&self, error: anyhow::Error) {
        crate::metrics::PIPES_METRICS.worker_exceptions_total.inc();
        self.inner.debug_hooks.lock().unwrap().on_exception(&error);
        self.inner.errors.lock().unwrap().push(error);

        if self.inner.restart_on_error {
            let restart_fn = self.inner.restart_pipeline.lock().unwrap().take();
            if let Some(restart_fn) = restart_fn {
                tracing::info!("restarting pipeline after exception");
                restart_fn().await;
                // Settle delay mirrors the source's `time.sleep(1)` after
                // `pipeline.restart()`, giving in-flight channel traffic a
                // moment to drain before the next exception (if any).
                tokio::time::sleep(Duration::from_secs(1)).await;
                *self.inner.restart_pipeline.lock().unwrap() = Some(restart_fn);
            }
        }
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeWorker {
        restarts: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl WorkerControl for FakeWorker {
        fn uuid(&self) -> Uuid {
            Uuid::nil()
        }

        fn is_alive(&self) -> bool {
            true
        }

        fn stop(&self) {}

        async fn join(&self, _timeout: Option<Duration>) -> Result<(), crate::error::PipesError> {
            Ok(())
        }

        fn terminate(&self) {}

        async fn restart(&self) -> Result<(), crate::error::PipesError> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn max_requests_event_restarts_the_matching_worker() {
        let manager = Manager::new();
        let uuid = Uuid::new_v4();
        let worker = Arc::new(FakeWorker { restarts: AtomicUsize::new(0) });
        manager.register_worker(uuid, worker.clone());

        manager.send_event(Event { uuid, kind: EventKind::MaxRequests });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(worker.restarts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exception_event_is_recorded() {
        let manager = Manager::new();
        manager.send_event(Event {
            uuid: Uuid::new_v4(),
            kind: EventKind::Exception(anyhow::anyhow!("boom")),
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(manager.error_count(), 1);
        assert!(manager.errors()[0].contains("boom"));
    }

    #[tokio::test]
    async fn restart_on_error_invokes_registered_pipeline_restart() {
        let manager = Manager::builder().restart_on_error(true).build();
        let invoked = Arc::new(AtomicBool::new(false));
        let invoked_clone = invoked.clone();
        manager.set_pipeline_restart(move || {
            let invoked = invoked_clone.clone();
            Box::pin(async move {
                invoked.store(true, Ordering::SeqCst);
            })
        });

        manager.send_event(Event {
            uuid: Uuid::new_v4(),
            kind: EventKind::Exception(anyhow::anyhow!("boom")),
        });
        tokio::time::sleep(Duration::from_millis(1200)).await;

        assert!(invoked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stop_terminates_the_event_reader() {
        let manager = Manager::new();
        manager.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // A second send after `stop` is a no-op since the reader exited;
        // this only verifies `stop` doesn't panic or hang.
        manager.send_event(Event { uuid: Uuid::new_v4(), kind: EventKind::MissingPid });
    }
}
