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

//! One execution unit running a [`Task`](crate::task::Task). Ports
//! `multipipes.worker.Worker`; the OS `Process` + `SIGINT` cancellation
//! handler become a `tokio::task::JoinHandle` plus a
//! [`pipes_common::TerimateSignal`] child.

use std::time::Duration;

use pipes_common::TerimateSignal;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
    error::PipesError,
    item::Target,
    manager::{Event, EventKind, WeakManagerHandle},
    task::{Task, TaskParams},
};

/// Back-reference a `Worker` exposes to its `Node`/`Manager` so a
/// recycling request can restart exactly this worker without either party
/// owning the other. Object-safe so a `Node` can hold
/// `Vec<Arc<dyn WorkerControl>>` across different `Target` types.
#[async_trait::async_trait]
pub trait WorkerControl: Send + Sync {
    fn uuid(&self) -> Uuid;
    fn is_alive(&self) -> bool;
    fn stop(&self);
    async fn join(&self, timeout: Option<Duration>) -> Result<(), PipesError>;
    fn terminate(&self);
    async fn restart(&self) -> Result<(), PipesError>;
}

pub struct Worker<Tg: Target> {
    uuid: Uuid,
    handle: Option<JoinHandle<Result<(), PipesError>>>,
    /// The pool-wide signal handed down from the owning `Node`/`Pipeline`.
    /// Never killed directly by this `Worker` — only a per-session child of
    /// it is, so that one worker's `stop` cannot poison the signal a
    /// subsequent `restart` would otherwise child off of.
    parent_sig: TerimateSignal,
    /// This session's child signal; `stop`/`terminate` kill this one.
    session_sig: Option<TerimateSignal>,
    manager: Option<WeakManagerHandle>,
    build_task: Box<dyn Fn(Uuid, TerimateSignal) -> Result<Task<Tg>, PipesError> + Send + Sync>,
}

impl<Tg: Target> Worker<Tg> {
    pub fn new(
        parent_sig: TerimateSignal,
        manager: Option<WeakManagerHandle>,
        build_task: impl Fn(Uuid, TerimateSignal) -> Result<Task<Tg>, PipesError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            handle: None,
            parent_sig,
            session_sig: None,
            manager,
            build_task: Box::new(build_task),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Spawns the Tokio task driving `Task::run_forever` and registers it
    /// with the Manager, if any. Ports `Worker.start`.
    pub fn start(&mut self) -> Result<(), PipesError> {
        let session_sig = self.parent_sig.child();
        let mut task = (self.build_task)(self.uuid, session_sig.clone())?;
        self.session_sig = Some(session_sig);
        let manager = self.manager.clone();
        let uuid = self.uuid;

        let handle = tokio::spawn(async move {
            let outcome = task.run_forever().await;
            match &outcome {
                Ok(()) => {
                    tracing::debug!(worker_id = %uuid, "worker exited cleanly");
                }
                Err(PipesError::MaxRequests(_)) => {
                    tracing::debug!(worker_id = %uuid, "worker reached its max_requests quota");
                    if let Some(manager) = manager.as_ref().and_then(WeakManagerHandle::upgrade) {
                        manager.send_event(Event { uuid, kind: EventKind::MaxRequests });
                    }
                }
                Err(PipesError::PoisonConsumed) => {
                    tracing::debug!(worker_id = %uuid, "worker consumed a matching poison pill");
                }
                Err(other) => {
                    tracing::warn!(worker_id = %uuid, error = %other, "worker target raised an exception");
                    if let Some(manager) = manager.as_ref().and_then(WeakManagerHandle::upgrade) {
                        manager.send_event(Event {
                            uuid,
                            kind: EventKind::Exception(anyhow::anyhow!(other.to_string())),
                        });
                    }
                }
            }
            outcome
        });

        self.handle = Some(handle);
        Ok(())
    }

    /// Idempotent if never started or already stopped. Ports `Worker.stop`.
    pub fn stop(&self) {
        if let Some(session_sig) = &self.session_sig {
            session_sig.kill();
        }
    }

    /// Ports `Worker.join`.
    pub async fn join(&mut self, timeout: Option<Duration>) -> Result<(), PipesError> {
        let Some(handle) = self.handle.take() else { return Ok(()) };
        let joined = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, handle)
                .await
                .map_err(|_| PipesError::Target(anyhow::anyhow!("worker join timed out")))?,
            None => handle.await,
        };
        match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(PipesError::MaxRequests(_) | PipesError::PoisonConsumed)) => Ok(()),
            Ok(Err(other)) => Err(other),
            Err(join_err) if join_err.is_cancelled() => Ok(()),
            Err(join_err) => Err(PipesError::Target(anyhow::anyhow!(join_err))),
        }
    }

    /// Forceful: aborts the underlying Tokio task. No cleanup guarantees,
    /// matching `Process.terminate`.
    pub fn terminate(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.stop();
    }

    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// `stop` then `join` with `timeout`; `terminate` if the join times
    /// out; then `start` again, preserving the worker's uuid. Ports
    /// `Worker.restart`.
    pub async fn restart(&mut self, join_timeout: Option<Duration>) -> Result<(), PipesError> {
        self.stop();
        if self.join(join_timeout).await.is_err() {
            self.terminate();
        }
        self.start()
    }
}

impl<Tg: Target> Drop for Worker<Tg> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[async_trait::async_trait]
impl<Tg: Target> WorkerControl for tokio::sync::Mutex<Worker<Tg>> {
    fn uuid(&self) -> Uuid {
        // `uuid` never changes for the lifetime of a Worker, so a
        // `try_lock` is always available even while `start`/`restart` run.
        self.try_lock().expect("uuid read should never contend").uuid()
    }

    fn is_alive(&self) -> bool {
        self.try_lock().map(|worker| worker.is_alive()).unwrap_or(true)
    }

    fn stop(&self) {
        if let Ok(worker) = self.try_lock() {
            worker.stop();
        }
    }

    async fn join(&self, timeout: Option<Duration>) -> Result<(), PipesError> {
        self.lock().await.join(timeout).await
    }

    fn terminate(&self) {
        if let Ok(mut worker) = self.try_lock() {
            worker.terminate();
        }
    }

    async fn restart(&self) -> Result<(), PipesError> {
        self.lock().await.restart(Some(Duration::from_secs(30))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::Channel,
        item::{FnTarget, Produced},
        task::Envelope,
    };
    use std::sync::Arc;

    fn counting_target() -> FnTarget<i64, i64, impl Fn(Option<i64>, bool) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<Produced<i64>>> + Send>> + Send + Sync + 'static>
    {
        FnTarget::new("counting", |input: Option<i64>, _timed_out: bool| {
            Box::pin(async move { Ok(Produced::from(input.map(|value| value * 2))) })
        })
    }

    #[tokio::test]
    async fn worker_start_stop_join_roundtrip() {
        let indata = Channel::new(0);
        let outdata = Channel::new(0);
        indata.put_nowait(Envelope::Item(5)).unwrap();

        let indata_for_task = indata.clone();
        let outdata_for_task = outdata.clone();
        let mut worker = Worker::new(TerimateSignal::default(), None, move |uuid, sig| {
            Task::new(
                TaskParams {
                    target: Arc::new(counting_target()),
                    indata: Some(indata_for_task.clone()),
                    outdata: Some(outdata_for_task.clone()),
                    max_execution_time: None,
                    max_requests: None,
                    timeout: None,
                    polling_timeout: Duration::from_millis(20),
                    session: uuid,
                },
                sig,
            )
        });

        worker.start().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(outdata.get_nowait().unwrap(), Envelope::Item(10)));

        worker.stop();
        worker.join(Some(Duration::from_secs(1))).await.unwrap();
        assert!(!worker.is_alive());
    }
}
