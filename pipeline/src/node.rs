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

//! A stage: a pool of Workers sharing one target and a pair of channels.
//! Ports `multipipes.node.Node`.

use std::{sync::Arc, time::Duration};

use pipes_common::TerimateSignal;
use rand::Rng;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::{
    channel::Channel,
    error::PipesError,
    item::Target,
    manager::Manager,
    task::{Envelope, PoisonPill, Task, TaskParams, POLLING_TIMEOUT},
    worker::{Worker, WorkerControl},
};

/// `number_of_processes` xor `fraction_of_cores`; defaults to one worker.
/// Ports the source's mutually-exclusive constructor parameters.
#[derive(Clone, Copy, Debug)]
pub enum PoolSize {
    Workers(usize),
    FractionOfCores(f64),
}

impl PoolSize {
    fn resolve(self) -> Result<usize, PipesError> {
        match self {
            PoolSize::Workers(n) if n == 0 => {
                Err(PipesError::InvalidTopology("number_of_processes must be > 0".into()))
            }
            PoolSize::Workers(n) => Ok(n),
            PoolSize::FractionOfCores(fraction) if fraction <= 0.0 => {
                Err(PipesError::InvalidTopology("fraction_of_cores must be > 0".into()))
            }
            // `ceil` guarantees at least one worker regardless of how small
            // the fraction or how few cores the host has.
            PoolSize::FractionOfCores(fraction) => {
                Ok((num_cpus::get() as f64 * fraction).ceil() as usize)
            }
        }
    }
}

impl Default for PoolSize {
    fn default() -> Self {
        PoolSize::Workers(1)
    }
}

pub struct NodeConfig<Tg: Target> {
    pub target: Arc<Tg>,
    pub name: Option<String>,
    pub pool_size: PoolSize,
    pub timeout: Option<Duration>,
    pub polling_timeout: Duration,
    pub max_execution_time: Option<Duration>,
    pub max_requests: Option<u64>,
}

impl<Tg: Target> NodeConfig<Tg> {
    pub fn new(target: Tg) -> Self {
        Self {
            target: Arc::new(target),
            name: None,
            pool_size: PoolSize::default(),
            timeout: None,
            polling_timeout: *POLLING_TIMEOUT,
            max_execution_time: None,
            max_requests: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn workers(mut self, count: usize) -> Self {
        self.pool_size = PoolSize::Workers(count);
        self
    }

    pub fn fraction_of_cores(mut self, fraction: f64) -> Self {
        self.pool_size = PoolSize::FractionOfCores(fraction);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_execution_time(mut self, budget: Duration) -> Self {
        self.max_execution_time = Some(budget);
        self
    }

    pub fn max_requests(mut self, max_requests: u64) -> Self {
        self.max_requests = Some(max_requests);
        self
    }
}

/// `max_requests + rand(-delta, +delta)` where `delta = round(max_requests *
/// 0.05)`, desynchronizing a pool's retirements. Ports
/// `node._randomize_max_requests`.
fn jittered_max_requests(max_requests: u64) -> u64 {
    let delta = (max_requests as f64 * 0.05).round() as i64;
    if delta == 0 {
        return max_requests;
    }
    let jitter = rand::thread_rng().gen_range(-delta..=delta);
    (max_requests as i64 + jitter).max(1) as u64
}

pub struct Node<Tg: Target> {
    config: NodeConfig<Tg>,
    indata: Option<Channel<Envelope<Tg::Input>>>,
    outdata: Option<Channel<Envelope<Tg::Output>>>,
    manager: Option<Manager>,
    process_namespace: String,
    workers: Vec<Arc<AsyncMutex<Worker<Tg>>>>,
    pool_sig: TerimateSignal,
}

impl<Tg: Target> Node<Tg> {
    pub fn new(
        config: NodeConfig<Tg>,
        indata: Option<Channel<Envelope<Tg::Input>>>,
        outdata: Option<Channel<Envelope<Tg::Output>>>,
        manager: Option<Manager>,
    ) -> Self {
        Self {
            config,
            indata,
            outdata,
            manager,
            process_namespace: "pipeline".to_string(),
            workers: Vec::new(),
            pool_sig: TerimateSignal::default(),
        }
    }

    pub fn name(&self) -> &str {
        self.config.name.as_deref().unwrap_or_else(|| self.config.target.name())
    }

    pub fn set_indata(&mut self, indata: Option<Channel<Envelope<Tg::Input>>>) {
        self.indata = indata;
    }

    pub fn set_outdata(&mut self, outdata: Option<Channel<Envelope<Tg::Output>>>) {
        self.outdata = outdata;
    }

    pub fn indata(&self) -> Option<&Channel<Envelope<Tg::Input>>> {
        self.indata.as_ref()
    }

    pub fn outdata(&self) -> Option<&Channel<Envelope<Tg::Output>>> {
        self.outdata.as_ref()
    }

    pub fn set_process_namespace(&mut self, namespace: impl Into<String>) {
        self.process_namespace = namespace.into();
    }

    /// Constructs a fresh blueprint (so per-worker state like
    /// `requests_count` resets) and spawns `N` Workers sharing it. Ports
    /// `Node.start`.
    pub fn start(&mut self) -> Result<(), PipesError> {
        let pool_size = self.config.pool_size.resolve()?;
        self.pool_sig = TerimateSignal::default();

        // Replace the pool outright: `Pipeline::restart` calls `start` again
        // on the same Node, and leftover handles from the previous pool must
        // not linger alongside the freshly spawned workers.
        let stale_uuids = self.worker_uuids();
        self.workers.clear();
        if let Some(manager) = &self.manager {
            for uuid in stale_uuids {
                manager.unregister_worker(uuid);
            }
        }

        let span_name = format!("{}:{}", self.process_namespace, self.name());
        tracing::debug!(node = %span_name, pool_size, "starting node");

        for _ in 0..pool_size {
            let target = self.config.target.clone();
            let indata = self.indata.clone();
            let outdata = self.outdata.clone();
            let timeout = self.config.timeout;
            let max_execution_time = self.config.max_execution_time;
            let max_requests = self.config.max_requests.map(jittered_max_requests);
            let polling_timeout = self.config.polling_timeout;

            let manager_handle = self.manager.as_ref().map(Manager::downgrade);
            let worker = Worker::new(self.pool_sig.clone(), manager_handle, move |uuid, sig| {
                Task::new(
                    TaskParams {
                        target: target.clone(),
                        indata: indata.clone(),
                        outdata: outdata.clone(),
                        max_execution_time,
                        max_requests,
                        timeout,
                        polling_timeout,
                        session: uuid,
                    },
                    sig,
                )
            });

            let mut worker = worker;
            let uuid = worker.uuid();
            worker.start()?;
            let handle = Arc::new(AsyncMutex::new(worker));
            if let Some(manager) = &self.manager {
                manager.register_worker(uuid, handle.clone() as Arc<dyn WorkerControl>);
            }
            self.workers.push(handle);
        }

        Ok(())
    }

    /// Ports `Node.stop`: send one poison pill per worker into `indata`
    /// (each worker retires exactly the matching pill), then signal the
    /// shared pool-wide terminate sig as a backstop for workers that never
    /// got to read their pill (e.g. a saturated downstream).
    pub async fn stop(&self) {
        if let Some(indata) = &self.indata {
            for worker in &self.workers {
                let session = worker.lock().await.uuid();
                let _ = indata.put_async(Envelope::Pill(PoisonPill::for_session(session))).await;
            }
        }
        for worker in &self.workers {
            worker.lock().await.stop();
        }
    }

    pub async fn join(&mut self, timeout: Option<Duration>) -> Result<(), PipesError> {
        for worker in &self.workers {
            worker.lock().await.join(timeout).await?;
        }
        Ok(())
    }

    pub async fn terminate(&mut self) {
        for worker in &self.workers {
            worker.lock().await.terminate();
        }
    }

    pub async fn is_alive(&self) -> bool {
        for worker in &self.workers {
            if worker.lock().await.is_alive() {
                return true;
            }
        }
        false
    }

    /// Synchronous one-iteration debug mode: invokes the Task's `step`
    /// once without going through a spawned Worker. Used by
    /// `Pipeline::step` for deterministic testing. Only meaningful before
    /// `start` has spawned the real pool.
    pub async fn step_once(&self, session: Uuid) -> Result<(), PipesError> {
        let mut task = Task::new(
            TaskParams {
                target: self.config.target.clone(),
                indata: self.indata.clone(),
                outdata: self.outdata.clone(),
                max_execution_time: self.config.max_execution_time,
                max_requests: None,
                timeout: self.config.timeout,
                polling_timeout: self.config.polling_timeout,
                session,
            },
            TerimateSignal::default(),
        )?;
        task.step().await.map(|_| ())
    }

    pub fn worker_uuids(&self) -> Vec<Uuid> {
        self.workers.iter().map(|worker| worker.try_lock().map(|guard| guard.uuid())).filter_map(Result::ok).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        item::{FnTarget, Produced},
        manager::Manager,
        task::Envelope,
    };
    use std::{future::Future, pin::Pin};

    type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

    #[test]
    fn zero_workers_is_invalid_topology() {
        assert!(matches!(PoolSize::Workers(0).resolve(), Err(PipesError::InvalidTopology(_))));
    }

    #[test]
    fn fraction_of_cores_never_resolves_to_zero() {
        assert!(PoolSize::FractionOfCores(0.000_001).resolve().unwrap() >= 1);
    }

    #[test]
    fn jitter_stays_within_five_percent_and_never_hits_zero() {
        for _ in 0..200 {
            let jittered = jittered_max_requests(100);
            assert!((95..=105).contains(&jittered));
        }
        // A tiny quota still jitters to at least 1, never to 0.
        for _ in 0..200 {
            assert!(jittered_max_requests(1) >= 1);
        }
    }

    /// End-to-end max-requests recycling (spec.md §8 scenario 4), scaled
    /// down for test speed: a pool of 1 worker with a small quota and
    /// variance disabled (quota=20 keeps delta=round(20*0.05)=1, small
    /// enough that every run still completes well under the quota plus
    /// slack). Every pushed item is eventually produced; recycling via the
    /// Manager never drops the pool below its configured size.
    #[tokio::test]
    async fn max_requests_recycles_the_worker_without_losing_items() {
        let manager = Manager::new();
        let target = FnTarget::new("double", |input: Option<i64>, _timed_out: bool| {
            Box::pin(async move { Ok(Produced::from(input.map(|value| value * 2))) })
                as BoxFuture<'static, anyhow::Result<Produced<i64>>>
        });

        let indata: Channel<Envelope<i64>> = Channel::new(0);
        let outdata: Channel<Envelope<i64>> = Channel::new(0);
        let config = NodeConfig::new(target).workers(1).max_requests(20);
        let mut node =
            Node::new(config, Some(indata.clone()), Some(outdata.clone()), Some(manager));
        node.start().unwrap();

        const TOTAL: i64 = 200;
        for item in 0..TOTAL {
            indata.put_async(Envelope::Item(item)).await.unwrap();
        }

        let mut outputs = Vec::new();
        for _ in 0..TOTAL {
            match outdata.get_async(Some(Duration::from_secs(5))).await.unwrap() {
                Envelope::Item(value) => outputs.push(value),
                Envelope::Pill(_) => panic!("unexpected poison pill on outdata"),
            }
        }
        outputs.sort_unstable();
        assert_eq!(outputs, (0..TOTAL).map(|item| item * 2).collect::<Vec<_>>());

        // Pool size is invariant: recycling replaces the retired worker's
        // session in place rather than shrinking the pool.
        assert_eq!(node.workers.len(), 1);

        node.stop().await;
        node.join(Some(Duration::from_secs(2))).await.unwrap();
    }
}
