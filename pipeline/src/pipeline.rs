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

//! Wires an ordered list of stages (and optional explicit channels) into a
//! connected graph, and drives pipeline-wide lifecycle. Ports
//! `multipipes.pipeline.Pipeline`.

use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::{
    channel::Channel,
    error::PipesError,
    item::{AnyItem, ErasedTarget, Target},
    manager::Manager,
    node::{Node, NodeConfig},
    task::Envelope,
};

/// Default `stop` join budget, matching the source's `Pipeline.stop(timeout=30)`.
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Capacity used for a channel the wiring algorithm creates itself (no
/// explicit `Channel` given between two adjacent Nodes). spec.md does not
/// mandate a bound for this case; `pipes` defaults to unbounded, matching
/// `Channel::new`'s own default when no capacity is given.
const AUTO_CHANNEL_CAPACITY: usize = 0;

type AnyChannel = Channel<Envelope<AnyItem>>;

/// Object-safe view of a `Node<Tg>` that erases its `Target` type, so a
/// `Pipeline` can hold a heterogeneous chain of stages (a divide-by-pair
/// Node feeding an increment Node, say) in one `Vec`. Blanket-implemented
/// below for any `Node<Tg>` whose `Target::{Input,Output}` is `AnyItem` —
/// which is exactly what `ErasedTarget<Tg>` produces.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;
    fn set_process_namespace(&mut self, namespace: &str);
    fn set_indata(&mut self, indata: Option<AnyChannel>);
    fn set_outdata(&mut self, outdata: Option<AnyChannel>);
    fn indata(&self) -> Option<AnyChannel>;
    fn outdata(&self) -> Option<AnyChannel>;
    fn start(&mut self) -> Result<(), PipesError>;
    async fn stop(&self);
    async fn join(&mut self, timeout: Option<Duration>) -> Result<(), PipesError>;
    async fn terminate(&mut self);
    async fn is_alive(&self) -> bool;
    async fn step_once(&self, session: Uuid) -> Result<(), PipesError>;
}

#[async_trait]
impl<Tg> Stage for Node<Tg>
where
    Tg: Target<Input = AnyItem, Output = AnyItem>,
{
    fn name(&self) -> &str {
        Node::name(self)
    }

    fn set_process_namespace(&mut self, namespace: &str) {
        Node::set_process_namespace(self, namespace.to_string());
    }

    fn set_indata(&mut self, indata: Option<AnyChannel>) {
        Node::set_indata(self, indata);
    }

    fn set_outdata(&mut self, outdata: Option<AnyChannel>) {
        Node::set_outdata(self, outdata);
    }

    fn indata(&self) -> Option<AnyChannel> {
        Node::indata(self).cloned()
    }

    fn outdata(&self) -> Option<AnyChannel> {
        Node::outdata(self).cloned()
    }

    fn start(&mut self) -> Result<(), PipesError> {
        Node::start(self)
    }

    async fn stop(&self) {
        Node::stop(self).await
    }

    async fn join(&mut self, timeout: Option<Duration>) -> Result<(), PipesError> {
        Node::join(self, timeout).await
    }

    async fn terminate(&mut self) {
        Node::terminate(self).await
    }

    async fn is_alive(&self) -> bool {
        Node::is_alive(self).await
    }

    async fn step_once(&self, session: Uuid) -> Result<(), PipesError> {
        Node::step_once(self, session).await
    }
}

/// One entry of the declarative pipeline: a stage, or an explicit channel
/// meant to be used verbatim as the adjacent stage's `indata`/`outdata`.
enum PipelineItem {
    Node(Box<dyn Stage>),
    Channel(AnyChannel),
}

/// Builds the ordered `Node`/`Channel` list a [`Pipeline`] wires. Ports the
/// source's plain Python list of `Node`/`Pipe` instances with a typed
/// builder so adding a stage is a single call regardless of that stage's
/// concrete `Target` type.
pub struct PipelineBuilder {
    items: Vec<PipelineItem>,
    manager: Option<Manager>,
    process_namespace: String,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self { items: Vec::new(), manager: None, process_namespace: "pipeline".to_string() }
    }
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn manager(mut self, manager: Manager) -> Self {
        self.manager = Some(manager);
        self
    }

    pub fn process_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.process_namespace = namespace.into();
        self
    }

    /// Appends a stage built from `config`. The target is wrapped in
    /// [`ErasedTarget`] so the resulting `Node` can sit in the same `Vec` as
    /// Nodes of unrelated `Target` types.
    pub fn node<Tg: Target>(mut self, config: NodeConfig<Tg>) -> Self {
        let erased_config = NodeConfig {
            target: Arc::new(ErasedTarget::new(config.target)),
            name: config.name,
            pool_size: config.pool_size,
            timeout: config.timeout,
            polling_timeout: config.polling_timeout,
            max_execution_time: config.max_execution_time,
            max_requests: config.max_requests,
        };
        let node: Node<ErasedTarget<Tg>> =
            Node::new(erased_config, None, None, self.manager.clone());
        self.items.push(PipelineItem::Node(Box::new(node)));
        self
    }

    /// Appends an explicit channel. Two explicit channels with no stage
    /// between them is an `InvalidTopology` error, surfaced at `build`.
    pub fn channel(mut self, capacity: usize) -> Self {
        self.items.push(PipelineItem::Channel(Channel::new(capacity)));
        self
    }

    pub fn build(self) -> Result<Pipeline, PipesError> {
        let mut pipeline = Pipeline {
            items: self.items,
            manager: self.manager,
            process_namespace: self.process_namespace,
            setup_indata: None,
            setup_outdata: None,
        };
        pipeline.wire(None, None)?;
        Ok(pipeline)
    }
}

/// One spot in the wiring timeline: either an explicit channel, or a stage
/// identified by its index into `Pipeline::items`.
enum Slot {
    Channel(AnyChannel),
    Node(usize),
}

/// Ordered composition of stages (and optional explicit channels); wires
/// them into a connected graph and drives pipeline-wide lifecycle. Ports
/// `multipipes.pipeline.Pipeline`.
pub struct Pipeline {
    items: Vec<PipelineItem>,
    manager: Option<Manager>,
    process_namespace: String,
    /// Remembered from the last `setup` call so `restart` can rewire
    /// identically. Ports the source's `self.indata`/`self.outdata`.
    setup_indata: Option<AnyChannel>,
    setup_outdata: Option<AnyChannel>,
}

/// A `Pipeline` behind a handle that a `Manager`'s `restart_on_error` policy
/// can call back into without the `Manager` owning the `Pipeline` (the same
/// non-owning relationship spec.md §9 specifies for Worker → Manager).
pub type SharedPipeline = Arc<AsyncMutex<Pipeline>>;

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    pub fn process_namespace(&self) -> &str {
        &self.process_namespace
    }

    pub fn manager(&self) -> Option<&Manager> {
        self.manager.as_ref()
    }

    /// Ports `Pipeline.setup(indata, outdata)`: prepends/appends the
    /// caller-supplied channels so the head stage's `indata` and the tail
    /// stage's `outdata` are the pipeline's external I/O, and remembers
    /// them for `restart`.
    pub fn setup(
        &mut self,
        indata: Option<AnyChannel>,
        outdata: Option<AnyChannel>,
    ) -> Result<(), PipesError> {
        self.setup_indata = indata.clone();
        self.setup_outdata = outdata.clone();
        self.wire(indata, outdata)
    }

    /// Walks the declared items left-to-right, assigning each stage its
    /// `indata`/`outdata`. Ports the wiring algorithm of spec.md §4.6.
    fn wire(
        &mut self,
        indata: Option<AnyChannel>,
        outdata: Option<AnyChannel>,
    ) -> Result<(), PipesError> {
        let mut timeline: Vec<Slot> = Vec::with_capacity(self.items.len() + 2);
        if let Some(channel) = &indata {
            timeline.push(Slot::Channel(channel.clone()));
        }
        for (idx, item) in self.items.iter().enumerate() {
            match item {
                PipelineItem::Channel(channel) => timeline.push(Slot::Channel(channel.clone())),
                PipelineItem::Node(_) => timeline.push(Slot::Node(idx)),
            }
        }
        if let Some(channel) = &outdata {
            timeline.push(Slot::Channel(channel.clone()));
        }

        for pair in timeline.windows(2) {
            if let (Slot::Channel(_), Slot::Channel(_)) = (&pair[0], &pair[1]) {
                return Err(PipesError::InvalidTopology(
                    "two explicit channels may not be adjacent in a pipeline".to_string(),
                ));
            }
        }

        // Phase 1: each stage's indata is the explicit channel immediately
        // preceding it, a freshly-created channel if another stage
        // immediately precedes it instead, or `None` if it is the absolute
        // head of the timeline (spec.md's "false marker" for the source).
        let mut node_indata: HashMap<usize, Option<AnyChannel>> = HashMap::new();
        let mut seen_first_node = false;
        for (pos, slot) in timeline.iter().enumerate() {
            let Slot::Node(item_idx) = slot else { continue };
            let preceding_channel = match pos.checked_sub(1).and_then(|prev| timeline.get(prev)) {
                Some(Slot::Channel(channel)) => Some(channel.clone()),
                _ => None,
            };
            let resolved = match preceding_channel {
                Some(channel) => Some(channel),
                None if !seen_first_node => None,
                None => Some(Channel::new(AUTO_CHANNEL_CAPACITY)),
            };
            seen_first_node = true;
            node_indata.insert(*item_idx, resolved);
        }

        // Phase 2: a stage's outdata is whatever channel the next stage
        // down the timeline will use as its indata — the explicit channel
        // right after it, the fresh channel just computed for the next
        // stage, or `None` if nothing follows.
        let mut node_outdata: HashMap<usize, Option<AnyChannel>> = HashMap::new();
        for (pos, slot) in timeline.iter().enumerate() {
            let Slot::Node(item_idx) = slot else { continue };
            let resolved = match timeline.get(pos + 1) {
                None => None,
                Some(Slot::Channel(channel)) => Some(channel.clone()),
                Some(Slot::Node(next_idx)) => node_indata.get(next_idx).cloned().flatten(),
            };
            node_outdata.insert(*item_idx, resolved);
        }

        for (idx, item) in self.items.iter_mut().enumerate() {
            if let PipelineItem::Node(node) = item {
                node.set_indata(node_indata.get(&idx).cloned().flatten());
                node.set_outdata(node_outdata.get(&idx).cloned().flatten());
            }
        }
        Ok(())
    }

    fn nodes_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn Stage>> {
        self.items.iter_mut().filter_map(|item| match item {
            PipelineItem::Node(node) => Some(node),
            PipelineItem::Channel(_) => None,
        })
    }

    fn nodes(&self) -> impl Iterator<Item = &Box<dyn Stage>> {
        self.items.iter().filter_map(|item| match item {
            PipelineItem::Node(node) => Some(node),
            PipelineItem::Channel(_) => None,
        })
    }

    /// Starts every stage's worker pool. Ports `Pipeline.start`.
    pub fn start(&mut self) -> Result<(), PipesError> {
        let namespace = self.process_namespace.clone();
        tracing::info!(namespace = %namespace, "starting pipeline");
        for node in self.nodes_mut() {
            node.set_process_namespace(&namespace);
            node.start()?;
        }
        Ok(())
    }

    /// Sends one poison pill per worker into every stage's own `indata`
    /// (retiring exactly the matching worker), then joins each stage with
    /// `timeout` (defaulting to 30s), force-terminating any stage whose
    /// join doesn't complete in time. Ports `Pipeline.stop(timeout=30)`.
    pub async fn stop(&mut self, timeout: Option<Duration>) -> Result<(), PipesError> {
        let timeout = timeout.unwrap_or(DEFAULT_STOP_TIMEOUT);
        for node in self.nodes_mut() {
            node.stop().await;
        }
        for node in self.nodes_mut() {
            if node.join(Some(timeout)).await.is_err() {
                tracing::warn!(node = node.name(), "stage join timed out, forcing termination");
                node.terminate().await;
            }
        }
        Ok(())
    }

    pub async fn terminate(&mut self) {
        for node in self.nodes_mut() {
            node.terminate().await;
        }
    }

    pub async fn join(&mut self, timeout: Option<Duration>) -> Result<(), PipesError> {
        for node in self.nodes_mut() {
            node.join(timeout).await?;
        }
        Ok(())
    }

    /// True iff every stage reports alive. Ports `Pipeline.is_alive` ("all
    /// Nodes alive").
    pub async fn is_alive(&self) -> bool {
        for node in self.nodes() {
            if !node.is_alive().await {
                return false;
            }
        }
        true
    }

    /// Synchronous one-iteration debug mode: walks stages in declaration
    /// order and invokes each one's `Task::step` once, without going
    /// through a spawned worker pool. Ports `Pipeline.step`. Meaningful
    /// only before `start` has spawned the real pools.
    pub async fn step(&self) -> Result<(), PipesError> {
        for node in self.nodes() {
            node.step_once(Uuid::new_v4()).await?;
        }
        Ok(())
    }

    /// `stop` (or `terminate` if `hard`) then re-runs `setup`+`start` with
    /// the last remembered `(indata, outdata)` pair. Ports
    /// `Pipeline.restart(hard)`.
    pub async fn restart(&mut self, hard: bool) -> Result<(), PipesError> {
        if hard {
            self.terminate().await;
        } else {
            self.stop(None).await?;
        }
        let indata = self.setup_indata.clone();
        let outdata = self.setup_outdata.clone();
        self.wire(indata, outdata)?;
        self.start()
    }

    /// Wraps this pipeline in a shared handle and, if a `Manager` was
    /// attached, registers a weak-referenced restart callback so
    /// `restart_on_error` can call back into it without creating an
    /// ownership cycle (Manager never owns the Pipeline it restarts,
    /// mirroring the Worker → Manager back-reference in spec.md §9).
    pub fn into_shared(self) -> SharedPipeline {
        let manager = self.manager.clone();
        let shared: SharedPipeline = Arc::new(AsyncMutex::new(self));
        if let Some(manager) = manager {
            let weak = Arc::downgrade(&shared);
            manager.set_pipeline_restart(move || {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(strong) = weak.upgrade() else { return };
                    let mut pipeline = strong.lock().await;
                    if let Err(error) = pipeline.restart(false).await {
                        tracing::warn!(%error, "manager-triggered pipeline restart failed");
                    }
                })
            });
        }
        shared
    }
}

#[cfg(test)]
mod tests {
    use std::{future::Future, pin::Pin, sync::atomic::{AtomicI64, Ordering}, time::Duration};

    use crate::item::{FnTarget, Produced};

    use super::*;

    type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

    fn divide() -> FnTarget<
        (i64, i64),
        f64,
        impl Fn(Option<(i64, i64)>, bool) -> BoxFuture<'static, anyhow::Result<Produced<f64>>>
            + Send
            + Sync
            + 'static,
    > {
        FnTarget::new("divide", |input: Option<(i64, i64)>, _timed_out: bool| {
            Box::pin(async move {
                let (num, denom) = input.expect("divide is never called with a timeout tick");
                Ok(Produced::One(num as f64 / denom as f64))
            })
        })
    }

    fn increment() -> FnTarget<
        f64,
        f64,
        impl Fn(Option<f64>, bool) -> BoxFuture<'static, anyhow::Result<Produced<f64>>>
            + Send
            + Sync
            + 'static,
    > {
        FnTarget::new("increment", |input: Option<f64>, _timed_out: bool| {
            Box::pin(async move { Ok(Produced::One(input.unwrap_or(0.0) + 1.0)) })
        })
    }

    #[tokio::test]
    async fn wiring_shares_one_channel_between_adjacent_nodes() {
        let pipeline = Pipeline::builder()
            .node(NodeConfig::new(divide()))
            .node(NodeConfig::new(increment()))
            .build()
            .unwrap();
        assert_eq!(pipeline.items.len(), 2);
        let PipelineItem::Node(first) = &pipeline.items[0] else { panic!("expected a node") };
        let PipelineItem::Node(second) = &pipeline.items[1] else { panic!("expected a node") };
        assert!(first.indata().is_none(), "head stage has no indata");
        let shared = first.outdata().expect("head stage has an outdata");
        assert!(second.indata().is_some());
        assert_eq!(shared.len(), second.indata().unwrap().len());
        assert!(second.outdata().is_none(), "tail stage has no outdata");
    }

    #[tokio::test]
    async fn adjacent_explicit_channels_are_rejected() {
        let result = Pipeline::builder()
            .node(NodeConfig::new(divide()))
            .channel(0)
            .channel(0)
            .node(NodeConfig::new(increment()))
            .build();
        assert!(matches!(result, Err(PipesError::InvalidTopology(_))));
    }

    #[tokio::test]
    async fn sequential_transform_end_to_end() {
        let mut pipeline =
            Pipeline::builder().node(NodeConfig::new(divide())).node(NodeConfig::new(increment())).build().unwrap();

        let head: AnyChannel = Channel::new(0);
        let tail: AnyChannel = Channel::new(0);
        pipeline.setup(Some(head.clone()), Some(tail.clone())).unwrap();
        pipeline.start().unwrap();

        for (num, denom) in [(4i64, 1i64), (4, 2), (4, 4), (4, 8)] {
            head.put_async(Envelope::Item(Box::new((num, denom)) as AnyItem)).await.unwrap();
        }

        let mut outputs = Vec::new();
        for _ in 0..4 {
            match tail.get_async(Some(Duration::from_secs(2))).await.unwrap() {
                Envelope::Item(item) => outputs.push(*item.downcast::<f64>().unwrap()),
                Envelope::Pill(_) => panic!("unexpected poison pill on the output channel"),
            }
        }
        outputs.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(outputs, vec![1.5, 2.0, 3.0, 5.0]);

        pipeline.stop(None).await.unwrap();
        assert!(!pipeline.is_alive().await);
    }

    #[tokio::test]
    async fn multi_worker_pool_processes_every_item() {
        static COUNTER: AtomicI64 = AtomicI64::new(0);

        let target = FnTarget::new("double", |input: Option<i64>, _timed_out: bool| {
            Box::pin(async move {
                COUNTER.fetch_add(1, Ordering::SeqCst);
                Ok(Produced::One(input.unwrap_or(0) * 2))
            }) as BoxFuture<'static, anyhow::Result<Produced<i64>>>
        });

        let mut pipeline =
            Pipeline::builder().node(NodeConfig::new(target).workers(4)).build().unwrap();
        let head: AnyChannel = Channel::new(0);
        let tail: AnyChannel = Channel::new(0);
        pipeline.setup(Some(head.clone()), Some(tail.clone())).unwrap();
        pipeline.start().unwrap();

        for item in 0..20i64 {
            head.put_async(Envelope::Item(Box::new(item) as AnyItem)).await.unwrap();
        }

        let mut outputs = Vec::new();
        for _ in 0..20 {
            match tail.get_async(Some(Duration::from_secs(2))).await.unwrap() {
                Envelope::Item(item) => outputs.push(*item.downcast::<i64>().unwrap()),
                Envelope::Pill(_) => panic!("unexpected poison pill on the output channel"),
            }
        }
        outputs.sort_unstable();
        assert_eq!(outputs, (0..20i64).map(|item| item * 2).collect::<Vec<_>>());

        pipeline.stop(None).await.unwrap();
    }
}
