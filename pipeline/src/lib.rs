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

// This software includes code developed by QuerentAI LLC (https://querent.xyz).

#![deny(clippy::disallowed_methods)]

//! `pipes` composes multi-stage data-processing pipelines whose stages run
//! concurrently and independently of one another.
//!
//! A [`Pipeline`] is an ordered chain of [`Node`]s (each a pool of
//! [`Worker`]s sharing one [`Target`] and a pair of [`Channel`]s) connected
//! by bounded FIFO channels. Items flow downstream; a [`Manager`] receives
//! lifecycle events (`max_requests`, exceptions) from every worker and
//! applies supervision policy (recycle, restart, record).
//!
//! ```text
//! producer -> [Node: parse]-> [Node: enrich (x4 workers)] -> [Node: sink] -> consumer
//! ```
//!
//! Modules, leaves first: [`deadline`] (a scoped wall-clock budget around one
//! target invocation), [`channel`] (the bounded FIFO connecting stages),
//! [`task`] (one worker's pull/invoke/push run-loop), [`worker`] (the
//! execution unit driving a `Task`), [`node`] (a stage's worker pool),
//! [`pipeline`] (wiring and pipeline-wide lifecycle), [`manager`] (the
//! supervisor), and [`item`] (the `Target`/`Produced` adapter that stands in
//! for the source's runtime signature inspection).

mod channel;
mod deadline;
mod error;
mod item;
mod manager;
pub mod metrics;
mod node;
mod pipeline;
mod task;
mod worker;

pub use channel::{Channel, RecvTimeoutError, SendTimeoutError};
pub use deadline::guard as deadline_guard;
pub use error::{PipesError, PipesResult};
pub use item::{pass_through, AnyItem, ArcTarget, ErasedTarget, FnTarget, Produced, Target};
pub use manager::{
    DebugHooks, Event, EventKind, Manager, ManagerBuilder, TracingDebugHooks, WeakManagerHandle,
};
pub use node::{Node, NodeConfig, PoolSize};
pub use pipeline::{Pipeline, PipelineBuilder, SharedPipeline, Stage};
pub use task::{Envelope, PoisonPill, StepOutcome, Task, TaskParams, POLLING_TIMEOUT};
pub use worker::{Worker, WorkerControl};
