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

use uuid::Uuid;

/// The error taxonomy, matching `multipipes.exceptions` plus the
/// construction-time failures the source raises as plain `ValueError`s.
#[derive(Debug, thiserror::Error)]
pub enum PipesError {
    /// Two explicit channels adjacent in a pipeline item list, or an
    /// inconsistent/invalid worker-count configuration.
    #[error("invalid pipeline topology: {0}")]
    InvalidTopology(String),

    /// A `Task` was given a `timeout` but its target does not accept one.
    #[error("task target does not accept a timeout parameter")]
    TimeoutNotSupported,

    /// A target invocation exceeded its `max_execution_time` budget.
    #[error("target invocation exceeded its execution deadline")]
    DeadlineExceeded,

    /// A worker's quota of processed items has been reached. Consumed
    /// internally by `Task::run_forever`; never observed by library users.
    #[error("worker {0} reached its max_requests quota")]
    MaxRequests(Uuid),

    /// A matching poison pill was consumed. Not a failure; used internally
    /// to unwind `Task::run_forever` cleanly.
    #[error("poison pill consumed")]
    PoisonConsumed,

    /// Any other error raised by a target invocation.
    #[error(transparent)]
    Target(#[from] anyhow::Error),
}

pub type PipesResult<T> = Result<T, PipesError>;
