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

use pipes_common::metrics::{new_counter, IntCounter};
use once_cell::sync::Lazy;

pub struct PipesMetrics {
    pub worker_restarts_total: IntCounter,
    pub worker_exceptions_total: IntCounter,
    pub items_processed_total: IntCounter,
}

impl Default for PipesMetrics {
    fn default() -> Self {
        PipesMetrics {
            worker_restarts_total: new_counter(
                "pipes_worker_restarts_total",
                "Total number of worker restarts issued by the manager.",
                "pipes",
            ),
            worker_exceptions_total: new_counter(
                "pipes_worker_exceptions_total",
                "Total number of exceptions raised by pipeline targets.",
                "pipes",
            ),
            items_processed_total: new_counter(
                "pipes_items_processed_total",
                "Total number of items successfully pushed to a stage's outdata.",
                "pipes",
            ),
        }
    }
}

pub static PIPES_METRICS: Lazy<PipesMetrics> = Lazy::new(PipesMetrics::default);
