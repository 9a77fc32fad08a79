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

//! A scoped wall-clock budget around a single future, replacing the
//! source's `SIGALRM`/`setitimer` based `deadline` context manager
//! (`multipipes.utils.deadline`), which does not compose with a
//! multi-threaded async runtime.

use std::time::Duration;

use crate::error::PipesError;

/// Runs `fut` to completion, or fails with [`PipesError::DeadlineExceeded`]
/// if it has not finished after `budget`. `budget` of `None` or zero
/// disables the guard entirely (the future runs unbounded), matching the
/// source's `if timeout:` guard around arming the itimer.
pub async fn guard<F, T>(budget: Option<Duration>, fut: F) -> Result<T, PipesError>
where
    F: std::future::Future<Output = T>,
{
    match budget {
        Some(budget) if !budget.is_zero() => {
            tokio::time::timeout(budget, fut).await.map_err(|_| PipesError::DeadlineExceeded)
        }
        _ => Ok(fut.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unbounded_when_no_budget() {
        let result = guard(None, async { 42 }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn passes_through_when_within_budget() {
        let result = guard(Some(Duration::from_millis(50)), async { 7 }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn fails_when_budget_exceeded() {
        let result = guard(Some(Duration::from_millis(10)), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            1
        })
        .await;
        assert!(matches!(result, Err(PipesError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn zero_budget_disables_guard() {
        let result = guard(Some(Duration::ZERO), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            9
        })
        .await;
        assert_eq!(result.unwrap(), 9);
    }
}
