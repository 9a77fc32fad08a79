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

//! One worker's run-loop: pull an input, invoke the target, push the
//! result(s), count the request. Ports `multipipes.task.Task`.

use std::time::Duration;

use pipes_common::TerimateSignal;
use uuid::Uuid;

use crate::{
    channel::{Channel, RecvTimeoutError},
    deadline,
    error::PipesError,
    item::Target,
};

/// Wall-clock granularity at which a blocking read re-checks for
/// cancellation. Overridable via `QW_PIPES_POLLING_MS`, mirroring
/// `actors::HEARTBEAT`'s env-tunable pattern.
pub static POLLING_TIMEOUT: once_cell::sync::Lazy<Duration> = once_cell::sync::Lazy::new(|| {
    let millis = std::env::var("QW_PIPES_POLLING_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(500);
    Duration::from_millis(millis)
});

/// A sentinel that retires exactly one worker: the one whose current
/// session uuid matches this pill's. A pill from a prior session (a stale
/// pill still in flight after a restart) is discarded instead of retiring
/// the new session's worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoisonPill {
    pub session: Uuid,
}

impl PoisonPill {
    pub fn for_session(session: Uuid) -> Self {
        Self { session }
    }
}

/// One item flowing through a channel: either a real payload, or a
/// [`PoisonPill`] possibly addressed to a different session.
///
/// Every channel in a pipeline — `indata` and `outdata` alike — carries
/// `Envelope<T>`, never bare `T`. This is what lets an upstream Node's
/// `outdata` literally be a downstream Node's `indata` (spec invariant 3):
/// the two fields have the same type, so the same `Channel` clone can be
/// handed to both sides by the wiring algorithm, and a Node's own `stop`
/// can address a pill at one of its own workers regardless of whether that
/// channel happens to be another Node's outdata too.
pub enum Envelope<T> {
    Item(T),
    Pill(PoisonPill),
}

pub struct TaskParams<Tg: Target> {
    pub target: std::sync::Arc<Tg>,
    pub indata: Option<Channel<Envelope<Tg::Input>>>,
    pub outdata: Option<Channel<Envelope<Tg::Output>>>,
    pub max_execution_time: Option<Duration>,
    pub max_requests: Option<u64>,
    pub timeout: Option<Duration>,
    pub polling_timeout: Duration,
    pub session: Uuid,
}

/// Outcome of `Task::run_forever` / `Task::step`, translated by the
/// enclosing `Worker` into a supervisor event.
pub enum StepOutcome {
    Continue,
    MaxRequests,
    PoisonConsumed,
    Stopped,
}

pub struct Task<Tg: Target> {
    target: std::sync::Arc<Tg>,
    indata: Option<Channel<Envelope<Tg::Input>>>,
    outdata: Option<Channel<Envelope<Tg::Output>>>,
    max_execution_time: Option<Duration>,
    max_requests: Option<u64>,
    timeout: Option<Duration>,
    polling_timeout: Duration,
    session: Uuid,
    requests_count: u64,
    terminate_sig: TerimateSignal,
}

impl<Tg: Target> Task<Tg> {
    pub fn new(params: TaskParams<Tg>, terminate_sig: TerimateSignal) -> Result<Self, PipesError> {
        if params.timeout.is_some() && !params.target.accepts_timeout() {
            return Err(PipesError::TimeoutNotSupported);
        }
        Ok(Self {
            target: params.target,
            indata: params.indata,
            outdata: params.outdata,
            max_execution_time: params.max_execution_time,
            max_requests: params.max_requests,
            timeout: params.timeout,
            polling_timeout: params.polling_timeout,
            session: params.session,
            requests_count: 0,
            terminate_sig,
        })
    }

    pub fn requests_count(&self) -> u64 {
        self.requests_count
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    pub fn is_source(&self) -> bool {
        self.indata.is_none()
    }

    /// Loops `step` until the terminate signal fires, a matching poison
    /// pill arrives, or the quota is reached. Ports `Task.run_forever`.
    #[tracing::instrument(skip(self), fields(target = self.target.name()))]
    pub async fn run_forever(&mut self) -> Result<(), PipesError> {
        loop {
            match self.step().await? {
                StepOutcome::Continue => continue,
                StepOutcome::MaxRequests => return Err(PipesError::MaxRequests(self.session)),
                StepOutcome::PoisonConsumed => return Err(PipesError::PoisonConsumed),
                StepOutcome::Stopped => return Ok(()),
            }
        }
    }

    /// Pull one input, invoke the target, push the output, count the
    /// request. Ports `Task.step`.
    pub async fn step(&mut self) -> Result<StepOutcome, PipesError> {
        let (input, timed_out) = match self.pull().await? {
            Pulled::Item(input) => (Some(input), false),
            Pulled::NoSource => (None, false),
            Pulled::TimedOut if self.target.accepts_timeout() => (None, true),
            // Target does not accept a timeout tick: push nothing, don't
            // count the step, just loop back around and pull again.
            Pulled::TimedOut => return Ok(StepOutcome::Continue),
            // Stale poison pill: discarded, worker keeps running.
            Pulled::Discarded => return Ok(StepOutcome::Continue),
            Pulled::Poison => return Ok(StepOutcome::PoisonConsumed),
            Pulled::Stopped => return Ok(StepOutcome::Stopped),
        };

        let produced = self.invoke(input, timed_out).await?;
        self.push(produced).await?;
        self.inc()
    }

    async fn invoke(
        &self,
        input: Option<Tg::Input>,
        timed_out: bool,
    ) -> Result<crate::item::Produced<Tg::Output>, PipesError> {
        deadline::guard(self.max_execution_time, self.target.call(input, timed_out))
            .await?
            .map_err(PipesError::Target)
    }

    async fn push(&self, produced: crate::item::Produced<Tg::Output>) -> Result<(), PipesError> {
        let Some(outdata) = &self.outdata else { return Ok(()) };
        for item in produced.into_vec() {
            outdata
                .put_async(Envelope::Item(item))
                .await
                .map_err(|_| PipesError::Target(anyhow::anyhow!("outdata channel disconnected")))?;
            crate::metrics::PIPES_METRICS.items_processed_total.inc();
        }
        Ok(())
    }

    fn inc(&mut self) -> Result<StepOutcome, PipesError> {
        self.requests_count += 1;
        if let Some(max_requests) = self.max_requests {
            if self.requests_count >= max_requests {
                return Ok(StepOutcome::MaxRequests);
            }
        }
        Ok(StepOutcome::Continue)
    }

    /// Ports `Task._read_from_indata` + `Task.pull`.
    async fn pull(&mut self) -> Result<Pulled<Tg::Input>, PipesError> {
        let Some(indata) = &self.indata else { return Ok(Pulled::NoSource) };

        let read = match self.timeout {
            Some(timeout) => self.read_with_timeout(indata, timeout).await?,
            None => self.read_polling_forever(indata).await?,
        };

        let envelope = match read {
            ReadOutcome::Got(envelope) => envelope,
            ReadOutcome::TimedOut => return Ok(Pulled::TimedOut),
            ReadOutcome::Stopped => return Ok(Pulled::Stopped),
        };

        match envelope {
            Envelope::Item(item) => Ok(Pulled::Item(item)),
            Envelope::Pill(pill) if pill.session == self.session => Ok(Pulled::Poison),
            Envelope::Pill(_stale) => Ok(Pulled::Discarded),
        }
    }

    /// `timeout` is a bounded read deadline: `floor(timeout /
    /// polling_timeout)` polling attempts, checking cancellation between
    /// each, then one final attempt for the remainder.
    async fn read_with_timeout(
        &self,
        indata: &Channel<Envelope<Tg::Input>>,
        timeout: Duration,
    ) -> Result<ReadOutcome<Tg::Input>, PipesError> {
        if timeout <= self.polling_timeout {
            return Ok(match indata.get_async(Some(timeout)).await {
                Ok(envelope) => ReadOutcome::Got(envelope),
                Err(RecvTimeoutError::Empty) => ReadOutcome::TimedOut,
                Err(RecvTimeoutError::Disconnected) => ReadOutcome::Stopped,
            });
        }

        let attempts = (timeout.as_secs_f64() / self.polling_timeout.as_secs_f64()).floor() as u32;
        // Not `timeout - attempts * polling_timeout`: spec.md §4.3 codifies the
        // source's literal `delta = self.timeout - self.polling_timeout`
        // verbatim (`multipipes.task.Task._read_from_indata`), a single
        // subtraction regardless of how many polling attempts preceded it.
        let remainder = timeout - self.polling_timeout;

        for _ in 0..attempts {
            match indata.get_async(Some(self.polling_timeout)).await {
                Ok(envelope) => return Ok(ReadOutcome::Got(envelope)),
                Err(RecvTimeoutError::Empty) => {
                    if self.terminate_sig.is_dead() {
                        return Ok(ReadOutcome::Stopped);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(ReadOutcome::Stopped),
            }
        }

        Ok(match indata.get_async(Some(remainder)).await {
            Ok(envelope) => ReadOutcome::Got(envelope),
            Err(RecvTimeoutError::Empty) => ReadOutcome::TimedOut,
            Err(RecvTimeoutError::Disconnected) => ReadOutcome::Stopped,
        })
    }

    /// `timeout` unset: poll forever at `polling_timeout` granularity,
    /// checking cancellation between attempts. Never produces a read
    /// timeout outcome; the only way out besides a value is cancellation.
    async fn read_polling_forever(
        &self,
        indata: &Channel<Envelope<Tg::Input>>,
    ) -> Result<ReadOutcome<Tg::Input>, PipesError> {
        loop {
            match indata.get_async(Some(self.polling_timeout)).await {
                Ok(envelope) => return Ok(ReadOutcome::Got(envelope)),
                Err(RecvTimeoutError::Empty) => {
                    if self.terminate_sig.is_dead() {
                        return Ok(ReadOutcome::Stopped);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(ReadOutcome::Stopped),
            }
        }
    }
}

enum ReadOutcome<T> {
    Got(Envelope<T>),
    TimedOut,
    Stopped,
}

enum Pulled<T> {
    Item(T),
    TimedOut,
    Discarded,
    Poison,
    Stopped,
    NoSource,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::Produced;

    struct Inc;

    #[async_trait::async_trait]
    impl Target for Inc {
        type Input = i64;
        type Output = i64;

        async fn call(&self, input: Option<i64>, _timed_out: bool) -> anyhow::Result<Produced<i64>> {
            Ok(Produced::One(input.unwrap_or(0) + 1))
        }

        fn name(&self) -> &str {
            "inc"
        }
    }

    fn make_task(
        indata: Option<Channel<Envelope<i64>>>,
        outdata: Option<Channel<Envelope<i64>>>,
    ) -> Task<Inc> {
        Task::new(
            TaskParams {
                target: std::sync::Arc::new(Inc),
                indata,
                outdata,
                max_execution_time: None,
                max_requests: None,
                timeout: None,
                polling_timeout: Duration::from_millis(20),
                session: Uuid::new_v4(),
            },
            TerimateSignal::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn step_pulls_invokes_and_pushes() {
        let indata = Channel::new(0);
        let outdata = Channel::new(0);
        indata.put_nowait(Envelope::Item(4)).unwrap();
        let mut task = make_task(Some(indata), Some(outdata.clone()));
        assert!(matches!(task.step().await.unwrap(), StepOutcome::Continue));
        assert_eq!(task.requests_count(), 1);
        assert!(matches!(outdata.get_nowait().unwrap(), Envelope::Item(5)));
    }

    #[tokio::test]
    async fn matching_poison_pill_stops_task_cleanly() {
        let indata = Channel::new(0);
        let session = Uuid::new_v4();
        indata.put_nowait(Envelope::Pill(PoisonPill::for_session(session))).unwrap();
        let mut task = Task::new(
            TaskParams {
                target: std::sync::Arc::new(Inc),
                indata: Some(indata),
                outdata: None,
                max_execution_time: None,
                max_requests: None,
                timeout: None,
                polling_timeout: Duration::from_millis(20),
                session,
            },
            TerimateSignal::default(),
        )
        .unwrap();
        assert!(matches!(task.step().await.unwrap(), StepOutcome::PoisonConsumed));
    }

    #[tokio::test]
    async fn stale_poison_pill_is_discarded_and_task_keeps_running() {
        let indata = Channel::new(0);
        let stale_session = Uuid::new_v4();
        indata.put_nowait(Envelope::Pill(PoisonPill::for_session(stale_session))).unwrap();
        indata.put_nowait(Envelope::Item(9)).unwrap();
        let mut task = make_task(Some(indata), Some(Channel::new(0)));
        // The stale pill is discarded without invoking the target.
        assert!(matches!(task.step().await.unwrap(), StepOutcome::Continue));
        assert_eq!(task.requests_count(), 0);
        assert!(matches!(task.step().await.unwrap(), StepOutcome::Continue));
        assert_eq!(task.requests_count(), 1);
    }

    #[tokio::test]
    async fn max_requests_reached_after_quota() {
        let indata = Channel::new(0);
        for item in 0..3 {
            indata.put_nowait(Envelope::Item(item)).unwrap();
        }
        let mut task = Task::new(
            TaskParams {
                target: std::sync::Arc::new(Inc),
                indata: Some(indata),
                outdata: Some(Channel::new(0)),
                max_execution_time: None,
                max_requests: Some(3),
                timeout: None,
                polling_timeout: Duration::from_millis(20),
                session: Uuid::new_v4(),
            },
            TerimateSignal::default(),
        )
        .unwrap();
        assert!(matches!(task.step().await.unwrap(), StepOutcome::Continue));
        assert!(matches!(task.step().await.unwrap(), StepOutcome::Continue));
        assert!(matches!(task.step().await.unwrap(), StepOutcome::MaxRequests));
    }

    #[tokio::test]
    async fn timeout_not_supported_rejected_at_construction() {
        let indata: Channel<Envelope<i64>> = Channel::new(0);
        let result = Task::new(
            TaskParams {
                target: std::sync::Arc::new(Inc),
                indata: Some(indata),
                outdata: None,
                max_execution_time: None,
                max_requests: None,
                timeout: Some(Duration::from_millis(100)),
                polling_timeout: Duration::from_millis(20),
                session: Uuid::new_v4(),
            },
            TerimateSignal::default(),
        );
        assert!(matches!(result, Err(PipesError::TimeoutNotSupported)));
    }

    struct Tick;

    #[async_trait::async_trait]
    impl Target for Tick {
        type Input = i64;
        type Output = i64;

        async fn call(&self, input: Option<i64>, timed_out: bool) -> anyhow::Result<Produced<i64>> {
            Ok(if timed_out { Produced::None } else { Produced::One(input.unwrap_or(0)) })
        }

        fn accepts_timeout(&self) -> bool {
            true
        }

        fn name(&self) -> &str {
            "tick"
        }
    }

    /// `read_with_timeout`'s final attempt waits `timeout - polling_timeout`,
    /// not `timeout - attempts * polling_timeout` — matching the source's
    /// `delta = self.timeout - self.polling_timeout` verbatim (see spec.md
    /// §4.3). With `polling_timeout=30ms, timeout=100ms` that's 3 polling
    /// attempts (90ms) plus a 70ms remainder, ~160ms total, not the ~100ms a
    /// "corrected" remainder would produce.
    #[tokio::test]
    async fn pull_timeout_decomposition_matches_source_delta_quirk() {
        let indata: Channel<Envelope<i64>> = Channel::new(0);
        let mut task = Task::new(
            TaskParams {
                target: std::sync::Arc::new(Tick),
                indata: Some(indata),
                outdata: None,
                max_execution_time: None,
                max_requests: None,
                timeout: Some(Duration::from_millis(100)),
                polling_timeout: Duration::from_millis(30),
                session: Uuid::new_v4(),
            },
            TerimateSignal::default(),
        )
        .unwrap();

        let started = std::time::Instant::now();
        assert!(matches!(task.step().await.unwrap(), StepOutcome::Continue));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(150), "elapsed was {elapsed:?}");
        assert!(elapsed < Duration::from_millis(400), "elapsed was {elapsed:?}");
    }
}
