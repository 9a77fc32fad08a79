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

//! The bounded FIFO connecting adjacent stages (`Pipe` in the source). Built
//! on `flume`, which the actor runtime already uses for its own mailboxes
//! (`actors::messagebus::Inbox`).

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecvTimeoutError {
    #[error("channel is empty")]
    Empty,
    #[error("channel is disconnected")]
    Disconnected,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendTimeoutError {
    #[error("channel is full")]
    Full,
    #[error("channel is disconnected")]
    Disconnected,
}

/// A bounded (or unbounded, when constructed with `capacity = 0`)
/// multi-producer multi-consumer FIFO.
///
/// Cloning a `Channel` clones the underlying `flume` handles, so every
/// clone is just another handle to the same queue — this is what lets a
/// `Node`'s workers all share one `indata`/`outdata` pair, and what lets
/// `Pipeline` hand the same `Channel` to two adjacent `Node`s.
#[derive(Clone)]
pub struct Channel<T> {
    tx: flume::Sender<T>,
    rx: flume::Receiver<T>,
}

impl<T> Channel<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = if capacity == 0 {
            flume::unbounded()
        } else {
            flume::bounded(capacity)
        };
        Self { tx, rx }
    }

    pub fn put(&self, item: T, timeout: Option<Duration>) -> Result<(), SendTimeoutError> {
        match timeout {
            Some(timeout) => self.tx.send_timeout(item, timeout).map_err(|err| match err {
                flume::SendTimeoutError::Timeout(_) => SendTimeoutError::Full,
                flume::SendTimeoutError::Disconnected(_) => SendTimeoutError::Disconnected,
            }),
            None => self.tx.send(item).map_err(|_| SendTimeoutError::Disconnected),
        }
    }

    pub fn put_nowait(&self, item: T) -> Result<(), SendTimeoutError> {
        self.tx.try_send(item).map_err(|err| match err {
            flume::TrySendError::Full(_) => SendTimeoutError::Full,
            flume::TrySendError::Disconnected(_) => SendTimeoutError::Disconnected,
        })
    }

    pub fn get(&self, timeout: Option<Duration>) -> Result<T, RecvTimeoutError> {
        match timeout {
            Some(timeout) => self.rx.recv_timeout(timeout).map_err(|err| match err {
                flume::RecvTimeoutError::Timeout => RecvTimeoutError::Empty,
                flume::RecvTimeoutError::Disconnected => RecvTimeoutError::Disconnected,
            }),
            None => self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        }
    }

    pub fn get_nowait(&self) -> Result<T, RecvTimeoutError> {
        self.rx.try_recv().map_err(|err| match err {
            flume::TryRecvError::Empty => RecvTimeoutError::Empty,
            flume::TryRecvError::Disconnected => RecvTimeoutError::Disconnected,
        })
    }

    /// Async variant of [`Channel::get`], used by the Tokio-driven
    /// `Task::pull` loop so a blocked read never parks a worker thread.
    pub async fn get_async(&self, timeout: Option<Duration>) -> Result<T, RecvTimeoutError> {
        match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.rx.recv_async()).await {
                Ok(Ok(item)) => Ok(item),
                Ok(Err(_)) => Err(RecvTimeoutError::Disconnected),
                Err(_) => Err(RecvTimeoutError::Empty),
            },
            None => self.rx.recv_async().await.map_err(|_| RecvTimeoutError::Disconnected),
        }
    }

    pub async fn put_async(&self, item: T) -> Result<(), SendTimeoutError> {
        self.tx.send_async(item).await.map_err(|_| SendTimeoutError::Disconnected)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_channel_respects_capacity() {
        let channel = Channel::new(1);
        channel.put_nowait(1).unwrap();
        assert_eq!(channel.put_nowait(2), Err(SendTimeoutError::Full));
    }

    #[test]
    fn get_nowait_on_empty_channel_is_empty() {
        let channel: Channel<i32> = Channel::new(0);
        assert_eq!(channel.get_nowait(), Err(RecvTimeoutError::Empty));
    }

    #[test]
    fn fifo_order_is_preserved() {
        let channel = Channel::new(0);
        channel.put_nowait(1).unwrap();
        channel.put_nowait(2).unwrap();
        channel.put_nowait(3).unwrap();
        assert_eq!(channel.get_nowait(), Ok(1));
        assert_eq!(channel.get_nowait(), Ok(2));
        assert_eq!(channel.get_nowait(), Ok(3));
    }

    #[test]
    fn get_honors_timeout() {
        let channel: Channel<i32> = Channel::new(0);
        let started = std::time::Instant::now();
        let result = channel.get(Some(Duration::from_millis(20)));
        assert_eq!(result, Err(RecvTimeoutError::Empty));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn put_blocks_when_full_until_space_frees() {
        let channel = Channel::new(1);
        channel.put_nowait("a").unwrap();
        let channel2 = channel.clone();
        let handle = tokio::spawn(async move {
            channel2.put_async("b").await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        channel.get_nowait().unwrap();
        handle.await.unwrap();
    }
}
