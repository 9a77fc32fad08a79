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

//! The [`Target`] trait adapts a user transformation into something a
//! [`crate::task::Task`] can drive without inspecting its signature at
//! runtime. This replaces the source's `inspect.signature` arity/keyword
//! probing with an explicit, statically-typed contract.

use std::{future::Future, pin::Pin, sync::Arc};

use async_trait::async_trait;

/// What a single target invocation produced.
///
/// Mirrors the source's push policy: `None` pushes nothing, `One` pushes a
/// single item, `Many` iterates a generator and pushes each element.
pub enum Produced<O> {
    None,
    One(O),
    Many(Vec<O>),
}

impl<O> Produced<O> {
    pub fn into_vec(self) -> Vec<O> {
        match self {
            Produced::None => Vec::new(),
            Produced::One(item) => vec![item],
            Produced::Many(items) => items,
        }
    }
}

impl<O> From<Option<O>> for Produced<O> {
    fn from(value: Option<O>) -> Self {
        match value {
            Some(item) => Produced::One(item),
            None => Produced::None,
        }
    }
}

/// A stage's transformation.
///
/// `call` receives `Some(input)` on a normal pull, or `None` when the pull
/// timed out and [`Target::accepts_timeout`] is true (the "tick" call from
/// spec §4.3). A target that does not accept timeouts is never called with
/// `None`; `Task` short-circuits that case to an empty [`Produced::None`]
/// without invoking the target at all.
#[async_trait]
pub trait Target: Send + Sync + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    async fn call(
        &self,
        input: Option<Self::Input>,
        timed_out: bool,
    ) -> anyhow::Result<Produced<Self::Output>>;

    /// True iff this target is willing to be invoked with `input = None` on
    /// a read timeout. Replaces the source's
    /// `all(param.default is not empty for param in params)` probe.
    fn accepts_timeout(&self) -> bool {
        false
    }

    /// Name used for the Node/Task's `process_namespace` span and default
    /// `Node::name`. Replaces the source's `target.__name__`.
    fn name(&self) -> &str {
        "target"
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Adapts a plain async closure into a [`Target`] so the common case needs
/// no boilerplate `impl` block.
pub struct FnTarget<I, O, F> {
    name: String,
    accepts_timeout: bool,
    func: F,
    _marker: std::marker::PhantomData<fn(I) -> O>,
}

impl<I, O, F, Fut> FnTarget<I, O, F>
where
    F: Fn(Option<I>, bool) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Produced<O>>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self { name: name.into(), accepts_timeout: false, func, _marker: std::marker::PhantomData }
    }

    pub fn accepting_timeout(mut self) -> Self {
        self.accepts_timeout = true;
        self
    }
}

#[async_trait]
impl<I, O, F, Fut> Target for FnTarget<I, O, F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(Option<I>, bool) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Produced<O>>> + Send + 'static,
{
    type Input = I;
    type Output = O;

    async fn call(&self, input: Option<I>, timed_out: bool) -> anyhow::Result<Produced<O>> {
        (self.func)(input, timed_out).await
    }

    fn accepts_timeout(&self) -> bool {
        self.accepts_timeout
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// `pass_through`, the source's default target for a `Node` constructed
/// without one (`multipipes.node.pass_through`).
pub fn pass_through<T: Send + 'static>() -> FnTarget<T, T, impl Fn(Option<T>, bool) -> BoxFuture<'static, anyhow::Result<Produced<T>>> + Send + Sync + 'static>
{
    FnTarget::new("pass_through", |input: Option<T>, _timed_out: bool| -> BoxFuture<'static, anyhow::Result<Produced<T>>> {
        Box::pin(async move { Ok(Produced::from(input)) })
    })
}

pub type ArcTarget<I, O> = Arc<dyn Target<Input = I, Output = O>>;

/// An opaque pipeline item, matching the source's dynamically-typed queue
/// contents (spec §3: "Item: opaque value carried through channels").
///
/// `pipes::pipeline` needs every stage's channel to share one concrete Rust
/// type so a heterogeneous chain of `Node<Tg1>`, `Node<Tg2>`, ... can live in
/// one `Vec` and be wired without the compiler needing to know each
/// adjacent pair's types line up; `AnyItem` plus [`ErasedTarget`] give it
/// that uniformity while a `Node` used standalone (outside a `Pipeline`)
/// keeps its own concrete `Target::Input`/`Target::Output`.
pub type AnyItem = Box<dyn std::any::Any + Send>;

/// Adapts a concretely-typed [`Target`] to [`AnyItem`] in/out, downcasting on
/// the way in and boxing on the way out. Used only by `pipes::pipeline` when
/// a `Node` is added to a `Pipeline`; a standalone `Node<Tg>` never needs it.
pub struct ErasedTarget<Tg: Target> {
    inner: Arc<Tg>,
}

impl<Tg: Target> ErasedTarget<Tg> {
    pub fn new(inner: Arc<Tg>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<Tg: Target> Target for ErasedTarget<Tg> {
    type Input = AnyItem;
    type Output = AnyItem;

    async fn call(
        &self,
        input: Option<AnyItem>,
        timed_out: bool,
    ) -> anyhow::Result<Produced<AnyItem>> {
        let typed_input = match input {
            Some(boxed) => Some(*boxed.downcast::<Tg::Input>().map_err(|_| {
                anyhow::anyhow!(
                    "pipeline item type mismatch feeding target `{}`",
                    self.inner.name()
                )
            })?),
            None => None,
        };
        let produced = self.inner.call(typed_input, timed_out).await?;
        Ok(match produced {
            Produced::None => Produced::None,
            Produced::One(item) => Produced::One(Box::new(item) as AnyItem),
            Produced::Many(items) => {
                Produced::Many(items.into_iter().map(|item| Box::new(item) as AnyItem).collect())
            }
        })
    }

    fn accepts_timeout(&self) -> bool {
        self.inner.accepts_timeout()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod erased_tests {
    use super::*;

    struct AddOne;

    #[async_trait]
    impl Target for AddOne {
        type Input = i64;
        type Output = i64;

        async fn call(&self, input: Option<i64>, _timed_out: bool) -> anyhow::Result<Produced<i64>> {
            Ok(Produced::One(input.unwrap_or(0) + 1))
        }

        fn name(&self) -> &str {
            "add_one"
        }
    }

    #[tokio::test]
    async fn erased_target_roundtrips_through_any() {
        let erased = ErasedTarget::new(Arc::new(AddOne));
        let input: AnyItem = Box::new(4i64);
        let produced = erased.call(Some(input), false).await.unwrap();
        let Produced::One(output) = produced else { panic!("expected a single item") };
        assert_eq!(*output.downcast::<i64>().unwrap(), 5);
    }

    #[tokio::test]
    async fn erased_target_rejects_mismatched_type() {
        let erased = ErasedTarget::new(Arc::new(AddOne));
        let input: AnyItem = Box::new("not an i64".to_string());
        assert!(erased.call(Some(input), false).await.is_err());
    }
}
