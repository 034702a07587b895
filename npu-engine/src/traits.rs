// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! A set of common traits used across the engine.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;

use crate::types::SimResult;

pub type BoxFuture<'a, T> = Pin<std::boxed::Box<dyn Future<Output = T> + 'a>>;

/// Something a task can wait on.
///
/// Each call to `listen` returns an independent future, so several tasks can
/// wait on the same event.
pub trait Event<T> {
    #[must_use = "Futures do nothing unless you `.await` or otherwise use them"]
    fn listen(&self) -> BoxFuture<'static, T>;
}

/// A long-running part of the model that is spawned when the simulation
/// starts.
#[async_trait(?Send)]
pub trait Runnable {
    async fn run(&self) -> SimResult;
}
