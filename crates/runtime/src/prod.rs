//! Production implementation of the `Runtime` trait: sleeps on the wall
//! clock, spawns onto a real Tokio executor, doesn't mock out anything.

use std::{
    future::Future,
    pin::Pin,
    sync::LazyLock,
    time::Instant,
};

use async_trait::async_trait;
use common::runtime::{
    JoinError,
    Runtime,
    RuntimeInstant,
    SpawnHandle,
};
use futures::{
    future::FusedFuture,
    FutureExt,
};
use rand::rngs::ThreadRng;
use tokio::{
    runtime::{
        Builder,
        Handle as TokioRuntimeHandle,
        Runtime as TokioRuntime,
    },
    time::{
        sleep,
        Duration,
    },
};

use std::time::SystemTime;

static INSTANT_EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Twice Rust's default thread stack size, to leave headroom for the deeply
/// nested futures the decoder/coalescer build up while processing a batch.
pub const STACK_SIZE: usize = 4 * 1024 * 1024;

pub struct FutureHandle {
    handle: tokio::task::JoinHandle<()>,
}

impl SpawnHandle for FutureHandle {
    type Future = Pin<Box<dyn Future<Output = Result<(), JoinError>> + Send>>;

    fn shutdown(&mut self) {
        self.handle.abort();
    }

    fn into_join_future(self) -> Self::Future {
        async move {
            match self.handle.await {
                Ok(()) => Ok(()),
                Err(e) if e.is_cancelled() => Err(JoinError::Canceled),
                Err(e) => Err(JoinError::Panicked(anyhow::anyhow!("{e}"))),
            }
        }
        .boxed()
    }
}

/// Runtime for running in production: sleeps for wall-clock time, spawns
/// real Tokio tasks, doesn't mock out any functionality.
#[derive(Clone)]
pub struct ProdRuntime {
    rt: TokioRuntimeHandle,
}

impl ProdRuntime {
    pub fn init_tokio() -> anyhow::Result<TokioRuntime> {
        assert!(
            TokioRuntimeHandle::try_current().is_err(),
            "Tried to create a `ProdRuntime` from within a Tokio context. Are you using \
             `#[tokio::main]` or `#[tokio::test]`?"
        );
        let mut tokio_builder = Builder::new_multi_thread();
        tokio_builder.thread_stack_size(STACK_SIZE);
        let tokio_rt = tokio_builder.enable_all().build()?;
        Ok(tokio_rt)
    }

    /// Create a new tokio-based runtime.
    ///
    /// Expected usage:
    /// ```rust
    /// use runtime::prod::ProdRuntime;
    /// fn main() -> anyhow::Result<()> {
    ///     let tokio = ProdRuntime::init_tokio()?;
    ///     let rt = ProdRuntime::new(&tokio);
    ///     rt.block_on(async {});
    ///     Ok(())
    /// }
    /// ```
    /// The `tokio_rt` should live for the duration of `main`; at the end of
    /// `main` its `Drop` impl joins all spawned futures, which should
    /// include every task spawned through this `ProdRuntime`.
    pub fn new(tokio_rt: &TokioRuntime) -> Self {
        Self {
            rt: tokio_rt.handle().clone(),
        }
    }

    pub fn block_on<F: Future>(&self, f: F) -> F::Output {
        self.rt.block_on(f)
    }
}

#[async_trait]
impl Runtime for ProdRuntime {
    type Handle = FutureHandle;
    type Instant = ProdInstant;
    type Rng = ThreadRng;

    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>> {
        Box::pin(sleep(duration).fuse())
    }

    fn spawn(
        &self,
        name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> FutureHandle {
        tracing::debug!("spawning task {name}");
        let handle = self.rt.spawn(f);
        FutureHandle { handle }
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    fn monotonic_now(&self) -> ProdInstant {
        ProdInstant(Instant::now())
    }

    fn with_rng<R>(&self, f: impl FnOnce(&mut Self::Rng) -> R) -> R {
        let mut rng = rand::rng();
        f(&mut rng)
    }
}

#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub struct ProdInstant(Instant);

impl RuntimeInstant for ProdInstant {
    fn elapsed(&self) -> Duration {
        self.0.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use common::runtime::Runtime;

    use super::ProdRuntime;

    #[test]
    fn wait_resolves_after_duration() {
        let tokio_rt = ProdRuntime::init_tokio().unwrap();
        let rt = ProdRuntime::new(&tokio_rt);
        rt.block_on(async {
            let start = rt.monotonic_now();
            rt.wait(Duration::from_millis(10)).await;
            assert!(start.elapsed() >= Duration::from_millis(10));
        });
    }
}
