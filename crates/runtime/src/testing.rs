//! Deterministic `Runtime` for tests: wall-clock sleeps are driven by
//! Tokio's paused/mocked clock (`tokio::time::advance`) instead of the real
//! clock, and the RNG is seeded so a failing test is reproducible.
use std::{
    future::Future,
    pin::Pin,
    time::SystemTime,
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
use parking_lot::Mutex;
use rand::{
    rngs::StdRng,
    SeedableRng,
};
use std::sync::Arc;
use tokio::time::{
    Duration,
    Instant,
};

pub struct TestFutureHandle {
    handle: tokio::task::JoinHandle<()>,
}

impl SpawnHandle for TestFutureHandle {
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

/// A `Runtime` for use under `#[tokio::test(start_paused = true)]`. Time
/// only advances when the test calls `tokio::time::advance`, so tests that
/// exercise backoffs or cache TTLs run instantly and deterministically.
#[derive(Clone)]
pub struct TestRuntime {
    rng: Arc<Mutex<StdRng>>,
}

impl TestRuntime {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }
}

impl Default for TestRuntime {
    fn default() -> Self {
        Self::new(0)
    }
}

#[async_trait]
impl Runtime for TestRuntime {
    type Handle = TestFutureHandle;
    type Instant = TestInstant;
    type Rng = StdRng;

    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>> {
        Box::pin(tokio::time::sleep(duration).fuse())
    }

    fn spawn(
        &self,
        name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> TestFutureHandle {
        tracing::debug!("spawning test task {name}");
        TestFutureHandle {
            handle: tokio::task::spawn(f),
        }
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    fn monotonic_now(&self) -> TestInstant {
        TestInstant(Instant::now())
    }

    fn with_rng<R>(&self, f: impl FnOnce(&mut Self::Rng) -> R) -> R {
        f(&mut self.rng.lock())
    }
}

#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub struct TestInstant(Instant);

impl RuntimeInstant for TestInstant {
    fn elapsed(&self) -> Duration {
        self.0.elapsed()
    }
}
