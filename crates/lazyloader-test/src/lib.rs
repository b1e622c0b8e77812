//! Helpers for testing loaders.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Tests depending on latencies, timeouts or retry delays should run with a paused clock
//!    (`#[tokio::test(start_paused = true)]`), so that time only advances while every task is
//!    idle. [`TestLoader`] sleeps on the tokio clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `lazyloader-service` crate and
///    mutes all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("lazyloader_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// The error returned by a failing [`TestLoader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("attempt {0} failed")]
pub struct TestError(pub usize);

#[derive(Debug, Clone, Copy, Default)]
struct Behavior {
    latency: Option<Duration>,
    fail_first: usize,
    fail_always: bool,
    hang: bool,
}

#[derive(Debug, Default)]
struct Counters {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    call_order: Mutex<Vec<String>>,
}

/// Tracks a running call, for the whole lifetime of the call future.
struct InFlight<'a>(&'a Counters);

impl<'a> InFlight<'a> {
    fn enter(counters: &'a Counters) -> Self {
        let current = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_in_flight.fetch_max(current, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A scripted loader that records how it is called.
///
/// The `n`-th call overall (starting at `1`) for id `id` resolves to `"{id}#{n}"`, unless the
/// loader is set up to fail that call, in which case it resolves to [`TestError(n)`](TestError).
///
/// Clones share their counters.
#[derive(Debug, Clone, Default)]
pub struct TestLoader {
    behavior: Behavior,
    counters: Arc<Counters>,
}

impl TestLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call take `latency` before it settles.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.behavior.latency = Some(latency);
        self
    }

    /// Makes the first `n` calls fail.
    pub fn failing_first(mut self, n: usize) -> Self {
        self.behavior.fail_first = n;
        self
    }

    /// Makes every call fail.
    pub fn failing_always(mut self) -> Self {
        self.behavior.fail_always = true;
        self
    }

    /// Makes every call pend forever.
    pub fn hanging(mut self) -> Self {
        self.behavior.hang = true;
        self
    }

    pub async fn load(&self, id: String) -> Result<String, TestError> {
        let counters = &*self.counters;
        let n = counters.calls.fetch_add(1, Ordering::SeqCst) + 1;
        counters
            .call_order
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id.clone());
        let _in_flight = InFlight::enter(counters);

        if self.behavior.hang {
            std::future::pending::<()>().await;
        }
        if let Some(latency) = self.behavior.latency {
            tokio::time::sleep(latency).await;
        }

        if self.behavior.fail_always || n <= self.behavior.fail_first {
            Err(TestError(n))
        } else {
            Ok(format!("{id}#{n}"))
        }
    }

    /// A loader function to register with a loader.
    pub fn loader_fn(
        &self,
    ) -> impl Fn(String) -> BoxFuture<'static, Result<String, TestError>> + Send + Sync + 'static
    {
        let loader = self.clone();
        move |id| {
            let loader = loader.clone();
            async move { loader.load(id).await }.boxed()
        }
    }

    /// The number of calls so far.
    pub fn calls(&self) -> usize {
        self.counters.calls.load(Ordering::SeqCst)
    }

    /// The number of calls that have not settled or been dropped yet.
    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::SeqCst)
    }

    /// The highest number of calls that were in flight at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.counters.max_in_flight.load(Ordering::SeqCst)
    }

    /// The ids of all calls, in the order the calls were made.
    pub fn call_order(&self) -> Vec<String> {
        self.counters
            .call_order
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
