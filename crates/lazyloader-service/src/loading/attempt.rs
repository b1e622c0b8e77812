use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::FutureExt;
use sentry::{Hub, SentryFutureExt};
use tokio_util::sync::CancellationToken;

use crate::utils::futures::{m, measure};

use super::{Inner, LoadError, LoadPhase, LoadResult};

/// A single dispatched attempt to load an item.
#[derive(Debug)]
pub(super) struct Attempt {
    pub id: String,
    pub epoch: u64,
    pub resource_type: String,
    pub timeout: Duration,
    pub token: CancellationToken,
}

/// Renders the payload of a caught panic.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("loader panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("loader panicked: {message}")
    } else {
        "loader panicked".into()
    }
}

impl<T: Clone + Send + Sync + 'static> Inner<T> {
    /// Runs `attempt` in the background and records its outcome.
    pub(super) fn spawn_attempt(self: &Arc<Self>, attempt: Attempt) {
        tracing::trace!(loader = %self.name, id = %attempt.id, "dispatching item");

        let inner = Arc::clone(self);
        let future = async move {
            let outcome = inner.execute(&attempt).await;
            inner.settle(attempt, outcome);
        };
        tokio::spawn(future.bind_hub(Hub::new_from_top(Hub::current())));
    }

    /// Calls the registered loader, bounded by the attempt's timeout.
    ///
    /// Returns `None` if the item was cleared before the loader settled, in which case the loader
    /// future has been dropped.
    async fn execute(&self, attempt: &Attempt) -> Option<LoadResult<T>> {
        let Some(loader) = self.registry.get(&attempt.resource_type) else {
            return Some(Err(LoadError::NoLoaderRegistered(
                attempt.resource_type.clone(),
            )));
        };

        // the loader itself is called inside the unwind boundary, it may panic before
        // returning its future
        let (id, token) = (attempt.id.clone(), attempt.token.clone());
        let load = async move {
            match AssertUnwindSafe(async move { loader(id, token).await })
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(payload) => Err(LoadError::LoaderFailed(panic_message(&*payload))),
            }
        };
        let load = measure(
            "loader.attempt",
            &self.name,
            m::timed_result,
            tokio::time::timeout(attempt.timeout, load),
        );

        tokio::select! {
            biased;
            _ = attempt.token.cancelled() => None,
            result = load => {
                Some(result.unwrap_or_else(|_| Err(LoadError::Timeout(attempt.timeout))))
            }
        }
    }

    /// Frees the attempt's slot, applies its outcome and dispatches whatever can run next.
    fn settle(self: &Arc<Self>, attempt: Attempt, outcome: Option<LoadResult<T>>) {
        if let Some(delay) = self.record(&attempt, outcome) {
            self.schedule_retry(attempt, delay);
        }
        self.drain();
    }

    /// Applies the outcome of an attempt to its item.
    ///
    /// Returns the delay after which the item should be queued again, if another attempt is due.
    pub(super) fn record(
        &self,
        attempt: &Attempt,
        outcome: Option<LoadResult<T>>,
    ) -> Option<Duration> {
        let mut guard = self.state();
        let state = &mut *guard;
        state.gate.release(attempt.epoch);

        let Some(outcome) = outcome else {
            tracing::trace!(loader = %self.name, id = %attempt.id, "attempt canceled");
            return None;
        };

        let status = match &outcome {
            Ok(_) => "ok",
            Err(error) => error.metrics_tag(),
        };
        metric!(
            counter("loader.attempt") += 1,
            "loader" => &self.name,
            "status" => status,
        );

        let slot = match state.items.get_mut(&attempt.id) {
            Some(slot) if slot.epoch == attempt.epoch => slot,
            _ => {
                tracing::debug!(
                    loader = %self.name,
                    id = %attempt.id,
                    "discarding result for an item that was cleared",
                );
                return None;
            }
        };

        match outcome {
            Ok(value) => {
                let ttl = slot.item.options.cache_ttl(&self.config);
                let deadline = self.cache.insert(slot.cache_key.clone(), value.clone(), ttl);
                slot.fresh_until = Some(deadline);

                slot.item.data = Some(value.clone());
                slot.item.error = None;
                slot.item.loaded_at = Some(SystemTime::now());
                slot.item.set_phase(LoadPhase::Loaded);
                slot.done.send_replace(Some(Ok(value)));

                tracing::debug!(
                    loader = %self.name,
                    id = %attempt.id,
                    attempts = slot.item.retry_count + 1,
                    "item loaded",
                );
                None
            }
            Err(error) => {
                slot.item.retry_count += 1;
                slot.item.error = Some(error.clone());

                let max_attempts = slot.item.options.max_attempts(&self.config);
                if slot.item.retry_count < max_attempts {
                    let delay = slot.item.options.retry_delay(&self.config);
                    slot.item.set_phase(LoadPhase::RetryPending);

                    metric!(counter("loader.retry") += 1, "loader" => &self.name);
                    tracing::debug!(
                        loader = %self.name,
                        id = %attempt.id,
                        attempt = slot.item.retry_count,
                        max_attempts,
                        ?delay,
                        error = &error as &dyn std::error::Error,
                        "attempt failed, retrying",
                    );
                    Some(delay)
                } else {
                    slot.item.set_phase(LoadPhase::Failed);
                    slot.done.send_replace(Some(Err(error.clone())));

                    metric!(
                        counter("loader.failed") += 1,
                        "loader" => &self.name,
                        "error" => error.metrics_tag(),
                    );
                    tracing::warn!(
                        loader = %self.name,
                        id = %attempt.id,
                        attempts = slot.item.retry_count,
                        error = &error as &dyn std::error::Error,
                        "failed to load item",
                    );
                    None
                }
            }
        }
    }

    /// Queues the item of `attempt` again once `delay` has passed.
    ///
    /// Nothing is queued if the item was cleared in the meantime.
    fn schedule_retry(self: &Arc<Self>, attempt: Attempt, delay: Duration) {
        let inner = Arc::clone(self);
        let future = async move {
            tokio::select! {
                biased;
                _ = attempt.token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if inner.requeue(&attempt) {
                inner.drain();
            }
        };
        tokio::spawn(future.bind_hub(Hub::new_from_top(Hub::current())));
    }

    pub(super) fn requeue(&self, attempt: &Attempt) -> bool {
        let mut guard = self.state();
        let state = &mut *guard;
        match state.items.get_mut(&attempt.id) {
            Some(slot)
                if slot.epoch == attempt.epoch && slot.item.phase == LoadPhase::RetryPending =>
            {
                slot.item.set_phase(LoadPhase::Queued);
                state
                    .queue
                    .push(attempt.id.clone(), attempt.epoch, slot.item.options.priority);
                true
            }
            _ => false,
        }
    }
}
