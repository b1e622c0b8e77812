use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use lazyloader_service::{LazyLoader, LoaderStats};
use lazyloader_service::config::LoaderConfig;
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{WorkloadsConfig, register_workloads};

fn quantile(sketch: &DDSketch, q: f64) -> Duration {
    let secs = sketch.quantile(q).ok().flatten().unwrap_or_default();
    Duration::from_secs_f64(secs)
}

/// Summarizes the tracked items.
///
/// Items that are still retrying keep their last error, so they count as "with errors" and not
/// as failed.
fn format_item_stats(stats: &LoaderStats) -> String {
    format!(
        "Items: {} total, {} loaded, {} loading, {} with errors",
        stats.total_items, stats.loaded_items, stats.loading_items, stats.error_items,
    )
}

pub async fn perform_stresstest(
    config: LoaderConfig,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let loader = LazyLoader::new("stresstest", config);
    register_workloads(&loader, &workloads.workloads);
    let _cleanup = loader.start_configured_cache_cleanup();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.workloads.len());
    for workload in workloads.workloads {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let loader = loader.clone();
        let workload = Arc::new(workload);
        let concurrency = workload.concurrency.max(1);

        let task = tokio::spawn(async move {
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let failures = Arc::new(AtomicUsize::new(0));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let workload = Arc::clone(&workload);
                        let loader = loader.clone();
                        let task_durations = Arc::clone(&task_durations);
                        let failures = Arc::clone(&failures);
                        let task_start = Instant::now();

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let ctx = sentry::TransactionContext::new("stresstest", "stresstest");
                        let transaction = hub.start_transaction(ctx);

                        let future = async move {
                            let id = workload.pick_id();
                            let result = loader
                                .load(&id, &workload.resource_type, workload.options())
                                .await;
                            if result.is_err() {
                                failures.fetch_add(1, Ordering::Relaxed);
                            }

                            transaction.finish();

                            task_durations
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .add(task_start.elapsed().as_secs_f64());

                            drop(permit);
                        };
                        let future = future.bind_hub(hub);

                        tokio::spawn(future);
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let task_durations: DDSketch = {
                let mut task_durations = task_durations
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                std::mem::take(&mut *task_durations)
            };

            (workload, task_durations, failures.load(Ordering::Relaxed))
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (workload, task_durations, failures) = task.context("workload task failed")?;

        let ops = task_durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!(
            "Workload {i} ({}, concurrency: {}): {ops} operations, {ops_ps:.2} ops/s, {failures} failed",
            workload.resource_type, workload.concurrency,
        );
        if ops == 0 {
            continue;
        }

        let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
        let p50 = quantile(&task_durations, 0.5);
        let p90 = quantile(&task_durations, 0.9);
        let p99 = quantile(&task_durations, 0.99);
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }
    println!();

    println!("{}", format_item_stats(&loader.stats()));
    let cache = loader.cache_stats();
    println!(
        "Cache: {} entries, {} expired entries evicted",
        cache.size, cache.expired_evictions,
    );

    Ok(())
}
