use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use rand::Rng;
use single_object_cache::{CacheError, SingleObjectCache, Spawned};
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{InputSpec, StressDriver, Workload, WorkloadsConfig};

type StressCache = SingleObjectCache<Spawned<StressDriver>>;

/// How requests of a workload ended.
#[derive(Debug, Default)]
struct Outcomes {
    values: AtomicUsize,
    cancelled: AtomicUsize,
    failed: AtomicUsize,
    abandoned: AtomicUsize,
    mismatched: AtomicUsize,
}

impl Outcomes {
    fn record(&self, input: &InputSpec, result: Result<Arc<usize>, CacheError>) {
        let counter = match result {
            Ok(value) if !input.fail && *value == input.name.len() => &self.values,
            Ok(value) => {
                tracing::error!(
                    input = %input.name,
                    value = *value,
                    "Request resolved to a wrong value"
                );
                &self.mismatched
            }
            Err(CacheError::Cancelled) => &self.cancelled,
            Err(CacheError::Failed(_)) if input.fail => &self.failed,
            Err(CacheError::Failed(err)) => {
                tracing::error!(input = %input.name, error = %err, "Request failed unexpectedly");
                &self.mismatched
            }
            Err(CacheError::Abandoned) => &self.abandoned,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct WorkloadReport {
    concurrency: usize,
    durations: DDSketch,
    outcomes: Arc<Outcomes>,
}

pub async fn perform_stresstest(workloads: WorkloadsConfig, duration: Duration) -> Result<()> {
    let workloads: Vec<_> = workloads
        .workloads
        .into_iter()
        .map(|workload| {
            let cache = SingleObjectCache::new(Spawned::current(StressDriver::new(
                workload.cooperative,
            )));
            let inputs: Arc<[Arc<InputSpec>]> =
                workload.inputs.iter().cloned().map(Arc::new).collect();
            (workload, cache, inputs)
        })
        .collect();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for (workload, cache, inputs) in workloads {
        let deadline = tokio::time::Instant::now() + duration;
        tasks.push(tokio::spawn(run_workload(workload, cache, inputs, deadline)));
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    let mut broken = 0;
    for (i, task) in finished_tasks.into_iter().enumerate() {
        let report = task?;
        broken += print_report(i, &report, duration);
    }

    anyhow::ensure!(broken == 0, "{broken} requests resolved incorrectly");
    Ok(())
}

async fn run_workload(
    workload: Workload,
    cache: StressCache,
    inputs: Arc<[Arc<InputSpec>]>,
    deadline: tokio::time::Instant,
) -> WorkloadReport {
    let concurrency = workload.concurrency;
    let task_durations = Arc::new(Mutex::new(DDSketch::default()));
    let outcomes = Arc::new(Outcomes::default());
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
                let (input, late_cancel) = {
                    let mut rng = rand::rng();
                    let input = &inputs[rng.random_range(0..inputs.len())];
                    (Arc::clone(input), rng.random_bool(workload.late_cancel_ratio))
                };
                let cache = cache.clone();
                let task_durations = Arc::clone(&task_durations);
                let outcomes = Arc::clone(&outcomes);
                let task_start = Instant::now();

                tokio::spawn(async move {
                    let cancelled = Arc::new(AtomicBool::new(false));
                    let completion = cache.request(Arc::clone(&input), {
                        let cancelled = Arc::clone(&cancelled);
                        move || cancelled.load(Ordering::Relaxed)
                    });

                    // losing interest after registering must not affect the result
                    if late_cancel {
                        tokio::task::yield_now().await;
                        cancelled.store(true, Ordering::Relaxed);
                    }

                    outcomes.record(&input, completion.await);
                    if let Ok(mut task_durations) = task_durations.lock() {
                        task_durations.add(task_start.elapsed().as_secs_f64());
                    }

                    drop(permit);
                });
            }
            _ = &mut sleep => {
                break;
            }
        }
    }

    // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
    let _permits = semaphore.acquire_many(concurrency as u32).await;

    let durations = match task_durations.lock() {
        Ok(mut task_durations) => std::mem::take(&mut *task_durations),
        Err(_) => DDSketch::default(),
    };
    tracing::debug!(cache = ?cache, "Workload finished");

    WorkloadReport {
        concurrency,
        durations,
        outcomes,
    }
}

/// Prints the results of one workload and returns the number of incorrect resolutions.
fn print_report(i: usize, report: &WorkloadReport, duration: Duration) -> usize {
    let WorkloadReport {
        concurrency,
        durations,
        outcomes,
    } = report;

    let ops = durations.count();
    let ops_ps = ops as f64 / duration.as_secs_f64();
    println!("Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");

    if ops > 0 {
        let quantile = |q| {
            let secs = durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs)
        };
        let avg = Duration::from_secs_f64(durations.sum().unwrap_or_default() / ops as f64);
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    let mismatched = outcomes.mismatched.load(Ordering::Relaxed);
    let abandoned = outcomes.abandoned.load(Ordering::Relaxed);
    println!(
        "  values: {}; cancelled: {}; failed: {}; abandoned: {abandoned}; mismatched: {mismatched}",
        outcomes.values.load(Ordering::Relaxed),
        outcomes.cancelled.load(Ordering::Relaxed),
        outcomes.failed.load(Ordering::Relaxed),
    );

    mismatched + abandoned
}
