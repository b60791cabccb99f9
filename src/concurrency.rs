use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::{anyhow, Result};
use crossbeam_channel::bounded;

use crate::builder::PipelineRuntime;
use crate::config::{ExecutorKind, RepocapsuleConfig};

/// Resolved executor settings: worker-pool size and the bounded in-flight
/// window providing backpressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorConfig {
    pub kind: ExecutorKind,
    pub max_workers: usize,
    pub window: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let workers = default_workers();
        Self {
            kind: ExecutorKind::Thread,
            max_workers: workers,
            window: workers * 2,
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Resolve `(executor_config, fail_fast)` from the declarative pipeline
/// section. `auto` picks the process-style backend only when the runtime
/// carries both heavy bytes handlers (pdf and evtx) and at least one
/// heavy-tagged source; on this implementation both kinds run on threads
/// and `process` only implies eager record materialization.
pub fn resolve_pipeline_executor_config(
    cfg: &RepocapsuleConfig,
    runtime: Option<&PipelineRuntime>,
) -> (ExecutorConfig, bool) {
    let max_workers = if cfg.pipeline.max_workers == 0 {
        default_workers()
    } else {
        cfg.pipeline.max_workers
    };
    let window = cfg.pipeline.submit_window.max(max_workers);

    let kind = match cfg.pipeline.executor_kind {
        ExecutorKind::Thread => ExecutorKind::Thread,
        ExecutorKind::Process => ExecutorKind::Process,
        ExecutorKind::Auto => {
            let heavy = runtime
                .map(|rt| {
                    let names: Vec<&str> =
                        rt.bytes_handlers.iter().map(|h| h.name()).collect();
                    let heavy_handlers =
                        names.contains(&"pdf") && names.contains(&"evtx");
                    let heavy_source = rt.sources.iter().any(|s| s.is_heavy());
                    heavy_handlers && heavy_source
                })
                .unwrap_or(false);
            if heavy {
                ExecutorKind::Process
            } else {
                ExecutorKind::Thread
            }
        }
    };

    (
        ExecutorConfig {
            kind,
            max_workers,
            window,
        },
        cfg.pipeline.fail_fast,
    )
}

/// Counters reported by a parallel run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorOutcome {
    pub completed: usize,
    pub worker_errors: usize,
    pub submit_errors: usize,
}

/// Run `process_one` over `items` on a worker pool with a bounded in-flight
/// window, handing results to `write_records` on the calling thread in
/// completion order.
///
/// A single producer feeds a bounded channel (the backpressure point);
/// `max_workers` workers pull from it; the calling thread is the single
/// consumer, which serializes all sink writes. With `fail_fast`, the first
/// worker error aborts the run and drains the pool; otherwise errors are
/// counted via `on_worker_error` and the run continues.
pub fn process_items_parallel<I, T, R, F, W, E>(
    items: I,
    process_one: F,
    mut write_records: W,
    exec: &ExecutorConfig,
    fail_fast: bool,
    mut on_worker_error: E,
) -> Result<ExecutorOutcome>
where
    I: Iterator<Item = T> + Send,
    T: Send,
    R: Send,
    F: Fn(T) -> Result<R> + Sync,
    W: FnMut(R),
    E: FnMut(&anyhow::Error),
{
    let mut outcome = ExecutorOutcome::default();

    // Degenerate pool: run inline on the calling thread.
    if exec.max_workers <= 1 {
        for item in items {
            match process_one(item) {
                Ok(r) => {
                    write_records(r);
                    outcome.completed += 1;
                }
                Err(e) => {
                    outcome.worker_errors += 1;
                    on_worker_error(&e);
                    if fail_fast {
                        return Err(anyhow!("aborting after worker error: {e}"));
                    }
                }
            }
        }
        return Ok(outcome);
    }

    let window = exec.window.max(exec.max_workers);
    let abort = AtomicBool::new(false);
    let submit_failures = AtomicUsize::new(0);
    let mut first_error: Option<String> = None;

    std::thread::scope(|scope| {
        let (work_tx, work_rx) = bounded::<T>(window);
        let (result_tx, result_rx) = bounded::<Result<R>>(window);

        for _ in 0..exec.max_workers {
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            let abort = &abort;
            let process_one = &process_one;
            scope.spawn(move || {
                for item in work_rx.iter() {
                    if abort.load(Ordering::Relaxed) {
                        break;
                    }
                    let out = process_one(item);
                    if result_tx.send(out).is_err() {
                        break;
                    }
                }
            });
        }
        drop(work_rx);
        drop(result_tx);

        {
            let abort = &abort;
            let submit_failures = &submit_failures;
            scope.spawn(move || {
                for item in items {
                    if abort.load(Ordering::Relaxed) {
                        break;
                    }
                    // Blocks when the window is full: backpressure.
                    if work_tx.send(item).is_err() {
                        submit_failures.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                }
                drop(work_tx);
            });
        }

        for out in result_rx.iter() {
            match out {
                Ok(r) => {
                    write_records(r);
                    outcome.completed += 1;
                }
                Err(e) => {
                    outcome.worker_errors += 1;
                    on_worker_error(&e);
                    if fail_fast {
                        first_error = Some(e.to_string());
                        abort.store(true, Ordering::Relaxed);
                        break;
                    }
                }
            }
        }
        // Leaving the scope drains the channels: workers see the closed
        // result channel or the abort flag and exit; the scope joins them.
        drop(result_rx);
    });

    outcome.submit_errors = submit_failures.load(Ordering::Relaxed);
    if let Some(msg) = first_error {
        return Err(anyhow!("aborting after worker error: {msg}"));
    }
    Ok(outcome)
}
