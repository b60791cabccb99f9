use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::builder::{build_pipeline_plan, PipelineOverrides, PipelinePlan};
use crate::concurrency::process_items_parallel;
use crate::config::RepocapsuleConfig;
use crate::interfaces::{FileItem, RepoContext, RunContext, Source};
use crate::qc_controller::QCSummaryTracker;
use crate::records::Record;

/// Per-run counters; mutated only by the single consumer thread.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct PipelineStats {
    pub files: u64,
    pub records: u64,
    pub bytes_in: u64,
    pub skipped_hidden: u64,
    pub skipped_ext: u64,
    pub skipped_too_large: u64,
    pub source_errors: u64,
    pub sink_errors: u64,
    pub handler_errors: u64,
    pub ext_counts: BTreeMap<String, u64>,
    pub qc: Option<QCSummaryTracker>,
}

impl PipelineStats {
    pub fn as_value(&self) -> Value {
        json!({
            "files": self.files,
            "records": self.records,
            "bytes_in": self.bytes_in,
            "skipped_hidden": self.skipped_hidden,
            "skipped_ext": self.skipped_ext,
            "skipped_too_large": self.skipped_too_large,
            "source_errors": self.source_errors,
            "sink_errors": self.sink_errors,
            "handler_errors": self.handler_errors,
            "ext_counts": self.ext_counts,
        })
    }
}

// ------------------------
// Path predicates
// ------------------------

fn is_hidden(rel_path: &str) -> bool {
    rel_path
        .split('/')
        .any(|seg| seg.starts_with('.') && seg != "." && seg != "..")
}

fn normalize_exts(exts: &[String]) -> Vec<String> {
    exts.iter()
        .filter_map(|e| {
            let e = e.trim().to_lowercase();
            if e.is_empty() {
                return None;
            }
            Some(if e.starts_with('.') { e } else { format!(".{e}") })
        })
        .collect()
}

fn ext_key(rel_path: &str) -> String {
    std::path::Path::new(rel_path)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_else(|| "<none>".to_string())
}

fn should_skip_by_ext(rel_path: &str, include: &[String], exclude: &[String]) -> bool {
    let ext = ext_key(rel_path);
    if !include.is_empty() && !include.contains(&ext) {
        return true;
    }
    exclude.contains(&ext)
}

// ------------------------
// Item stream across sources
// ------------------------

#[derive(Default)]
struct SkipCounters {
    hidden: AtomicU64,
    ext: AtomicU64,
    too_large: AtomicU64,
    source_errors: AtomicU64,
}

/// Lazily chains the item iterators of all sources, attaching each source's
/// repo context, applying path/size filters, counting skips, and stopping
/// early on a source error when fail-fast is set.
struct SourceStream<'a> {
    remaining: std::slice::IterMut<'a, Box<dyn Source>>,
    current: Option<(
        Box<dyn Iterator<Item = Result<FileItem>> + Send + 'a>,
        Arc<Option<RepoContext>>,
    )>,
    default_ctx: Arc<Option<RepoContext>>,
    include: Vec<String>,
    exclude: Vec<String>,
    skip_hidden: bool,
    max_file_bytes: Option<u64>,
    counters: Arc<SkipCounters>,
    fail_fast: bool,
    aborted: Arc<AtomicBool>,
    stopped: bool,
}

impl<'a> Iterator for SourceStream<'a> {
    type Item = (FileItem, Arc<Option<RepoContext>>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.stopped {
                return None;
            }
            if self.current.is_none() {
                let source = self.remaining.next()?;
                let ctx = match source.context() {
                    Some(c) => Arc::new(Some(c)),
                    None => self.default_ctx.clone(),
                };
                let iter = source.iter_files();
                self.current = Some((iter, ctx));
            }
            let step = {
                let (iter, ctx) = self.current.as_mut().expect("active source");
                iter.next().map(|item| (item, ctx.clone()))
            };
            let Some((item, ctx)) = step else {
                self.current = None;
                continue;
            };
            let item = match item {
                Ok(item) => item,
                Err(e) => {
                    warn!("source error: {e}");
                    self.counters.source_errors.fetch_add(1, Ordering::Relaxed);
                    if self.fail_fast {
                        self.aborted.store(true, Ordering::Relaxed);
                        self.stopped = true;
                        return None;
                    }
                    continue;
                }
            };
            let rel = item.path.replace('\\', "/");
            if self.skip_hidden && is_hidden(&rel) {
                self.counters.hidden.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if should_skip_by_ext(&rel, &self.include, &self.exclude) {
                self.counters.ext.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if let Some(cap) = self.max_file_bytes {
                if item.effective_size() > cap {
                    self.counters.too_large.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            }
            return Some((FileItem { path: rel, ..item }, ctx));
        }
    }
}

/// Runs a built plan: opens sinks, streams items through the bounded
/// executor, threads every record through the lifecycle hooks, fans records
/// out to the sinks, and finalizes.
pub struct PipelineEngine {
    plan: PipelinePlan,
    stats: PipelineStats,
}

impl PipelineEngine {
    pub fn new(plan: PipelinePlan) -> Self {
        Self {
            plan,
            stats: PipelineStats::default(),
        }
    }

    pub fn config(&self) -> &RepocapsuleConfig {
        &self.plan.spec
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn plan_mut(&mut self) -> &mut PipelinePlan {
        &mut self.plan
    }

    pub fn run(&mut self) -> Result<PipelineStats> {
        self.stats = PipelineStats::default();
        let cfg = &self.plan.spec;
        let runtime = &mut self.plan.runtime;
        let stats = &mut self.stats;
        let primary_jsonl = cfg
            .sinks
            .primary_jsonl_name
            .clone()
            .or_else(|| cfg.metadata.primary_jsonl.clone());

        // 1) Open sinks; failures are excluded from the open set.
        let mut open_mask: Vec<bool> = Vec::with_capacity(runtime.sinks.len());
        for sink in runtime.sinks.iter_mut() {
            match sink.open(cfg.sinks.context.as_ref()) {
                Ok(()) => open_mask.push(true),
                Err(e) => {
                    warn!("sink failed to open: {e}");
                    stats.sink_errors += 1;
                    open_mask.push(false);
                }
            }
        }

        // 2) Run-start hooks.
        {
            let mut ctx = RunContext {
                cfg,
                stats: &mut *stats,
                sinks: &mut runtime.sinks,
                primary_jsonl: primary_jsonl.clone(),
            };
            for hook in runtime.lifecycle_hooks.iter_mut() {
                hook.on_run_start(&mut ctx);
            }
        }

        // 3) Stream items through the executor.
        let counters = Arc::new(SkipCounters::default());
        let aborted = Arc::new(AtomicBool::new(false));
        let default_ctx = Arc::new(cfg.sinks.context.clone());
        let stream = SourceStream {
            remaining: runtime.sources.iter_mut(),
            current: None,
            default_ctx,
            include: normalize_exts(&cfg.pipeline.include_exts),
            exclude: normalize_exts(&cfg.pipeline.exclude_exts),
            skip_hidden: cfg.pipeline.skip_hidden,
            max_file_bytes: cfg.pipeline.max_file_bytes,
            counters: counters.clone(),
            fail_fast: runtime.fail_fast,
            aborted: aborted.clone(),
            stopped: false,
        };

        let extractor = runtime.file_extractor.clone();
        let parallel_qc = runtime.parallel_qc.clone();
        let worker_pool_size = runtime.executor_config.max_workers;
        let scorer_pool: Option<Arc<std::sync::Mutex<Vec<Box<dyn crate::interfaces::QualityScorer>>>>> =
            parallel_qc.as_ref().map(|controller| {
                let clones = (0..worker_pool_size.max(1))
                    .map(|_| controller.clone_scorer())
                    .collect::<Vec<_>>();
                Arc::new(std::sync::Mutex::new(clones))
            });

        let process_one = {
            let extractor = extractor.clone();
            let parallel_qc = parallel_qc.clone();
            let scorer_pool = scorer_pool.clone();
            move |(item, ctx): (FileItem, Arc<Option<RepoContext>>)| -> Result<(FileItem, Vec<Record>)> {
                let mut records = extractor.extract(&item, cfg, ctx.as_ref().as_ref())?;
                if let (Some(controller), Some(pool)) = (&parallel_qc, &scorer_pool) {
                    let mut kept = Vec::with_capacity(records.len());
                    for record in records {
                        let scored = {
                            let scorer = pool.lock().expect("scorer pool lock").pop();
                            match scorer {
                                Some(mut scorer) => {
                                    let out = scorer.score_record(&record);
                                    pool.lock().expect("scorer pool lock").push(scorer);
                                    out
                                }
                                None => controller.clone_scorer().score_record(&record),
                            }
                        };
                        if let Some(record) = controller.apply_scored(record, scored)? {
                            kept.push(record);
                        }
                    }
                    records = kept;
                }
                Ok((item, records))
            }
        };

        let hooks = &mut runtime.lifecycle_hooks;
        let sinks = &mut runtime.sinks;
        let mut hook_failure: Option<anyhow::Error> = None;
        let sink_errors = AtomicU64::new(0);

        let write_records = |(item, records): (FileItem, Vec<Record>)| {
            if aborted.load(Ordering::Relaxed) {
                return;
            }
            stats.files += 1;
            stats.bytes_in += item.effective_size();
            *stats.ext_counts.entry(ext_key(&item.path)).or_insert(0) += 1;

            'records: for record in records {
                let mut current = record;
                for hook in hooks.iter_mut() {
                    match hook.on_record(current) {
                        Ok(Some(next)) => current = next,
                        Ok(None) => continue 'records,
                        Err(e) => {
                            if hook_failure.is_none() {
                                hook_failure = Some(e);
                            }
                            aborted.store(true, Ordering::Relaxed);
                            return;
                        }
                    }
                }
                let mut any_ok = false;
                for (sink, open) in sinks.iter_mut().zip(open_mask.iter()) {
                    if !*open {
                        continue;
                    }
                    match sink.write(&current) {
                        Ok(()) => any_ok = true,
                        Err(e) => {
                            warn!("sink failed to write record for {}: {}", item.path, e);
                            sink_errors.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                if any_ok {
                    stats.records += 1;
                }
            }
        };

        let exec_result = process_items_parallel(
            stream,
            process_one,
            write_records,
            &runtime.executor_config,
            runtime.fail_fast,
            |e| {
                debug!("failed to convert item: {e}");
                counters.source_errors.fetch_add(1, Ordering::Relaxed);
            },
        );

        // Fold skip/error counters gathered on the producer side.
        stats.skipped_hidden += counters.hidden.load(Ordering::Relaxed);
        stats.skipped_ext += counters.ext.load(Ordering::Relaxed);
        stats.skipped_too_large += counters.too_large.load(Ordering::Relaxed);
        stats.source_errors += counters.source_errors.load(Ordering::Relaxed);
        stats.sink_errors += sink_errors.load(Ordering::Relaxed);
        stats.handler_errors += extractor.handler_error_count();

        let run_error: Option<anyhow::Error> = match (hook_failure, exec_result) {
            (Some(e), _) => Some(e),
            (None, Err(e)) => Some(e),
            (None, Ok(_)) if aborted.load(Ordering::Relaxed) && runtime.fail_fast => {
                Some(anyhow::anyhow!("aborting after source error"))
            }
            _ => None,
        };

        // Flush open sinks so run-end hooks see complete on-disk output.
        for (sink, open) in runtime.sinks.iter_mut().zip(open_mask.iter()) {
            if *open {
                if let Err(e) = sink.flush() {
                    warn!("sink failed to flush: {e}");
                    stats.sink_errors += 1;
                }
            }
        }

        // 4) Run-end hooks, in registration order.
        if run_error.is_none() {
            let mut ctx = RunContext {
                cfg,
                stats: &mut *stats,
                sinks: &mut runtime.sinks,
                primary_jsonl: primary_jsonl.clone(),
            };
            for hook in runtime.lifecycle_hooks.iter_mut() {
                if let Err(e) = hook.on_run_end(&mut ctx) {
                    warn!("lifecycle hook failed in on_run_end: {e}");
                }
            }
        }

        // 5) Close sinks (idempotent) and release sources on every path.
        for sink in runtime.sinks.iter_mut() {
            if let Err(e) = sink.close() {
                warn!("sink failed to close: {e}");
                stats.sink_errors += 1;
            }
        }
        for source in runtime.sources.iter_mut() {
            source.close();
        }

        match run_error {
            Some(e) => Err(e),
            None => Ok(stats.clone()),
        }
    }
}

/// Build a plan from the config and run it once.
pub fn run_pipeline(config: &RepocapsuleConfig) -> Result<PipelineStats> {
    let plan = build_pipeline_plan(config, PipelineOverrides::default(), None)?;
    PipelineEngine::new(plan).run()
}
