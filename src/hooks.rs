use anyhow::Result;
use tracing::warn;

use crate::interfaces::{RunArtifacts, RunContext, RunLifecycleHook, Sink};
use crate::records::{build_run_summary_record, Record};
use crate::sinks::append_jsonl_line;

/// Build the canonical run artifacts from the current context: the stats
/// view plus the run-summary footer record.
pub fn build_run_artifacts(ctx: &RunContext<'_>) -> RunArtifacts {
    let stats = ctx.stats.as_value();
    let qc_summary = ctx.stats.qc.as_ref().map(|t| t.as_value());
    let summary_record =
        build_run_summary_record(ctx.cfg, stats.clone(), qc_summary.clone());
    RunArtifacts {
        summary_record,
        stats,
        qc_summary,
        primary_jsonl_path: ctx.primary_jsonl.clone(),
    }
}

/// Dispatch finalize hooks to sinks and guarantee exactly one JSONL footer:
/// when no JSONL-typed sink consumed the summary, append it to the primary
/// JSONL directly.
pub fn dispatch_finalizers(
    sinks: &mut [Box<dyn Sink>],
    summary_record: &Record,
    primary_jsonl: Option<&str>,
) -> u64 {
    let mut sink_errors = 0u64;
    let mut wrote_jsonl = false;
    for sink in sinks.iter_mut() {
        if !sink.supports_finalize() {
            continue;
        }
        match sink.finalize(std::slice::from_ref(summary_record)) {
            Ok(()) => {
                if sink.consumes_summary_footer() {
                    wrote_jsonl = true;
                }
            }
            Err(e) => {
                warn!("sink failed to finalize: {e}");
                sink_errors += 1;
            }
        }
    }
    if !wrote_jsonl {
        if let Some(path) = primary_jsonl {
            if let Err(e) = append_jsonl_line(std::path::Path::new(path), summary_record) {
                warn!("failed to append run summary to {path}: {e}");
                sink_errors += 1;
            }
        }
    }
    sink_errors
}

/// Canonical lifecycle hook: at run end, build the run artifacts and hand
/// the summary record to every sink's finalize.
pub struct RunSummaryHook {
    enabled: bool,
}

impl RunSummaryHook {
    pub fn new() -> Self {
        Self { enabled: true }
    }

    pub fn disabled() -> Self {
        Self { enabled: false }
    }
}

impl Default for RunSummaryHook {
    fn default() -> Self {
        Self::new()
    }
}

impl RunLifecycleHook for RunSummaryHook {
    fn on_run_end(&mut self, ctx: &mut RunContext<'_>) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let artifacts = build_run_artifacts(ctx);
        let errors = dispatch_finalizers(
            ctx.sinks,
            &artifacts.summary_record,
            artifacts.primary_jsonl_path.as_deref(),
        );
        ctx.stats.sink_errors += errors;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::RepoContext;
    use crate::records::KIND_RUN_SUMMARY;
    use crate::sinks::JsonlSink;
    use serde_json::json;

    #[test]
    fn dispatch_finalizers_does_not_clobber_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.jsonl");
        let mut sink = JsonlSink::new(&path);
        let mut header = Record::new("");
        header.meta.insert("kind".into(), json!("run_header"));
        sink.set_header_record(header);
        sink.open(None).unwrap();
        let mut body = Record::new("body");
        body.meta.insert("kind".into(), json!("chunk"));
        body.meta.insert("path".into(), json!("file.txt"));
        sink.write(&body).unwrap();

        let mut summary = Record::new("");
        summary.meta.insert("kind".into(), json!(KIND_RUN_SUMMARY));

        let mut sinks: Vec<Box<dyn Sink>> = vec![Box::new(sink)];
        let errors =
            dispatch_finalizers(&mut sinks, &summary, Some(path.to_str().unwrap()));
        for sink in sinks.iter_mut() {
            sink.close().unwrap();
        }
        assert_eq!(errors, 0);

        let kinds: Vec<String> = std::fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(|l| {
                serde_json::from_str::<Record>(l)
                    .unwrap()
                    .kind()
                    .unwrap()
                    .to_string()
            })
            .collect();
        assert_eq!(kinds, vec!["run_header", "chunk", "run_summary"]);
    }

    #[test]
    fn fallback_appender_writes_footer_without_jsonl_sink() {
        struct NoFinalize;
        impl Sink for NoFinalize {
            fn open(&mut self, _ctx: Option<&RepoContext>) -> Result<()> {
                Ok(())
            }
            fn write(&mut self, _record: &Record) -> Result<()> {
                Ok(())
            }
            fn close(&mut self) -> Result<()> {
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("primary.jsonl");
        std::fs::write(&path, "{\"text\":\"x\",\"meta\":{}}\n").unwrap();

        let mut summary = Record::new("");
        summary.meta.insert("kind".into(), json!(KIND_RUN_SUMMARY));
        let mut sinks: Vec<Box<dyn Sink>> = vec![Box::new(NoFinalize)];
        dispatch_finalizers(&mut sinks, &summary, Some(path.to_str().unwrap()));

        let text = std::fs::read_to_string(&path).unwrap();
        let last = text.lines().last().unwrap();
        assert!(last.contains(KIND_RUN_SUMMARY));
        assert_eq!(text.lines().count(), 2);
    }
}
