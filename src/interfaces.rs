use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{HttpConfig, RepocapsuleConfig, SinkConfig, SinkSpec, SourceSpec};
use crate::pipeline::PipelineStats;
use crate::records::{JsonMap, Record};
use crate::safe_http::SafeHttpClient;

/// A single file emitted by a Source.
///
/// `path` is repository-relative with forward slashes regardless of OS;
/// `data` is raw bytes (text decoding happens later in the pipeline).
#[derive(Debug, Clone)]
pub struct FileItem {
    pub path: String,
    pub data: Vec<u8>,
    pub size: Option<u64>,
}

impl FileItem {
    pub fn new(path: impl Into<String>, data: Vec<u8>) -> Self {
        let size = Some(data.len() as u64);
        Self {
            path: path.into(),
            data,
            size,
        }
    }

    pub fn effective_size(&self) -> u64 {
        self.size.unwrap_or(self.data.len() as u64)
    }
}

/// Optional repository-level context; all fields optional by design so the
/// contract stays stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoContext {
    pub repo_full_name: Option<String>,
    pub repo_url: Option<String>,
    pub license_id: Option<String>,
    pub commit_sha: Option<String>,
    pub extra: JsonMap,
}

/// Produces files (as bytes) for downstream decoding and processing.
///
/// Implementations should stream and must not yield errors for benign
/// unreadable entries; yielded `Err` items are counted as source errors by
/// the engine and skip the item (or the remainder of the source).
pub trait Source: Send {
    fn iter_files<'a>(&'a mut self) -> Box<dyn Iterator<Item = Result<FileItem>> + Send + 'a>;

    fn context(&self) -> Option<RepoContext> {
        None
    }

    /// Release scoped resources; invoked on every exit path.
    fn close(&mut self) {}

    /// Coarse tag used by executor auto-selection.
    fn is_heavy(&self) -> bool {
        false
    }
}

/// A destination for records. Opened once, written many times, closed once;
/// `close` must be idempotent and safe even when nothing was written.
pub trait Sink: Send {
    fn open(&mut self, context: Option<&RepoContext>) -> Result<()>;
    fn write(&mut self, record: &Record) -> Result<()>;
    fn close(&mut self) -> Result<()>;

    /// Push buffered output to disk so run-end hooks observe complete data.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Record written as the first output line when the sink supports it.
    fn set_header_record(&mut self, _record: Record) {}

    fn supports_finalize(&self) -> bool {
        false
    }

    /// Receive run-end records (the run summary). Sinks honoring this must
    /// keep header-then-records-then-finalize ordering and never rewrite
    /// already-written content.
    fn finalize(&mut self, _extra_records: &[Record]) -> Result<()> {
        Ok(())
    }

    /// True for JSONL-typed sinks whose finalize writes the summary footer.
    fn consumes_summary_footer(&self) -> bool {
        false
    }
}

/// Optional content extractor emitting records derived from decoded text;
/// the first extractor returning a non-empty batch wins.
pub trait Extractor: Send + Sync {
    fn name(&self) -> &str {
        "extractor"
    }

    fn extract(
        &self,
        text: &str,
        path: &str,
        context: Option<&RepoContext>,
    ) -> Result<Option<Vec<Record>>>;
}

/// Turns one `FileItem` into records (bytes handlers, decode, chunk, build).
pub trait FileExtractor: Send + Sync {
    fn extract(
        &self,
        item: &FileItem,
        config: &RepocapsuleConfig,
        context: Option<&RepoContext>,
    ) -> Result<Vec<Record>>;

    /// Handler failures observed so far (debug counter).
    fn handler_error_count(&self) -> u64 {
        0
    }
}

/// Scores records for quality control. `score_record` returns a free-form
/// map; the controller extracts canonical fields (score, near_dup,
/// dup_family_id, tokens) and stores the rest as signals.
pub trait QualityScorer: Send {
    fn score_record(&mut self, record: &Record) -> Result<JsonMap>;

    /// An independent scorer for a worker thread; shared near-duplicate
    /// state must remain consistent across clones.
    fn clone_for_parallel(&self) -> Box<dyn QualityScorer>;

    fn reset_state(&mut self) {}
}

/// Run-level artifacts handed to sinks at run end.
#[derive(Debug, Clone)]
pub struct RunArtifacts {
    pub summary_record: Record,
    pub stats: Value,
    pub qc_summary: Option<Value>,
    pub primary_jsonl_path: Option<String>,
}

/// Mutable view of the run handed to lifecycle hooks.
pub struct RunContext<'a> {
    pub cfg: &'a RepocapsuleConfig,
    pub stats: &'a mut PipelineStats,
    pub sinks: &'a mut Vec<Box<dyn Sink>>,
    pub primary_jsonl: Option<String>,
}

/// Hook invoked at run start, per record, and at run end. `on_record` may
/// rewrite or drop the record; an `Err` escalates and aborts the run.
pub trait RunLifecycleHook: Send {
    fn on_run_start(&mut self, _ctx: &mut RunContext<'_>) {}

    fn on_record(&mut self, record: Record) -> Result<Option<Record>> {
        Ok(Some(record))
    }

    fn on_run_end(&mut self, _ctx: &mut RunContext<'_>) -> Result<()> {
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Factory contracts for declarative specs
// -----------------------------------------------------------------------------

pub struct SourceFactoryContext<'a> {
    pub repo_context: Option<&'a RepoContext>,
    pub http_client: Option<Arc<SafeHttpClient>>,
    pub http_config: &'a HttpConfig,
    pub source_defaults: &'a std::collections::BTreeMap<String, JsonMap>,
}

impl SourceFactoryContext<'_> {
    /// Spec options merged over the registered per-kind defaults.
    pub fn options_with_defaults(&self, kind: &str, spec: &SourceSpec) -> JsonMap {
        let mut merged = self.source_defaults.get(kind).cloned().unwrap_or_default();
        for (k, v) in &spec.options {
            merged.insert(k.clone(), v.clone());
        }
        merged
    }
}

pub trait SourceFactory: Send + Sync {
    fn id(&self) -> &'static str;
    fn build(
        &self,
        ctx: &SourceFactoryContext<'_>,
        spec: &SourceSpec,
    ) -> Result<Vec<Box<dyn Source>>>;
}

#[derive(Clone)]
pub struct SinkFactoryContext {
    pub repo_context: Option<RepoContext>,
    pub sink_config: SinkConfig,
}

pub struct SinkFactoryResult {
    pub sinks: Vec<Box<dyn Sink>>,
    pub sink_config: SinkConfig,
    pub metadata: JsonMap,
}

impl std::fmt::Debug for SinkFactoryResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkFactoryResult")
            .field("sinks", &format!("<{} sinks>", self.sinks.len()))
            .field("sink_config", &self.sink_config)
            .field("metadata", &self.metadata)
            .finish()
    }
}

pub trait SinkFactory: Send + Sync {
    fn id(&self) -> &'static str;
    fn build(&self, ctx: &SinkFactoryContext, spec: &SinkSpec) -> Result<SinkFactoryResult>;
}

pub trait QualityScorerFactory: Send + Sync {
    fn id(&self) -> &'static str;
    fn build(&self, options: &JsonMap) -> Result<Box<dyn QualityScorer>>;
}
