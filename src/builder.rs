use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::warn;

use crate::concurrency::{resolve_pipeline_executor_config, ExecutorConfig};
use crate::config::{QCMode, RepocapsuleConfig};
use crate::convert::{BytesHandler, DefaultExtractor};
use crate::interfaces::{
    Extractor, FileExtractor, QualityScorer, RunLifecycleHook, Sink, SinkFactoryContext, Source,
    SourceFactoryContext,
};
use crate::hooks::RunSummaryHook;
use crate::qc_controller::{InlineQCController, InlineQCHook};
use crate::qc_post::PostQCHook;
use crate::registries::{default_registries, RegistryBundle};
use crate::safe_http::SafeHttpClient;

/// Runtime-only overrides for pipeline wiring. This is the sole channel for
/// live objects; the declarative spec never carries any.
#[derive(Default)]
pub struct PipelineOverrides {
    pub http_client: Option<Arc<SafeHttpClient>>,
    pub qc_scorer: Option<Box<dyn QualityScorer>>,
    pub file_extractor: Option<Arc<dyn FileExtractor>>,
    pub bytes_handlers: Option<Vec<Box<dyn BytesHandler>>>,
    pub extractors: Vec<Box<dyn Extractor>>,
}

/// Resolved runtime wiring for one pipeline run: live sources, sinks,
/// extractor, hooks, and executor settings, kept apart from the declarative
/// config so the config stays reusable across runs.
pub struct PipelineRuntime {
    pub http_client: Option<Arc<SafeHttpClient>>,
    pub sources: Vec<Box<dyn Source>>,
    pub sinks: Vec<Box<dyn Sink>>,
    pub file_extractor: Arc<dyn FileExtractor>,
    pub bytes_handlers: Arc<Vec<Box<dyn BytesHandler>>>,
    pub lifecycle_hooks: Vec<Box<dyn RunLifecycleHook>>,
    pub executor_config: ExecutorConfig,
    pub fail_fast: bool,
    /// Present when inline QC runs on executor workers.
    pub parallel_qc: Option<Arc<InlineQCController>>,
}

/// Immutable plan: the validated pure-data spec plus the resolved runtime.
pub struct PipelinePlan {
    pub spec: RepocapsuleConfig,
    pub runtime: PipelineRuntime,
}

impl std::fmt::Debug for PipelinePlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelinePlan")
            .field("spec", &self.spec)
            .field("runtime", &"<PipelineRuntime>")
            .finish()
    }
}

/// Build a `PipelinePlan` from a declarative config.
///
/// Applies logging, resolves registries, builds the HTTP client, sources,
/// sinks (threading the evolving sink-factory context), bytes handlers, and
/// QC wiring, normalizes sink metadata, attaches the run-header record, and
/// resolves the executor configuration.
pub fn build_pipeline_plan(
    config: &RepocapsuleConfig,
    overrides: PipelineOverrides,
    registries: Option<RegistryBundle>,
) -> Result<PipelinePlan> {
    let mut cfg = config.clone();
    cfg.logging.apply();

    let bundle = registries.unwrap_or_else(default_registries);

    let http_client = overrides
        .http_client
        .clone()
        .unwrap_or_else(|| cfg.http.build_client());

    // Sources.
    let source_ctx = SourceFactoryContext {
        repo_context: cfg.sinks.context.as_ref(),
        http_client: Some(http_client.clone()),
        http_config: &cfg.http,
        source_defaults: &cfg.sources.defaults,
    };
    let sources = bundle.sources.build_all(&source_ctx, &cfg.sources.specs)?;

    // Sinks, with metadata normalization.
    let sink_ctx = SinkFactoryContext {
        repo_context: cfg.sinks.context.clone(),
        sink_config: cfg.sinks.clone(),
    };
    let (mut sinks, sink_meta, final_ctx) = bundle.sinks.build_all(sink_ctx, &cfg.sinks.specs)?;
    cfg.sinks = final_ctx.sink_config;
    cfg.metadata = cfg.metadata.merged(&sink_meta);

    if let Some(primary) = cfg
        .sinks
        .primary_jsonl_name
        .clone()
        .or_else(|| cfg.metadata.primary_jsonl.clone())
    {
        cfg.sinks.primary_jsonl_name = Some(primary.clone());
        if cfg.metadata.primary_jsonl.is_none() {
            cfg.metadata.primary_jsonl = Some(primary.clone());
        }
        let needs_output_dir = cfg
            .sinks
            .output_dir
            .as_ref()
            .map(|d| d.as_os_str().is_empty() || d == &std::path::PathBuf::from("."))
            .unwrap_or(true);
        if needs_output_dir {
            if let Some(parent) = std::path::Path::new(&primary).parent() {
                if !parent.as_os_str().is_empty() {
                    cfg.sinks.output_dir = Some(parent.to_path_buf());
                }
            }
        }
    }

    cfg.validate()?;

    // Attach the run-header record to sinks that keep one.
    let header = crate::records::build_run_header_record(&cfg);
    for sink in sinks.iter_mut() {
        sink.set_header_record(header.clone());
    }

    // Bytes handlers and the file extractor.
    let bytes_handlers: Arc<Vec<Box<dyn BytesHandler>>> = Arc::new(
        overrides
            .bytes_handlers
            .unwrap_or_else(|| bundle.bytes.into_handlers()),
    );
    let file_extractor: Arc<dyn FileExtractor> = match overrides.file_extractor {
        Some(extractor) => extractor,
        None => Arc::new(DefaultExtractor::new(
            bytes_handlers.clone(),
            overrides.extractors,
        )),
    };

    // QC wiring.
    let mut lifecycle_hooks: Vec<Box<dyn RunLifecycleHook>> = Vec::new();
    let mut parallel_qc = None;
    let qc_cfg = cfg.qc.clone();
    if qc_cfg.enabled && qc_cfg.mode != QCMode::Off {
        match qc_cfg.mode {
            QCMode::Inline | QCMode::Advisory => {
                let scorer = match overrides.qc_scorer {
                    Some(s) => s,
                    None => bundle
                        .scorers
                        .build(&qc_cfg.scorer_options, qc_cfg.scorer_id.as_deref())
                        .ok_or_else(|| {
                            anyhow::anyhow!(
                                "inline/advisory QC requested but no quality scorer is \
                                 available; disable qc.enabled or register a scorer"
                            )
                        })?,
                };
                let enforce_drops = qc_cfg.mode == QCMode::Inline;
                let controller =
                    Arc::new(InlineQCController::new(qc_cfg.clone(), scorer, enforce_drops));
                if qc_cfg.parallel_inline {
                    parallel_qc = Some(controller.clone());
                }
                lifecycle_hooks.push(Box::new(InlineQCHook::new(
                    controller,
                    qc_cfg.parallel_inline,
                    qc_cfg.write_csv,
                    qc_cfg.csv_suffix.clone(),
                )));
            }
            QCMode::Post => {
                let scorer = overrides.qc_scorer.or_else(|| {
                    bundle
                        .scorers
                        .build(&qc_cfg.scorer_options, qc_cfg.scorer_id.as_deref())
                });
                match scorer {
                    Some(scorer) => {
                        lifecycle_hooks.push(Box::new(PostQCHook::new(qc_cfg.clone(), scorer)));
                    }
                    None => {
                        warn!("post QC enabled but no scorer is available; disabling QC");
                        cfg.qc.enabled = false;
                        cfg.qc.mode = QCMode::Off;
                    }
                }
            }
            QCMode::Off => unreachable!("guarded above"),
        }
    } else if qc_cfg.enabled {
        bail!("qc.enabled is true but qc.mode is 'off'");
    }
    lifecycle_hooks.push(Box::new(RunSummaryHook::new()));

    // Executor resolution needs the assembled runtime pieces.
    let mut runtime = PipelineRuntime {
        http_client: Some(http_client),
        sources,
        sinks,
        file_extractor,
        bytes_handlers,
        lifecycle_hooks,
        executor_config: ExecutorConfig::default(),
        fail_fast: false,
        parallel_qc,
    };
    let (exec_cfg, fail_fast) = resolve_pipeline_executor_config(&cfg, Some(&runtime));
    runtime.executor_config = exec_cfg;
    runtime.fail_fast = fail_fast;

    Ok(PipelinePlan {
        spec: cfg,
        runtime,
    })
}

/// Convenience wrapper: build the plan and wrap it in an engine.
pub fn build_engine(
    config: &RepocapsuleConfig,
    overrides: PipelineOverrides,
) -> Result<crate::pipeline::PipelineEngine> {
    let plan = build_pipeline_plan(config, overrides, None)?;
    Ok(crate::pipeline::PipelineEngine::new(plan))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QCConfig, SinkSpec, SourceSpec};
    use serde_json::json;

    fn basic_spec(dir: &std::path::Path) -> RepocapsuleConfig {
        let src_root = dir.join("input");
        std::fs::create_dir_all(&src_root).unwrap();
        std::fs::write(src_root.join("file.py"), "print('hello')\n").unwrap();
        let out_dir = dir.join("out");
        std::fs::create_dir_all(&out_dir).unwrap();

        let mut cfg = RepocapsuleConfig::default();
        cfg.sources.specs = vec![SourceSpec {
            kind: "local_dir".into(),
            options: serde_json::from_value(json!({"root_dir": src_root})).unwrap(),
        }];
        cfg.sinks.specs = vec![SinkSpec {
            kind: "default_jsonl_prompt".into(),
            options: serde_json::from_value(json!({
                "jsonl_path": out_dir.join("data.jsonl"),
                "prompt_path": out_dir.join("data.prompt.txt"),
            }))
            .unwrap(),
        }];
        cfg
    }

    #[test]
    fn plan_wires_sources_sinks_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = basic_spec(dir.path());
        let plan = build_pipeline_plan(&cfg, PipelineOverrides::default(), None).unwrap();

        assert_eq!(plan.runtime.sources.len(), 1);
        assert_eq!(plan.runtime.sinks.len(), 2);
        assert!(plan.runtime.http_client.is_some());
        assert_eq!(
            plan.spec.metadata.primary_jsonl,
            plan.spec.sinks.primary_jsonl_name
        );
        assert!(plan.spec.sinks.output_dir.is_some());
        // QC off by default: only the run-summary hook.
        assert_eq!(plan.runtime.lifecycle_hooks.len(), 1);
    }

    #[test]
    fn unknown_source_kind_fails_plan_build() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = basic_spec(dir.path());
        cfg.sources.specs[0].kind = "martian".into();
        assert!(build_pipeline_plan(&cfg, PipelineOverrides::default(), None).is_err());
    }

    #[test]
    fn inline_qc_without_scorer_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = basic_spec(dir.path());
        cfg.qc = QCConfig {
            enabled: true,
            mode: QCMode::Inline,
            scorer_id: Some("missing-scorer".into()),
            ..QCConfig::default()
        };
        let err = build_pipeline_plan(&cfg, PipelineOverrides::default(), None).unwrap_err();
        assert!(err.to_string().contains("no quality scorer"));
    }

    #[test]
    fn inline_qc_with_default_scorer_adds_hook() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = basic_spec(dir.path());
        cfg.qc = QCConfig {
            enabled: true,
            mode: QCMode::Inline,
            drop_near_dups: true,
            ..QCConfig::default()
        };
        let plan = build_pipeline_plan(&cfg, PipelineOverrides::default(), None).unwrap();
        assert_eq!(plan.runtime.lifecycle_hooks.len(), 2);
        assert!(plan.runtime.parallel_qc.is_none());
    }

    #[test]
    fn post_qc_without_scorer_disables_with_warning() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = basic_spec(dir.path());
        cfg.qc = QCConfig {
            enabled: true,
            mode: QCMode::Post,
            scorer_id: Some("missing".into()),
            ..QCConfig::default()
        };
        let plan = build_pipeline_plan(&cfg, PipelineOverrides::default(), None).unwrap();
        assert!(!plan.spec.qc.enabled);
        assert_eq!(plan.spec.qc.mode, QCMode::Off);
    }

    #[test]
    fn parallel_inline_exposes_controller() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = basic_spec(dir.path());
        cfg.qc = QCConfig {
            enabled: true,
            mode: QCMode::Inline,
            parallel_inline: true,
            ..QCConfig::default()
        };
        let plan = build_pipeline_plan(&cfg, PipelineOverrides::default(), None).unwrap();
        assert!(plan.runtime.parallel_qc.is_some());
    }

    #[test]
    fn same_jsonl_and_prompt_path_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = basic_spec(dir.path());
        let clash = dir.path().join("out/data.jsonl");
        cfg.sinks.specs[0].options = serde_json::from_value(json!({
            "jsonl_path": clash,
            "prompt_path": clash,
        }))
        .unwrap();
        cfg.metadata.prompt_path = Some(clash.to_string_lossy().into_owned());
        assert!(build_pipeline_plan(&cfg, PipelineOverrides::default(), None).is_err());
    }
}
