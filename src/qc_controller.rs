use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::config::{QCConfig, QCMode};
use crate::interfaces::{QualityScorer, RunContext, RunLifecycleHook};
use crate::qc_utils::{top_dup_families, update_dup_family_counts, DupFamily};
use crate::records::{filter_qc_meta, JsonMap, Record};

/// Track QC scoring outcomes and duplicate families.
///
/// `near_dup` is a combined flag (SimHash OR MinHash); with
/// `drop_near_dups` any record flagged by either mechanism is dropped.
#[derive(Debug, Clone, Serialize)]
pub struct QCSummaryTracker {
    pub enabled: bool,
    pub mode: QCMode,
    pub min_score: Option<f64>,
    pub drop_near_dups: bool,
    pub scored: u64,
    pub kept: u64,
    pub dropped_low_score: u64,
    pub dropped_near_dup: u64,
    pub errors: u64,
    pub candidates_low_score: u64,
    pub candidates_near_dup: u64,
    pub dup_families: BTreeMap<String, DupFamily>,
}

impl Default for QCSummaryTracker {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: QCMode::Inline,
            min_score: None,
            drop_near_dups: false,
            scored: 0,
            kept: 0,
            dropped_low_score: 0,
            dropped_near_dup: 0,
            errors: 0,
            candidates_low_score: 0,
            candidates_near_dup: 0,
            dup_families: BTreeMap::new(),
        }
    }
}

impl QCSummaryTracker {
    pub fn for_config(cfg: &QCConfig) -> Self {
        Self {
            enabled: true,
            mode: cfg.mode,
            min_score: cfg.min_score,
            drop_near_dups: cfg.drop_near_dups,
            ..Self::default()
        }
    }

    fn is_low_score(&self, qc_result: &JsonMap) -> bool {
        let Some(min) = self.min_score else {
            return false;
        };
        qc_result
            .get("score")
            .and_then(Value::as_f64)
            .map(|s| s < min)
            .unwrap_or(false)
    }

    /// Update counters from one QC row; returns whether to keep the record.
    pub fn observe(&mut self, qc_result: &JsonMap, apply_gates: bool) -> bool {
        self.scored += 1;
        let family_id = qc_result
            .get("dup_family_id")
            .or_else(|| qc_result.get("doc_id"))
            .and_then(Value::as_str);
        let path = qc_result.get("path").and_then(Value::as_str);
        update_dup_family_counts(&mut self.dup_families, family_id, path);

        let low_score = self.is_low_score(qc_result);
        let near_dup = qc_result
            .get("near_dup")
            .map(truthy)
            .unwrap_or(false);

        if low_score {
            self.candidates_low_score += 1;
        }
        if near_dup {
            self.candidates_near_dup += 1;
        }

        let mut keep = true;
        if apply_gates && low_score {
            self.dropped_low_score += 1;
            keep = false;
        } else if apply_gates && self.drop_near_dups && near_dup {
            self.dropped_near_dup += 1;
            keep = false;
        }
        if keep {
            self.kept += 1;
        }
        keep
    }

    pub fn record_error(&mut self) {
        self.errors += 1;
    }

    /// Serializable summary, including the largest duplicate families.
    pub fn as_value(&self) -> Value {
        json!({
            "enabled": self.enabled,
            "mode": self.mode.to_string(),
            "min_score": self.min_score,
            "drop_near_dups": self.drop_near_dups,
            "scored": self.scored,
            "kept": self.kept,
            "dropped_low_score": self.dropped_low_score,
            "dropped_near_dup": self.dropped_near_dup,
            "errors": self.errors,
            "candidates_low_score": self.candidates_low_score,
            "candidates_near_dup": self.candidates_near_dup,
            "top_dup_families": top_dup_families(&self.dup_families, 5, 2),
        })
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Scorer plus gating logic shared by the inline QC hook and (when
/// `parallel_inline` is set) executor workers. Interior mutability keeps
/// the tracker consistent across threads.
pub struct InlineQCController {
    cfg: QCConfig,
    scorer: Mutex<Box<dyn QualityScorer>>,
    tracker: Mutex<QCSummaryTracker>,
    enforce_drops: bool,
}

impl InlineQCController {
    pub fn new(cfg: QCConfig, scorer: Box<dyn QualityScorer>, enforce_drops: bool) -> Self {
        let tracker = QCSummaryTracker::for_config(&cfg);
        Self {
            cfg,
            scorer: Mutex::new(scorer),
            tracker: Mutex::new(tracker),
            enforce_drops,
        }
    }

    pub fn config(&self) -> &QCConfig {
        &self.cfg
    }

    pub fn enforce_drops(&self) -> bool {
        self.enforce_drops
    }

    pub fn reset(&self) {
        *self.tracker.lock().expect("qc tracker lock") = QCSummaryTracker::for_config(&self.cfg);
        self.scorer.lock().expect("qc scorer lock").reset_state();
    }

    pub fn tracker_snapshot(&self) -> QCSummaryTracker {
        self.tracker.lock().expect("qc tracker lock").clone()
    }

    pub fn clone_scorer(&self) -> Box<dyn QualityScorer> {
        self.scorer.lock().expect("qc scorer lock").clone_for_parallel()
    }

    /// Score with the controller's own scorer, then gate and merge.
    pub fn process_record(&self, record: Record) -> Result<Option<Record>> {
        let scored = self.scorer.lock().expect("qc scorer lock").score_record(&record);
        self.apply_scored(record, scored)
    }

    /// Gate and merge with a result produced elsewhere (a worker clone).
    pub fn apply_scored(
        &self,
        mut record: Record,
        scored: Result<JsonMap>,
    ) -> Result<Option<Record>> {
        let qc_result = match scored {
            Ok(result) => result,
            Err(e) => {
                self.tracker.lock().expect("qc tracker lock").record_error();
                if self.cfg.fail_on_error {
                    return Err(e);
                }
                warn!(
                    "QC scoring failed for {} (mode={}): {}",
                    record.path(),
                    self.cfg.mode,
                    e
                );
                return Ok(if self.enforce_drops {
                    None
                } else {
                    record.meta.insert("qc_error".into(), json!(true));
                    Some(record)
                });
            }
        };

        let keep = self
            .tracker
            .lock()
            .expect("qc tracker lock")
            .observe(&qc_result, self.enforce_drops);
        if !keep {
            return Ok(None);
        }
        merge_qc_meta(&mut record, &qc_result);
        Ok(Some(record))
    }
}

/// Attach QC-derived metadata: canonical fields at `meta.*` (tokens also
/// populating `meta.approx_tokens`), everything else under
/// `meta.extra.qc_signals.*` without overwriting existing keys.
pub fn merge_qc_meta(record: &mut Record, qc_result: &JsonMap) {
    if let Some(tokens) = qc_result.get("tokens").filter(|v| !v.is_null()) {
        record.meta.insert("approx_tokens".into(), tokens.clone());
        record
            .meta
            .entry("tokens".to_string())
            .or_insert_with(|| tokens.clone());
    }
    let (canonical, signals) = filter_qc_meta(qc_result);
    crate::records::merge_meta_defaults(record, &canonical);

    if signals.is_empty() {
        return;
    }
    let extra = record
        .meta
        .entry("extra".to_string())
        .or_insert_with(|| Value::Object(JsonMap::new()));
    if !extra.is_object() {
        *extra = Value::Object(JsonMap::new());
    }
    let extra_map = extra.as_object_mut().expect("extra is an object");
    let qc_signals = extra_map
        .entry("qc_signals".to_string())
        .or_insert_with(|| Value::Object(JsonMap::new()));
    if !qc_signals.is_object() {
        *qc_signals = Value::Object(JsonMap::new());
    }
    let qc_map = qc_signals.as_object_mut().expect("qc_signals is an object");
    for (k, v) in &signals {
        qc_map.entry(k.clone()).or_insert_with(|| v.clone());
    }
}

/// Lifecycle hook applying inline QC gating and summaries.
pub struct InlineQCHook {
    controller: Arc<InlineQCController>,
    parallel: bool,
    write_csv: bool,
    csv_suffix: Option<String>,
}

impl InlineQCHook {
    pub fn new(
        controller: Arc<InlineQCController>,
        parallel: bool,
        write_csv: bool,
        csv_suffix: Option<String>,
    ) -> Self {
        Self {
            controller,
            parallel,
            write_csv,
            csv_suffix,
        }
    }
}

impl RunLifecycleHook for InlineQCHook {
    fn on_run_start(&mut self, ctx: &mut RunContext<'_>) {
        self.controller.reset();
        ctx.stats.qc = Some(self.controller.tracker_snapshot());
    }

    fn on_record(&mut self, record: Record) -> Result<Option<Record>> {
        if self.parallel {
            // Workers already scored and gated this record.
            return Ok(Some(record));
        }
        self.controller.process_record(record)
    }

    fn on_run_end(&mut self, ctx: &mut RunContext<'_>) -> Result<()> {
        ctx.stats.qc = Some(self.controller.tracker_snapshot());
        if !self.write_csv {
            return Ok(());
        }
        let Some(jsonl_path) = ctx.primary_jsonl.clone() else {
            return Ok(());
        };
        let Some(out_csv) = derive_csv_path(Some(&jsonl_path), self.csv_suffix.as_deref()) else {
            return Ok(());
        };
        let mut scorer = self.controller.clone_scorer();
        scorer.reset_state();
        match crate::qc_post::rescore_jsonl_to_csv(
            &jsonl_path,
            &out_csv,
            scorer.as_mut(),
            &self.controller.cfg,
        ) {
            Ok(errors) if errors > 0 => {
                if let Some(tracker) = &mut ctx.stats.qc {
                    tracker.errors += errors;
                }
                warn!("inline QC CSV scoring for {jsonl_path} skipped {errors} lines");
            }
            Ok(_) => {}
            Err(e) => warn!("failed to write inline QC CSV: {e}"),
        }
        Ok(())
    }
}

/// Derive the QC CSV path from the primary JSONL path and a suffix; a
/// suffix containing a path separator is used verbatim.
pub fn derive_csv_path(jsonl_path: Option<&str>, suffix: Option<&str>) -> Option<String> {
    let jsonl_path = jsonl_path?;
    if let Some(suffix) = suffix {
        if suffix.contains('/') || suffix.contains('\\') {
            return Some(suffix.to_string());
        }
    }
    let suffix = suffix.unwrap_or("_quality.csv");
    let base = jsonl_path
        .strip_suffix(".jsonl.gz")
        .or_else(|| jsonl_path.strip_suffix(".jsonl"))
        .unwrap_or(jsonl_path);
    Some(format!("{base}{suffix}"))
}
