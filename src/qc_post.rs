use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use flate2::read::MultiGzDecoder;
use serde_json::Value;
use tracing::warn;

use crate::config::QCConfig;
use crate::interfaces::{QualityScorer, RunContext, RunLifecycleHook};
use crate::qc_controller::{derive_csv_path, QCSummaryTracker};
use crate::records::{JsonMap, Record, KIND_RUN_HEADER, KIND_RUN_SUMMARY};

const CSV_COLUMNS: &[&str] = &[
    "path",
    "chunk_id",
    "score",
    "near_dup",
    "dup_family_id",
    "tokens",
];

fn open_jsonl_reader(path: &str) -> Result<Box<dyn Read>> {
    let file = File::open(path).with_context(|| format!("failed to open {path}"))?;
    if path.to_lowercase().ends_with(".gz") {
        Ok(Box::new(MultiGzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

fn is_data_record(record: &Record) -> bool {
    !matches!(record.kind(), Some(KIND_RUN_HEADER) | Some(KIND_RUN_SUMMARY))
}

/// Score every data record of a JSONL output, observing into `tracker`.
/// Returns the scored rows; scoring failures are counted and skipped.
pub fn collect_qc_rows_from_jsonl(
    jsonl_path: &str,
    scorer: &mut dyn QualityScorer,
    tracker: &mut QCSummaryTracker,
) -> Result<Vec<JsonMap>> {
    let reader = BufReader::new(open_jsonl_reader(jsonl_path)?);
    let mut rows = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: Record = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                warn!("skipping unparseable JSONL line in {jsonl_path}: {e}");
                tracker.record_error();
                continue;
            }
        };
        if !is_data_record(&record) {
            continue;
        }
        match scorer.score_record(&record) {
            Ok(mut row) => {
                row.entry("path".to_string())
                    .or_insert_with(|| Value::String(record.path().to_string()));
                if let Some(chunk_id) = record.meta.get("chunk_id") {
                    row.entry("chunk_id".to_string())
                        .or_insert_with(|| chunk_id.clone());
                }
                tracker.observe(&row, false);
                rows.push(row);
            }
            Err(e) => {
                warn!("QC scoring failed for {}: {}", record.path(), e);
                tracker.record_error();
            }
        }
    }
    Ok(rows)
}

/// Write QC rows as a CSV side-file with a fixed column set.
pub fn emit_qc_csv(rows: &[JsonMap], out_csv: &str) -> Result<()> {
    if let Some(parent) = Path::new(out_csv).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut writer = csv::Writer::from_path(out_csv)
        .with_context(|| format!("failed to create {out_csv}"))?;
    writer.write_record(CSV_COLUMNS)?;
    for row in rows {
        let cells: Vec<String> = CSV_COLUMNS
            .iter()
            .map(|col| match row.get(*col) {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
            })
            .collect();
        writer.write_record(&cells)?;
    }
    writer.flush()?;
    Ok(())
}

/// Re-score a JSONL file into `<base>_quality.csv`; returns the number of
/// scoring errors.
pub fn rescore_jsonl_to_csv(
    jsonl_path: &str,
    out_csv: &str,
    scorer: &mut dyn QualityScorer,
    qc_cfg: &QCConfig,
) -> Result<u64> {
    let mut tracker = QCSummaryTracker::for_config(qc_cfg);
    let rows = collect_qc_rows_from_jsonl(jsonl_path, scorer, &mut tracker)?;
    emit_qc_csv(&rows, out_csv)?;
    Ok(tracker.errors)
}

/// Post-hoc QC: after the main write pass, re-read the primary JSONL,
/// score every data record, emit the CSV side-file, and publish the
/// aggregated summary. Never drops records.
pub struct PostQCHook {
    cfg: QCConfig,
    scorer: Box<dyn QualityScorer>,
}

impl PostQCHook {
    pub fn new(cfg: QCConfig, scorer: Box<dyn QualityScorer>) -> Self {
        Self { cfg, scorer }
    }
}

impl RunLifecycleHook for PostQCHook {
    fn on_run_end(&mut self, ctx: &mut RunContext<'_>) -> Result<()> {
        let Some(jsonl_path) = ctx.primary_jsonl.clone() else {
            warn!("post QC enabled but no primary JSONL path is known; skipping");
            return Ok(());
        };
        self.scorer.reset_state();
        let mut tracker = QCSummaryTracker::for_config(&self.cfg);
        let rows = match collect_qc_rows_from_jsonl(&jsonl_path, self.scorer.as_mut(), &mut tracker)
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!("post QC failed to read {jsonl_path}: {e}");
                return Ok(());
            }
        };
        if self.cfg.write_csv {
            if let Some(out_csv) = derive_csv_path(Some(&jsonl_path), self.cfg.csv_suffix.as_deref())
            {
                if let Err(e) = emit_qc_csv(&rows, &out_csv) {
                    warn!("post QC failed to write {out_csv}: {e}");
                }
            }
        }
        ctx.stats.qc = Some(tracker);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct CountingScorer {
        calls: u64,
    }

    impl QualityScorer for CountingScorer {
        fn score_record(&mut self, record: &Record) -> Result<JsonMap> {
            self.calls += 1;
            let mut row = JsonMap::new();
            row.insert("score".into(), json!(75.0));
            row.insert("near_dup".into(), json!(false));
            row.insert("tokens".into(), json!(record.text.len() / 4));
            Ok(row)
        }

        fn clone_for_parallel(&self) -> Box<dyn QualityScorer> {
            Box::new(CountingScorer { calls: 0 })
        }
    }

    fn write_jsonl(path: &Path, lines: &[Value]) {
        let text: String = lines
            .iter()
            .map(|v| format!("{}\n", serde_json::to_string(v).unwrap()))
            .collect();
        std::fs::write(path, text).unwrap();
    }

    #[test]
    fn skips_header_and_summary_rows() {
        let dir = tempfile::tempdir().unwrap();
        let jsonl = dir.path().join("data.jsonl");
        write_jsonl(
            &jsonl,
            &[
                json!({"text": "", "meta": {"kind": "run_header"}}),
                json!({"text": "body one", "meta": {"path": "a.txt", "chunk_id": 1}}),
                json!({"text": "body two", "meta": {"path": "b.txt", "chunk_id": 1}}),
                json!({"text": "", "meta": {"kind": "run_summary"}}),
            ],
        );
        let mut scorer = CountingScorer { calls: 0 };
        let mut tracker = QCSummaryTracker::default();
        let rows =
            collect_qc_rows_from_jsonl(jsonl.to_str().unwrap(), &mut scorer, &mut tracker)
                .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(scorer.calls, 2);
        assert_eq!(tracker.scored, 2);
        assert_eq!(rows[0]["path"], "a.txt");
    }

    #[test]
    fn emits_csv_with_fixed_columns() {
        let dir = tempfile::tempdir().unwrap();
        let csv_path = dir.path().join("out_quality.csv");
        let mut row = JsonMap::new();
        row.insert("path".into(), json!("a.txt"));
        row.insert("chunk_id".into(), json!(1));
        row.insert("score".into(), json!(88.0));
        row.insert("near_dup".into(), json!(false));
        row.insert("tokens".into(), json!(12));
        emit_qc_csv(&[row], csv_path.to_str().unwrap()).unwrap();

        let text = std::fs::read_to_string(&csv_path).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "path,chunk_id,score,near_dup,dup_family_id,tokens"
        );
        let data = lines.next().unwrap();
        assert!(data.starts_with("a.txt,1,88"));
    }

    #[test]
    fn rescore_writes_csv_and_counts_errors() {
        let dir = tempfile::tempdir().unwrap();
        let jsonl = dir.path().join("data.jsonl");
        write_jsonl(
            &jsonl,
            &[json!({"text": "body", "meta": {"path": "a.txt"}})],
        );
        let csv_path = dir.path().join("data_quality.csv");
        let mut scorer = CountingScorer { calls: 0 };
        let errors = rescore_jsonl_to_csv(
            jsonl.to_str().unwrap(),
            csv_path.to_str().unwrap(),
            &mut scorer,
            &QCConfig::default(),
        )
        .unwrap();
        assert_eq!(errors, 0);
        assert!(csv_path.exists());
    }
}
