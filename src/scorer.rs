use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde_json::{json, Value};

use crate::chunk::{approx_token_count, TokenKind};
use crate::interfaces::{QualityScorer, QualityScorerFactory};
use crate::qc_utils::{
    minhash_signature_for_text, signature_jaccard, simhash64, simhash_distance,
};
use crate::records::{JsonMap, Record};

pub const HEURISTIC_SCORER_ID: &str = "heuristic";

#[derive(Debug, Clone)]
struct ScorerOptions {
    shingle_k: usize,
    n_perm: usize,
    bands: usize,
    jaccard_threshold: f64,
    simhash_max_tokens: Option<usize>,
    simhash_max_distance: u32,
    simhash_history: usize,
    max_shingles: Option<usize>,
    repetition_k: usize,
    repetition_max_grams: usize,
}

impl Default for ScorerOptions {
    fn default() -> Self {
        Self {
            shingle_k: 5,
            n_perm: 128,
            bands: 32,
            jaccard_threshold: 0.85,
            simhash_max_tokens: Some(2048),
            simhash_max_distance: 3,
            simhash_history: 512,
            max_shingles: Some(20_000),
            repetition_k: 4,
            repetition_max_grams: 20_000,
        }
    }
}

impl ScorerOptions {
    fn from_map(options: &JsonMap) -> Self {
        let mut out = Self::default();
        let get_usize = |key: &str| options.get(key).and_then(Value::as_u64).map(|v| v as usize);
        if let Some(v) = get_usize("shingle_k") {
            out.shingle_k = v.max(1);
        }
        if let Some(v) = get_usize("n_perm") {
            out.n_perm = v;
        }
        if let Some(v) = get_usize("bands") {
            out.bands = v.max(1);
        }
        if let Some(v) = options.get("jaccard_threshold").and_then(Value::as_f64) {
            out.jaccard_threshold = v;
        }
        if let Some(v) = get_usize("simhash_max_tokens") {
            out.simhash_max_tokens = Some(v);
        }
        if let Some(v) = options.get("simhash_max_distance").and_then(Value::as_u64) {
            out.simhash_max_distance = v as u32;
        }
        if let Some(v) = get_usize("simhash_history") {
            out.simhash_history = v;
        }
        if let Some(v) = get_usize("max_shingles") {
            out.max_shingles = Some(v);
        }
        out
    }
}

/// In-memory banded LSH over MinHash signatures plus a content-hash table.
#[derive(Default)]
struct DedupState {
    signatures: HashMap<String, Vec<u32>>,
    band_index: HashMap<u64, Vec<String>>,
    content_hashes: HashMap<String, String>,
    simhash_recent: VecDeque<(String, u64)>,
}

impl DedupState {
    fn clear(&mut self) {
        self.signatures.clear();
        self.band_index.clear();
        self.content_hashes.clear();
        self.simhash_recent.clear();
    }
}

/// Built-in scorer: cheap text heuristics plus SimHash and MinHash-LSH
/// near-duplicate detection. Parallel clones share the dedup state behind
/// a mutex so every worker observes the same duplicate families.
pub struct HeuristicQualityScorer {
    opts: ScorerOptions,
    state: Arc<Mutex<DedupState>>,
}

impl HeuristicQualityScorer {
    pub fn new(options: &JsonMap) -> Self {
        Self {
            opts: ScorerOptions::from_map(options),
            state: Arc::new(Mutex::new(DedupState::default())),
        }
    }

    fn band_key(band: usize, row: &[u32]) -> u64 {
        let mut bytes = Vec::with_capacity(8 + row.len() * 4);
        bytes.extend_from_slice(&(band as u64).to_le_bytes());
        for v in row {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        xxhash_rust::xxh3::xxh3_64(&bytes)
    }

    /// Probe the shared state; returns `(near_dup, family_id, jaccard)`.
    fn check_near_dup(
        &self,
        doc_id: &str,
        content_hash: Option<&str>,
        sig: &[u32],
        simhash: u64,
    ) -> (bool, Option<String>, f64) {
        let mut state = self.state.lock().expect("dedup state lock");

        if let Some(hash) = content_hash {
            if let Some(existing) = state.content_hashes.get(hash) {
                let family = existing.clone();
                return (true, Some(family), 1.0);
            }
            state.content_hashes.insert(hash.to_string(), doc_id.to_string());
        }

        let band_width = (self.opts.n_perm / self.opts.bands).max(1);
        let keys: Vec<u64> = (0..self.opts.bands)
            .filter_map(|b| {
                let start = b * band_width;
                let end = start + band_width;
                sig.get(start..end).map(|row| Self::band_key(b, row))
            })
            .collect();

        let mut best: Option<(String, f64)> = None;
        for key in &keys {
            if let Some(candidates) = state.band_index.get(key) {
                for cand in candidates {
                    if cand == doc_id {
                        continue;
                    }
                    if let Some(other) = state.signatures.get(cand) {
                        if other.len() != sig.len() {
                            continue;
                        }
                        let score = signature_jaccard(sig, other);
                        if best.as_ref().map(|(_, s)| score > *s).unwrap_or(true) {
                            best = Some((cand.clone(), score));
                        }
                    }
                }
            }
        }

        let mut near = false;
        let mut family = None;
        let mut score = 0.0;
        if let Some((cand, s)) = best {
            if s >= self.opts.jaccard_threshold {
                near = true;
                score = s;
                family = Some(cand);
            }
        }

        // SimHash pass: small Hamming distance against recent documents.
        if !near {
            for (other_id, other_hash) in state.simhash_recent.iter() {
                if other_id != doc_id
                    && simhash_distance(simhash, *other_hash) <= self.opts.simhash_max_distance
                {
                    near = true;
                    family = Some(other_id.clone());
                    break;
                }
            }
        }

        state.signatures.insert(doc_id.to_string(), sig.to_vec());
        for key in keys {
            state.band_index.entry(key).or_default().push(doc_id.to_string());
        }
        state.simhash_recent.push_back((doc_id.to_string(), simhash));
        while state.simhash_recent.len() > self.opts.simhash_history {
            state.simhash_recent.pop_front();
        }

        (near, family, score)
    }
}

impl QualityScorer for HeuristicQualityScorer {
    fn score_record(&mut self, record: &Record) -> Result<JsonMap> {
        let text = record.text.as_str();
        let path = record.path().to_string();
        let doc_id = format!(
            "{}:{}",
            path,
            record
                .meta
                .get("chunk_id")
                .and_then(Value::as_u64)
                .unwrap_or(1)
        );
        let content_hash = record
            .meta
            .get("sha256")
            .and_then(Value::as_str)
            .map(str::to_string);

        let tokens = record
            .meta
            .get("tokens")
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or_else(|| approx_token_count(text, TokenKind::Doc));
        let repetition = crate::qc_utils::repetition_rate(
            text,
            self.opts.repetition_k,
            Some(self.opts.repetition_max_grams),
        );
        let line_count = text.lines().count().max(1);
        let mean_line_len = text.chars().count() as f64 / line_count as f64;

        let simhash = simhash64(text, self.opts.simhash_max_tokens);
        let sig =
            minhash_signature_for_text(text, self.opts.shingle_k, self.opts.n_perm, self.opts.max_shingles)?;
        let (near_dup, family, jaccard) =
            self.check_near_dup(&doc_id, content_hash.as_deref(), &sig, simhash);

        let mut score = 100.0;
        score -= 40.0 * repetition;
        if tokens < 5 {
            score -= 25.0;
        }
        if mean_line_len > 400.0 {
            score -= 10.0;
        }
        let score = score.clamp(0.0, 100.0);

        let mut out = JsonMap::new();
        out.insert("score".into(), json!(score));
        out.insert("tokens".into(), json!(tokens));
        out.insert("near_dup".into(), json!(near_dup));
        if let Some(family) = family {
            out.insert("dup_family_id".into(), json!(family));
        }
        out.insert("path".into(), json!(path));
        out.insert("repetition_rate".into(), json!(repetition));
        out.insert("simhash".into(), json!(format!("{simhash:016x}")));
        if near_dup && jaccard > 0.0 {
            out.insert("jaccard".into(), json!(jaccard));
        }
        Ok(out)
    }

    fn clone_for_parallel(&self) -> Box<dyn QualityScorer> {
        Box::new(Self {
            opts: self.opts.clone(),
            state: Arc::clone(&self.state),
        })
    }

    fn reset_state(&mut self) {
        self.state.lock().expect("dedup state lock").clear();
    }
}

pub struct HeuristicScorerFactory;

impl QualityScorerFactory for HeuristicScorerFactory {
    fn id(&self) -> &'static str {
        HEURISTIC_SCORER_ID
    }

    fn build(&self, options: &JsonMap) -> Result<Box<dyn QualityScorer>> {
        Ok(Box::new(HeuristicQualityScorer::new(options)))
    }
}
